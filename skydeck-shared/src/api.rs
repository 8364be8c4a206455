// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of skydeck.
//
// skydeck is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// skydeck is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with skydeck.  If not,
// see <http://www.gnu.org/licenses/>.

//! # XRPC requests & responses
//!
//! Just the handful of AT Protocol procedures & queries skydeck actually calls. These are
//! deliberately lax (no `deny_unknown_fields`): the lexicons grow new optional fields all the time
//! and I don't want a new server release to break the timeline.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::{AtUri, Cid, Did, EngagementKind, PostView};

pub const GET_TIMELINE: &str = "app.bsky.feed.getTimeline";
pub const GET_POSTS: &str = "app.bsky.feed.getPosts";
pub const CREATE_RECORD: &str = "com.atproto.repo.createRecord";
pub const DELETE_RECORD: &str = "com.atproto.repo.deleteRecord";
pub const CREATE_SESSION: &str = "com.atproto.server.createSession";
pub const REFRESH_SESSION: &str = "com.atproto.server.refreshSession";

/// The most posts `getTimeline` will return in one page
pub const MAX_PAGE_SIZE: u16 = 100;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the feed                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Query parameters for `app.bsky.feed.getTimeline`
#[derive(Clone, Debug, Default, Serialize)]
pub struct GetTimelineReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// One item in a feed; the post, plus some context we pass through untouched
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FeedViewPost {
    pub post: PostView,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetTimelineRsp {
    pub feed: Vec<FeedViewPost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetPostsRsp {
    pub posts: Vec<PostView>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      likes & reposts                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A reference to a specific version of a record
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StrongRef {
    pub uri: AtUri,
    pub cid: Cid,
}

/// The record written to create a like or a repost; the two lexicons are identical in shape
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementRecord {
    #[serde(rename = "$type")]
    pub type_: String,
    pub subject: StrongRef,
    pub created_at: DateTime<Utc>,
}

impl EngagementRecord {
    pub fn new(kind: EngagementKind, uri: &AtUri, cid: &Cid, created_at: DateTime<Utc>) -> Self {
        EngagementRecord {
            type_: kind.collection().to_owned(),
            subject: StrongRef {
                uri: uri.clone(),
                cid: cid.clone(),
            },
            created_at,
        }
    }
}

/// Body for `com.atproto.repo.createRecord`
#[derive(Clone, Debug, Serialize)]
pub struct CreateRecordReq {
    pub repo: Did,
    pub collection: String,
    pub record: EngagementRecord,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateRecordRsp {
    pub uri: AtUri,
    pub cid: Cid,
}

/// Body for `com.atproto.repo.deleteRecord`
#[derive(Clone, Debug, Serialize)]
pub struct DeleteRecordReq {
    pub repo: Did,
    pub collection: String,
    pub rkey: String,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            sessions                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Body for `com.atproto.server.createSession`
///
/// Borrows the password so the caller controls how long the plaintext lives.
#[derive(Debug, Serialize)]
pub struct CreateSessionReq<'a> {
    pub identifier: &'a str,
    pub password: &'a str,
}

/// Response to both `createSession` & `refreshSession`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRsp {
    pub did: Did,
    pub handle: String,
    pub access_jwt: SecretString,
    pub refresh_jwt: SecretString,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             errors                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The body of a non-2xx XRPC response
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct XrpcErrorRsp {
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn engagement_record_wire_format() {
        let record = EngagementRecord::new(
            EngagementKind::Repost,
            &AtUri::new("at://did:plc:alice/app.bsky.feed.post/3kabc").unwrap(),
            &Cid::new("bafyreiabc").unwrap(),
            DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["$type"], "app.bsky.feed.repost");
        assert_eq!(
            value["subject"]["uri"],
            "at://did:plc:alice/app.bsky.feed.post/3kabc"
        );
        assert_eq!(value["subject"]["cid"], "bafyreiabc");
        assert!(value["createdAt"].as_str().unwrap().starts_with("2025-06-01T12:00:00"));
    }

    #[test]
    fn timeline_tolerates_unknown_fields() {
        let rsp: GetTimelineRsp = serde_json::from_str(
            r#"{"feed": [{"post": {"uri": "at://did:plc:a/app.bsky.feed.post/1",
                                   "cid": "bafy1",
                                   "author": {"did": "did:plc:a", "handle": "a.test"},
                                   "labels": []},
                          "feedContext": "t"}]}"#,
        )
        .unwrap();
        assert_eq!(rsp.feed.len(), 1);
        assert!(rsp.cursor.is_none());
    }
}
