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

//! # Remote collaborators
//!
//! Abstractions for the two things skydeck needs from the network: a source of timeline pages,
//! and a service that creates & deletes engagement records. [xrpc] implements both against a PDS;
//! tests implement them with scripted fakes.
//!
//! [xrpc]: crate::xrpc

use std::sync::Arc;

use async_trait::async_trait;
use snafu::{Backtrace, Snafu};

use skydeck_shared::{AtUri, Cid, EngagementKind, PostView};

/// Everything that can go wrong talking to the network, classified by what the caller should do
/// about it
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("The response body couldn't be deserialized: {source}"))]
    Decode {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The engagement record already exists"))]
    Duplicate,
    #[snafu(display("Failed to serialize the request body: {source}"))]
    Encode {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{uri} doesn't name a record"))]
    MalformedRecord { uri: AtUri },
    #[snafu(display("The record doesn't exist"))]
    NotFound,
    #[snafu(display("Failed to encode a query string: {source}"))]
    Query {
        source: serde_urlencoded::ser::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The server rejected the request with {status} ({error}): {message:?}"))]
    Rejected {
        status: u16,
        error: String,
        message: Option<String>,
    },
    #[snafu(display("Failed to build an http::Request: {source}"))]
    Request {
        source: http::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The server answered {status}; try again later"))]
    Transient { status: u16 },
    #[snafu(display("Failed to reach the server: {source}"))]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync>,
        backtrace: Backtrace,
    },
    #[snafu(display("Not authorized: {message}"))]
    Unauthorized { message: String },
    #[snafu(display("Failed to form the endpoint for {nsid}: {source}"))]
    Url {
        nsid: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True if the server is telling us the action we asked for is already in effect
    ///
    /// Liking a post we already like (a duplicate create), or un-liking one we've already un-liked
    /// (a delete of a missing record): either way, the server agrees with what the user asked for.
    /// The other pairings are real failures; a 404 on create more likely means we're talking to
    /// the wrong endpoint.
    pub fn is_success_equivalent(&self, deleting: bool) -> bool {
        match self {
            Error::Duplicate => !deleting,
            Error::NotFound => deleting,
            _ => false,
        }
    }
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }
}

/// One page of the viewer's timeline
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimelinePage {
    pub posts: Vec<PostView>,
    /// Opaque; hand it back to get the next page. `None` means there are no more.
    pub next_cursor: Option<String>,
}

/// A source of canonical posts
#[async_trait]
pub trait FeedSource {
    /// Fetch the page of the timeline following `cursor` (or the first page if `None`)
    async fn fetch_timeline_page(&self, cursor: Option<&str>) -> Result<TimelinePage>;
    /// Fetch specific posts by URI; posts that no longer exist are silently omitted
    async fn fetch_posts(&self, uris: &[AtUri]) -> Result<Vec<PostView>>;
}

#[async_trait]
impl<T: FeedSource + Send + Sync + ?Sized> FeedSource for Arc<T> {
    async fn fetch_timeline_page(&self, cursor: Option<&str>) -> Result<TimelinePage> {
        (**self).fetch_timeline_page(cursor).await
    }
    async fn fetch_posts(&self, uris: &[AtUri]) -> Result<Vec<PostView>> {
        (**self).fetch_posts(uris).await
    }
}

/// Creates & deletes the viewer's like & repost records
#[async_trait]
pub trait MutationService {
    /// Create a like or repost of the post named by `subject_uri` & `subject_cid`; return the
    /// [AtUri] of the new record. Fails with [Error::Duplicate] if the viewer already has one.
    async fn create_engagement(
        &self,
        kind: EngagementKind,
        subject_uri: &AtUri,
        subject_cid: &Cid,
    ) -> Result<AtUri>;
    /// Delete an engagement record. Fails with [Error::NotFound] if it's already gone.
    async fn delete_engagement(&self, record: &AtUri) -> Result<()>;
}
