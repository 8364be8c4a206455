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

//! # skydeck-shared
//!
//! Entities shared by the skydeck library & its clients. Like most "entities" modules this is
//! mostly boilerplate: a handful of refined string types naming things in the AT Protocol, and the
//! post view the timeline hands us.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{Backtrace, prelude::*};

use std::{fmt::Display, ops::Deref, str::FromStr};

pub mod api;
pub mod service;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid at-uri"))]
    AtUri { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid CID"))]
    Cid { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid DID"))]
    Did { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a known engagement kind"))]
    EngagementKind { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

// Each refined type below gets the same set of string-ish conveniences; a macro saves a fair
// amount of tedium.
macro_rules! string_newtype_impls {
    ($type_name:ident) => {
        impl AsRef<str> for $type_name {
            fn as_ref(&self) -> &str {
                self.deref()
            }
        }
        impl Deref for $type_name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl From<$type_name> for String {
            fn from(value: $type_name) -> Self {
                value.0
            }
        }
        impl FromStr for $type_name {
            type Err = Error;

            fn from_str(s: &str) -> StdResult<Self, Self::Err> {
                $type_name::try_from(s.to_owned())
            }
        }
        // Implement `Deserialize` by hand to fail if the serialized value isn't legit
        impl<'de> Deserialize<'de> for $type_name {
            fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                $type_name::try_from(s).map_err(mk_serde_de_err::<'de, D>)
            }
        }
    };
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             AtUri                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref AT_URI: Regex =
        Regex::new("^at://([^/?#\\s]+)(?:/([^/?#\\s]+)(?:/([^/?#\\s]+))?)?$").unwrap(/* known good */);
}

/// An AT Protocol URI naming a repository, a collection, or a record
///
/// The general form is `at://<authority>/<collection>/<rkey>`, where the authority is a DID or a
/// handle. Posts, likes & reposts are all records, so they're all named with three components.
/// I don't attempt to validate the authority beyond "no whitespace, no delimiters".
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct AtUri(String);

impl AtUri {
    /// Correct-by-construction [AtUri] constructor
    pub fn new(text: &str) -> Result<AtUri> {
        AtUri::try_from(text.to_owned())
    }
    fn captures(&self) -> regex::Captures<'_> {
        AT_URI.captures(&self.0).unwrap(/* checked on construction */)
    }
    pub fn authority(&self) -> &str {
        self.captures()
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or_default()
    }
    pub fn collection(&self) -> Option<&str> {
        self.captures().get(2).map(|m| m.as_str())
    }
    /// The record key, if this URI names a record
    pub fn rkey(&self) -> Option<&str> {
        self.captures().get(3).map(|m| m.as_str())
    }
}

impl TryFrom<String> for AtUri {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        if AT_URI.is_match(&text) {
            Ok(AtUri(text))
        } else {
            AtUriSnafu { text }.fail()
        }
    }
}

string_newtype_impls!(AtUri);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Did                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref DID: Regex = Regex::new("^did:[a-z]+:[a-zA-Z0-9._:%-]+$").unwrap(/* known good */);
}

/// A decentralized identifier; in our world, the permanent name of an account's repository
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    pub fn new(text: &str) -> Result<Did> {
        Did::try_from(text.to_owned())
    }
}

impl TryFrom<String> for Did {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        if DID.is_match(&text) {
            Ok(Did(text))
        } else {
            DidSnafu { text }.fail()
        }
    }
}

string_newtype_impls!(Did);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Cid                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A content identifier: the hash of a specific version of a record
///
/// Engagement records refer to their subject by a "strong ref"-- both the [AtUri] & the [Cid].
/// We treat these as opaque; all I check is that the thing is non-empty & alphanumeric (which is
/// true of the base32 encoding the network uses).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn new(text: &str) -> Result<Cid> {
        Cid::try_from(text.to_owned())
    }
}

impl TryFrom<String> for Cid {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        if !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(Cid(text))
        } else {
            CidSnafu { text }.fail()
        }
    }
}

string_newtype_impls!(Cid);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         EngagementKind                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The two toggle-style engagements a viewer can have with a post
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementKind {
    Like,
    Repost,
}

impl EngagementKind {
    /// The NSID of the collection in which records of this kind live
    pub fn collection(&self) -> &'static str {
        match self {
            EngagementKind::Like => "app.bsky.feed.like",
            EngagementKind::Repost => "app.bsky.feed.repost",
        }
    }
    /// Recover the kind from a record collection NSID
    pub fn from_collection(nsid: &str) -> Option<EngagementKind> {
        match nsid {
            "app.bsky.feed.like" => Some(EngagementKind::Like),
            "app.bsky.feed.repost" => Some(EngagementKind::Repost),
            _ => None,
        }
    }
}

impl Display for EngagementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                EngagementKind::Like => "like",
                EngagementKind::Repost => "repost",
            }
        )
    }
}

impl FromStr for EngagementKind {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "like" => Ok(EngagementKind::Like),
            "repost" => Ok(EngagementKind::Repost),
            _ => EngagementKindSnafu { text: s.to_owned() }.fail(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Marker                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The viewer's own engagement record for a post
///
/// The server tells us the [AtUri] of the viewer's like (or repost) record, if there is one. Until
/// the server has answered, all we can say is that one is on the way; that's [Marker::Pending].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Marker {
    Record(AtUri),
    Pending,
}

const PENDING_MARKER: &str = "pending";

impl Marker {
    pub fn record(&self) -> Option<&AtUri> {
        match self {
            Marker::Record(uri) => Some(uri),
            Marker::Pending => None,
        }
    }
    pub fn is_pending(&self) -> bool {
        matches!(self, Marker::Pending)
    }
}

impl From<AtUri> for Marker {
    fn from(value: AtUri) -> Self {
        Marker::Record(value)
    }
}

impl Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Marker::Record(uri) => write!(f, "{uri}"),
            Marker::Pending => write!(f, "{PENDING_MARKER}"),
        }
    }
}

impl Serialize for Marker {
    fn serialize<S>(&self, serializer: S) -> StdResult<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Marker::Record(uri) => uri.serialize(serializer),
            Marker::Pending => serializer.serialize_str(PENDING_MARKER),
        }
    }
}

impl<'de> Deserialize<'de> for Marker {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        if s == PENDING_MARKER {
            Ok(Marker::Pending)
        } else {
            AtUri::try_from(s)
                .map(Marker::Record)
                .map_err(mk_serde_de_err::<'de, D>)
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            PostView                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub did: Did,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// The viewer's relationship to a post
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Viewer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like: Option<Marker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repost: Option<Marker>,
}

/// A post as the server presents it to a particular viewer
///
/// Only the counts & the viewer relationship are of any interest to the engagement machinery;
/// everything else is carried along for display.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: AtUri,
    // The lexicon says this is required, but I've seen views without it in the wild (deleted
    // subjects, mostly). We can display such a post, we just can't engage with it.
    #[serde(default)]
    pub cid: Option<Cid>,
    pub author: Author,
    #[serde(default)]
    pub record: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub repost_count: u64,
    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub viewer: Viewer,
}

impl PostView {
    pub fn count(&self, kind: EngagementKind) -> u64 {
        match kind {
            EngagementKind::Like => self.like_count,
            EngagementKind::Repost => self.repost_count,
        }
    }
    pub fn marker(&self, kind: EngagementKind) -> Option<&Marker> {
        match kind {
            EngagementKind::Like => self.viewer.like.as_ref(),
            EngagementKind::Repost => self.viewer.repost.as_ref(),
        }
    }
    /// True if the viewer currently likes (or reposts) this post
    pub fn is_active(&self, kind: EngagementKind) -> bool {
        self.marker(kind).is_some()
    }
    /// The post text, if the record carries any
    pub fn text(&self) -> Option<&str> {
        self.record.get("text").and_then(|v| v.as_str())
    }
}
