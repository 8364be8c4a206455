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

//! # Materializing posts
//!
//! Produce the post the user actually sees: the canonical post with its shadow (if any) laid over
//! the top. This is on every render path, so it's pure, synchronous & doesn't allocate when there's
//! nothing to overlay.

use std::borrow::Cow;

use skydeck_shared::PostView;

use crate::shadow::{ShadowRecord, ShadowStore};

/// Lay `shadow` over `post`
///
/// Every field the shadow has an opinion on replaces the canonical value; everything else (author,
/// text, timestamps, the fields the shadow leaves alone) is carried through untouched.
pub fn overlay(post: &PostView, shadow: &ShadowRecord) -> PostView {
    let mut visible = post.clone();
    if let Some(n) = shadow.like_count {
        visible.like_count = n;
    }
    if let Some(n) = shadow.repost_count {
        visible.repost_count = n;
    }
    if let Some(n) = shadow.reply_count {
        visible.reply_count = n;
    }
    if let Some(marker) = &shadow.viewer_like {
        visible.viewer.like = marker.clone();
    }
    if let Some(marker) = &shadow.viewer_repost {
        visible.viewer.repost = marker.clone();
    }
    visible
}

/// Read-only access to a [ShadowStore] for rendering
#[derive(Clone, Debug)]
pub struct ShadowReader {
    store: ShadowStore,
}

impl ShadowReader {
    pub fn new(store: ShadowStore) -> ShadowReader {
        ShadowReader { store }
    }
    /// The post as the user should see it right now
    ///
    /// With no shadow for `post`, this is `post` itself.
    pub fn materialize<'a>(&self, post: &'a PostView) -> Cow<'a, PostView> {
        match self.store.get(&post.uri) {
            Some(shadow) if !shadow.is_empty() => Cow::Owned(overlay(post, &shadow)),
            _ => Cow::Borrowed(post),
        }
    }
}
