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

//! # Assembling the timeline
//!
//! [FeedAssembler] pages through the viewer's timeline & hands out the posts *as the user should
//! see them*: each canonical post is run through the [ShadowReader] at the moment it's asked for.
//! Nothing materialized is ever kept, so a like that lands between two renders shows up on the
//! second without anyone having to tell the assembler.
//!
//! Pages are concatenated in the order they were fetched. The timeline can shift under us while
//! we page (new posts arrive at the top, pushing older ones onto the next page), so the same post
//! can turn up twice; that's left to the renderer.
//!
//! Every fetch also retires the shadows the server has caught up with; see [ShadowStore::retire].

use std::{borrow::Cow, sync::Arc};

use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::watch;
use tracing::{debug, info};

use skydeck_shared::{AtUri, PostView};

use crate::{
    materialize::ShadowReader,
    remote::{self, FeedSource},
    shadow::{Revision, ShadowStore},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to fetch a timeline page: {source}"))]
    Fetch {
        source: remote::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    /// True if the fetch failed because the session needs attention
    pub fn is_auth(&self) -> bool {
        match self {
            Error::Fetch { source, .. } => source.is_auth(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Invalidation                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// "The canonical feed is out of date"
///
/// A generation counter; the [InteractionController] bumps it each time an action settles, and
/// every [FeedAssembler] created from it notices on its next [refresh_if_stale]. Clones share the
/// counter.
///
/// [InteractionController]: crate::interaction::InteractionController
/// [refresh_if_stale]: FeedAssembler::refresh_if_stale
#[derive(Clone, Debug)]
pub struct Invalidation {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for Invalidation {
    fn default() -> Self {
        Invalidation::new()
    }
}

impl Invalidation {
    pub fn new() -> Invalidation {
        let (tx, _) = watch::channel(0);
        Invalidation { tx: Arc::new(tx) }
    }
    pub fn invalidate(&self) {
        // `send_modify` rather than `send`: the latter fails if nobody's subscribed yet
        self.tx.send_modify(|generation| *generation += 1);
    }
    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         FeedAssembler                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The viewer's timeline, one page at a time
pub struct FeedAssembler<S: FeedSource> {
    source: S,
    store: ShadowStore,
    reader: ShadowReader,
    invalidation: watch::Receiver<u64>,
    posts: Vec<PostView>,
    cursor: Option<String>,
    exhausted: bool,
}

impl<S: FeedSource> FeedAssembler<S> {
    pub fn new(source: S, store: ShadowStore, invalidation: &Invalidation) -> FeedAssembler<S> {
        FeedAssembler {
            source,
            reader: ShadowReader::new(store.clone()),
            store,
            invalidation: invalidation.subscribe(),
            posts: Vec::new(),
            cursor: None,
            exhausted: false,
        }
    }
    /// Fetch the next page & append it; return the number of posts added
    ///
    /// Once the source reports there are no more pages this is a no-op.
    pub async fn load_more(&mut self) -> Result<usize> {
        if self.exhausted {
            return Ok(0);
        }
        let baseline = self.store.revision();
        let page = self
            .source
            .fetch_timeline_page(self.cursor.as_deref())
            .await
            .context(FetchSnafu)?;
        self.retire(&page.posts, baseline);
        let n = page.posts.len();
        self.posts.extend(page.posts);
        self.exhausted = page.next_cursor.is_none();
        self.cursor = page.next_cursor;
        debug!(
            "Loaded {n} posts ({} in all); more: {}",
            self.posts.len(),
            !self.exhausted
        );
        Ok(n)
    }
    /// Throw away everything loaded so far & fetch the first page afresh; return the number of
    /// posts now loaded
    ///
    /// On failure the posts already loaded are kept.
    pub async fn refresh(&mut self) -> Result<usize> {
        let stale = self.invalidation.has_changed().unwrap_or(false);
        // Mark the current generation seen *before* fetching: an action that settles while the
        // request is out may not be reflected in the response, & must trigger another refresh.
        self.invalidation.borrow_and_update();
        let baseline = self.store.revision();
        let page = match self.source.fetch_timeline_page(None).await {
            Ok(page) => page,
            Err(err) => {
                if stale {
                    self.invalidation.mark_changed();
                }
                return Err(err).context(FetchSnafu);
            }
        };
        self.retire(&page.posts, baseline);
        self.posts = page.posts;
        self.exhausted = page.next_cursor.is_none();
        self.cursor = page.next_cursor;
        info!("Refreshed the timeline; {} posts", self.posts.len());
        Ok(self.posts.len())
    }
    /// Refresh iff an action has settled since the last refresh; return true if we refreshed
    pub async fn refresh_if_stale(&mut self) -> Result<bool> {
        if self.invalidation.has_changed().unwrap_or(false) {
            self.refresh().await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
    /// The loaded posts as the user should see them right now
    pub fn visible_posts(&self) -> Vec<Cow<'_, PostView>> {
        self.posts
            .iter()
            .map(|post| self.reader.materialize(post))
            .collect()
    }
    /// The loaded posts exactly as the server sent them
    pub fn canonical_posts(&self) -> &[PostView] {
        &self.posts
    }
    /// The first loaded post named by `uri`, if any
    pub fn find(&self, uri: &AtUri) -> Option<&PostView> {
        self.posts.iter().find(|post| &post.uri == uri)
    }
    pub fn has_more(&self) -> bool {
        !self.exhausted
    }
    pub fn reader(&self) -> &ShadowReader {
        &self.reader
    }
    fn retire(&self, posts: &[PostView], baseline: Revision) {
        let n = posts
            .iter()
            .filter(|post| self.store.retire(&post.uri, baseline))
            .count();
        if n > 0 {
            debug!("Fetch at {baseline} superseded {n} shadows");
        }
    }
}
