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

//! # The Shadow Store
//!
//! ## Introduction
//!
//! When the user likes a post, we'd like the heart to fill in *now*, not a round-trip later. We do
//! that by keeping, alongside the posts the server gave us, a small map of client-side overrides:
//! "post `p`'s like count is really 4, and the viewer likes it". Such an override is a *shadow*.
//! The posts themselves are never touched; whenever we render one we look up its shadow and lay it
//! over the top (see [materialize]).
//!
//! [materialize]: crate::materialize
//!
//! ## Design
//!
//! There's at most one [ShadowRecord] per post [AtUri]; writes *merge* into whatever's there
//! field-by-field. Every write is stamped with a store-wide [Revision], which lets a consumer that
//! has just fetched fresh posts recognize shadows that the fetch has superseded. The controller
//! also marks entries while it has a request in flight for them, so that a shadow isn't treated as
//! superseded while it's the only place the user's pending action is visible.
//!
//! Shadows are cheap to lose: a post with no shadow simply renders as the server sent it. So the
//! map is an LRU cache; in a long-lived session the oldest-written shadows just fall off the end.
//!
//! All access goes through a single [Mutex]; a reader either sees a record before a merge or
//! after it, never halfway through.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use tokio::sync::broadcast;
use tracing::debug;

use skydeck_shared::{AtUri, EngagementKind, Marker};

/// Default maximum number of shadows retained
pub const DEFAULT_CAPACITY: NonZeroUsize = NonZeroUsize::new(4096).unwrap(/* known good */);

// Subscribers that fall further behind than this will see `RecvError::Lagged` & should just
// re-render everything.
const CHANGE_CHANNEL_DEPTH: usize = 256;

/// A store-wide, monotonically increasing write counter
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Revision(u64);

impl Revision {
    pub fn new(value: u64) -> Revision {
        Revision(value)
    }
    fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A partial override of a post's engagement state
///
/// `None` means "no opinion; use the canonical value". For the viewer markers that isn't enough,
/// since "the viewer does *not* like this" is itself an opinion-- hence `Option<Option<Marker>>`:
/// `Some(None)` overlays "no like", `Some(Some(m))` overlays marker `m`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShadowRecord {
    pub like_count: Option<u64>,
    pub repost_count: Option<u64>,
    pub reply_count: Option<u64>,
    pub viewer_like: Option<Option<Marker>>,
    pub viewer_repost: Option<Option<Marker>>,
}

impl ShadowRecord {
    /// A shadow setting both the count & the marker for one kind of engagement
    ///
    /// The two always travel together; writing one without the other is how you end up displaying
    /// a filled heart next to the old count.
    pub fn engagement(kind: EngagementKind, count: u64, marker: Option<Marker>) -> ShadowRecord {
        match kind {
            EngagementKind::Like => ShadowRecord {
                like_count: Some(count),
                viewer_like: Some(marker),
                ..Default::default()
            },
            EngagementKind::Repost => ShadowRecord {
                repost_count: Some(count),
                viewer_repost: Some(marker),
                ..Default::default()
            },
        }
    }
    pub fn count(&self, kind: EngagementKind) -> Option<u64> {
        match kind {
            EngagementKind::Like => self.like_count,
            EngagementKind::Repost => self.repost_count,
        }
    }
    pub fn marker(&self, kind: EngagementKind) -> Option<Option<&Marker>> {
        match kind {
            EngagementKind::Like => self.viewer_like.as_ref().map(Option::as_ref),
            EngagementKind::Repost => self.viewer_repost.as_ref().map(Option::as_ref),
        }
    }
    pub fn is_empty(&self) -> bool {
        self == &ShadowRecord::default()
    }
    /// Shallow merge: every field `other` has an opinion on replaces ours
    pub fn merge(&mut self, other: ShadowRecord) {
        fn take<T>(ours: &mut Option<T>, theirs: Option<T>) {
            if theirs.is_some() {
                *ours = theirs;
            }
        }
        take(&mut self.like_count, other.like_count);
        take(&mut self.repost_count, other.repost_count);
        take(&mut self.reply_count, other.reply_count);
        take(&mut self.viewer_like, other.viewer_like);
        take(&mut self.viewer_repost, other.viewer_repost);
    }
}

/// A point-in-time copy of one entry in the store
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShadowEntry {
    pub record: ShadowRecord,
    /// The revision of the most recent write to this entry
    pub revision: Revision,
    /// The number of actions on this post that have yet to settle
    pub in_flight: usize,
}

#[derive(Debug)]
struct ShadowStoreInner {
    entries: LruCache<AtUri, ShadowEntry>,
    /// The configured bound; `entries` may exceed it only while every entry has an action in flight
    capacity: NonZeroUsize,
    revision: Revision,
}

impl ShadowStoreInner {
    /// Make room for one more entry, evicting the least recently written idle shadows
    ///
    /// A shadow with an action in flight is the only place that action is visible, so it's never
    /// evicted; if nothing else can go, the cache grows past its bound until something settles.
    fn make_room(&mut self) {
        while self.entries.len() >= self.capacity.get() {
            let idle = self
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.in_flight == 0)
                .map(|(uri, _)| uri.clone());
            match idle {
                Some(uri) => {
                    self.entries.pop(&uri);
                    debug!("Evicted the shadow for {uri}");
                }
                None => break,
            }
        }
        let cap = NonZeroUsize::new(self.entries.len() + 1)
            .unwrap_or(self.capacity)
            .max(self.capacity);
        if cap != self.entries.cap() {
            debug!("Resizing the shadow store to {cap}");
            self.entries.resize(cap);
        }
    }
    fn entry_mut(&mut self, uri: &AtUri) -> &mut ShadowEntry {
        if !self.entries.contains(uri) {
            self.make_room();
            let revision = self.revision;
            self.entries.put(
                uri.clone(),
                ShadowEntry {
                    record: ShadowRecord::default(),
                    revision,
                    in_flight: 0,
                },
            );
        }
        self.entries.get_mut(uri).unwrap(/* just inserted */)
    }
}

/// Client-local overrides of post engagement state, keyed by post [AtUri]
///
/// Cheaply clonable; clones share the same underlying map. Build one per session & hand clones to
/// whoever needs them.
#[derive(Clone, Debug)]
pub struct ShadowStore {
    inner: Arc<Mutex<ShadowStoreInner>>,
    changes: broadcast::Sender<AtUri>,
}

impl Default for ShadowStore {
    fn default() -> Self {
        ShadowStore::new(DEFAULT_CAPACITY)
    }
}

impl ShadowStore {
    pub fn new(capacity: NonZeroUsize) -> ShadowStore {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_DEPTH);
        ShadowStore {
            inner: Arc::new(Mutex::new(ShadowStoreInner {
                entries: LruCache::new(capacity),
                capacity,
                revision: Revision::default(),
            })),
            changes,
        }
    }
    /// Retrieve the shadow for `uri`, if there is one
    pub fn get(&self, uri: &AtUri) -> Option<ShadowRecord> {
        self.entry(uri).map(|entry| entry.record)
    }
    /// Retrieve the shadow for `uri` along with its bookkeeping
    pub fn entry(&self, uri: &AtUri) -> Option<ShadowEntry> {
        // `peek` rather than `get`: reading a shadow shouldn't save it from eviction, else every
        // post that merely scrolled past would be kept alive.
        self.inner
            .lock()
            .expect("Poisoned mutex!")
            .entries
            .peek(uri)
            .cloned()
    }
    /// Merge `partial` into the shadow for `uri`, creating it if need be; return the revision of
    /// the write
    pub fn merge_write(&self, uri: &AtUri, partial: ShadowRecord) -> Revision {
        let revision = {
            let mut inner = self.inner.lock().expect("Poisoned mutex!");
            inner.revision = inner.revision.next();
            let revision = inner.revision;
            let entry = inner.entry_mut(uri);
            entry.record.merge(partial);
            entry.revision = revision;
            revision
        };
        debug!("Wrote the shadow for {uri} at {revision}");
        // An error here just means nobody's listening
        let _ = self.changes.send(uri.clone());
        revision
    }
    /// Drop the shadow for `uri` if canonical data fetched by a request issued at `baseline` has
    /// caught up with it; return true if it was dropped
    ///
    /// A shadow last written at or before `baseline` describes an action the server had already
    /// settled when it was asked for the post, so the fresh canonical post reflects it. A shadow
    /// with an action still in flight is never retired: it's the only place that action is visible.
    pub fn retire(&self, uri: &AtUri, baseline: Revision) -> bool {
        let retired = {
            let mut inner = self.inner.lock().expect("Poisoned mutex!");
            match inner.entries.peek(uri) {
                Some(entry) if entry.in_flight == 0 && entry.revision <= baseline => {
                    inner.entries.pop(uri);
                    true
                }
                _ => false,
            }
        };
        if retired {
            debug!("Retired the shadow for {uri} (superseded at {baseline})");
            let _ = self.changes.send(uri.clone());
        }
        retired
    }
    /// The revision of the most recent write to the store
    pub fn revision(&self) -> Revision {
        self.inner.lock().expect("Poisoned mutex!").revision
    }
    /// Subscribe to writes; each write sends the [AtUri] of the post whose shadow changed
    pub fn subscribe(&self) -> broadcast::Receiver<AtUri> {
        self.changes.subscribe()
    }
    pub fn len(&self) -> usize {
        self.inner.lock().expect("Poisoned mutex!").entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Note that an action on `uri` has gone out to the network
    pub(crate) fn begin(&self, uri: &AtUri) {
        self.inner
            .lock()
            .expect("Poisoned mutex!")
            .entry_mut(uri)
            .in_flight += 1;
    }
    /// Note that an action on `uri` has settled, one way or the other
    pub(crate) fn finish(&self, uri: &AtUri) {
        let mut inner = self.inner.lock().expect("Poisoned mutex!");
        if let Some(entry) = inner.entries.peek_mut(uri) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }
}
