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

//! # Liking & reposting
//!
//! ## Introduction
//!
//! [InteractionController] toggles the viewer's like (or repost) of a post, optimistically: the
//! new count & marker are written to the [ShadowStore] before the request goes out, so the very
//! next render shows them. When the server answers we either settle (& tell the feed it's out of
//! date) or put back exactly what was there before.
//!
//! ## Lifecycle of a toggle
//!
//! 1. Claim the `(post, kind)` pair. Only one toggle per pair may be in flight; a second is refused
//!    synchronously with [Error::InFlight], before anything is written. A UI should treat that as
//!    "the button is disabled".
//! 2. Snapshot the post as the user currently sees it (canonical + shadow). If the viewer's marker
//!    is present the action is a delete of that record, else a create.
//! 3. Write the new count (clamped at zero) & marker ([Marker::Pending] for a create, nothing for a
//!    delete) to the store.
//! 4. Call the [MutationService].
//! 5. On success, or on a duplicate/not-found (the server already agrees with the user), leave the
//!    shadow in place, note the new record's [AtUri] if we got one, and bump the [Invalidation].
//!    Otherwise write back the snapshot from step 2.
//!
//! Steps 3-5 are guarded by a [PendingAction]: if the future is dropped at step 4 the guard rolls
//! back, exactly as if the request had failed.
//!
//! Failures never escape as errors save for authentication failures, which the caller must handle
//! by refreshing the session or logging in again. Everything else comes back as
//! [Outcome::RolledBack] carrying a [Notice] fit to show the user.

use std::{
    collections::HashSet,
    fmt::Display,
    sync::{Arc, Mutex},
};

use snafu::{OptionExt, ResultExt, Snafu};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use skydeck_shared::{AtUri, Cid, EngagementKind, Marker, PostView};

use crate::{
    feed::Invalidation,
    materialize::ShadowReader,
    remote::{self, MutationService},
    shadow::{ShadowRecord, ShadowStore},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("A {kind} of {uri} is already in flight"))]
    InFlight { uri: AtUri, kind: EngagementKind },
    #[snafu(display("{uri} has no CID, so it can't be the subject of a {kind}"))]
    MissingCid { uri: AtUri, kind: EngagementKind },
    #[snafu(display("The {kind} of {uri} hasn't settled yet; refresh the feed and try again"))]
    Unsettled { uri: AtUri, kind: EngagementKind },
    #[snafu(display("Not authorized to {kind} {uri}: {source}"))]
    Unauthorized {
        uri: AtUri,
        kind: EngagementKind,
        source: remote::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A non-fatal failure, suitable for a transient message to the user
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notice {
    pub uri: AtUri,
    pub kind: EngagementKind,
    /// True if we were trying to undo the engagement
    pub undo: bool,
    /// Why; for the logs more than the user
    pub reason: String,
}

impl Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.undo {
            write!(f, "failed to un{}", self.kind)
        } else {
            write!(f, "failed to {}", self.kind)
        }
    }
}

/// How a toggle turned out
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The server did what we asked
    Settled,
    /// The server had already done it
    AlreadyInEffect,
    /// The request failed & the post is back the way it was
    RolledBack(Notice),
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       in-flight tracking                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

type InFlightSet = Arc<Mutex<HashSet<(AtUri, EngagementKind)>>>;

/// Exclusive right to toggle `kind` on `uri`; released on drop
struct Claim {
    in_flight: InFlightSet,
    uri: AtUri,
    kind: EngagementKind,
}

impl Claim {
    fn new(in_flight: &InFlightSet, uri: &AtUri, kind: EngagementKind) -> Result<Claim> {
        if !in_flight
            .lock()
            .expect("Poisoned mutex!")
            .insert((uri.clone(), kind))
        {
            return InFlightSnafu {
                uri: uri.clone(),
                kind,
            }
            .fail();
        }
        Ok(Claim {
            in_flight: in_flight.clone(),
            uri: uri.clone(),
            kind,
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .expect("Poisoned mutex!")
            .remove(&(self.uri.clone(), self.kind));
    }
}

/// An optimistic write awaiting the server
///
/// Unless [settle]d, dropping this restores the count & marker captured before the write. Either
/// way, dropping it tells the store the action is no longer in flight.
///
/// [settle]: PendingAction::settle
struct PendingAction {
    store: ShadowStore,
    uri: AtUri,
    kind: EngagementKind,
    before_count: u64,
    before_marker: Option<Marker>,
    /// The count written optimistically
    count: u64,
    armed: bool,
    // Held for its `Drop`; released after the rollback's been written
    _claim: Claim,
}

impl PendingAction {
    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingAction {
    fn drop(&mut self) {
        if self.armed {
            self.store.merge_write(
                &self.uri,
                ShadowRecord::engagement(self.kind, self.before_count, self.before_marker.take()),
            );
            debug!(
                "Rolled back the {} of {} to {}",
                self.kind, self.uri, self.before_count
            );
        }
        self.store.finish(&self.uri);
    }
}

enum Mutation {
    Create(Cid),
    Delete(AtUri),
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     InteractionController                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Toggles likes & reposts with optimistic feedback
///
/// Cheaply clonable; clones share the in-flight bookkeeping, so the one-toggle-per-post rule holds
/// across all of them.
#[derive(Clone)]
pub struct InteractionController {
    store: ShadowStore,
    reader: ShadowReader,
    mutations: Arc<dyn MutationService + Send + Sync>,
    invalidation: Invalidation,
    in_flight: InFlightSet,
}

impl std::fmt::Debug for InteractionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionController")
            .field("store", &self.store)
            .field("invalidation", &self.invalidation)
            .finish_non_exhaustive()
    }
}

impl InteractionController {
    pub fn new(
        store: ShadowStore,
        mutations: Arc<dyn MutationService + Send + Sync>,
        invalidation: Invalidation,
    ) -> InteractionController {
        InteractionController {
            reader: ShadowReader::new(store.clone()),
            store,
            mutations,
            invalidation,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }
    pub fn reader(&self) -> &ShadowReader {
        &self.reader
    }
    /// True if a toggle of `kind` on `uri` has yet to settle
    pub fn is_in_flight(&self, uri: &AtUri, kind: EngagementKind) -> bool {
        self.in_flight
            .lock()
            .expect("Poisoned mutex!")
            .contains(&(uri.clone(), kind))
    }
    pub async fn toggle_like(&self, post: &PostView) -> Result<Outcome> {
        self.toggle(EngagementKind::Like, post).await
    }
    pub async fn toggle_repost(&self, post: &PostView) -> Result<Outcome> {
        self.toggle(EngagementKind::Repost, post).await
    }
    /// [toggle] on the tokio runtime, for callers that just want to fire & forget
    ///
    /// The optimistic write happens before this returns; the handle resolves when the action
    /// settles.
    ///
    /// [toggle]: InteractionController::toggle
    pub fn spawn_toggle(&self, kind: EngagementKind, post: PostView) -> JoinHandle<Result<Outcome>> {
        // Do the synchronous part here, so the caller can re-render immediately
        let prepared = self.begin(kind, &post);
        let this = self.clone();
        tokio::spawn(async move {
            let (pending, mutation) = prepared?;
            this.complete(pending, mutation).await
        })
    }
    /// Toggle the viewer's `kind` of `post`
    ///
    /// `post` should be the canonical post; whatever shadow it has is taken into account.
    pub async fn toggle(&self, kind: EngagementKind, post: &PostView) -> Result<Outcome> {
        let (pending, mutation) = self.begin(kind, post)?;
        self.complete(pending, mutation).await
    }
    /// Validate, snapshot & write the optimistic shadow; nothing here awaits
    fn begin(&self, kind: EngagementKind, post: &PostView) -> Result<(PendingAction, Mutation)> {
        let uri = &post.uri;
        let claim = Claim::new(&self.in_flight, uri, kind)?;

        let (before_count, before_marker) = {
            let visible = self.reader.materialize(post);
            (visible.count(kind), visible.marker(kind).cloned())
        };
        let mutation = match &before_marker {
            Some(Marker::Pending) => return UnsettledSnafu { uri: uri.clone(), kind }.fail(),
            Some(Marker::Record(record)) => Mutation::Delete(record.clone()),
            None => Mutation::Create(
                post.cid
                    .clone()
                    .context(MissingCidSnafu { uri: uri.clone(), kind })?,
            ),
        };

        let (count, marker) = match mutation {
            Mutation::Delete(_) => (before_count.saturating_sub(1), None),
            Mutation::Create(_) => (before_count.saturating_add(1), Some(Marker::Pending)),
        };
        self.store.begin(uri);
        self.store
            .merge_write(uri, ShadowRecord::engagement(kind, count, marker));
        debug!("Optimistic {kind} of {uri}: {before_count} -> {count}");

        Ok((
            PendingAction {
                store: self.store.clone(),
                uri: uri.clone(),
                kind,
                before_count,
                before_marker,
                count,
                armed: true,
                _claim: claim,
            },
            mutation,
        ))
    }
    async fn complete(&self, pending: PendingAction, mutation: Mutation) -> Result<Outcome> {
        let uri = pending.uri.clone();
        let kind = pending.kind;
        let undo = matches!(mutation, Mutation::Delete(_));
        let result = match &mutation {
            Mutation::Create(cid) => self
                .mutations
                .create_engagement(kind, &uri, cid)
                .await
                .map(Some),
            Mutation::Delete(record) => self
                .mutations
                .delete_engagement(record)
                .await
                .map(|_| None),
        };

        match result {
            Ok(record) => {
                if let Some(record) = record {
                    // Replace the pending marker with the real thing, so that an undo before the
                    // next refresh knows what to delete. The count goes with it: marker & count
                    // always move together.
                    self.store.merge_write(
                        &uri,
                        ShadowRecord::engagement(kind, pending.count, Some(Marker::Record(record))),
                    );
                }
                pending.settle();
                self.invalidation.invalidate();
                info!("{kind} of {uri} {}", if undo { "undone" } else { "done" });
                Ok(Outcome::Settled)
            }
            Err(err) if err.is_success_equivalent(undo) => {
                pending.settle();
                self.invalidation.invalidate();
                info!("{kind} of {uri} was already in effect ({err})");
                Ok(Outcome::AlreadyInEffect)
            }
            Err(err) if err.is_auth() => {
                drop(pending);
                warn!("{kind} of {uri} rolled back; not authorized");
                Err(err).context(UnauthorizedSnafu { uri, kind })
            }
            Err(err) => {
                drop(pending);
                warn!("{kind} of {uri} rolled back: {err}");
                Ok(Outcome::RolledBack(Notice {
                    uri,
                    kind,
                    undo,
                    reason: err.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::{collections::VecDeque, num::NonZeroUsize, time::Duration};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    fn post(likes: u64, like: Option<&str>) -> PostView {
        serde_json::from_value(serde_json::json!({
            "uri": "at://did:plc:alice/app.bsky.feed.post/1",
            "cid": "bafyrei1",
            "author": {"did": "did:plc:alice", "handle": "alice.test"},
            "record": {"text": "hello"},
            "likeCount": likes,
            "repostCount": 7,
            "viewer": {"like": like}
        }))
        .unwrap()
    }

    fn like_record(n: usize) -> AtUri {
        AtUri::new(&format!("at://did:plc:me/app.bsky.feed.like/{n}")).unwrap()
    }

    /// What the scripted service should answer next
    enum Reply {
        Created(AtUri),
        Deleted,
        Fail(remote::Error),
        /// Wait to be released, then answer `Deleted` or a fresh record
        Gate(Arc<Notify>),
    }

    #[derive(Default)]
    struct ScriptedMutations {
        replies: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedMutations {
        fn new(replies: Vec<Reply>) -> Arc<ScriptedMutations> {
            Arc::new(ScriptedMutations {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
        fn next(&self) -> Reply {
            self.replies.lock().unwrap().pop_front().expect("Unscripted call")
        }
    }

    #[async_trait]
    impl MutationService for ScriptedMutations {
        async fn create_engagement(
            &self,
            kind: EngagementKind,
            subject_uri: &AtUri,
            subject_cid: &Cid,
        ) -> remote::Result<AtUri> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {kind} {subject_uri} {subject_cid}"));
            match self.next() {
                Reply::Created(uri) => Ok(uri),
                Reply::Fail(err) => Err(err),
                Reply::Gate(notify) => {
                    notify.notified().await;
                    Ok(like_record(99))
                }
                Reply::Deleted => panic!("Scripted a delete reply for a create"),
            }
        }
        async fn delete_engagement(&self, record: &AtUri) -> remote::Result<()> {
            self.calls.lock().unwrap().push(format!("delete {record}"));
            match self.next() {
                Reply::Deleted => Ok(()),
                Reply::Fail(err) => Err(err),
                Reply::Gate(notify) => {
                    notify.notified().await;
                    Ok(())
                }
                Reply::Created(_) => panic!("Scripted a create reply for a delete"),
            }
        }
    }

    fn controller(mutations: Arc<ScriptedMutations>) -> (InteractionController, Invalidation) {
        let invalidation = Invalidation::new();
        (
            InteractionController::new(ShadowStore::default(), mutations, invalidation.clone()),
            invalidation,
        )
    }

    #[tokio::test]
    async fn like_then_unlike() {
        let mutations = ScriptedMutations::new(vec![Reply::Created(like_record(1)), Reply::Deleted]);
        let (ctl, invalidation) = controller(mutations.clone());
        let p = post(3, None);

        assert_eq!(ctl.toggle_like(&p).await.unwrap(), Outcome::Settled);
        let visible = ctl.reader().materialize(&p).into_owned();
        assert_eq!(visible.like_count, 4);
        assert_eq!(visible.viewer.like, Some(Marker::Record(like_record(1))));
        assert_eq!(invalidation.generation(), 1);

        // No refetch in between; the second toggle deletes the record the first one created
        assert_eq!(ctl.toggle_like(&p).await.unwrap(), Outcome::Settled);
        let visible = ctl.reader().materialize(&p).into_owned();
        assert_eq!(visible, p);
        assert_eq!(invalidation.generation(), 2);
        assert_eq!(
            *mutations.calls.lock().unwrap(),
            vec![
                format!("create like {} bafyrei1", p.uri),
                format!("delete {}", like_record(1)),
            ]
        );
        assert!(!ctl.is_in_flight(&p.uri, EngagementKind::Like));
        assert_eq!(ctl.store.entry(&p.uri).unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn optimistic_write_then_rollback() {
        let gate = Arc::new(Notify::new());
        let mutations = ScriptedMutations::new(vec![Reply::Gate(gate.clone())]);
        let (ctl, _) = controller(mutations);
        let p = post(3, None);

        let handle = ctl.spawn_toggle(EngagementKind::Like, p.clone());
        // Visible before the request resolves
        let visible = ctl.reader().materialize(&p).into_owned();
        assert_eq!(visible.like_count, 4);
        assert_eq!(visible.viewer.like, Some(Marker::Pending));
        assert!(ctl.is_in_flight(&p.uri, EngagementKind::Like));
        // The other kind is untouched
        assert_eq!(visible.repost_count, 7);

        // The double-click is refused outright
        assert!(matches!(
            ctl.toggle_like(&p).await,
            Err(Error::InFlight { .. })
        ));

        gate.notify_one();
        assert_eq!(handle.await.unwrap().unwrap(), Outcome::Settled);

        // Now fail one
        let mutations = ScriptedMutations::new(vec![Reply::Fail(remote::Error::Transient {
            status: 503,
        })]);
        let (ctl, invalidation) = controller(mutations);
        let outcome = ctl.toggle_like(&p).await.unwrap();
        let Outcome::RolledBack(notice) = outcome else {
            panic!("Expected a rollback, got {outcome:?}");
        };
        assert_eq!(notice.to_string(), "failed to like");
        let visible = ctl.reader().materialize(&p).into_owned();
        assert_eq!(visible.like_count, 3);
        assert_eq!(visible.viewer.like, None);
        assert_eq!(visible, p);
        assert_eq!(invalidation.generation(), 0);
    }

    #[tokio::test]
    async fn rollback_restores_an_existing_like() {
        let mutations = ScriptedMutations::new(vec![Reply::Fail(remote::Error::Rejected {
            status: 400,
            error: "InvalidRequest".to_owned(),
            message: None,
        })]);
        let (ctl, _) = controller(mutations);
        let p = post(5, Some("at://did:plc:me/app.bsky.feed.like/1"));
        let Outcome::RolledBack(notice) = ctl.toggle_like(&p).await.unwrap() else {
            panic!("Expected a rollback");
        };
        assert_eq!(notice.to_string(), "failed to unlike");
        let visible = ctl.reader().materialize(&p).into_owned();
        assert_eq!(visible.like_count, 5);
        assert_eq!(visible.viewer.like, Some(Marker::Record(like_record(1))));
    }

    #[tokio::test]
    async fn duplicates_are_success() {
        let mutations = ScriptedMutations::new(vec![Reply::Fail(remote::Error::Duplicate)]);
        let (ctl, invalidation) = controller(mutations);
        let p = post(3, None);
        assert_eq!(ctl.toggle_like(&p).await.unwrap(), Outcome::AlreadyInEffect);
        let visible = ctl.reader().materialize(&p).into_owned();
        assert_eq!(visible.like_count, 4);
        assert_eq!(visible.viewer.like, Some(Marker::Pending));
        assert_eq!(invalidation.generation(), 1);
        // We don't know the record to delete until the feed's been refreshed
        assert!(matches!(
            ctl.toggle_like(&p).await,
            Err(Error::Unsettled { .. })
        ));

        let mutations = ScriptedMutations::new(vec![Reply::Fail(remote::Error::NotFound)]);
        let (ctl, _) = controller(mutations);
        let p = post(3, Some("at://did:plc:me/app.bsky.feed.like/1"));
        assert_eq!(ctl.toggle_like(&p).await.unwrap(), Outcome::AlreadyInEffect);
        let visible = ctl.reader().materialize(&p).into_owned();
        assert_eq!(visible.like_count, 2);
        assert_eq!(visible.viewer.like, None);
    }

    #[tokio::test]
    async fn only_matching_conflicts_count_as_success() {
        // A 404 on create isn't "already liked"
        let mutations = ScriptedMutations::new(vec![
            Reply::Fail(remote::Error::NotFound),
            Reply::Created(like_record(1)),
        ]);
        let (ctl, invalidation) = controller(mutations);
        let p = post(3, None);
        let outcome = ctl.toggle_like(&p).await.unwrap();
        let Outcome::RolledBack(notice) = outcome else {
            panic!("Expected a rollback, got {outcome:?}");
        };
        assert_eq!(notice.to_string(), "failed to like");
        assert_eq!(*ctl.reader().materialize(&p), p);
        assert_eq!(invalidation.generation(), 0);
        // Nothing was left pending, so the user can simply try again
        assert_eq!(ctl.toggle_like(&p).await.unwrap(), Outcome::Settled);
        assert_eq!(ctl.reader().materialize(&p).like_count, 4);

        // Nor is a conflict on delete "already unliked"
        let mutations = ScriptedMutations::new(vec![Reply::Fail(remote::Error::Duplicate)]);
        let (ctl, invalidation) = controller(mutations);
        let p = post(3, Some("at://did:plc:me/app.bsky.feed.like/1"));
        let outcome = ctl.toggle_like(&p).await.unwrap();
        let Outcome::RolledBack(notice) = outcome else {
            panic!("Expected a rollback, got {outcome:?}");
        };
        assert_eq!(notice.to_string(), "failed to unlike");
        assert_eq!(*ctl.reader().materialize(&p), p);
        assert_eq!(invalidation.generation(), 0);
    }

    #[tokio::test]
    async fn in_flight_toggles_survive_eviction() {
        let gate = Arc::new(Notify::new());
        let mutations = ScriptedMutations::new(vec![
            Reply::Gate(gate.clone()),
            Reply::Created(like_record(2)),
        ]);
        let ctl = InteractionController::new(
            ShadowStore::new(NonZeroUsize::new(1).unwrap()),
            mutations.clone(),
            Invalidation::new(),
        );
        let a = post(3, None);
        let mut b = post(0, None);
        b.uri = AtUri::new("at://did:plc:alice/app.bsky.feed.post/2").unwrap();

        let handle = ctl.spawn_toggle(EngagementKind::Like, a.clone());
        // Let the first toggle reach the network before starting the second
        while mutations.calls.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(ctl.toggle_like(&b).await.unwrap(), Outcome::Settled);

        let visible = ctl.reader().materialize(&a).into_owned();
        assert_eq!(visible.like_count, 4);
        assert_eq!(visible.viewer.like, Some(Marker::Pending));

        gate.notify_one();
        assert_eq!(handle.await.unwrap().unwrap(), Outcome::Settled);
        let visible = ctl.reader().materialize(&a).into_owned();
        assert_eq!(visible.like_count, 4);
        assert_eq!(visible.viewer.like, Some(Marker::Record(like_record(99))));
    }

    #[tokio::test]
    async fn auth_failures_roll_back_and_propagate() {
        let mutations = ScriptedMutations::new(vec![Reply::Fail(remote::Error::Unauthorized {
            message: "ExpiredToken".to_owned(),
        })]);
        let (ctl, _) = controller(mutations);
        let p = post(3, None);
        assert!(matches!(
            ctl.toggle_repost(&p).await,
            Err(Error::Unauthorized { .. })
        ));
        assert_eq!(*ctl.reader().materialize(&p), p);
        assert!(!ctl.is_in_flight(&p.uri, EngagementKind::Repost));
    }

    #[tokio::test]
    async fn counts_clamp_at_zero() {
        let mutations = ScriptedMutations::new(vec![Reply::Deleted]);
        let (ctl, _) = controller(mutations);
        // Inconsistent, but the server's been known to send it
        let p = post(0, Some("at://did:plc:me/app.bsky.feed.like/1"));
        assert_eq!(ctl.toggle_like(&p).await.unwrap(), Outcome::Settled);
        let visible = ctl.reader().materialize(&p);
        assert_eq!(visible.like_count, 0);
        assert!(visible.viewer.like.is_none());
    }

    #[tokio::test]
    async fn missing_cid_is_rejected_before_any_write() {
        let mutations = ScriptedMutations::new(vec![]);
        let (ctl, _) = controller(mutations.clone());
        let mut p = post(3, None);
        p.cid = None;
        assert!(matches!(
            ctl.toggle_like(&p).await,
            Err(Error::MissingCid { .. })
        ));
        assert!(ctl.store.is_empty());
        assert!(mutations.calls.lock().unwrap().is_empty());
        assert!(!ctl.is_in_flight(&p.uri, EngagementKind::Like));
    }

    #[tokio::test]
    async fn cancellation_rolls_back() {
        let gate = Arc::new(Notify::new());
        let mutations = ScriptedMutations::new(vec![Reply::Gate(gate)]);
        let (ctl, _) = controller(mutations);
        let p = post(3, None);

        let result = tokio::time::timeout(Duration::from_millis(10), ctl.toggle_like(&p)).await;
        assert!(result.is_err());
        assert_eq!(*ctl.reader().materialize(&p), p);
        assert!(!ctl.is_in_flight(&p.uri, EngagementKind::Like));
        assert_eq!(ctl.store.entry(&p.uri).unwrap().in_flight, 0);
    }
}
