use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::snapshot::Snapshot;
use crate::subscription::{Credential, SubscriberId, WatchState};

/// Identifies one installed watch. A lease outlives its subscription only as a
/// stale handle: every store write made through it is checked against the current
/// generation.
#[derive(Debug, Clone)]
pub struct WatchLease {
    subscriber_id: SubscriberId,
    generation: u64,
    cancel: CancellationToken,
}

impl WatchLease {
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub subscriber_id: SubscriberId,
    pub watch_state: WatchState,
    pub has_snapshot: bool,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

struct Subscription {
    credential: Credential,
    last_snapshot: Option<Snapshot>,
    watch_state: WatchState,
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    registered_at: DateTime<Utc>,
}

impl Subscription {
    fn accepts(&self, lease: &WatchLease) -> bool {
        self.generation == lease.generation && !lease.is_cancelled()
    }

    fn cancel(&mut self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.watch_state = WatchState::Cancelled;
        self.task.take()
    }
}

/// Per-subscriber credentials, snapshots and watch handles. Operations on one key
/// never block operations on another beyond the map's shard locking.
pub struct SubscriptionStore {
    entries: DashMap<SubscriberId, Subscription>,
    next_generation: AtomicU64,
    root: CancellationToken,
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(1),
            root: CancellationToken::new(),
        }
    }

    /// Installs a subscription and its watch task. Any existing watch for the same
    /// subscriber is cancelled first. `spawn` runs while the entry is held, so the
    /// returned handle is tracked before anyone else can observe the new entry.
    ///
    /// Re-registering with the exact same credential keeps the last snapshot;
    /// a different credential starts over from no snapshot.
    pub fn register<F>(
        &self,
        subscriber_id: SubscriberId,
        credential: Credential,
        spawn: F,
    ) -> WatchLease
    where
        F: FnOnce(WatchLease) -> JoinHandle<()>,
    {
        let lease = WatchLease {
            subscriber_id,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            cancel: self.root.child_token(),
        };

        match self.entries.entry(subscriber_id) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                // The old task notices its token at its next suspension point.
                drop(existing.cancel());
                let last_snapshot = if existing.credential == credential {
                    existing.last_snapshot.take()
                } else {
                    None
                };
                *existing = Subscription {
                    credential,
                    last_snapshot,
                    watch_state: WatchState::Idle,
                    generation: lease.generation,
                    cancel: lease.cancel.clone(),
                    task: Some(spawn(lease.clone())),
                    registered_at: Utc::now(),
                };
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Subscription {
                    credential,
                    last_snapshot: None,
                    watch_state: WatchState::Idle,
                    generation: lease.generation,
                    cancel: lease.cancel.clone(),
                    task: Some(spawn(lease.clone())),
                    registered_at: Utc::now(),
                });
            }
        }
        lease
    }

    /// Removes the subscription and cancels its watch. Returns whether one existed.
    pub fn unregister(&self, subscriber_id: SubscriberId) -> bool {
        match self.entries.remove(&subscriber_id) {
            Some((_, mut subscription)) => {
                drop(subscription.cancel());
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, subscriber_id: SubscriberId) -> bool {
        self.entries.contains_key(&subscriber_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Credential for the lease's generation, or `None` once it was replaced or removed.
    pub fn credential(&self, lease: &WatchLease) -> Option<Credential> {
        self.entries
            .get(&lease.subscriber_id)
            .filter(|entry| entry.accepts(lease))
            .map(|entry| entry.credential.clone())
    }

    pub fn get_last_snapshot(&self, subscriber_id: SubscriberId) -> Option<Snapshot> {
        self.entries
            .get(&subscriber_id)
            .and_then(|entry| entry.last_snapshot.clone())
    }

    /// Discarded if the subscriber is gone.
    pub fn set_last_snapshot(&self, subscriber_id: SubscriberId, snapshot: Snapshot) {
        if let Some(mut entry) = self.entries.get_mut(&subscriber_id) {
            entry.last_snapshot = Some(snapshot);
        }
    }

    /// Generation-checked snapshot write. Returns false when the lease is stale.
    pub fn commit_snapshot(&self, lease: &WatchLease, snapshot: Snapshot) -> bool {
        match self.entries.get_mut(&lease.subscriber_id) {
            Some(mut entry) if entry.accepts(lease) => {
                entry.last_snapshot = Some(snapshot);
                true
            }
            _ => false,
        }
    }

    pub fn set_watch_state(&self, lease: &WatchLease, state: WatchState) -> bool {
        match self.entries.get_mut(&lease.subscriber_id) {
            Some(mut entry) if entry.accepts(lease) => {
                entry.watch_state = state;
                true
            }
            _ => false,
        }
    }

    pub fn watch_state(&self, subscriber_id: SubscriberId) -> Option<WatchState> {
        self.entries
            .get(&subscriber_id)
            .map(|entry| entry.watch_state)
    }

    pub fn summaries(&self) -> Vec<SubscriptionSummary> {
        let mut out = self
            .entries
            .iter()
            .map(|entry| SubscriptionSummary {
                subscriber_id: *entry.key(),
                watch_state: entry.watch_state,
                has_snapshot: entry.last_snapshot.is_some(),
                last_fetched_at: entry.last_snapshot.as_ref().map(Snapshot::fetched_at),
                registered_at: entry.registered_at,
            })
            .collect::<Vec<_>>();
        out.sort_by_key(|summary| summary.subscriber_id);
        out
    }

    /// Cancels every watch and empties the store. Returns the task handles so the
    /// caller can wait for them to wind down.
    pub fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        self.root.cancel();
        let ids = self
            .entries
            .iter()
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, mut subscription)) = self.entries.remove(&id) {
                handles.extend(subscription.cancel());
            }
        }
        handles
    }
}
