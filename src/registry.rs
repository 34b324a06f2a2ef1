//! In-flight lookup registry.
//!
//! Tracks at most one pending lookup per [`LookupKey`] and fans the eventual
//! outcome out to every caller that asked for the same key while the fetch
//! was underway. The broadcast primitive is a `watch` channel holding an
//! `Option<Outcome>`: the slot is written exactly once, at terminal
//! resolution, and the entry is removed in the same critical section so no
//! entry outlives its job.

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{CatalogRecord, LookupKey, Priority};
use crate::error::Error;

/// Terminal outcome of one lookup job, broadcast to all waiters.
pub type Outcome = std::result::Result<CatalogRecord, Error>;

// =============================================================================
// Waiter
// =============================================================================

/// One caller's handle on a pending lookup.
#[derive(Debug)]
pub struct Waiter {
    rx: watch::Receiver<Option<Outcome>>,
}

impl Waiter {
    /// Wait for the job's terminal outcome.
    pub async fn wait(mut self) -> Outcome {
        loop {
            if let Some(outcome) = self.rx.borrow().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped without resolving; treat as shutdown so
                // the caller never hangs.
                return Err(Error::ShuttingDown);
            }
        }
    }

    /// Wait for the outcome, unblocking with `Error::Cancelled` if the
    /// caller's token fires first. Cancellation is caller-local: the
    /// underlying job keeps running for other waiters.
    pub async fn wait_with_cancel(self, cancel: &CancellationToken) -> Outcome {
        tokio::select! {
            outcome = self.wait() => outcome,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

struct Entry {
    tx: watch::Sender<Option<Outcome>>,
    priority: Priority,
}

/// Process-lifetime registry of pending lookups, empty at start and at
/// steady idle.
#[derive(Default)]
pub struct InFlightRegistry {
    entries: DashMap<LookupKey, Entry>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the pending lookup for `key`, creating it if absent.
    ///
    /// Returns `(waiter, is_new)`. When `is_new` is true the caller must
    /// enqueue a dispatcher job and eventually drive [`resolve`] for this
    /// key. When attaching to an existing entry, its priority is bumped to
    /// the max of all outstanding requests so a later interactive request
    /// is not starved behind a bulk job's lane.
    pub fn get_or_attach(&self, key: &LookupKey, priority: Priority) -> (Waiter, bool) {
        let mut is_new = false;
        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
            is_new = true;
            let (tx, _rx) = watch::channel(None);
            Entry { tx, priority }
        });

        let rx = entry.tx.subscribe();
        if !is_new && priority > entry.priority {
            debug!(key = %key, "bumping in-flight lookup to high priority");
        }
        entry.priority = entry.priority.max(priority);

        (Waiter { rx }, is_new)
    }

    /// Effective priority of the pending lookup for `key`, if one exists.
    /// Consulted on re-enqueue so a bump that arrived mid-backoff takes
    /// effect on the next dispatch.
    pub fn current_priority(&self, key: &LookupKey) -> Option<Priority> {
        self.entries.get(key).map(|e| e.priority)
    }

    /// Broadcast the terminal outcome to every attached waiter and remove
    /// the entry. Idempotent: resolving an already-resolved key is a no-op,
    /// so shutdown races cannot double-deliver.
    pub fn resolve(&self, key: &LookupKey, outcome: Outcome) {
        if let Some((_, entry)) = self.entries.remove(key) {
            let waiters = entry.tx.receiver_count();
            debug!(key = %key, waiters, ok = outcome.is_ok(), "resolving lookup");
            // Receivers hold their own handle on the channel; send_replace
            // delivers even though the sender is dropped right after.
            entry.tx.send_replace(Some(outcome));
        }
    }

    /// Number of lookups currently outstanding.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
