//! Local change tracking.
//!
//! A tracker accumulates the IDs of locally changed records together with
//! the time of their latest change, plus a score expressing how urgently a
//! sync is wanted. The engine snapshots and clears the changed IDs at the
//! start of each pass and puts back whatever it failed to upload.

use crate::events::{EventSink, NullSink, SyncEvent};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Change tracker consumed by the engine.
pub trait Tracker: Send + Sync {
    /// Snapshot of changed IDs and their change times (ms since epoch).
    fn changed_ids(&self) -> BTreeMap<String, i64>;

    /// Records a change. Only ever raises the stored time.
    ///
    /// Returns false, without recording, while [`ignore_all`] is set, for
    /// ignored IDs, and for empty IDs.
    ///
    /// [`ignore_all`]: Tracker::ignore_all
    fn add_changed_id(&self, id: &str, when: i64) -> bool;

    /// Forgets a change. Returns false if the ID was not tracked.
    fn remove_changed_id(&self, id: &str) -> bool;

    /// Forgets every change.
    fn clear_changed_ids(&self);

    /// Current score.
    fn score(&self) -> u32;

    /// Sets the score.
    fn set_score(&self, score: u32);

    /// Resets the score to zero.
    fn reset_score(&self) {
        self.set_score(0);
    }

    /// Raises the score by `delta`.
    fn bump_score(&self, delta: u32) {
        self.set_score(self.score().saturating_add(delta));
    }

    /// Returns true while changes are being ignored.
    fn ignore_all(&self) -> bool;

    /// Starts or stops ignoring changes.
    fn set_ignore_all(&self, ignore: bool);

    /// Ignores changes to one ID.
    fn ignore_id(&self, id: &str);

    /// Stops ignoring changes to one ID.
    fn unignore_id(&self, id: &str);
}

/// Sets `ignore_all` for its lifetime, then restores the previous value.
pub struct IgnoreAllGuard<'a, T: Tracker + ?Sized> {
    tracker: &'a T,
    previous: bool,
}

impl<'a, T: Tracker + ?Sized> IgnoreAllGuard<'a, T> {
    /// Starts ignoring changes on `tracker`.
    pub fn new(tracker: &'a T) -> Self {
        let previous = tracker.ignore_all();
        tracker.set_ignore_all(true);
        Self { tracker, previous }
    }
}

impl<T: Tracker + ?Sized> Drop for IgnoreAllGuard<'_, T> {
    fn drop(&mut self) {
        self.tracker.set_ignore_all(self.previous);
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    changed: BTreeMap<String, i64>,
    ignored: BTreeSet<String>,
    score: u32,
}

/// In-memory [`Tracker`].
pub struct MemoryTracker {
    collection: String,
    state: RwLock<TrackerState>,
    ignore_all: AtomicBool,
    events: Arc<dyn EventSink>,
}

impl MemoryTracker {
    /// Creates an empty tracker for `collection`.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            state: RwLock::new(TrackerState::default()),
            ignore_all: AtomicBool::new(false),
            events: Arc::new(NullSink),
        }
    }

    /// Sends score updates to `events`.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Change time recorded for `id`.
    pub fn changed_at(&self, id: &str) -> Option<i64> {
        self.state.read().changed.get(id).copied()
    }
}

impl Tracker for MemoryTracker {
    fn changed_ids(&self) -> BTreeMap<String, i64> {
        self.state.read().changed.clone()
    }

    fn add_changed_id(&self, id: &str, when: i64) -> bool {
        if id.is_empty() || self.ignore_all() {
            return false;
        }
        let mut state = self.state.write();
        if state.ignored.contains(id) {
            return false;
        }
        let entry = state.changed.entry(id.to_string()).or_insert(when);
        if *entry < when {
            *entry = when;
        }
        trace!(collection = %self.collection, id, when, "change tracked");
        true
    }

    fn remove_changed_id(&self, id: &str) -> bool {
        if id.is_empty() || self.ignore_all() {
            return false;
        }
        self.state.write().changed.remove(id).is_some()
    }

    fn clear_changed_ids(&self) {
        self.state.write().changed.clear();
    }

    fn score(&self) -> u32 {
        self.state.read().score
    }

    fn set_score(&self, score: u32) {
        self.state.write().score = score;
        self.events.notify(&SyncEvent::ScoreUpdated {
            collection: self.collection.clone(),
            score,
        });
    }

    fn ignore_all(&self) -> bool {
        self.ignore_all.load(Ordering::SeqCst)
    }

    fn set_ignore_all(&self, ignore: bool) {
        self.ignore_all.store(ignore, Ordering::SeqCst);
    }

    fn ignore_id(&self, id: &str) {
        self.state.write().ignored.insert(id.to_string());
    }

    fn unignore_id(&self, id: &str) {
        self.state.write().ignored.remove(id);
    }
}
