//! Notifications emitted while syncing.

use parking_lot::Mutex;

/// Phase of a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Manifest checks and outgoing snapshot.
    Startup,
    /// Downloading and applying remote records.
    Incoming,
    /// Uploading local changes.
    Outgoing,
    /// Server-side deletions and score reset.
    Finish,
    /// Re-queueing anything not uploaded.
    Cleanup,
}

impl Phase {
    /// Status string for observers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Startup => "sync-startup",
            Phase::Incoming => "process-incoming",
            Phase::Outgoing => "upload-outgoing",
            Phase::Finish => "sync-finish",
            Phase::Cleanup => "sync-cleanup",
        }
    }
}

/// Per-pass counters for incoming records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncomingCounts {
    /// Records handed to the store successfully.
    pub applied: usize,
    /// Records that failed to decrypt, reconcile or apply.
    pub failed: usize,
    /// Failures not already pending from the previous pass.
    pub new_failed: usize,
    /// Records dropped by reconciliation.
    pub reconciled: usize,
}

impl IncomingCounts {
    /// Failures that also failed on the previous pass.
    pub fn repeat_failed(&self) -> usize {
        self.failed - self.new_failed
    }
}

/// A notification from an engine or tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A tracker's score changed.
    ScoreUpdated {
        /// Collection name.
        collection: String,
        /// New score.
        score: u32,
    },
    /// A pass entered a phase.
    Status {
        /// Collection name.
        collection: String,
        /// Phase entered.
        phase: Phase,
    },
    /// Some incoming records could not be applied.
    ApplyFailed {
        /// Collection name.
        collection: String,
        /// Counters for the pass.
        counts: IncomingCounts,
    },
}

/// Receives [`SyncEvent`]s.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn notify(&self, event: &SyncEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: &SyncEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded events.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Returns the `ApplyFailed` counts recorded so far.
    pub fn apply_failures(&self) -> Vec<IncomingCounts> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SyncEvent::ApplyFailed { counts, .. } => Some(*counts),
                _ => None,
            })
            .collect()
    }

    /// Forgets recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, event: &SyncEvent) {
        self.events.lock().push(event.clone());
    }
}
