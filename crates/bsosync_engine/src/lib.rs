//! # BSOSync Engine
//!
//! Collection sync engine for the BSOSync storage protocol.
//!
//! This crate provides:
//! - The four-phase sync pass (startup → incoming → outgoing → finish,
//!   then cleanup)
//! - Conflict resolution between incoming records and local changes
//! - Change tracker and local store contracts with in-memory versions
//! - Persisted per-collection sync state
//! - Collection key refresh on HMAC failures
//! - HTTP transport abstraction and an in-memory server for tests
//!
//! ## Architecture
//!
//! Each pass syncs one collection:
//! 1. Check `meta/global` for the engine's version and sync ID
//! 2. Download records changed since the last pass, reconcile them
//!    against pending local changes and apply them to the store
//! 3. Upload local changes in bounded batches
//! 4. Delete server-side duplicates and reset the tracker's score
//!
//! Local changes not uploaded by the end of a pass go back to the tracker.
//!
//! ## Key Invariants
//!
//! - The server is authoritative for timestamps
//! - Incoming is processed before outgoing
//! - The watermark only advances over fully processed batches
//! - Records are authenticated before they are decrypted
//! - Passes on one engine never overlap

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod events;
mod http;
mod keys;
mod reconcile;
mod state;
mod store;
mod tracker;
mod transport;

pub use config::{ClientType, EngineConfig};
pub use engine::{SyncEngine, SyncOutcome, SyncStats};
pub use error::{SyncError, SyncResult};
pub use events::{EventSink, IncomingCounts, NullSink, Phase, RecordingSink, SyncEvent};
pub use http::{HttpClient, HttpResponse, HttpTransport};
pub use keys::{KeyRecovery, KeyRefresher, RecoveryStrategy};
pub use reconcile::{reconcile, Clocks, Decision, LocalView};
pub use state::{CollectionSyncState, JsonFileStateStore, MemoryStateStore, StateStore};
pub use store::{DupeKeyFn, MemoryStore, Store};
pub use tracker::{IgnoreAllGuard, MemoryTracker, Tracker};
pub use transport::{LoggedRequest, MemoryServer, Method, StorageTransport};
