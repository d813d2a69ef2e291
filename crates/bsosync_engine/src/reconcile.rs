//! Conflict resolution for incoming records.
//!
//! [`reconcile`] decides what to do with one incoming record given the
//! local state and the pass's outgoing candidates. It never mutates
//! anything; the engine carries out the returned [`Decision`].

use crate::error::SyncResult;
use crate::store::Store;
use bsosync_protocol::{Cleartext, ServerTimestamp};
use std::collections::BTreeMap;
use tracing::trace;

/// Read-only view of local data needed to reconcile.
pub trait LocalView {
    /// Returns true if an item with this ID exists locally.
    fn item_exists(&self, id: &str) -> bool;

    /// Builds a fresh record for `id` from local data.
    fn create_record(&self, id: &str) -> SyncResult<Cleartext>;

    /// ID of a local duplicate of `record` under another ID.
    fn find_dupe(&self, record: &Cleartext) -> Option<String>;
}

impl<S: Store + ?Sized> LocalView for S {
    fn item_exists(&self, id: &str) -> bool {
        Store::item_exists(self, id)
    }

    fn create_record(&self, id: &str) -> SyncResult<Cleartext> {
        Store::create_record(self, id)
    }

    fn find_dupe(&self, record: &Cleartext) -> Option<String> {
        Store::find_dupe(self, record)
    }
}

/// The two clocks ages are measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clocks {
    /// Server time reported with the incoming record.
    pub server_now: ServerTimestamp,
    /// Local time, ms since the Unix epoch.
    pub local_now: i64,
}

/// Outcome of reconciling one incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Same as the pending local change: drop both.
    SkipIdentical,
    /// Conflict won by the server: apply and drop the local change.
    ///
    /// The local item is not uploaded again after the remote version is
    /// applied, so the server copy stays as received.
    TakeRemote,
    /// Conflict won by the local change: keep it for upload.
    KeepLocal,
    /// Existing item that differs: apply.
    Update,
    /// Existing item that is already identical: skip.
    Unchanged,
    /// Deletion of an unknown item: apply.
    ApplyTombstone,
    /// Same entity as a local item under another ID.
    MergeDuplicate {
        /// ID that survives.
        winner: String,
        /// ID to delete on the server.
        loser: String,
        /// True if the local item's ID survives.
        local_wins: bool,
    },
    /// Unknown item: apply as a creation.
    Create,
}

impl Decision {
    /// Returns true if the incoming record must be applied to the store.
    pub fn should_apply(&self) -> bool {
        matches!(
            self,
            Decision::TakeRemote
                | Decision::Update
                | Decision::ApplyTombstone
                | Decision::MergeDuplicate { .. }
                | Decision::Create
        )
    }
}

/// Decides what to do with `incoming`.
///
/// `modified` is the record's server timestamp and `candidates` maps the
/// IDs about to be uploaded to their local change times. Each side's age is
/// measured against its own clock; the younger side wins a conflict and the
/// server wins ties.
pub fn reconcile<L: LocalView + ?Sized>(
    incoming: &Cleartext,
    modified: ServerTimestamp,
    candidates: &BTreeMap<String, i64>,
    local: &L,
    clocks: Clocks,
) -> SyncResult<Decision> {
    let id = incoming.id.as_str();

    if let Some(&changed_at) = candidates.get(id) {
        if local.create_record(id)? == *incoming {
            trace!(id, "incoming matches pending local change");
            return Ok(Decision::SkipIdentical);
        }

        let record_age = modified.age_at(clocks.server_now);
        let local_age = clocks.local_now - changed_at;
        trace!(id, record_age, local_age, "conflicting change");

        return Ok(if record_age <= local_age {
            Decision::TakeRemote
        } else {
            Decision::KeepLocal
        });
    }

    if local.item_exists(id) {
        return Ok(if local.create_record(id)? == *incoming {
            Decision::Unchanged
        } else {
            Decision::Update
        });
    }

    if incoming.is_tombstone() {
        return Ok(Decision::ApplyTombstone);
    }

    if let Some(dupe_id) = local.find_dupe(incoming) {
        let local_wins = prefer_id(&dupe_id, id);
        trace!(id, dupe_id = %dupe_id, local_wins, "duplicate found");
        let (winner, loser) = if local_wins {
            (dupe_id, id.to_string())
        } else {
            (id.to_string(), dupe_id)
        };
        return Ok(Decision::MergeDuplicate {
            winner,
            loser,
            local_wins,
        });
    }

    Ok(Decision::Create)
}

/// Returns true if `a` should survive a merge with `b`: shorter IDs win,
/// equal lengths compare lexically.
fn prefer_id(a: &str, b: &str) -> bool {
    a.len() < b.len() || (a.len() == b.len() && a < b)
}
