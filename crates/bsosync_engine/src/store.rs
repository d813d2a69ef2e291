//! The local record store seen by the engine.

use crate::error::{SyncError, SyncResult};
use bsosync_protocol::Cleartext;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Local storage for one collection.
///
/// Implemented once per data type. The engine only ever talks to the
/// store through this trait.
pub trait Store: Send + Sync {
    /// Creates a new local item.
    fn create(&self, record: &Cleartext) -> SyncResult<()>;

    /// Overwrites an existing local item.
    fn update(&self, record: &Cleartext) -> SyncResult<()>;

    /// Removes a local item.
    fn remove(&self, record: &Cleartext) -> SyncResult<()>;

    /// Returns true if an item with this ID exists locally.
    fn item_exists(&self, id: &str) -> bool;

    /// Builds a fresh record for `id` from local data.
    ///
    /// Items that no longer exist are returned as tombstones.
    fn create_record(&self, id: &str) -> SyncResult<Cleartext>;

    /// Renames a local item.
    fn change_item_id(&self, old_id: &str, new_id: &str) -> SyncResult<()>;

    /// IDs of every local item.
    fn get_all_ids(&self) -> SyncResult<BTreeSet<String>>;

    /// Removes every local item.
    fn wipe(&self) -> SyncResult<()>;

    /// ID of a local item that is the same entity as `record` under a
    /// different ID, if any.
    fn find_dupe(&self, _record: &Cleartext) -> Option<String> {
        None
    }

    /// Applies one incoming record.
    fn apply_incoming(&self, record: &Cleartext) -> SyncResult<()> {
        if record.is_tombstone() {
            self.remove(record)
        } else if self.item_exists(&record.id) {
            self.update(record)
        } else {
            self.create(record)
        }
    }

    /// Applies a batch, returning the IDs that failed.
    fn apply_incoming_batch(&self, records: &[Cleartext]) -> Vec<String> {
        let mut failed = Vec::new();
        for record in records {
            if let Err(e) = self.apply_incoming(record) {
                warn!(id = %record.id, error = %e, "failed to apply incoming record");
                failed.push(record.id.clone());
            }
        }
        failed
    }
}

/// Computes a domain key used to detect duplicates.
pub type DupeKeyFn = dyn Fn(&Cleartext) -> Option<String> + Send + Sync;

/// In-memory [`Store`].
///
/// Duplicates are found by comparing the keys returned by an optional
/// [`DupeKeyFn`]. Individual IDs can be made to fail on apply or on record
/// creation.
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<String, Cleartext>>,
    dupe_key: Option<Box<DupeKeyFn>>,
    failing_apply: RwLock<BTreeSet<String>>,
    failing_create: RwLock<BTreeSet<String>>,
    applied: RwLock<Vec<String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Detects duplicates by the key `f` derives from each record.
    pub fn with_dupe_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&Cleartext) -> Option<String> + Send + Sync + 'static,
    {
        self.dupe_key = Some(Box::new(f));
        self
    }

    /// Inserts or replaces an item without going through the engine.
    pub fn insert(&self, record: Cleartext) {
        self.items.write().insert(record.id.clone(), record);
    }

    /// Returns a copy of the item with this ID.
    pub fn get(&self, id: &str) -> Option<Cleartext> {
        self.items.read().get(id).cloned()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// IDs of every record applied through [`Store::apply_incoming`], in order.
    pub fn applied_ids(&self) -> Vec<String> {
        self.applied.read().clone()
    }

    /// Makes applying `id` fail until [`heal`](Self::heal) is called.
    pub fn fail_apply_for(&self, id: impl Into<String>) {
        self.failing_apply.write().insert(id.into());
    }

    /// Makes building an outgoing record for `id` fail.
    pub fn fail_create_record_for(&self, id: impl Into<String>) {
        self.failing_create.write().insert(id.into());
    }

    /// Clears every injected failure.
    pub fn heal(&self) {
        self.failing_apply.write().clear();
        self.failing_create.write().clear();
    }

    fn check_apply(&self, id: &str) -> SyncResult<()> {
        if self.failing_apply.read().contains(id) {
            return Err(SyncError::store(format!("refusing to apply {id}")));
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn create(&self, record: &Cleartext) -> SyncResult<()> {
        self.insert(record.clone());
        Ok(())
    }

    fn update(&self, record: &Cleartext) -> SyncResult<()> {
        self.insert(record.clone());
        Ok(())
    }

    fn remove(&self, record: &Cleartext) -> SyncResult<()> {
        self.items.write().remove(&record.id);
        Ok(())
    }

    fn item_exists(&self, id: &str) -> bool {
        self.items.read().contains_key(id)
    }

    fn create_record(&self, id: &str) -> SyncResult<Cleartext> {
        if self.failing_create.read().contains(id) {
            return Err(SyncError::store(format!("cannot build record {id}")));
        }
        Ok(self
            .get(id)
            .unwrap_or_else(|| Cleartext::tombstone(id)))
    }

    fn change_item_id(&self, old_id: &str, new_id: &str) -> SyncResult<()> {
        let mut items = self.items.write();
        let mut record = items
            .remove(old_id)
            .ok_or_else(|| SyncError::store(format!("no item {old_id}")))?;
        record.id = new_id.to_string();
        items.insert(new_id.to_string(), record);
        debug!(old_id, new_id, "item renamed");
        Ok(())
    }

    fn get_all_ids(&self) -> SyncResult<BTreeSet<String>> {
        Ok(self.items.read().keys().cloned().collect())
    }

    fn wipe(&self) -> SyncResult<()> {
        self.items.write().clear();
        Ok(())
    }

    fn find_dupe(&self, record: &Cleartext) -> Option<String> {
        let key_of = self.dupe_key.as_ref()?;
        let key = key_of(record)?;
        self.items
            .read()
            .values()
            .find(|item| item.id != record.id && key_of(item).as_deref() == Some(key.as_str()))
            .map(|item| item.id.clone())
    }

    fn apply_incoming(&self, record: &Cleartext) -> SyncResult<()> {
        self.check_apply(&record.id)?;
        if record.is_tombstone() {
            self.remove(record)?;
        } else if self.item_exists(&record.id) {
            self.update(record)?;
        } else {
            self.create(record)?;
        }
        self.applied.write().push(record.id.clone());
        Ok(())
    }
}
