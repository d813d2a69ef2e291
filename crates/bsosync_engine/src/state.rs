//! Persisted per-collection sync state.

use crate::error::{SyncError, SyncResult};
use bsosync_protocol::ServerTimestamp;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What an engine remembers about one collection between passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSyncState {
    /// Sync ID the local data belongs to.
    #[serde(rename = "syncID", default)]
    pub sync_id: Option<String>,
    /// Newest server timestamp fully incorporated.
    #[serde(default)]
    pub last_sync: ServerTimestamp,
    /// Local clock at the start of the last pass (ms since epoch).
    #[serde(default)]
    pub last_sync_local: i64,
    /// IDs known to be on the server but not yet downloaded.
    #[serde(default)]
    pub to_fetch: Vec<String>,
    /// IDs that failed on the last pass and get one more attempt.
    #[serde(default)]
    pub previous_failed: Vec<String>,
}

impl CollectionSyncState {
    /// Forgets timestamps and pending work, keeping the sync ID.
    pub fn reset(&mut self) {
        self.last_sync = ServerTimestamp::ZERO;
        self.last_sync_local = 0;
        self.to_fetch.clear();
        self.previous_failed.clear();
    }
}

/// Storage for [`CollectionSyncState`].
pub trait StateStore: Send + Sync {
    /// Loads the state for `collection`; missing state loads as default.
    fn load(&self, collection: &str) -> SyncResult<CollectionSyncState>;

    /// Saves the state for `collection`.
    fn save(&self, collection: &str, state: &CollectionSyncState) -> SyncResult<()>;
}

/// In-memory [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, CollectionSyncState>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, collection: &str) -> SyncResult<CollectionSyncState> {
        Ok(self
            .states
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    fn save(&self, collection: &str, state: &CollectionSyncState) -> SyncResult<()> {
        self.states
            .write()
            .insert(collection.to_string(), state.clone());
        Ok(())
    }
}

/// [`StateStore`] keeping one JSON file per collection in a directory.
///
/// Files are replaced atomically by writing a temporary file and renaming
/// it over the old one.
#[derive(Debug)]
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    /// Opens (creating if needed) a state directory.
    pub fn open(dir: impl AsRef<Path>) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the state files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, collection: &str) -> SyncResult<PathBuf> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SyncError::State(format!(
                "invalid collection name {collection:?}"
            )));
        }
        Ok(self.dir.join(format!("{collection}.json")))
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self, collection: &str) -> SyncResult<CollectionSyncState> {
        let path = self.path_for(collection)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CollectionSyncState::default())
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::State(format!("corrupt state file {}: {e}", path.display()))
        })
    }

    fn save(&self, collection: &str, state: &CollectionSyncState) -> SyncResult<()> {
        let path = self.path_for(collection)?;
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(state)?)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;

        debug!(collection, path = %path.display(), "sync state saved");
        Ok(())
    }
}
