//! Collection key refresh and HMAC-error recovery.

use crate::error::{SyncError, SyncResult};
use crate::transport::StorageTransport;
use bsosync_crypto::{CollectionKeys, EncryptedRecord, KeyBundle, KeyChange};
use bsosync_protocol::{CRYPTO_COLLECTION, KEYS_ID};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What to do with a record that failed HMAC verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Skip the record silently.
    Ignore,
    /// Decrypt again; keys were refreshed.
    Retry,
    /// Count the record as failed.
    Error,
}

/// Hooks the engine calls when collection keys may be stale.
pub trait KeyRecovery: Send + Sync {
    /// Makes sure usable collection keys are installed, downloading or
    /// generating them as needed. Returns every key change since the
    /// previous call, including refreshes made by HMAC events.
    fn ensure_keys(&self) -> SyncResult<KeyChange>;

    /// Reacts to an HMAC failure by refreshing keys. Returns true if the
    /// keys changed, so a retry may succeed.
    fn handle_hmac_event(&self) -> SyncResult<bool>;

    /// Decides how to treat record `id` after an HMAC failure. `may_retry`
    /// is false once the record has already been retried.
    fn handle_hmac_mismatch(&self, id: &str, may_retry: bool) -> RecoveryStrategy {
        if !may_retry {
            return RecoveryStrategy::Error;
        }
        match self.handle_hmac_event() {
            Ok(true) => RecoveryStrategy::Retry,
            Ok(false) => RecoveryStrategy::Error,
            Err(e) => {
                warn!(id, error = %e, "key refresh failed");
                RecoveryStrategy::Error
            }
        }
    }
}

/// [`KeyRecovery`] backed by the server's `crypto/keys` record.
///
/// The keys record is encrypted under a root bundle derived from account
/// credentials. Refreshes triggered by HMAC failures are rate limited.
pub struct KeyRefresher<T: StorageTransport> {
    transport: Arc<T>,
    root: KeyBundle,
    keys: Arc<RwLock<CollectionKeys>>,
    collections: Vec<String>,
    interval: Duration,
    last_event: Mutex<Option<Instant>>,
    unreported: Mutex<KeyChange>,
}

impl<T: StorageTransport> KeyRefresher<T> {
    /// Creates a refresher installing keys into `keys`.
    pub fn new(transport: Arc<T>, root: KeyBundle, keys: Arc<RwLock<CollectionKeys>>) -> Self {
        Self {
            transport,
            root,
            keys,
            collections: Vec::new(),
            interval: Duration::from_secs(600),
            last_event: Mutex::new(None),
            unreported: Mutex::new(KeyChange::Unchanged),
        }
    }

    /// Collections that get their own bundle when keys are generated.
    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    /// Minimum time between two HMAC-triggered refreshes.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The key set this refresher maintains.
    pub fn keys(&self) -> Arc<RwLock<CollectionKeys>> {
        Arc::clone(&self.keys)
    }

    /// Downloads and installs `crypto/keys`. Returns `None` if the server
    /// has no keys record.
    pub fn refresh(&self) -> SyncResult<Option<KeyChange>> {
        let Some(bso) = self.transport.get_record(CRYPTO_COLLECTION, KEYS_ID)? else {
            return Ok(None);
        };
        let mut record = EncryptedRecord::from_bso(&bso)?;
        let change = self.keys.write().update_contents(&self.root, &mut record)?;
        self.note(&change);
        Ok(Some(change))
    }

    /// Generates fresh keys, uploads them and installs them.
    pub fn upload_new_keys(&self) -> SyncResult<KeyChange> {
        let fresh = CollectionKeys::new_keys(self.collections.iter().cloned());
        let mut record = fresh.as_record()?;
        record.encrypt(&self.root)?;

        let response = self
            .transport
            .post(CRYPTO_COLLECTION, &[record.to_bso()?])?;
        if !response.is_fully_successful() {
            return Err(SyncError::ServerError {
                status: 400,
                message: format!("crypto/keys rejected: {:?}", response.failed),
            });
        }

        let change = self
            .keys
            .write()
            .set_contents(&fresh.to_payload()?, response.modified)?;
        self.note(&change);
        info!(modified = %response.modified, "uploaded new collection keys");
        Ok(change)
    }

    fn note(&self, change: &KeyChange) {
        if change.is_changed() {
            let mut unreported = self.unreported.lock();
            let previous = std::mem::replace(&mut *unreported, KeyChange::Unchanged);
            *unreported = previous.merge(change.clone());
        }
    }

    fn take_unreported(&self) -> KeyChange {
        std::mem::replace(&mut *self.unreported.lock(), KeyChange::Unchanged)
    }
}

impl<T: StorageTransport> KeyRecovery for KeyRefresher<T> {
    fn ensure_keys(&self) -> SyncResult<KeyChange> {
        let clear = self.keys.read().is_clear();
        let stale = clear || {
            let info = self.transport.info_collections()?;
            let keys = self.keys.read();
            keys.update_needed(&info)
        };

        if stale {
            match self.refresh()? {
                Some(change) => {
                    debug!(changed = change.is_changed(), "collection keys refreshed");
                }
                None => {
                    self.upload_new_keys()?;
                }
            }
        }
        Ok(self.take_unreported())
    }

    fn handle_hmac_event(&self) -> SyncResult<bool> {
        {
            let mut last = self.last_event.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.interval {
                    debug!("recent HMAC event, not refreshing keys");
                    return Ok(false);
                }
            }
            *last = Some(Instant::now());
        }

        match self.refresh() {
            Ok(Some(change)) => Ok(change.is_changed()),
            Ok(None) => Ok(false),
            Err(e) if e.is_hmac_mismatch() => {
                warn!("crypto/keys does not verify under the root key");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
