//! Per-collection key bundles.
//!
//! The server holds a single `crypto/keys` record, encrypted under the root
//! bundle, that maps collection names to bundles plus a default bundle used
//! for every collection without its own entry. [`CollectionKeys`] caches the
//! decrypted contents along with the record's modification time, and
//! reports what changed whenever a newer record is installed.

use crate::error::{CryptoError, CryptoResult};
use crate::key_bundle::KeyBundle;
use crate::record::EncryptedRecord;
use bsosync_protocol::{
    Cleartext, InfoCollections, ServerTimestamp, CRYPTO_COLLECTION, KEYS_ID,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Decrypted body of the `crypto/keys` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoKeysPayload {
    /// Always `keys`.
    pub id: String,
    /// Always `crypto`.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Default bundle as `[enc key, hmac key]`, base64.
    #[serde(default)]
    pub default: Option<[String; 2]>,
    /// Per-collection bundles.
    #[serde(default)]
    pub collections: BTreeMap<String, [String; 2]>,
}

fn default_collection() -> String {
    CRYPTO_COLLECTION.to_string()
}

/// What [`CollectionKeys::set_contents`] changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyChange {
    /// Same keys as before.
    Unchanged,
    /// Only these per-collection bundles changed (sorted, unique).
    Collections(Vec<String>),
    /// The default bundle changed; any collection may be affected.
    Default,
}

impl KeyChange {
    /// Returns true unless [`KeyChange::Unchanged`].
    pub fn is_changed(&self) -> bool {
        !matches!(self, KeyChange::Unchanged)
    }

    /// Returns true if records in `collection` may be encrypted under a
    /// retired bundle and must be fetched and uploaded again.
    pub fn affects(&self, collection: &str) -> bool {
        match self {
            KeyChange::Unchanged => false,
            KeyChange::Collections(names) => names.iter().any(|name| name == collection),
            KeyChange::Default => true,
        }
    }

    /// Combines this change with one observed after it.
    pub fn merge(self, later: KeyChange) -> KeyChange {
        match (self, later) {
            (KeyChange::Default, _) | (_, KeyChange::Default) => KeyChange::Default,
            (KeyChange::Unchanged, change) | (change, KeyChange::Unchanged) => change,
            (KeyChange::Collections(mut names), KeyChange::Collections(more)) => {
                names.extend(more);
                names.sort();
                names.dedup();
                KeyChange::Collections(names)
            }
        }
    }
}

/// Cached collection keys with their server watermark.
#[derive(Debug, Clone, Default)]
pub struct CollectionKeys {
    last_modified: ServerTimestamp,
    default: Option<KeyBundle>,
    collections: BTreeMap<String, KeyBundle>,
}

impl CollectionKeys {
    /// Creates an empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a fresh random default bundle and one random bundle per
    /// named collection.
    pub fn new_keys<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            last_modified: ServerTimestamp::ZERO,
            default: Some(KeyBundle::generate_random()),
            collections: collections
                .into_iter()
                .map(|name| (name.into(), KeyBundle::generate_random()))
                .collect(),
        }
    }

    /// Generates fresh keys and returns them as a `crypto/keys` record
    /// encrypted under `root`, ready to upload.
    pub fn generate_new_keys_record<I, S>(collections: I, root: &KeyBundle) -> CryptoResult<EncryptedRecord>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut record = Self::new_keys(collections).as_record()?;
        record.encrypt(root)?;
        Ok(record)
    }

    /// Modification time of the installed `crypto/keys` record.
    pub fn last_modified(&self) -> ServerTimestamp {
        self.last_modified
    }

    /// The default bundle, if any.
    pub fn default_bundle(&self) -> Option<&KeyBundle> {
        self.default.as_ref()
    }

    /// Returns true if no keys are installed.
    pub fn is_clear(&self) -> bool {
        self.default.is_none()
    }

    /// Drops every bundle and the watermark.
    pub fn clear(&mut self) {
        info!("clearing collection keys");
        self.last_modified = ServerTimestamp::ZERO;
        self.default = None;
        self.collections.clear();
    }

    /// The bundle for `collection`, falling back to the default.
    pub fn key_for_collection(&self, collection: &str) -> Option<&KeyBundle> {
        self.collections.get(collection).or(self.default.as_ref())
    }

    /// Like [`key_for_collection`](Self::key_for_collection), but an error
    /// when no bundle applies.
    pub fn require_key_for(&self, collection: &str) -> CryptoResult<&KeyBundle> {
        self.key_for_collection(collection)
            .ok_or_else(|| CryptoError::MissingKeyBundle {
                collection: collection.to_string(),
            })
    }

    /// Returns true if the server's key record may be newer than ours.
    pub fn update_needed(&self, info: &InfoCollections) -> bool {
        if self.last_modified.is_zero() {
            return true;
        }
        match info.get(CRYPTO_COLLECTION) {
            Some(remote) => *remote > self.last_modified,
            None => true,
        }
    }

    /// The current contents in wire form.
    pub fn to_payload(&self) -> CryptoResult<CryptoKeysPayload> {
        let default = self.default.as_ref().ok_or(CryptoError::MissingDefaultKey)?;
        Ok(CryptoKeysPayload {
            id: KEYS_ID.to_string(),
            collection: CRYPTO_COLLECTION.to_string(),
            default: Some(default.key_pair()),
            collections: self
                .collections
                .iter()
                .map(|(name, bundle)| (name.clone(), bundle.key_pair()))
                .collect(),
        })
    }

    /// The current contents as an unencrypted `crypto/keys` record.
    pub fn as_record(&self) -> CryptoResult<EncryptedRecord> {
        let value = serde_json::to_value(self.to_payload()?)?;
        let cleartext: Cleartext = serde_json::from_value(value)?;
        Ok(EncryptedRecord::from_cleartext(cleartext))
    }

    /// Replaces the contents with `payload` and reports what changed.
    ///
    /// The watermark advances to `modified` even when nothing changed.
    ///
    /// # Errors
    ///
    /// Fails when `modified` is zero, when the payload has no default
    /// bundle, or when any bundle is malformed. The current contents are
    /// left untouched on error.
    pub fn set_contents(
        &mut self,
        payload: &CryptoKeysPayload,
        modified: ServerTimestamp,
    ) -> CryptoResult<KeyChange> {
        if modified.is_zero() {
            return Err(CryptoError::MissingTimestamp);
        }
        let default_pair = payload.default.as_ref().ok_or(CryptoError::MissingDefaultKey)?;

        let default = KeyBundle::from_key_pair(default_pair)?;
        let mut collections = BTreeMap::new();
        for (name, pair) in &payload.collections {
            collections.insert(name.clone(), KeyBundle::from_key_pair(pair)?);
        }

        let change = self.compare(&default, &collections);

        self.default = Some(default);
        self.collections = collections;
        self.last_modified = modified;

        match &change {
            KeyChange::Unchanged => debug!(%modified, "collection keys unchanged"),
            KeyChange::Collections(names) => {
                info!(%modified, collections = ?names, "collection keys changed")
            }
            KeyChange::Default => info!(%modified, "default collection key changed"),
        }
        Ok(change)
    }

    /// Decrypts a downloaded `crypto/keys` record with `root` and installs
    /// it. Decryption errors, including HMAC mismatches, are returned as-is.
    pub fn update_contents(
        &mut self,
        root: &KeyBundle,
        record: &mut EncryptedRecord,
    ) -> CryptoResult<KeyChange> {
        let modified = record.modified;
        let cleartext = record.decrypt(root)?;
        let payload: CryptoKeysPayload = serde_json::from_value(serde_json::to_value(cleartext)?)?;
        self.set_contents(&payload, modified)
    }

    fn compare(
        &self,
        default: &KeyBundle,
        collections: &BTreeMap<String, KeyBundle>,
    ) -> KeyChange {
        if self.default.as_ref() != Some(default) {
            return KeyChange::Default;
        }

        let mut changed = BTreeSet::new();
        for (name, bundle) in collections {
            if self.collections.get(name) != Some(bundle) {
                changed.insert(name.clone());
            }
        }
        for name in self.collections.keys() {
            if !collections.contains_key(name) {
                changed.insert(name.clone());
            }
        }

        if changed.is_empty() {
            KeyChange::Unchanged
        } else {
            KeyChange::Collections(changed.into_iter().collect())
        }
    }
}
