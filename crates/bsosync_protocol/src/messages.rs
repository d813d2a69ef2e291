//! Server responses.

use crate::bso::Bso;
use crate::timestamp::ServerTimestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Last-modified time of every collection (`info/collections`).
pub type InfoCollections = BTreeMap<String, ServerTimestamp>;

/// Response to a batch upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Server time at which the batch was stored.
    #[serde(default)]
    pub modified: ServerTimestamp,
    /// IDs the server stored.
    #[serde(default)]
    pub success: Vec<String>,
    /// IDs the server refused, with reasons.
    #[serde(default)]
    pub failed: BTreeMap<String, Vec<String>>,
}

impl UploadResponse {
    /// Creates a response in which every ID succeeded.
    pub fn all_succeeded(modified: ServerTimestamp, ids: Vec<String>) -> Self {
        Self {
            modified,
            success: ids,
            failed: BTreeMap::new(),
        }
    }

    /// Returns the refused IDs.
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.keys().map(String::as_str).collect()
    }

    /// Returns true if nothing was refused.
    pub fn is_fully_successful(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One page of records fetched from a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionPage {
    /// The records, in server order.
    pub records: Vec<Bso>,
    /// The server's clock at the time of the response.
    pub server_time: ServerTimestamp,
}

impl CollectionPage {
    /// Creates a page.
    pub fn new(records: Vec<Bso>, server_time: ServerTimestamp) -> Self {
        Self {
            records,
            server_time,
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the page holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Newest modification time among the records.
    pub fn max_modified(&self) -> Option<ServerTimestamp> {
        self.records.iter().map(|r| r.modified).max()
    }
}
