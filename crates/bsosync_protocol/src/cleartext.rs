//! Decrypted logical records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The decrypted contents of a record.
///
/// Every cleartext carries its own `id`, which must match the envelope it
/// travelled in. A cleartext with `deleted` set is a tombstone. All other
/// fields belong to the data type and are kept as a JSON object, so two
/// cleartexts compare equal exactly when their JSON forms do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cleartext {
    /// Record ID.
    pub id: String,
    /// Tombstone marker.
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Data-type specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Cleartext {
    /// Creates an empty, live record.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: false,
            fields: Map::new(),
        }
    }

    /// Creates a tombstone for the given ID.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: true,
            fields: Map::new(),
        }
    }

    /// Adds a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns true if this record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }
}
