//! The shared manifest (`meta/global`).

use crate::bso::Bso;
use crate::error::ProtocolResult;
use crate::GLOBAL_ID;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The manifest shared by every client of an account.
///
/// Each engine records the format version and lineage identifier
/// (`syncID`) its collection was written with. A client compares these
/// against its own before touching the collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaGlobal {
    /// Account-wide lineage identifier.
    #[serde(rename = "syncID", default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<String>,
    /// Storage format version.
    #[serde(
        rename = "storageVersion",
        alias = "version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub storage_version: Option<u32>,
    /// Per-engine version and lineage.
    #[serde(default)]
    pub engines: BTreeMap<String, EngineMeta>,
}

/// Per-engine entry in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMeta {
    /// Record format version the collection was written with.
    #[serde(default)]
    pub version: u32,
    /// Lineage identifier of the collection.
    #[serde(rename = "syncID", default)]
    pub sync_id: String,
}

impl MetaGlobal {
    /// Returns the entry for an engine; a missing entry reads as version 0.
    pub fn engine(&self, name: &str) -> EngineMeta {
        self.engines.get(name).cloned().unwrap_or_default()
    }

    /// Replaces the entry for an engine.
    pub fn set_engine(&mut self, name: impl Into<String>, version: u32, sync_id: impl Into<String>) {
        self.engines.insert(
            name.into(),
            EngineMeta {
                version,
                sync_id: sync_id.into(),
            },
        );
    }

    /// Wraps the manifest in its (unencrypted) envelope.
    pub fn to_bso(&self) -> ProtocolResult<Bso> {
        Bso::from_payload(GLOBAL_ID, self)
    }

    /// Reads the manifest out of its envelope.
    pub fn from_bso(bso: &Bso) -> ProtocolResult<Self> {
        bso.decode_payload()
    }
}
