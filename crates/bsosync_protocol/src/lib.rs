//! # BSOSync Protocol
//!
//! Wire types for the BSOSync storage protocol.
//!
//! This crate provides:
//! - `Bso`, the server-side envelope for one record
//! - `EncryptedPayload` and `Cleartext`, the two payload representations
//! - `MetaGlobal`, the shared manifest consulted at sync startup
//! - `CollectionQuery` for listing requests
//! - `UploadResponse` and `CollectionPage` for server responses
//! - `ServerTimestamp`, the server-authoritative clock
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bso;
mod cleartext;
mod error;
mod messages;
mod meta;
mod query;
mod timestamp;

pub use bso::{Bso, EncryptedPayload};
pub use cleartext::Cleartext;
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{CollectionPage, InfoCollections, UploadResponse};
pub use meta::{EngineMeta, MetaGlobal};
pub use query::{CollectionQuery, SortOrder};
pub use timestamp::ServerTimestamp;

/// Collection holding the encrypted collection keys.
pub const CRYPTO_COLLECTION: &str = "crypto";
/// Record ID of the collection keys inside [`CRYPTO_COLLECTION`].
pub const KEYS_ID: &str = "keys";
/// Collection holding the shared manifest.
pub const META_COLLECTION: &str = "meta";
/// Record ID of the shared manifest inside [`META_COLLECTION`].
pub const GLOBAL_ID: &str = "global";
/// Storage format version written into fresh manifests.
pub const STORAGE_VERSION: u32 = 5;
