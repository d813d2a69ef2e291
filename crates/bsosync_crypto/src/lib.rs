//! # BSOSync Crypto
//!
//! Record encryption and collection key management.
//!
//! ## Security Model
//!
//! - Each record payload is encrypted with AES-256-GCM under a fresh
//!   random IV
//! - The base64 ciphertext is authenticated with HMAC-SHA256 under a
//!   separate key; the HMAC is always verified before decrypting
//! - Keys come in bundles (encryption key + HMAC key), either derived from
//!   a root secret with HKDF-SHA256 or generated randomly per collection
//! - Per-collection bundles travel in the `crypto/keys` record, itself
//!   encrypted under the root bundle
//! - Key material is zeroized on drop
//!
//! ## Usage
//!
//! ```ignore
//! use bsosync_crypto::{EncryptedRecord, KeyBundle};
//! use bsosync_protocol::Cleartext;
//!
//! let bundle = KeyBundle::generate_random();
//! let mut record = EncryptedRecord::from_cleartext(Cleartext::new("abc"));
//! record.encrypt(&bundle)?;
//! let bso = record.to_bso()?;
//!
//! let mut incoming = EncryptedRecord::from_bso(&bso)?;
//! let cleartext = incoming.decrypt(&bundle)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod collection_keys;
mod error;
mod key_bundle;
mod record;

pub use collection_keys::{CollectionKeys, CryptoKeysPayload, KeyChange};
pub use error::{CryptoError, CryptoResult};
pub use key_bundle::{KeyBundle, IV_SIZE, KEY_SIZE, TAG_SIZE};
pub use record::EncryptedRecord;
