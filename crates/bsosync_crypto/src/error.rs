//! Error types for record crypto and key management.

use bsosync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised while encrypting, decrypting or managing keys.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The record's HMAC did not match the one computed locally.
    ///
    /// This usually means the record was written under a different key
    /// bundle. It is kept distinct from every other failure so callers can
    /// attempt key recovery.
    #[error("HMAC mismatch: expected {expected}, computed {computed}")]
    HmacMismatch {
        /// HMAC carried by the record.
        expected: String,
        /// HMAC computed from the ciphertext.
        computed: String,
    },

    /// Key material had the wrong length.
    #[error("invalid key size: got {actual} bytes, expected {expected}")]
    InvalidKeySize {
        /// Actual size.
        actual: usize,
        /// Required size.
        expected: usize,
    },

    /// Base64 decoding failed.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The cipher refused to encrypt.
    #[error("encryption failed")]
    EncryptionFailed,

    /// The ciphertext was malformed or did not authenticate.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// HKDF expansion failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// `decrypt` was called on a record with no ciphertext.
    #[error("no ciphertext for record {id}: nothing to decrypt")]
    NoCiphertext {
        /// Record ID.
        id: String,
    },

    /// `encrypt` was called on a record with no cleartext.
    #[error("no cleartext for record {id}: nothing to encrypt")]
    NoCleartext {
        /// Record ID.
        id: String,
    },

    /// The decrypted payload was valid JSON but not an object.
    #[error("decrypted payload of record {id} is not an object")]
    NotAnObject {
        /// Record ID.
        id: String,
    },

    /// The ID inside the cleartext does not match the envelope.
    #[error("record id mismatch: envelope {envelope}, cleartext {cleartext}")]
    IdMismatch {
        /// ID on the envelope.
        envelope: String,
        /// ID inside the decrypted payload.
        cleartext: String,
    },

    /// No key bundle is available for a collection.
    #[error("no key bundle for collection {collection}")]
    MissingKeyBundle {
        /// Collection name.
        collection: String,
    },

    /// A downloaded key set had no default bundle.
    #[error("no default key in collection keys; cannot proceed")]
    MissingDefaultKey,

    /// A key set was offered without a modification time.
    #[error("no modified time provided for collection keys")]
    MissingTimestamp,
}

impl CryptoError {
    /// Returns true for [`CryptoError::HmacMismatch`].
    pub fn is_hmac_mismatch(&self) -> bool {
        matches!(self, CryptoError::HmacMismatch { .. })
    }
}
