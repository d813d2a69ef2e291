//! Encrypted records.
//!
//! An [`EncryptedRecord`] holds exactly one of two representations at a
//! time: the decrypted [`Cleartext`] or the [`EncryptedPayload`] that goes
//! on the wire. Encrypting drops the cleartext; decrypting drops the
//! payload.

use crate::error::{CryptoError, CryptoResult};
use crate::key_bundle::KeyBundle;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bsosync_protocol::{Bso, Cleartext, EncryptedPayload, ServerTimestamp};
use serde_json::Value;
use tracing::trace;

/// A record in transit between the store and the server.
#[derive(Debug, Clone)]
pub struct EncryptedRecord {
    /// Record ID.
    pub id: String,
    /// Server modification time; zero for records not yet uploaded.
    pub modified: ServerTimestamp,
    /// Server-side sort hint.
    pub sortindex: Option<i64>,
    /// Time-to-live in seconds.
    pub ttl: Option<u32>,
    cleartext: Option<Cleartext>,
    payload: Option<EncryptedPayload>,
}

impl EncryptedRecord {
    /// Wraps a cleartext produced locally.
    pub fn from_cleartext(cleartext: Cleartext) -> Self {
        Self {
            id: cleartext.id.clone(),
            modified: ServerTimestamp::ZERO,
            sortindex: None,
            ttl: None,
            cleartext: Some(cleartext),
            payload: None,
        }
    }

    /// Parses a downloaded envelope.
    ///
    /// # Errors
    ///
    /// Fails if the payload is not an `{IV, ciphertext, hmac}` object.
    pub fn from_bso(bso: &Bso) -> CryptoResult<Self> {
        let payload: EncryptedPayload = bso.decode_payload()?;
        Ok(Self {
            id: bso.id.clone(),
            modified: bso.modified,
            sortindex: bso.sortindex,
            ttl: bso.ttl,
            cleartext: None,
            payload: Some(payload),
        })
    }

    /// Builds the wire envelope. The record must be encrypted.
    pub fn to_bso(&self) -> CryptoResult<Bso> {
        let payload = self.payload.as_ref().ok_or_else(|| CryptoError::NoCiphertext {
            id: self.id.clone(),
        })?;

        let mut bso = Bso::from_payload(self.id.clone(), payload)?;
        bso.modified = self.modified;
        bso.sortindex = self.sortindex;
        bso.ttl = self.ttl;
        Ok(bso)
    }

    /// The decrypted representation, if present.
    pub fn cleartext(&self) -> Option<&Cleartext> {
        self.cleartext.as_ref()
    }

    /// The encrypted representation, if present.
    pub fn payload(&self) -> Option<&EncryptedPayload> {
        self.payload.as_ref()
    }

    /// Consumes the record, returning its cleartext.
    pub fn into_cleartext(self) -> Option<Cleartext> {
        self.cleartext
    }

    /// Renames the record, keeping the cleartext `id` in step.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
        if let Some(cleartext) = self.cleartext.as_mut() {
            cleartext.id = self.id.clone();
        }
    }

    /// Encrypts the cleartext under `bundle` and discards it.
    pub fn encrypt(&mut self, bundle: &KeyBundle) -> CryptoResult<()> {
        let cleartext = self.cleartext.as_ref().ok_or_else(|| CryptoError::NoCleartext {
            id: self.id.clone(),
        })?;

        let json = serde_json::to_vec(cleartext)?;
        let (iv, ciphertext) = bundle.encrypt(&json)?;
        let ciphertext = STANDARD.encode(ciphertext);
        let hmac = bundle.hmac_hex(ciphertext.as_bytes())?;

        self.payload = Some(EncryptedPayload {
            iv: STANDARD.encode(iv),
            ciphertext,
            hmac,
        });
        self.cleartext = None;

        trace!(id = %self.id, "record encrypted");
        Ok(())
    }

    /// Verifies and decrypts the payload under `bundle`.
    ///
    /// The HMAC is checked before anything else; a mismatch is reported as
    /// [`CryptoError::HmacMismatch`]. On success the payload is discarded.
    pub fn decrypt(&mut self, bundle: &KeyBundle) -> CryptoResult<&Cleartext> {
        let payload = self.payload.as_ref().ok_or_else(|| CryptoError::NoCiphertext {
            id: self.id.clone(),
        })?;

        bundle.verify_hmac(payload.ciphertext.as_bytes(), &payload.hmac)?;

        let iv = STANDARD.decode(&payload.iv)?;
        let ciphertext = STANDARD.decode(&payload.ciphertext)?;
        let plaintext = bundle.decrypt(&iv, &ciphertext)?;

        let value: Value = serde_json::from_slice(&plaintext)?;
        if !value.is_object() {
            return Err(CryptoError::NotAnObject {
                id: self.id.clone(),
            });
        }
        let cleartext: Cleartext = serde_json::from_value(value)?;
        if cleartext.id != self.id {
            return Err(CryptoError::IdMismatch {
                envelope: self.id.clone(),
                cleartext: cleartext.id,
            });
        }

        self.payload = None;
        trace!(id = %self.id, "record decrypted");
        Ok(self.cleartext.insert(cleartext))
    }
}
