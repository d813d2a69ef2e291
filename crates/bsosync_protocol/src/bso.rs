//! The basic storage object and its encrypted payload.

use crate::error::{ProtocolError, ProtocolResult};
use crate::timestamp::ServerTimestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A basic storage object: the server's envelope for one record.
///
/// `payload` is an opaque JSON string as far as the server is concerned.
/// For encrypted collections it decodes to an [`EncryptedPayload`]; the
/// shared manifest stores its [`MetaGlobal`](crate::MetaGlobal) there in
/// the clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bso {
    /// Record ID, unique within its collection.
    pub id: String,
    /// Last modification time, assigned by the server.
    #[serde(default, skip_serializing_if = "ServerTimestamp::is_zero")]
    pub modified: ServerTimestamp,
    /// Ordering hint used by `sort=index` listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i64>,
    /// Time-to-live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    /// JSON-encoded payload.
    pub payload: String,
}

impl Bso {
    /// Creates an envelope by JSON-encoding `payload`.
    pub fn from_payload<T: Serialize>(id: impl Into<String>, payload: &T) -> ProtocolResult<Self> {
        Ok(Self {
            id: id.into(),
            modified: ServerTimestamp::ZERO,
            sortindex: None,
            ttl: None,
            payload: serde_json::to_string(payload)?,
        })
    }

    /// Decodes the payload string.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        serde_json::from_str(&self.payload)
            .map_err(|e| ProtocolError::invalid_payload(&self.id, e.to_string()))
    }

    /// Sets the sort index.
    pub fn with_sortindex(mut self, sortindex: i64) -> Self {
        self.sortindex = Some(sortindex);
        self
    }

    /// Sets the time-to-live.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// The encrypted form of a record payload.
///
/// `IV` and `ciphertext` are base64; `hmac` is the hex HMAC-SHA256 of the
/// base64 ciphertext string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Initialization vector (base64).
    #[serde(rename = "IV")]
    pub iv: String,
    /// Ciphertext (base64).
    pub ciphertext: String,
    /// HMAC over the ciphertext (hex).
    pub hmac: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_format() {
        let payload = EncryptedPayload {
            iv: "aXY=".into(),
            ciphertext: "Y3Q=".into(),
            hmac: "00ff".into(),
        };
        let bso = Bso::from_payload("rec1", &payload).unwrap().with_sortindex(7);
        let value = serde_json::to_value(&bso).unwrap();

        assert_eq!(value["id"], "rec1");
        assert_eq!(value["sortindex"], 7);
        assert!(value.get("modified").is_none());
        assert!(value.get("ttl").is_none());

        let inner: serde_json::Value =
            serde_json::from_str(value["payload"].as_str().unwrap()).unwrap();
        assert_eq!(inner, json!({"IV": "aXY=", "ciphertext": "Y3Q=", "hmac": "00ff"}));
    }

    #[test]
    fn parses_server_listing_entry() {
        let raw = r#"{"id":"abc","modified":1234.56,"payload":"{\"IV\":\"a\",\"ciphertext\":\"b\",\"hmac\":\"c\"}"}"#;
        let bso: Bso = serde_json::from_str(raw).unwrap();
        assert_eq!(bso.modified.as_millis(), 1_234_560);
        assert_eq!(bso.sortindex, None);

        let payload: EncryptedPayload = bso.decode_payload().unwrap();
        assert_eq!(payload.iv, "a");
    }

    #[test]
    fn bad_payload_names_the_record() {
        let bso = Bso {
            id: "broken".into(),
            modified: ServerTimestamp::ZERO,
            sortindex: None,
            ttl: None,
            payload: "not json".into(),
        };
        let err = bso.decode_payload::<EncryptedPayload>().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
