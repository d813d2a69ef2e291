//! Server-authoritative timestamps.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A timestamp issued by the storage server.
///
/// Stored as integer milliseconds. On the wire it is decimal seconds with
/// two fractional digits (`1326254123.12`), which is also what the
/// `newer`/`older` query parameters expect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerTimestamp(i64);

impl ServerTimestamp {
    /// The zero timestamp ("never synced").
    pub const ZERO: ServerTimestamp = ServerTimestamp(0);

    /// Creates a timestamp from milliseconds. Negative values clamp to zero.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis.max(0))
    }

    /// Parses decimal seconds as sent by the server.
    pub fn from_seconds(seconds: f64) -> ProtocolResult<Self> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ProtocolError::InvalidTimestamp(seconds.to_string()));
        }
        let millis = (seconds * 1000.0).round();
        if millis > i64::MAX as f64 {
            return Err(ProtocolError::InvalidTimestamp(seconds.to_string()));
        }
        Ok(Self(millis as i64))
    }

    /// Returns the timestamp in milliseconds.
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns the timestamp as decimal seconds.
    pub fn as_seconds(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Returns true for the zero timestamp.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Milliseconds elapsed from `self` until `now`; negative if `self` is
    /// in the future relative to `now`.
    pub fn age_at(&self, now: ServerTimestamp) -> i64 {
        now.0 - self.0
    }
}

impl fmt::Display for ServerTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 1000, (self.0 % 1000) / 10)
    }
}

impl Serialize for ServerTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_seconds())
    }
}

impl<'de> Deserialize<'de> for ServerTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        ServerTimestamp::from_seconds(seconds).map_err(serde::de::Error::custom)
    }
}
