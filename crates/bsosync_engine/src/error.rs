//! Error types for the sync engine.

use bsosync_crypto::CryptoError;
use bsosync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server answered with an error status.
    #[error("server error {status}: {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The server holds data in a newer format than this engine understands.
    #[error("engine version out of date: local={local}, remote={remote}")]
    VersionOutOfDate {
        /// Engine version.
        local: u32,
        /// Version recorded in `meta/global`.
        remote: u32,
    },

    /// Encryption, decryption or key error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Malformed wire data.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The local store refused an operation.
    #[error("store error: {0}")]
    Store(String),

    /// Downloading incoming records failed.
    #[error("download failed: {source}")]
    DownloadFailed {
        /// Underlying error.
        source: Box<SyncError>,
    },

    /// Uploading outgoing records failed.
    #[error("upload failed: {source}")]
    UploadFailed {
        /// Underlying error.
        source: Box<SyncError>,
    },

    /// A pass is already running on this engine.
    #[error("sync already in progress")]
    AlreadySyncing,

    /// Persisted sync state is unusable.
    #[error("sync state error: {0}")]
    State(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub(crate) fn download_failed(self) -> Self {
        Self::DownloadFailed {
            source: Box::new(self),
        }
    }

    pub(crate) fn upload_failed(self) -> Self {
        Self::UploadFailed {
            source: Box::new(self),
        }
    }

    /// Returns true if a later pass may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::ServerError { status, .. } => *status >= 500,
            SyncError::DownloadFailed { source } | SyncError::UploadFailed { source } => {
                source.is_retryable()
            }
            SyncError::AlreadySyncing => true,
            _ => false,
        }
    }

    /// Returns true if this is an HMAC mismatch, possibly wrapped.
    pub fn is_hmac_mismatch(&self) -> bool {
        match self {
            SyncError::Crypto(err) => err.is_hmac_mismatch(),
            SyncError::DownloadFailed { source } => source.is_hmac_mismatch(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::ServerError {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!SyncError::ServerError {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!SyncError::VersionOutOfDate { local: 1, remote: 2 }.is_retryable());
    }

    #[test]
    fn wrapped_errors_keep_retryability() {
        let err = SyncError::transport_retryable("reset").download_failed();
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("download failed"));

        let err = SyncError::transport_fatal("tls").upload_failed();
        assert!(!err.is_retryable());
    }

    #[test]
    fn hmac_mismatch_detection() {
        let err: SyncError = CryptoError::HmacMismatch {
            expected: "a".into(),
            computed: "b".into(),
        }
        .into();
        assert!(err.is_hmac_mismatch());
        assert!(!SyncError::AlreadySyncing.is_hmac_mismatch());
    }

    #[test]
    fn error_display() {
        let err = SyncError::VersionOutOfDate { local: 1, remote: 2 };
        assert_eq!(
            err.to_string(),
            "engine version out of date: local=1, remote=2"
        );
    }
}
