//! Error types and failure classification for the upload engine.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while driving uploads.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network or transport failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// The remote refused a request outright.
    #[error("remote rejected request: {0}")]
    RemoteRejected(String),

    /// Local and remote integrity proofs disagree at completion.
    #[error("integrity mismatch: local root {}, remote root {}", hex(.local), hex(.remote))]
    IntegrityMismatch {
        /// Merkle root computed locally from persisted chunk checksums.
        local: [u8; 32],
        /// Merkle root the remote computed over what it received.
        remote: [u8; 32],
    },

    /// The local machine lacks a resource the transfer needs.
    #[error("resource unavailable: {0}")]
    Resource(String),

    /// Error from the durable job store.
    #[error("store error: {0}")]
    Store(#[from] slidesync_store::StoreError),

    /// Error reading or planning chunks.
    #[error("chunk error: {0}")]
    Chunk(#[from] slidesync_protocol::ProtocolError),

    /// The transfer was cancelled by the caller.
    #[error("transfer cancelled")]
    Cancelled,

    /// The job exhausted its retry budget.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Total attempts made.
        attempts: u32,
        /// The error that ended the final attempt.
        last_error: String,
    },
}

impl EngineError {
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

    /// How the scheduler should react to this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport { retryable: true, .. } | Self::Timeout => ErrorClass::Transient,
            Self::IntegrityMismatch { .. } => ErrorClass::Integrity,
            Self::Resource(_) => ErrorClass::Resource,
            Self::Store(e) if e.is_unavailable() => ErrorClass::Resource,
            Self::Chunk(slidesync_protocol::ProtocolError::Io(_)) => ErrorClass::Resource,
            _ => ErrorClass::Terminal,
        }
    }

    /// True if the scheduler may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

/// Scheduler-facing classification of a transfer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Likely to succeed on retry; consumes the retry budget.
    Transient,
    /// Chunk progress must be discarded and re-verified.
    Integrity,
    /// A local condition (disk, lock, missing file access) that pausing
    /// does not consume the retry budget for.
    Resource,
    /// Retrying cannot help; the job fails.
    Terminal,
}

fn hex(bytes: &[u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
