//! Error types for the chunk transfer protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors from chunk planning and chunk reads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A chunk plan could not be constructed from the given parameters.
    #[error("invalid chunk plan: {0}")]
    InvalidPlan(String),

    /// A chunk index is outside the plan.
    #[error("chunk index {index} out of range (plan has {count} chunks)")]
    ChunkOutOfRange {
        /// The requested index.
        index: u32,
        /// The number of chunks in the plan.
        count: u32,
    },

    /// The source file no longer matches the size the plan was built for.
    #[error("source size changed: plan expects {expected} bytes, file has {actual}")]
    SizeMismatch {
        /// Size the plan was built for.
        expected: u64,
        /// Size observed on disk.
        actual: u64,
    },

    /// An I/O error while reading chunk data.
    #[error("chunk read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_format_with_context() {
        let err = ProtocolError::ChunkOutOfRange { index: 7, count: 4 };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains('4'));

        let err = ProtocolError::SizeMismatch {
            expected: 100,
            actual: 90,
        };
        assert!(err.to_string().contains("100"));
    }
}
