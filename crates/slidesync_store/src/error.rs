//! Error types for the job store.

use crate::types::{ChunkState, JobId, JobState};
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the durable job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The job definition is invalid (unreadable source, zero size).
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The job is not present in the store.
    #[error("unknown job {0}")]
    UnknownJob(JobId),

    /// The chunk index is outside the job's chunk plan.
    #[error("unknown chunk {index} for job {job_id}")]
    UnknownChunk {
        /// Owning job.
        job_id: JobId,
        /// Requested chunk index.
        index: u32,
    },

    /// A chunk plan was already recorded for this job.
    #[error("chunk plan already recorded for job {0}")]
    AlreadyPlanned(JobId),

    /// The chunk plan has not been recorded yet.
    #[error("no chunk plan recorded for job {0}")]
    NotPlanned(JobId),

    /// The requested job state transition is not allowed.
    #[error("illegal job transition from {from:?} to {to:?}")]
    IllegalTransition {
        /// Current job state.
        from: JobState,
        /// Attempted target state.
        to: JobState,
    },

    /// The requested chunk state transition is not allowed.
    #[error("illegal chunk transition from {from:?} to {to:?} at index {index}")]
    IllegalChunkTransition {
        /// Current chunk state.
        from: ChunkState,
        /// Attempted target state.
        to: ChunkState,
        /// Chunk index.
        index: u32,
    },

    /// A chunk was acknowledged out of contiguous order.
    #[error("non-contiguous ack for job {job_id}: index {index}, highest acked {highest:?}")]
    NonContiguousAck {
        /// Owning job.
        job_id: JobId,
        /// Index that was acked.
        index: u32,
        /// Highest contiguously acked index before this call.
        highest: Option<u32>,
    },

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The record log is corrupted.
    #[error("record log corrupted: {0}")]
    Corrupted(String),

    /// The underlying storage is unavailable (disk full, lock lost).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns true if the error indicates the store itself is unusable,
    /// as opposed to a rejected request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_classification() {
        assert!(StoreError::Unavailable("disk full".into()).is_unavailable());
        assert!(StoreError::Io(io::Error::new(io::ErrorKind::Other, "x")).is_unavailable());
        assert!(!StoreError::InvalidJob("empty".into()).is_unavailable());
        assert!(!StoreError::corrupted("bad crc").is_unavailable());
    }

    #[test]
    fn error_display() {
        let err = StoreError::IllegalTransition {
            from: JobState::Completed,
            to: JobState::Uploading,
        };
        assert!(err.to_string().contains("Completed"));
        assert!(err.to_string().contains("Uploading"));
    }
}
