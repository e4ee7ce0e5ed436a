//! Request and response types exchanged with the remote slide store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Protocol version carried in every initiation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Opens (or re-opens) an upload session for a job.
///
/// Initiation is idempotent on `job_id`: a remote that already holds a
/// session for this job returns it, along with the next chunk index it
/// expects, instead of creating a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateRequest {
    /// Stable job identity, reused across re-initiations.
    pub job_id: Uuid,
    /// Protocol version.
    pub protocol_version: u16,
    /// Total size of the artifact in bytes.
    pub total_size: u64,
    /// Chunk size the client committed to.
    pub chunk_size: u64,
    /// Number of chunks in the plan.
    pub chunk_count: u32,
    /// Application metadata attached to the job.
    pub metadata: BTreeMap<String, String>,
}

impl InitiateRequest {
    /// Creates an initiation request for the given plan.
    pub fn new(
        job_id: Uuid,
        total_size: u64,
        chunk_size: u64,
        chunk_count: u32,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            job_id,
            protocol_version: PROTOCOL_VERSION,
            total_size,
            chunk_size,
            chunk_count,
            metadata,
        }
    }
}

/// Response to an [`InitiateRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateResponse {
    /// The session handle for subsequent chunk uploads.
    pub session: Uuid,
    /// The next chunk index the remote expects (0 for a fresh session).
    pub next_index: u32,
}

impl InitiateResponse {
    /// A brand-new session expecting the first chunk.
    pub fn fresh(session: Uuid) -> Self {
        Self {
            session,
            next_index: 0,
        }
    }

    /// An existing session resumed at the given index.
    pub fn resumed(session: Uuid, next_index: u32) -> Self {
        Self {
            session,
            next_index,
        }
    }
}

/// One chunk of artifact data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUploadRequest {
    /// Session the chunk belongs to.
    pub session: Uuid,
    /// Zero-based chunk index.
    pub index: u32,
    /// SHA-256 checksum of the payload.
    pub checksum: [u8; 32],
    /// The chunk bytes.
    pub payload: Vec<u8>,
}

impl ChunkUploadRequest {
    /// Creates a chunk upload carrying the given payload and checksum.
    pub fn new(session: Uuid, index: u32, checksum: [u8; 32], payload: Vec<u8>) -> Self {
        Self {
            session,
            index,
            checksum,
            payload,
        }
    }
}

/// Remote verdict on a single chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkUploadResponse {
    /// The chunk was verified and durably stored.
    Ack {
        /// The acknowledged chunk index.
        index: u32,
    },
    /// The chunk was refused and must be retransmitted.
    Reject {
        /// The rejected chunk index.
        index: u32,
        /// Why the chunk was refused.
        reason: String,
    },
}

impl ChunkUploadResponse {
    /// Creates an acknowledgement.
    pub fn ack(index: u32) -> Self {
        Self::Ack { index }
    }

    /// Creates a rejection with a reason.
    pub fn reject(index: u32, reason: impl Into<String>) -> Self {
        Self::Reject {
            index,
            reason: reason.into(),
        }
    }

    /// The chunk index this verdict refers to.
    pub fn index(&self) -> u32 {
        match self {
            Self::Ack { index } | Self::Reject { index, .. } => *index,
        }
    }

    /// True for an acknowledgement.
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack { .. })
    }
}

/// Asks the remote to assemble and commit the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    /// Session to finalize.
    pub session: Uuid,
    /// Merkle root over the ordered chunk checksums, computed locally.
    pub merkle_root: [u8; 32],
}

impl CompleteRequest {
    /// Creates a completion request with the client's integrity proof.
    pub fn new(session: Uuid, merkle_root: [u8; 32]) -> Self {
        Self {
            session,
            merkle_root,
        }
    }
}

/// Remote verdict on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompleteResponse {
    /// Roots matched; the artifact is committed remotely.
    Committed,
    /// Roots differed; nothing was committed.
    Mismatch {
        /// The root the remote computed over what it received.
        remote_root: [u8; 32],
    },
}

/// Queries the progress the remote holds for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusRequest {
    /// Session to query.
    pub session: Uuid,
}

/// Remote-side progress for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    /// The session queried.
    pub session: Uuid,
    /// The next chunk index the remote expects.
    pub next_index: u32,
}
