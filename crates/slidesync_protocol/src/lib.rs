//! Chunk transfer protocol for resumable slide uploads.
//!
//! This crate defines the pieces shared between the upload engine and any
//! remote slide store implementation:
//!
//! - [`ChunkPlan`] and [`ChunkReader`] divide a source file into fixed-size
//!   chunks and read them lazily
//! - [`chunk_checksum`] and [`merkle_root`] provide per-chunk and whole-file
//!   integrity over SHA-256
//! - [`messages`] holds the request/response types for session initiation,
//!   chunk upload, completion, and status queries
//!
//! The protocol is transport-agnostic: messages are plain serializable
//! types, and the engine drives them through a transport trait.

pub mod chunk;
pub mod error;
pub mod merkle;
pub mod messages;

pub use chunk::{chunk_checksum, ChunkPlan, ChunkReader};
pub use error::{ProtocolError, ProtocolResult};
pub use merkle::merkle_root;
pub use messages::{
    ChunkUploadRequest, ChunkUploadResponse, CompleteRequest, CompleteResponse, InitiateRequest,
    InitiateResponse, SessionStatusRequest, SessionStatusResponse, PROTOCOL_VERSION,
};
