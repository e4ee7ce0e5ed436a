//! Durable job store for resumable slide uploads.
//!
//! The store persists every upload job, its chunk plan, and per-chunk
//! progress in an append-only checksummed log, so an upload interrupted by a
//! crash or power loss resumes from its last acknowledged chunk instead of
//! restarting from byte zero.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────┐
//! │           JobStore            │  state machine + in-memory tables
//! ├───────────────────────────────┤
//! │           QueueLog            │  checksummed record envelopes
//! ├───────────────────────────────┤
//! │        StorageBackend         │  FileBackend / InMemoryBackend
//! └───────────────────────────────┘
//! ```
//!
//! Every mutation is a typed [`record::LogRecord`] appended to the log
//! before the in-memory tables change. Opening a store replays the log; a
//! torn record at the tail is treated as end-of-log, and jobs left
//! mid-upload are parked as paused so they can be reselected.
//!
//! # Example
//!
//! ```no_run
//! use slidesync_store::{JobMetadata, JobStore};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), slidesync_store::StoreError> {
//! let store = JobStore::open(Path::new("sync/queue.log"))?;
//! let job_id = store.enqueue(Path::new("slides/case-041.svs"), 5, JobMetadata::new())?;
//! let chunk_count = store.record_chunk_plan(job_id, 5 * 1024 * 1024)?;
//! println!("{job_id}: {chunk_count} chunks");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod file;
pub mod log;
pub mod memory;
pub mod record;
pub mod store;
pub mod types;

pub use backend::StorageBackend;
pub use error::{StoreError, StoreResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use store::{JobStore, StoreConfig};
pub use types::{
    ChunkEntry, ChunkState, JobId, JobMetadata, JobRecord, JobState, ResumableJob, StateTotals,
    StatusSummary, StoredChunkPlan,
};
