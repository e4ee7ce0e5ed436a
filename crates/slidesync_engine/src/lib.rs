//! Offline-first, resumable upload engine for whole-slide images.
//!
//! Scanners in the field produce multi-gigabyte slide files on links that
//! come and go. This crate moves those files to a remote slide store
//! without ever losing progress: every job and every chunk acknowledgment
//! is persisted through [`slidesync_store`] before the engine acts on it,
//! so a crash mid-transfer costs at most the chunk in flight.
//!
//! # Pieces
//!
//! - [`SyncEngine`] is the facade: enqueue, cancel, status, background
//!   workers
//! - [`Scheduler`] selects jobs by priority and applies retry backoff
//! - [`BandwidthMonitor`] adapts the chunk size to observed throughput
//! - [`RemoteStore`] abstracts the remote endpoint; [`InMemoryRemote`]
//!   and [`MockRemote`] serve tests
//!
//! # Example
//!
//! ```no_run
//! use slidesync_engine::{EngineConfig, InMemoryRemote, SyncEngine};
//! use slidesync_store::{JobMetadata, JobStore};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), slidesync_engine::EngineError> {
//! let store = JobStore::open(Path::new("sync/queue.log"))?;
//! let engine = SyncEngine::new(store, Arc::new(InMemoryRemote::new()), EngineConfig::default());
//!
//! engine.enqueue(Path::new("slides/case-041.svs"), 1, JobMetadata::new())?;
//! engine.start();
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;
mod transfer;
pub mod transport;

pub use bandwidth::{
    BandwidthMonitor, BandwidthProbe, BandwidthSample, ChunkSizeTier, ScriptedProbe,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BandwidthConfig, EngineConfig, RetryConfig};
pub use engine::{EngineStatus, SyncEngine};
pub use error::{EngineError, EngineResult, ErrorClass};
pub use scheduler::Scheduler;
pub use transport::{InMemoryRemote, MockRemote, RemoteStore};
