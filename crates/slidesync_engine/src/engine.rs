//! The top-level upload engine.

use crate::bandwidth::{BandwidthMonitor, BandwidthProbe, ChunkSizeTier};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::scheduler::Scheduler;
use crate::transport::RemoteStore;
use parking_lot::Mutex;
use slidesync_store::{JobId, JobMetadata, JobStore, StatusSummary};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Snapshot of engine state for external reporting.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Per-state job counts and byte totals.
    pub jobs: StatusSummary,
    /// The chunk size tier in effect for newly planned jobs.
    pub tier: ChunkSizeTier,
    /// Smoothed throughput estimate in Mbps, if any samples exist.
    pub estimate_mbps: Option<f64>,
    /// Whether the remote was reachable as of the latest sample.
    pub online: bool,
}

/// Offline-first upload engine: durable queue, adaptive chunking, and
/// background transfer workers.
///
/// All public methods are safe to call from any thread. Jobs enqueued here
/// survive restarts; re-creating the engine over the same store path picks
/// interrupted uploads back up from their last acknowledged chunk.
pub struct SyncEngine {
    scheduler: Arc<Scheduler>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Creates an engine over a store and a remote, with the real clock.
    pub fn new(store: JobStore, remote: Arc<dyn RemoteStore>, config: EngineConfig) -> Self {
        Self::with_clock(store, remote, config, Arc::new(SystemClock::new()))
    }

    /// Creates an engine with an explicit clock, for deterministic tests.
    pub fn with_clock(
        store: JobStore,
        remote: Arc<dyn RemoteStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let monitor = Arc::new(BandwidthMonitor::with_clock(
            config.bandwidth.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(store),
            remote,
            config,
            monitor,
            clock,
        ));
        Self {
            scheduler,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues an upload job and wakes the workers.
    pub fn enqueue(
        &self,
        source_path: &Path,
        priority: u8,
        metadata: JobMetadata,
    ) -> EngineResult<JobId> {
        let job_id = self.scheduler.store().enqueue(source_path, priority, metadata)?;
        self.scheduler.notify();
        Ok(job_id)
    }

    /// Cancels a job; a running transfer stops at the next chunk boundary.
    pub fn cancel(&self, job_id: JobId) -> EngineResult<()> {
        self.scheduler.cancel(job_id)
    }

    /// Current queue totals, chunk size tier, and connectivity.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            jobs: self.scheduler.store().query_status(),
            tier: self.scheduler.monitor().tier(),
            estimate_mbps: self.scheduler.monitor().estimate_mbps(),
            online: self.scheduler.is_online(),
        }
    }

    /// Feeds an explicit throughput measurement into the monitor.
    pub fn record_bandwidth_sample(&self, mbps: f64) {
        self.scheduler.monitor().record_mbps(mbps);
    }

    /// Runs a connectivity probe and returns the measured Mbps, or `None`
    /// when the probe found the remote unreachable.
    ///
    /// An offline result parks dispatch of fresh jobs until a later probe
    /// or transfer sees the link again.
    pub fn probe_bandwidth(&self, probe: &dyn BandwidthProbe) -> EngineResult<Option<f64>> {
        let sample = self.scheduler.monitor().record_probe(probe)?;
        Ok(sample.online.then_some(sample.mbps()))
    }

    /// Runs one transfer attempt synchronously.
    ///
    /// Intended for tests and single-shot tools; background operation uses
    /// [`SyncEngine::start`] instead.
    pub fn step(&self) -> EngineResult<bool> {
        self.scheduler.step()
    }

    /// Spawns background transfer workers, one per concurrency slot.
    ///
    /// Calling `start` twice is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        let count = self.scheduler.config().max_concurrent_transfers;
        tracing::info!(workers = count, "starting transfer workers");
        for _ in 0..count {
            let scheduler = Arc::clone(&self.scheduler);
            workers.push(std::thread::spawn(move || worker_loop(&scheduler)));
        }
    }

    /// Stops the workers, letting in-flight chunks finish, and joins them.
    pub fn shutdown(&self) {
        self.scheduler.request_stop();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            // A panicked worker has already logged its failure.
            let _ = worker.join();
        }
    }

    /// Direct access to the durable store, for status tooling.
    pub fn store(&self) -> &JobStore {
        self.scheduler.store()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

fn worker_loop(scheduler: &Scheduler) {
    while !scheduler.is_stopped() {
        match scheduler.step() {
            Ok(true) => {}
            Ok(false) => scheduler.wait(Duration::from_millis(100)),
            Err(error) => {
                tracing::error!(%error, "transfer step failed");
                scheduler.wait(Duration::from_millis(500));
            }
        }
    }
}
