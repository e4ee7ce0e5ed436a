//! Job selection, retry policy, and backoff timing.

use crate::bandwidth::BandwidthMonitor;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorClass};
use crate::transfer::{CancelSet, TransferDriver, TransferOutcome};
use crate::transport::RemoteStore;
use parking_lot::{Condvar, Mutex};
use slidesync_store::{JobId, JobState, JobStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Selects jobs, drives transfers, and applies the retry policy.
///
/// Selection order is priority ascending (1 is most urgent), with enqueue
/// order breaking ties, over all queued and paused jobs whose backoff
/// deadline has passed. A running transfer yields its slot at a chunk
/// boundary when a strictly more urgent job becomes eligible, so an
/// urgent arrival waits at most one in-flight chunk per slot.
/// [`Scheduler::step`] performs one transfer attempt synchronously, which
/// is also how tests drive the engine deterministically; background
/// operation is just worker threads calling `step` in a loop.
pub struct Scheduler {
    store: Arc<JobStore>,
    remote: Arc<dyn RemoteStore>,
    config: EngineConfig,
    monitor: Arc<BandwidthMonitor>,
    clock: Arc<dyn Clock>,
    cancels: CancelSet,
    stop: AtomicBool,
    in_flight: Mutex<HashSet<JobId>>,
    // Jobs under backoff may not be reselected before this clock reading.
    deadlines: Mutex<HashMap<JobId, u64>>,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl Scheduler {
    pub(crate) fn new(
        store: Arc<JobStore>,
        remote: Arc<dyn RemoteStore>,
        config: EngineConfig,
        monitor: Arc<BandwidthMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            remote,
            config,
            monitor,
            clock,
            cancels: CancelSet::default(),
            stop: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            deadlines: Mutex::new(HashMap::new()),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Runs one transfer attempt on the most urgent eligible job.
    ///
    /// Returns `Ok(false)` when no job is eligible. A job that pauses or
    /// fails during the attempt still counts as work done; only store-level
    /// errors surface as `Err`.
    pub fn step(&self) -> EngineResult<bool> {
        let Some(job_id) = self.claim_next() else {
            return Ok(false);
        };

        let preempt = |id: JobId| self.should_preempt(id);
        let driver = TransferDriver {
            store: &self.store,
            remote: self.remote.as_ref(),
            config: &self.config,
            monitor: &self.monitor,
            cancels: &self.cancels,
            stop: &self.stop,
            preempt: &preempt,
        };
        let result = driver.run(job_id);
        let settled = self.settle(job_id, result);
        self.in_flight.lock().remove(&job_id);
        // A cancel that raced with the terminal transition has nothing
        // left to stop; drop it so the entry cannot linger.
        if self
            .store
            .get_job(job_id)
            .is_ok_and(|job| job.state.is_terminal())
        {
            self.cancels.take(job_id);
        }
        settled?;
        Ok(true)
    }

    /// Cancels a job.
    ///
    /// A job mid-transfer is stopped at the next chunk boundary; a waiting
    /// job fails immediately. Cancelling a terminal job is a no-op.
    pub fn cancel(&self, job_id: JobId) -> EngineResult<()> {
        if self.in_flight.lock().contains(&job_id) {
            self.cancels.request(job_id);
            return Ok(());
        }
        let job = self.store.get_job(job_id)?;
        if job.state.is_terminal() {
            return Ok(());
        }
        self.store.fail_job(job_id, "cancelled")?;
        self.deadlines.lock().remove(&job_id);
        Ok(())
    }

    /// Whether the remote was reachable as of the latest sample.
    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Signals worker threads to stop after their current chunk.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify();
    }

    /// True once a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Wakes any worker threads waiting for new work.
    pub fn notify(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    /// Blocks until notified or the timeout elapses.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut guard = self.wake_lock.lock();
        self.wake.wait_for(&mut guard, timeout);
    }

    pub(crate) fn store(&self) -> &JobStore {
        &self.store
    }

    pub(crate) fn monitor(&self) -> &BandwidthMonitor {
        &self.monitor
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn claim_next(&self) -> Option<JobId> {
        let now = self.clock.now_ms();
        let online = self.monitor.is_online();
        let deadlines = self.deadlines.lock();
        let mut in_flight = self.in_flight.lock();

        for candidate in self.store.list_resumable_jobs() {
            let job_id = candidate.job.id;
            if in_flight.contains(&job_id) {
                continue;
            }
            let deadline = deadlines.get(&job_id).copied();
            if deadline.is_some_and(|not_before| now < not_before) {
                continue;
            }
            // While the link is down, fresh work stays parked. A due retry
            // still goes out and doubles as the connectivity check, and a
            // yielded mid-session job keeps its claim on the slot.
            if !online && deadline.is_none() && candidate.job.state != JobState::Uploading {
                continue;
            }
            in_flight.insert(job_id);
            return Some(job_id);
        }
        None
    }

    /// True when a strictly more urgent job is eligible to run right now.
    ///
    /// Checked by the driver between chunks; only queued or paused jobs
    /// past their backoff deadline count, so yielding always hands the
    /// slot to a job the next claim will actually pick.
    fn should_preempt(&self, current: JobId) -> bool {
        let Ok(job) = self.store.get_job(current) else {
            return false;
        };
        let now = self.clock.now_ms();
        let deadlines = self.deadlines.lock();
        let in_flight = self.in_flight.lock();

        self.store.list_resumable_jobs().into_iter().any(|candidate| {
            candidate.job.priority < job.priority
                && candidate.job.id != current
                && !in_flight.contains(&candidate.job.id)
                && matches!(candidate.job.state, JobState::Queued | JobState::Paused)
                && !deadlines
                    .get(&candidate.job.id)
                    .is_some_and(|&not_before| now < not_before)
        })
    }

    fn settle(&self, job_id: JobId, result: EngineResult<TransferOutcome>) -> EngineResult<()> {
        match result {
            Ok(TransferOutcome::Completed) => {
                // Commitment proves reachability even when no chunk timing
                // produced a usable sample.
                self.monitor.note_online();
                self.deadlines.lock().remove(&job_id);
                Ok(())
            }
            Ok(TransferOutcome::Interrupted) => Ok(()),
            // The job stays Uploading and is reselected once nothing more
            // urgent is waiting; wake an idle worker for the urgent job.
            Ok(TransferOutcome::Yielded) => {
                self.notify();
                Ok(())
            }
            // The driver already failed the job on cancellation.
            Err(EngineError::Cancelled) => {
                self.deadlines.lock().remove(&job_id);
                Ok(())
            }
            Err(error) => self.handle_failure(job_id, error),
        }
    }

    fn handle_failure(&self, job_id: JobId, error: EngineError) -> EngineResult<()> {
        let message = error.to_string();
        match error.class() {
            ErrorClass::Transient => {
                self.monitor.record_offline();
                self.retry_or_fail(job_id, &message)
            }
            ErrorClass::Integrity => {
                // The mismatch cannot be localized to one chunk; discard
                // everything and re-verify from scratch on the next attempt.
                self.store.reset_chunk_progress(job_id)?;
                self.retry_or_fail(job_id, &message)
            }
            ErrorClass::Resource => {
                // Local conditions (disk, locks) are not the network's
                // fault and do not consume the retry budget.
                tracing::warn!(%job_id, %message, "pausing on local resource error");
                self.store.pause_job(job_id, message)?;
                self.set_deadline(job_id, self.config.retry.initial_delay);
                Ok(())
            }
            ErrorClass::Terminal => {
                tracing::error!(%job_id, %message, "job failed terminally");
                self.deadlines.lock().remove(&job_id);
                self.store.fail_job(job_id, message)?;
                Ok(())
            }
        }
    }

    fn retry_or_fail(&self, job_id: JobId, message: &str) -> EngineResult<()> {
        let attempt = self.store.record_retry(job_id, message)?;
        if attempt > self.config.retry.max_attempts {
            tracing::error!(%job_id, attempt, "retry budget exhausted");
            self.deadlines.lock().remove(&job_id);
            self.store.fail_job(
                job_id,
                format!("retry budget exhausted after {attempt} attempts: {message}"),
            )?;
            return Ok(());
        }

        let delay = self.config.retry.delay_for_attempt(attempt);
        tracing::info!(%job_id, attempt, ?delay, %message, "pausing for retry");
        self.store.pause_job(job_id, message)?;
        self.set_deadline(job_id, delay);
        Ok(())
    }

    fn set_deadline(&self, job_id: JobId, delay: Duration) {
        let not_before = self.clock.now_ms() + delay.as_millis() as u64;
        self.deadlines.lock().insert(job_id, not_before);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("in_flight", &self.in_flight.lock().len())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
