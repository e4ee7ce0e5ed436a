//! Drives a single job's chunks to the remote store.

use crate::bandwidth::BandwidthMonitor;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::transport::RemoteStore;
use parking_lot::Mutex;
use slidesync_protocol::{
    chunk_checksum, merkle_root, ChunkPlan, ChunkReader, ChunkUploadRequest, ChunkUploadResponse,
    CompleteRequest, CompleteResponse, InitiateRequest, SessionStatusRequest,
};
use slidesync_store::{ChunkState, JobId, JobState, JobStore, StoreError, StoredChunkPlan};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use uuid::Uuid;

/// Pending cancellation requests, checked at chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct CancelSet {
    inner: Mutex<HashSet<JobId>>,
}

impl CancelSet {
    pub(crate) fn request(&self, job_id: JobId) {
        self.inner.lock().insert(job_id);
    }

    /// Consumes a pending request for this job, if any.
    pub(crate) fn take(&self, job_id: JobId) -> bool {
        self.inner.lock().remove(&job_id)
    }
}

/// How a transfer attempt ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferOutcome {
    /// Every chunk acked and the remote committed the artifact.
    Completed,
    /// Interrupted by shutdown; the job is paused for a later resume.
    Interrupted,
    /// Gave the slot back at a chunk boundary so a more urgent job can
    /// run; the job stays `Uploading` and is reselected later.
    Yielded,
}

/// Runs one attempt at one job: plan, initiate, send, finalize.
///
/// The driver never loops on job-level failures; it surfaces the first
/// error and leaves retry policy to the scheduler. Within the attempt it
/// does handle per-chunk rejections, retransmitting up to the configured
/// limit. Between chunks it consults `preempt`; a true answer hands the
/// concurrency slot back so an urgent arrival waits at most one chunk.
pub(crate) struct TransferDriver<'a> {
    pub store: &'a JobStore,
    pub remote: &'a dyn RemoteStore,
    pub config: &'a EngineConfig,
    pub monitor: &'a BandwidthMonitor,
    pub cancels: &'a CancelSet,
    pub stop: &'a AtomicBool,
    pub preempt: &'a dyn Fn(JobId) -> bool,
}

impl TransferDriver<'_> {
    pub(crate) fn run(&self, job_id: JobId) -> EngineResult<TransferOutcome> {
        let job = self.store.get_job(job_id)?;
        match job.state {
            JobState::Queued | JobState::Paused => {
                self.store.advance_job_state(job_id, JobState::Uploading)?;
            }
            JobState::Uploading => {}
            from => {
                return Err(EngineError::Store(StoreError::IllegalTransition {
                    from,
                    to: JobState::Uploading,
                }))
            }
        }
        self.drive(job_id)
    }

    fn drive(&self, job_id: JobId) -> EngineResult<TransferOutcome> {
        let job = self.store.get_job(job_id)?;

        // The plan is fixed on first contact and never recomputed; tier
        // changes only affect jobs planned afterwards.
        let stored = match job.plan {
            Some(plan) => plan,
            None => {
                let chunk_size = self.monitor.tier().chunk_size();
                let chunk_count = self.store.record_chunk_plan(job_id, chunk_size)?;
                StoredChunkPlan {
                    chunk_size,
                    chunk_count,
                }
            }
        };
        let plan = ChunkPlan::new(job.total_size, stored.chunk_size)?;
        let mut reader = ChunkReader::open(&job.source_path, plan)?;

        let session = self.establish_session(job_id, &stored)?;

        let status = self.remote.session_status(SessionStatusRequest { session })?;
        let local_resume = self.store.get_job(job_id)?.resume_index();
        // If the remote is behind our ack record, re-send what it is
        // missing; if it is ahead, our sends are acked idempotently.
        let start = local_resume.min(status.next_index);
        if start < local_resume {
            tracing::info!(
                %job_id,
                local_resume,
                remote_next = status.next_index,
                "remote is behind local ack record, re-sending"
            );
        }

        for index in start..stored.chunk_count {
            if self.cancels.take(job_id) {
                self.store.fail_job(job_id, "cancelled")?;
                return Err(EngineError::Cancelled);
            }
            if self.stop.load(Ordering::SeqCst) {
                self.store.pause_job(job_id, "engine shutdown")?;
                return Ok(TransferOutcome::Interrupted);
            }
            if (self.preempt)(job_id) {
                tracing::debug!(%job_id, index, "yielding slot to a more urgent job");
                return Ok(TransferOutcome::Yielded);
            }
            self.send_chunk(&mut reader, job_id, session, index)?;
        }

        // A cancel that lands after the last chunk boundary must still win
        // over finalization.
        if self.cancels.take(job_id) {
            self.store.fail_job(job_id, "cancelled")?;
            return Err(EngineError::Cancelled);
        }

        self.finalize(job_id, session)
    }

    /// Opens the remote session, reusing a persisted one when present.
    ///
    /// If the remote hands back a session other than the one we persisted,
    /// it has lost ours; all progress it was tracking is gone, so local
    /// chunk progress is discarded and the new session adopted.
    fn establish_session(&self, job_id: JobId, stored: &StoredChunkPlan) -> EngineResult<Uuid> {
        let job = self.store.get_job(job_id)?;
        let request = InitiateRequest::new(
            Uuid::from_bytes(job_id.as_bytes()),
            job.total_size,
            stored.chunk_size,
            stored.chunk_count,
            job.metadata.clone(),
        );
        let response = self.remote.initiate(request)?;

        if let Some(existing) = job.upload_session {
            if existing != response.session {
                tracing::warn!(
                    %job_id,
                    "remote no longer holds our session, restarting transfer"
                );
                self.store.reset_chunk_progress(job_id)?;
            }
        }
        Ok(self.store.open_session(job_id, response.session)?)
    }

    fn send_chunk(
        &self,
        reader: &mut ChunkReader,
        job_id: JobId,
        session: Uuid,
        index: u32,
    ) -> EngineResult<()> {
        let payload = reader.read_chunk(index)?;
        let checksum = chunk_checksum(&payload);

        let mut retransmits = 0;
        loop {
            let state = self.chunk_state(job_id, index)?;
            let already_acked = state == ChunkState::Acked;
            if !already_acked && state != ChunkState::Sent {
                self.store.mark_chunk_sent(job_id, index, checksum)?;
            }

            let started = Instant::now();
            let verdict = self.remote.upload_chunk(ChunkUploadRequest::new(
                session,
                index,
                checksum,
                payload.clone(),
            ))?;

            match verdict {
                ChunkUploadResponse::Ack { .. } => {
                    if !already_acked {
                        self.store.mark_chunk_acked(job_id, index)?;
                    }
                    self.monitor
                        .record_transfer(payload.len() as u64, started.elapsed());
                    return Ok(());
                }
                ChunkUploadResponse::Reject { reason, .. } => {
                    if !already_acked {
                        self.store.mark_chunk_rejected(job_id, index)?;
                    }
                    retransmits += 1;
                    if retransmits > self.config.max_chunk_retransmits {
                        return Err(EngineError::transport_retryable(format!(
                            "chunk {index} rejected {retransmits} times: {reason}"
                        )));
                    }
                    tracing::debug!(%job_id, index, %reason, "retransmitting rejected chunk");
                }
            }
        }
    }

    fn finalize(&self, job_id: JobId, session: Uuid) -> EngineResult<TransferOutcome> {
        let job = self.store.get_job(job_id)?;
        let checksums = job
            .ordered_checksums()
            .ok_or_else(|| StoreError::corrupted("chunk checksums incomplete at completion"))?;
        let local = merkle_root(&checksums)
            .ok_or_else(|| StoreError::corrupted("completion with no chunks"))?;

        match self.remote.complete(CompleteRequest::new(session, local))? {
            CompleteResponse::Committed => {
                self.store.advance_job_state(job_id, JobState::Completed)?;
                tracing::info!(%job_id, "upload committed");
                Ok(TransferOutcome::Completed)
            }
            CompleteResponse::Mismatch { remote_root } => Err(EngineError::IntegrityMismatch {
                local,
                remote: remote_root,
            }),
        }
    }

    fn chunk_state(&self, job_id: JobId, index: u32) -> EngineResult<ChunkState> {
        let job = self.store.get_job(job_id)?;
        let chunk = job
            .chunks
            .get(index as usize)
            .ok_or(StoreError::UnknownChunk { job_id, index })?;
        Ok(chunk.state)
    }
}
