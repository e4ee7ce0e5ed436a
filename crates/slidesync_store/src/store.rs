//! The durable job store: the sole source of truth after a restart.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use crate::file::FileBackend;
use crate::log::QueueLog;
use crate::memory::InMemoryBackend;
use crate::record::LogRecord;
use crate::types::{
    ChunkEntry, ChunkState, JobId, JobMetadata, JobRecord, JobState, ResumableJob, StatusSummary,
    StoredChunkPlan,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Configuration for the job store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether every mutation is flushed before the call returns.
    pub sync_on_write: bool,
}

impl StoreConfig {
    /// Disables flush-per-write; callers must flush explicitly.
    #[must_use]
    pub fn without_sync_on_write(mut self) -> Self {
        self.sync_on_write = false;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
        }
    }
}

struct Tables {
    jobs: HashMap<JobId, JobRecord>,
    next_seq: u64,
}

/// Durable, crash-consistent store for upload jobs and chunk state.
///
/// All mutations are appended to the queue log before the in-memory tables
/// change, so the tables can always be rebuilt by a full scan. State
/// transitions on a single job are serialized by the internal lock.
pub struct JobStore {
    log: QueueLog,
    tables: RwLock<Tables>,
}

impl JobStore {
    /// Opens a store backed by a file, replaying any existing log.
    ///
    /// Jobs left `Uploading` by a crash are flipped to `Paused` so the
    /// scheduler can reselect them.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the log is
    /// corrupted.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens a file-backed store with explicit configuration.
    pub fn open_with_config(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::from_backend(Box::new(backend), config)
    }

    /// Creates an ephemeral in-memory store, for tests and dry runs.
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_backend(Box::new(InMemoryBackend::new()), StoreConfig::default())
    }

    /// Builds a store over an arbitrary backend, replaying the log.
    pub fn from_backend(
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        let log = QueueLog::new(backend, config.sync_on_write);
        let mut tables = Tables {
            jobs: HashMap::new(),
            next_seq: 0,
        };

        let records = log.read_all()?;
        for record in &records {
            apply(&mut tables, record)?;
        }

        let store = Self {
            log,
            tables: RwLock::new(tables),
        };

        // A job found mid-upload means the previous process died; park it so
        // the scheduler resumes it from its highest acked chunk.
        let interrupted: Vec<JobId> = store
            .tables
            .read()
            .jobs
            .values()
            .filter(|j| j.state == JobState::Uploading)
            .map(|j| j.id)
            .collect();
        for job_id in interrupted {
            tracing::info!(%job_id, "parking job interrupted by restart");
            let mut tables = store.tables.write();
            store.commit(
                &mut tables,
                LogRecord::JobStateChanged {
                    job_id,
                    state: JobState::Paused,
                    reason: Some("interrupted by restart".into()),
                },
            )?;
        }

        Ok(store)
    }

    /// Enqueues a new job, durable before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidJob`] if the source is unreadable, the
    /// size is zero, or the priority is zero.
    pub fn enqueue(
        &self,
        source_path: &Path,
        priority: u8,
        metadata: JobMetadata,
    ) -> StoreResult<JobId> {
        if priority == 0 {
            return Err(StoreError::InvalidJob("priority must be at least 1".into()));
        }

        let file_meta = std::fs::metadata(source_path).map_err(|e| {
            StoreError::InvalidJob(format!(
                "source {} is unreadable: {e}",
                source_path.display()
            ))
        })?;
        let total_size = file_meta.len();
        if total_size == 0 {
            return Err(StoreError::InvalidJob(format!(
                "source {} is empty",
                source_path.display()
            )));
        }

        let job_id = JobId::generate();
        {
            // Sequence allocation and the append must not be separable, or
            // two concurrent enqueues would persist the same sequence and
            // leave the FIFO tie-break ambiguous.
            let mut tables = self.tables.write();
            let record = LogRecord::JobCreated {
                job_id,
                source_path: source_path.to_string_lossy().into_owned(),
                total_size,
                priority,
                created_at_ms: now_ms(),
                enqueue_seq: tables.next_seq,
                metadata,
            };
            self.commit(&mut tables, record)?;
        }

        tracing::info!(%job_id, total_size, priority, "job enqueued");
        Ok(job_id)
    }

    /// Fixes the chunk plan for a job, exactly once.
    ///
    /// Returns the resulting chunk count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyPlanned`] on a second call.
    pub fn record_chunk_plan(&self, job_id: JobId, chunk_size: u64) -> StoreResult<u32> {
        if chunk_size == 0 {
            return Err(StoreError::InvalidJob("chunk size must be non-zero".into()));
        }

        let mut tables = self.tables.write();
        let job = job_of(&tables, job_id)?;
        if job.plan.is_some() {
            return Err(StoreError::AlreadyPlanned(job_id));
        }
        let chunk_count = u32::try_from(job.total_size.div_ceil(chunk_size))
            .map_err(|_| StoreError::InvalidJob("chunk count exceeds u32".into()))?;

        self.commit(
            &mut tables,
            LogRecord::ChunkPlanned {
                job_id,
                chunk_size,
                chunk_count,
            },
        )?;

        tracing::debug!(%job_id, chunk_size, chunk_count, "chunk plan recorded");
        Ok(chunk_count)
    }

    /// Records the remote upload session for a job.
    ///
    /// Idempotent: if a session is already recorded, it is returned and the
    /// new one discarded, so re-initiation never forks a second session.
    pub fn open_session(&self, job_id: JobId, session: Uuid) -> StoreResult<Uuid> {
        let mut tables = self.tables.write();
        if let Some(existing) = job_of(&tables, job_id)?.upload_session {
            return Ok(existing);
        }

        self.commit(
            &mut tables,
            LogRecord::SessionOpened {
                job_id,
                session: *session.as_bytes(),
            },
        )?;
        Ok(session)
    }

    /// Marks a chunk as transmitted, persisting its checksum.
    pub fn mark_chunk_sent(
        &self,
        job_id: JobId,
        index: u32,
        checksum: [u8; 32],
    ) -> StoreResult<()> {
        let mut tables = self.tables.write();
        check_chunk_transition(&tables, job_id, index, ChunkState::Sent)?;
        self.commit(
            &mut tables,
            LogRecord::ChunkStateChanged {
                job_id,
                index,
                state: ChunkState::Sent,
                checksum: Some(checksum),
            },
        )
    }

    /// Marks a chunk as acknowledged by the remote endpoint.
    ///
    /// Acks must be contiguous: index `i` can only be acked once indices
    /// `0..i` all are, which is what makes the resume point valid.
    pub fn mark_chunk_acked(&self, job_id: JobId, index: u32) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let job = job_of(&tables, job_id)?;
        if index != job.resume_index() {
            return Err(StoreError::NonContiguousAck {
                job_id,
                index,
                highest: job.highest_acked(),
            });
        }
        check_chunk_transition(&tables, job_id, index, ChunkState::Acked)?;
        self.commit(
            &mut tables,
            LogRecord::ChunkStateChanged {
                job_id,
                index,
                state: ChunkState::Acked,
                checksum: None,
            },
        )?;
        tracing::debug!(%job_id, index, "chunk acked");
        Ok(())
    }

    /// Marks a chunk as rejected; it must be retransmitted.
    pub fn mark_chunk_rejected(&self, job_id: JobId, index: u32) -> StoreResult<()> {
        let mut tables = self.tables.write();
        check_chunk_transition(&tables, job_id, index, ChunkState::Rejected)?;
        self.commit(
            &mut tables,
            LogRecord::ChunkStateChanged {
                job_id,
                index,
                state: ChunkState::Rejected,
                checksum: None,
            },
        )?;
        tracing::warn!(%job_id, index, "chunk rejected");
        Ok(())
    }

    /// Advances the job state machine.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IllegalTransition`] for transitions the state
    /// machine forbids (e.g. out of a terminal state).
    pub fn advance_job_state(&self, job_id: JobId, new_state: JobState) -> StoreResult<()> {
        let mut tables = self.tables.write();
        check_job_transition(&tables, job_id, new_state)?;
        self.commit(
            &mut tables,
            LogRecord::JobStateChanged {
                job_id,
                state: new_state,
                reason: None,
            },
        )?;
        tracing::info!(%job_id, ?new_state, "job state advanced");
        Ok(())
    }

    /// Pauses a job with a reason, to be retried later.
    pub fn pause_job(&self, job_id: JobId, reason: impl Into<String>) -> StoreResult<()> {
        let mut tables = self.tables.write();
        check_job_transition(&tables, job_id, JobState::Paused)?;
        let reason = reason.into();
        tracing::info!(%job_id, %reason, "job paused");
        self.commit(
            &mut tables,
            LogRecord::JobStateChanged {
                job_id,
                state: JobState::Paused,
                reason: Some(reason),
            },
        )
    }

    /// Terminally fails a job with a non-empty reason.
    pub fn fail_job(&self, job_id: JobId, reason: impl Into<String>) -> StoreResult<()> {
        let reason = reason.into();
        if reason.is_empty() {
            return Err(StoreError::InvalidJob(
                "failure reason must not be empty".into(),
            ));
        }
        let mut tables = self.tables.write();
        check_job_transition(&tables, job_id, JobState::Failed)?;
        tracing::warn!(%job_id, %reason, "job failed");
        self.commit(
            &mut tables,
            LogRecord::JobStateChanged {
                job_id,
                state: JobState::Failed,
                reason: Some(reason),
            },
        )
    }

    /// Records a job-level retry, returning the new retry count.
    pub fn record_retry(&self, job_id: JobId, reason: impl Into<String>) -> StoreResult<u32> {
        let mut tables = self.tables.write();
        let retry_count = job_of(&tables, job_id)?.retry_count + 1;
        self.commit(
            &mut tables,
            LogRecord::RetryRecorded {
                job_id,
                retry_count,
                reason: reason.into(),
            },
        )?;
        Ok(retry_count)
    }

    /// Discards all chunk progress and the session for a job.
    ///
    /// Used when an integrity proof fails at completion: the mismatch cannot
    /// be localized to one chunk, so everything must be re-sent and
    /// re-verified under a fresh session.
    pub fn reset_chunk_progress(&self, job_id: JobId) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let job = job_of(&tables, job_id)?;
        if job.state.is_terminal() {
            return Err(StoreError::IllegalTransition {
                from: job.state,
                to: job.state,
            });
        }
        tracing::warn!(%job_id, "chunk progress reset for re-verification");
        self.commit(&mut tables, LogRecord::ChunkProgressReset { job_id })
    }

    /// Returns a snapshot of one job.
    pub fn get_job(&self, job_id: JobId) -> StoreResult<JobRecord> {
        self.tables
            .read()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::UnknownJob(job_id))
    }

    /// All non-terminal jobs with their resume points.
    ///
    /// Sorted by priority ascending, then enqueue order, matching the
    /// scheduler's selection order.
    pub fn list_resumable_jobs(&self) -> Vec<ResumableJob> {
        let tables = self.tables.read();
        let mut jobs: Vec<ResumableJob> = tables
            .jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .map(|j| ResumableJob {
                resume_index: j.resume_index(),
                job: j.clone(),
            })
            .collect();
        jobs.sort_by_key(|r| (r.job.priority, r.job.enqueue_seq));
        jobs
    }

    /// Aggregate per-state counts and byte totals.
    pub fn query_status(&self) -> StatusSummary {
        let tables = self.tables.read();
        let mut summary = StatusSummary::default();
        for job in tables.jobs.values() {
            summary.add(job.state, job.total_size);
        }
        summary
    }

    /// Rewrites the log as a minimal snapshot of current state.
    ///
    /// The append-only log grows with every chunk ack; compaction collapses
    /// each job's history into the few records needed to reproduce it.
    pub fn compact(&self) -> StoreResult<()> {
        let tables = self.tables.read();
        let mut jobs: Vec<&JobRecord> = tables.jobs.values().collect();
        jobs.sort_by_key(|j| j.enqueue_seq);

        let mut records = Vec::new();
        for job in jobs {
            records.push(LogRecord::JobCreated {
                job_id: job.id,
                source_path: job.source_path.to_string_lossy().into_owned(),
                total_size: job.total_size,
                priority: job.priority,
                created_at_ms: job.created_at_ms,
                enqueue_seq: job.enqueue_seq,
                metadata: job.metadata.clone(),
            });
            if let Some(plan) = job.plan {
                records.push(LogRecord::ChunkPlanned {
                    job_id: job.id,
                    chunk_size: plan.chunk_size,
                    chunk_count: plan.chunk_count,
                });
            }
            if let Some(session) = job.upload_session {
                records.push(LogRecord::SessionOpened {
                    job_id: job.id,
                    session: *session.as_bytes(),
                });
            }
            for (index, chunk) in job.chunks.iter().enumerate() {
                // Replay sent-then-acked so chunk transitions stay legal.
                if matches!(chunk.state, ChunkState::Sent | ChunkState::Acked) {
                    records.push(LogRecord::ChunkStateChanged {
                        job_id: job.id,
                        index: index as u32,
                        state: ChunkState::Sent,
                        checksum: chunk.checksum,
                    });
                }
                if chunk.state == ChunkState::Acked {
                    records.push(LogRecord::ChunkStateChanged {
                        job_id: job.id,
                        index: index as u32,
                        state: ChunkState::Acked,
                        checksum: None,
                    });
                }
                if chunk.state == ChunkState::Rejected {
                    records.push(LogRecord::ChunkStateChanged {
                        job_id: job.id,
                        index: index as u32,
                        state: ChunkState::Sent,
                        checksum: chunk.checksum,
                    });
                    records.push(LogRecord::ChunkStateChanged {
                        job_id: job.id,
                        index: index as u32,
                        state: ChunkState::Rejected,
                        checksum: None,
                    });
                }
            }
            if job.retry_count > 0 {
                records.push(LogRecord::RetryRecorded {
                    job_id: job.id,
                    retry_count: job.retry_count,
                    reason: job.last_error.clone().unwrap_or_default(),
                });
            }
            if job.state != JobState::Queued {
                records.push(LogRecord::JobStateChanged {
                    job_id: job.id,
                    state: job.state,
                    reason: job.last_error.clone(),
                });
            }
        }

        self.log.rewrite(&records)
    }

    /// Flushes the log; only needed when `sync_on_write` is disabled.
    pub fn flush(&self) -> StoreResult<()> {
        self.log.flush()
    }

    /// Appends the record, then applies it to the locked tables.
    ///
    /// Callers hold the write lock across their validation and this call,
    /// so a check-then-append pair is atomic against concurrent mutators.
    /// The log write happens first: if it fails, memory is untouched and
    /// the caller sees a store-unavailable error with state unchanged.
    fn commit(&self, tables: &mut Tables, record: LogRecord) -> StoreResult<()> {
        self.log.append(&record)?;
        apply(tables, &record)
    }
}

fn job_of(tables: &Tables, job_id: JobId) -> StoreResult<&JobRecord> {
    tables.jobs.get(&job_id).ok_or(StoreError::UnknownJob(job_id))
}

fn check_job_transition(tables: &Tables, job_id: JobId, to: JobState) -> StoreResult<()> {
    let job = job_of(tables, job_id)?;
    if !job.state.can_transition_to(to) {
        return Err(StoreError::IllegalTransition {
            from: job.state,
            to,
        });
    }
    Ok(())
}

fn check_chunk_transition(
    tables: &Tables,
    job_id: JobId,
    index: u32,
    to: ChunkState,
) -> StoreResult<()> {
    let job = job_of(tables, job_id)?;
    if job.plan.is_none() {
        return Err(StoreError::NotPlanned(job_id));
    }
    let chunk = job
        .chunks
        .get(index as usize)
        .ok_or(StoreError::UnknownChunk { job_id, index })?;
    if !chunk.state.can_transition_to(to) {
        return Err(StoreError::IllegalChunkTransition {
            from: chunk.state,
            to,
            index,
        });
    }
    Ok(())
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("jobs", &self.tables.read().jobs.len())
            .finish_non_exhaustive()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Applies one record to the tables. Shared by replay and live mutation.
fn apply(tables: &mut Tables, record: &LogRecord) -> StoreResult<()> {
    match record {
        LogRecord::JobCreated {
            job_id,
            source_path,
            total_size,
            priority,
            created_at_ms,
            enqueue_seq,
            metadata,
        } => {
            tables.jobs.insert(
                *job_id,
                JobRecord {
                    id: *job_id,
                    source_path: source_path.into(),
                    total_size: *total_size,
                    priority: *priority,
                    metadata: metadata.clone(),
                    created_at_ms: *created_at_ms,
                    enqueue_seq: *enqueue_seq,
                    state: JobState::Queued,
                    plan: None,
                    upload_session: None,
                    retry_count: 0,
                    last_error: None,
                    chunks: Vec::new(),
                },
            );
            tables.next_seq = tables.next_seq.max(enqueue_seq + 1);
            Ok(())
        }

        LogRecord::ChunkPlanned {
            job_id,
            chunk_size,
            chunk_count,
        } => {
            let job = job_mut(tables, *job_id)?;
            job.plan = Some(StoredChunkPlan {
                chunk_size: *chunk_size,
                chunk_count: *chunk_count,
            });
            job.chunks = vec![ChunkEntry::default(); *chunk_count as usize];
            Ok(())
        }

        LogRecord::SessionOpened { job_id, session } => {
            let job = job_mut(tables, *job_id)?;
            job.upload_session = Some(Uuid::from_bytes(*session));
            Ok(())
        }

        LogRecord::ChunkStateChanged {
            job_id,
            index,
            state,
            checksum,
        } => {
            let job = job_mut(tables, *job_id)?;
            let chunk = job
                .chunks
                .get_mut(*index as usize)
                .ok_or(StoreError::UnknownChunk {
                    job_id: *job_id,
                    index: *index,
                })?;
            chunk.state = *state;
            if let Some(checksum) = checksum {
                chunk.checksum = Some(*checksum);
            }
            Ok(())
        }

        LogRecord::JobStateChanged {
            job_id,
            state,
            reason,
        } => {
            let job = job_mut(tables, *job_id)?;
            job.state = *state;
            if reason.is_some() {
                job.last_error = reason.clone();
            }
            Ok(())
        }

        LogRecord::RetryRecorded {
            job_id,
            retry_count,
            reason,
        } => {
            let job = job_mut(tables, *job_id)?;
            job.retry_count = *retry_count;
            job.last_error = Some(reason.clone());
            Ok(())
        }

        LogRecord::ChunkProgressReset { job_id } => {
            let job = job_mut(tables, *job_id)?;
            for chunk in &mut job.chunks {
                *chunk = ChunkEntry::default();
            }
            job.upload_session = None;
            Ok(())
        }
    }
}

fn job_mut(tables: &mut Tables, job_id: JobId) -> StoreResult<&mut JobRecord> {
    tables
        .jobs
        .get_mut(&job_id)
        .ok_or(StoreError::UnknownJob(job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    fn source_file(dir: &TempDir, name: &str, len: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0xA5u8; len]).unwrap();
        path
    }

    fn store_with_job(dir: &TempDir) -> (JobStore, JobId) {
        let store = JobStore::in_memory().unwrap();
        let source = source_file(dir, "slide.svs", 100);
        let job_id = store.enqueue(&source, 5, JobMetadata::new()).unwrap();
        (store, job_id)
    }

    #[test]
    fn enqueue_assigns_queued_state() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.total_size, 100);
        assert_eq!(job.priority, 5);
    }

    #[test]
    fn enqueue_rejects_missing_source() {
        let store = JobStore::in_memory().unwrap();
        let result = store.enqueue(
            Path::new("/nonexistent/slide.svs"),
            5,
            JobMetadata::new(),
        );
        assert!(matches!(result, Err(StoreError::InvalidJob(_))));
    }

    #[test]
    fn enqueue_rejects_empty_source() {
        let dir = tempdir().unwrap();
        let store = JobStore::in_memory().unwrap();
        let source = source_file(&dir, "empty.svs", 0);
        let result = store.enqueue(&source, 5, JobMetadata::new());
        assert!(matches!(result, Err(StoreError::InvalidJob(_))));
    }

    #[test]
    fn enqueue_rejects_zero_priority() {
        let dir = tempdir().unwrap();
        let store = JobStore::in_memory().unwrap();
        let source = source_file(&dir, "slide.svs", 10);
        let result = store.enqueue(&source, 0, JobMetadata::new());
        assert!(matches!(result, Err(StoreError::InvalidJob(_))));
    }

    #[test]
    fn chunk_plan_is_fixed_once() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);

        let count = store.record_chunk_plan(job_id, 30).unwrap();
        assert_eq!(count, 4); // 100 bytes / 30 = 4 chunks

        let result = store.record_chunk_plan(job_id, 50);
        assert!(matches!(result, Err(StoreError::AlreadyPlanned(_))));
    }

    #[test]
    fn session_open_is_idempotent() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert_eq!(store.open_session(job_id, first).unwrap(), first);
        assert_eq!(store.open_session(job_id, second).unwrap(), first);
        assert_eq!(store.get_job(job_id).unwrap().upload_session, Some(first));
    }

    #[test]
    fn chunk_lifecycle_and_contiguity() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);
        store.record_chunk_plan(job_id, 25).unwrap();

        store.mark_chunk_sent(job_id, 0, [1; 32]).unwrap();
        store.mark_chunk_acked(job_id, 0).unwrap();

        store.mark_chunk_sent(job_id, 1, [2; 32]).unwrap();
        // Acking chunk 2 before chunk 1 violates contiguity.
        store.mark_chunk_sent(job_id, 2, [3; 32]).unwrap();
        let result = store.mark_chunk_acked(job_id, 2);
        assert!(matches!(result, Err(StoreError::NonContiguousAck { .. })));

        store.mark_chunk_acked(job_id, 1).unwrap();
        store.mark_chunk_acked(job_id, 2).unwrap();

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.highest_acked(), Some(2));
        assert_eq!(job.resume_index(), 3);
    }

    #[test]
    fn rejected_chunk_can_be_resent() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);
        store.record_chunk_plan(job_id, 50).unwrap();

        store.mark_chunk_sent(job_id, 0, [1; 32]).unwrap();
        store.mark_chunk_rejected(job_id, 0).unwrap();
        store.mark_chunk_sent(job_id, 0, [1; 32]).unwrap();
        store.mark_chunk_acked(job_id, 0).unwrap();

        // Acked chunks never move again.
        let result = store.mark_chunk_rejected(job_id, 0);
        assert!(matches!(
            result,
            Err(StoreError::IllegalChunkTransition { .. })
        ));
    }

    #[test]
    fn chunk_ops_require_plan() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);
        let result = store.mark_chunk_sent(job_id, 0, [0; 32]);
        assert!(matches!(result, Err(StoreError::NotPlanned(_))));
    }

    #[test]
    fn job_state_machine_is_enforced() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);

        store.advance_job_state(job_id, JobState::Uploading).unwrap();
        store.pause_job(job_id, "network timeout").unwrap();
        store.advance_job_state(job_id, JobState::Uploading).unwrap();
        store.advance_job_state(job_id, JobState::Completed).unwrap();

        // Terminal state is immutable.
        let result = store.advance_job_state(job_id, JobState::Uploading);
        assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
        let result = store.fail_job(job_id, "too late");
        assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
    }

    #[test]
    fn fail_requires_reason() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);
        assert!(matches!(
            store.fail_job(job_id, ""),
            Err(StoreError::InvalidJob(_))
        ));
        store.fail_job(job_id, "cancelled").unwrap();
        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn retry_count_accumulates() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);
        assert_eq!(store.record_retry(job_id, "timeout").unwrap(), 1);
        assert_eq!(store.record_retry(job_id, "timeout").unwrap(), 2);
        assert_eq!(store.get_job(job_id).unwrap().retry_count, 2);
    }

    #[test]
    fn reset_discards_progress_and_session() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);
        store.record_chunk_plan(job_id, 50).unwrap();
        store.open_session(job_id, Uuid::new_v4()).unwrap();
        store.mark_chunk_sent(job_id, 0, [1; 32]).unwrap();
        store.mark_chunk_acked(job_id, 0).unwrap();

        store.reset_chunk_progress(job_id).unwrap();

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.resume_index(), 0);
        assert!(job.upload_session.is_none());
        assert!(job.chunks.iter().all(|c| c.state == ChunkState::Pending));
    }

    #[test]
    fn status_summary_counts_bytes() {
        let dir = tempdir().unwrap();
        let store = JobStore::in_memory().unwrap();
        let a = store
            .enqueue(&source_file(&dir, "a.svs", 10), 1, JobMetadata::new())
            .unwrap();
        store
            .enqueue(&source_file(&dir, "b.svs", 20), 5, JobMetadata::new())
            .unwrap();

        store.advance_job_state(a, JobState::Uploading).unwrap();
        store.advance_job_state(a, JobState::Completed).unwrap();

        let summary = store.query_status();
        assert_eq!(summary.completed.count, 1);
        assert_eq!(summary.completed.bytes, 10);
        assert_eq!(summary.queued.count, 1);
        assert_eq!(summary.queued.bytes, 20);
    }

    #[test]
    fn resumable_jobs_sorted_by_priority_then_fifo() {
        let dir = tempdir().unwrap();
        let store = JobStore::in_memory().unwrap();
        let routine_1 = store
            .enqueue(&source_file(&dir, "r1.svs", 10), 5, JobMetadata::new())
            .unwrap();
        let urgent_1 = store
            .enqueue(&source_file(&dir, "u1.svs", 10), 1, JobMetadata::new())
            .unwrap();
        let routine_2 = store
            .enqueue(&source_file(&dir, "r2.svs", 10), 5, JobMetadata::new())
            .unwrap();
        let urgent_2 = store
            .enqueue(&source_file(&dir, "u2.svs", 10), 1, JobMetadata::new())
            .unwrap();

        let order: Vec<JobId> = store
            .list_resumable_jobs()
            .into_iter()
            .map(|r| r.job.id)
            .collect();
        assert_eq!(order, vec![urgent_1, urgent_2, routine_1, routine_2]);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let queue_path = dir.path().join("queue.log");
        let source = source_file(&dir, "slide.svs", 100);

        let job_id = {
            let store = JobStore::open(&queue_path).unwrap();
            let job_id = store.enqueue(&source, 2, JobMetadata::new()).unwrap();
            store.record_chunk_plan(job_id, 25).unwrap();
            store.open_session(job_id, Uuid::new_v4()).unwrap();
            store.advance_job_state(job_id, JobState::Uploading).unwrap();
            store.mark_chunk_sent(job_id, 0, [9; 32]).unwrap();
            store.mark_chunk_acked(job_id, 0).unwrap();
            store.mark_chunk_sent(job_id, 1, [8; 32]).unwrap();
            job_id
        };

        let store = JobStore::open(&queue_path).unwrap();
        let job = store.get_job(job_id).unwrap();

        // The crash interrupted an upload; the job is parked for resume.
        assert_eq!(job.state, JobState::Paused);
        assert_eq!(job.resume_index(), 1);
        assert_eq!(job.chunks[0].checksum, Some([9; 32]));
        assert_eq!(job.plan.unwrap().chunk_count, 4);
        assert!(job.upload_session.is_some());

        let resumable = store.list_resumable_jobs();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].resume_index, 1);
    }

    #[test]
    fn compaction_preserves_state() {
        let dir = tempdir().unwrap();
        let queue_path = dir.path().join("queue.log");
        let source = source_file(&dir, "slide.svs", 100);

        let job_id = {
            let store = JobStore::open(&queue_path).unwrap();
            let job_id = store.enqueue(&source, 3, JobMetadata::new()).unwrap();
            store.record_chunk_plan(job_id, 40).unwrap();
            store.advance_job_state(job_id, JobState::Uploading).unwrap();
            store.mark_chunk_sent(job_id, 0, [7; 32]).unwrap();
            store.mark_chunk_acked(job_id, 0).unwrap();
            store.pause_job(job_id, "offline").unwrap();
            store.record_retry(job_id, "offline").unwrap();
            store.compact().unwrap();
            job_id
        };

        let store = JobStore::open(&queue_path).unwrap();
        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.state, JobState::Paused);
        assert_eq!(job.resume_index(), 1);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.chunks[0].checksum, Some([7; 32]));
    }

    #[test]
    fn concurrent_enqueues_get_distinct_sequences() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory().unwrap());
        let source = source_file(&dir, "slide.svs", 10);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let source = source.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    store.enqueue(&source, 5, JobMetadata::new()).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let jobs = store.list_resumable_jobs();
        assert_eq!(jobs.len(), 200);
        let sequences: HashSet<u64> = jobs.iter().map(|r| r.job.enqueue_seq).collect();
        assert_eq!(sequences.len(), jobs.len());
    }

    #[test]
    fn completed_jobs_are_not_resumable() {
        let dir = tempdir().unwrap();
        let (store, job_id) = store_with_job(&dir);
        store.advance_job_state(job_id, JobState::Uploading).unwrap();
        store.advance_job_state(job_id, JobState::Completed).unwrap();
        assert!(store.list_resumable_jobs().is_empty());
    }
}
