//! Core types for jobs and chunks.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque identifier for an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random job id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a job id from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw byte representation.
    #[must_use]
    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Waiting to be dispatched.
    Queued,
    /// Currently being advanced by a transfer worker.
    Uploading,
    /// Interrupted; eligible for resume.
    Paused,
    /// All bytes delivered and committed. Terminal.
    Completed,
    /// Gave up (retry exhaustion, cancellation, bad definition). Terminal.
    Failed,
}

impl JobState {
    /// Returns true for terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the transition `self -> to` is legal.
    #[must_use]
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (*self, to),
            (Queued, Uploading)
                | (Queued, Failed)
                | (Uploading, Paused)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Paused, Uploading)
                | (Paused, Failed)
        )
    }
}

/// Acknowledgment state of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkState {
    /// Not yet transmitted.
    Pending,
    /// Transmitted, awaiting verification.
    Sent,
    /// Verified by the remote endpoint.
    Acked,
    /// Rejected (checksum mismatch or remote error); must be retransmitted.
    Rejected,
}

impl ChunkState {
    /// Returns true if the transition `self -> to` is legal.
    #[must_use]
    pub fn can_transition_to(&self, to: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (*self, to),
            (Pending, Sent) | (Sent, Acked) | (Sent, Rejected) | (Rejected, Sent)
        )
    }
}

/// Caller-supplied metadata, passed through to the remote endpoint unmodified.
pub type JobMetadata = BTreeMap<String, String>;

/// The chunk plan fixed for a job at transfer start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredChunkPlan {
    /// Fixed chunk size in bytes.
    pub chunk_size: u64,
    /// Total number of chunks.
    pub chunk_count: u32,
}

/// Persisted state of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Acknowledgment state.
    pub state: ChunkState,
    /// SHA-256 checksum recorded when the chunk was first sent.
    pub checksum: Option<[u8; 32]>,
}

impl Default for ChunkEntry {
    fn default() -> Self {
        Self {
            state: ChunkState::Pending,
            checksum: None,
        }
    }
}

/// A persisted upload job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Job identifier.
    pub id: JobId,
    /// Local path of the source artifact.
    pub source_path: PathBuf,
    /// Total payload size in bytes.
    pub total_size: u64,
    /// Priority; lower is more urgent (1 = urgent, 10 = batch).
    pub priority: u8,
    /// Opaque caller metadata.
    pub metadata: JobMetadata,
    /// Enqueue time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Store-assigned enqueue sequence; breaks priority ties FIFO.
    pub enqueue_seq: u64,
    /// Current lifecycle state.
    pub state: JobState,
    /// Chunk plan, once fixed.
    pub plan: Option<StoredChunkPlan>,
    /// Remote upload session id, once opened.
    pub upload_session: Option<Uuid>,
    /// Number of job-level retries recorded so far.
    pub retry_count: u32,
    /// Reason for the last pause or failure.
    pub last_error: Option<String>,
    /// Per-chunk state, sized by the plan.
    pub chunks: Vec<ChunkEntry>,
}

impl JobRecord {
    /// Highest chunk index acknowledged contiguously from zero.
    #[must_use]
    pub fn highest_acked(&self) -> Option<u32> {
        let mut highest = None;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.state == ChunkState::Acked {
                highest = Some(i as u32);
            } else {
                break;
            }
        }
        highest
    }

    /// The next chunk index to transmit (the resume point).
    #[must_use]
    pub fn resume_index(&self) -> u32 {
        self.highest_acked().map_or(0, |i| i + 1)
    }

    /// Returns true once every planned chunk is acknowledged.
    #[must_use]
    pub fn all_chunks_acked(&self) -> bool {
        match self.plan {
            Some(plan) => {
                self.chunks.len() == plan.chunk_count as usize
                    && self.chunks.iter().all(|c| c.state == ChunkState::Acked)
            }
            None => false,
        }
    }

    /// Ordered checksums of all acknowledged chunks, if complete.
    ///
    /// Returns `None` until every chunk is acked with a recorded checksum.
    #[must_use]
    pub fn ordered_checksums(&self) -> Option<Vec<[u8; 32]>> {
        if !self.all_chunks_acked() {
            return None;
        }
        self.chunks.iter().map(|c| c.checksum).collect()
    }
}

/// A non-terminal job reported for resume at startup.
#[derive(Debug, Clone)]
pub struct ResumableJob {
    /// The persisted job.
    pub job: JobRecord,
    /// The chunk index to resume from.
    pub resume_index: u32,
}

/// Aggregate counts and byte totals for one job state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateTotals {
    /// Number of jobs in this state.
    pub count: u64,
    /// Sum of `total_size` over jobs in this state.
    pub bytes: u64,
}

/// Aggregate queue status, for external reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    /// Jobs waiting for dispatch.
    pub queued: StateTotals,
    /// Jobs currently transferring.
    pub uploading: StateTotals,
    /// Jobs paused pending retry.
    pub paused: StateTotals,
    /// Jobs delivered and committed.
    pub completed: StateTotals,
    /// Jobs that gave up.
    pub failed: StateTotals,
}

impl StatusSummary {
    /// Totals for the given state.
    #[must_use]
    pub fn for_state(&self, state: JobState) -> StateTotals {
        match state {
            JobState::Queued => self.queued,
            JobState::Uploading => self.uploading,
            JobState::Paused => self.paused,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub(crate) fn add(&mut self, state: JobState, bytes: u64) {
        let totals = match state {
            JobState::Queued => &mut self.queued,
            JobState::Uploading => &mut self.uploading,
            JobState::Paused => &mut self.paused,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
        };
        totals.count += 1;
        totals.bytes += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_chunks(states: &[ChunkState]) -> JobRecord {
        JobRecord {
            id: JobId::generate(),
            source_path: PathBuf::from("/tmp/slide.svs"),
            total_size: 100,
            priority: 5,
            metadata: JobMetadata::new(),
            created_at_ms: 0,
            enqueue_seq: 0,
            state: JobState::Uploading,
            plan: Some(StoredChunkPlan {
                chunk_size: 25,
                chunk_count: states.len() as u32,
            }),
            upload_session: None,
            retry_count: 0,
            last_error: None,
            chunks: states
                .iter()
                .map(|s| ChunkEntry {
                    state: *s,
                    checksum: Some([0u8; 32]),
                })
                .collect(),
        }
    }

    #[test]
    fn job_transitions() {
        use JobState::*;
        assert!(Queued.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Uploading));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Paused));
    }

    #[test]
    fn chunk_transitions() {
        use ChunkState::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Acked));
        assert!(Sent.can_transition_to(Rejected));
        assert!(Rejected.can_transition_to(Sent));

        assert!(!Pending.can_transition_to(Acked));
        assert!(!Acked.can_transition_to(Sent));
        assert!(!Acked.can_transition_to(Rejected));
    }

    #[test]
    fn highest_acked_is_contiguous() {
        use ChunkState::*;

        let job = job_with_chunks(&[Acked, Acked, Pending, Acked]);
        // Chunk 3 is acked but chunk 2 is not; contiguous progress stops at 1.
        assert_eq!(job.highest_acked(), Some(1));
        assert_eq!(job.resume_index(), 2);

        let job = job_with_chunks(&[Pending, Pending]);
        assert_eq!(job.highest_acked(), None);
        assert_eq!(job.resume_index(), 0);
    }

    #[test]
    fn all_chunks_acked_requires_full_plan() {
        use ChunkState::*;
        assert!(job_with_chunks(&[Acked, Acked]).all_chunks_acked());
        assert!(!job_with_chunks(&[Acked, Sent]).all_chunks_acked());

        let mut job = job_with_chunks(&[Acked]);
        job.plan = None;
        assert!(!job.all_chunks_acked());
    }

    #[test]
    fn status_summary_accumulates() {
        let mut summary = StatusSummary::default();
        summary.add(JobState::Queued, 10);
        summary.add(JobState::Queued, 20);
        summary.add(JobState::Completed, 5);

        assert_eq!(summary.queued.count, 2);
        assert_eq!(summary.queued.bytes, 30);
        assert_eq!(summary.completed.count, 1);
        assert_eq!(summary.for_state(JobState::Failed).count, 0);
    }
}
