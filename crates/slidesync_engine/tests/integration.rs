//! End-to-end tests over a file-backed store and a faithful remote:
//! restart durability, re-initiation, and integrity recovery.

use parking_lot::Mutex;
use slidesync_engine::{
    EngineConfig, EngineError, EngineResult, InMemoryRemote, RemoteStore, RetryConfig, SyncEngine,
};
use slidesync_protocol::{
    chunk_checksum, ChunkUploadRequest, ChunkUploadResponse, CompleteRequest, CompleteResponse,
    InitiateRequest, InitiateResponse, SessionStatusRequest, SessionStatusResponse,
};
use slidesync_store::{JobId, JobMetadata, JobState, JobStore};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Wraps [`InMemoryRemote`] with scripted faults: transport failures on
/// specific upload calls and one-shot payload corruption, while recording
/// every chunk index that reaches the remote.
struct FlakyRemote {
    inner: InMemoryRemote,
    fail_upload_calls: Mutex<HashSet<u32>>,
    corrupt_chunk: Mutex<Option<u32>>,
    upload_calls: AtomicU32,
    initiate_calls: AtomicU32,
    offered_indices: Mutex<Vec<u32>>,
}

impl FlakyRemote {
    fn new() -> Self {
        Self {
            inner: InMemoryRemote::new(),
            fail_upload_calls: Mutex::new(HashSet::new()),
            corrupt_chunk: Mutex::new(None),
            upload_calls: AtomicU32::new(0),
            initiate_calls: AtomicU32::new(0),
            offered_indices: Mutex::new(Vec::new()),
        }
    }

    /// Fails the n-th upload call (1-based) with a retryable error.
    fn fail_upload_call(&self, call: u32) {
        self.fail_upload_calls.lock().insert(call);
    }

    /// Corrupts the next upload of the given chunk index, once. The
    /// checksum is recomputed over the corrupted bytes so the per-chunk
    /// check passes and only the completion proof can catch it.
    fn corrupt_chunk(&self, index: u32) {
        *self.corrupt_chunk.lock() = Some(index);
    }

    fn offered_indices(&self) -> Vec<u32> {
        self.offered_indices.lock().clone()
    }

    fn clear_offered(&self) {
        self.offered_indices.lock().clear();
    }

    fn initiate_calls(&self) -> u32 {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    fn committed_artifact(&self, job_id: JobId) -> Option<Vec<u8>> {
        self.inner
            .committed_artifact(Uuid::from_bytes(job_id.as_bytes()))
    }
}

impl RemoteStore for FlakyRemote {
    fn initiate(&self, request: InitiateRequest) -> EngineResult<InitiateResponse> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.initiate(request)
    }

    fn upload_chunk(&self, mut request: ChunkUploadRequest) -> EngineResult<ChunkUploadResponse> {
        let call = self.upload_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_upload_calls.lock().remove(&call) {
            return Err(EngineError::transport_retryable("connection reset"));
        }

        let corrupt = {
            let mut pending = self.corrupt_chunk.lock();
            if *pending == Some(request.index) {
                pending.take();
                true
            } else {
                false
            }
        };
        if corrupt {
            request.payload[0] ^= 0xFF;
            request.checksum = chunk_checksum(&request.payload);
        }

        self.offered_indices.lock().push(request.index);
        self.inner.upload_chunk(request)
    }

    fn complete(&self, request: CompleteRequest) -> EngineResult<CompleteResponse> {
        self.inner.complete(request)
    }

    fn session_status(&self, request: SessionStatusRequest) -> EngineResult<SessionStatusResponse> {
        self.inner.session_status(request)
    }
}

struct Harness {
    dir: TempDir,
    remote: Arc<FlakyRemote>,
    data: Vec<u8>,
    source: PathBuf,
}

impl Harness {
    fn new(size: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let source = dir.path().join("slide.svs");
        std::fs::File::create(&source)
            .unwrap()
            .write_all(&data)
            .unwrap();
        Self {
            dir,
            remote: Arc::new(FlakyRemote::new()),
            data,
            source,
        }
    }

    fn queue_path(&self) -> PathBuf {
        self.dir.path().join("queue.log")
    }

    /// An engine over the persistent queue with zero backoff delays, so
    /// retries are immediately eligible.
    fn engine(&self) -> SyncEngine {
        let store = JobStore::open(&self.queue_path()).unwrap();
        let config = EngineConfig::default().with_retry(
            RetryConfig::new(4)
                .with_initial_delay(Duration::ZERO)
                .with_max_delay(Duration::ZERO),
        );
        SyncEngine::new(store, self.remote.clone(), config)
    }

    /// Enqueues the source file with a fixed 100-byte chunk plan.
    fn enqueue_planned(&self, engine: &SyncEngine) -> JobId {
        let job_id = engine
            .enqueue(&self.source, 5, JobMetadata::new())
            .unwrap();
        engine.store().record_chunk_plan(job_id, 100).unwrap();
        job_id
    }

    fn state(engine: &SyncEngine, job_id: JobId) -> JobState {
        engine.store().get_job(job_id).unwrap().state
    }
}

#[test]
fn chunks_arrive_gapless_and_in_order() {
    let harness = Harness::new(1000);
    let engine = harness.engine();
    let job_id = harness.enqueue_planned(&engine);

    assert!(engine.step().unwrap());

    assert_eq!(Harness::state(&engine, job_id), JobState::Completed);
    assert_eq!(harness.remote.offered_indices(), (0..10).collect::<Vec<_>>());
    assert_eq!(
        harness.remote.committed_artifact(job_id).unwrap(),
        harness.data
    );
}

#[test]
fn restart_resumes_from_last_acked_chunk() {
    let harness = Harness::new(1000);
    // Fifth upload call dies after four chunks were acked.
    harness.remote.fail_upload_call(5);

    let job_id = {
        let engine = harness.engine();
        let job_id = harness.enqueue_planned(&engine);
        assert!(engine.step().unwrap());
        assert_eq!(Harness::state(&engine, job_id), JobState::Paused);
        let job = engine.store().get_job(job_id).unwrap();
        assert_eq!(job.resume_index(), 4);
        job_id
        // Engine drops here, releasing the queue file lock.
    };

    harness.remote.clear_offered();
    let engine = harness.engine();
    assert!(engine.step().unwrap());

    assert_eq!(Harness::state(&engine, job_id), JobState::Completed);
    // Only the unacked tail was re-sent.
    assert_eq!(harness.remote.offered_indices(), (4..10).collect::<Vec<_>>());
    assert_eq!(
        harness.remote.committed_artifact(job_id).unwrap(),
        harness.data
    );
}

#[test]
fn repeated_initiation_never_forks_a_second_session() {
    let harness = Harness::new(1000);
    harness.remote.fail_upload_call(2);
    harness.remote.fail_upload_call(6);

    let engine = harness.engine();
    let job_id = harness.enqueue_planned(&engine);

    let mut steps = 0;
    while Harness::state(&engine, job_id) != JobState::Completed {
        assert!(engine.step().unwrap());
        steps += 1;
        assert!(steps < 10, "job did not converge");
    }

    // Three attempts, three initiations, one session throughout.
    assert_eq!(harness.remote.initiate_calls(), 3);
    let session = engine.store().get_job(job_id).unwrap().upload_session;
    assert!(session.is_some());
    assert_eq!(
        harness.remote.committed_artifact(job_id).unwrap(),
        harness.data
    );
}

#[test]
fn corrupted_chunk_is_caught_at_completion_and_healed() {
    let harness = Harness::new(1000);
    // Chunk 6 is silently corrupted in flight with a matching checksum, so
    // only the completion proof can detect it.
    harness.remote.corrupt_chunk(6);

    let engine = harness.engine();
    let job_id = harness.enqueue_planned(&engine);

    assert!(engine.step().unwrap());
    let job = engine.store().get_job(job_id).unwrap();
    assert_eq!(job.state, JobState::Paused);
    assert_eq!(job.resume_index(), 0);
    assert!(job.upload_session.is_none());
    assert!(job
        .last_error
        .as_deref()
        .unwrap()
        .contains("integrity mismatch"));

    // The next attempt resends everything and commits a clean artifact.
    assert!(engine.step().unwrap());
    assert_eq!(Harness::state(&engine, job_id), JobState::Completed);
    assert_eq!(
        harness.remote.committed_artifact(job_id).unwrap(),
        harness.data
    );
}

#[test]
fn queue_survives_restart_with_mixed_states() {
    let harness = Harness::new(1000);
    let other_source = harness.dir.path().join("other.svs");
    std::fs::File::create(&other_source)
        .unwrap()
        .write_all(&[7u8; 300])
        .unwrap();

    let (done, waiting) = {
        let engine = harness.engine();
        let done = harness.enqueue_planned(&engine);
        assert!(engine.step().unwrap());
        let waiting = engine
            .enqueue(Path::new(&other_source), 2, JobMetadata::new())
            .unwrap();
        (done, waiting)
    };

    let engine = harness.engine();
    assert_eq!(Harness::state(&engine, done), JobState::Completed);
    assert_eq!(Harness::state(&engine, waiting), JobState::Queued);

    let status = engine.status();
    assert_eq!(status.jobs.completed.count, 1);
    assert_eq!(status.jobs.queued.count, 1);
    assert_eq!(status.jobs.queued.bytes, 300);

    // The queued job is still runnable after the restart.
    assert!(engine.step().unwrap());
    assert_eq!(Harness::state(&engine, waiting), JobState::Completed);
}
