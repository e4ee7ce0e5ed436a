//! Transport abstraction over the remote slide store.

use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use slidesync_protocol::{
    chunk_checksum, merkle_root, ChunkUploadRequest, ChunkUploadResponse, CompleteRequest,
    CompleteResponse, InitiateRequest, InitiateResponse, SessionStatusRequest,
    SessionStatusResponse,
};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// The remote endpoint an upload talks to.
///
/// Implementations wrap whatever wire the deployment uses; the engine only
/// sees protocol messages. All methods may be called from scheduler worker
/// threads.
pub trait RemoteStore: Send + Sync {
    /// Opens or re-opens the upload session for a job.
    fn initiate(&self, request: InitiateRequest) -> EngineResult<InitiateResponse>;

    /// Uploads one chunk and returns the remote verdict.
    fn upload_chunk(&self, request: ChunkUploadRequest) -> EngineResult<ChunkUploadResponse>;

    /// Asks the remote to verify and commit the assembled artifact.
    fn complete(&self, request: CompleteRequest) -> EngineResult<CompleteResponse>;

    /// Queries the progress the remote holds for a session.
    fn session_status(&self, request: SessionStatusRequest) -> EngineResult<SessionStatusResponse>;
}

/// A scripted remote for unit tests.
///
/// Records every chunk index it is offered, and can be scripted to reject
/// specific chunks a number of times or to fail whole calls with transport
/// errors.
#[derive(Default)]
pub struct MockRemote {
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    sessions: HashMap<Uuid, MockSession>,
    by_job: HashMap<Uuid, Uuid>,
    uploaded_indices: Vec<u32>,
    initiate_calls: u32,
    reject_script: HashMap<u32, u32>,
    upload_failures: VecDeque<EngineError>,
    mismatch_root: Option<[u8; 32]>,
}

struct MockSession {
    next_index: u32,
    chunk_count: u32,
    checksums: Vec<[u8; 32]>,
}

impl MockRemote {
    /// Creates an unscripted mock that acks everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts chunk `index` to be rejected `times` times before acking.
    pub fn reject_chunk(&self, index: u32, times: u32) {
        self.inner.lock().reject_script.insert(index, times);
    }

    /// Scripts the next upload calls to fail with the given errors.
    pub fn fail_next_uploads(&self, errors: Vec<EngineError>) {
        self.inner.lock().upload_failures.extend(errors);
    }

    /// Scripts completion to report a mismatching remote root.
    pub fn force_mismatch(&self, remote_root: [u8; 32]) {
        self.inner.lock().mismatch_root = Some(remote_root);
    }

    /// Every chunk index offered, in call order (including retransmits).
    #[must_use]
    pub fn uploaded_indices(&self) -> Vec<u32> {
        self.inner.lock().uploaded_indices.clone()
    }

    /// Number of initiate calls seen.
    #[must_use]
    pub fn initiate_calls(&self) -> u32 {
        self.inner.lock().initiate_calls
    }
}

impl RemoteStore for MockRemote {
    fn initiate(&self, request: InitiateRequest) -> EngineResult<InitiateResponse> {
        let mut state = self.inner.lock();
        state.initiate_calls += 1;

        if let Some(session) = state.by_job.get(&request.job_id).copied() {
            let next_index = state.sessions[&session].next_index;
            return Ok(InitiateResponse::resumed(session, next_index));
        }

        let session = Uuid::new_v4();
        state.by_job.insert(request.job_id, session);
        state.sessions.insert(
            session,
            MockSession {
                next_index: 0,
                chunk_count: request.chunk_count,
                checksums: Vec::new(),
            },
        );
        Ok(InitiateResponse::fresh(session))
    }

    fn upload_chunk(&self, request: ChunkUploadRequest) -> EngineResult<ChunkUploadResponse> {
        let mut state = self.inner.lock();
        if let Some(error) = state.upload_failures.pop_front() {
            return Err(error);
        }

        state.uploaded_indices.push(request.index);

        if let Some(remaining) = state.reject_script.get_mut(&request.index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(ChunkUploadResponse::reject(
                    request.index,
                    "scripted rejection",
                ));
            }
        }

        let session = state
            .sessions
            .get_mut(&request.session)
            .ok_or_else(|| EngineError::RemoteRejected("unknown session".into()))?;
        if request.index == session.next_index {
            session.next_index += 1;
            session.checksums.push(request.checksum);
        }
        Ok(ChunkUploadResponse::ack(request.index))
    }

    fn complete(&self, request: CompleteRequest) -> EngineResult<CompleteResponse> {
        let mut state = self.inner.lock();
        if let Some(remote_root) = state.mismatch_root.take() {
            return Ok(CompleteResponse::Mismatch { remote_root });
        }

        let session = state
            .sessions
            .get(&request.session)
            .ok_or_else(|| EngineError::RemoteRejected("unknown session".into()))?;
        if session.next_index < session.chunk_count {
            return Ok(CompleteResponse::Mismatch {
                remote_root: [0; 32],
            });
        }
        match merkle_root(&session.checksums) {
            Some(root) if root == request.merkle_root => Ok(CompleteResponse::Committed),
            Some(root) => Ok(CompleteResponse::Mismatch { remote_root: root }),
            None => Err(EngineError::RemoteRejected("empty session".into())),
        }
    }

    fn session_status(&self, request: SessionStatusRequest) -> EngineResult<SessionStatusResponse> {
        let state = self.inner.lock();
        let session = state
            .sessions
            .get(&request.session)
            .ok_or_else(|| EngineError::RemoteRejected("unknown session".into()))?;
        Ok(SessionStatusResponse {
            session: request.session,
            next_index: session.next_index,
        })
    }
}

/// A faithful in-memory remote that stores and assembles chunk bytes.
///
/// Behaves like a real endpoint: verifies per-chunk checksums, enforces
/// in-order receipt, computes its own Merkle root at completion, and keeps
/// committed artifacts for inspection.
#[derive(Default)]
pub struct InMemoryRemote {
    inner: Mutex<RemoteState>,
}

#[derive(Default)]
struct RemoteState {
    sessions: HashMap<Uuid, RemoteSession>,
    by_job: HashMap<Uuid, Uuid>,
    committed: HashMap<Uuid, Vec<u8>>,
}

struct RemoteSession {
    job_id: Uuid,
    chunk_count: u32,
    next_index: u32,
    checksums: Vec<[u8; 32]>,
    chunks: Vec<Vec<u8>>,
}

impl InMemoryRemote {
    /// Creates an empty remote.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed artifact bytes for a job, if completion succeeded.
    #[must_use]
    pub fn committed_artifact(&self, job_id: Uuid) -> Option<Vec<u8>> {
        self.inner.lock().committed.get(&job_id).cloned()
    }
}

impl RemoteStore for InMemoryRemote {
    fn initiate(&self, request: InitiateRequest) -> EngineResult<InitiateResponse> {
        let mut state = self.inner.lock();

        if let Some(session) = state.by_job.get(&request.job_id).copied() {
            let next_index = state.sessions[&session].next_index;
            return Ok(InitiateResponse::resumed(session, next_index));
        }

        let session = Uuid::new_v4();
        state.by_job.insert(request.job_id, session);
        state.sessions.insert(
            session,
            RemoteSession {
                job_id: request.job_id,
                chunk_count: request.chunk_count,
                next_index: 0,
                checksums: Vec::new(),
                chunks: Vec::new(),
            },
        );
        Ok(InitiateResponse::fresh(session))
    }

    fn upload_chunk(&self, request: ChunkUploadRequest) -> EngineResult<ChunkUploadResponse> {
        let mut state = self.inner.lock();
        let session = state
            .sessions
            .get_mut(&request.session)
            .ok_or_else(|| EngineError::RemoteRejected("unknown session".into()))?;

        // A chunk the remote already holds is acked again, not re-stored;
        // this is what makes resend-after-lost-ack safe.
        if request.index < session.next_index {
            return Ok(ChunkUploadResponse::ack(request.index));
        }
        if request.index > session.next_index {
            return Ok(ChunkUploadResponse::reject(
                request.index,
                format!("expected chunk {}", session.next_index),
            ));
        }
        if chunk_checksum(&request.payload) != request.checksum {
            return Ok(ChunkUploadResponse::reject(
                request.index,
                "checksum mismatch",
            ));
        }

        session.checksums.push(request.checksum);
        session.chunks.push(request.payload);
        session.next_index += 1;
        Ok(ChunkUploadResponse::ack(request.index))
    }

    fn complete(&self, request: CompleteRequest) -> EngineResult<CompleteResponse> {
        let mut state = self.inner.lock();

        // Completion consumes the session either way: on a mismatch the
        // session is aborted, the client must re-initiate and resend
        // rather than patch chunks in place.
        let session = state
            .sessions
            .remove(&request.session)
            .ok_or_else(|| EngineError::RemoteRejected("unknown session".into()))?;
        state.by_job.remove(&session.job_id);

        if session.next_index < session.chunk_count {
            return Ok(CompleteResponse::Mismatch {
                remote_root: [0; 32],
            });
        }

        let remote_root = merkle_root(&session.checksums)
            .ok_or_else(|| EngineError::RemoteRejected("empty session".into()))?;
        if remote_root != request.merkle_root {
            return Ok(CompleteResponse::Mismatch { remote_root });
        }

        state
            .committed
            .insert(session.job_id, session.chunks.concat());
        Ok(CompleteResponse::Committed)
    }

    fn session_status(&self, request: SessionStatusRequest) -> EngineResult<SessionStatusResponse> {
        let state = self.inner.lock();
        let session = state
            .sessions
            .get(&request.session)
            .ok_or_else(|| EngineError::RemoteRejected("unknown session".into()))?;
        Ok(SessionStatusResponse {
            session: request.session,
            next_index: session.next_index,
        })
    }
}
