//! Queue log record types and serialization.

use crate::error::{StoreError, StoreResult};
use crate::types::{ChunkState, JobId, JobMetadata, JobState};

/// Magic bytes identifying a queue log record.
pub const LOG_MAGIC: [u8; 4] = *b"SSQL";

/// Current queue log format version.
pub const LOG_VERSION: u16 = 1;

/// Type of queue log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// A new job was enqueued.
    JobCreated = 1,
    /// The chunk plan was fixed for a job.
    ChunkPlanned = 2,
    /// A remote upload session was opened.
    SessionOpened = 3,
    /// One chunk changed acknowledgment state.
    ChunkStateChanged = 4,
    /// The job changed lifecycle state.
    JobStateChanged = 5,
    /// A job-level retry was recorded.
    RetryRecorded = 6,
    /// All chunk progress and the session were discarded for re-verification.
    ChunkProgressReset = 7,
}

impl LogRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::JobCreated),
            2 => Some(Self::ChunkPlanned),
            3 => Some(Self::SessionOpened),
            4 => Some(Self::ChunkStateChanged),
            5 => Some(Self::JobStateChanged),
            6 => Some(Self::RetryRecorded),
            7 => Some(Self::ChunkProgressReset),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

fn job_state_byte(state: JobState) -> u8 {
    match state {
        JobState::Queued => 1,
        JobState::Uploading => 2,
        JobState::Paused => 3,
        JobState::Completed => 4,
        JobState::Failed => 5,
    }
}

fn job_state_from_byte(b: u8) -> StoreResult<JobState> {
    match b {
        1 => Ok(JobState::Queued),
        2 => Ok(JobState::Uploading),
        3 => Ok(JobState::Paused),
        4 => Ok(JobState::Completed),
        5 => Ok(JobState::Failed),
        _ => Err(StoreError::corrupted(format!("unknown job state byte {b}"))),
    }
}

fn chunk_state_byte(state: ChunkState) -> u8 {
    match state {
        ChunkState::Pending => 1,
        ChunkState::Sent => 2,
        ChunkState::Acked => 3,
        ChunkState::Rejected => 4,
    }
}

fn chunk_state_from_byte(b: u8) -> StoreResult<ChunkState> {
    match b {
        1 => Ok(ChunkState::Pending),
        2 => Ok(ChunkState::Sent),
        3 => Ok(ChunkState::Acked),
        4 => Ok(ChunkState::Rejected),
        _ => Err(StoreError::corrupted(format!(
            "unknown chunk state byte {b}"
        ))),
    }
}

/// A queue log record representing one durable mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A new job was enqueued.
    JobCreated {
        /// Job identifier.
        job_id: JobId,
        /// Local source path.
        source_path: String,
        /// Total payload size in bytes.
        total_size: u64,
        /// Priority (lower = more urgent).
        priority: u8,
        /// Enqueue time, milliseconds since the Unix epoch.
        created_at_ms: u64,
        /// Store-assigned enqueue sequence.
        enqueue_seq: u64,
        /// Caller metadata.
        metadata: JobMetadata,
    },

    /// The chunk plan was fixed for a job.
    ChunkPlanned {
        /// Job identifier.
        job_id: JobId,
        /// Fixed chunk size in bytes.
        chunk_size: u64,
        /// Total number of chunks.
        chunk_count: u32,
    },

    /// A remote upload session was opened.
    SessionOpened {
        /// Job identifier.
        job_id: JobId,
        /// Remote session id.
        session: [u8; 16],
    },

    /// One chunk changed acknowledgment state.
    ChunkStateChanged {
        /// Job identifier.
        job_id: JobId,
        /// Chunk index.
        index: u32,
        /// New state.
        state: ChunkState,
        /// Checksum recorded when the chunk was sent.
        checksum: Option<[u8; 32]>,
    },

    /// The job changed lifecycle state.
    JobStateChanged {
        /// Job identifier.
        job_id: JobId,
        /// New state.
        state: JobState,
        /// Reason for a pause or failure.
        reason: Option<String>,
    },

    /// A job-level retry was recorded.
    RetryRecorded {
        /// Job identifier.
        job_id: JobId,
        /// Retry count after this retry.
        retry_count: u32,
        /// What went wrong.
        reason: String,
    },

    /// All chunk progress and the session were discarded for re-verification.
    ChunkProgressReset {
        /// Job identifier.
        job_id: JobId,
    },
}

impl LogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::JobCreated { .. } => LogRecordType::JobCreated,
            Self::ChunkPlanned { .. } => LogRecordType::ChunkPlanned,
            Self::SessionOpened { .. } => LogRecordType::SessionOpened,
            Self::ChunkStateChanged { .. } => LogRecordType::ChunkStateChanged,
            Self::JobStateChanged { .. } => LogRecordType::JobStateChanged,
            Self::RetryRecorded { .. } => LogRecordType::RetryRecorded,
            Self::ChunkProgressReset { .. } => LogRecordType::ChunkProgressReset,
        }
    }

    /// Returns the job this record belongs to.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        match self {
            Self::JobCreated { job_id, .. }
            | Self::ChunkPlanned { job_id, .. }
            | Self::SessionOpened { job_id, .. }
            | Self::ChunkStateChanged { job_id, .. }
            | Self::JobStateChanged { job_id, .. }
            | Self::RetryRecorded { job_id, .. }
            | Self::ChunkProgressReset { job_id } => *job_id,
        }
    }

    /// Serializes the record payload (without envelope).
    pub fn encode_payload(&self) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::new();

        let write_string = |buf: &mut Vec<u8>, s: &str| -> StoreResult<()> {
            let len = u32::try_from(s.len())
                .map_err(|_| StoreError::InvalidJob("string field too large".into()))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
            Ok(())
        };

        match self {
            Self::JobCreated {
                job_id,
                source_path,
                total_size,
                priority,
                created_at_ms,
                enqueue_seq,
                metadata,
            } => {
                buf.extend_from_slice(&job_id.as_bytes());
                write_string(&mut buf, source_path)?;
                buf.extend_from_slice(&total_size.to_le_bytes());
                buf.push(*priority);
                buf.extend_from_slice(&created_at_ms.to_le_bytes());
                buf.extend_from_slice(&enqueue_seq.to_le_bytes());
                let count = u32::try_from(metadata.len())
                    .map_err(|_| StoreError::InvalidJob("metadata too large".into()))?;
                buf.extend_from_slice(&count.to_le_bytes());
                for (key, value) in metadata {
                    write_string(&mut buf, key)?;
                    write_string(&mut buf, value)?;
                }
            }

            Self::ChunkPlanned {
                job_id,
                chunk_size,
                chunk_count,
            } => {
                buf.extend_from_slice(&job_id.as_bytes());
                buf.extend_from_slice(&chunk_size.to_le_bytes());
                buf.extend_from_slice(&chunk_count.to_le_bytes());
            }

            Self::SessionOpened { job_id, session } => {
                buf.extend_from_slice(&job_id.as_bytes());
                buf.extend_from_slice(session);
            }

            Self::ChunkStateChanged {
                job_id,
                index,
                state,
                checksum,
            } => {
                buf.extend_from_slice(&job_id.as_bytes());
                buf.extend_from_slice(&index.to_le_bytes());
                buf.push(chunk_state_byte(*state));
                if let Some(checksum) = checksum {
                    buf.push(1);
                    buf.extend_from_slice(checksum);
                } else {
                    buf.push(0);
                }
            }

            Self::JobStateChanged {
                job_id,
                state,
                reason,
            } => {
                buf.extend_from_slice(&job_id.as_bytes());
                buf.push(job_state_byte(*state));
                if let Some(reason) = reason {
                    buf.push(1);
                    write_string(&mut buf, reason)?;
                } else {
                    buf.push(0);
                }
            }

            Self::RetryRecorded {
                job_id,
                retry_count,
                reason,
            } => {
                buf.extend_from_slice(&job_id.as_bytes());
                buf.extend_from_slice(&retry_count.to_le_bytes());
                write_string(&mut buf, reason)?;
            }

            Self::ChunkProgressReset { job_id } => {
                buf.extend_from_slice(&job_id.as_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: LogRecordType, payload: &[u8]) -> StoreResult<Self> {
        let mut cursor = 0usize;

        let read_u64 = |cursor: &mut usize| -> StoreResult<u64> {
            if *cursor + 8 > payload.len() {
                return Err(StoreError::corrupted("unexpected end of payload"));
            }
            let bytes: [u8; 8] = payload[*cursor..*cursor + 8]
                .try_into()
                .map_err(|_| StoreError::corrupted("invalid u64"))?;
            *cursor += 8;
            Ok(u64::from_le_bytes(bytes))
        };

        let read_u32 = |cursor: &mut usize| -> StoreResult<u32> {
            if *cursor + 4 > payload.len() {
                return Err(StoreError::corrupted("unexpected end of payload"));
            }
            let bytes: [u8; 4] = payload[*cursor..*cursor + 4]
                .try_into()
                .map_err(|_| StoreError::corrupted("invalid u32"))?;
            *cursor += 4;
            Ok(u32::from_le_bytes(bytes))
        };

        let read_u8 = |cursor: &mut usize| -> StoreResult<u8> {
            if *cursor >= payload.len() {
                return Err(StoreError::corrupted("unexpected end of payload"));
            }
            let byte = payload[*cursor];
            *cursor += 1;
            Ok(byte)
        };

        let read_bytes16 = |cursor: &mut usize| -> StoreResult<[u8; 16]> {
            if *cursor + 16 > payload.len() {
                return Err(StoreError::corrupted("unexpected end of payload"));
            }
            let bytes: [u8; 16] = payload[*cursor..*cursor + 16]
                .try_into()
                .map_err(|_| StoreError::corrupted("invalid 16-byte field"))?;
            *cursor += 16;
            Ok(bytes)
        };

        let read_string = |cursor: &mut usize| -> StoreResult<String> {
            let len = {
                if *cursor + 4 > payload.len() {
                    return Err(StoreError::corrupted("unexpected end of string length"));
                }
                let bytes: [u8; 4] = payload[*cursor..*cursor + 4]
                    .try_into()
                    .map_err(|_| StoreError::corrupted("invalid string length"))?;
                *cursor += 4;
                u32::from_le_bytes(bytes) as usize
            };
            if *cursor + len > payload.len() {
                return Err(StoreError::corrupted("unexpected end of string"));
            }
            let s = std::str::from_utf8(&payload[*cursor..*cursor + len])
                .map_err(|_| StoreError::corrupted("invalid utf-8 in string field"))?
                .to_string();
            *cursor += len;
            Ok(s)
        };

        let check_exhausted = |cursor: usize| -> StoreResult<()> {
            if cursor != payload.len() {
                return Err(StoreError::corrupted(format!(
                    "trailing bytes in record: expected {} bytes, got {}",
                    cursor,
                    payload.len()
                )));
            }
            Ok(())
        };

        match record_type {
            LogRecordType::JobCreated => {
                let job_id = JobId::from_bytes(read_bytes16(&mut cursor)?);
                let source_path = read_string(&mut cursor)?;
                let total_size = read_u64(&mut cursor)?;
                let priority = read_u8(&mut cursor)?;
                let created_at_ms = read_u64(&mut cursor)?;
                let enqueue_seq = read_u64(&mut cursor)?;
                let count = read_u32(&mut cursor)? as usize;
                let mut metadata = JobMetadata::new();
                for _ in 0..count {
                    let key = read_string(&mut cursor)?;
                    let value = read_string(&mut cursor)?;
                    metadata.insert(key, value);
                }
                check_exhausted(cursor)?;
                Ok(Self::JobCreated {
                    job_id,
                    source_path,
                    total_size,
                    priority,
                    created_at_ms,
                    enqueue_seq,
                    metadata,
                })
            }

            LogRecordType::ChunkPlanned => {
                let job_id = JobId::from_bytes(read_bytes16(&mut cursor)?);
                let chunk_size = read_u64(&mut cursor)?;
                let chunk_count = read_u32(&mut cursor)?;
                check_exhausted(cursor)?;
                Ok(Self::ChunkPlanned {
                    job_id,
                    chunk_size,
                    chunk_count,
                })
            }

            LogRecordType::SessionOpened => {
                let job_id = JobId::from_bytes(read_bytes16(&mut cursor)?);
                let session = read_bytes16(&mut cursor)?;
                check_exhausted(cursor)?;
                Ok(Self::SessionOpened { job_id, session })
            }

            LogRecordType::ChunkStateChanged => {
                let job_id = JobId::from_bytes(read_bytes16(&mut cursor)?);
                let index = read_u32(&mut cursor)?;
                let state = chunk_state_from_byte(read_u8(&mut cursor)?)?;
                let has_checksum = read_u8(&mut cursor)? != 0;
                let checksum = if has_checksum {
                    if cursor + 32 > payload.len() {
                        return Err(StoreError::corrupted("unexpected end of checksum"));
                    }
                    let bytes: [u8; 32] = payload[cursor..cursor + 32]
                        .try_into()
                        .map_err(|_| StoreError::corrupted("invalid checksum"))?;
                    cursor += 32;
                    Some(bytes)
                } else {
                    None
                };
                check_exhausted(cursor)?;
                Ok(Self::ChunkStateChanged {
                    job_id,
                    index,
                    state,
                    checksum,
                })
            }

            LogRecordType::JobStateChanged => {
                let job_id = JobId::from_bytes(read_bytes16(&mut cursor)?);
                let state = job_state_from_byte(read_u8(&mut cursor)?)?;
                let has_reason = read_u8(&mut cursor)? != 0;
                let reason = if has_reason {
                    Some(read_string(&mut cursor)?)
                } else {
                    None
                };
                check_exhausted(cursor)?;
                Ok(Self::JobStateChanged {
                    job_id,
                    state,
                    reason,
                })
            }

            LogRecordType::RetryRecorded => {
                let job_id = JobId::from_bytes(read_bytes16(&mut cursor)?);
                let retry_count = read_u32(&mut cursor)?;
                let reason = read_string(&mut cursor)?;
                check_exhausted(cursor)?;
                Ok(Self::RetryRecorded {
                    job_id,
                    retry_count,
                    reason,
                })
            }

            LogRecordType::ChunkProgressReset => {
                let job_id = JobId::from_bytes(read_bytes16(&mut cursor)?);
                check_exhausted(cursor)?;
                Ok(Self::ChunkProgressReset { job_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: LogRecord) {
        let payload = record.encode_payload().unwrap();
        let decoded = LogRecord::decode_payload(record.record_type(), &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn record_type_roundtrip() {
        for t in [
            LogRecordType::JobCreated,
            LogRecordType::ChunkPlanned,
            LogRecordType::SessionOpened,
            LogRecordType::ChunkStateChanged,
            LogRecordType::JobStateChanged,
            LogRecordType::RetryRecorded,
            LogRecordType::ChunkProgressReset,
        ] {
            assert_eq!(LogRecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(LogRecordType::from_byte(0), None);
        assert_eq!(LogRecordType::from_byte(99), None);
    }

    #[test]
    fn job_created_roundtrip() {
        let mut metadata = JobMetadata::new();
        metadata.insert("slide_id".into(), "S-1042".into());
        metadata.insert("case_type".into(), "biopsy".into());

        roundtrip(LogRecord::JobCreated {
            job_id: JobId::generate(),
            source_path: "/data/slides/S-1042.svs".into(),
            total_size: 24 * 1024 * 1024,
            priority: 1,
            created_at_ms: 1_700_000_000_000,
            enqueue_seq: 7,
            metadata,
        });
    }

    #[test]
    fn job_created_empty_metadata() {
        roundtrip(LogRecord::JobCreated {
            job_id: JobId::generate(),
            source_path: "/tmp/a.bin".into(),
            total_size: 1,
            priority: 10,
            created_at_ms: 0,
            enqueue_seq: 0,
            metadata: JobMetadata::new(),
        });
    }

    #[test]
    fn chunk_planned_roundtrip() {
        roundtrip(LogRecord::ChunkPlanned {
            job_id: JobId::generate(),
            chunk_size: 5 * 1024 * 1024,
            chunk_count: 5,
        });
    }

    #[test]
    fn session_opened_roundtrip() {
        roundtrip(LogRecord::SessionOpened {
            job_id: JobId::generate(),
            session: [0xAB; 16],
        });
    }

    #[test]
    fn chunk_state_roundtrip() {
        roundtrip(LogRecord::ChunkStateChanged {
            job_id: JobId::generate(),
            index: 3,
            state: ChunkState::Sent,
            checksum: Some([0x42; 32]),
        });
        roundtrip(LogRecord::ChunkStateChanged {
            job_id: JobId::generate(),
            index: 0,
            state: ChunkState::Acked,
            checksum: None,
        });
    }

    #[test]
    fn job_state_roundtrip() {
        roundtrip(LogRecord::JobStateChanged {
            job_id: JobId::generate(),
            state: JobState::Paused,
            reason: Some("network timeout".into()),
        });
        roundtrip(LogRecord::JobStateChanged {
            job_id: JobId::generate(),
            state: JobState::Uploading,
            reason: None,
        });
    }

    #[test]
    fn retry_recorded_roundtrip() {
        roundtrip(LogRecord::RetryRecorded {
            job_id: JobId::generate(),
            retry_count: 2,
            reason: "remote unavailable".into(),
        });
    }

    #[test]
    fn chunk_progress_reset_roundtrip() {
        roundtrip(LogRecord::ChunkProgressReset {
            job_id: JobId::generate(),
        });
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let record = LogRecord::ChunkPlanned {
            job_id: JobId::generate(),
            chunk_size: 100,
            chunk_count: 4,
        };
        let payload = record.encode_payload().unwrap();
        let result = LogRecord::decode_payload(LogRecordType::ChunkPlanned, &payload[..10]);
        assert!(matches!(result, Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let record = LogRecord::SessionOpened {
            job_id: JobId::generate(),
            session: [1; 16],
        };
        let mut payload = record.encode_payload().unwrap();
        payload.push(0xFF);
        let result = LogRecord::decode_payload(LogRecordType::SessionOpened, &payload);
        assert!(matches!(result, Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn unknown_state_bytes_are_corruption() {
        assert!(job_state_from_byte(0).is_err());
        assert!(chunk_state_from_byte(9).is_err());
    }
}
