//! Append-only queue log with checksummed envelopes.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use crate::record::{LogRecord, LogRecordType, LOG_MAGIC, LOG_VERSION};
use parking_lot::Mutex;

/// Header size for log records.
/// magic (4) + version (2) + type (1) + length (4) = 11 bytes
const HEADER_SIZE: usize = 11;

/// CRC size.
const CRC_SIZE: usize = 4;

/// Manages appends to and recovery scans of the queue log.
///
/// Every record is wrapped in an envelope carrying magic bytes, a format
/// version, the record type, the payload length, and a CRC32 over header
/// plus payload. Recovery is a forward scan: a truncated tail (torn write
/// from an unclean shutdown) is treated as end-of-log, while a CRC mismatch
/// in the middle of the log is surfaced as corruption.
pub struct QueueLog {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl QueueLog {
    /// Creates a new queue log over the given backend.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_write,
        }
    }

    /// Appends a record, returning the offset where it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds the 4-byte length field or
    /// an I/O error occurs.
    pub fn append(&self, record: &LogRecord) -> StoreResult<u64> {
        let payload = record.encode_payload()?;
        let record_type = record.record_type();

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(record_type.as_byte());

        let len = u32::try_from(payload.len())
            .map_err(|_| StoreError::corrupted("record payload too large"))?;
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;

        if self.sync_on_write {
            backend.flush()?;
        }

        Ok(offset)
    }

    /// Flushes all pending writes to durable storage.
    pub fn flush(&self) -> StoreResult<()> {
        self.backend.lock().flush()
    }

    /// Syncs data and metadata to durable storage.
    pub fn sync(&self) -> StoreResult<()> {
        self.backend.lock().sync()
    }

    /// Returns the current log size in bytes.
    pub fn size(&self) -> StoreResult<u64> {
        self.backend.lock().size()
    }

    /// Reads all records from the start of the log.
    ///
    /// An incomplete record at the tail ends the scan silently; corruption
    /// before the tail is an error.
    pub fn read_all(&self) -> StoreResult<Vec<LogRecord>> {
        let backend = self.backend.lock();
        let total = backend.size()?;
        let mut records = Vec::new();
        let mut offset = 0u64;

        while offset + (HEADER_SIZE as u64) <= total {
            let header = backend.read_at(offset, HEADER_SIZE)?;

            if header[0..4] != LOG_MAGIC {
                return Err(StoreError::corrupted(format!(
                    "invalid magic at offset {offset}"
                )));
            }

            let version = u16::from_le_bytes([header[4], header[5]]);
            if version > LOG_VERSION {
                return Err(StoreError::corrupted(format!(
                    "unsupported log version {version} at offset {offset}"
                )));
            }

            let type_byte = header[6];
            let record_type = LogRecordType::from_byte(type_byte).ok_or_else(|| {
                StoreError::corrupted(format!(
                    "unknown record type {type_byte} at offset {offset}"
                ))
            })?;

            let payload_len =
                u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as u64;
            let record_end = offset + HEADER_SIZE as u64 + payload_len + CRC_SIZE as u64;
            if record_end > total {
                // Torn write at the tail; everything before it is valid.
                break;
            }

            let body = backend.read_at(
                offset + HEADER_SIZE as u64,
                payload_len as usize + CRC_SIZE,
            )?;
            let payload = &body[..payload_len as usize];
            let stored_crc = u32::from_le_bytes([
                body[payload_len as usize],
                body[payload_len as usize + 1],
                body[payload_len as usize + 2],
                body[payload_len as usize + 3],
            ]);

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&header);
            hasher.update(payload);
            let computed_crc = hasher.finalize();

            if stored_crc != computed_crc {
                return Err(StoreError::corrupted(format!(
                    "crc mismatch at offset {offset}: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
                )));
            }

            records.push(LogRecord::decode_payload(record_type, payload)?);
            offset = record_end;
        }

        Ok(records)
    }

    /// Rewrites the log with the given records and syncs.
    ///
    /// Used by compaction to replace the history with a minimal snapshot.
    pub fn rewrite(&self, records: &[LogRecord]) -> StoreResult<()> {
        let mut encoded = Vec::new();
        for record in records {
            let payload = record.encode_payload()?;
            let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
            data.extend_from_slice(&LOG_MAGIC);
            data.extend_from_slice(&LOG_VERSION.to_le_bytes());
            data.push(record.record_type().as_byte());
            let len = u32::try_from(payload.len())
                .map_err(|_| StoreError::corrupted("record payload too large"))?;
            data.extend_from_slice(&len.to_le_bytes());
            data.extend_from_slice(&payload);
            let crc = crc32fast::hash(&data);
            data.extend_from_slice(&crc.to_le_bytes());
            encoded.push(data);
        }

        let mut backend = self.backend.lock();
        backend.truncate(0)?;
        for data in &encoded {
            backend.append(data)?;
        }
        backend.sync()
    }
}

impl std::fmt::Debug for QueueLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueLog")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::types::{ChunkState, JobId};

    fn create_log() -> QueueLog {
        QueueLog::new(Box::new(InMemoryBackend::new()), false)
    }

    fn plan_record(job_id: JobId) -> LogRecord {
        LogRecord::ChunkPlanned {
            job_id,
            chunk_size: 1024,
            chunk_count: 8,
        }
    }

    #[test]
    fn append_and_read_back() {
        let log = create_log();
        let job_id = JobId::generate();
        log.append(&plan_record(job_id)).unwrap();
        log.append(&LogRecord::ChunkStateChanged {
            job_id,
            index: 0,
            state: ChunkState::Sent,
            checksum: Some([7; 32]),
        })
        .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], plan_record(job_id));
    }

    #[test]
    fn empty_log_reads_empty() {
        let log = create_log();
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_tolerated() {
        let job_id = JobId::generate();
        let backend = InMemoryBackend::new();
        let log = QueueLog::new(Box::new(backend), false);
        log.append(&plan_record(job_id)).unwrap();
        log.append(&plan_record(job_id)).unwrap();

        // Chop bytes off the second record to simulate a torn write.
        let data = {
            let backend = log.backend.lock();
            let size = backend.size().unwrap();
            backend.read_at(0, size as usize - 5).unwrap()
        };
        let log = QueueLog::new(Box::new(InMemoryBackend::with_data(data)), false);

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn corrupted_crc_is_an_error() {
        let job_id = JobId::generate();
        let log = create_log();
        log.append(&plan_record(job_id)).unwrap();

        let mut data = {
            let backend = log.backend.lock();
            let size = backend.size().unwrap();
            backend.read_at(0, size as usize).unwrap()
        };
        // Flip a payload byte; the CRC no longer matches.
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        let log = QueueLog::new(Box::new(InMemoryBackend::with_data(data)), false);

        assert!(matches!(log.read_all(), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn bad_magic_is_an_error() {
        let log = QueueLog::new(
            Box::new(InMemoryBackend::with_data(vec![0u8; 32])),
            false,
        );
        assert!(matches!(log.read_all(), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn rewrite_replaces_history() {
        let job_id = JobId::generate();
        let log = create_log();
        for _ in 0..5 {
            log.append(&plan_record(job_id)).unwrap();
        }

        log.rewrite(&[plan_record(job_id)]).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 1);
    }
}
