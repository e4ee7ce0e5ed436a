//! Chunk planning and chunk reads over a source file.

use crate::error::{ProtocolError, ProtocolResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// The fixed division of a source file into chunks.
///
/// A plan is computed once when a job first starts uploading and must never
/// change afterwards: resume points and the remote session both identify
/// chunks by index, so re-planning with a different chunk size would make
/// every recorded index mean something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Total size of the source file in bytes.
    pub total_size: u64,
    /// Size of every chunk except possibly the last.
    pub chunk_size: u64,
    /// Number of chunks in the plan.
    pub chunk_count: u32,
}

impl ChunkPlan {
    /// Builds a plan dividing `total_size` bytes into `chunk_size` chunks.
    ///
    /// The final chunk holds the remainder and may be shorter.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPlan`] if either argument is zero or
    /// the chunk count would overflow `u32`.
    pub fn new(total_size: u64, chunk_size: u64) -> ProtocolResult<Self> {
        if total_size == 0 {
            return Err(ProtocolError::InvalidPlan("total size is zero".into()));
        }
        if chunk_size == 0 {
            return Err(ProtocolError::InvalidPlan("chunk size is zero".into()));
        }
        let chunk_count = u32::try_from(total_size.div_ceil(chunk_size))
            .map_err(|_| ProtocolError::InvalidPlan("chunk count exceeds u32".into()))?;
        Ok(Self {
            total_size,
            chunk_size,
            chunk_count,
        })
    }

    /// Byte offset where the given chunk starts.
    pub fn offset_of(&self, index: u32) -> ProtocolResult<u64> {
        self.check_index(index)?;
        Ok(u64::from(index) * self.chunk_size)
    }

    /// Length of the given chunk; only the last chunk may be shorter.
    pub fn len_of(&self, index: u32) -> ProtocolResult<u64> {
        let offset = self.offset_of(index)?;
        Ok(self.chunk_size.min(self.total_size - offset))
    }

    /// True if `index` is the final chunk in the plan.
    #[must_use]
    pub fn is_last(&self, index: u32) -> bool {
        index + 1 == self.chunk_count
    }

    fn check_index(&self, index: u32) -> ProtocolResult<()> {
        if index >= self.chunk_count {
            return Err(ProtocolError::ChunkOutOfRange {
                index,
                count: self.chunk_count,
            });
        }
        Ok(())
    }
}

/// Reads individual chunks from a source file on demand.
///
/// Chunks are read lazily so a multi-gigabyte slide never has to fit in
/// memory. Each read re-checks the file size against the plan: a slide file
/// rewritten mid-upload would otherwise produce silently wrong chunks.
#[derive(Debug)]
pub struct ChunkReader {
    path: PathBuf,
    file: File,
    plan: ChunkPlan,
}

impl ChunkReader {
    /// Opens the source file and validates its size against the plan.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SizeMismatch`] if the file size no longer
    /// matches the plan.
    pub fn open(path: &Path, plan: ChunkPlan) -> ProtocolResult<Self> {
        let file = File::open(path)?;
        let actual = file.metadata()?.len();
        if actual != plan.total_size {
            return Err(ProtocolError::SizeMismatch {
                expected: plan.total_size,
                actual,
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            plan,
        })
    }

    /// Returns the plan this reader was opened with.
    #[must_use]
    pub fn plan(&self) -> ChunkPlan {
        self.plan
    }

    /// Returns the path of the source file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads one chunk's bytes.
    pub fn read_chunk(&mut self, index: u32) -> ProtocolResult<Vec<u8>> {
        let offset = self.plan.offset_of(index)?;
        let len = self.plan.len_of(index)? as usize;

        let actual = self.file.metadata()?.len();
        if actual != self.plan.total_size {
            return Err(ProtocolError::SizeMismatch {
                expected: self.plan.total_size,
                actual,
            });
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

/// SHA-256 checksum of a chunk's bytes.
#[must_use]
pub fn chunk_checksum(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn plan_divides_with_short_tail() {
        // 24 MB at 5 MB chunks: four full chunks and a 4 MB tail.
        let plan = ChunkPlan::new(24 * MIB, 5 * MIB).unwrap();
        assert_eq!(plan.chunk_count, 5);
        assert_eq!(plan.len_of(0).unwrap(), 5 * MIB);
        assert_eq!(plan.len_of(3).unwrap(), 5 * MIB);
        assert_eq!(plan.len_of(4).unwrap(), 4 * MIB);
        assert_eq!(plan.offset_of(4).unwrap(), 20 * MIB);
        assert!(plan.is_last(4));
        assert!(!plan.is_last(3));
    }

    #[test]
    fn plan_for_exact_multiple() {
        let plan = ChunkPlan::new(10 * MIB, 5 * MIB).unwrap();
        assert_eq!(plan.chunk_count, 2);
        assert_eq!(plan.len_of(1).unwrap(), 5 * MIB);
    }

    #[test]
    fn plan_for_file_smaller_than_chunk() {
        let plan = ChunkPlan::new(100, 5 * MIB).unwrap();
        assert_eq!(plan.chunk_count, 1);
        assert_eq!(plan.len_of(0).unwrap(), 100);
    }

    #[test]
    fn plan_rejects_zero_inputs() {
        assert!(matches!(
            ChunkPlan::new(0, MIB),
            Err(ProtocolError::InvalidPlan(_))
        ));
        assert!(matches!(
            ChunkPlan::new(MIB, 0),
            Err(ProtocolError::InvalidPlan(_))
        ));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let plan = ChunkPlan::new(100, 40).unwrap();
        assert!(matches!(
            plan.offset_of(3),
            Err(ProtocolError::ChunkOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn reader_reads_exact_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slide.svs");
        let data: Vec<u8> = (0..100u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let plan = ChunkPlan::new(100, 40).unwrap();
        let mut reader = ChunkReader::open(&path, plan).unwrap();

        assert_eq!(reader.read_chunk(0).unwrap(), &data[0..40]);
        assert_eq!(reader.read_chunk(1).unwrap(), &data[40..80]);
        assert_eq!(reader.read_chunk(2).unwrap(), &data[80..100]);
    }

    #[test]
    fn reader_rejects_resized_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slide.svs");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 100])
            .unwrap();

        let plan = ChunkPlan::new(100, 40).unwrap();
        let mut reader = ChunkReader::open(&path, plan).unwrap();

        // Grow the file behind the reader's back.
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[1u8; 10])
            .unwrap();

        assert!(matches!(
            reader.read_chunk(0),
            Err(ProtocolError::SizeMismatch {
                expected: 100,
                actual: 110
            })
        ));
    }

    #[test]
    fn reader_open_rejects_wrong_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slide.svs");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 90])
            .unwrap();

        let plan = ChunkPlan::new(100, 40).unwrap();
        assert!(matches!(
            ChunkReader::open(&path, plan),
            Err(ProtocolError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn checksum_is_deterministic_and_distinct() {
        let a = chunk_checksum(b"chunk data");
        let b = chunk_checksum(b"chunk data");
        let c = chunk_checksum(b"other data");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
