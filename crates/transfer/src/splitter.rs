//! Chunk splitting.
//!
//! Splitting is pure arithmetic over the file size: a [`ChunkPlan`] yields
//! byte ranges lazily and never touches the file. Payloads are read later,
//! one chunk at a time, by [`ChunkReader`](crate::ChunkReader).

use crate::error::SplitError;
use crate::options::UploadConfig;
use crate::types::ChunkifyFile;

/// What drives the split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSizing {
    /// Fixed number of bytes per chunk.
    Size(u64),
    /// Target number of chunks; the size is `ceil(file_size / count)`.
    Count(u32),
}

/// Byte range of one chunk: `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub total_count: u32,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether this is the final chunk of its file.
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total_count
    }
}

/// Layout of a file's chunks.
///
/// A zero-byte file gets exactly one empty chunk so the server still
/// records the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_count: u32,
}

impl ChunkPlan {
    pub fn new(file_size: u64, sizing: ChunkSizing) -> Result<Self, SplitError> {
        let chunk_size = match sizing {
            ChunkSizing::Size(0) => return Err(SplitError::ZeroChunkSize),
            ChunkSizing::Size(size) => size,
            ChunkSizing::Count(0) => return Err(SplitError::ZeroChunkCount),
            ChunkSizing::Count(count) => file_size.div_ceil(u64::from(count)).max(1),
        };

        let count = if file_size == 0 {
            1
        } else {
            file_size.div_ceil(chunk_size)
        };
        let total_count = u32::try_from(count).map_err(|_| SplitError::TooManyChunks {
            size: file_size,
            count,
        })?;

        Ok(Self {
            file_size,
            chunk_size,
            total_count,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_count(&self) -> u32 {
        self.total_count
    }

    /// Range of chunk `index`, or `None` past the end.
    pub fn range(&self, index: u32) -> Option<ChunkRange> {
        if index >= self.total_count {
            return None;
        }
        let start = u64::from(index) * self.chunk_size;
        let end = start.saturating_add(self.chunk_size).min(self.file_size);
        Some(ChunkRange {
            index,
            start,
            end,
            total_count: self.total_count,
        })
    }

    /// Iterates the ranges in index order. Each call starts over.
    pub fn iter(&self) -> ChunkRanges {
        ChunkRanges {
            plan: *self,
            next: 0,
        }
    }
}

impl IntoIterator for ChunkPlan {
    type Item = ChunkRange;
    type IntoIter = ChunkRanges;

    fn into_iter(self) -> ChunkRanges {
        self.iter()
    }
}

impl IntoIterator for &ChunkPlan {
    type Item = ChunkRange;
    type IntoIter = ChunkRanges;

    fn into_iter(self) -> ChunkRanges {
        self.iter()
    }
}

/// Lazy iterator over a plan's chunk ranges.
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    plan: ChunkPlan,
    next: u32,
}

impl Iterator for ChunkRanges {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        let range = self.plan.range(self.next)?;
        self.next += 1;
        Some(range)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.plan.total_count - self.next.min(self.plan.total_count)) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkRanges {}

impl std::iter::FusedIterator for ChunkRanges {}

/// Plans the split of `file` under `config`.
pub fn split(file: &ChunkifyFile, config: &UploadConfig) -> Result<ChunkPlan, SplitError> {
    ChunkPlan::new(file.size(), config.sizing)
}
