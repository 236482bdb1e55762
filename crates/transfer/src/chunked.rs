use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::UploadError;
use crate::source::ChunkSource;
use crate::splitter::ChunkRange;
use crate::types::Chunk;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Materialises chunk ranges into payload-carrying [`Chunk`]s.
///
/// Only the requested range is read, so at most one payload per in-flight
/// upload is held in memory.
#[derive(Clone)]
pub struct ChunkReader {
    source: Arc<dyn ChunkSource>,
    reference: String,
    extension: Option<String>,
}

impl ChunkReader {
    pub fn new(source: Arc<dyn ChunkSource>, reference: &str, extension: Option<&str>) -> Self {
        Self {
            source,
            reference: reference.to_string(),
            extension: extension.map(str::to_string),
        }
    }

    /// Reads `range` synchronously.
    pub fn read(&self, range: ChunkRange) -> std::io::Result<Chunk> {
        let len = usize::try_from(range.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "chunk too large")
        })?;
        let data = self.source.read_range(range.start, len)?;
        let checksum = checksum_bytes(&data);
        Ok(Chunk {
            start: range.start,
            end: range.end,
            reference: self.reference.clone(),
            extension: self.extension.clone(),
            total_count: range.total_count,
            index: range.index,
            data: Bytes::from(data),
            checksum,
        })
    }

    /// Reads `range` on the blocking pool.
    pub async fn read_async(&self, range: ChunkRange) -> Result<Chunk, UploadError> {
        let reader = self.clone();
        tokio::task::spawn_blocking(move || reader.read(range))
            .await
            .map_err(|e| UploadError::Join(e.to_string()))?
            .map_err(|source| UploadError::Read {
                index: range.index,
                source,
            })
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }
}
