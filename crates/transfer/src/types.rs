use std::path::Path;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use chunkify_protocol::{ChunkHeader, UploadProgress};
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressAggregator;
use crate::source::{ChunkSource, FileSource, MemorySource};

/// A chunk with its payload, ready to send.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset of the first payload byte within the file.
    pub start: u64,
    /// Offset one past the last payload byte.
    pub end: u64,
    /// Identifier shared by all chunks of the parent file.
    pub reference: String,
    pub extension: Option<String>,
    pub total_count: u32,
    pub index: u32,
    /// Raw chunk data.
    pub data: Bytes,
    /// SHA-256 hex checksum of `data`.
    pub checksum: String,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Metadata the server needs to place this chunk.
    pub fn header(&self) -> ChunkHeader {
        ChunkHeader {
            reference: self.reference.clone(),
            index: self.index,
            total_count: self.total_count,
            extension: self.extension.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

/// Partial-send progress of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkProgress {
    pub reference: String,
    pub index: u32,
    /// 0-100 for this chunk alone.
    pub percentage: f64,
}

/// Final state of one dispatched chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResult {
    Uploaded,
    Failed(String),
    /// Stopped retrying because a sibling chunk failed the file.
    Abandoned,
    Cancelled,
}

/// Outcome the scheduler records for every chunk it dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub index: u32,
    /// Transport calls made, including the successful one.
    pub attempts: u32,
    pub result: ChunkResult,
}

impl ChunkOutcome {
    pub fn is_uploaded(&self) -> bool {
        self.result == ChunkResult::Uploaded
    }
}

/// One selected file plus the state the engine keeps for it.
pub struct ChunkifyFile {
    source: RwLock<Option<Arc<dyn ChunkSource>>>,
    uuid: String,
    name: String,
    size: u64,
    mime_type: String,
    extension: Option<String>,
    url: String,
    progress: Arc<ProgressAggregator>,
    cancel: CancellationToken,
}

impl ChunkifyFile {
    /// Wraps an arbitrary source under a fresh UUID.
    pub fn new(name: &str, source: Arc<dyn ChunkSource>, url: &str) -> Self {
        let uuid = uuid::Uuid::new_v4().to_string();
        let size = source.size();
        let extension = extension_of(name);
        let mime_type = detect_mime_type(name).to_string();
        Self {
            progress: Arc::new(ProgressAggregator::new(&uuid, name, size)),
            source: RwLock::new(Some(source)),
            uuid,
            name: name.to_string(),
            size,
            mime_type,
            extension,
            url: url.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Opens a local file.
    pub fn open(path: &Path, url: &str) -> std::io::Result<Self> {
        let source = FileSource::open(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self::new(&name, Arc::new(source), url))
    }

    /// Uploads an in-memory buffer under `name`.
    pub fn from_bytes(name: &str, data: impl Into<Vec<u8>>, url: &str) -> Self {
        Self::new(name, Arc::new(MemorySource::new(data)), url)
    }

    /// Unique identifier, sent as every chunk's `reference`.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Lower-case filename extension without the dot.
    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// URL the chunks of this file are sent to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Aggregate progress, 0-100.
    pub fn progress(&self) -> f64 {
        self.progress.percentage()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.progress.uploaded_bytes()
    }

    pub fn snapshot(&self) -> UploadProgress {
        self.progress.snapshot()
    }

    /// Abort handle. Cancelling it stops the file's session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn aggregator(&self) -> &Arc<ProgressAggregator> {
        &self.progress
    }

    /// The byte source, or `None` once the session has released it.
    pub(crate) fn source(&self) -> Option<Arc<dyn ChunkSource>> {
        self.source.read().ok().and_then(|s| s.clone())
    }

    pub(crate) fn release_source(&self) {
        if let Ok(mut source) = self.source.write() {
            source.take();
        }
    }
}

impl std::fmt::Debug for ChunkifyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkifyFile")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mime_type", &self.mime_type)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_lowercase())
}

/// Guesses a MIME type from the filename extension.
pub fn detect_mime_type(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("json") => "application/json",
        Some("txt" | "log") => "text/plain",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_fills_metadata() {
        let file = ChunkifyFile::from_bytes("Movie.MP4", b"abc".to_vec(), "/upload");
        assert_eq!(file.name(), "Movie.MP4");
        assert_eq!(file.size(), 3);
        assert_eq!(file.extension(), Some("mp4"));
        assert_eq!(file.mime_type(), "video/mp4");
        assert_eq!(file.url(), "/upload");
        assert_eq!(file.progress(), 0.0);
        assert_eq!(file.uploaded_bytes(), 0);
        assert!(uuid::Uuid::parse_str(file.uuid()).is_ok());
    }

    #[test]
    fn every_file_gets_its_own_uuid() {
        let a = ChunkifyFile::from_bytes("a", Vec::new(), "/u");
        let b = ChunkifyFile::from_bytes("a", Vec::new(), "/u");
        assert_ne!(a.uuid(), b.uuid());
    }

    #[test]
    fn open_reads_name_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();

        let file = ChunkifyFile::open(&path, "/upload").unwrap();
        assert_eq!(file.name(), "report.pdf");
        assert_eq!(file.size(), 8);
        assert_eq!(file.mime_type(), "application/pdf");
    }

    #[test]
    fn release_drops_source() {
        let file = ChunkifyFile::from_bytes("a.bin", b"xyz".to_vec(), "/u");
        assert!(file.source().is_some());
        file.release_source();
        assert!(file.source().is_none());
    }

    #[test]
    fn mime_type_fallbacks() {
        assert_eq!(detect_mime_type("noext"), "application/octet-stream");
        assert_eq!(detect_mime_type("archive.unknown"), "application/octet-stream");
        assert_eq!(detect_mime_type("PHOTO.JPEG"), "image/jpeg");
    }

    #[test]
    fn chunk_header_copies_metadata() {
        let chunk = Chunk {
            start: 10,
            end: 20,
            reference: "ref".into(),
            extension: Some("txt".into()),
            total_count: 3,
            index: 1,
            data: Bytes::from(vec![0; 10]),
            checksum: "abc".into(),
        };
        assert_eq!(chunk.len(), 10);
        let header = chunk.header();
        assert_eq!(header.reference, "ref");
        assert_eq!(header.index, 1);
        assert_eq!(header.total_count, 3);
        assert_eq!(header.extension.as_deref(), Some("txt"));
        assert_eq!(header.checksum, "abc");
    }
}
