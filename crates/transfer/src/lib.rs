//! Chunk upload engine.
//!
//! Splits a file into contiguous byte ranges, uploads them through a
//! host-supplied [`Transport`] under a sequential or bounded-parallel
//! policy, retries transient failures per chunk, and folds per-chunk
//! progress into one monotone file-level value.

mod chunked;
mod engine;
mod error;
mod options;
mod progress;
mod retry;
mod scheduler;
mod session;
mod source;
mod splitter;
mod transport;
mod types;

#[cfg(test)]
mod mock;

pub use chunked::{ChunkReader, checksum_bytes};
pub use engine::{Chunkify, UploadEvent, UploadResult};
pub use error::{OptionsError, SplitError, TransportError, UploadError};
pub use options::{
    ChunkifyOptions, DEFAULT_MAX_RETRIES, DEFAULT_NUMBER_OF_CHUNKS, UploadConfig, join_route,
};
pub use progress::{ChunkProgressReporter, ProgressAggregator, ProgressCallback};
pub use retry::RetryPolicy;
pub use scheduler::{DispatchMode, SchedulerReport, UploadScheduler};
pub use session::{SuccessCallback, UploadSession};
pub use source::{ChunkSource, FileSource, MemorySource};
pub use splitter::{ChunkPlan, ChunkRange, ChunkRanges, ChunkSizing, split};
pub use transport::{Transport, TransportFuture, TransportResponse};
pub use types::{
    Chunk, ChunkOutcome, ChunkProgress, ChunkResult, ChunkifyFile, detect_mime_type,
};

pub use chunkify_protocol::{UploadProgress, UploadStatus};
