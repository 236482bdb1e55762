//! Wire-level types for chunked uploads.
//!
//! Everything a chunk-receiving server needs to reassemble a file lives
//! here: the per-chunk metadata header, field and header names for both
//! request encodings, and the serialisable progress snapshot.

pub mod constants;
pub mod types;

// Re-export primary types for convenience.
pub use constants::WireEncoding;
pub use types::{ChunkHeader, UploadProgress, UploadStatus};
