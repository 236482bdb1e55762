//! Error types for the upload engine.

/// Invalid input to the chunk splitter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("number of chunks must be greater than zero")]
    ZeroChunkCount,

    #[error("file of {size} bytes needs {count} chunks, more than the supported maximum")]
    TooManyChunks { size: u64, count: u64 },
}

/// Failure of a single transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server rejected chunk with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The request could not be built (bad header value, unknown verb).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether a fresh attempt could plausibly succeed.
    ///
    /// Network failures, timeouts, 5xx, 408 and 429 are transient; every
    /// other rejection is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Rejected { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            Self::InvalidRequest(_) | Self::Cancelled => false,
        }
    }
}

/// Terminal failure of a file upload session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("split error: {0}")]
    Split(#[from] SplitError),

    #[error("I/O error reading chunk {index}: {source}")]
    Read {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        index: u32,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("chunk {index} rejected: {source}")]
    Rejected {
        index: u32,
        #[source]
        source: TransportError,
    },

    #[error("chunk {index} abandoned after {attempts} attempts: another chunk failed the file")]
    Abandoned { index: u32, attempts: u32 },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: chunkify_protocol::UploadStatus,
        to: chunkify_protocol::UploadStatus,
    },

    #[error("session already finished with status {0}")]
    SessionFinished(chunkify_protocol::UploadStatus),

    #[error("multiple files given but `multiple` is disabled")]
    MultipleNotAllowed,

    #[error("task join error: {0}")]
    Join(String),
}

impl UploadError {
    /// Index of the chunk that caused the failure, when there is one.
    pub fn chunk_index(&self) -> Option<u32> {
        match self {
            Self::Read { index, .. }
            | Self::RetryExhausted { index, .. }
            | Self::Rejected { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Invalid engine configuration.
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid option `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_timeout_are_retryable() {
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(TransportError::Timeout.is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
        assert!(!TransportError::InvalidRequest("bad header".into()).is_retryable());
    }

    #[test]
    fn rejection_retryability_follows_status_class() {
        let rejected = |status| TransportError::Rejected {
            status,
            body: String::new(),
        };
        assert!(rejected(500).is_retryable());
        assert!(rejected(503).is_retryable());
        assert!(rejected(408).is_retryable());
        assert!(rejected(429).is_retryable());
        assert!(!rejected(400).is_retryable());
        assert!(!rejected(404).is_retryable());
        assert!(!rejected(413).is_retryable());
    }

    #[test]
    fn upload_error_carries_chunk_index() {
        let err = UploadError::RetryExhausted {
            index: 7,
            attempts: 4,
            source: TransportError::Timeout,
        };
        assert_eq!(err.chunk_index(), Some(7));
        assert!(err.to_string().contains("chunk 7"));
        assert_eq!(UploadError::Cancelled.chunk_index(), None);
        // An abandoned chunk did not cause the failure.
        assert_eq!(
            UploadError::Abandoned {
                index: 3,
                attempts: 1
            }
            .chunk_index(),
            None
        );
        assert!(UploadError::Cancelled.is_cancelled());
    }
}
