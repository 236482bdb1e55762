use serde::{Deserialize, Serialize};

/// Current state of a file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl UploadStatus {
    /// Returns `true` once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` for outcomes the host should treat as a failure.
    ///
    /// Cancellation counts: the file never reached the server in full.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Metadata sent alongside every chunk payload.
///
/// Field names are part of the server contract and stay snake_case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// Identifier shared by all chunks of one file.
    pub reference: String,
    /// 0-based chunk index.
    pub index: u32,
    /// Number of chunks the file was split into.
    pub total_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// SHA-256 hex digest of the payload (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Progress snapshot for one file upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub reference: String,
    pub file_name: String,
    pub status: UploadStatus,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    /// Aggregate progress, 0-100.
    pub percentage: f64,
    #[serde(default)]
    pub bytes_per_second: f64,
    /// Estimated seconds left at the current rate, while uploading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl UploadProgress {
    /// Bytes still to be confirmed by the server.
    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.uploaded_bytes)
    }
}
