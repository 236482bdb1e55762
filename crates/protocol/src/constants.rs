use serde::{Deserialize, Serialize};

/// Endpoint chunks are sent to when no route is configured.
pub const DEFAULT_ROUTE: &str = "/chunkify/upload";

/// HTTP verb used when no method is configured.
pub const DEFAULT_METHOD: &str = "POST";

// Multipart form field names.
pub const FIELD_REFERENCE: &str = "reference";
pub const FIELD_INDEX: &str = "index";
pub const FIELD_TOTAL_COUNT: &str = "total_count";
pub const FIELD_EXTENSION: &str = "extension";
pub const FIELD_CHECKSUM: &str = "checksum";
pub const FIELD_FILE: &str = "file";

// Header names used by the raw-body encoding.
pub const HEADER_REFERENCE: &str = "X-Chunk-Reference";
pub const HEADER_INDEX: &str = "X-Chunk-Index";
pub const HEADER_TOTAL_COUNT: &str = "X-Chunk-Total-Count";
pub const HEADER_EXTENSION: &str = "X-Chunk-Extension";
pub const HEADER_CHECKSUM: &str = "X-Chunk-Checksum";

/// How a chunk and its metadata are encoded in one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireEncoding {
    /// `multipart/form-data` with metadata fields and a `file` part.
    #[default]
    #[serde(rename = "multipart")]
    Multipart,
    /// Raw `application/octet-stream` body, metadata in `X-Chunk-*` headers.
    #[serde(rename = "headers")]
    Headers,
}

impl WireEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Multipart => "multipart",
            Self::Headers => "headers",
        }
    }
}

impl std::fmt::Display for WireEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WireEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "multipart" => Ok(Self::Multipart),
            "headers" => Ok(Self::Headers),
            other => Err(format!("unknown wire encoding: {other}")),
        }
    }
}
