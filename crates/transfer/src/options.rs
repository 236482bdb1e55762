//! Engine configuration.
//!
//! [`ChunkifyOptions`] is the user-facing, serialisable configuration. It is
//! validated once and resolved into an immutable [`UploadConfig`] which every
//! session shares read-only.

use std::path::Path;
use std::time::Duration;

use chunkify_protocol::constants::{DEFAULT_METHOD, DEFAULT_ROUTE};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::OptionsError;
use crate::retry::RetryPolicy;
use crate::scheduler::DispatchMode;
use crate::splitter::ChunkSizing;

/// Chunk count used when neither size nor count is configured.
pub const DEFAULT_NUMBER_OF_CHUNKS: u32 = 4;

/// Per-chunk retry budget used when none is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// User-facing upload options. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChunkifyOptions {
    /// Upload endpoint, absolute or relative to `base_url`.
    pub route: String,
    /// HTTP verb.
    pub method: String,
    /// Allow more than one file per upload call.
    pub multiple: bool,
    /// Dispatch chunks concurrently instead of one at a time.
    pub parallel: bool,
    /// Target chunk count; used only when `chunk_size` is unset.
    #[serde(deserialize_with = "number_or_string")]
    pub number_of_chunks: u32,
    /// Bytes per chunk; takes precedence over `number_of_chunks`.
    #[serde(
        deserialize_with = "optional_number_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub chunk_size: Option<u64>,
    /// Extra attempts allowed per chunk after its first failure.
    #[serde(deserialize_with = "number_or_string")]
    pub max_retries: u32,
    /// Concurrent uploads in parallel mode (defaults to `number_of_chunks`).
    #[serde(
        deserialize_with = "optional_number_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub workers: Option<usize>,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for ChunkifyOptions {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            route: DEFAULT_ROUTE.into(),
            method: DEFAULT_METHOD.into(),
            multiple: false,
            parallel: false,
            number_of_chunks: DEFAULT_NUMBER_OF_CHUNKS,
            chunk_size: None,
            max_retries: DEFAULT_MAX_RETRIES,
            workers: None,
            retry_backoff_ms: retry.initial_backoff.as_millis() as u64,
            max_backoff_ms: retry.max_backoff.as_millis() as u64,
            backoff_factor: retry.backoff_factor,
            base_url: None,
        }
    }
}

impl ChunkifyOptions {
    /// Reads options from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, OptionsError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Checks every field for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.route.trim().is_empty() {
            return Err(invalid("route", "must not be empty"));
        }
        if self.method.is_empty() || !self.method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(invalid(
                "method",
                format!("`{}` is not an HTTP method", self.method),
            ));
        }
        if self.number_of_chunks == 0 {
            return Err(invalid("numberOfChunks", "must be greater than zero"));
        }
        if self.chunk_size == Some(0) {
            return Err(invalid("chunkSize", "must be greater than zero"));
        }
        if self.workers == Some(0) {
            return Err(invalid("workers", "must be greater than zero"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(invalid("backoffFactor", "must be a finite number >= 1.0"));
        }
        if self.max_backoff_ms < self.retry_backoff_ms {
            return Err(invalid("maxBackoffMs", "must not be below retryBackoffMs"));
        }
        Ok(())
    }

    /// Validates and freezes the options.
    pub fn resolve(&self) -> Result<UploadConfig, OptionsError> {
        self.validate()?;

        let sizing = match self.chunk_size {
            Some(size) => ChunkSizing::Size(size),
            None => ChunkSizing::Count(self.number_of_chunks),
        };
        let dispatch = if self.parallel {
            DispatchMode::Parallel {
                workers: self
                    .workers
                    .unwrap_or(self.number_of_chunks as usize),
            }
        } else {
            DispatchMode::Sequential
        };

        Ok(UploadConfig {
            route: join_route(self.base_url.as_deref(), &self.route),
            method: self.method.to_ascii_uppercase(),
            multiple: self.multiple,
            sizing,
            dispatch,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                initial_backoff: Duration::from_millis(self.retry_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                backoff_factor: self.backoff_factor,
            },
        })
    }
}

/// Resolved, immutable configuration shared by all sessions of an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Upload URL every chunk of every file is sent to.
    pub route: String,
    /// Upper-case HTTP verb.
    pub method: String,
    pub multiple: bool,
    pub sizing: ChunkSizing,
    pub dispatch: DispatchMode,
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            route: DEFAULT_ROUTE.into(),
            method: DEFAULT_METHOD.into(),
            multiple: false,
            sizing: ChunkSizing::Count(DEFAULT_NUMBER_OF_CHUNKS),
            dispatch: DispatchMode::Sequential,
            retry: RetryPolicy::default(),
        }
    }
}

/// Joins a relative route onto an optional base URL.
///
/// Absolute routes (`http://`, `https://`) are returned unchanged.
pub fn join_route(base_url: Option<&str>, route: &str) -> String {
    let route = route.trim();
    if route.starts_with("http://") || route.starts_with("https://") {
        return route.to_string();
    }
    match base_url.map(str::trim).filter(|b| !b.is_empty()) {
        Some(base) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            route.trim_start_matches('/')
        ),
        None => route.to_string(),
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> OptionsError {
    OptionsError::Invalid {
        field,
        reason: reason.into(),
    }
}

// Numeric options may be written as JSON numbers or numeric strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

impl NumberOrString {
    fn into_number<T, E>(self) -> Result<T, E>
    where
        T: TryFrom<u64>,
        E: serde::de::Error,
    {
        let n = match self {
            Self::Number(n) => n,
            Self::Text(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| E::custom(format!("`{s}` is not a number: {e}")))?,
        };
        T::try_from(n).map_err(|_| E::custom(format!("{n} is out of range")))
    }
}

fn number_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    NumberOrString::deserialize(deserializer)?.into_number()
}

fn optional_number_or_string<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    Option::<NumberOrString>::deserialize(deserializer)?
        .map(NumberOrString::into_number)
        .transpose()
}
