//! Transport capability consumed by the scheduler.
//!
//! The host supplies an implementation (the `chunkify-http` crate provides
//! one over `reqwest`). Keeping this a trait leaves the engine free of any
//! HTTP client and testable with mocks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::progress::ChunkProgressReporter;
use crate::types::Chunk;

/// Boxed future returned by [`Transport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

/// Sends one chunk to the server.
pub trait Transport: Send + Sync {
    /// Sends `chunk` to `route` with HTTP verb `method`.
    ///
    /// Implementations must resolve to [`TransportError::Cancelled`] promptly
    /// once `cancel` fires, report non-2xx answers as
    /// [`TransportError::Rejected`], and may call `progress` while the
    /// payload is being written.
    fn send<'a>(
        &'a self,
        chunk: &'a Chunk,
        route: &'a str,
        method: &'a str,
        progress: ChunkProgressReporter,
        cancel: CancellationToken,
    ) -> TransportFuture<'a>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send<'a>(
        &'a self,
        chunk: &'a Chunk,
        route: &'a str,
        method: &'a str,
        progress: ChunkProgressReporter,
        cancel: CancellationToken,
    ) -> TransportFuture<'a> {
        (**self).send(chunk, route, method, progress, cancel)
    }
}

/// A successful server answer to one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Body as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
