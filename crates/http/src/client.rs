use std::time::Duration;

use bytes::Bytes;
use chunkify_protocol::{ChunkHeader, WireEncoding};
use chunkify_protocol::constants::{
    FIELD_CHECKSUM, FIELD_EXTENSION, FIELD_FILE, FIELD_INDEX, FIELD_REFERENCE, FIELD_TOTAL_COUNT,
    HEADER_CHECKSUM, HEADER_EXTENSION, HEADER_INDEX, HEADER_REFERENCE, HEADER_TOTAL_COUNT,
};
use chunkify_transfer::{
    Chunk, ChunkProgressReporter, Transport, TransportError, TransportFuture, TransportResponse,
};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Method, RequestBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Payload is handed to the client in pieces of this size so partial
/// progress can be reported.
const PROGRESS_STEP: usize = 64 * 1024;

const OCTET_STREAM: &str = "application/octet-stream";

/// Errors building the HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum HttpTransportError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// [`Transport`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    encoding: WireEncoding,
}

impl HttpTransport {
    /// Creates a transport with no request timeout.
    pub fn new(encoding: WireEncoding) -> Result<Self, HttpTransportError> {
        Self::with_timeout(encoding, None)
    }

    /// Creates a transport whose requests fail with
    /// [`TransportError::Timeout`] after `timeout`.
    pub fn with_timeout(
        encoding: WireEncoding,
        timeout: Option<Duration>,
    ) -> Result<Self, HttpTransportError> {
        let mut builder = reqwest::Client::builder().user_agent(concat!(
            "chunkify/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self::with_client(builder.build()?, encoding))
    }

    /// Wraps an existing client.
    pub fn with_client(http: reqwest::Client, encoding: WireEncoding) -> Self {
        Self { http, encoding }
    }

    pub fn encoding(&self) -> WireEncoding {
        self.encoding
    }

    fn request(
        &self,
        chunk: &Chunk,
        route: &str,
        method: &str,
        progress: ChunkProgressReporter,
    ) -> Result<RequestBuilder, TransportError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| TransportError::InvalidRequest(format!("bad HTTP method `{method}`")))?;
        let builder = self.http.request(method, route);

        let header = chunk.header();
        let body = progress_body(chunk.data.clone(), progress);
        let builder = match self.encoding {
            WireEncoding::Multipart => {
                let file = Part::stream_with_length(body, chunk.len())
                    .file_name(part_name(&header))
                    .mime_str(OCTET_STREAM)
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                builder.multipart(header_form(header).part(FIELD_FILE, file))
            }
            WireEncoding::Headers => {
                let mut builder = builder
                    .header(HEADER_REFERENCE, header.reference)
                    .header(HEADER_INDEX, header.index.to_string())
                    .header(HEADER_TOTAL_COUNT, header.total_count.to_string())
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .header(CONTENT_LENGTH, chunk.len());
                if !header.checksum.is_empty() {
                    builder = builder.header(HEADER_CHECKSUM, header.checksum);
                }
                if let Some(ext) = header.extension {
                    builder = builder.header(HEADER_EXTENSION, ext);
                }
                builder.body(body)
            }
        };
        Ok(builder)
    }

    async fn execute(
        &self,
        chunk: &Chunk,
        route: &str,
        method: &str,
        progress: ChunkProgressReporter,
    ) -> Result<TransportResponse, TransportError> {
        let request = self.request(chunk, route, method, progress)?;
        debug!(
            url = %route,
            reference = %chunk.reference,
            index = chunk.index,
            bytes = chunk.len(),
            encoding = %self.encoding,
            "sending chunk"
        );

        let resp = request.send().await.map_err(map_error)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(map_error)?.to_vec();
        trace!(index = chunk.index, status = status.as_u16(), "chunk response");

        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(TransportResponse::new(status.as_u16(), body))
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        chunk: &'a Chunk,
        route: &'a str,
        method: &'a str,
        progress: ChunkProgressReporter,
        cancel: CancellationToken,
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                result = self.execute(chunk, route, method, progress) => result,
            }
        })
    }
}

/// Text fields of a multipart chunk request.
fn header_form(header: ChunkHeader) -> Form {
    let mut form = Form::new()
        .text(FIELD_REFERENCE, header.reference)
        .text(FIELD_INDEX, header.index.to_string())
        .text(FIELD_TOTAL_COUNT, header.total_count.to_string());
    if !header.checksum.is_empty() {
        form = form.text(FIELD_CHECKSUM, header.checksum);
    }
    if let Some(ext) = header.extension {
        form = form.text(FIELD_EXTENSION, ext);
    }
    form
}

/// Splits `data` into views of at most [`PROGRESS_STEP`] bytes. No copies.
fn pieces(data: &Bytes) -> Vec<Bytes> {
    (0..data.len())
        .step_by(PROGRESS_STEP)
        .map(|start| data.slice(start..(start + PROGRESS_STEP).min(data.len())))
        .collect()
}

/// Body that reports bytes handed to the connection as it is consumed.
fn progress_body(data: Bytes, progress: ChunkProgressReporter) -> Body {
    if data.is_empty() {
        return Body::from(data);
    }
    let mut sent = 0u64;
    let stream = futures_util::stream::iter(pieces(&data)).map(move |piece| {
        // Only bytes of earlier pieces count; the last one is confirmed by
        // the response.
        if sent > 0 {
            progress.report_bytes(sent);
        }
        sent += piece.len() as u64;
        Ok::<_, std::io::Error>(piece)
    });
    Body::wrap_stream(stream)
}

fn part_name(header: &ChunkHeader) -> String {
    match &header.extension {
        Some(ext) => format!("{}.{}.part{}", header.reference, ext, header.index),
        None => format!("{}.part{}", header.reference, header.index),
    }
}

fn map_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}
