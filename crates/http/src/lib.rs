//! HTTP transport for the chunk upload engine.
//!
//! Async client using `reqwest`. Each chunk is one request, encoded either
//! as a multipart form or as a raw body with `X-Chunk-*` headers.

mod client;

pub use client::{HttpTransport, HttpTransportError};
pub use chunkify_protocol::WireEncoding;
