//! Scriptable in-memory transport shared by the crate's tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::progress::ChunkProgressReporter;
use crate::transport::{Transport, TransportFuture, TransportResponse};
use crate::types::Chunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockEvent {
    Start(u32),
    End(u32),
}

/// Records every call and answers `200 "chunk {index}"` unless scripted.
#[derive(Default)]
pub(crate) struct MockTransport {
    delay: Duration,
    index_delays: HashMap<u32, Duration>,
    partial_progress: bool,
    failures: Mutex<HashMap<u32, VecDeque<TransportError>>>,
    cancel_on_start: Option<(u32, CancellationToken)>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    events: Mutex<Vec<MockEvent>>,
    received: Mutex<Vec<(u32, Vec<u8>)>>,
    routes: Mutex<Vec<(String, String)>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sends of chunk `index` take `delay` instead of the default.
    pub(crate) fn with_index_delay(mut self, index: u32, delay: Duration) -> Self {
        self.index_delays.insert(index, delay);
        self
    }

    /// Report 50% of each chunk before answering.
    pub(crate) fn with_partial_progress(mut self) -> Self {
        self.partial_progress = true;
        self
    }

    /// The first `times` sends of chunk `index` fail with `error`.
    pub(crate) fn fail_times(self, index: u32, times: usize, error: TransportError) -> Self {
        {
            let mut failures = self.failures.lock().unwrap();
            let queue = failures.entry(index).or_default();
            for _ in 0..times {
                queue.push_back(error.clone());
            }
        }
        self
    }

    /// Fires `token` when chunk `index` is first sent.
    pub(crate) fn cancel_on_start(mut self, index: u32, token: CancellationToken) -> Self {
        self.cancel_on_start = Some((index, token));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn events(&self) -> Vec<MockEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn routes(&self) -> Vec<(String, String)> {
        self.routes.lock().unwrap().clone()
    }

    /// Successfully received payloads joined in index order.
    pub(crate) fn reassembled(&self) -> Vec<u8> {
        let mut received = self.received.lock().unwrap().clone();
        received.sort_by_key(|(index, _)| *index);
        received.into_iter().flat_map(|(_, data)| data).collect()
    }
}

impl Transport for MockTransport {
    fn send<'a>(
        &'a self,
        chunk: &'a Chunk,
        route: &'a str,
        method: &'a str,
        progress: ChunkProgressReporter,
        cancel: CancellationToken,
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(MockEvent::Start(chunk.index));
            self.routes
                .lock()
                .unwrap()
                .push((method.to_string(), route.to_string()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            if let Some((index, token)) = &self.cancel_on_start {
                if *index == chunk.index {
                    token.cancel();
                }
            }
            if self.partial_progress {
                progress.report(50.0);
            }

            let delay = self.index_delays.get(&chunk.index).copied().unwrap_or(self.delay);
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            let scripted = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&chunk.index)
                .and_then(VecDeque::pop_front);
            self.events.lock().unwrap().push(MockEvent::End(chunk.index));
            match scripted {
                Some(err) => Err(err),
                None => {
                    self.received
                        .lock()
                        .unwrap()
                        .push((chunk.index, chunk.data.to_vec()));
                    Ok(TransportResponse::new(
                        200,
                        format!("chunk {}", chunk.index),
                    ))
                }
            }
        })
    }
}
