//! Bounded-concurrency chunk dispatch.
//!
//! Workers are plain futures joined on the caller's task. Each claims the
//! next range from a shared queue and reads its payload before releasing
//! the claim, so sends start in index order. It then drives the transport
//! through the retry policy. Sequential mode is a single worker.

use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunked::ChunkReader;
use crate::error::{TransportError, UploadError};
use crate::options::UploadConfig;
use crate::progress::{ChunkProgressReporter, ProgressAggregator};
use crate::retry::RetryPolicy;
use crate::splitter::ChunkRange;
use crate::transport::{Transport, TransportResponse};
use crate::types::{Chunk, ChunkOutcome, ChunkResult};

/// How many chunks may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One chunk at a time, in index order.
    Sequential,
    /// Up to `workers` chunks at a time.
    Parallel { workers: usize },
}

impl DispatchMode {
    pub fn workers(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Parallel { workers } => workers.max(1),
        }
    }
}

/// Everything the scheduler learned about one file.
#[derive(Debug)]
pub struct SchedulerReport {
    /// One entry per dispatched chunk, sorted by index.
    pub outcomes: Vec<ChunkOutcome>,
    /// Response of the last chunk to complete, or the terminal error.
    pub result: Result<TransportResponse, UploadError>,
}

/// Dispatches chunk uploads under a concurrency policy.
#[derive(Debug, Clone)]
pub struct UploadScheduler {
    dispatch: DispatchMode,
    retry: RetryPolicy,
    route: String,
    method: String,
}

/// Dependencies shared by every worker of one run.
struct RunContext<'a> {
    reader: &'a ChunkReader,
    transport: &'a dyn Transport,
    aggregator: &'a Arc<ProgressAggregator>,
    cancel: &'a CancellationToken,
    /// Stops new dispatch after a fatal chunk failure. Child of `cancel`.
    halt: CancellationToken,
}

struct RunState {
    outcomes: Vec<ChunkOutcome>,
    error: Option<UploadError>,
    last_response: Option<TransportResponse>,
}

impl UploadScheduler {
    pub fn new(dispatch: DispatchMode, retry: RetryPolicy, route: &str, method: &str) -> Self {
        Self {
            dispatch,
            retry,
            route: route.to_string(),
            method: method.to_string(),
        }
    }

    /// Scheduler for `config`, sending to `route`.
    pub fn from_config(config: &UploadConfig, route: &str) -> Self {
        Self::new(config.dispatch, config.retry.clone(), route, &config.method)
    }

    pub fn dispatch(&self) -> DispatchMode {
        self.dispatch
    }

    /// Uploads every range until done, a chunk fails fatally, or `cancel` fires.
    pub async fn run<I>(
        &self,
        ranges: I,
        reader: &ChunkReader,
        transport: &dyn Transport,
        aggregator: &Arc<ProgressAggregator>,
        cancel: &CancellationToken,
    ) -> SchedulerReport
    where
        I: IntoIterator<Item = ChunkRange>,
        I::IntoIter: Send,
    {
        let ranges = ranges.into_iter();
        let pending = ranges.size_hint().0.max(1);
        let workers = self.dispatch.workers().min(pending);
        info!(
            reference = %reader.reference(),
            route = %self.route,
            chunks = pending,
            workers,
            "dispatching chunks"
        );

        let queue = AsyncMutex::new(ranges);
        let state = Mutex::new(RunState {
            outcomes: Vec::new(),
            error: None,
            last_response: None,
        });
        let ctx = RunContext {
            reader,
            transport,
            aggregator,
            cancel,
            halt: cancel.child_token(),
        };

        join_all((0..workers).map(|id| self.worker(id, &queue, &state, &ctx))).await;

        let RunState {
            mut outcomes,
            error,
            last_response,
        } = state.into_inner().unwrap_or_else(|e| e.into_inner());
        outcomes.sort_by_key(|o| o.index);

        let result = match error {
            Some(err) if !err.is_cancelled() => Err(err),
            _ if cancel.is_cancelled() => Err(UploadError::Cancelled),
            Some(err) => Err(err),
            None => Ok(last_response.unwrap_or_default()),
        };
        SchedulerReport { outcomes, result }
    }

    async fn worker<I>(
        &self,
        id: usize,
        queue: &AsyncMutex<I>,
        state: &Mutex<RunState>,
        ctx: &RunContext<'_>,
    ) where
        I: Iterator<Item = ChunkRange>,
    {
        loop {
            // Claiming and reading happen under one lock, so the holder of
            // range i reaches `transport.send` before range i+1 is claimed.
            let (range, read) = {
                let mut queue = queue.lock().await;
                if ctx.halt.is_cancelled() {
                    break;
                }
                let Some(range) = queue.next() else {
                    break;
                };
                debug!(worker = id, index = range.index, bytes = range.len(), "dispatch chunk");
                (range, self.read_chunk(range, ctx).await)
            };

            let (attempts, result) = match read {
                Ok(chunk) => self.upload_chunk(range, chunk, ctx).await,
                Err(e) => (0, Err(e)),
            };

            let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
            match result {
                Ok(response) => {
                    s.outcomes.push(ChunkOutcome {
                        index: range.index,
                        attempts,
                        result: ChunkResult::Uploaded,
                    });
                    s.last_response = Some(response);
                }
                Err(err) => {
                    let result = match &err {
                        UploadError::Cancelled => ChunkResult::Cancelled,
                        UploadError::Abandoned { .. } => {
                            debug!(index = range.index, attempts, "chunk abandoned");
                            ChunkResult::Abandoned
                        }
                        _ => {
                            error!(index = range.index, attempts, error = %err, "chunk failed");
                            ChunkResult::Failed(err.to_string())
                        }
                    };
                    s.outcomes.push(ChunkOutcome {
                        index: range.index,
                        attempts,
                        result,
                    });
                    if s.error.is_none() {
                        s.error = Some(err);
                    }
                    ctx.halt.cancel();
                }
            }
        }
    }

    async fn read_chunk(&self, range: ChunkRange, ctx: &RunContext<'_>) -> Result<Chunk, UploadError> {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(UploadError::Cancelled),
            read = ctx.reader.read_async(range) => read,
        }
    }

    /// Sends one chunk, retrying per policy. Returns attempts made and result.
    async fn upload_chunk(
        &self,
        range: ChunkRange,
        chunk: Chunk,
        ctx: &RunContext<'_>,
    ) -> (u32, Result<TransportResponse, UploadError>) {
        ctx.aggregator.start_chunk(&range);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let reporter =
                ChunkProgressReporter::new(Arc::clone(ctx.aggregator), &chunk.reference, &range);
            let sent = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(TransportError::Cancelled),
                sent = ctx.transport.send(
                    &chunk,
                    &self.route,
                    &self.method,
                    reporter,
                    ctx.cancel.clone(),
                ) => sent,
            };

            let err = match sent {
                Ok(response) => {
                    ctx.aggregator.complete_chunk(range.index);
                    debug!(index = range.index, attempt, status = response.status, "chunk uploaded");
                    return (attempt, Ok(response));
                }
                Err(TransportError::Cancelled) => return (attempt, Err(UploadError::Cancelled)),
                Err(_) if ctx.cancel.is_cancelled() => {
                    return (attempt, Err(UploadError::Cancelled));
                }
                Err(e) => e,
            };

            ctx.aggregator.reset_chunk(range.index);
            if !self.retry.should_retry(&range, attempt, &err) {
                let failure = if err.is_retryable() {
                    UploadError::RetryExhausted {
                        index: range.index,
                        attempts: attempt,
                        source: err,
                    }
                } else {
                    UploadError::Rejected {
                        index: range.index,
                        source: err,
                    }
                };
                return (attempt, Err(failure));
            }
            if ctx.halt.is_cancelled() {
                // A sibling already failed the file; don't spend more attempts.
                return (
                    attempt,
                    Err(UploadError::Abandoned {
                        index: range.index,
                        attempts: attempt,
                    }),
                );
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                index = range.index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "chunk upload failed, retrying"
            );
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return (attempt, Err(UploadError::Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
