//! Per-file upload state machine.

use std::sync::{Arc, Mutex, RwLock};

use chunkify_protocol::UploadStatus;
use tracing::{error, info};

use crate::chunked::ChunkReader;
use crate::error::UploadError;
use crate::options::UploadConfig;
use crate::scheduler::UploadScheduler;
use crate::splitter;
use crate::transport::{Transport, TransportResponse};
use crate::types::{ChunkOutcome, ChunkifyFile};

/// Invoked once when a file finishes uploading, with the response of the
/// last chunk to complete.
pub type SuccessCallback = Arc<dyn Fn(&ChunkifyFile, &TransportResponse) + Send + Sync>;

/// Drives one file through `pending → uploading → completed | failed`, with
/// `cancelled` reachable from any non-terminal state.
pub struct UploadSession {
    file: Arc<ChunkifyFile>,
    config: Arc<UploadConfig>,
    status: RwLock<UploadStatus>,
    outcomes: Mutex<Vec<ChunkOutcome>>,
    on_success: Option<SuccessCallback>,
}

impl UploadSession {
    pub fn new(file: Arc<ChunkifyFile>, config: Arc<UploadConfig>) -> Self {
        Self {
            file,
            config,
            status: RwLock::new(UploadStatus::Pending),
            outcomes: Mutex::new(Vec::new()),
            on_success: None,
        }
    }

    pub fn with_success(mut self, callback: SuccessCallback) -> Self {
        self.on_success = Some(callback);
        self
    }

    pub fn file(&self) -> &Arc<ChunkifyFile> {
        &self.file
    }

    pub fn status(&self) -> UploadStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Per-chunk outcomes of the last run, sorted by index.
    pub fn outcomes(&self) -> Vec<ChunkOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Moves to `to` if the state machine allows it.
    pub fn transition(&self, to: UploadStatus) -> Result<(), UploadError> {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        let from = *status;
        if !is_allowed(from, to) {
            return Err(UploadError::InvalidTransition { from, to });
        }
        *status = to;
        Ok(())
    }

    /// Aborts the upload. Pending sessions become `cancelled` at once;
    /// running ones resolve once in-flight sends observe the token.
    pub fn cancel(&self) {
        self.file.cancel_token().cancel();
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        if *status == UploadStatus::Pending {
            *status = UploadStatus::Cancelled;
            drop(status);
            info!(reference = %self.file.uuid(), "upload cancelled before start");
            self.settle(UploadStatus::Cancelled, None);
        }
    }

    /// Uploads the file through `transport`.
    pub async fn run(&self, transport: &dyn Transport) -> Result<TransportResponse, UploadError> {
        let current = self.status();
        if current.is_terminal() {
            return Err(UploadError::SessionFinished(current));
        }

        let reference = self.file.uuid().to_string();
        let cancel = self.file.cancel_token();
        if cancel.is_cancelled() {
            if self.transition(UploadStatus::Cancelled).is_ok() {
                self.settle(UploadStatus::Cancelled, None);
            }
            return Err(UploadError::Cancelled);
        }

        let plan = match splitter::split(&self.file, &self.config) {
            Ok(plan) => plan,
            Err(e) => {
                let err = UploadError::from(e);
                self.transition(UploadStatus::Failed)?;
                error!(reference = %reference, error = %err, "cannot split file");
                self.settle(UploadStatus::Failed, Some(&err.to_string()));
                return Err(err);
            }
        };
        let Some(source) = self.file.source() else {
            return Err(UploadError::SessionFinished(self.status()));
        };

        if let Err(e) = self.transition(UploadStatus::Uploading) {
            // Lost a race with cancel().
            return Err(match self.status() {
                UploadStatus::Cancelled => UploadError::Cancelled,
                _ => e,
            });
        }
        self.file.aggregator().begin(plan.total_count());
        info!(
            reference = %reference,
            file = %self.file.name(),
            size = self.file.size(),
            chunks = plan.total_count(),
            "upload started"
        );

        let reader = ChunkReader::new(source, &reference, self.file.extension());
        let scheduler = UploadScheduler::from_config(&self.config, self.file.url());
        let report = scheduler
            .run(plan, &reader, transport, self.file.aggregator(), &cancel)
            .await;
        drop(reader);

        *self.outcomes.lock().unwrap_or_else(|e| e.into_inner()) = report.outcomes;

        match report.result {
            Ok(response) => {
                self.transition(UploadStatus::Completed)?;
                info!(reference = %reference, status = response.status, "upload completed");
                self.settle(UploadStatus::Completed, None);
                if let Some(cb) = &self.on_success {
                    cb(&self.file, &response);
                }
                Ok(response)
            }
            Err(err) if err.is_cancelled() => {
                self.transition(UploadStatus::Cancelled)?;
                info!(reference = %reference, "upload cancelled");
                self.settle(UploadStatus::Cancelled, None);
                Err(err)
            }
            Err(err) => {
                self.transition(UploadStatus::Failed)?;
                error!(
                    reference = %reference,
                    index = ?err.chunk_index(),
                    error = %err,
                    "upload failed"
                );
                self.settle(UploadStatus::Failed, Some(&err.to_string()));
                Err(err)
            }
        }
    }

    /// Publishes the terminal status and drops the file's source.
    fn settle(&self, status: UploadStatus, error: Option<&str>) {
        self.file.aggregator().finish(status, error);
        self.file.release_source();
    }
}

fn is_allowed(from: UploadStatus, to: UploadStatus) -> bool {
    use UploadStatus::*;
    matches!(
        (from, to),
        (Pending, Uploading)
            | (Pending, Failed)
            | (Pending, Cancelled)
            | (Uploading, Completed)
            | (Uploading, Failed)
            | (Uploading, Cancelled)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::mock::MockTransport;
    use crate::options::ChunkifyOptions;
    use crate::splitter::ChunkSizing;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(chunk_size: u64, max_retries: u32) -> Arc<UploadConfig> {
        let mut config = ChunkifyOptions::default().resolve().unwrap();
        config.sizing = ChunkSizing::Size(chunk_size);
        config.retry.max_retries = max_retries;
        config.retry.initial_backoff = Duration::from_millis(5);
        Arc::new(config)
    }

    fn session(data: &[u8], chunk_size: u64, max_retries: u32) -> UploadSession {
        let file = Arc::new(ChunkifyFile::from_bytes(
            "photo.jpg",
            data.to_vec(),
            "/chunkify/upload",
        ));
        UploadSession::new(file, config(chunk_size, max_retries))
    }

    #[test]
    fn transition_table() {
        let s = session(b"abc", 1, 0);
        assert!(s.transition(UploadStatus::Completed).is_err());
        s.transition(UploadStatus::Uploading).unwrap();
        assert!(s.transition(UploadStatus::Pending).is_err());
        s.transition(UploadStatus::Completed).unwrap();
        for to in [
            UploadStatus::Uploading,
            UploadStatus::Failed,
            UploadStatus::Cancelled,
        ] {
            assert!(matches!(
                s.transition(to),
                Err(UploadError::InvalidTransition {
                    from: UploadStatus::Completed,
                    ..
                })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_and_calls_success_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let s = session(b"0123456789abcdefghijklmnopqrstuvwxy", 10, 0).with_success(Arc::new(
            move |file, response| {
                assert_eq!(file.name(), "photo.jpg");
                assert_eq!(response.text(), "chunk 3");
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));
        let t = MockTransport::new();

        let response = s.run(&t).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(s.status(), UploadStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(s.outcomes().len(), 4);
        assert_eq!(s.file().progress(), 100.0);
        assert!(s.file().source().is_none());
        assert_eq!(
            t.routes()[0],
            ("POST".to_string(), "/chunkify/upload".to_string())
        );

        // Terminal sessions refuse to run again.
        assert!(matches!(
            s.run(&t).await,
            Err(UploadError::SessionFinished(UploadStatus::Completed))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_chunk_still_completes() {
        let s = session(&[7u8; 30], 10, 2);
        let t = MockTransport::new().fail_times(1, 2, TransportError::Timeout);
        assert!(s.run(&t).await.is_ok());
        assert_eq!(s.outcomes()[1].attempts, 3);
        assert_eq!(t.reassembled(), vec![7u8; 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_chunk_fails_session() {
        let called = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&called);
        let s = session(&[1u8; 30], 10, 2).with_success(Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let t = MockTransport::new().fail_times(1, 3, TransportError::Timeout);

        let err = s.run(&t).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::RetryExhausted {
                index: 1,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(err.chunk_index(), Some(1));
        assert_eq!(s.status(), UploadStatus::Failed);
        assert_eq!(called.load(Ordering::SeqCst), 0);

        let snapshot = s.file().snapshot();
        assert_eq!(snapshot.status, UploadStatus::Failed);
        assert!(!snapshot.error.is_empty());
    }

    #[tokio::test]
    async fn cancel_before_run() {
        let s = session(b"data", 2, 0);
        s.cancel();
        assert_eq!(s.status(), UploadStatus::Cancelled);
        assert!(s.file().source().is_none());

        let t = MockTransport::new();
        assert!(matches!(
            s.run(&t).await,
            Err(UploadError::SessionFinished(UploadStatus::Cancelled))
        ));
        assert_eq!(t.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_run() {
        let s = session(&[0u8; 100], 10, 0);
        let t = MockTransport::new()
            .with_delay(Duration::from_millis(10))
            .cancel_on_start(2, s.file().cancel_token());

        let err = s.run(&t).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(s.status(), UploadStatus::Cancelled);
        assert_eq!(s.file().snapshot().status, UploadStatus::Cancelled);
        assert!(s.file().progress() < 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_byte_file_uploads_one_chunk() {
        let s = session(b"", 10, 0);
        let t = MockTransport::new();
        s.run(&t).await.unwrap();
        assert_eq!(t.calls(), 1);
        assert_eq!(s.file().progress(), 100.0);
        assert_eq!(s.status(), UploadStatus::Completed);
    }

    #[tokio::test]
    async fn pending_session_can_fail_on_invalid_plan() {
        let file = Arc::new(ChunkifyFile::from_bytes("a.bin", vec![0u8; 8], "/u"));
        let mut cfg = ChunkifyOptions::default().resolve().unwrap();
        cfg.sizing = ChunkSizing::Size(0);
        let s = UploadSession::new(file, Arc::new(cfg));

        let err = s.run(&MockTransport::new()).await.unwrap_err();
        assert!(matches!(err, UploadError::Split(_)));
        assert_eq!(s.status(), UploadStatus::Failed);
    }
}
