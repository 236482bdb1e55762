//! Engine entry point: owns configuration, callbacks and per-file sessions.
//!
//! Files run as independent sessions. If one fails, the others continue.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chunkify_protocol::{UploadProgress, UploadStatus};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{OptionsError, UploadError};
use crate::options::{ChunkifyOptions, UploadConfig};
use crate::progress::ProgressCallback;
use crate::session::{SuccessCallback, UploadSession};
use crate::source::ChunkSource;
use crate::transport::{Transport, TransportResponse};
use crate::types::{ChunkOutcome, ChunkifyFile};

/// Event emitted on the engine's channel.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Progress(UploadProgress),
    Completed {
        reference: String,
        response: TransportResponse,
    },
    Failed {
        reference: String,
        error: String,
    },
    Cancelled {
        reference: String,
    },
}

/// Terminal report for one file.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub reference: String,
    pub file_name: String,
    pub status: UploadStatus,
    pub response: Option<TransportResponse>,
    pub error: Option<String>,
    /// Index of the chunk that failed the file, if any.
    pub failed_chunk: Option<u32>,
    pub outcomes: Vec<ChunkOutcome>,
}

impl UploadResult {
    /// True when this run completed the file. Re-running a finished file
    /// reports its status but is not a success.
    pub fn is_success(&self) -> bool {
        self.status == UploadStatus::Completed && self.error.is_none()
    }
}

/// Sending half of the event channel.
///
/// Events are only queued once the receiver has been taken, so an engine
/// nobody listens to does not buffer progress. Once it has, every event is
/// delivered; the channel is unbounded so terminal events are never lost
/// behind a burst of progress.
#[derive(Clone)]
struct EventSink {
    tx: mpsc::UnboundedSender<UploadEvent>,
    listening: Arc<AtomicBool>,
}

impl EventSink {
    fn emit(&self, event: UploadEvent) {
        if self.listening.load(Ordering::Acquire) {
            // A dropped receiver only means nobody wants the events anymore.
            let _ = self.tx.send(event);
        }
    }
}

/// Chunk upload engine.
pub struct Chunkify {
    config: Arc<UploadConfig>,
    on_success: Option<SuccessCallback>,
    on_progress: Vec<ProgressCallback>,
    sessions: Mutex<HashMap<String, Arc<UploadSession>>>,
    events: EventSink,
    events_rx: Option<mpsc::UnboundedReceiver<UploadEvent>>,
    cancel: CancellationToken,
}

impl Chunkify {
    /// Validates `options` and builds an engine.
    pub fn new(options: ChunkifyOptions) -> Result<Self, OptionsError> {
        Ok(Self::with_config(options.resolve()?))
    }

    pub fn with_config(config: UploadConfig) -> Self {
        let (tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            on_success: None,
            on_progress: Vec::new(),
            sessions: Mutex::new(HashMap::new()),
            events: EventSink {
                tx,
                listening: Arc::new(AtomicBool::new(false)),
            },
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Registers the completion callback, replacing any previous one.
    pub fn on_success<F>(&mut self, callback: F)
    where
        F: Fn(&ChunkifyFile, &TransportResponse) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
    }

    /// Adds a progress callback for files selected after this call.
    pub fn on_progress<F>(&mut self, callback: F)
    where
        F: Fn(&UploadProgress) + Send + Sync + 'static,
    {
        self.on_progress.push(Arc::new(callback));
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// Events start flowing from this call on.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        let rx = self.events_rx.take()?;
        self.events.listening.store(true, Ordering::Release);
        Some(rx)
    }

    /// Cancelling this token aborts every session of the engine.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Selects a local file for upload.
    pub fn open(&self, path: &Path) -> std::io::Result<Arc<ChunkifyFile>> {
        let file = ChunkifyFile::open(path, &self.config.route)?;
        Ok(self.add_file(file))
    }

    /// Selects an in-memory buffer for upload.
    pub fn add_bytes(&self, name: &str, data: impl Into<Vec<u8>>) -> Arc<ChunkifyFile> {
        self.add_file(ChunkifyFile::from_bytes(name, data, &self.config.route))
    }

    /// Selects a file backed by an arbitrary source.
    pub fn add_source(&self, name: &str, source: Arc<dyn ChunkSource>) -> Arc<ChunkifyFile> {
        self.add_file(ChunkifyFile::new(name, source, &self.config.route))
    }

    /// Creates the session for `file` and wires callbacks and events to it.
    pub fn add_file(&self, file: ChunkifyFile) -> Arc<ChunkifyFile> {
        let file = Arc::new(file);
        for cb in &self.on_progress {
            file.aggregator().on_progress(Arc::clone(cb));
        }
        let events = self.events.clone();
        file.aggregator().on_progress(Arc::new(move |p: &UploadProgress| {
            events.emit(UploadEvent::Progress(p.clone()));
        }));

        let mut session = UploadSession::new(Arc::clone(&file), Arc::clone(&self.config));
        if let Some(cb) = &self.on_success {
            session = session.with_success(Arc::clone(cb));
        }
        self.lock_sessions()
            .insert(file.uuid().to_string(), Arc::new(session));
        file
    }

    /// Current status of a selected file.
    pub fn status(&self, reference: &str) -> Option<UploadStatus> {
        self.lock_sessions().get(reference).map(|s| s.status())
    }

    /// Cancels one file. Returns false if it is unknown.
    pub fn cancel(&self, reference: &str) -> bool {
        match self.session(reference) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Uploads `files` concurrently, one session each.
    ///
    /// More than one file requires `multiple`. Returns one result per file,
    /// in input order.
    pub async fn upload(
        &self,
        files: &[Arc<ChunkifyFile>],
        transport: &dyn Transport,
    ) -> Result<Vec<UploadResult>, UploadError> {
        if files.len() > 1 && !self.config.multiple {
            return Err(UploadError::MultipleNotAllowed);
        }
        let sessions: Vec<Arc<UploadSession>> = files
            .iter()
            .map(|f| self.session_for(f))
            .collect();
        info!(files = sessions.len(), "upload batch started");
        Ok(join_all(sessions.iter().map(|s| self.run_session(s, transport))).await)
    }

    /// Uploads every selected file that has not run yet.
    pub async fn upload_all(
        &self,
        transport: &dyn Transport,
    ) -> Result<Vec<UploadResult>, UploadError> {
        let pending: Vec<Arc<ChunkifyFile>> = self
            .lock_sessions()
            .values()
            .filter(|s| s.status() == UploadStatus::Pending)
            .map(|s| Arc::clone(s.file()))
            .collect();
        self.upload(&pending, transport).await
    }

    async fn run_session(
        &self,
        session: &UploadSession,
        transport: &dyn Transport,
    ) -> UploadResult {
        let run = session.run(transport);
        tokio::pin!(run);
        let result = tokio::select! {
            result = &mut run => result,
            _ = self.cancel.cancelled() => {
                session.cancel();
                run.await
            }
        };

        let file = session.file();
        let reference = file.uuid().to_string();
        let event = match &result {
            Ok(response) => UploadEvent::Completed {
                reference: reference.clone(),
                response: response.clone(),
            },
            Err(e) if e.is_cancelled() => UploadEvent::Cancelled {
                reference: reference.clone(),
            },
            Err(e) => UploadEvent::Failed {
                reference: reference.clone(),
                error: e.to_string(),
            },
        };
        self.events.emit(event);

        let (response, error, failed_chunk) = match result {
            Ok(response) => (Some(response), None, None),
            Err(e) => (None, Some(e.to_string()), e.chunk_index()),
        };
        UploadResult {
            reference,
            file_name: file.name().to_string(),
            status: session.status(),
            response,
            error,
            failed_chunk,
            outcomes: session.outcomes(),
        }
    }

    fn session_for(&self, file: &Arc<ChunkifyFile>) -> Arc<UploadSession> {
        if let Some(session) = self.session(file.uuid()) {
            return session;
        }
        // Files built outside the engine get a session on first upload.
        let mut session = UploadSession::new(Arc::clone(file), Arc::clone(&self.config));
        if let Some(cb) = &self.on_success {
            session = session.with_success(Arc::clone(cb));
        }
        let session = Arc::new(session);
        self.lock_sessions()
            .insert(file.uuid().to_string(), Arc::clone(&session));
        session
    }

    fn session(&self, reference: &str) -> Option<Arc<UploadSession>> {
        self.lock_sessions().get(reference).cloned()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<UploadSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
