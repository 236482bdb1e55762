use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use chunkify_protocol::{UploadProgress, UploadStatus};

use crate::splitter::ChunkRange;
use crate::types::ChunkProgress;

/// Callback invoked with every aggregate progress update.
pub type ProgressCallback = Arc<dyn Fn(&UploadProgress) + Send + Sync>;

// ---------------------------------------------------------------------------
// ProgressAggregator
// ---------------------------------------------------------------------------

/// Folds per-chunk progress into one file-level value.
///
/// Every mutation goes through a single mutex, and callbacks run while it is
/// held, so observers see a non-decreasing sequence even when several
/// workers complete chunks at once.
pub struct ProgressAggregator {
    inner: Mutex<AggregatorInner>,
}

struct AggregatorInner {
    reference: String,
    file_name: String,
    status: UploadStatus,
    total_bytes: u64,
    total_chunks: u32,
    completed_chunks: u32,
    confirmed_bytes: u64,
    /// Length of every dispatched, unconfirmed chunk.
    chunk_lens: HashMap<u32, u64>,
    /// Bytes the transport reports as sent for unconfirmed chunks.
    partial: HashMap<u32, u64>,
    /// High-water mark of reported bytes.
    reported_bytes: u64,
    error: String,
    throughput: ThroughputWindow,
    callbacks: Vec<ProgressCallback>,
}

impl AggregatorInner {
    fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            let done = self.total_chunks > 0 && self.completed_chunks >= self.total_chunks;
            return if done { 100.0 } else { 0.0 };
        }
        self.reported_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    /// Raises the high-water mark; returns the increase.
    fn refresh(&mut self) -> u64 {
        let partial: u64 = self.partial.values().sum();
        let current = (self.confirmed_bytes + partial).min(self.total_bytes);
        if current > self.reported_bytes {
            let delta = current - self.reported_bytes;
            self.reported_bytes = current;
            self.throughput.push(delta);
            delta
        } else {
            0
        }
    }

    fn snapshot(&self) -> UploadProgress {
        let mut progress = UploadProgress {
            reference: self.reference.clone(),
            file_name: self.file_name.clone(),
            status: self.status,
            total_bytes: self.total_bytes,
            uploaded_bytes: self.reported_bytes,
            percentage: self.percentage(),
            bytes_per_second: self.throughput.rate(),
            eta_secs: None,
            error: self.error.clone(),
        };
        if progress.status == UploadStatus::Uploading {
            progress.eta_secs = self.throughput.eta_secs(progress.remaining_bytes());
        }
        progress
    }
}

impl ProgressAggregator {
    pub fn new(reference: &str, file_name: &str, total_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(AggregatorInner {
                reference: reference.to_string(),
                file_name: file_name.to_string(),
                status: UploadStatus::Pending,
                total_bytes,
                total_chunks: 0,
                completed_chunks: 0,
                confirmed_bytes: 0,
                chunk_lens: HashMap::new(),
                partial: HashMap::new(),
                reported_bytes: 0,
                error: String::new(),
                throughput: ThroughputWindow::new(THROUGHPUT_SPAN),
                callbacks: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorInner> {
        // Progress is advisory; a panicking observer must not wedge uploads.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, inner: &AggregatorInner) {
        if inner.callbacks.is_empty() {
            return;
        }
        let snapshot = inner.snapshot();
        for cb in &inner.callbacks {
            cb(&snapshot);
        }
    }

    /// Registers a progress callback.
    ///
    /// Callbacks run under the aggregator lock and must not call back into
    /// the aggregator.
    pub fn on_progress(&self, callback: ProgressCallback) {
        self.lock().callbacks.push(callback);
    }

    /// Marks the file as uploading with `total_chunks` chunks.
    pub fn begin(&self, total_chunks: u32) {
        let mut inner = self.lock();
        inner.status = UploadStatus::Uploading;
        inner.total_chunks = total_chunks;
        inner.throughput.clear();
        self.emit(&inner);
    }

    /// Registers a chunk as in flight.
    pub fn start_chunk(&self, range: &ChunkRange) {
        let mut inner = self.lock();
        inner.chunk_lens.insert(range.index, range.len());
        inner.partial.insert(range.index, 0);
    }

    /// Applies a partial-send report.
    pub fn record(&self, progress: &ChunkProgress) {
        let mut inner = self.lock();
        if progress.reference != inner.reference {
            return;
        }
        let Some(&len) = inner.chunk_lens.get(&progress.index) else {
            // Already confirmed or never dispatched.
            return;
        };
        let pct = progress.percentage.clamp(0.0, 100.0);
        let sent = ((len as f64) * pct / 100.0).round() as u64;
        inner.partial.insert(progress.index, sent.min(len));
        if inner.refresh() > 0 {
            self.emit(&inner);
        }
    }

    /// Drops a chunk's partial progress before it is retried.
    ///
    /// The reported aggregate never goes down.
    pub fn reset_chunk(&self, index: u32) {
        let mut inner = self.lock();
        if inner.partial.contains_key(&index) {
            inner.partial.insert(index, 0);
        }
    }

    /// Confirms a chunk as fully uploaded. Always emits.
    pub fn complete_chunk(&self, index: u32) {
        let mut inner = self.lock();
        let Some(len) = inner.chunk_lens.remove(&index) else {
            return;
        };
        inner.partial.remove(&index);
        inner.confirmed_bytes += len;
        inner.completed_chunks += 1;
        inner.refresh();
        self.emit(&inner);
    }

    /// Records the terminal status and emits a final snapshot.
    pub fn finish(&self, status: UploadStatus, error: Option<&str>) {
        let mut inner = self.lock();
        inner.status = status;
        inner.error = error.unwrap_or_default().to_string();
        inner.chunk_lens.clear();
        inner.partial.clear();
        self.emit(&inner);
        inner.throughput.clear();
    }

    /// Aggregate progress, 0-100.
    pub fn percentage(&self) -> f64 {
        self.lock().percentage()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.lock().reported_bytes
    }

    pub fn completed_chunks(&self) -> u32 {
        self.lock().completed_chunks
    }

    pub fn snapshot(&self) -> UploadProgress {
        self.lock().snapshot()
    }
}

/// Handle a transport uses to report how much of one chunk has been sent.
#[derive(Clone)]
pub struct ChunkProgressReporter {
    aggregator: Arc<ProgressAggregator>,
    reference: String,
    index: u32,
    len: u64,
}

impl ChunkProgressReporter {
    pub fn new(aggregator: Arc<ProgressAggregator>, reference: &str, range: &ChunkRange) -> Self {
        Self {
            aggregator,
            reference: reference.to_string(),
            index: range.index,
            len: range.len(),
        }
    }

    /// Reports a percentage of this chunk as sent.
    pub fn report(&self, percentage: f64) {
        self.aggregator.record(&ChunkProgress {
            reference: self.reference.clone(),
            index: self.index,
            percentage,
        });
    }

    /// Reports `sent` bytes of this chunk as sent.
    pub fn report_bytes(&self, sent: u64) {
        if self.len == 0 {
            return;
        }
        self.report(sent.min(self.len) as f64 / self.len as f64 * 100.0);
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

// ---------------------------------------------------------------------------
// ThroughputWindow
// ---------------------------------------------------------------------------

/// How far back throughput is measured.
const THROUGHPUT_SPAN: Duration = Duration::from_secs(5);

/// Rate of newly reported bytes over a recent span of time.
///
/// Each entry is one increase of the aggregate. The oldest entry only marks
/// where the span starts, so its bytes do not count toward the rate.
struct ThroughputWindow {
    span: Duration,
    entries: VecDeque<(Instant, u64)>,
    /// Sum of every entry's bytes.
    bytes: u64,
}

impl ThroughputWindow {
    fn new(span: Duration) -> Self {
        Self {
            span,
            entries: VecDeque::new(),
            bytes: 0,
        }
    }

    fn push(&mut self, bytes: u64) {
        let now = Instant::now();
        self.entries.push_back((now, bytes));
        self.bytes += bytes;
        while self.entries.len() > 1 {
            let Some(&(at, old)) = self.entries.front() else {
                break;
            };
            if now.duration_since(at) <= self.span {
                break;
            }
            self.entries.pop_front();
            self.bytes -= old;
        }
    }

    /// Bytes per second, or 0 until two increases are far enough apart.
    fn rate(&self) -> f64 {
        let (Some(&(first, first_bytes)), Some(&(last, _))) =
            (self.entries.front(), self.entries.back())
        else {
            return 0.0;
        };
        let elapsed = last.duration_since(first);
        if elapsed.is_zero() {
            return 0.0;
        }
        (self.bytes - first_bytes) as f64 / elapsed.as_secs_f64()
    }

    fn eta_secs(&self, remaining: u64) -> Option<f64> {
        let rate = self.rate();
        (rate > 0.0).then(|| remaining as f64 / rate)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(index: u32, start: u64, end: u64, total_count: u32) -> ChunkRange {
        ChunkRange {
            index,
            start,
            end,
            total_count,
        }
    }

    fn recording(agg: &ProgressAggregator) -> Arc<Mutex<Vec<UploadProgress>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        agg.on_progress(Arc::new(move |p| s.lock().unwrap().push(p.clone())));
        seen
    }

    #[test]
    fn completes_to_exactly_one_hundred() {
        let agg = ProgressAggregator::new("r", "f.bin", 25);
        agg.begin(3);
        for (i, (s, e)) in [(0, 10), (10, 20), (20, 25)].into_iter().enumerate() {
            let r = range(i as u32, s, e, 3);
            agg.start_chunk(&r);
            agg.complete_chunk(r.index);
        }
        assert_eq!(agg.percentage(), 100.0);
        assert_eq!(agg.uploaded_bytes(), 25);
        assert_eq!(agg.completed_chunks(), 3);
    }

    #[test]
    fn emits_once_per_completed_chunk() {
        let agg = ProgressAggregator::new("r", "f.bin", 20);
        let seen = recording(&agg);
        agg.begin(2);
        let r0 = range(0, 0, 10, 2);
        let r1 = range(1, 10, 20, 2);
        agg.start_chunk(&r0);
        agg.start_chunk(&r1);
        agg.complete_chunk(1);
        agg.complete_chunk(0);

        let seen = seen.lock().unwrap();
        // begin + two completions.
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].status, UploadStatus::Uploading);
        assert_eq!(seen[1].uploaded_bytes, 10);
        assert_eq!(seen[2].percentage, 100.0);
    }

    #[test]
    fn partial_progress_counts_toward_aggregate() {
        let agg = ProgressAggregator::new("r", "f.bin", 100);
        agg.begin(2);
        let r0 = range(0, 0, 50, 2);
        agg.start_chunk(&r0);
        agg.record(&ChunkProgress {
            reference: "r".into(),
            index: 0,
            percentage: 40.0,
        });
        assert_eq!(agg.uploaded_bytes(), 20);
        assert!((agg.percentage() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn retry_reset_never_lowers_aggregate() {
        let agg = ProgressAggregator::new("r", "f.bin", 100);
        let seen = recording(&agg);
        agg.begin(1);
        let r0 = range(0, 0, 100, 1);
        agg.start_chunk(&r0);

        agg.record(&ChunkProgress {
            reference: "r".into(),
            index: 0,
            percentage: 60.0,
        });
        agg.reset_chunk(0);
        agg.record(&ChunkProgress {
            reference: "r".into(),
            index: 0,
            percentage: 30.0,
        });
        assert_eq!(agg.uploaded_bytes(), 60);

        agg.record(&ChunkProgress {
            reference: "r".into(),
            index: 0,
            percentage: 80.0,
        });
        agg.complete_chunk(0);

        let seen = seen.lock().unwrap();
        let mut last = -1.0;
        for p in seen.iter() {
            assert!(p.percentage >= last, "{last} -> {}", p.percentage);
            last = p.percentage;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn reporter_converts_bytes_to_percentage() {
        let agg = Arc::new(ProgressAggregator::new("r", "f.bin", 200));
        agg.begin(2);
        let r1 = range(1, 100, 200, 2);
        agg.start_chunk(&r1);

        let reporter = ChunkProgressReporter::new(Arc::clone(&agg), "r", &r1);
        assert_eq!(reporter.index(), 1);
        reporter.report_bytes(25);
        assert_eq!(agg.uploaded_bytes(), 25);
        reporter.report_bytes(1_000); // Clamped to the chunk length.
        assert_eq!(agg.uploaded_bytes(), 100);
    }

    #[test]
    fn reports_for_unknown_chunks_are_ignored() {
        let agg = ProgressAggregator::new("r", "f.bin", 10);
        agg.begin(1);
        agg.record(&ChunkProgress {
            reference: "r".into(),
            index: 5,
            percentage: 100.0,
        });
        agg.complete_chunk(5);
        assert_eq!(agg.uploaded_bytes(), 0);
        assert_eq!(agg.completed_chunks(), 0);
    }

    #[test]
    fn zero_byte_file_reaches_one_hundred_on_completion() {
        let agg = ProgressAggregator::new("r", "empty", 0);
        agg.begin(1);
        assert_eq!(agg.percentage(), 0.0);
        agg.start_chunk(&range(0, 0, 0, 1));
        agg.complete_chunk(0);
        assert_eq!(agg.percentage(), 100.0);
    }

    #[test]
    fn finish_records_status_and_error() {
        let agg = ProgressAggregator::new("r", "f.bin", 10);
        let seen = recording(&agg);
        agg.begin(1);
        agg.finish(UploadStatus::Failed, Some("chunk 0 rejected"));

        let snap = agg.snapshot();
        assert_eq!(snap.status, UploadStatus::Failed);
        assert_eq!(snap.error, "chunk 0 rejected");
        assert_eq!(seen.lock().unwrap().last().unwrap().status, UploadStatus::Failed);
    }

    #[test]
    fn concurrent_completions_do_not_lose_updates() {
        use std::thread;

        let chunks = 64u32;
        let agg = Arc::new(ProgressAggregator::new("r", "f.bin", u64::from(chunks) * 10));
        agg.begin(chunks);
        for i in 0..chunks {
            agg.start_chunk(&range(i, u64::from(i) * 10, u64::from(i + 1) * 10, chunks));
        }

        let mut handles = vec![];
        for t in 0..8u32 {
            let a = Arc::clone(&agg);
            handles.push(thread::spawn(move || {
                for i in (t..chunks).step_by(8) {
                    a.complete_chunk(i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(agg.completed_chunks(), chunks);
        assert_eq!(agg.uploaded_bytes(), u64::from(chunks) * 10);
        assert_eq!(agg.percentage(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_carries_rate_and_eta() {
        let agg = ProgressAggregator::new("r", "f.bin", 200);
        agg.begin(2);
        agg.start_chunk(&range(0, 0, 100, 2));
        agg.record(&ChunkProgress {
            reference: "r".into(),
            index: 0,
            percentage: 50.0,
        });
        // One increase says nothing about speed yet.
        let snap = agg.snapshot();
        assert_eq!(snap.bytes_per_second, 0.0);
        assert_eq!(snap.eta_secs, None);

        tokio::time::advance(Duration::from_secs(1)).await;
        agg.complete_chunk(0);

        let snap = agg.snapshot();
        assert_eq!(snap.uploaded_bytes, 100);
        assert_eq!(snap.bytes_per_second, 50.0);
        assert_eq!(snap.eta_secs, Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_drops_eta_and_clears_rate() {
        let agg = ProgressAggregator::new("r", "f.bin", 100);
        let seen = recording(&agg);
        agg.begin(2);
        agg.start_chunk(&range(0, 0, 50, 2));
        agg.start_chunk(&range(1, 50, 100, 2));
        agg.complete_chunk(0);
        tokio::time::advance(Duration::from_secs(1)).await;
        agg.complete_chunk(1);
        agg.finish(UploadStatus::Completed, None);

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.status, UploadStatus::Completed);
        assert_eq!(last.bytes_per_second, 50.0);
        assert_eq!(last.eta_secs, None);
        assert_eq!(agg.snapshot().bytes_per_second, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn begin_starts_a_fresh_window() {
        let agg = ProgressAggregator::new("r", "f.bin", 100);
        agg.begin(2);
        agg.start_chunk(&range(0, 0, 50, 2));
        agg.record(&ChunkProgress {
            reference: "r".into(),
            index: 0,
            percentage: 20.0,
        });
        tokio::time::advance(Duration::from_secs(1)).await;
        agg.complete_chunk(0);
        assert!(agg.snapshot().bytes_per_second > 0.0);

        agg.begin(2);
        assert_eq!(agg.snapshot().bytes_per_second, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_forgets_increases_older_than_span() {
        let mut window = ThroughputWindow::new(Duration::from_secs(5));
        window.push(1_000);
        tokio::time::advance(Duration::from_secs(1)).await;
        window.push(1_000);
        assert_eq!(window.rate(), 1_000.0);

        // A long stall leaves only the newest increase in the span.
        tokio::time::advance(Duration::from_secs(10)).await;
        window.push(10);
        assert_eq!(window.rate(), 0.0);
        assert_eq!(window.eta_secs(500), None);

        tokio::time::advance(Duration::from_secs(2)).await;
        window.push(400);
        assert_eq!(window.rate(), 200.0);
        assert_eq!(window.eta_secs(500), Some(2.5));
    }
}
