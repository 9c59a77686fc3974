// Download task orchestration: one cancellable worker group per task drives
// the fetch sequence, readiness/progress/completion reporting, and record
// persistence. Operations are guarded by an explicit state machine; illegal
// transitions are rejected instead of racing.

mod variant;

pub use variant::{MediaVariant, UnitKind, WorkUnit};

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use hls::Playlist;

use crate::config::{CacheProxyConfig, directory_size};
use crate::error::DownloadError;
use crate::events::CacheEventHandler;
use crate::fetcher::{ResourceFetcher, SegmentFetcher};
use crate::hls::writer::{PROXY_PLAYLIST_NAME, write_proxy_playlist};
use crate::record::{CacheRecord, all_files_present};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Downloading,
    Suspended,
    Completed,
    Failed,
    Stopped,
}

impl TaskState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Downloading => "Downloading",
            Self::Suspended => "Suspended",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
        }
    }
}

/// Task-scoped worker group: a cancellation token, the semaphore bounding
/// in-flight units, and the spawned unit handles. Exactly one group is live
/// per task; the previous group's token is cancelled before the next group
/// is created.
struct WorkerGroup {
    token: CancellationToken,
    _handles: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    fn cancel(&self) {
        self.token.cancel();
    }
}

struct Ticker {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// A cancellable, seekable, resumable download of one video into one cache
/// directory. Create a new task per video; a stopped task cannot be reused.
pub struct DownloadTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    config: Arc<CacheProxyConfig>,
    fetcher: Arc<dyn ResourceFetcher>,
    variant: MediaVariant,
    source_url: String,
    namespace: String,
    dir: PathBuf,
    record: Arc<Mutex<CacheRecord>>,
    store: RecordStore,
    state: Mutex<TaskState>,
    group: Mutex<Option<WorkerGroup>>,
    handler: Mutex<Option<Arc<dyn CacheEventHandler>>>,
    /// One-time readiness latch; repeated readiness notifications are
    /// suppressed once announced.
    ready: AtomicBool,
    /// One-time completion-callback latch.
    finished: AtomicBool,
    /// Directory-scoped lock around proxy-manifest creation; multiple units
    /// race to be first.
    manifest_lock: tokio::sync::Mutex<()>,
    ticker: Mutex<Option<Ticker>>,
}

impl DownloadTask {
    /// Builds an HLS task from manifest text fetched by the caller.
    pub async fn hls(
        config: Arc<CacheProxyConfig>,
        source_url: &str,
        manifest_text: &str,
    ) -> Result<Self, DownloadError> {
        let playlist = Arc::new(Playlist::parse(manifest_text, source_url)?);
        Self::from_playlist(config, playlist).await
    }

    pub async fn from_playlist(
        config: Arc<CacheProxyConfig>,
        playlist: Arc<Playlist>,
    ) -> Result<Self, DownloadError> {
        let source_url = playlist.source_url.clone();
        let fetcher: Arc<dyn ResourceFetcher> = Arc::new(SegmentFetcher::new(&config)?);
        Self::with_parts(config, &source_url, MediaVariant::Hls(playlist), fetcher).await
    }

    /// Builds a task for a progressive (single-file) source.
    pub async fn progressive(
        config: Arc<CacheProxyConfig>,
        source_url: &str,
    ) -> Result<Self, DownloadError> {
        let fetcher: Arc<dyn ResourceFetcher> = Arc::new(SegmentFetcher::new(&config)?);
        Self::with_parts(config, source_url, MediaVariant::progressive(source_url), fetcher).await
    }

    /// Full-control constructor; the fetcher seam exists for tests.
    pub async fn with_parts(
        config: Arc<CacheProxyConfig>,
        source_url: &str,
        variant: MediaVariant,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Result<Self, DownloadError> {
        let namespace = CacheProxyConfig::cache_namespace(source_url);
        let dir = config.cache_root.join(&namespace);
        tokio::fs::create_dir_all(&dir).await?;

        // Replay on-disk state so progress survives process restarts.
        let contiguous = variant.restore_from(&dir).await;
        let store = RecordStore::new(&dir);
        let mut record = match store.load().await {
            Some(record) if record.source_url == source_url => record,
            _ => CacheRecord::new(source_url, &dir, variant.total_units(), variant.duration()),
        };
        record.total_segments = variant.total_units();
        record.cache_dir = dir.clone();
        record.set_cached_segments(contiguous);
        let complete = all_files_present(&dir, variant.local_names()).await;
        record.set_complete(complete);

        info!(
            url = %source_url,
            dir = %dir.display(),
            units = variant.total_units(),
            cached = contiguous,
            complete,
            "Created download task"
        );

        Ok(Self {
            inner: Arc::new(TaskInner {
                config,
                fetcher,
                variant,
                source_url: source_url.to_string(),
                namespace,
                dir,
                record: Arc::new(Mutex::new(record)),
                store,
                state: Mutex::new(TaskState::Idle),
                group: Mutex::new(None),
                handler: Mutex::new(None),
                ready: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                manifest_lock: tokio::sync::Mutex::new(()),
                ticker: Mutex::new(None),
            }),
        })
    }

    pub fn source_url(&self) -> &str {
        &self.inner.source_url
    }

    pub fn state(&self) -> TaskState {
        *self.inner.state.lock()
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        &self.inner.dir
    }

    /// Locally served URL handed to the player once the cache is ready.
    pub fn proxy_url(&self) -> String {
        self.inner.proxy_url()
    }

    pub fn record(&self) -> CacheRecord {
        self.inner.record.lock().clone()
    }

    /// Begins the fetch sequence at segment 0.
    pub async fn start(
        &self,
        handler: Arc<dyn CacheEventHandler>,
    ) -> Result<(), DownloadError> {
        self.inner
            .transition("start", &[TaskState::Idle], TaskState::Downloading)?;
        *self.inner.handler.lock() = Some(handler);
        spawn_ticker(&self.inner);
        info!(url = %self.inner.source_url, "Starting download task");
        begin(&self.inner, 0).await;
        Ok(())
    }

    /// Hard-cancels in-flight work and restarts the sequence at the segment
    /// covering `percent` of the total duration.
    pub async fn seek_to_percent(&self, percent: f32) -> Result<(), DownloadError> {
        let index = self.inner.variant.index_for_percent(percent);
        debug!(url = %self.inner.source_url, percent, index, "Seek requested");
        reseek(&self.inner, index, None).await
    }

    /// Seek with a replacement event handler, for consumers that re-attach.
    pub async fn seek_to_percent_with(
        &self,
        percent: f32,
        handler: Arc<dyn CacheEventHandler>,
    ) -> Result<(), DownloadError> {
        let index = self.inner.variant.index_for_percent(percent);
        reseek(&self.inner, index, Some(handler)).await
    }

    /// Seek by playback position in seconds.
    pub async fn seek_to_position(&self, position_secs: f64) -> Result<(), DownloadError> {
        let index = self.inner.variant.index_for_position(position_secs);
        debug!(url = %self.inner.source_url, position_secs, index, "Seek requested");
        reseek(&self.inner, index, None).await
    }

    /// Hard-cancels all in-flight fetches and persists a progress snapshot.
    /// Interrupted partial segments are discarded and refetched later.
    pub async fn pause(&self) -> Result<(), DownloadError> {
        self.inner
            .transition("pause", &[TaskState::Downloading], TaskState::Suspended)?;
        self.inner.cancel_group();
        info!(url = %self.inner.source_url, "Paused download task");
        self.inner.evaluate_completeness().await;
        self.inner.store.persist_snapshot(self.inner.record.lock().clone());
        Ok(())
    }

    /// Continues from the last cached contiguous index using the last known
    /// handler.
    pub async fn resume(&self) -> Result<(), DownloadError> {
        self.inner
            .transition("resume", &[TaskState::Suspended], TaskState::Downloading)?;
        let start = self.inner.variant.resume_index();
        info!(url = %self.inner.source_url, start, "Resuming download task");
        begin(&self.inner, start).await;
        Ok(())
    }

    /// Terminal: cancels work, runs a final completeness check, persists,
    /// and releases the progress ticker. The task cannot be restarted.
    pub async fn stop(&self) -> Result<(), DownloadError> {
        self.inner.transition(
            "stop",
            &[
                TaskState::Idle,
                TaskState::Downloading,
                TaskState::Suspended,
                TaskState::Failed,
            ],
            TaskState::Stopped,
        )?;
        self.inner.cancel_group();
        self.inner.stop_ticker();
        info!(url = %self.inner.source_url, "Stopped download task");
        let complete = self.inner.evaluate_completeness().await;
        if !complete {
            self.inner.store.persist_snapshot(self.inner.record.lock().clone());
        }
        Ok(())
    }
}

impl TaskInner {
    fn transition(
        &self,
        operation: &'static str,
        allowed: &[TaskState],
        next: TaskState,
    ) -> Result<TaskState, DownloadError> {
        let mut state = self.state.lock();
        if !allowed.contains(&*state) {
            return Err(DownloadError::InvalidState {
                state: state.name(),
                operation,
            });
        }
        let previous = *state;
        *state = next;
        Ok(previous)
    }

    fn proxy_url(&self) -> String {
        self.config
            .proxy_url(&self.namespace, self.variant.ready_file_name())
    }

    fn handler(&self) -> Option<Arc<dyn CacheEventHandler>> {
        self.handler.lock().clone()
    }

    fn cancel_group(&self) {
        if let Some(group) = self.group.lock().take() {
            group.cancel();
        }
    }

    /// Publishes the proxy manifest (once) and announces readiness (once).
    async fn ensure_ready(&self) -> Result<(), DownloadError> {
        {
            let _guard = self.manifest_lock.lock().await;
            if let MediaVariant::Hls(playlist) = &self.variant {
                let published = self.dir.join(PROXY_PLAYLIST_NAME);
                if !published.is_file() {
                    write_proxy_playlist(playlist, &self.dir, &self.config, &self.namespace)
                        .await?;
                }
            }
        }

        if !self.ready.swap(true, Ordering::SeqCst) {
            let proxy_url = self.proxy_url();
            info!(url = %self.source_url, proxy_url = %proxy_url, "Cache ready");
            if let Some(handler) = self.handler() {
                handler.on_cache_ready(&self.source_url, &proxy_url);
            }
        }
        Ok(())
    }

    async fn notify_progress(&self) {
        let mut cached_bytes = self.variant.cached_bytes();
        if cached_bytes == 0 {
            // Sizes are unknown right after restoring a persisted record;
            // fall back to what is actually on disk.
            cached_bytes = directory_size(&self.dir).await;
        }
        // Read the percentage last so a concurrent completion cannot be
        // reported out of order.
        let percent = self.record.lock().percent();
        if let Some(handler) = self.handler() {
            handler.on_cache_progress(
                &self.source_url,
                percent,
                cached_bytes,
                self.variant.playlist().cloned(),
            );
        }
    }

    /// Scans the filesystem for every unit's local file. A transition into
    /// complete fires exactly one completion callback and one idempotent
    /// persistence write.
    async fn evaluate_completeness(&self) -> bool {
        let complete = all_files_present(&self.dir, self.variant.local_names()).await;
        self.record.lock().set_complete(complete);
        if complete {
            self.finish();
        }
        complete
    }

    fn finish(&self) {
        self.store.persist_completed(&self.record);
        if !self.finished.swap(true, Ordering::SeqCst) {
            {
                // stop() landing on a fully cached record also completes.
                let mut state = self.state.lock();
                *state = TaskState::Completed;
            }
            self.stop_ticker();
            info!(url = %self.source_url, "Cache finished");
            if let Some(handler) = self.handler() {
                handler.on_cache_finished(&self.source_url);
            }
        }
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.token.cancel();
        }
    }
}

async fn reseek(
    inner: &Arc<TaskInner>,
    index: usize,
    handler: Option<Arc<dyn CacheEventHandler>>,
) -> Result<(), DownloadError> {
    // Seeking clears the suspended flag; teardown of the previous group
    // happens synchronously below, so no two groups are ever live.
    inner.transition(
        "seek",
        &[TaskState::Downloading, TaskState::Suspended],
        TaskState::Downloading,
    )?;
    if let Some(handler) = handler {
        *inner.handler.lock() = Some(handler);
    }
    inner.cancel_group();
    begin(inner, index).await;
    Ok(())
}

/// Starts the fetch sequence at `start`, or short-circuits when the record
/// is already complete.
async fn begin(inner: &Arc<TaskInner>, start: usize) {
    if inner.record.lock().complete {
        debug!(url = %inner.source_url, "Cache already complete; announcing without workers");
        if let Err(e) = inner.ensure_ready().await {
            warn!(url = %inner.source_url, error = %e, "Failed to publish manifest for completed cache");
        }
        inner.notify_progress().await;
        inner.finish();
        return;
    }
    launch_group(inner, start);
}

/// Tears down the previous worker group (if any) and spawns one unit per
/// index from `start` to the last. Submission stops once the fresh token is
/// cancelled; already-spawned units observe it cooperatively.
fn launch_group(inner: &Arc<TaskInner>, start: usize) {
    let mut slot = inner.group.lock();
    if let Some(previous) = slot.take() {
        previous.cancel();
    }
    // A pause or stop that won the state machine since this launch was
    // decided must not be raced by a fresh group.
    if *inner.state.lock() != TaskState::Downloading {
        return;
    }

    let token = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(inner.config.download_concurrency));
    let mut handles = Vec::new();

    // The shared encryption key is fetched alongside the first segments.
    if let Some(key_unit) = inner.variant.key_unit() {
        handles.push(spawn_unit(inner, key_unit, &token, &semaphore));
    }

    let total = inner.variant.total_units();
    for index in start..total {
        if token.is_cancelled() {
            break;
        }
        let Some(unit) = inner.variant.unit(index) else {
            continue;
        };
        handles.push(spawn_unit(inner, unit, &token, &semaphore));
    }

    debug!(
        url = %inner.source_url,
        start,
        units = handles.len(),
        "Launched worker group"
    );
    *slot = Some(WorkerGroup {
        token,
        _handles: handles,
    });
}

async fn execute_unit(
    inner: &Arc<TaskInner>,
    unit: &WorkUnit,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    let path = inner.dir.join(&unit.local_name);

    if unit.kind == UnitKind::Key {
        if !path.is_file() {
            inner.fetcher.fetch_to_file(&unit.url, &path, token).await?;
            debug!(url = %unit.url, "Cached encryption key");
        }
        return Ok(());
    }

    // Resuming never re-fetches a segment whose local file exists.
    if !path.is_file() {
        inner.fetcher.fetch_to_file(&unit.url, &path, token).await?;
    }

    let size = tokio::fs::metadata(&path).await?.len();
    let contiguous = inner.variant.record_unit_success(unit.index, size);
    inner.record.lock().set_cached_segments(contiguous);
    trace!(index = unit.index, size, contiguous, "Unit complete");

    // The manifest is published, under the directory lock, before any
    // readiness is reported; the first successful unit announces it.
    inner.ensure_ready().await?;
    inner.notify_progress().await;
    inner.evaluate_completeness().await;
    Ok(())
}

/// Classifies a unit failure. Failures never terminate sibling units.
async fn handle_unit_error(inner: &Arc<TaskInner>, unit: &WorkUnit, error: DownloadError) {
    if matches!(error, DownloadError::Cancelled) {
        trace!(index = unit.index, "Unit cancelled");
        return;
    }
    if unit.kind == UnitKind::Key {
        // Non-fatal: the rewritten manifest keeps the remote key URI.
        warn!(url = %unit.url, error = %error, "Key fetch failed");
        return;
    }
    if error.is_skippable() {
        warn!(
            index = unit.index,
            url = %unit.url,
            error = %error,
            "Skipping segment with malformed URL"
        );
        return;
    }
    if error.is_recoverable() {
        warn!(
            index = unit.index,
            error = %error,
            "Transient fetch error; auto-resuming"
        );
        auto_resume(inner);
        return;
    }

    error!(index = unit.index, url = %unit.url, error = %error, "Segment fetch failed");
    {
        let mut state = inner.state.lock();
        if *state == TaskState::Downloading {
            *state = TaskState::Failed;
        }
    }
    inner.evaluate_completeness().await;
    if let Some(handler) = inner.handler() {
        handler.on_cache_failed(&inner.source_url, &error);
    }
}

/// Re-enters the fetch sequence from the contiguous cursor after a transient
/// failure, with a fresh worker group.
fn auto_resume(inner: &Arc<TaskInner>) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        if *inner.state.lock() != TaskState::Downloading {
            return;
        }
        let start = inner.variant.resume_index();
        info!(url = %inner.source_url, start, "Auto-resuming fetch sequence");
        launch_group(&inner, start);
    });
}

fn spawn_ticker(inner: &Arc<TaskInner>) {
    let token = CancellationToken::new();
    let ticker_inner = Arc::clone(inner);
    let ticker_token = token.clone();
    let period = inner.config.progress_interval;
    let handle = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker_token.cancelled() => break,
                _ = interval.tick() => {
                    if *ticker_inner.state.lock() == TaskState::Downloading {
                        ticker_inner.notify_progress().await;
                    }
                }
            }
        }
    });
    *inner.ticker.lock() = Some(Ticker {
        token,
        _handle: handle,
    });
}

fn spawn_unit(
    inner: &Arc<TaskInner>,
    unit: WorkUnit,
    token: &CancellationToken,
    semaphore: &Arc<Semaphore>,
) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    let token = token.clone();
    let semaphore = Arc::clone(semaphore);
    tokio::spawn(async move {
        let _permit = tokio::select! {
            _ = token.cancelled() => return,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        if token.is_cancelled() {
            return;
        }
        if let Err(error) = execute_unit(&inner, &unit, &token).await {
            handle_unit_error(&inner, &unit, error).await;
        }
    })
}
