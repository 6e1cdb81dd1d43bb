//! The unit of work: one URL and everything known about its transfer.
//!
//! # Locking
//!
//! A record has three kinds of mutable state:
//! - `downloaded_bytes` and `attempting` are atomics, updated on the write
//!   path without taking any lock;
//! - `state` is a per-record mutex for metadata and throughput, held only
//!   for short, non-async critical sections;
//! - `task` holds the supervised attempt, if any.
//!
//! Callers that also hold the registry lock must take it first. `state`
//! and `task` are never held at the same time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::DownloadError;
use super::filename::{FilenameGuesses, filename_from_url, temp_file_name};
use super::progress::ThroughputWindow;
use super::transport::{ResponseMeta, Transport};
use crate::config::EngineConfig;

/// Persisted form of a record, also used as the registry-changed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSnapshot {
    /// Source URL, unique within the registry.
    pub url: String,
    /// Temp file the bytes are streamed into.
    pub temp_file_path: PathBuf,
    /// Candidate names for the finished file.
    #[serde(default)]
    pub filename_guesses: FilenameGuesses,
    /// Total length once a response has revealed it.
    pub total_bytes: Option<u64>,
    /// Bytes on disk.
    pub downloaded_bytes: u64,
    /// Whether the server accepts byte ranges.
    pub resumable: bool,
    /// Excluded from scheduling.
    pub paused: bool,
    /// All bytes received; terminal.
    pub complete: bool,
    /// Percent complete.
    pub percent: f32,
    /// Smoothed throughput.
    pub bytes_per_second: u64,
    /// Start of the most recent attempt, in Unix milliseconds.
    pub last_attempt_timestamp: Option<u64>,
    /// Number of attempts started.
    pub attempt_count: u32,
    /// Cause of the most recent aborted attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Payload of a progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Record URL.
    pub url: String,
    /// Bytes on disk.
    pub downloaded: u64,
    /// Total length, when known.
    pub total: Option<u64>,
    /// Smoothed throughput.
    pub bytes_per_second: u64,
    /// Percent complete.
    pub percent: f32,
}

#[derive(Debug)]
struct RecordState {
    filename_guesses: FilenameGuesses,
    total_bytes: Option<u64>,
    resumable: bool,
    paused: bool,
    complete: bool,
    percent: f32,
    bytes_per_second: u64,
    last_attempt_ms: Option<u64>,
    attempt_count: u32,
    last_error: Option<String>,
    throughput: ThroughputWindow,
}

/// A supervised attempt: the spawned task and the token that cancels it.
#[derive(Debug)]
pub(crate) struct AttemptTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl AttemptTask {
    pub(crate) fn new(cancel: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self { cancel, handle }
    }

    /// Cancels the attempt and waits until its task has exited.
    pub(crate) async fn cancel_and_wait(self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Waits for the attempt to finish on its own.
    pub(crate) async fn wait(self) {
        if let Err(error) = self.handle.await {
            warn!(error = %error, "download attempt task panicked");
        }
    }
}

/// Marks a record as mid-attempt for as long as it lives.
///
/// Obtained from [`DownloadRecord::try_begin_attempt`]; dropping it (even on
/// task abort) makes the record eligible for the next attempt.
#[derive(Debug)]
pub struct AttemptGuard {
    record: Arc<DownloadRecord>,
    previous_attempt_ms: Option<u64>,
}

impl AttemptGuard {
    /// The record this attempt belongs to.
    #[must_use]
    pub fn record(&self) -> &Arc<DownloadRecord> {
        &self.record
    }

    /// Puts back the attempt timestamp this attempt replaced, so a cancelled
    /// attempt does not count against the minimum spacing.
    pub(crate) fn release_spacing(&self) {
        self.record.lock_state().last_attempt_ms = self.previous_attempt_ms;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.record.attempting.store(false, Ordering::SeqCst);
    }
}

/// One tracked download.
#[derive(Debug)]
pub struct DownloadRecord {
    url: String,
    temp_file: PathBuf,
    downloaded_bytes: AtomicU64,
    attempting: AtomicBool,
    state: Mutex<RecordState>,
    task: Mutex<Option<AttemptTask>>,
}

impl DownloadRecord {
    /// Creates a record for a user-submitted URL.
    ///
    /// The URL must be absolute HTTP(S). The temp directory is created and
    /// the temp file opened (or created) up front so that filesystem
    /// problems surface to the caller instead of on the first attempt. An
    /// existing temp file is kept and its length becomes the starting
    /// offset.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::InvalidUrl`] for malformed or non-HTTP URLs
    /// - [`DownloadError::Io`] if the temp file cannot be created
    pub fn new(url: &str, config: &EngineConfig) -> Result<Self, DownloadError> {
        let parsed = parse_download_url(url)?;
        let url = parsed.to_string();

        let temp_dir = config.temp_dir();
        std::fs::create_dir_all(&temp_dir).map_err(|e| DownloadError::io(&temp_dir, e))?;
        let temp_file = temp_dir.join(temp_file_name(&url));
        let existing = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&temp_file)
            .and_then(|file| file.metadata())
            .map_err(|e| DownloadError::io(&temp_file, e))?
            .len();

        debug!(url = %url, temp_file = %temp_file.display(), existing, "created download record");

        Ok(Self {
            temp_file,
            downloaded_bytes: AtomicU64::new(existing),
            attempting: AtomicBool::new(false),
            state: Mutex::new(RecordState {
                filename_guesses: FilenameGuesses {
                    from_url: filename_from_url(&parsed),
                    from_header: None,
                },
                total_bytes: None,
                resumable: false,
                paused: false,
                complete: false,
                percent: 0.0,
                bytes_per_second: 0,
                last_attempt_ms: None,
                attempt_count: 0,
                last_error: None,
                throughput: ThroughputWindow::new(config.throughput_window, config.snap_interval),
            }),
            task: Mutex::new(None),
            url,
        })
    }

    /// Rebuilds a record from its persisted form.
    #[must_use]
    pub fn from_snapshot(snapshot: RecordSnapshot, config: &EngineConfig) -> Self {
        Self {
            url: snapshot.url,
            temp_file: snapshot.temp_file_path,
            downloaded_bytes: AtomicU64::new(snapshot.downloaded_bytes),
            attempting: AtomicBool::new(false),
            state: Mutex::new(RecordState {
                filename_guesses: snapshot.filename_guesses,
                total_bytes: snapshot.total_bytes,
                resumable: snapshot.resumable,
                paused: snapshot.paused,
                complete: snapshot.complete,
                percent: snapshot.percent,
                bytes_per_second: snapshot.bytes_per_second,
                last_attempt_ms: snapshot.last_attempt_timestamp,
                attempt_count: snapshot.attempt_count,
                last_error: snapshot.last_error,
                throughput: ThroughputWindow::new(config.throughput_window, config.snap_interval),
            }),
            task: Mutex::new(None),
        }
    }

    /// Captures the persisted form of this record.
    #[must_use]
    pub fn snapshot(&self) -> RecordSnapshot {
        let state = self.lock_state();
        RecordSnapshot {
            url: self.url.clone(),
            temp_file_path: self.temp_file.clone(),
            filename_guesses: state.filename_guesses.clone(),
            total_bytes: state.total_bytes,
            downloaded_bytes: self.downloaded_bytes(),
            resumable: state.resumable,
            paused: state.paused,
            complete: state.complete,
            percent: state.percent,
            bytes_per_second: state.bytes_per_second,
            last_attempt_timestamp: state.last_attempt_ms,
            attempt_count: state.attempt_count,
            last_error: state.last_error.clone(),
        }
    }

    /// Source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Temp file path.
    #[must_use]
    pub fn temp_file(&self) -> &Path {
        &self.temp_file
    }

    /// Bytes written so far.
    #[must_use]
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::SeqCst)
    }

    /// Total length, when known.
    #[must_use]
    pub fn total_bytes(&self) -> Option<u64> {
        self.lock_state().total_bytes
    }

    /// Whether the server accepts byte ranges.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.lock_state().resumable
    }

    /// Whether the record is excluded from scheduling.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock_state().paused
    }

    /// Whether every byte has been received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lock_state().complete
    }

    /// Whether an attempt currently runs.
    #[must_use]
    pub fn is_attempting(&self) -> bool {
        self.attempting.load(Ordering::SeqCst)
    }

    /// Number of attempts started.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.lock_state().attempt_count
    }

    /// Candidate names for the finished file.
    #[must_use]
    pub fn filename_guesses(&self) -> FilenameGuesses {
        self.lock_state().filename_guesses.clone()
    }

    /// Cause of the most recent aborted attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    /// Sets or clears the paused flag. Returns the previous value.
    ///
    /// Does not touch a running attempt; see [`take_task`](Self::take_task).
    pub fn set_paused(&self, paused: bool) -> bool {
        std::mem::replace(&mut self.lock_state().paused, paused)
    }

    /// True when the scheduler may start an attempt on this record.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        let state = self.lock_state();
        !state.paused && !state.complete
    }

    /// Claims the right to run an attempt.
    ///
    /// Fails when the record is paused or complete, when another attempt is
    /// running, or when the previous attempt started less than
    /// `min_interval` ago (wall-clock). On success the attempt counter and
    /// timestamp are updated.
    #[must_use]
    pub fn try_begin_attempt(self: &Arc<Self>, min_interval: Duration) -> Option<AttemptGuard> {
        self.try_begin_attempt_at(unix_millis(SystemTime::now()), min_interval)
    }

    pub(crate) fn try_begin_attempt_at(
        self: &Arc<Self>,
        now_ms: u64,
        min_interval: Duration,
    ) -> Option<AttemptGuard> {
        if self
            .attempting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let mut guard = AttemptGuard {
            record: Arc::clone(self),
            previous_attempt_ms: None,
        };

        let mut state = self.lock_state();
        if state.paused || state.complete {
            return None;
        }
        let min_ms = u64::try_from(min_interval.as_millis()).unwrap_or(u64::MAX);
        if let Some(last) = state.last_attempt_ms
            && now_ms >= last
            && now_ms - last < min_ms
        {
            return None;
        }
        guard.previous_attempt_ms = state.last_attempt_ms.replace(now_ms);
        state.attempt_count = state.attempt_count.saturating_add(1);
        drop(state);
        Some(guard)
    }

    /// Runs one guarded, rate-limited attempt to completion.
    ///
    /// Returns [`super::AttemptOutcome::Skipped`] when the attempt may not start
    /// (see [`try_begin_attempt`](Self::try_begin_attempt)).
    pub async fn attempt(
        self: &Arc<Self>,
        transport: &dyn Transport,
        cancel: &CancellationToken,
        min_interval: Duration,
    ) -> super::AttemptOutcome {
        match self.try_begin_attempt(min_interval) {
            Some(guard) => super::attempt::run(guard, transport, cancel).await,
            None => super::AttemptOutcome::Skipped,
        }
    }

    /// Issues a metadata request and applies what it reveals.
    ///
    /// Sets the total length (when sent) and the resumable flag, and
    /// captures a `Content-Disposition` filename unless one is already
    /// known.
    ///
    /// # Errors
    ///
    /// Propagates transport errors, including an unparsable length.
    pub async fn probe(&self, transport: &dyn Transport) -> Result<ResponseMeta, DownloadError> {
        let meta = transport.probe(&self.url).await?;
        let mut state = self.lock_state();
        if let Some(length) = meta.content_length {
            state.total_bytes = Some(length);
        }
        state.resumable = meta.is_resumable();
        state.filename_guesses.capture_header_guess(meta.filename_hint());
        drop(state);
        Ok(meta)
    }

    /// Recomputes percent and smoothed throughput, at most once per snap interval.
    ///
    /// Always returns the current progress, refreshed or not.
    pub fn snap(&self) -> ProgressUpdate {
        self.snap_at(Instant::now())
    }

    pub(crate) fn snap_at(&self, now: Instant) -> ProgressUpdate {
        let downloaded = self.downloaded_bytes();
        let mut state = self.lock_state();
        let total = state.total_bytes;
        if !state.complete
            && let Some(sample) = state.throughput.snap(now, downloaded, total)
        {
            state.percent = sample.percent;
            state.bytes_per_second = sample.average_bps;
        }
        ProgressUpdate {
            url: self.url.clone(),
            downloaded,
            total,
            bytes_per_second: state.bytes_per_second,
            percent: state.percent,
        }
    }

    /// Current progress without taking a new sample.
    #[must_use]
    pub fn progress(&self) -> ProgressUpdate {
        let state = self.lock_state();
        ProgressUpdate {
            url: self.url.clone(),
            downloaded: self.downloaded_bytes(),
            total: state.total_bytes,
            bytes_per_second: state.bytes_per_second,
            percent: state.percent,
        }
    }

    /// Removes the temp file. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] for any other filesystem failure.
    pub fn remove_temp_file(&self) -> Result<(), DownloadError> {
        match std::fs::remove_file(&self.temp_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::io(&self.temp_file, e)),
        }
    }

    // ==================== Attempt-side mutation ====================

    pub(crate) fn set_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Counts bytes accepted by the temp-file writer and opportunistically
    /// refreshes the throughput window.
    ///
    /// Never blocks: if the scheduler holds the record lock the sample is
    /// simply skipped.
    pub(crate) fn on_bytes_written(&self, bytes: usize) {
        let downloaded = self
            .downloaded_bytes
            .fetch_add(bytes as u64, Ordering::SeqCst)
            .saturating_add(bytes as u64);
        if let Ok(mut state) = self.state.try_lock() {
            let total = state.total_bytes;
            if let Some(sample) = state.throughput.snap(Instant::now(), downloaded, total) {
                state.percent = sample.percent;
                state.bytes_per_second = sample.average_bps;
            }
        }
    }

    pub(crate) fn begin_measurement(&self, offset: u64) {
        self.set_downloaded(offset);
        self.lock_state().throughput.reset(Instant::now(), offset);
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.lock_state().total_bytes = Some(total);
    }

    pub(crate) fn set_resumable(&self, resumable: bool) {
        self.lock_state().resumable = resumable;
    }

    pub(crate) fn capture_filename_hint(&self, hint: Option<String>) {
        self.lock_state()
            .filename_guesses
            .capture_header_guess(hint);
    }

    pub(crate) fn mark_complete(&self) {
        let downloaded = self.downloaded_bytes();
        let mut state = self.lock_state();
        if state.total_bytes.is_none() {
            state.total_bytes = Some(downloaded);
        }
        state.complete = true;
        state.percent = 100.0;
        state.bytes_per_second = 0;
        state.last_error = None;
    }

    pub(crate) fn record_failure(&self, error: &DownloadError) {
        let mut state = self.lock_state();
        state.last_error = Some(error.to_string());
        state.bytes_per_second = 0;
    }

    // ==================== Supervised task slot ====================

    pub(crate) fn attach_task(&self, task: AttemptTask) {
        *self.lock_task() = Some(task);
    }

    /// Detaches the supervised attempt, if any, so it can be cancelled and awaited
    /// outside the registry lock.
    pub(crate) fn take_task(&self) -> Option<AttemptTask> {
        self.lock_task().take()
    }

    fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<AttemptTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Canonical registry key for a user-supplied URL.
///
/// Every command that looks a record up by URL goes through this, so
/// `https://Example.test` and `https://example.test/` name the same record.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidUrl`] for malformed or non-HTTP URLs.
pub fn normalize_url(url: &str) -> Result<String, DownloadError> {
    parse_download_url(url).map(String::from)
}

fn parse_download_url(url: &str) -> Result<Url, DownloadError> {
    let trimmed = url.trim();
    let parsed = Url::parse(trimmed).map_err(|_| DownloadError::invalid_url(trimmed))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(DownloadError::invalid_url(trimmed));
    }
    Ok(parsed)
}

/// Milliseconds since the Unix epoch, 0 for pre-epoch clocks.
pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
