//! The command facade a front end talks to.
//!
//! [`DownloadManager`] wires the owned pieces together (store, scheduler,
//! event bus) and implements the inbound commands. There is no global
//! state: every component is constructed here and passed by reference.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::download::{DownloadError, DownloadRecord, RecordSnapshot, Transport, normalize_url};
use crate::events::{self, Event, EventBusError, EventPublisher, EventSink};
use crate::scheduler::{Scheduler, TickReport};
use crate::store::{PersistentStore, StoreError};

/// Errors returned by manager commands.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Creating the record failed (bad URL, temp file not creatable).
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The registry rejected the change or could not be saved.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The event forwarder is gone.
    #[error(transparent)]
    EventBus(#[from] EventBusError),

    /// No record has this URL.
    #[error("no download registered for {url}")]
    NotFound {
        /// The requested URL.
        url: String,
    },

    /// The record has not received every byte yet.
    #[error("download of {url} is not complete")]
    NotComplete {
        /// The requested URL.
        url: String,
    },

    /// Moving the finished file to its destination failed.
    #[error("failed to save download to {path}: {source}")]
    SaveAs {
        /// The destination path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Owns a running engine instance.
#[derive(Debug)]
pub struct DownloadManager {
    store: Arc<PersistentStore>,
    scheduler: Arc<Scheduler>,
    events: EventPublisher,
    forwarder: JoinHandle<u64>,
}

impl DownloadManager {
    /// Loads the registry and spawns the event forwarder.
    ///
    /// The scheduler is created but not started; call
    /// [`start`](Self::start). Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if `config` fails validation.
    #[instrument(skip_all, fields(state_dir = %config.state_dir.display()))]
    pub fn open(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let store = Arc::new(PersistentStore::load(&config));
        let (publisher, forwarder) = events::channel(&config);
        let forwarder = forwarder.spawn(sink);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            transport,
            publisher.clone(),
            config,
        ));
        Ok(Self {
            store,
            scheduler,
            events: publisher,
            forwarder,
        })
    }

    /// Starts the scheduler loop. Repeated calls are no-ops returning false.
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    /// Registers a URL for download.
    ///
    /// The temp file is created immediately so that filesystem problems are
    /// reported here rather than on the first attempt.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Download`] for a malformed URL or an uncreatable temp file
    /// - [`EngineError::Store`] with [`StoreError::DuplicateUrl`] if already registered
    #[instrument(skip(self))]
    pub async fn add(&self, url: &str) -> Result<RecordSnapshot, EngineError> {
        let record = DownloadRecord::new(url, self.store.config())?;
        let record = self.store.add(record)?;
        info!(url = %record.url(), "download added");
        let snapshot = record.snapshot();
        self.notify_registry_changed().await;
        Ok(snapshot)
    }

    /// Pauses or resumes a record.
    ///
    /// Pausing cancels the running attempt and waits for it to exit before
    /// returning. Returns false for an unknown URL.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Download`] if `url` is not a valid HTTP(S)
    /// URL. A failed save is logged and retried by the scheduler.
    #[instrument(skip(self))]
    pub async fn pause(&self, url: &str, paused: bool) -> Result<bool, EngineError> {
        let url = normalize_url(url)?;
        let task = {
            let registry = self.store.registry();
            let Some(record) = registry.iter().find(|r| r.url() == url) else {
                debug!("pause of unknown URL ignored");
                return Ok(false);
            };
            record.set_paused(paused);
            if paused { record.take_task() } else { None }
        };
        if let Some(task) = task {
            task.cancel_and_wait().await;
            debug!("in-flight attempt cancelled");
        }
        info!(paused, "pause state changed");
        self.scheduler.persist();
        self.notify_registry_changed().await;
        Ok(true)
    }

    /// Deletes a record and its temp file.
    ///
    /// `confirmed` carries the user's out-of-band confirmation; without it
    /// nothing happens. Returns true when a record was deleted.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Download`] if `url` is not a valid HTTP(S) URL
    /// - [`EngineError::Store`] if the registry cannot be saved
    #[instrument(skip(self))]
    pub async fn delete(&self, url: &str, confirmed: bool) -> Result<bool, EngineError> {
        let url = normalize_url(url)?;
        if !confirmed {
            info!("delete not confirmed, ignoring");
            return Ok(false);
        }
        let deleted = self.store.delete(&url).await?;
        if deleted {
            self.notify_registry_changed().await;
        }
        Ok(deleted)
    }

    /// Moves a completed download to `destination` and drops its record.
    ///
    /// If `destination` is an existing directory the file is placed inside
    /// it under the record's preferred filename guess. The move is a rename
    /// when possible and a copy-then-remove across filesystems. If the move
    /// fails the registry and temp file are left as they were. Once the file
    /// is moved the record is dropped; a failed save at that point is logged
    /// and left to the next persist tick.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Download`] if `url` is not a valid HTTP(S) URL
    /// - [`EngineError::NotFound`] for an unknown URL
    /// - [`EngineError::NotComplete`] if bytes are still missing
    /// - [`EngineError::SaveAs`] if the file cannot be moved
    #[instrument(skip(self, destination), fields(destination = %destination.as_ref().display()))]
    pub async fn save_as(
        &self,
        url: &str,
        destination: impl AsRef<Path>,
    ) -> Result<PathBuf, EngineError> {
        let url = normalize_url(url)?;
        let record = self
            .store
            .get(&url)
            .ok_or_else(|| EngineError::NotFound { url: url.clone() })?;
        if !record.is_complete() {
            return Err(EngineError::NotComplete { url });
        }

        let mut target = destination.as_ref().to_path_buf();
        if target.is_dir() {
            let guesses = record.filename_guesses();
            let name = guesses.preferred().unwrap_or("download");
            target.push(name);
        }
        move_file(record.temp_file(), &target).map_err(|source| EngineError::SaveAs {
            path: target.clone(),
            source,
        })?;

        if let Err(error) = self.store.remove(&url) {
            warn!(error = %error, "registry save after save-as failed, will retry");
        }
        info!(path = %target.display(), "download saved");
        self.notify_registry_changed().await;
        Ok(target)
    }

    /// Snapshots every record in registry order.
    #[must_use]
    pub fn records(&self) -> Vec<RecordSnapshot> {
        self.store.snapshot()
    }

    /// Snapshot of one record. An unparsable URL matches nothing.
    #[must_use]
    pub fn record(&self, url: &str) -> Option<RecordSnapshot> {
        let url = normalize_url(url).ok()?;
        self.store.get(&url).map(|r| r.snapshot())
    }

    /// True while some record is neither paused nor complete.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.store.registry().iter().any(|r| r.is_eligible())
    }

    /// Runs one scheduler sweep immediately.
    pub async fn tick(&self) -> TickReport {
        self.scheduler.tick().await
    }

    /// Waits for the attempts launched so far to finish.
    pub async fn join_attempts(&self) {
        self.scheduler.join_attempts().await;
    }

    /// Saves the registry now.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if encoding or writing fails.
    pub fn save(&self) -> Result<(), EngineError> {
        Ok(self.store.save()?)
    }

    /// Times a producer waited on a full event queue.
    #[must_use]
    pub fn event_stalls(&self) -> u64 {
        self.events.stalls()
    }

    /// Stops the scheduler, cancels attempts, saves, and drains the event
    /// queue. Returns the number of events forwarded over the lifetime of
    /// the manager.
    #[instrument(skip(self))]
    pub async fn shutdown(self) -> u64 {
        let Self {
            store,
            scheduler,
            events,
            forwarder,
        } = self;
        scheduler.stop().await;
        drop(scheduler);
        drop(events);
        drop(store);
        match forwarder.await {
            Ok(forwarded) => forwarded,
            Err(error) => {
                warn!(error = %error, "event forwarder panicked");
                0
            }
        }
    }

    async fn notify_registry_changed(&self) {
        let records = self.store.snapshot();
        if self.events.publish(Event::RegistryChanged(records)).await.is_err() {
            debug!("event bus closed, dropping registry snapshot");
        }
    }
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!("rename across filesystems, copying instead");
            if let Err(copy_error) = std::fs::copy(from, to) {
                let _ = std::fs::remove_file(to);
                return Err(copy_error);
            }
            std::fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::download::{FetchResponse, ResponseMeta};
    use crate::events::TracingSink;

    #[derive(Debug)]
    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn probe(&self, url: &str) -> Result<ResponseMeta, DownloadError> {
            Err(DownloadError::stream(url, "offline"))
        }

        async fn fetch(&self, url: &str, _: Option<u64>) -> Result<FetchResponse, DownloadError> {
            Err(DownloadError::stream(url, "offline"))
        }
    }

    fn manager(dir: &TempDir) -> DownloadManager {
        DownloadManager::open(
            EngineConfig::new(dir.path()),
            Arc::new(Offline),
            Arc::new(TracingSink),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.throughput_window = 0;
        let err = DownloadManager::open(config, Arc::new(Offline), Arc::new(TracingSink)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_add_duplicate_and_malformed_urls() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        mgr.add("https://example.test/f.bin").await.unwrap();
        let dup = mgr.add("https://example.test/f.bin").await.unwrap_err();
        assert!(matches!(dup, EngineError::Store(StoreError::DuplicateUrl { .. })));
        let bad = mgr.add("nope").await.unwrap_err();
        assert!(matches!(bad, EngineError::Download(DownloadError::InvalidUrl { .. })));
        assert_eq!(mgr.records().len(), 1);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_unknown_url_returns_false() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        assert!(!mgr.pause("https://example.test/none", true).await.unwrap());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_unconfirmed_delete_is_noop() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let snap = mgr.add("https://example.test/f.bin").await.unwrap();

        assert!(!mgr.delete(&snap.url, false).await.unwrap());
        assert_eq!(mgr.records().len(), 1);
        assert!(snap.temp_file_path.exists());

        assert!(mgr.delete(&snap.url, true).await.unwrap());
        assert!(mgr.records().is_empty());
        assert!(!snap.temp_file_path.exists());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_save_as_requires_complete_record() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let snap = mgr.add("https://example.test/f.bin").await.unwrap();

        let err = mgr.save_as(&snap.url, dir.path().join("out.bin")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotComplete { .. }));
        assert_eq!(mgr.records().len(), 1);

        let err = mgr
            .save_as("https://example.test/none", dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_save_as_moves_file_and_drops_record() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let snap = mgr.add("https://example.test/f.bin").await.unwrap();
        std::fs::write(&snap.temp_file_path, b"payload").unwrap();
        let record = mgr.store.get(&snap.url).unwrap();
        record.set_downloaded(7);
        record.mark_complete();

        let out_dir = TempDir::new().unwrap();
        let saved = mgr.save_as(&snap.url, out_dir.path()).await.unwrap();
        assert_eq!(saved, out_dir.path().join("f.bin"));
        assert_eq!(std::fs::read(&saved).unwrap(), b"payload");
        assert!(!snap.temp_file_path.exists());
        assert!(mgr.records().is_empty());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_accept_the_url_as_added() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let raw = "https://Example.test";
        let snap = mgr.add(raw).await.unwrap();
        assert_eq!(snap.url, "https://example.test/");

        assert!(mgr.record(raw).is_some());
        assert!(mgr.pause(raw, true).await.unwrap());
        assert!(mgr.record(raw).unwrap().paused);
        assert!(mgr.pause(raw, false).await.unwrap());

        let err = mgr.save_as(raw, dir.path().join("out")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotComplete { .. }));

        assert!(mgr.delete(raw, true).await.unwrap());
        assert!(mgr.records().is_empty());
        assert!(!snap.temp_file_path.exists());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_save_as_with_url_as_added() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let raw = "HTTPS://Example.test/Report.pdf";
        let snap = mgr.add(raw).await.unwrap();
        std::fs::write(&snap.temp_file_path, b"pdf").unwrap();
        let record = mgr.store.get(&snap.url).unwrap();
        record.set_downloaded(3);
        record.mark_complete();

        let target = dir.path().join("report.pdf");
        assert_eq!(mgr.save_as(raw, &target).await.unwrap(), target);
        assert_eq!(std::fs::read(&target).unwrap(), b"pdf");
        assert!(mgr.records().is_empty());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_reject_malformed_urls() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let err = mgr.pause("not a url", true).await.unwrap_err();
        assert!(matches!(err, EngineError::Download(DownloadError::InvalidUrl { .. })));
        let err = mgr.delete("ftp://example.test/f", true).await.unwrap_err();
        assert!(matches!(err, EngineError::Download(DownloadError::InvalidUrl { .. })));
        let err = mgr.save_as("nope", dir.path()).await.unwrap_err();
        assert!(matches!(err, EngineError::Download(DownloadError::InvalidUrl { .. })));
        assert!(mgr.record("nope").is_none());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_save_as_succeeds_when_only_the_registry_save_fails() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let snap = mgr.add("https://example.test/f.bin").await.unwrap();
        std::fs::write(&snap.temp_file_path, b"payload").unwrap();
        let record = mgr.store.get(&snap.url).unwrap();
        record.set_downloaded(7);
        record.mark_complete();

        // A directory where the staging file goes makes every save fail
        std::fs::create_dir(dir.path().join("state.json.partial")).unwrap();

        let target = dir.path().join("kept.bin");
        assert_eq!(mgr.save_as(&snap.url, &target).await.unwrap(), target);
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
        assert!(mgr.records().is_empty());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_save_as_failure_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let snap = mgr.add("https://example.test/f.bin").await.unwrap();
        let record = mgr.store.get(&snap.url).unwrap();
        record.mark_complete();

        let missing_parent = dir.path().join("no").join("such").join("dir").join("f.bin");
        let err = mgr.save_as(&snap.url, &missing_parent).await.unwrap_err();
        assert!(matches!(err, EngineError::SaveAs { .. }));
        assert_eq!(mgr.records().len(), 1);
        assert!(snap.temp_file_path.exists());
        mgr.shutdown().await;
    }
}
