//! The registry: an insertion-ordered, URL-unique list of download records.
//!
//! [`PersistentStore`] owns the registry lock. Every structural change
//! (add, delete, remove) and every save happens while it is held, so the
//! on-disk document always reflects a consistent snapshot.

mod document;
mod error;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::download::{DownloadRecord, RecordSnapshot};

pub use error::StoreError;

/// Exclusive access to the ordered record list.
pub type Registry<'a> = MutexGuard<'a, Vec<Arc<DownloadRecord>>>;

/// Lock-guarded registry with a JSON checkpoint on disk.
#[derive(Debug)]
pub struct PersistentStore {
    config: EngineConfig,
    records: Mutex<Vec<Arc<DownloadRecord>>>,
}

impl PersistentStore {
    /// Reconstructs the registry from the state document.
    ///
    /// Startup never fails on bad state: a missing, blank, corrupt or
    /// unreadable document yields an empty registry, which is persisted
    /// right away. Records whose URL was already seen are dropped. For
    /// incomplete records the byte counter is re-synced with the temp file
    /// actually on disk.
    #[instrument(skip(config), fields(path = %config.state_file().display()))]
    pub fn load(config: &EngineConfig) -> Self {
        let path = config.state_file();
        let loaded = match document::read(&path) {
            Ok(loaded) => loaded,
            Err(error) => {
                warn!(error = %error, "could not read registry document, starting empty");
                document::Loaded::Missing
            }
        };

        let store = Self {
            config: config.clone(),
            records: Mutex::new(Vec::new()),
        };
        match loaded {
            document::Loaded::Records(snapshots) => {
                let mut records: Vec<Arc<DownloadRecord>> = Vec::with_capacity(snapshots.len());
                for snapshot in snapshots {
                    if records.iter().any(|r| r.url() == snapshot.url) {
                        warn!(url = %snapshot.url, "dropping duplicate record from registry document");
                        continue;
                    }
                    let record = DownloadRecord::from_snapshot(snapshot, config);
                    resync_with_disk(&record);
                    records.push(Arc::new(record));
                }
                info!(records = records.len(), "registry loaded");
                *store.registry() = records;
            }
            document::Loaded::Missing | document::Loaded::Corrupt => {
                info!("initializing empty registry");
                if let Err(error) = store.save() {
                    warn!(error = %error, "could not persist empty registry");
                }
            }
        }
        store
    }

    /// Takes the registry lock.
    ///
    /// The registry lock must be acquired before any per-record lock and
    /// must not be held across an `.await`.
    pub fn registry(&self) -> Registry<'_> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration the store was loaded with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Appends a record and persists the registry.
    ///
    /// A failed save after the append is logged and left to the next
    /// periodic save; the record stays registered.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateUrl`] if the URL is already
    /// registered. The registry is unchanged in that case.
    #[instrument(skip(self, record), fields(url = %record.url()))]
    pub fn add(&self, record: DownloadRecord) -> Result<Arc<DownloadRecord>, StoreError> {
        let mut registry = self.registry();
        if registry.iter().any(|r| r.url() == record.url()) {
            return Err(StoreError::duplicate(record.url()));
        }
        let record = Arc::new(record);
        registry.push(Arc::clone(&record));
        if let Err(error) = self.save_locked(&registry) {
            warn!(error = %error, "registry save after add failed");
        }
        debug!(records = registry.len(), "record added");
        Ok(record)
    }

    /// Deletes a record: cancels its attempt, drops it from the registry,
    /// persists, and removes its temp file.
    ///
    /// The attempt is awaited to completion before the temp file is
    /// removed, so no write can recreate it. Returns false (a no-op) for an
    /// unknown URL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the registry cannot be saved. The record is
    /// already removed from memory at that point.
    #[instrument(skip(self))]
    pub async fn delete(&self, url: &str) -> Result<bool, StoreError> {
        let (record, task, saved) = {
            let mut registry = self.registry();
            let Some(index) = registry.iter().position(|r| r.url() == url) else {
                debug!("delete of unknown URL ignored");
                return Ok(false);
            };
            let record = registry.remove(index);
            let task = record.take_task();
            let saved = self.save_locked(&registry);
            (record, task, saved)
        };

        if let Some(task) = task {
            task.cancel_and_wait().await;
        }
        if self.config.owns_path(record.temp_file()) {
            if let Err(error) = record.remove_temp_file() {
                warn!(error = %error, "could not remove temp file");
            }
        } else {
            warn!(path = %record.temp_file().display(), "temp file outside state dir left in place");
        }
        info!("record deleted");
        saved.map(|()| true)
    }

    /// Removes a record from the registry and persists, without touching
    /// its temp file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the registry cannot be saved. The record is
    /// already removed from memory at that point.
    pub fn remove(&self, url: &str) -> Result<Option<Arc<DownloadRecord>>, StoreError> {
        let mut registry = self.registry();
        let Some(index) = registry.iter().position(|r| r.url() == url) else {
            return Ok(None);
        };
        let record = registry.remove(index);
        self.save_locked(&registry)?;
        Ok(Some(record))
    }

    /// Serializes the registry to the state document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding or writing fails.
    pub fn save(&self) -> Result<(), StoreError> {
        let registry = self.registry();
        self.save_locked(&registry)
    }

    /// Saves while the caller already holds the registry lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding or writing fails.
    pub fn save_locked(&self, registry: &Registry<'_>) -> Result<(), StoreError> {
        let snapshots = registry.iter().map(|r| r.snapshot()).collect();
        document::write(&self.config.state_file(), snapshots)
    }

    /// Snapshots every record in registry order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        self.registry().iter().map(|r| r.snapshot()).collect()
    }

    /// Looks a record up by its canonical URL
    /// (see [`normalize_url`](crate::download::normalize_url)).
    #[must_use]
    pub fn get(&self, url: &str) -> Option<Arc<DownloadRecord>> {
        self.registry().iter().find(|r| r.url() == url).cloned()
    }

    /// Number of registered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    /// True when no record is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }
}

fn resync_with_disk(record: &DownloadRecord) {
    if record.is_complete() {
        return;
    }
    let on_disk = std::fs::metadata(record.temp_file()).map_or(0, |m| m.len());
    if on_disk != record.downloaded_bytes() {
        debug!(
            url = %record.url(),
            recorded = record.downloaded_bytes(),
            on_disk,
            "re-syncing byte counter with temp file"
        );
        record.set_downloaded(on_disk);
    }
}
