//! Resumable download engine.
//!
//! This library keeps a persistent registry of HTTP downloads, streams each
//! one to a temporary file and retries interrupted transfers automatically,
//! resuming with a `Range` request when the server allows it.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - Per-URL records, the attempt state machine and the HTTP transport
//! - [`store`] - The lock-guarded registry and its JSON checkpoint on disk
//! - [`scheduler`] - The polling loop that launches attempts and triggers saves
//! - [`events`] - Ordered, bounded outbound notifications for a front end
//! - [`manager`] - The command facade (`add`, `pause`, `delete`, `save_as`)
//! - [`config`] - Engine timings, capacities and paths
//!
//! # Locking
//!
//! Two lock levels exist: the registry lock owned by [`store::PersistentStore`]
//! and the per-record locks inside [`download::DownloadRecord`]. The registry
//! lock is always acquired first. Attempt tasks never take the registry lock,
//! and byte counters are atomics so the hot write path takes no lock at all.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod events;
pub mod manager;
pub mod scheduler;
pub mod store;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use download::{
    AttemptOutcome, DownloadError, DownloadRecord, FetchResponse, FilenameGuesses, HttpClient,
    ProgressUpdate, RecordSnapshot, ResponseMeta, Transport, normalize_url,
};
pub use events::{Event, EventBusError, EventForwarder, EventPublisher, EventSink, TracingSink};
pub use manager::{DownloadManager, EngineError};
pub use scheduler::{Scheduler, TickReport};
pub use store::{PersistentStore, StoreError};
