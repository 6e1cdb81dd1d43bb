//! Per-URL download records and the attempt state machine.
//!
//! This module owns everything that happens to a single URL:
//!
//! - [`DownloadRecord`] holds the persisted metadata plus lock-free byte
//!   counters for the in-flight write path
//! - an attempt probes the server, chooses between a ranged resume and a
//!   restart from zero, and streams the body into the record's temp file
//! - [`HttpClient`] is the `reqwest` implementation of the [`Transport`]
//!   seam attempts talk to
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use downloader_engine::{DownloadRecord, EngineConfig, HttpClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::new("/tmp/downloader-state");
//! let record = Arc::new(DownloadRecord::new("https://example.com/big.iso", &config)?);
//! let client = HttpClient::new()?;
//! let outcome = record
//!     .attempt(&client, &CancellationToken::new(), Duration::ZERO)
//!     .await;
//! println!("{outcome:?}: {} bytes", record.downloaded_bytes());
//! # Ok(())
//! # }
//! ```

mod attempt;
mod client;
mod error;
pub mod filename;
mod progress;
mod record;
mod transport;

pub use attempt::AttemptOutcome;
pub(crate) use attempt::run as run_attempt;
pub use client::HttpClient;
pub use error::DownloadError;
pub use filename::FilenameGuesses;
pub use progress::{ProgressWriter, ThroughputSample, ThroughputWindow, percent_of};
pub use record::{AttemptGuard, DownloadRecord, ProgressUpdate, RecordSnapshot, normalize_url};
pub(crate) use record::AttemptTask;
pub use transport::{ByteStream, FetchResponse, ResponseMeta, Transport};

// Note: no module-local Result alias.
// Use `Result<T, DownloadError>` explicitly in function signatures.
