//! Error types for the registry store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while mutating or persisting the registry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with the same URL is already registered.
    #[error("duplicate URL: {url} is already in the registry")]
    DuplicateUrl {
        /// The rejected URL.
        url: String,
    },

    /// Reading or writing the registry document failed.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The document (or staging file) path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The registry could not be encoded as JSON.
    #[error("failed to encode registry for {path}: {source}")]
    Serialize {
        /// The document path.
        path: PathBuf,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Creates a duplicate URL error.
    pub fn duplicate(url: impl Into<String>) -> Self {
        Self::DuplicateUrl { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
