//! Error types for the download module.
//!
//! Every variant carries the URL or path it concerns so that a failure stored
//! on a record (`lastError`) still reads correctly out of context.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while probing or streaming a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The response body ended abnormally mid-transfer.
    #[error("transfer of {url} interrupted: {reason}")]
    Stream {
        /// The URL being streamed.
        url: String,
        /// What the transport reported.
        reason: String,
    },

    /// The server sent a length header that is not a byte count.
    #[error("invalid Content-Length '{value}' from {url}")]
    InvalidContentLength {
        /// The URL that was probed.
        url: String,
        /// The raw header value.
        value: String,
    },

    /// File system error on the temp file (create, append, truncate, etc.)
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or not HTTP(S).
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    ///
    /// Timeouts are promoted to [`DownloadError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a mid-stream interruption error.
    pub fn stream(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Stream {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an invalid length error.
    pub fn invalid_content_length(url: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidContentLength {
            url: url.into(),
            value: value.into(),
        }
    }

    /// Returns true for failures that the next scheduler tick may cure.
    ///
    /// Filesystem and input errors need outside intervention; everything
    /// that came off the wire is transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Io { .. } | Self::InvalidUrl { .. })
    }
}

// Note: no `From<reqwest::Error>` / `From<std::io::Error>` impls. Every variant
// needs a url or path the source error does not carry, so callers go through
// the helper constructors above.
