//! HTTP transport backed by `reqwest`.
//!
//! This module provides the `HttpClient` struct which issues the probe (HEAD)
//! and ranged GET requests for download attempts, with timeout configuration
//! and context-rich error mapping.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, HeaderMap, RANGE};
use reqwest::{Client, Method};
use tracing::{debug, instrument};
use url::Url;

use super::DownloadError;
use super::transport::{FetchResponse, ResponseMeta, Transport};
use crate::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use crate::user_agent;

/// HTTP client for probing and streaming downloads.
///
/// This client is designed to be created once and shared by every attempt,
/// taking advantage of connection pooling.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 5 minutes between body reads
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Network`] if the TLS backend or system
    /// configuration prevents building a client.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }

    /// Creates a new HTTP client with explicit timeout values.
    ///
    /// The read timeout bounds the gap between two body reads rather than the
    /// whole transfer, so large files are not cut off.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Network`] if the client fails to build.
    #[instrument(level = "debug")]
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(user_agent::default_download_user_agent())
            .build()
            .map_err(|e| DownloadError::network("<client>", e))?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        offset: Option<u64>,
    ) -> Result<reqwest::Response, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let mut request = self.client.request(method, parsed);
        if let Some(offset) = offset {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        if !response.status().is_success() {
            return Err(DownloadError::http_status(url, response.status().as_u16()));
        }
        Ok(response)
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for HttpClient {
    #[instrument(skip(self), fields(url = %url))]
    async fn probe(&self, url: &str) -> Result<ResponseMeta, DownloadError> {
        let response = self.send(Method::HEAD, url, None).await?;
        let meta = response_meta(url, response.status().as_u16(), response.headers())?;
        debug!(
            status = meta.status,
            content_length = ?meta.content_length,
            resumable = meta.is_resumable(),
            "probe complete"
        );
        Ok(meta)
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &str, offset: Option<u64>) -> Result<FetchResponse, DownloadError> {
        let response = self.send(Method::GET, url, offset).await?;
        let meta = response_meta(url, response.status().as_u16(), response.headers())?;
        debug!(status = meta.status, content_length = ?meta.content_length, "fetch opened");

        let body_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| DownloadError::network(body_url.clone(), e)))
            .boxed();
        Ok(FetchResponse { meta, body })
    }
}

/// Extracts the headers the engine cares about.
///
/// A `Content-Length` that is present but not a byte count is an error;
/// an absent one leaves the length unknown.
fn response_meta(url: &str, status: u16, headers: &HeaderMap) -> Result<ResponseMeta, DownloadError> {
    let header_str = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let content_length = match headers.get(CONTENT_LENGTH) {
        None => None,
        Some(raw) => {
            let text = raw.to_str().unwrap_or_default().trim();
            Some(
                text.parse::<u64>()
                    .map_err(|_| DownloadError::invalid_content_length(url, text))?,
            )
        }
    };

    Ok(ResponseMeta {
        status,
        content_length,
        accept_ranges: header_str(ACCEPT_RANGES),
        content_disposition: header_str(CONTENT_DISPOSITION),
    })
}
