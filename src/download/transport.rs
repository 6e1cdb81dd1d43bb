//! The network seam used by download attempts.
//!
//! Attempts only talk to a [`Transport`]; [`super::HttpClient`] is the real
//! implementation, and tests plug in scripted ones to simulate interrupted
//! or non-resumable servers.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use super::DownloadError;
use super::filename::filename_from_disposition;

/// Response body as a stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// Header metadata of a probe or fetch response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// HTTP status code.
    pub status: u16,
    /// Parsed `Content-Length`, if the server sent one.
    pub content_length: Option<u64>,
    /// Raw `Accept-Ranges` value.
    pub accept_ranges: Option<String>,
    /// Raw `Content-Disposition` value.
    pub content_disposition: Option<String>,
}

impl ResponseMeta {
    /// True only when the server explicitly advertises `Accept-Ranges: bytes`.
    ///
    /// A missing header, `none`, or any other unit means the transfer must
    /// restart from zero.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.accept_ranges
            .as_deref()
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes"))
    }

    /// Filename suggested by `Content-Disposition`, sanitized.
    #[must_use]
    pub fn filename_hint(&self) -> Option<String> {
        self.content_disposition
            .as_deref()
            .and_then(filename_from_disposition)
    }

    /// True for `206 Partial Content`.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }
}

/// An opened GET response: headers plus the body stream.
pub struct FetchResponse {
    /// Response headers.
    pub meta: ResponseMeta,
    /// Response body.
    pub body: ByteStream,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Source of download bytes.
///
/// Implementations must map non-2xx responses to
/// [`DownloadError::HttpStatus`]; attempts treat every returned
/// [`FetchResponse`] as a success status.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Issues a metadata-only request (HEAD) for `url`.
    async fn probe(&self, url: &str) -> Result<ResponseMeta, DownloadError>;

    /// Opens a GET for `url`, starting at byte `offset` when given.
    async fn fetch(&self, url: &str, offset: Option<u64>) -> Result<FetchResponse, DownloadError>;
}
