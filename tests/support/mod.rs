//! Shared helpers for integration tests.
//!
//! [`ScriptedTransport`] serves one in-memory file and can be told to cut
//! or stall individual responses, which is how interrupted transfers are
//! simulated without a network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use downloader_engine::{
    DownloadError, Event, EventSink, FetchResponse, ResponseMeta, Transport,
};
use futures_util::StreamExt;
use futures_util::stream;

/// Size of the chunks bodies are split into.
pub const CHUNK: usize = 100;

/// What the next fetch does after sending its first bytes.
#[derive(Debug, Clone, Copy)]
pub enum Body {
    /// Send everything.
    Full,
    /// Send this many bytes, then fail with a stream error.
    Cut(usize),
    /// Send this many bytes, then never finish.
    Stall(usize),
}

/// In-memory server for a single file.
#[derive(Debug)]
pub struct ScriptedTransport {
    content: Vec<u8>,
    accept_ranges: bool,
    honor_range: bool,
    known_length: bool,
    scripts: Mutex<VecDeque<Body>>,
    fetches: Mutex<Vec<Option<u64>>>,
    probes: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(content: Vec<u8>, accept_ranges: bool) -> Self {
        Self {
            content,
            accept_ranges,
            honor_range: accept_ranges,
            known_length: true,
            scripts: Mutex::new(VecDeque::new()),
            fetches: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
        }
    }

    /// Advertises ranges but answers every GET with the whole file.
    pub fn ignoring_ranges(mut self) -> Self {
        self.honor_range = false;
        self
    }

    /// Never sends a length header.
    pub fn without_length(mut self) -> Self {
        self.known_length = false;
        self
    }

    /// Queues the behavior of the next unscripted fetch.
    pub fn then(self, body: Body) -> Self {
        self.scripts.lock().unwrap().push_back(body);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Offsets of every fetch so far, `None` for a non-ranged request.
    pub fn fetch_offsets(&self) -> Vec<Option<u64>> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn probe(&self, _url: &str) -> Result<ResponseMeta, DownloadError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(ResponseMeta {
            status: 200,
            content_length: self.known_length.then_some(self.content.len() as u64),
            accept_ranges: Some(if self.accept_ranges { "bytes" } else { "none" }.to_string()),
            content_disposition: None,
        })
    }

    async fn fetch(&self, url: &str, offset: Option<u64>) -> Result<FetchResponse, DownloadError> {
        self.fetches.lock().unwrap().push(offset);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Body::Full);

        let ranged = offset.is_some() && self.honor_range;
        let start = if ranged { offset.unwrap_or(0) as usize } else { 0 };
        let slice = self.content[start.min(self.content.len())..].to_vec();
        let meta = ResponseMeta {
            status: if ranged { 206 } else { 200 },
            content_length: self.known_length.then_some(slice.len() as u64),
            accept_ranges: None,
            content_disposition: None,
        };

        let sent = match script {
            Body::Full => slice.len(),
            Body::Cut(n) | Body::Stall(n) => n.min(slice.len()),
        };
        let chunks: Vec<Result<Bytes, DownloadError>> = slice[..sent]
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let head = stream::iter(chunks);
        let body = match script {
            Body::Full => head.boxed(),
            Body::Cut(_) => {
                let err = DownloadError::stream(url, "connection reset by peer");
                head.chain(stream::once(async move { Err(err) })).boxed()
            }
            Body::Stall(_) => head.chain(stream::pending()).boxed(),
        };
        Ok(FetchResponse { meta, body })
    }
}

/// Sink that keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// Deterministic file content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Polls `condition` every 10 ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
