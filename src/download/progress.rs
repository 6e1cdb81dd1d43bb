//! Byte accounting for in-flight downloads.
//!
//! [`ProgressWriter`] wraps the temp-file writer and reports every accepted
//! chunk to a callback. [`ThroughputWindow`] turns the raw byte counter into
//! a percent and a smoothed bytes-per-second figure.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::AsyncWrite;

/// Writer decorator that forwards bytes and reports how many were accepted.
///
/// The callback runs once per successful `poll_write` with the number of
/// bytes the inner writer took, so the running total always matches what
/// was handed to the destination.
#[derive(Debug)]
pub struct ProgressWriter<W, F> {
    inner: W,
    on_write: F,
}

impl<W, F> ProgressWriter<W, F>
where
    W: AsyncWrite + Unpin,
    F: FnMut(usize) + Unpin,
{
    /// Wraps `inner`, calling `on_write` with each accepted byte count.
    pub fn new(inner: W, on_write: F) -> Self {
        Self { inner, on_write }
    }
}

impl<W, F> AsyncWrite for ProgressWriter<W, F>
where
    W: AsyncWrite + Unpin,
    F: FnMut(usize) + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll
            && *written > 0
        {
            (this.on_write)(*written);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Result of one throughput snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    /// Percent complete, 0 when the total is unknown.
    pub percent: f32,
    /// Running average over the window.
    pub average_bps: u64,
}

/// Rolling window of recent transfer rates.
///
/// Samples are taken at most once per `interval`, except that a snapshot is
/// always allowed while the window is still empty. The reported rate is the
/// mean of the last `capacity` instantaneous rates, which damps the jitter
/// of bursty reads.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    samples: VecDeque<u64>,
    capacity: usize,
    interval: Duration,
    baseline: Option<(Instant, u64)>,
    next_sample: Option<Instant>,
}

impl ThroughputWindow {
    /// Creates an empty window holding up to `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            interval,
            baseline: None,
            next_sample: None,
        }
    }

    /// Starts measuring from `downloaded` bytes at `now`, dropping old samples.
    pub fn reset(&mut self, now: Instant, downloaded: u64) {
        self.samples.clear();
        self.baseline = Some((now, downloaded));
        self.next_sample = None;
    }

    /// Number of samples currently in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no sample has been taken yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Adds an instantaneous rate and returns the new window average.
    ///
    /// The oldest sample is evicted once the window exceeds its capacity.
    pub fn push(&mut self, rate: u64) -> u64 {
        self.samples.push_back(rate);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        self.average()
    }

    /// Mean of the samples in the window, 0 when empty.
    #[must_use]
    pub fn average(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u128 = self.samples.iter().map(|&v| u128::from(v)).sum();
        u64::try_from(sum / self.samples.len() as u128).unwrap_or(u64::MAX)
    }

    /// Takes a snapshot if the rate limit allows one.
    ///
    /// Returns `None` when the previous sample is less than `interval` old.
    /// On a window with no baseline yet (never [`reset`](Self::reset)) the
    /// call only establishes one and reports the current average without
    /// adding a sample.
    pub fn snap(&mut self, now: Instant, downloaded: u64, total: Option<u64>) -> Option<ThroughputSample> {
        if let Some(next) = self.next_sample
            && now < next
            && !self.samples.is_empty()
        {
            return None;
        }

        let percent = percent_of(downloaded, total);
        let Some((since, base_bytes)) = self.baseline else {
            self.baseline = Some((now, downloaded));
            return Some(ThroughputSample {
                percent,
                average_bps: self.average(),
            });
        };

        let elapsed = now.saturating_duration_since(since).as_secs_f64();
        let instant_bps = if elapsed > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let rate = (downloaded.saturating_sub(base_bytes) as f64 / elapsed).round() as u64;
            rate
        } else {
            0
        };
        let average_bps = self.push(instant_bps);
        self.baseline = Some((now, downloaded));
        self.next_sample = Some(now + self.interval);

        Some(ThroughputSample {
            percent,
            average_bps,
        })
    }
}

/// `downloaded / total * 100`, clamped to 100, or 0 when the total is unknown.
#[must_use]
pub fn percent_of(downloaded: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            let pct = (downloaded as f64 / total as f64 * 100.0) as f32;
            pct.min(100.0)
        }
        _ => 0.0,
    }
}
