//! Outbound notifications for a presentation layer.
//!
//! Producers push [`Event`]s through a cloneable [`EventPublisher`] into one
//! bounded FIFO queue. A single [`EventForwarder`] task drains the queue
//! and hands each event to an [`EventSink`], pausing briefly after each one
//! so a burst cannot flood a UI thread.
//!
//! A full queue applies backpressure: the producer waits. Events are never
//! dropped. A wait longer than the stall timeout is logged and counted (the
//! consumer is presumably stuck), then the producer keeps waiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::download::{ProgressUpdate, RecordSnapshot};

/// A typed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    /// The full record list after a change or a scheduler sweep.
    RegistryChanged(Vec<RecordSnapshot>),
    /// Byte counters and throughput of one record.
    Progress(ProgressUpdate),
    /// An attempt finished a record.
    Done {
        /// Record URL.
        url: String,
        /// Always true; kept for consumers that expect the flag.
        complete: bool,
    },
}

impl Event {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegistryChanged(_) => "registryChanged",
            Self::Progress(_) => "progress",
            Self::Done { .. } => "done",
        }
    }
}

/// Errors from the event bus.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    /// The forwarder has stopped; nothing will consume the event.
    #[error("event bus closed")]
    Closed,
}

/// Receiver of forwarded events.
///
/// Called from the forwarder task only, one event at a time, in order.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: Event);
}

/// Sink that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match &event {
            Event::RegistryChanged(records) => debug!(records = records.len(), "registry changed"),
            Event::Progress(p) => debug!(
                url = %p.url,
                downloaded = p.downloaded,
                total = ?p.total,
                bytes_per_second = p.bytes_per_second,
                percent = p.percent,
                "progress"
            ),
            Event::Done { url, .. } => debug!(url = %url, "done"),
        }
    }
}

/// Producer half of the event bus.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Event>,
    stall_timeout: Duration,
    stalls: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Enqueues an event, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Closed`] once the forwarder is gone.
    pub async fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let mut pending = event;
        loop {
            match self.tx.send_timeout(pending, self.stall_timeout).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(event)) => {
                    let stalls = self.stalls.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        kind = event.kind(),
                        waited_ms = u64::try_from(self.stall_timeout.as_millis()).unwrap_or(u64::MAX),
                        stalls,
                        "event consumer stalled, queue full"
                    );
                    pending = event;
                }
                Err(SendTimeoutError::Closed(_)) => return Err(EventBusError::Closed),
            }
        }
    }

    /// Number of times a producer waited longer than the stall timeout.
    #[must_use]
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }
}

/// Consumer half of the event bus.
#[derive(Debug)]
pub struct EventForwarder {
    rx: mpsc::Receiver<Event>,
    pacing: Duration,
}

impl EventForwarder {
    /// Spawns the forwarding loop. The task ends, returning the number of
    /// events forwarded, once every publisher has been dropped and the
    /// queue is drained.
    pub fn spawn(self, sink: Arc<dyn EventSink>) -> JoinHandle<u64> {
        tokio::spawn(self.run(sink))
    }

    /// Forwards events until the queue closes.
    #[instrument(skip_all)]
    pub async fn run(mut self, sink: Arc<dyn EventSink>) -> u64 {
        let mut forwarded = 0u64;
        while let Some(event) = self.rx.recv().await {
            sink.emit(event);
            forwarded += 1;
            if !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
        }
        debug!(forwarded, "event forwarder stopped");
        forwarded
    }
}

/// Creates a bus sized and paced by `config`.
#[must_use]
pub fn channel(config: &EngineConfig) -> (EventPublisher, EventForwarder) {
    let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
    (
        EventPublisher {
            tx,
            stall_timeout: config.event_stall_timeout,
            stalls: Arc::new(AtomicU64::new(0)),
        },
        EventForwarder {
            rx,
            pacing: config.event_pacing,
        },
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Event>>);

    impl EventSink for Collect {
        fn emit(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn done(n: usize) -> Event {
        Event::Done {
            url: format!("https://example.test/{n}"),
            complete: true,
        }
    }

    fn small_bus(capacity: usize, stall: Duration) -> (EventPublisher, EventForwarder) {
        let mut config = EngineConfig::new("/tmp/unused").with_event_pacing(Duration::ZERO);
        config.event_capacity = capacity;
        config.event_stall_timeout = stall;
        channel(&config)
    }

    #[tokio::test]
    async fn test_events_arrive_in_order_without_loss() {
        let (publisher, forwarder) = small_bus(2, Duration::from_secs(5));
        let sink = Arc::new(Collect::default());
        let handle = forwarder.spawn(sink.clone());

        for n in 0..50 {
            publisher.publish(done(n)).await.unwrap();
        }
        drop(publisher);

        assert_eq!(handle.await.unwrap(), 50);
        let events = sink.0.lock().unwrap();
        let expected: Vec<Event> = (0..50).map(done).collect();
        assert_eq!(*events, expected);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_and_counts_stall() {
        let (publisher, forwarder) = small_bus(1, Duration::from_millis(20));
        publisher.publish(done(0)).await.unwrap();

        let blocked = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish(done(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!blocked.is_finished(), "producer must wait, not drop");
        assert!(publisher.stalls() >= 2);

        let sink = Arc::new(Collect::default());
        let handle = forwarder.spawn(sink.clone());
        blocked.await.unwrap().unwrap();
        drop(publisher);
        assert_eq!(handle.await.unwrap(), 2);
        assert_eq!(*sink.0.lock().unwrap(), vec![done(0), done(1)]);
    }

    #[tokio::test]
    async fn test_publish_after_forwarder_dropped_is_closed() {
        let (publisher, forwarder) = small_bus(1, Duration::from_secs(1));
        drop(forwarder);
        assert_eq!(publisher.publish(done(0)).await, Err(EventBusError::Closed));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(done(7)).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["payload"]["url"], "https://example.test/7");
        assert_eq!(json["payload"]["complete"], true);

        let progress = Event::Progress(ProgressUpdate {
            url: "https://example.test/f.bin".to_string(),
            downloaded: 400,
            total: Some(1000),
            bytes_per_second: 10,
            percent: 40.0,
        });
        let json = serde_json::to_value(progress).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["payload"]["bytesPerSecond"], 10);
    }
}
