//! The polling loop that drives every download.
//!
//! Two periodic actions share one task:
//!
//! - every tick (200 ms by default), a sweep under the registry lock skips
//!   paused and complete records, refreshes throughput for records that are
//!   mid-attempt, and launches a supervised attempt task for the rest, then
//!   publishes a registry snapshot;
//! - every persist interval (1 s by default), the registry is saved.
//!
//! The sweep never awaits while holding the lock: attempt tasks are spawned
//! and the events are published after the lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::download::{AttemptOutcome, AttemptTask, DownloadRecord, Transport};
use crate::events::{Event, EventPublisher};
use crate::store::PersistentStore;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// URLs an attempt was launched for.
    pub launched: Vec<String>,
    /// Records that were mid-attempt and only had their throughput refreshed.
    pub refreshed: usize,
    /// Records skipped because they are paused or complete.
    pub skipped: usize,
}

/// Drives attempts and persistence for one registry.
#[derive(Debug)]
pub struct Scheduler {
    store: Arc<PersistentStore>,
    transport: Arc<dyn Transport>,
    events: EventPublisher,
    config: EngineConfig,
    started: AtomicBool,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a scheduler. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(
        store: Arc<PersistentStore>,
        transport: Arc<dyn Transport>,
        events: EventPublisher,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            config,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Starts the polling loop. Only the first call has an effect; it
    /// returns true.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("scheduler already started");
            return false;
        }
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run().await });
        *self.loop_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(
            tick_ms = u64::try_from(self.config.tick_interval.as_millis()).unwrap_or(u64::MAX),
            persist_ms = u64::try_from(self.config.persist_interval.as_millis()).unwrap_or(u64::MAX),
            "scheduler started"
        );
        true
    }

    /// True once [`start`](Self::start) has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn run(&self) {
        let mut tick = interval(self.config.tick_interval);
        let mut persist = interval(self.config.persist_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.tick().await;
                }
                _ = persist.tick() => self.persist(),
            }
        }
        debug!("scheduler loop stopped");
    }

    /// Runs one sweep over the registry.
    ///
    /// Public so callers (and tests) can drive the engine without the
    /// timer loop.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut progress = Vec::new();
        let records = {
            let registry = self.store.registry();
            for record in registry.iter() {
                if !record.is_eligible() {
                    report.skipped += 1;
                    continue;
                }
                if record.is_attempting() {
                    progress.push(record.snap());
                    report.refreshed += 1;
                    continue;
                }
                if self.launch(record) {
                    report.launched.push(record.url().to_string());
                }
            }
            registry.iter().map(|r| r.snapshot()).collect::<Vec<_>>()
        };

        for update in progress {
            if self.events.publish(Event::Progress(update)).await.is_err() {
                debug!("event bus closed, dropping progress");
                return report;
            }
        }
        if self.events.publish(Event::RegistryChanged(records)).await.is_err() {
            debug!("event bus closed, dropping registry snapshot");
        }
        report
    }

    /// Spawns a supervised attempt if the record accepts one right now.
    fn launch(&self, record: &Arc<DownloadRecord>) -> bool {
        let Some(guard) = record.try_begin_attempt(self.config.min_attempt_interval) else {
            return false;
        };

        let cancel = self.shutdown.child_token();
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        let task_cancel = cancel.clone();
        let url = record.url().to_string();
        let handle = tokio::spawn(async move {
            match crate::download::run_attempt(guard, transport.as_ref(), &task_cancel).await {
                AttemptOutcome::Completed => {
                    let done = Event::Done {
                        url,
                        complete: true,
                    };
                    if events.publish(done).await.is_err() {
                        debug!("event bus closed, dropping done");
                    }
                }
                AttemptOutcome::Failed(error) if !error.is_transient() => {
                    warn!(url = %url, error = %error, "attempt failed, will retry on a later tick");
                }
                AttemptOutcome::Failed(_) | AttemptOutcome::Cancelled | AttemptOutcome::Skipped => {}
            }
        });
        record.attach_task(AttemptTask::new(cancel, handle));
        true
    }

    /// Saves the registry, logging failures. The next persist tick retries.
    pub fn persist(&self) {
        if let Err(error) = self.store.save() {
            warn!(error = %error, "registry save failed, will retry");
        }
    }

    /// Waits for every currently supervised attempt to finish on its own.
    pub async fn join_attempts(&self) {
        let tasks: Vec<AttemptTask> = {
            let registry = self.store.registry();
            registry.iter().filter_map(|r| r.take_task()).collect()
        };
        for task in tasks {
            task.wait().await;
        }
    }

    /// Stops the loop, cancels every attempt, waits for them, and saves.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(error) = handle.await
        {
            warn!(error = %error, "scheduler loop panicked");
        }

        let tasks: Vec<AttemptTask> = {
            let registry = self.store.registry();
            registry.iter().filter_map(|r| r.take_task()).collect()
        };
        for task in tasks {
            task.cancel_and_wait().await;
        }
        self.persist();
        info!("scheduler stopped");
    }
}
