//! Engine configuration: timings, capacities and on-disk locations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Interval between scheduler sweeps.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Interval between registry saves.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_millis(1000);

/// Minimum wall-clock spacing between two attempts on the same record.
pub const DEFAULT_MIN_ATTEMPT_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing between two throughput samples.
pub const DEFAULT_SNAP_INTERVAL: Duration = Duration::from_secs(1);

/// Number of throughput samples averaged for the displayed rate.
pub const DEFAULT_THROUGHPUT_WINDOW: usize = 10;

/// Outbound event queue capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 10;

/// Delay the forwarder waits after handing each event to the sink.
pub const DEFAULT_EVENT_PACING: Duration = Duration::from_millis(10);

/// How long a producer waits on a full event queue before reporting a stall.
pub const DEFAULT_EVENT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default HTTP connect timeout (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default HTTP read timeout (5 minutes between body reads).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

const STATE_FILE_NAME: &str = "state.json";
const TEMP_DIR_NAME: &str = "tmp";
const APP_DIR_NAME: &str = "downloader";

/// Invalid engine configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that drives a periodic loop was zero.
    #[error("invalid {field}: interval must be greater than zero")]
    ZeroInterval {
        /// Name of the offending setting.
        field: &'static str,
    },

    /// A capacity or window size was zero.
    #[error("invalid {field}: value must be at least 1")]
    ZeroCapacity {
        /// Name of the offending setting.
        field: &'static str,
    },
}

/// Settings shared by the store, scheduler and event bus.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Root directory for the registry document and temp files.
    pub state_dir: PathBuf,
    /// Scheduler sweep interval.
    pub tick_interval: Duration,
    /// Registry save interval.
    pub persist_interval: Duration,
    /// Minimum spacing between attempts on one record.
    pub min_attempt_interval: Duration,
    /// Minimum spacing between throughput samples.
    pub snap_interval: Duration,
    /// Number of throughput samples averaged.
    pub throughput_window: usize,
    /// Outbound event queue capacity.
    pub event_capacity: usize,
    /// Delay after each forwarded event.
    pub event_pacing: Duration,
    /// Wait on a full queue before a stall is reported.
    pub event_stall_timeout: Duration,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP read timeout.
    pub read_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(default_state_dir())
    }
}

impl EngineConfig {
    /// Creates a configuration rooted at `state_dir` with default timings.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            persist_interval: DEFAULT_PERSIST_INTERVAL,
            min_attempt_interval: DEFAULT_MIN_ATTEMPT_INTERVAL,
            snap_interval: DEFAULT_SNAP_INTERVAL,
            throughput_window: DEFAULT_THROUGHPUT_WINDOW,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            event_pacing: DEFAULT_EVENT_PACING,
            event_stall_timeout: DEFAULT_EVENT_STALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Overrides the minimum attempt spacing.
    #[must_use]
    pub fn with_min_attempt_interval(mut self, interval: Duration) -> Self {
        self.min_attempt_interval = interval;
        self
    }

    /// Overrides the scheduler and persistence intervals.
    #[must_use]
    pub fn with_intervals(mut self, tick: Duration, persist: Duration) -> Self {
        self.tick_interval = tick;
        self.persist_interval = persist;
        self
    }

    /// Overrides the event forwarder pacing delay.
    #[must_use]
    pub fn with_event_pacing(mut self, pacing: Duration) -> Self {
        self.event_pacing = pacing;
        self
    }

    /// Path of the registry document.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    /// Directory holding the `.tmp` files of in-flight downloads.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.state_dir.join(TEMP_DIR_NAME)
    }

    /// Checks that every periodic setting can actually drive a loop.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroInterval {
                field: "tick_interval",
            });
        }
        if self.persist_interval.is_zero() {
            return Err(ConfigError::ZeroInterval {
                field: "persist_interval",
            });
        }
        if self.throughput_window == 0 {
            return Err(ConfigError::ZeroCapacity {
                field: "throughput_window",
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                field: "event_capacity",
            });
        }
        Ok(())
    }

    /// Returns true when `path` lives under this configuration's state dir.
    #[must_use]
    pub fn owns_path(&self, path: &Path) -> bool {
        path.starts_with(&self.state_dir)
    }
}

/// Resolves the platform-standard per-user state directory.
///
/// Falls back to the local data directory on platforms without a state
/// directory (macOS, Windows), then to the working directory.
#[must_use]
pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}
