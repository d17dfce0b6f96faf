//! Scheduler and logging settings
//!
//! These are the knobs read on every request: how long the event loop
//! blocks between completions, how long a DL session may wait for a free
//! stream before it is deferred, and how long a deferred session may sit
//! in the scheduler before the request is failed.
//!
//! # Main Types
//!
//! - [`SchedulerSettings`] - Timeouts and limits of the execution loop
//! - [`LoggingSettings`] - Log level and optional log directory

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default event queue poll timeout in microseconds
pub const DEFAULT_EVENT_POLL_TIMEOUT_US: u64 = 5_000;

/// Default stream acquisition wait in microseconds
pub const DEFAULT_STREAM_WAIT_TIMEOUT_US: u64 = 1;

/// Default largest dim 0 a demultiplexer accepts
pub const DEFAULT_DEMULTIPLY_LIMIT: usize = crate::pipeline::node::DEFAULT_DEMULTIPLY_LIMIT;

/// Default wait for a definition to become available, in microseconds
pub const DEFAULT_WAIT_FOR_LOADED_TIMEOUT_US: u64 = 10_000;

/// Default maximum residency of a deferred session in milliseconds
pub const DEFAULT_MAX_DEFERRED_RESIDENCY_MS: u64 = 30_000;

/// Settings of the per-request execution loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How long the loop blocks on the event queue before retrying
    /// deferred sessions
    pub event_poll_timeout_us: u64,

    /// How long a DL session waits for a stream before it is deferred
    pub stream_wait_timeout_us: u64,

    /// Largest dim 0 a demultiplexer accepts
    pub demultiply_limit: usize,

    /// How long a request waits for its definition to become available
    pub wait_for_loaded_timeout_us: u64,

    /// How long a session may stay deferred (0 = unbounded)
    pub max_deferred_residency_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            event_poll_timeout_us: DEFAULT_EVENT_POLL_TIMEOUT_US,
            stream_wait_timeout_us: DEFAULT_STREAM_WAIT_TIMEOUT_US,
            demultiply_limit: DEFAULT_DEMULTIPLY_LIMIT,
            wait_for_loaded_timeout_us: DEFAULT_WAIT_FOR_LOADED_TIMEOUT_US,
            max_deferred_residency_ms: DEFAULT_MAX_DEFERRED_RESIDENCY_MS,
        }
    }
}

impl SchedulerSettings {
    pub fn event_poll_timeout(&self) -> Duration {
        Duration::from_micros(self.event_poll_timeout_us)
    }

    pub fn stream_wait_timeout(&self) -> Duration {
        Duration::from_micros(self.stream_wait_timeout_us)
    }

    pub fn wait_for_loaded_timeout(&self) -> Duration {
        Duration::from_micros(self.wait_for_loaded_timeout_us)
    }

    /// `None` when deferred sessions may wait forever
    pub fn max_deferred_residency(&self) -> Option<Duration> {
        (self.max_deferred_residency_ms > 0)
            .then(|| Duration::from_millis(self.max_deferred_residency_ms))
    }

    /// Set the event poll timeout
    pub fn with_event_poll_timeout(mut self, timeout: Duration) -> Self {
        self.event_poll_timeout_us = timeout.as_micros() as u64;
        self
    }

    /// Set the stream wait timeout
    pub fn with_stream_wait_timeout(mut self, timeout: Duration) -> Self {
        self.stream_wait_timeout_us = timeout.as_micros() as u64;
        self
    }

    pub fn with_max_deferred_residency(mut self, residency: Duration) -> Self {
        self.max_deferred_residency_ms = residency.as_millis() as u64;
        self
    }
}

/// Logging output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,

    /// Directory for daily rolling log files
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info,dagserve=debug".to_string(),
            log_dir: None,
        }
    }
}
