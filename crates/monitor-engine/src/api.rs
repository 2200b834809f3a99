//! Public API types for the in-process monitoring engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use watchtower_core::endpoint::ConfigError;
use watchtower_core::endpoint::Endpoint;
use watchtower_core::event::EventPayload;
use watchtower_core::store::StoreError;

/// Configuration for the in-process engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of probe workers to run concurrently.
    pub worker_count: usize,

    /// Capacity of the probe job queue; the scheduler sees backpressure
    /// (and skips the overdue probe) when it is full.
    pub job_queue_size: usize,

    /// Capacity of the result channel between workers and the pipeline.
    pub result_queue_size: usize,

    /// Per-probe cap on response body reads, in bytes.
    pub max_body_bytes: usize,

    /// Redirect-following bound; exceeding it classifies the probe as a
    /// status mismatch.
    pub max_redirects: usize,

    /// Consecutive failures required to auto-open an incident.
    pub fail_threshold: u32,

    /// Consecutive successes required to resolve an auto-opened incident.
    pub recovery_threshold: u32,

    /// Heartbeat cadence on the event stream.
    pub ping_interval: Duration,

    /// Budget for a graceful engine stop; stragglers are force-closed when
    /// it elapses.
    pub shutdown_deadline: Duration,

    /// Floor on endpoint check intervals.
    pub min_interval: Duration,

    /// Per-subscriber outbound queue capacity; a subscriber whose queue
    /// fills is evicted.
    pub event_buffer: usize,

    /// User-Agent header attached to probe requests.
    pub user_agent: String,
}

impl EngineConfig {
    /// Default parallelism of the worker pool.
    pub const DEFAULT_WORKER_COUNT: usize = 5;

    /// Default job queue capacity.
    pub const DEFAULT_JOB_QUEUE_SIZE: usize = 64;

    /// Default result channel capacity.
    pub const DEFAULT_RESULT_QUEUE_SIZE: usize = 256;

    /// Default response body read cap (64 KiB).
    pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

    /// Default redirect bound.
    pub const DEFAULT_MAX_REDIRECTS: usize = 10;

    /// Default consecutive-failure threshold.
    pub const DEFAULT_FAIL_THRESHOLD: u32 = 3;

    /// Default consecutive-success threshold.
    pub const DEFAULT_RECOVERY_THRESHOLD: u32 = 2;

    /// Default heartbeat cadence.
    pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

    /// Default graceful shutdown budget.
    pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

    /// Default check interval floor.
    pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60);

    /// Default per-subscriber queue capacity.
    pub const DEFAULT_EVENT_BUFFER: usize = 256;

    /// Clamp zero-valued knobs back to their defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.worker_count == 0 {
            self.worker_count = Self::DEFAULT_WORKER_COUNT;
        }
        if self.job_queue_size == 0 {
            self.job_queue_size = Self::DEFAULT_JOB_QUEUE_SIZE;
        }
        if self.result_queue_size == 0 {
            self.result_queue_size = Self::DEFAULT_RESULT_QUEUE_SIZE;
        }
        if self.max_body_bytes == 0 {
            self.max_body_bytes = Self::DEFAULT_MAX_BODY_BYTES;
        }
        if self.fail_threshold == 0 {
            self.fail_threshold = Self::DEFAULT_FAIL_THRESHOLD;
        }
        if self.recovery_threshold == 0 {
            self.recovery_threshold = Self::DEFAULT_RECOVERY_THRESHOLD;
        }
        if self.ping_interval.is_zero() {
            self.ping_interval = Self::DEFAULT_PING_INTERVAL;
        }
        if self.event_buffer == 0 {
            self.event_buffer = Self::DEFAULT_EVENT_BUFFER;
        }
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_count: Self::DEFAULT_WORKER_COUNT,
            job_queue_size: Self::DEFAULT_JOB_QUEUE_SIZE,
            result_queue_size: Self::DEFAULT_RESULT_QUEUE_SIZE,
            max_body_bytes: Self::DEFAULT_MAX_BODY_BYTES,
            max_redirects: Self::DEFAULT_MAX_REDIRECTS,
            fail_threshold: Self::DEFAULT_FAIL_THRESHOLD,
            recovery_threshold: Self::DEFAULT_RECOVERY_THRESHOLD,
            ping_interval: Self::DEFAULT_PING_INTERVAL,
            shutdown_deadline: Self::DEFAULT_SHUTDOWN_DEADLINE,
            min_interval: Self::DEFAULT_MIN_INTERVAL,
            event_buffer: Self::DEFAULT_EVENT_BUFFER,
            user_agent: concat!("watchtower/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Work unit emitted by the scheduler; never persisted.
#[derive(Debug, Clone)]
pub struct ProbeJob {
    /// Immutable endpoint snapshot taken at emission time.
    pub endpoint: Endpoint,
    /// Wall-clock emission time.
    pub scheduled_at: DateTime<Utc>,
    /// Correlates the job with its eventual result.
    pub correlation_id: Uuid,
}

/// Why the scheduler skipped an overdue probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// The previous probe for the endpoint had not completed yet.
    Overdue,
    /// The worker pool's job queue was full.
    QueueFull,
}

/// Engine lifecycle and diagnostics stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Graceful shutdown requested.
    StopRequested,
    /// The scheduler dropped a probe instead of emitting it.
    JobSkipped {
        /// Affected endpoint.
        endpoint_id: String,
        /// Skip cause.
        reason: SkipReason,
    },
    /// A non-fatal degradation (for example a failed store write).
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the engine.
    Error {
        /// Error message.
        message: String,
    },
    /// Engine stopped; all core tasks have exited.
    Stopped,
}

/// Point-in-time engine health, assembled from lock-free counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Whether the engine is running.
    pub running: bool,
    /// Endpoints currently registered with the scheduler.
    pub registered_endpoints: u64,
    /// Results received from the worker pool.
    pub results_seen: u64,
    /// Results successfully persisted.
    pub results_persisted: u64,
    /// Failed store writes (degradation metric).
    pub persist_failures: u64,
    /// Results discarded because their endpoint was removed mid-probe.
    pub results_discarded: u64,
    /// Probes skipped by the overdue / queue-full policy.
    pub jobs_skipped: u64,
    /// Auto-incidents currently open.
    pub open_incidents: u64,
}

/// Callback invoked by the result pipeline with a `probe-result` event
/// payload. Typically bridges into the hub via [`crate::Broadcaster`].
pub type ResultCallback = Arc<dyn Fn(EventPayload) + Send + Sync>;

/// Error surfaced to control-API callers.
///
/// Probe and persistence failures never show up here; they are data and
/// warnings respectively.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The operation needs a running engine.
    #[error("engine is not running")]
    NotRunning,
    /// The result callback is set-once, before `start`.
    #[error("result callback must be set exactly once, before start")]
    CallbackUnavailable,
    /// An endpoint with this id is already registered.
    #[error("endpoint {0:?} is already registered")]
    AlreadyRegistered(String),
    /// No endpoint with this id is known to the scheduler or the store.
    #[error("unknown endpoint {0:?}")]
    UnknownEndpoint(String),
    /// The endpoint definition failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The store failed while resolving a control call.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The engine could not be brought up.
    #[error("startup failed: {0}")]
    Startup(String),
}
