use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, RuntimeError};
use crate::types::{AckMode, StopMode};

/// How records are handed to the handler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Run the handler on the control task itself
    #[default]
    Inline,

    /// Offload each record to a worker task, at most `max_in_flight`
    /// concurrently
    Concurrent { max_in_flight: usize },
}

/// Container configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container ID; generated when absent
    pub container_id: Option<String>,

    /// Consumer group the container commits offsets for
    pub group_id: String,

    /// Topics to subscribe to
    pub topics: Vec<String>,

    /// Fail startup when a subscribed topic does not exist
    pub missing_topics_fatal: bool,

    /// When offsets are flushed to the broker
    pub ack_mode: AckMode,

    /// Acknowledged-record threshold for `Count` / `CountTime`
    pub ack_count: u32,

    /// Elapsed-time threshold for `Time` / `CountTime`
    pub ack_time: Duration,

    /// Fetch timeout while no partition is paused
    pub poll_timeout: Duration,

    /// Fetch timeout while backpressure has partitions paused
    pub paused_poll_timeout: Duration,

    /// Timeout for synchronous offset commits
    pub sync_commit_timeout: Duration,

    /// How long `stop` waits for the control task to finish
    pub shutdown_timeout: Duration,

    /// Optional delay between poll cycles
    pub idle_between_polls: Duration,

    /// Emit an `Idle` event when no records arrive for this long (scaled by
    /// `idle_before_data_multiplier` until first data is seen)
    pub idle_event_interval: Option<Duration>,

    /// Multiplier applied to the idle interval before the first record
    pub idle_before_data_multiplier: f64,

    /// Pending (uncommitted) records per partition beyond which fetching is
    /// paused
    pub pending_ack_watermark: usize,

    /// In-flight batch handling on stop
    pub stop_mode: StopMode,

    /// Inline vs worker-task dispatch
    pub dispatch: DispatchMode,

    /// Deliver batch handlers one sub-batch per partition
    pub split_batches_by_partition: bool,

    /// Stop the container when a transactional producer is fenced instead of
    /// continuing with a fresh handle
    pub fatal_on_fence: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            container_id: None,
            group_id: "default-group".to_string(),
            topics: Vec::new(),
            missing_topics_fatal: false,
            ack_mode: AckMode::default(),
            ack_count: 1,
            ack_time: Duration::from_millis(5000),
            poll_timeout: Duration::from_secs(5),
            paused_poll_timeout: Duration::from_millis(100),
            sync_commit_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            idle_between_polls: Duration::ZERO,
            idle_event_interval: None,
            idle_before_data_multiplier: 5.0,
            pending_ack_watermark: 1000,
            stop_mode: StopMode::default(),
            dispatch: DispatchMode::default(),
            split_batches_by_partition: false,
            fatal_on_fence: false,
        }
    }
}

impl ContainerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.topics.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "At least one topic is required".to_string(),
            ));
        }
        if self.group_id.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "Consumer group is required".to_string(),
            ));
        }
        if self.ack_count == 0 {
            return Err(RuntimeError::InvalidConfig(
                "'ack_count' must be > 0".to_string(),
            ));
        }
        if self.ack_time.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "'ack_time' must be > 0".to_string(),
            ));
        }
        if self.pending_ack_watermark == 0 {
            return Err(RuntimeError::InvalidConfig(
                "'pending_ack_watermark' must be > 0".to_string(),
            ));
        }
        if let DispatchMode::Concurrent { max_in_flight } = self.dispatch {
            if max_in_flight == 0 {
                return Err(RuntimeError::InvalidConfig(
                    "'max_in_flight' must be > 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Transactional producer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle handles cached per logical prefix; overflow is closed on release
    pub cache_capacity: usize,

    /// Exclusive upper bound of the numeric suffix space per prefix
    pub max_suffixes: u32,

    /// Graceful close timeout for released/evicted handles
    pub close_timeout: Duration,

    /// Near-zero close timeout used after a commit timeout
    pub quick_close_timeout: Duration,

    /// Bounded wait for a handle when the suffix space is exhausted
    pub acquire_timeout: Duration,

    /// Broker-level idempotent writes; `None` keeps the pool's default of
    /// enabling them
    pub enable_idempotence: Option<bool>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 8,
            max_suffixes: 1000,
            close_timeout: Duration::from_secs(30),
            quick_close_timeout: Duration::ZERO,
            acquire_timeout: Duration::from_secs(5),
            enable_idempotence: None,
        }
    }
}

impl PoolConfig {
    /// Effective idempotence setting: enabled unless explicitly overridden
    pub fn idempotence_enabled(&self) -> bool {
        self.enable_idempotence.unwrap_or(true)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_suffixes == 0 {
            return Err(RuntimeError::InvalidConfig(
                "'max_suffixes' must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry configuration; feeds the backoff sequence generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts
    pub max_retries: usize,

    /// Base retry delay
    pub base_delay: Duration,

    /// Maximum retry delay
    pub max_delay: Duration,

    /// Retry multiplier for exponential backoff
    pub multiplier: f64,

    /// Jitter for retry timing; jittered policies are not accepted by the
    /// backoff sequence generator
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }
}
