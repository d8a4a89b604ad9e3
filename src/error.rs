use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur in the consumption runtime
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// Recoverable broker hiccup (timeout, disconnect); retried on the next
    /// poll cycle
    #[error("Transient broker error: {0}")]
    TransientBroker(String),

    /// Offset commit failed
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Synchronous commit exceeded its timeout
    #[error("Commit timed out after {timeout_ms}ms")]
    CommitTimeout { timeout_ms: u64 },

    /// The broker superseded this producer's transactional identity
    #[error("Producer fenced: {transactional_id}")]
    Fenced { transactional_id: String },

    /// Transaction-scoped operation failed
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// User handler raised during dispatch
    #[error("Handler error: {0}")]
    Handler(String),

    /// Operation against a torn-down producer pool
    #[error("Producer pool is closed")]
    PoolClosed,

    /// Unsupported or malformed backoff policy
    #[error("Invalid backoff policy: {0}")]
    InvalidPolicy(String),

    /// Offsets must be registered in increasing order per partition
    #[error("Non-monotonic offset registration on {partition}: offset {offset} after {last}")]
    MonotonicityViolation {
        partition: String,
        offset: u64,
        last: u64,
    },

    /// Acknowledgment for an offset that was never delivered
    #[error("Acknowledged unknown offset {offset} on {partition}")]
    UnknownOffset { partition: String, offset: u64 },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configured required topics are absent from the broker
    #[error("Required topics missing: {0:?}")]
    MissingTopics(Vec<String>),

    /// A bounded resource (e.g. the transactional-id suffix space) ran out
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation against a container that already stopped
    #[error("Container is stopped")]
    ContainerStopped,

    /// The container did not stop within the shutdown timeout
    #[error("Shutdown timed out after {timeout_ms}ms")]
    ShutdownTimeout { timeout_ms: u64 },
}

impl RuntimeError {
    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            RuntimeError::TransientBroker(_) => "broker",
            RuntimeError::Commit(_) => "commit",
            RuntimeError::CommitTimeout { .. } => "commit_timeout",
            RuntimeError::Fenced { .. } => "fenced",
            RuntimeError::Transaction(_) => "transaction",
            RuntimeError::Handler(_) => "handler",
            RuntimeError::PoolClosed => "pool",
            RuntimeError::InvalidPolicy(_) => "policy",
            RuntimeError::MonotonicityViolation { .. } | RuntimeError::UnknownOffset { .. } => {
                "consistency"
            }
            RuntimeError::InvalidConfig(_) => "configuration",
            RuntimeError::MissingTopics(_) => "topics",
            RuntimeError::ResourceExhausted(_) => "resource_exhausted",
            RuntimeError::ContainerStopped | RuntimeError::ShutdownTimeout { .. } => "lifecycle",
        }
    }

    /// Check if the error is retryable on a later cycle without caller
    /// intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::TransientBroker(_)
                | RuntimeError::Commit(_)
                | RuntimeError::CommitTimeout { .. }
        )
    }

    /// Internal-consistency and lifecycle violations are never recovered
    /// from; they signal a logic defect upstream
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::MonotonicityViolation { .. }
                | RuntimeError::UnknownOffset { .. }
                | RuntimeError::PoolClosed
                | RuntimeError::InvalidPolicy(_)
                | RuntimeError::InvalidConfig(_)
                | RuntimeError::MissingTopics(_)
        )
    }

    /// True when the error reports a fencing condition
    pub fn is_fenced(&self) -> bool {
        matches!(self, RuntimeError::Fenced { .. })
    }
}
