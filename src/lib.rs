//! Convoy
//!
//! Asynchronous message-consumption runtime for partitioned, offset-addressed
//! log brokers: poll, dispatch, track acknowledgments, and commit offsets
//! under configurable consistency policies, including exactly-once delivery
//! through pooled transactional producers.

pub(crate) mod ack;
pub mod backoff;
pub mod broker;
pub mod config;
pub mod container;
pub mod error;
pub mod handler;
pub mod offset_tracker;
pub mod pool;
pub mod txn;
pub mod types;

pub use backoff::{generate_backoff_values, BackoffPolicy};
pub use broker::{BrokerClient, ProducerFactory, RebalanceListener, TransactionalProducer};
pub use config::{ContainerConfig, DispatchMode, PoolConfig, RetryConfig};
pub use container::{
    ContainerBuilder, ContainerHandle, ContainerMetrics, ContainerMetricsSnapshot, ContainerState,
    MessageContainer, StopReport,
};
pub use error::{Result, RuntimeError};
pub use handler::{
    Acknowledgment, BatchAcknowledgment, BatchHandler, ErrorDisposition, ErrorPolicy,
    FnRecordHandler, Handler, LoggingErrorPolicy, RecordHandler, RecordInterceptor,
};
pub use offset_tracker::OffsetTracker;
pub use pool::{PooledProducer, ProducerPool};
pub use txn::{TransactionContext, TransactionScope, TransactionalCommitter};
pub use types::{
    AckMode, ContainerEvent, GroupMetadata, OffsetAndMetadata, Record, RecordBuilder, StopMode,
    TopicPartition, TransactionalId,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configs_are_consistent() {
        let config = ContainerConfig::default();
        assert_eq!(config.ack_mode, AckMode::Batch);
        assert_eq!(config.stop_mode, StopMode::Graceful);

        let pool = PoolConfig::default();
        assert!(pool.idempotence_enabled());
        assert!(pool.quick_close_timeout < pool.close_timeout);
    }
}
