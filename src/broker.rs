//! Collaborator seams toward the broker client library.
//!
//! The runtime never speaks the wire protocol itself; it drives these traits.
//! The broker consumer handle is single-threaded-use: only the container's
//! control task calls `poll`/`commit_sync` on it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::{GroupMetadata, OffsetAndMetadata, Record, TopicPartition, TransactionalId};

/// Rebalance notifications from the group protocol
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_assigned(&self, _partitions: &[TopicPartition]) {}

    fn on_partitions_revoked(&self, _partitions: &[TopicPartition]) {}
}

/// Consuming side of the broker client
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Join the group and subscribe to the given topics
    async fn subscribe(
        &self,
        topics: &[String],
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<()>;

    /// Fetch the next batch of records, waiting at most `timeout`
    async fn poll(&self, timeout: Duration) -> Result<Vec<Record>>;

    /// Synchronously commit the given offsets, waiting at most `timeout`
    async fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        timeout: Duration,
    ) -> Result<()>;

    /// Suspend fetching on the given partitions
    async fn pause(&self, partitions: &[TopicPartition]) -> Result<()>;

    /// Resume fetching on the given partitions
    async fn resume(&self, partitions: &[TopicPartition]) -> Result<()>;

    /// Whether the topic exists on the broker (startup check)
    async fn topic_exists(&self, topic: &str) -> Result<bool>;

    /// Group metadata for transactional offset commits
    fn group_metadata(&self) -> GroupMetadata;
}

/// Producing side used for exactly-once offset commits
#[async_trait]
pub trait TransactionalProducer: Send + Sync {
    async fn begin_transaction(&self) -> Result<()>;

    async fn send(&self, record: Record) -> Result<()>;

    /// Attach consumed offsets to the open transaction
    async fn send_offsets_to_transaction(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        group_metadata: &GroupMetadata,
    ) -> Result<()>;

    /// Commit the open transaction; may fail `Fenced` or `CommitTimeout`
    async fn commit_transaction(&self) -> Result<()>;

    async fn abort_transaction(&self) -> Result<()>;

    /// Close the underlying producer, waiting at most `timeout`
    async fn close(&self, timeout: Duration) -> Result<()>;
}

/// Creates transaction-initialized producers for the pool
#[async_trait]
pub trait ProducerFactory: Send + Sync {
    async fn create(
        &self,
        transactional_id: &TransactionalId,
        enable_idempotence: bool,
    ) -> Result<Arc<dyn TransactionalProducer>>;
}
