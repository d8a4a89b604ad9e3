//! User-facing dispatch seams: handlers, acknowledgment handles, the
//! interceptor chain, and the error policy.
//!
//! Method/argument binding is the embedder's concern; the runtime accepts
//! already-bound handler functions and applies interceptors as an ordered
//! list configured up front.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::types::{Record, TopicPartition};

/// One handler completion, possibly arriving out of order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AckEvent {
    pub partition: TopicPartition,
    pub offset: u64,
}

/// Acknowledgment handle for a single delivered record.
///
/// Cloneable and safe to invoke from worker tasks; completions are merged
/// per partition by the coordinator regardless of arrival order.
#[derive(Debug, Clone)]
pub struct Acknowledgment {
    partition: TopicPartition,
    offset: u64,
    sender: mpsc::UnboundedSender<AckEvent>,
}

impl Acknowledgment {
    pub(crate) fn new(
        partition: TopicPartition,
        offset: u64,
        sender: mpsc::UnboundedSender<AckEvent>,
    ) -> Self {
        Self {
            partition,
            offset,
            sender,
        }
    }

    /// Mark the record as successfully processed
    pub fn acknowledge(&self) {
        let event = AckEvent {
            partition: self.partition.clone(),
            offset: self.offset,
        };
        if self.sender.send(event).is_err() {
            debug!(
                "Dropping acknowledgment for {}@{}: container is gone",
                self.partition, self.offset
            );
        }
    }

    /// The record's offset
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The record's partition
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }
}

/// Acknowledgment handle covering every record of a delivered batch
#[derive(Debug, Clone)]
pub struct BatchAcknowledgment {
    entries: Vec<(TopicPartition, u64)>,
    sender: mpsc::UnboundedSender<AckEvent>,
}

impl BatchAcknowledgment {
    pub(crate) fn new(
        entries: Vec<(TopicPartition, u64)>,
        sender: mpsc::UnboundedSender<AckEvent>,
    ) -> Self {
        Self { entries, sender }
    }

    /// Acknowledge every record in the batch
    pub fn acknowledge(&self) {
        for (partition, offset) in &self.entries {
            let event = AckEvent {
                partition: partition.clone(),
                offset: *offset,
            };
            if self.sender.send(event).is_err() {
                debug!(
                    "Dropping batch acknowledgment at {}@{}: container is gone",
                    partition, offset
                );
                return;
            }
        }
    }

    /// Number of records covered
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Processes one record at a time
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: Record, ack: Acknowledgment) -> Result<()>;
}

/// Processes a whole poll result (optionally split per partition)
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, records: Vec<Record>, ack: BatchAcknowledgment) -> Result<()>;
}

/// The configured handler of a container
#[derive(Clone)]
pub enum Handler {
    Record(Arc<dyn RecordHandler>),
    Batch(Arc<dyn BatchHandler>),
}

type RecordHandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Adapter turning an async closure into a [`RecordHandler`]
pub struct FnRecordHandler<F> {
    f: F,
}

impl<F> FnRecordHandler<F>
where
    F: Fn(Record, Acknowledgment) -> RecordHandlerFuture + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> RecordHandler for FnRecordHandler<F>
where
    F: Fn(Record, Acknowledgment) -> RecordHandlerFuture + Send + Sync,
{
    async fn handle(&self, record: Record, ack: Acknowledgment) -> Result<()> {
        (self.f)(record, ack).await
    }
}

/// Hook applied to each record before and after dispatch.
///
/// Interceptors run in configuration order; returning `None` from
/// `intercept` skips the handler for that record (the record still counts as
/// consumed so it cannot wedge the commit prefix).
pub trait RecordInterceptor: Send + Sync {
    fn intercept(&self, record: Record) -> Option<Record> {
        Some(record)
    }

    fn on_success(&self, _record: &Record) {}

    fn on_failure(&self, _record: &Record, _error: &RuntimeError) {}
}

/// What the error policy tells the container to do with a failed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Treat the failed record as consumed and continue with the batch
    Skip,

    /// Leave the failed record and the remainder of the batch
    /// unacknowledged and end this batch's dispatch; uncommitted offsets are
    /// redelivered by the broker client
    Retry,

    /// Stop the container
    Fatal,
}

/// External decision point for handler failures.
///
/// Invoked with the failure, the failed record, and the precise list of
/// not-yet-acknowledged records remaining in the current batch. Dead-letter
/// routing, if any, is the policy's own concern.
#[async_trait]
pub trait ErrorPolicy: Send + Sync {
    async fn on_handler_error(
        &self,
        error: RuntimeError,
        failed: &Record,
        remaining: &[Record],
    ) -> ErrorDisposition;
}

/// Default policy: log the failure and skip the record
pub struct LoggingErrorPolicy;

#[async_trait]
impl ErrorPolicy for LoggingErrorPolicy {
    async fn on_handler_error(
        &self,
        error: RuntimeError,
        failed: &Record,
        remaining: &[Record],
    ) -> ErrorDisposition {
        tracing::error!(
            "Handler failed on {}@{} with {} records remaining: {}",
            failed.topic_partition(),
            failed.offset,
            remaining.len(),
            error
        );
        ErrorDisposition::Skip
    }
}
