use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, RuntimeError};

/// Topic and partition identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    /// Create a new TopicPartition
    pub fn new<T: Into<String>>(topic: T, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A record delivered from the broker. Immutable once delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Topic the record belongs to
    pub topic: String,

    /// Partition ID
    pub partition: u32,

    /// Record offset within the partition
    pub offset: u64,

    /// Record key for partitioning
    pub key: Option<Bytes>,

    /// Record payload
    pub value: Bytes,

    /// Timestamp when the record was produced
    pub timestamp: u64,

    /// Record headers/properties
    pub headers: HashMap<String, String>,
}

/// Builder for creating records
#[derive(Debug, Default)]
pub struct RecordBuilder {
    topic: Option<String>,
    partition: Option<u32>,
    offset: Option<u64>,
    key: Option<Bytes>,
    value: Option<Bytes>,
    timestamp: Option<u64>,
    headers: HashMap<String, String>,
}

impl RecordBuilder {
    /// Create a new record builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set topic
    pub fn topic<T: Into<String>>(mut self, topic: T) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set partition
    pub fn partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set offset
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Set record key
    pub fn key<T: Into<Bytes>>(mut self, key: T) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set record payload
    pub fn value<T: Into<Bytes>>(mut self, value: T) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Set record timestamp (milliseconds since the epoch)
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Add a header
    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Build the record
    pub fn build(self) -> Result<Record> {
        let topic = self
            .topic
            .ok_or_else(|| RuntimeError::InvalidConfig("Record topic is required".to_string()))?;
        let offset = self
            .offset
            .ok_or_else(|| RuntimeError::InvalidConfig("Record offset is required".to_string()))?;

        let timestamp = self.timestamp.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        });

        Ok(Record {
            topic,
            partition: self.partition.unwrap_or(0),
            offset,
            key: self.key,
            value: self.value.unwrap_or_default(),
            timestamp,
            headers: self.headers,
        })
    }
}

impl Record {
    /// Create a new record builder
    pub fn builder() -> RecordBuilder {
        RecordBuilder::new()
    }

    /// The partition this record belongs to
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Get record as JSON string
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Create record from JSON string
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Get record payload as string (UTF-8)
    pub fn value_as_string(&self) -> std::result::Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.value.to_vec())
    }

    /// Get header value
    pub fn get_header(&self, key: &str) -> Option<&String> {
        self.headers.get(key)
    }
}

/// Offset and metadata committed for a topic partition.
///
/// The offset follows the broker convention: it is the next offset to read,
/// not the last offset processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    pub offset: u64,
    pub metadata: Option<String>,
}

impl OffsetAndMetadata {
    /// Create a new OffsetAndMetadata
    pub fn new(offset: u64, metadata: Option<String>) -> Self {
        Self { offset, metadata }
    }
}

/// Consumer group metadata attached to transactional offset commits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub group_id: String,
    pub member_id: Option<String>,
    pub generation_id: Option<i32>,
}

impl GroupMetadata {
    /// Create group metadata with just a group id
    pub fn new<T: Into<String>>(group_id: T) -> Self {
        Self {
            group_id: group_id.into(),
            member_id: None,
            generation_id: None,
        }
    }
}

/// Policy governing when consumed offsets are flushed to the broker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Commit the offset after each record has been processed
    Record,

    /// Commit the offsets once every record of a fetched batch has been
    /// processed
    #[default]
    Batch,

    /// Commit pending offsets once `ack_time` has elapsed since the last
    /// commit
    Time,

    /// Commit pending offsets once at least `ack_count` records have been
    /// acknowledged since the last commit
    Count,

    /// Commit on whichever of `ack_time` / `ack_count` fires first
    CountTime,

    /// The handler is responsible for acknowledging; acknowledged offsets are
    /// committed at the next batch boundary
    Manual,

    /// The handler is responsible for acknowledging; acknowledgments arriving
    /// on the dispatch task are committed immediately, others at the next
    /// batch boundary
    ManualImmediate,
}

impl AckMode {
    /// True for the modes where the runtime acknowledges records itself after
    /// a successful dispatch
    pub fn is_auto_ack(&self) -> bool {
        !matches!(self, AckMode::Manual | AckMode::ManualImmediate)
    }
}

/// How a container reacts to a stop request while a batch is in flight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum StopMode {
    /// Finish dispatching and committing the in-flight batch, then stop
    #[default]
    Graceful,

    /// Stop after the current record; later records of the batch are left
    /// undelivered and reported to the caller
    Immediate,
}

/// Transactional identity of a pooled producer: a logical prefix plus a
/// numeric suffix unique among live handles of that prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TransactionalId {
    prefix: String,
    suffix: u32,
}

impl TransactionalId {
    /// Create a transactional id from a logical prefix and numeric suffix
    pub fn new<T: Into<String>>(prefix: T, suffix: u32) -> Self {
        Self {
            prefix: prefix.into(),
            suffix,
        }
    }

    /// The logical prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The numeric suffix
    pub fn suffix(&self) -> u32 {
        self.suffix
    }
}

impl fmt::Display for TransactionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.suffix)
    }
}

/// Lifecycle notifications published by a running container.
///
/// Observability only: consuming these is never required for correctness.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    /// The container subscribed and entered its poll loop
    Started,

    /// No records arrived for longer than the configured idle interval
    Idle { idle_for_ms: u64 },

    /// Fetching was suspended on the given partitions by backpressure
    PartitionsPaused(Vec<TopicPartition>),

    /// Fetching resumed on the given partitions
    PartitionsResumed(Vec<TopicPartition>),

    /// The container stopped
    Stopped,

    /// The container hit a fatal error and stopped
    Failed(String),
}
