//! Shared mock collaborators for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use convoy::{
    BrokerClient, GroupMetadata, OffsetAndMetadata, ProducerFactory, RebalanceListener, Record,
    Result, RuntimeError, TopicPartition, TransactionalId, TransactionalProducer,
};

pub fn record(topic: &str, partition: u32, offset: u64) -> Record {
    Record::builder()
        .topic(topic)
        .partition(partition)
        .offset(offset)
        .value(format!("payload-{offset}"))
        .build()
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Scripted broker client: batches are dequeued one per poll, every
/// interaction is journaled for assertions.
pub struct MockBrokerClient {
    batches: Mutex<VecDeque<Vec<Record>>>,
    pub commits: Mutex<Vec<HashMap<TopicPartition, OffsetAndMetadata>>>,
    pub paused: Mutex<Vec<TopicPartition>>,
    pub resumed: Mutex<Vec<TopicPartition>>,
    pub missing_topics: Mutex<Vec<String>>,
    pub subscribed: AtomicBool,
    pub fail_next_commits: Mutex<VecDeque<RuntimeError>>,
}

impl MockBrokerClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(VecDeque::new()),
            commits: Mutex::new(Vec::new()),
            paused: Mutex::new(Vec::new()),
            resumed: Mutex::new(Vec::new()),
            missing_topics: Mutex::new(Vec::new()),
            subscribed: AtomicBool::new(false),
            fail_next_commits: Mutex::new(VecDeque::new()),
        })
    }

    pub fn enqueue(&self, batch: Vec<Record>) {
        self.batches.lock().push_back(batch);
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().len()
    }

    /// The most recent committed offset for a partition
    pub fn committed_offset(&self, partition: &TopicPartition) -> Option<u64> {
        self.commits
            .lock()
            .iter()
            .rev()
            .find_map(|commit| commit.get(partition).map(|o| o.offset))
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn subscribe(
        &self,
        _topics: &[String],
        _listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<()> {
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<Record>> {
        if let Some(batch) = self.batches.lock().pop_front() {
            return Ok(batch);
        }
        tokio::time::sleep(timeout).await;
        Ok(Vec::new())
    }

    async fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        _timeout: Duration,
    ) -> Result<()> {
        if let Some(error) = self.fail_next_commits.lock().pop_front() {
            return Err(error);
        }
        self.commits.lock().push(offsets.clone());
        Ok(())
    }

    async fn pause(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.paused.lock().extend_from_slice(partitions);
        Ok(())
    }

    async fn resume(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.resumed.lock().extend_from_slice(partitions);
        Ok(())
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        Ok(!self.missing_topics.lock().iter().any(|t| t == topic))
    }

    fn group_metadata(&self) -> GroupMetadata {
        GroupMetadata::new("test-group")
    }
}

/// Failure injection shared between a factory and its producers.
#[derive(Default)]
pub struct ProducerScenario {
    /// Transactional ids whose next commit reports fencing
    pub fence_commit_ids: Mutex<Vec<String>>,
    /// Transactional ids whose next commit times out
    pub timeout_commit_ids: Mutex<Vec<String>>,
    pub fail_abort: AtomicBool,
    /// Ordered log of every producer operation
    pub journal: Mutex<Vec<String>>,
}

impl ProducerScenario {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    fn log(&self, entry: String) {
        self.journal.lock().push(entry);
    }

    fn take(list: &Mutex<Vec<String>>, id: &str) -> bool {
        let mut list = list.lock();
        match list.iter().position(|entry| entry == id) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }
}

pub struct MockTransactionalProducer {
    id: String,
    scenario: Arc<ProducerScenario>,
}

#[async_trait]
impl TransactionalProducer for MockTransactionalProducer {
    async fn begin_transaction(&self) -> Result<()> {
        self.scenario.log(format!("begin {}", self.id));
        Ok(())
    }

    async fn send(&self, record: Record) -> Result<()> {
        self.scenario
            .log(format!("send {} {}@{}", self.id, record.topic, record.offset));
        Ok(())
    }

    async fn send_offsets_to_transaction(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        group_metadata: &GroupMetadata,
    ) -> Result<()> {
        let mut partitions: Vec<String> = offsets
            .iter()
            .map(|(tp, o)| format!("{}:{}", tp, o.offset))
            .collect();
        partitions.sort();
        self.scenario.log(format!(
            "offsets {} [{}] group={}",
            self.id,
            partitions.join(","),
            group_metadata.group_id
        ));
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        if ProducerScenario::take(&self.scenario.fence_commit_ids, &self.id) {
            self.scenario.log(format!("commit-fenced {}", self.id));
            return Err(RuntimeError::Fenced {
                transactional_id: self.id.clone(),
            });
        }
        if ProducerScenario::take(&self.scenario.timeout_commit_ids, &self.id) {
            self.scenario.log(format!("commit-timeout {}", self.id));
            return Err(RuntimeError::CommitTimeout { timeout_ms: 1 });
        }
        self.scenario.log(format!("commit {}", self.id));
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<()> {
        if self.scenario.fail_abort.load(Ordering::SeqCst) {
            self.scenario.log(format!("abort-failed {}", self.id));
            return Err(RuntimeError::Transaction("Abort failed".to_string()));
        }
        self.scenario.log(format!("abort {}", self.id));
        Ok(())
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.scenario
            .log(format!("close {} {}ms", self.id, timeout.as_millis()));
        Ok(())
    }
}

pub struct MockProducerFactory {
    pub scenario: Arc<ProducerScenario>,
    pub created: Mutex<Vec<TransactionalId>>,
    pub idempotence_seen: Mutex<Vec<bool>>,
}

impl MockProducerFactory {
    pub fn new(scenario: Arc<ProducerScenario>) -> Arc<Self> {
        Arc::new(Self {
            scenario,
            created: Mutex::new(Vec::new()),
            idempotence_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl ProducerFactory for MockProducerFactory {
    async fn create(
        &self,
        transactional_id: &TransactionalId,
        enable_idempotence: bool,
    ) -> Result<Arc<dyn TransactionalProducer>> {
        self.created.lock().push(transactional_id.clone());
        self.idempotence_seen.lock().push(enable_idempotence);
        self.scenario.log(format!("create {transactional_id}"));
        Ok(Arc::new(MockTransactionalProducer {
            id: transactional_id.to_string(),
            scenario: Arc::clone(&self.scenario),
        }))
    }
}
