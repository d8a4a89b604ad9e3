//! Transactional producer pool.
//!
//! Producer re-initialization with the broker is costly, so idle handles are
//! cached and reused per logical transactional-id prefix. Each live handle
//! carries a unique `prefix + suffix` identity; suffixes are bounded,
//! allocated lowest-first, and recycled only after the departing handle has
//! finished closing.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{ProducerFactory, TransactionalProducer};
use crate::config::PoolConfig;
use crate::error::{Result, RuntimeError};
use crate::types::{GroupMetadata, OffsetAndMetadata, Record, TopicPartition, TransactionalId};

/// A borrowed transactional producer handle.
///
/// Owned exclusively by the pool; borrowers must hand it back through
/// [`ProducerPool::release`] or one of the close paths.
pub struct PooledProducer {
    id: TransactionalId,
    producer: Arc<dyn TransactionalProducer>,
    fenced: AtomicBool,
    last_used: Instant,
}

impl std::fmt::Debug for PooledProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledProducer")
            .field("id", &self.id)
            .field("fenced", &self.fenced)
            .field("last_used", &self.last_used)
            .finish_non_exhaustive()
    }
}

impl PooledProducer {
    fn new(id: TransactionalId, producer: Arc<dyn TransactionalProducer>) -> Self {
        Self {
            id,
            producer,
            fenced: AtomicBool::new(false),
            last_used: Instant::now(),
        }
    }

    /// The unique transactional identity of this handle
    pub fn transactional_id(&self) -> &TransactionalId {
        &self.id
    }

    /// Whether an operation on this handle reported a fencing condition
    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::Acquire)
    }

    fn observe<T>(&self, result: &Result<T>) {
        if let Err(error) = result {
            if error.is_fenced() {
                self.fenced.store(true, Ordering::Release);
            }
        }
    }

    pub async fn begin_transaction(&self) -> Result<()> {
        let result = self.producer.begin_transaction().await;
        self.observe(&result);
        result
    }

    pub async fn send(&self, record: Record) -> Result<()> {
        let result = self.producer.send(record).await;
        self.observe(&result);
        result
    }

    pub async fn send_offsets_to_transaction(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        group_metadata: &GroupMetadata,
    ) -> Result<()> {
        let result = self
            .producer
            .send_offsets_to_transaction(offsets, group_metadata)
            .await;
        self.observe(&result);
        result
    }

    pub async fn commit_transaction(&self) -> Result<()> {
        let result = self.producer.commit_transaction().await;
        self.observe(&result);
        result
    }

    pub async fn abort_transaction(&self) -> Result<()> {
        self.producer.abort_transaction().await
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.producer.close(timeout).await
    }
}

/// Released numeric suffixes for one logical prefix, lowest reused first
#[derive(Debug)]
struct SuffixCache {
    released: BTreeSet<u32>,
    next_fresh: u32,
    bound: u32,
}

impl SuffixCache {
    fn new(bound: u32) -> Self {
        Self {
            released: BTreeSet::new(),
            next_fresh: 0,
            bound,
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        if let Some(suffix) = self.released.pop_first() {
            return Some(suffix);
        }
        if self.next_fresh < self.bound {
            let suffix = self.next_fresh;
            self.next_fresh += 1;
            return Some(suffix);
        }
        None
    }

    fn release(&mut self, suffix: u32) {
        debug_assert!(suffix < self.bound);
        self.released.insert(suffix);
    }
}

struct PrefixState {
    idle: VecDeque<PooledProducer>,
    suffixes: SuffixCache,
}

impl PrefixState {
    fn new(bound: u32) -> Self {
        Self {
            idle: VecDeque::new(),
            suffixes: SuffixCache::new(bound),
        }
    }
}

struct PoolState {
    closed: bool,
    prefixes: HashMap<String, PrefixState>,
}

struct PoolInner {
    factory: Arc<dyn ProducerFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    returned: Notify,
}

/// Bounded, reusing pool of transactional producer handles.
///
/// Safe for concurrent transaction owners: acquire/release are atomic with
/// respect to suffix allocation and cache mutation.
#[derive(Clone)]
pub struct ProducerPool {
    inner: Arc<PoolInner>,
}

enum AcquirePlan {
    Reuse(PooledProducer),
    Create(TransactionalId),
    Wait,
}

impl ProducerPool {
    pub fn new(factory: Arc<dyn ProducerFactory>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    closed: false,
                    prefixes: HashMap::new(),
                }),
                returned: Notify::new(),
            }),
        })
    }

    /// Borrow a producer for the given logical prefix.
    ///
    /// Reuses a cached idle handle when one exists; otherwise allocates the
    /// lowest available suffix and creates a fresh transaction-initialized
    /// producer. When the suffix space is exhausted the call waits, bounded
    /// by `acquire_timeout`, for a handle to come back.
    pub async fn acquire(&self, prefix: &str) -> Result<PooledProducer> {
        let deadline = Instant::now() + self.inner.config.acquire_timeout;
        loop {
            let plan = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(RuntimeError::PoolClosed);
                }
                let bound = self.inner.config.max_suffixes;
                let prefix_state = state
                    .prefixes
                    .entry(prefix.to_string())
                    .or_insert_with(|| PrefixState::new(bound));
                if let Some(handle) = prefix_state.idle.pop_front() {
                    AcquirePlan::Reuse(handle)
                } else if let Some(suffix) = prefix_state.suffixes.allocate() {
                    AcquirePlan::Create(TransactionalId::new(prefix, suffix))
                } else {
                    AcquirePlan::Wait
                }
            };

            match plan {
                AcquirePlan::Reuse(mut handle) => {
                    handle.last_used = Instant::now();
                    debug!("Reusing cached producer {}", handle.id);
                    return Ok(handle);
                }
                AcquirePlan::Create(id) => {
                    let enable_idempotence = self.inner.config.idempotence_enabled();
                    match self.inner.factory.create(&id, enable_idempotence).await {
                        Ok(producer) => {
                            info!("Created transactional producer {}", id);
                            return Ok(PooledProducer::new(id, producer));
                        }
                        Err(error) => {
                            self.return_suffix(&id);
                            return Err(error);
                        }
                    }
                }
                AcquirePlan::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RuntimeError::ResourceExhausted(format!(
                            "No transactional id available for prefix '{prefix}' within {:?}",
                            self.inner.config.acquire_timeout
                        )));
                    }
                    let _ = tokio::time::timeout(
                        deadline - now,
                        self.inner.returned.notified(),
                    )
                    .await;
                }
            }
        }
    }

    /// Return a handle to the idle cache for its prefix.
    ///
    /// Fenced handles are never cached: they are discarded. Beyond the cache
    /// capacity the handle is closed immediately and its suffix recycled.
    pub async fn release(&self, handle: PooledProducer) -> Result<()> {
        if handle.is_fenced() {
            warn!("Fenced producer {} handed to release; discarding", handle.id);
            return self.discard(handle).await;
        }

        let overflow = {
            let mut state = self.inner.state.lock();
            if state.closed {
                Some(handle)
            } else {
                let bound = self.inner.config.max_suffixes;
                let prefix_state = state
                    .prefixes
                    .entry(handle.id.prefix().to_string())
                    .or_insert_with(|| PrefixState::new(bound));
                if prefix_state.idle.len() < self.inner.config.cache_capacity {
                    let mut handle = handle;
                    handle.last_used = Instant::now();
                    debug!("Caching idle producer {}", handle.id);
                    prefix_state.idle.push_back(handle);
                    None
                } else {
                    Some(handle)
                }
            }
        };

        match overflow {
            None => {
                self.inner.returned.notify_one();
                Ok(())
            }
            Some(handle) => {
                debug!("Idle cache full; closing producer {}", handle.id);
                self.close_and_recycle(handle, self.inner.config.close_timeout)
                    .await
            }
        }
    }

    /// Close a handle that must not be reused (fenced or otherwise dead) and
    /// recycle its suffix once the close has completed.
    pub async fn discard(&self, handle: PooledProducer) -> Result<()> {
        self.close_and_recycle(handle, self.inner.config.close_timeout)
            .await
    }

    /// Close a handle with the near-zero timeout, for use after a commit
    /// timeout where a graceful close would block the dispatch task.
    pub async fn quick_close(&self, handle: PooledProducer) -> Result<()> {
        self.close_and_recycle(handle, self.inner.config.quick_close_timeout)
            .await
    }

    async fn close_and_recycle(&self, handle: PooledProducer, timeout: Duration) -> Result<()> {
        if let Err(error) = handle.close(timeout).await {
            warn!("Closing producer {} failed: {}", handle.id, error);
        }
        // The suffix only becomes reissuable once the close has completed.
        self.return_suffix(&handle.id);
        Ok(())
    }

    fn return_suffix(&self, id: &TransactionalId) {
        let mut state = self.inner.state.lock();
        if let Some(prefix_state) = state.prefixes.get_mut(id.prefix()) {
            prefix_state.suffixes.release(id.suffix());
        }
        drop(state);
        self.inner.returned.notify_one();
    }

    /// Tear the pool down: close every cached handle for every prefix.
    /// Subsequent `acquire` calls fail with `PoolClosed`.
    pub async fn close(&self) -> Result<()> {
        let handles: Vec<PooledProducer> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state
                .prefixes
                .values_mut()
                .flat_map(|p| p.idle.drain(..))
                .collect()
        };

        info!("Closing producer pool with {} cached handles", handles.len());
        let timeout = self.inner.config.close_timeout;
        let closes = handles.into_iter().map(|handle| async move {
            let result = handle.close(timeout).await;
            (handle.id, result)
        });
        for (id, result) in futures::future::join_all(closes).await {
            if let Err(error) = result {
                warn!("Closing producer {} failed during teardown: {}", id, error);
            }
        }
        self.inner.returned.notify_waiters();
        Ok(())
    }

    /// Idle handles currently cached for a prefix
    pub fn cached_count(&self, prefix: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .prefixes
            .get(prefix)
            .map(|p| p.idle.len())
            .unwrap_or(0)
    }
}
