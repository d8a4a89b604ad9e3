//! Explicit transaction contexts.
//!
//! There is no ambient "current transaction" lookup: a context is created at
//! the outermost boundary and passed down the call chain. Nesting is an
//! explicit tagged scope — an outer transaction owns the commit, an inner one
//! either participates in it or suspends it with its own producer.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::{Result, RuntimeError};
use crate::pool::{PooledProducer, ProducerPool};
use crate::types::{GroupMetadata, OffsetAndMetadata, Record, TopicPartition};

/// How a context relates to its enclosing transaction, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionScope {
    /// Outermost transaction; owns begin and commit
    New,

    /// Inner transaction that suspended its parent and runs on its own
    /// producer; owns its own commit
    NestedSuspended,

    /// Inner scope riding on the parent's transaction; the parent owns the
    /// commit
    Participating,
}

/// A live transaction bound to a pooled producer.
///
/// `Participating` contexts share the owner's producer; they must be dropped
/// before the owner completes.
pub struct TransactionContext {
    scope: TransactionScope,
    producer: Arc<PooledProducer>,
}

impl TransactionContext {
    /// Begin an outermost transaction on a freshly borrowed producer
    pub async fn begin(pool: &ProducerPool, prefix: &str) -> Result<Self> {
        Self::begin_with_scope(pool, prefix, TransactionScope::New).await
    }

    /// Suspend `_outer` and begin an independent inner transaction on its own
    /// borrowed producer
    pub async fn begin_nested(
        pool: &ProducerPool,
        prefix: &str,
        _outer: &TransactionContext,
    ) -> Result<Self> {
        Self::begin_with_scope(pool, prefix, TransactionScope::NestedSuspended).await
    }

    async fn begin_with_scope(
        pool: &ProducerPool,
        prefix: &str,
        scope: TransactionScope,
    ) -> Result<Self> {
        let handle = pool.acquire(prefix).await?;
        if let Err(begin_error) = handle.begin_transaction().await {
            if handle.is_fenced() {
                pool.discard(handle).await?;
            } else {
                pool.release(handle).await?;
            }
            return Err(begin_error);
        }
        debug!("Began {:?} transaction on {}", scope, handle.transactional_id());
        Ok(Self {
            scope,
            producer: Arc::new(handle),
        })
    }

    /// Join this transaction as an inner participating scope
    pub fn join(&self) -> Self {
        Self {
            scope: TransactionScope::Participating,
            producer: Arc::clone(&self.producer),
        }
    }

    pub fn scope(&self) -> TransactionScope {
        self.scope
    }

    /// Send a record inside the transaction
    pub async fn send(&self, record: Record) -> Result<()> {
        self.producer.send(record).await
    }

    /// Attach consumed offsets to the transaction
    pub async fn send_offsets(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        group_metadata: &GroupMetadata,
    ) -> Result<()> {
        self.producer
            .send_offsets_to_transaction(offsets, group_metadata)
            .await
    }

    /// Commit the transaction and hand the producer back to the pool.
    ///
    /// `Participating` scopes complete as a no-op: the owner commits.
    /// Fencing aborts best-effort and surfaces the original error; a commit
    /// timeout quick-closes the handle instead of blocking on a graceful
    /// close.
    pub async fn commit(self, pool: &ProducerPool) -> Result<()> {
        let handle = match self.into_owned_handle()? {
            Some(handle) => handle,
            None => return Ok(()),
        };

        match handle.commit_transaction().await {
            Ok(()) => pool.release(handle).await,
            Err(error @ RuntimeError::CommitTimeout { .. }) => {
                warn!(
                    "Commit on {} timed out; quick-closing",
                    handle.transactional_id()
                );
                pool.quick_close(handle).await?;
                Err(error)
            }
            Err(error) => Self::abort_after_failure(pool, handle, error).await,
        }
    }

    /// Abort the transaction and hand the producer back to the pool.
    pub async fn abort(self, pool: &ProducerPool) -> Result<()> {
        let handle = match self.into_owned_handle()? {
            Some(handle) => handle,
            None => return Ok(()),
        };

        match handle.abort_transaction().await {
            Ok(()) if !handle.is_fenced() => pool.release(handle).await,
            Ok(()) => pool.discard(handle).await,
            Err(abort_error) => {
                warn!(
                    "Abort on {} failed: {}",
                    handle.transactional_id(),
                    abort_error
                );
                pool.discard(handle).await?;
                Err(abort_error)
            }
        }
    }

    /// Recover the uniquely-owned handle, or `None` for participating scopes.
    ///
    /// Fails when participating clones outlive their owner: inner scopes must
    /// end before the outer transaction completes.
    fn into_owned_handle(self) -> Result<Option<PooledProducer>> {
        if self.scope == TransactionScope::Participating {
            return Ok(None);
        }
        Arc::try_unwrap(self.producer).map(Some).map_err(|_| {
            RuntimeError::Transaction(
                "Participating scopes still alive at transaction completion".to_string(),
            )
        })
    }

    async fn abort_after_failure(
        pool: &ProducerPool,
        handle: PooledProducer,
        original: RuntimeError,
    ) -> Result<()> {
        // The original failure is what the caller must see; an abort failure
        // on an already-doomed transaction is logged and suppressed.
        if let Err(abort_error) = handle.abort_transaction().await {
            error!(
                "Abort after failed commit on {} also failed (suppressed): {}",
                handle.transactional_id(),
                abort_error
            );
        }
        if handle.is_fenced() {
            pool.discard(handle).await?;
        } else {
            pool.release(handle).await?;
        }
        Err(original)
    }
}

/// Commits consumed offsets under an exactly-once transaction, borrowing a
/// producer from the pool for the duration of one commit unit.
pub struct TransactionalCommitter {
    pool: ProducerPool,
    prefix: String,
}

impl TransactionalCommitter {
    pub fn new(pool: ProducerPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    pub fn pool(&self) -> &ProducerPool {
        &self.pool
    }

    /// Run one begin → send-offsets → commit unit.
    pub async fn commit_offsets(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        group_metadata: &GroupMetadata,
    ) -> Result<()> {
        let ctx = TransactionContext::begin(&self.pool, &self.prefix).await?;
        if let Err(send_error) = ctx.send_offsets(offsets, group_metadata).await {
            // Surface the send failure; the abort outcome is secondary.
            let _ = ctx.abort(&self.pool).await;
            return Err(send_error);
        }
        ctx.commit(&self.pool).await
    }
}
