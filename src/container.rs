//! Message container: one sequential control task running the
//! poll → dispatch → commit loop against a broker client.
//!
//! The broker consumer handle is only ever touched from the control task;
//! handler execution runs inline or on worker tasks per `DispatchMode`.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ack::AckCoordinator;
use crate::broker::{BrokerClient, RebalanceListener};
use crate::config::{ContainerConfig, DispatchMode};
use crate::error::{Result, RuntimeError};
use crate::handler::{
    AckEvent, BatchHandler, ErrorDisposition, ErrorPolicy, Handler, LoggingErrorPolicy,
    RecordHandler, RecordInterceptor,
};
use crate::txn::TransactionalCommitter;
use crate::types::{
    AckMode, ContainerEvent, OffsetAndMetadata, Record, StopMode, TopicPartition,
};

/// Lifecycle states of the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Starting,
    Polling,
    Dispatching,
    Committing,
    Stopping,
    Stopped,
    /// Terminal: configured required topics were absent at startup
    MissingTopicsFatal,
}

/// Container performance counters
#[derive(Debug, Default)]
pub struct ContainerMetrics {
    pub polls: AtomicU64,
    pub records_received: AtomicU64,
    pub records_acknowledged: AtomicU64,
    pub commits: AtomicU64,
    pub commit_failures: AtomicU64,
    pub handler_errors: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerMetricsSnapshot {
    pub polls: u64,
    pub records_received: u64,
    pub records_acknowledged: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub handler_errors: u64,
}

impl ContainerMetrics {
    pub fn snapshot(&self) -> ContainerMetricsSnapshot {
        ContainerMetricsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            records_acknowledged: self.records_acknowledged.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// What was left outstanding when the container stopped.
///
/// Nothing is silently dropped: records never dispatched and offsets
/// delivered but never acknowledged are both reported for external recovery.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Records fetched but never handed to the handler (immediate stop)
    pub undispatched: Vec<Record>,

    /// Delivered offsets that were never acknowledged, per partition
    pub unacknowledged: HashMap<TopicPartition, Vec<u64>>,

    /// Terminal error, when the container stopped on its own
    pub error: Option<RuntimeError>,
}

impl StopReport {
    /// Total records left outstanding
    pub fn total_outstanding(&self) -> usize {
        self.undispatched.len() + self.unacknowledged.values().map(Vec::len).sum::<usize>()
    }
}

/// Builder for message containers
pub struct ContainerBuilder {
    client: Option<Arc<dyn BrokerClient>>,
    handler: Option<Handler>,
    config: Option<ContainerConfig>,
    interceptors: Vec<Arc<dyn RecordInterceptor>>,
    error_policy: Option<Arc<dyn ErrorPolicy>>,
    committer: Option<TransactionalCommitter>,
    rebalance_listener: Option<Arc<dyn RebalanceListener>>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            handler: None,
            config: None,
            interceptors: Vec::new(),
            error_policy: None,
            committer: None,
            rebalance_listener: None,
        }
    }

    /// Set the broker client
    pub fn client(mut self, client: Arc<dyn BrokerClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Dispatch one record at a time to the given handler
    pub fn record_handler(mut self, handler: Arc<dyn RecordHandler>) -> Self {
        self.handler = Some(Handler::Record(handler));
        self
    }

    /// Dispatch whole poll results to the given handler
    pub fn batch_handler(mut self, handler: Arc<dyn BatchHandler>) -> Self {
        self.handler = Some(Handler::Batch(handler));
        self
    }

    /// Set container configuration
    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Append an interceptor; interceptors run in the order they were added
    pub fn interceptor(mut self, interceptor: Arc<dyn RecordInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Set the handler-failure policy
    pub fn error_policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.error_policy = Some(policy);
        self
    }

    /// Commit offsets under exactly-once transactions through the given
    /// committer instead of plain consumer commits
    pub fn transactional(mut self, committer: TransactionalCommitter) -> Self {
        self.committer = Some(committer);
        self
    }

    /// Observe partition assignment changes from the group protocol
    pub fn rebalance_listener(mut self, listener: Arc<dyn RebalanceListener>) -> Self {
        self.rebalance_listener = Some(listener);
        self
    }

    /// Build the container
    pub fn build(self) -> Result<MessageContainer> {
        let client = self
            .client
            .ok_or_else(|| RuntimeError::InvalidConfig("Broker client is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| RuntimeError::InvalidConfig("Handler is required".to_string()))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let id = config
            .container_id
            .clone()
            .unwrap_or_else(|| format!("container-{}", Uuid::new_v4()));

        Ok(MessageContainer {
            id,
            client,
            handler,
            config,
            interceptors: self.interceptors,
            error_policy: self
                .error_policy
                .unwrap_or_else(|| Arc::new(LoggingErrorPolicy)),
            committer: self.committer,
            rebalance_listener: self.rebalance_listener,
        })
    }
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured, not-yet-started container
pub struct MessageContainer {
    id: String,
    client: Arc<dyn BrokerClient>,
    handler: Handler,
    config: ContainerConfig,
    interceptors: Vec<Arc<dyn RecordInterceptor>>,
    error_policy: Arc<dyn ErrorPolicy>,
    committer: Option<TransactionalCommitter>,
    rebalance_listener: Option<Arc<dyn RebalanceListener>>,
}

impl MessageContainer {
    /// Create a new container builder
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    /// Spawn the control task and return a handle to it
    pub fn start(self) -> ContainerHandle {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(64);
        let coordinator = AckCoordinator::new(&self.config, ack_tx);
        let state = Arc::new(RwLock::new(ContainerState::Starting));
        let metrics = Arc::new(ContainerMetrics::default());
        let cancel = CancellationToken::new();
        let stop_mode_override = Arc::new(Mutex::new(None));
        let shutdown_timeout = self.config.shutdown_timeout;
        let id = self.id.clone();

        let control = ControlLoop {
            id: self.id,
            client: self.client,
            handler: self.handler,
            config: self.config,
            interceptors: self.interceptors,
            error_policy: self.error_policy,
            committer: self.committer,
            rebalance_listener: self.rebalance_listener,
            coordinator,
            ack_rx,
            cancel: cancel.clone(),
            stop_mode_override: Arc::clone(&stop_mode_override),
            state: Arc::clone(&state),
            metrics: Arc::clone(&metrics),
            events: event_tx.clone(),
            last_records_at: Instant::now(),
            last_idle_emit: None,
            saw_data: false,
            report: StopReport::default(),
        };

        let join = tokio::spawn(control.run());
        info!("Started container {}", id);

        ContainerHandle {
            id,
            cancel,
            stop_mode_override,
            join,
            state,
            metrics,
            events: event_tx,
            shutdown_timeout,
        }
    }
}

/// Handle to a running container
pub struct ContainerHandle {
    id: String,
    cancel: CancellationToken,
    stop_mode_override: Arc<Mutex<Option<StopMode>>>,
    join: tokio::task::JoinHandle<StopReport>,
    state: Arc<RwLock<ContainerState>>,
    metrics: Arc<ContainerMetrics>,
    events: broadcast::Sender<ContainerEvent>,
    shutdown_timeout: std::time::Duration,
}

impl ContainerHandle {
    /// The container id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContainerState {
        *self.state.read()
    }

    /// Shared counters
    pub fn metrics(&self) -> Arc<ContainerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Subscribe to lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events.subscribe()
    }

    /// Request a stop with the given mode and wait for the control task,
    /// bounded by the configured shutdown timeout.
    pub async fn stop(self, mode: StopMode) -> Result<StopReport> {
        *self.stop_mode_override.lock() = Some(mode);
        self.cancel.cancel();
        let timeout_ms = self.shutdown_timeout.as_millis() as u64;
        match tokio::time::timeout(self.shutdown_timeout, self.join).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(join_error)) => {
                error!("Container {} control task failed: {}", self.id, join_error);
                Err(RuntimeError::ContainerStopped)
            }
            Err(_) => Err(RuntimeError::ShutdownTimeout { timeout_ms }),
        }
    }

    /// Wait for the container to stop on its own (fatal error or missing
    /// topics), returning its report.
    pub async fn wait(self) -> Result<StopReport> {
        self.join.await.map_err(|join_error| {
            error!("Container {} control task failed: {}", self.id, join_error);
            RuntimeError::ContainerStopped
        })
    }
}

struct ControlLoop {
    id: String,
    client: Arc<dyn BrokerClient>,
    handler: Handler,
    config: ContainerConfig,
    interceptors: Vec<Arc<dyn RecordInterceptor>>,
    error_policy: Arc<dyn ErrorPolicy>,
    committer: Option<TransactionalCommitter>,
    rebalance_listener: Option<Arc<dyn RebalanceListener>>,
    coordinator: AckCoordinator,
    ack_rx: mpsc::UnboundedReceiver<AckEvent>,
    cancel: CancellationToken,
    stop_mode_override: Arc<Mutex<Option<StopMode>>>,
    state: Arc<RwLock<ContainerState>>,
    metrics: Arc<ContainerMetrics>,
    events: broadcast::Sender<ContainerEvent>,
    last_records_at: Instant,
    last_idle_emit: Option<Instant>,
    saw_data: bool,
    report: StopReport,
}

impl ControlLoop {
    async fn run(mut self) -> StopReport {
        self.set_state(ContainerState::Starting);
        if let Err(startup_error) = self.start_up().await {
            let terminal = if matches!(startup_error, RuntimeError::MissingTopics(_)) {
                ContainerState::MissingTopicsFatal
            } else {
                ContainerState::Stopped
            };
            error!("Container {} failed to start: {}", self.id, startup_error);
            self.emit(ContainerEvent::Failed(startup_error.to_string()));
            self.report.error = Some(startup_error);
            self.set_state(terminal);
            return self.report;
        }
        self.emit(ContainerEvent::Started);

        let fatal = loop {
            if self.should_stop() {
                break None;
            }
            match self.cycle().await {
                Ok(()) => {}
                Err(error) => break Some(error),
            }
        };

        self.shutdown(fatal).await;
        self.report
    }

    async fn start_up(&self) -> Result<()> {
        if self.config.missing_topics_fatal {
            let mut missing = Vec::new();
            for topic in &self.config.topics {
                if !self.client.topic_exists(topic).await? {
                    missing.push(topic.clone());
                }
            }
            if !missing.is_empty() {
                return Err(RuntimeError::MissingTopics(missing));
            }
        }
        self.client
            .subscribe(&self.config.topics, self.rebalance_listener.clone())
            .await
    }

    /// One poll → dispatch → commit cycle
    async fn cycle(&mut self) -> Result<()> {
        self.set_state(ContainerState::Polling);
        let poll_timeout = if self.coordinator.any_paused() {
            self.config.paused_poll_timeout
        } else {
            self.config.poll_timeout
        };

        let polled = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.client.poll(poll_timeout) => Some(result),
        };
        let Some(poll_result) = polled else {
            // Stop observed mid-poll; the checkpoint after poll handles it.
            return Ok(());
        };
        self.metrics.polls.fetch_add(1, Ordering::Relaxed);

        let records = match poll_result {
            Ok(records) => records,
            Err(error) if error.is_retryable() => {
                warn!("Poll failed on container {}: {}", self.id, error);
                Vec::new()
            }
            Err(error) => return Err(error),
        };

        if records.is_empty() {
            self.note_idle();
        } else {
            self.last_records_at = Instant::now();
            self.last_idle_emit = None;
            self.saw_data = true;
            self.metrics
                .records_received
                .fetch_add(records.len() as u64, Ordering::Relaxed);

            self.set_state(ContainerState::Dispatching);
            let handler = self.handler.clone();
            match handler {
                Handler::Record(handler) => match self.config.dispatch {
                    DispatchMode::Inline => self.dispatch_inline(handler, records).await?,
                    DispatchMode::Concurrent { max_in_flight } => {
                        self.dispatch_concurrent(handler, records, max_in_flight)
                            .await?
                    }
                },
                Handler::Batch(handler) => self.dispatch_batches(handler, records).await?,
            }
        }

        self.set_state(ContainerState::Committing);
        self.apply_acks().await?;
        if self.coordinator.should_commit(Instant::now(), true, false) {
            let points = self.coordinator.collect_commit_points();
            self.flush_commit(points).await?;
        }

        self.apply_backpressure().await;

        if !self.config.idle_between_polls.is_zero() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.idle_between_polls) => {}
            }
        }
        Ok(())
    }

    /// Run the handler inline on the control task, one record at a time
    async fn dispatch_inline(
        &mut self,
        handler: Arc<dyn RecordHandler>,
        records: Vec<Record>,
    ) -> Result<()> {
        let mut queue: VecDeque<Record> = records.into();
        while let Some(record) = queue.pop_front() {
            if self.should_stop() && self.effective_stop_mode() == StopMode::Immediate {
                self.report.undispatched.push(record);
                self.report.undispatched.extend(queue);
                return Ok(());
            }

            let partition = record.topic_partition();
            let offset = record.offset;
            self.coordinator.record_delivered(&partition, offset)?;

            let Some(record) = self.run_interceptors(record) else {
                self.acknowledge_skipped(&partition, offset);
                continue;
            };

            let ack = self.coordinator.acknowledgment_for(partition, offset);
            match handler.handle(record.clone(), ack.clone()).await {
                Ok(()) => {
                    for interceptor in &self.interceptors {
                        interceptor.on_success(&record);
                    }
                    if self.config.ack_mode.is_auto_ack() {
                        ack.acknowledge();
                    }
                }
                Err(handler_error) => {
                    let remaining: Vec<Record> = queue.iter().cloned().collect();
                    if self
                        .handle_dispatch_failure(handler_error, &record, &remaining, &ack)
                        .await?
                    {
                        return Ok(());
                    }
                }
            }

            self.apply_acks().await?;
        }
        Ok(())
    }

    /// Offload records to worker tasks, bounded by `max_in_flight`
    async fn dispatch_concurrent(
        &mut self,
        handler: Arc<dyn RecordHandler>,
        records: Vec<Record>,
        max_in_flight: usize,
    ) -> Result<()> {
        let mut queue: VecDeque<Record> = records.into();
        let mut workers: JoinSet<Option<(RuntimeError, Record)>> = JoinSet::new();
        let auto_ack = self.config.ack_mode.is_auto_ack();
        let mut stop_dispatching = false;

        loop {
            if self.should_stop() && self.effective_stop_mode() == StopMode::Immediate {
                self.report.undispatched.extend(queue.drain(..));
                // Outstanding workers are abandoned; their records surface in
                // the unacknowledged report.
                workers.abort_all();
                return Ok(());
            }

            while !stop_dispatching && workers.len() < max_in_flight {
                let Some(record) = queue.pop_front() else {
                    break;
                };
                let partition = record.topic_partition();
                let offset = record.offset;
                self.coordinator.record_delivered(&partition, offset)?;

                let Some(record) = self.run_interceptors(record) else {
                    self.acknowledge_skipped(&partition, offset);
                    continue;
                };

                let ack = self.coordinator.acknowledgment_for(partition, offset);
                let handler = Arc::clone(&handler);
                workers.spawn(async move {
                    match handler.handle(record.clone(), ack.clone()).await {
                        Ok(()) => {
                            if auto_ack {
                                ack.acknowledge();
                            }
                            None
                        }
                        Err(handler_error) => Some((handler_error, record)),
                    }
                });
            }

            // Wait for the next completion, waking early on a stop request;
            // once cancelled, graceful stops keep draining the in-flight
            // workers while immediate stops are handled at the loop top.
            let waited = tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.cancel.is_cancelled() => None,
                joined = workers.join_next() => Some(joined),
            };
            let Some(joined) = waited else {
                continue;
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok(None) => {}
                Ok(Some((handler_error, record))) => {
                    let remaining: Vec<Record> = queue.iter().cloned().collect();
                    let ack = self
                        .coordinator
                        .acknowledgment_for(record.topic_partition(), record.offset);
                    if self
                        .handle_dispatch_failure(handler_error, &record, &remaining, &ack)
                        .await?
                    {
                        // Retry disposition: the queued remainder stays
                        // undelivered; in-flight workers are still joined.
                        queue.clear();
                        stop_dispatching = true;
                    }
                }
                Err(join_error) => {
                    warn!("Worker task failed on container {}: {}", self.id, join_error);
                }
            }

            self.apply_acks().await?;
        }
        Ok(())
    }

    /// Deliver whole poll results to a batch handler
    async fn dispatch_batches(
        &mut self,
        handler: Arc<dyn BatchHandler>,
        records: Vec<Record>,
    ) -> Result<()> {
        let groups: Vec<Vec<Record>> = if self.config.split_batches_by_partition {
            let mut by_partition: Vec<(TopicPartition, Vec<Record>)> = Vec::new();
            for record in records {
                let partition = record.topic_partition();
                match by_partition.iter_mut().find(|(p, _)| *p == partition) {
                    Some((_, group)) => group.push(record),
                    None => by_partition.push((partition, vec![record])),
                }
            }
            by_partition.into_iter().map(|(_, group)| group).collect()
        } else {
            vec![records]
        };

        let mut groups: VecDeque<Vec<Record>> = groups.into();
        while let Some(group) = groups.pop_front() {
            if self.should_stop() && self.effective_stop_mode() == StopMode::Immediate {
                self.report.undispatched.extend(group);
                self.report
                    .undispatched
                    .extend(groups.into_iter().flatten());
                return Ok(());
            }

            let mut entries = Vec::with_capacity(group.len());
            for record in &group {
                let partition = record.topic_partition();
                self.coordinator.record_delivered(&partition, record.offset)?;
                entries.push((partition, record.offset));
            }

            let ack = self.coordinator.batch_acknowledgment_for(entries);
            match handler.handle_batch(group.clone(), ack.clone()).await {
                Ok(()) => {
                    if self.config.ack_mode.is_auto_ack() {
                        ack.acknowledge();
                    }
                }
                Err(handler_error) => {
                    self.metrics.handler_errors.fetch_add(1, Ordering::Relaxed);
                    let (failed, remaining) = group
                        .split_first()
                        .map(|(f, r)| (f.clone(), r.to_vec()))
                        .unwrap_or_else(|| unreachable!("poll batches are never empty"));
                    match self
                        .error_policy
                        .on_handler_error(handler_error, &failed, &remaining)
                        .await
                    {
                        ErrorDisposition::Skip => ack.acknowledge(),
                        ErrorDisposition::Retry => return Ok(()),
                        ErrorDisposition::Fatal => {
                            return Err(RuntimeError::Handler(format!(
                                "Batch handler failed fatally at {}@{}",
                                failed.topic_partition(),
                                failed.offset
                            )));
                        }
                    }
                }
            }

            self.apply_acks().await?;
        }
        Ok(())
    }

    /// Common failure path for record handlers. Returns `true` when the
    /// current batch dispatch must end (Retry disposition).
    async fn handle_dispatch_failure(
        &mut self,
        handler_error: RuntimeError,
        record: &Record,
        remaining: &[Record],
        ack: &crate::handler::Acknowledgment,
    ) -> Result<bool> {
        self.metrics.handler_errors.fetch_add(1, Ordering::Relaxed);
        for interceptor in &self.interceptors {
            interceptor.on_failure(record, &handler_error);
        }
        match self
            .error_policy
            .on_handler_error(handler_error, record, remaining)
            .await
        {
            ErrorDisposition::Skip => {
                ack.acknowledge();
                Ok(false)
            }
            ErrorDisposition::Retry => Ok(true),
            ErrorDisposition::Fatal => Err(RuntimeError::Handler(format!(
                "Handler failed fatally at {}@{}",
                record.topic_partition(),
                record.offset
            ))),
        }
    }

    fn run_interceptors(&self, record: Record) -> Option<Record> {
        let mut current = record;
        for interceptor in &self.interceptors {
            match interceptor.intercept(current) {
                Some(next) => current = next,
                None => return None,
            }
        }
        Some(current)
    }

    /// A record nulled out by an interceptor still counts as consumed, so it
    /// cannot wedge the commit prefix. The ack goes through the channel like
    /// any other so the per-ack commit modes see it.
    fn acknowledge_skipped(&self, partition: &TopicPartition, offset: u64) {
        self.coordinator
            .acknowledgment_for(partition.clone(), offset)
            .acknowledge();
    }

    /// Drain queued acknowledgments; in the per-ack modes each applied ack
    /// flushes its partition's commit point immediately.
    async fn apply_acks(&mut self) -> Result<()> {
        let per_ack = matches!(
            self.config.ack_mode,
            AckMode::Record | AckMode::ManualImmediate
        );
        while let Ok(event) = self.ack_rx.try_recv() {
            self.coordinator.apply(&event)?;
            self.metrics
                .records_acknowledged
                .fetch_add(1, Ordering::Relaxed);
            if per_ack {
                if let Some((partition, point)) = self.coordinator.commit_point_for(&event.partition)
                {
                    let mut points = HashMap::with_capacity(1);
                    points.insert(partition, point);
                    self.flush_commit(points).await?;
                }
            }
        }
        Ok(())
    }

    /// Flush commit points through the transactional committer or the plain
    /// consumer commit, classifying failures.
    async fn flush_commit(
        &mut self,
        points: HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let result = match &self.committer {
            Some(committer) => {
                let group_metadata = self.client.group_metadata();
                committer.commit_offsets(&points, &group_metadata).await
            }
            None => {
                self.client
                    .commit_sync(&points, self.config.sync_commit_timeout)
                    .await
            }
        };

        match result {
            Ok(()) => {
                self.metrics.commits.fetch_add(1, Ordering::Relaxed);
                self.coordinator.mark_committed(Instant::now());
                debug!("Committed {} partition(s) on container {}", points.len(), self.id);
                Ok(())
            }
            Err(error @ RuntimeError::Fenced { .. }) => {
                self.metrics.commit_failures.fetch_add(1, Ordering::Relaxed);
                self.coordinator.stash_unflushed(points);
                if self.config.fatal_on_fence {
                    Err(error)
                } else {
                    // The pool discarded the fenced handle; the next commit
                    // unit runs on a freshly allocated one.
                    warn!(
                        "Producer fenced on container {}; continuing with a fresh handle: {}",
                        self.id, error
                    );
                    Ok(())
                }
            }
            Err(error) if error.is_retryable() => {
                self.metrics.commit_failures.fetch_add(1, Ordering::Relaxed);
                self.coordinator.stash_unflushed(points);
                warn!("Commit failed on container {}; will retry: {}", self.id, error);
                Ok(())
            }
            Err(error) => {
                self.metrics.commit_failures.fetch_add(1, Ordering::Relaxed);
                self.coordinator.stash_unflushed(points);
                Err(error)
            }
        }
    }

    /// Sweep the watermark and forward pause/resume to the broker client
    async fn apply_backpressure(&mut self) {
        let transitions = self.coordinator.backpressure_transitions();
        if !transitions.to_pause.is_empty() {
            if let Err(error) = self.client.pause(&transitions.to_pause).await {
                warn!("Pause failed on container {}: {}", self.id, error);
            }
            self.emit(ContainerEvent::PartitionsPaused(transitions.to_pause));
        }
        if !transitions.to_resume.is_empty() {
            if let Err(error) = self.client.resume(&transitions.to_resume).await {
                warn!("Resume failed on container {}: {}", self.id, error);
            }
            self.emit(ContainerEvent::PartitionsResumed(transitions.to_resume));
        }
    }

    fn note_idle(&mut self) {
        let Some(interval) = self.config.idle_event_interval else {
            return;
        };
        let effective = if self.saw_data {
            interval
        } else {
            interval.mul_f64(self.config.idle_before_data_multiplier)
        };
        let now = Instant::now();
        let idle_for = now.duration_since(self.last_records_at);
        let due = idle_for >= effective
            && self
                .last_idle_emit
                .map_or(true, |last| now.duration_since(last) >= effective);
        if due {
            self.last_idle_emit = Some(now);
            self.emit(ContainerEvent::Idle {
                idle_for_ms: idle_for.as_millis() as u64,
            });
        }
    }

    /// Final drain, one last commit attempt, and the outstanding-work report
    async fn shutdown(&mut self, fatal: Option<RuntimeError>) {
        self.set_state(ContainerState::Stopping);

        // Apply whatever acknowledgments are already known.
        while let Ok(event) = self.ack_rx.try_recv() {
            if let Err(error) = self.coordinator.apply(&event) {
                warn!("Dropping late ack on container {}: {}", self.id, error);
            }
        }
        let points = self.coordinator.collect_commit_points();
        if !points.is_empty() {
            if let Err(error) = self.flush_commit(points).await {
                warn!("Final commit failed on container {}: {}", self.id, error);
            }
        }

        self.report.unacknowledged = self.coordinator.drain_unacknowledged();
        if let Some(error) = fatal {
            error!("Container {} stopped on fatal error: {}", self.id, error);
            self.emit(ContainerEvent::Failed(error.to_string()));
            self.report.error = Some(error);
        } else {
            self.emit(ContainerEvent::Stopped);
        }
        self.set_state(ContainerState::Stopped);
        info!(
            "Container {} stopped with {} outstanding record(s)",
            self.id,
            self.report.total_outstanding()
        );
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn effective_stop_mode(&self) -> StopMode {
        self.stop_mode_override
            .lock()
            .unwrap_or(self.config.stop_mode)
    }

    fn set_state(&self, state: ContainerState) {
        *self.state.write() = state;
    }

    fn emit(&self, event: ContainerEvent) {
        let _ = self.events.send(event);
    }
}
