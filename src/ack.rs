//! Merges out-of-order acknowledgments from concurrent handler completions
//! into ordered, contiguous commit requests, and applies pause/resume
//! backpressure when acks lag behind delivery.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ContainerConfig;
use crate::error::Result;
use crate::handler::{Acknowledgment, AckEvent, BatchAcknowledgment};
use crate::offset_tracker::OffsetTracker;
use crate::types::{AckMode, OffsetAndMetadata, TopicPartition};

/// Per-container acknowledgment coordinator.
///
/// Trackers live behind a sharded map so acknowledgment handles can be
/// created from any task, but all mutation is funneled through the container
/// control task via the ack channel.
pub(crate) struct AckCoordinator {
    trackers: DashMap<TopicPartition, OffsetTracker>,
    ack_tx: mpsc::UnboundedSender<AckEvent>,
    ack_mode: AckMode,
    ack_count: usize,
    ack_time: Duration,
    watermark: usize,
    paused: Mutex<Vec<TopicPartition>>,
    last_commit_at: Mutex<Instant>,
    /// Commit points computed but not yet flushed (a failed commit call puts
    /// them back here so the next cycle retries them)
    unflushed: Mutex<HashMap<TopicPartition, OffsetAndMetadata>>,
}

/// Pause/resume decisions produced by a watermark sweep
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct BackpressureTransitions {
    pub to_pause: Vec<TopicPartition>,
    pub to_resume: Vec<TopicPartition>,
}

impl AckCoordinator {
    pub(crate) fn new(
        config: &ContainerConfig,
        ack_tx: mpsc::UnboundedSender<AckEvent>,
    ) -> Self {
        Self {
            trackers: DashMap::new(),
            ack_tx,
            ack_mode: config.ack_mode,
            ack_count: config.ack_count as usize,
            ack_time: config.ack_time,
            watermark: config.pending_ack_watermark,
            paused: Mutex::new(Vec::new()),
            last_commit_at: Mutex::new(Instant::now()),
            unflushed: Mutex::new(HashMap::new()),
        }
    }

    /// Build the acknowledgment handle handed to a record handler
    pub(crate) fn acknowledgment_for(&self, partition: TopicPartition, offset: u64) -> Acknowledgment {
        Acknowledgment::new(partition, offset, self.ack_tx.clone())
    }

    /// Build the acknowledgment handle handed to a batch handler
    pub(crate) fn batch_acknowledgment_for(
        &self,
        entries: Vec<(TopicPartition, u64)>,
    ) -> BatchAcknowledgment {
        BatchAcknowledgment::new(entries, self.ack_tx.clone())
    }

    /// Register a record as delivered (in flight)
    pub(crate) fn record_delivered(&self, partition: &TopicPartition, offset: u64) -> Result<()> {
        self.trackers
            .entry(partition.clone())
            .or_insert_with(|| OffsetTracker::new(partition.clone()))
            .record_delivered(offset)
    }

    /// Apply one acknowledgment event to its partition tracker
    pub(crate) fn apply(&self, event: &AckEvent) -> Result<()> {
        match self.trackers.get_mut(&event.partition) {
            Some(mut tracker) => tracker.record_acknowledged(event.offset),
            None => Err(crate::error::RuntimeError::UnknownOffset {
                partition: event.partition.to_string(),
                offset: event.offset,
            }),
        }
    }

    /// Whether the configured trigger fires now.
    ///
    /// `batch_boundary` is true at the end of a dispatched batch;
    /// `acks_applied` is true when at least one acknowledgment was applied
    /// since the last check.
    pub(crate) fn should_commit(&self, now: Instant, batch_boundary: bool, acks_applied: bool) -> bool {
        match self.ack_mode {
            AckMode::Record | AckMode::ManualImmediate => acks_applied,
            AckMode::Batch | AckMode::Manual => batch_boundary,
            AckMode::Count => self.total_acked_uncommitted() >= self.ack_count,
            AckMode::Time => self.commit_interval_elapsed(now),
            AckMode::CountTime => {
                self.total_acked_uncommitted() >= self.ack_count
                    || self.commit_interval_elapsed(now)
            }
        }
    }

    fn commit_interval_elapsed(&self, now: Instant) -> bool {
        now.duration_since(*self.last_commit_at.lock()) >= self.ack_time
    }

    /// Commit point for a single partition, pruning its committed prefix and
    /// folding in any point left over from a failed flush
    pub(crate) fn commit_point_for(
        &self,
        partition: &TopicPartition,
    ) -> Option<(TopicPartition, OffsetAndMetadata)> {
        let stashed = self.unflushed.lock().remove(partition);
        let computed = self
            .trackers
            .get_mut(partition)
            .and_then(|mut tracker| tracker.compute_commit_point());
        let point = match (computed, stashed.map(|s| s.offset)) {
            (Some(c), Some(s)) => Some(c.max(s)),
            (Some(c), None) => Some(c),
            (None, Some(s)) => Some(s),
            (None, None) => None,
        }?;
        Some((partition.clone(), OffsetAndMetadata::new(point, None)))
    }

    /// Commit points for every partition that advanced since the last commit,
    /// merged with any points a failed flush left behind
    pub(crate) fn collect_commit_points(&self) -> HashMap<TopicPartition, OffsetAndMetadata> {
        let mut points: HashMap<TopicPartition, OffsetAndMetadata> =
            std::mem::take(&mut *self.unflushed.lock());
        for mut entry in self.trackers.iter_mut() {
            if let Some(point) = entry.value_mut().compute_commit_point() {
                let merged = points
                    .get(entry.key())
                    .map_or(point, |existing| existing.offset.max(point));
                points.insert(entry.key().clone(), OffsetAndMetadata::new(merged, None));
            }
        }
        points
    }

    /// Put commit points back after a failed flush so the next cycle retries
    /// them; commits stay monotonic because merging always keeps the maximum.
    pub(crate) fn stash_unflushed(&self, points: HashMap<TopicPartition, OffsetAndMetadata>) {
        let mut unflushed = self.unflushed.lock();
        for (partition, point) in points {
            match unflushed.get_mut(&partition) {
                Some(existing) if existing.offset >= point.offset => {}
                _ => {
                    unflushed.insert(partition, point);
                }
            }
        }
    }

    /// Record that a commit was flushed, for the Time/CountTime triggers
    pub(crate) fn mark_committed(&self, now: Instant) {
        *self.last_commit_at.lock() = now;
    }

    /// Sweep the watermark: pause partitions whose pending count exceeded it,
    /// resume paused partitions whose head-of-line advanced back within it.
    pub(crate) fn backpressure_transitions(&self) -> BackpressureTransitions {
        let mut transitions = BackpressureTransitions::default();
        let mut paused = self.paused.lock();

        for entry in self.trackers.iter() {
            let partition = entry.key();
            let pending = entry.value().pending_count();
            let is_paused = paused.contains(partition);
            if !is_paused && pending > self.watermark {
                debug!(
                    "Pausing {} with {} pending records over watermark {}",
                    partition, pending, self.watermark
                );
                paused.push(partition.clone());
                transitions.to_pause.push(partition.clone());
            } else if is_paused && pending <= self.watermark {
                debug!("Resuming {} with {} pending records", partition, pending);
                paused.retain(|p| p != partition);
                transitions.to_resume.push(partition.clone());
            }
        }
        transitions
    }

    /// Whether any partition is currently paused by backpressure
    pub(crate) fn any_paused(&self) -> bool {
        !self.paused.lock().is_empty()
    }

    /// Acknowledged-but-uncommitted records across all partitions
    pub(crate) fn total_acked_uncommitted(&self) -> usize {
        self.trackers
            .iter()
            .map(|entry| entry.value().acked_uncommitted_count())
            .sum()
    }

    /// Delivered-but-uncommitted records across all partitions
    pub(crate) fn total_pending(&self) -> usize {
        self.trackers
            .iter()
            .map(|entry| entry.value().pending_count())
            .sum()
    }

    /// Drain every tracker and report delivered offsets that were never
    /// acknowledged; shutdown reporting, never silent dropping.
    pub(crate) fn drain_unacknowledged(&self) -> HashMap<TopicPartition, Vec<u64>> {
        let mut unacked = HashMap::new();
        for mut entry in self.trackers.iter_mut() {
            let offsets = entry.value_mut().take_unacknowledged();
            if !offsets.is_empty() {
                unacked.insert(entry.key().clone(), offsets);
            }
        }
        unacked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(ack_mode: AckMode, watermark: usize) -> (AckCoordinator, mpsc::UnboundedReceiver<AckEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ContainerConfig {
            topics: vec!["events".to_string()],
            ack_mode,
            ack_count: 3,
            ack_time: Duration::from_millis(50),
            pending_ack_watermark: watermark,
            ..Default::default()
        };
        (AckCoordinator::new(&config, tx), rx)
    }

    fn tp(partition: u32) -> TopicPartition {
        TopicPartition::new("events", partition)
    }

    #[tokio::test]
    async fn out_of_order_acks_produce_single_contiguous_commit() {
        let (coordinator, mut rx) = coordinator(AckMode::Batch, 1000);
        for offset in 4..=6 {
            coordinator.record_delivered(&tp(0), offset).unwrap();
        }

        // Handlers complete 5, 6, 4 in that order.
        for offset in [5, 6, 4] {
            coordinator.acknowledgment_for(tp(0), offset).acknowledge();
        }
        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            coordinator.apply(&event).unwrap();
            assert!(coordinator.collect_commit_points().is_empty());
        }
        let event = rx.recv().await.unwrap();
        coordinator.apply(&event).unwrap();

        let points = coordinator.collect_commit_points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[&tp(0)], OffsetAndMetadata::new(7, None));
    }

    #[tokio::test]
    async fn batch_mode_commits_once_per_partition() {
        let (coordinator, mut rx) = coordinator(AckMode::Batch, 1000);
        for partition in 0..3u32 {
            for offset in 0..4u64 {
                coordinator.record_delivered(&tp(partition), offset).unwrap();
                coordinator
                    .acknowledgment_for(tp(partition), offset)
                    .acknowledge();
            }
        }
        for _ in 0..12 {
            let event = rx.recv().await.unwrap();
            coordinator.apply(&event).unwrap();
        }

        let points = coordinator.collect_commit_points();
        assert_eq!(points.len(), 3);
        for partition in 0..3u32 {
            assert_eq!(points[&tp(partition)], OffsetAndMetadata::new(4, None));
        }
        // Nothing advanced since.
        assert!(coordinator.collect_commit_points().is_empty());
    }

    #[test]
    fn count_trigger_fires_at_threshold() {
        let (coordinator, _rx) = coordinator(AckMode::Count, 1000);
        let now = Instant::now();
        for offset in 0..3u64 {
            coordinator.record_delivered(&tp(0), offset).unwrap();
        }
        coordinator
            .apply(&AckEvent {
                partition: tp(0),
                offset: 0,
            })
            .unwrap();
        assert!(!coordinator.should_commit(now, false, true));

        for offset in 1..3u64 {
            coordinator
                .apply(&AckEvent {
                    partition: tp(0),
                    offset,
                })
                .unwrap();
        }
        assert!(coordinator.should_commit(now, false, true));
    }

    #[tokio::test]
    async fn time_trigger_fires_after_interval() {
        tokio::time::pause();
        let (coordinator, _rx) = coordinator(AckMode::Time, 1000);
        assert!(!coordinator.should_commit(Instant::now(), true, true));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(coordinator.should_commit(Instant::now(), false, false));

        coordinator.mark_committed(Instant::now());
        assert!(!coordinator.should_commit(Instant::now(), true, true));
    }

    #[test]
    fn watermark_pauses_and_resumes() {
        let (coordinator, _rx) = coordinator(AckMode::Batch, 2);
        for offset in 0..4u64 {
            coordinator.record_delivered(&tp(0), offset).unwrap();
        }

        let transitions = coordinator.backpressure_transitions();
        assert_eq!(transitions.to_pause, vec![tp(0)]);
        assert!(transitions.to_resume.is_empty());
        assert!(coordinator.any_paused());

        // Same state: no duplicate pause.
        assert_eq!(coordinator.backpressure_transitions(), BackpressureTransitions::default());

        // Head of line advances once the prefix commits.
        for offset in 0..3u64 {
            coordinator
                .apply(&AckEvent {
                    partition: tp(0),
                    offset,
                })
                .unwrap();
        }
        coordinator.collect_commit_points();
        let transitions = coordinator.backpressure_transitions();
        assert_eq!(transitions.to_resume, vec![tp(0)]);
        assert!(!coordinator.any_paused());
    }

    #[test]
    fn stashed_points_survive_into_next_collect() {
        let (coordinator, _rx) = coordinator(AckMode::Batch, 1000);
        coordinator.record_delivered(&tp(0), 0).unwrap();
        coordinator
            .apply(&AckEvent {
                partition: tp(0),
                offset: 0,
            })
            .unwrap();

        let points = coordinator.collect_commit_points();
        assert_eq!(points[&tp(0)], OffsetAndMetadata::new(1, None));

        // The flush failed; the point comes back on the next collect, merged
        // with whatever advanced since.
        coordinator.stash_unflushed(points);
        coordinator.record_delivered(&tp(0), 1).unwrap();
        coordinator
            .apply(&AckEvent {
                partition: tp(0),
                offset: 1,
            })
            .unwrap();
        let retried = coordinator.collect_commit_points();
        assert_eq!(retried[&tp(0)], OffsetAndMetadata::new(2, None));
        assert!(coordinator.collect_commit_points().is_empty());
    }

    #[test]
    fn drain_reports_unacknowledged_offsets() {
        let (coordinator, _rx) = coordinator(AckMode::Manual, 1000);
        for offset in 0..4u64 {
            coordinator.record_delivered(&tp(0), offset).unwrap();
        }
        for offset in 0..2u64 {
            coordinator
                .apply(&AckEvent {
                    partition: tp(0),
                    offset,
                })
                .unwrap();
        }

        let unacked = coordinator.drain_unacknowledged();
        assert_eq!(unacked[&tp(0)], vec![2, 3]);
        assert_eq!(coordinator.total_pending(), 0);
    }
}
