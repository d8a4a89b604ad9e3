//! Per-partition offset bookkeeping.
//!
//! Tracks delivered-but-uncommitted offsets and computes the contiguous-prefix
//! commit point: the highest offset O for which every tracked offset <= O is
//! acknowledged, committed as O + 1 (broker convention: next offset to read).
//! Commits only ever advance.

use std::collections::BTreeMap;

use crate::error::{Result, RuntimeError};
use crate::types::TopicPartition;

/// Delivered/acknowledged state for one assigned partition.
#[derive(Debug)]
pub struct OffsetTracker {
    partition: TopicPartition,
    /// Delivered offsets in delivery order, with their ack state
    pending: BTreeMap<u64, bool>,
    /// Highest delivered offset, registration monotonicity guard
    last_delivered: Option<u64>,
    /// Last commit point handed out (next offset to read)
    committed_up_to: Option<u64>,
    /// Acknowledged entries still in `pending`
    acked_uncommitted: usize,
}

impl OffsetTracker {
    pub fn new(partition: TopicPartition) -> Self {
        Self {
            partition,
            pending: BTreeMap::new(),
            last_delivered: None,
            committed_up_to: None,
            acked_uncommitted: 0,
        }
    }

    /// Register an offset as in flight.
    ///
    /// Offsets must arrive in increasing order per partition; anything else
    /// is an internal-consistency defect and fails loudly.
    pub fn record_delivered(&mut self, offset: u64) -> Result<()> {
        if let Some(last) = self.last_delivered {
            if offset <= last {
                // Redelivery of a still-pending, unacknowledged offset is the
                // broker re-fetching an uncommitted record; anything else is
                // a logic defect upstream.
                return match self.pending.get(&offset) {
                    Some(false) => {
                        tracing::debug!(
                            "Offset {} redelivered on {} while still pending",
                            offset,
                            self.partition
                        );
                        Ok(())
                    }
                    _ => Err(RuntimeError::MonotonicityViolation {
                        partition: self.partition.to_string(),
                        offset,
                        last,
                    }),
                };
            }
        }
        self.last_delivered = Some(offset);
        self.pending.insert(offset, false);
        Ok(())
    }

    /// Mark an in-flight offset as completed. Acknowledgments may arrive in
    /// any order.
    pub fn record_acknowledged(&mut self, offset: u64) -> Result<()> {
        match self.pending.get_mut(&offset) {
            Some(acked) => {
                if !*acked {
                    *acked = true;
                    self.acked_uncommitted += 1;
                }
                Ok(())
            }
            None => {
                // A duplicate ack for an already-committed offset is benign;
                // an ack for an offset never delivered is not.
                if self.committed_up_to.is_some_and(|c| offset < c) {
                    tracing::debug!(
                        "Ignoring duplicate ack for committed offset {} on {}",
                        offset,
                        self.partition
                    );
                    Ok(())
                } else {
                    Err(RuntimeError::UnknownOffset {
                        partition: self.partition.to_string(),
                        offset,
                    })
                }
            }
        }
    }

    /// Compute the commit point and prune the committed prefix.
    ///
    /// Returns `None` when no acknowledged prefix advanced since the last
    /// commit.
    pub fn compute_commit_point(&mut self) -> Option<u64> {
        let mut highest_contiguous = None;
        while let Some(entry) = self.pending.first_entry() {
            if !*entry.get() {
                break;
            }
            highest_contiguous = Some(*entry.key());
            entry.remove();
            self.acked_uncommitted -= 1;
        }

        let commit_point = highest_contiguous.map(|o| o + 1)?;
        debug_assert!(
            self.committed_up_to.map_or(true, |c| commit_point > c),
            "commit point regressed on {}",
            self.partition
        );
        self.committed_up_to = Some(commit_point);
        Some(commit_point)
    }

    /// Delivered-but-uncommitted records; the backpressure input
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Acknowledged records not yet committed; the Count trigger input
    pub fn acked_uncommitted_count(&self) -> usize {
        self.acked_uncommitted
    }

    /// Oldest uncommitted offset, if any
    pub fn head_of_line(&self) -> Option<u64> {
        self.pending.keys().next().copied()
    }

    /// Last commit point handed out
    pub fn committed_up_to(&self) -> Option<u64> {
        self.committed_up_to
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Drain and return every delivered offset still unacknowledged, for
    /// shutdown reporting.
    pub fn take_unacknowledged(&mut self) -> Vec<u64> {
        let unacked: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, acked)| !**acked)
            .map(|(offset, _)| *offset)
            .collect();
        self.pending.clear();
        self.acked_uncommitted = 0;
        unacked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracker() -> OffsetTracker {
        OffsetTracker::new(TopicPartition::new("events", 0))
    }

    #[test]
    fn in_order_acks_commit_each_time() {
        let mut t = tracker();
        for offset in 0..3 {
            t.record_delivered(offset).unwrap();
        }
        for offset in 0..3 {
            t.record_acknowledged(offset).unwrap();
            assert_eq!(t.compute_commit_point(), Some(offset + 1));
        }
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn out_of_order_acks_commit_only_contiguous_prefix() {
        let mut t = tracker();
        for offset in 4..=6 {
            t.record_delivered(offset).unwrap();
        }

        t.record_acknowledged(5).unwrap();
        t.record_acknowledged(6).unwrap();
        assert_eq!(t.compute_commit_point(), None);

        t.record_acknowledged(4).unwrap();
        assert_eq!(t.compute_commit_point(), Some(7));
        assert_eq!(t.committed_up_to(), Some(7));
    }

    #[test]
    fn no_commit_when_nothing_advanced() {
        let mut t = tracker();
        t.record_delivered(10).unwrap();
        assert_eq!(t.compute_commit_point(), None);
        t.record_acknowledged(10).unwrap();
        assert_eq!(t.compute_commit_point(), Some(11));
        // Nothing new since the last commit.
        assert_eq!(t.compute_commit_point(), None);
    }

    #[test]
    fn non_monotonic_delivery_is_fatal() {
        let mut t = tracker();
        t.record_delivered(5).unwrap();
        t.record_acknowledged(5).unwrap();
        // Re-registering an acknowledged offset is a defect, not redelivery.
        let err = t.record_delivered(5).unwrap_err();
        assert!(matches!(err, RuntimeError::MonotonicityViolation { .. }));
        let err = t.record_delivered(3).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::MonotonicityViolation {
                offset: 3,
                last: 5,
                ..
            }
        ));
    }

    #[test]
    fn redelivery_of_pending_offset_is_tolerated() {
        let mut t = tracker();
        t.record_delivered(5).unwrap();
        // The broker re-fetched the uncommitted record.
        t.record_delivered(5).unwrap();
        assert_eq!(t.pending_count(), 1);

        t.record_acknowledged(5).unwrap();
        assert_eq!(t.compute_commit_point(), Some(6));
    }

    #[test]
    fn unknown_ack_is_fatal_but_committed_duplicate_is_not() {
        let mut t = tracker();
        t.record_delivered(0).unwrap();
        t.record_acknowledged(0).unwrap();
        assert_eq!(t.compute_commit_point(), Some(1));

        // Late duplicate for an already-committed offset.
        assert!(t.record_acknowledged(0).is_ok());
        // Never-delivered offset.
        assert!(matches!(
            t.record_acknowledged(17),
            Err(RuntimeError::UnknownOffset { offset: 17, .. })
        ));
    }

    #[test]
    fn gaps_in_delivered_offsets_are_contiguous_by_tracked_range() {
        // Compacted topics deliver non-consecutive offsets; contiguity is
        // over the tracked range, not the integers.
        let mut t = tracker();
        t.record_delivered(3).unwrap();
        t.record_delivered(7).unwrap();
        t.record_acknowledged(3).unwrap();
        t.record_acknowledged(7).unwrap();
        assert_eq!(t.compute_commit_point(), Some(8));
    }

    #[test]
    fn counters_track_pending_and_acked() {
        let mut t = tracker();
        for offset in 0..5 {
            t.record_delivered(offset).unwrap();
        }
        t.record_acknowledged(2).unwrap();
        t.record_acknowledged(4).unwrap();
        assert_eq!(t.pending_count(), 5);
        assert_eq!(t.acked_uncommitted_count(), 2);
        assert_eq!(t.head_of_line(), Some(0));

        let unacked = t.take_unacknowledged();
        assert_eq!(unacked, vec![0, 1, 3]);
        assert_eq!(t.pending_count(), 0);
        assert_eq!(t.acked_uncommitted_count(), 0);
    }

    proptest! {
        /// Any ack permutation commits exactly the contiguous acknowledged
        /// prefix, interpreted as prefix length (next offset to read).
        #[test]
        fn commit_point_is_contiguous_prefix(
            total in 1usize..40,
            acked in proptest::collection::vec(any::<bool>(), 1..40),
            seed in any::<u64>(),
        ) {
            let total = total.min(acked.len());
            let mut t = tracker();
            for offset in 0..total as u64 {
                t.record_delivered(offset).unwrap();
            }

            // Ack the selected offsets in a pseudo-random order.
            let mut to_ack: Vec<u64> = (0..total as u64)
                .filter(|o| acked[*o as usize])
                .collect();
            let mut state = seed;
            for i in (1..to_ack.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                to_ack.swap(i, (state % (i as u64 + 1)) as usize);
            }
            for offset in to_ack {
                t.record_acknowledged(offset).unwrap();
            }

            let expected_prefix = (0..total as u64)
                .take_while(|o| acked[*o as usize])
                .count() as u64;
            let expected = if expected_prefix == 0 { None } else { Some(expected_prefix) };
            prop_assert_eq!(t.compute_commit_point(), expected);
        }
    }
}
