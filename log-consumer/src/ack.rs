use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use common_kafka::{OffsetErr, OffsetMarker};
use tracing::warn;

use crate::metrics_consts::{LAST_MARKED_OFFSET, MARK_ERRORS, OFFSETS_MARKED};

/// Acknowledgment for one or more consumed messages.
///
/// An `Ack` starts out covering a single message (its anchor). The sink folds
/// the acks of every message written in the same flush into the first one with
/// [`Ack::chain`], so one mark after the flush covers all of them.
pub struct Ack {
    session: Arc<dyn OffsetMarker>,
    topic: String,
    partition: i32,
    offset: i64,
    chained: HashMap<String, HashMap<i32, i64>>,
}

impl Ack {
    pub fn new(session: Arc<dyn OffsetMarker>, topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            session,
            topic: topic.to_string(),
            partition,
            offset,
            chained: HashMap::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Fold `later` into this ack.
    ///
    /// The anchor stays as it is. `later`'s anchor and everything it had already
    /// chained are merged in, keeping the highest offset per partition.
    pub fn chain(&mut self, later: Ack) {
        self.chain_offset(later.topic, later.partition, later.offset);
        for (topic, partitions) in later.chained {
            for (partition, offset) in partitions {
                self.chain_offset(topic.clone(), partition, offset);
            }
        }
    }

    fn chain_offset(&mut self, topic: String, partition: i32, offset: i64) {
        self.chained
            .entry(topic)
            .or_default()
            .entry(partition)
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
    }

    pub fn chained_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.chained.get(topic)?.get(&partition).copied()
    }

    /// Highest offset this ack covers for the partition, anchor included.
    pub fn covered_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        let anchor = (self.topic == topic && self.partition == partition).then_some(self.offset);
        match (anchor, self.chained_offset(topic, partition)) {
            (Some(a), Some(c)) => Some(a.max(c)),
            (a, c) => a.or(c),
        }
    }

    /// Mark the anchor, then every chained offset, on the session.
    ///
    /// All of them are attempted. The last failure, if any, is returned.
    pub fn mark(self) -> Result<(), OffsetErr> {
        let mut result = self.mark_one(&self.topic, self.partition, self.offset);

        for (topic, partitions) in &self.chained {
            for (partition, offset) in partitions {
                if let Err(e) = self.mark_one(topic, *partition, *offset) {
                    result = Err(e);
                }
            }
        }

        result
    }

    fn mark_one(&self, topic: &str, partition: i32, offset: i64) -> Result<(), OffsetErr> {
        match self.session.mark_offset(topic, partition, offset) {
            Ok(()) => {
                metrics::counter!(OFFSETS_MARKED).increment(1);
                metrics::gauge!(
                    LAST_MARKED_OFFSET,
                    "topic" => topic.to_string(),
                    "partition" => partition.to_string()
                )
                .set(offset as f64);
                Ok(())
            }
            Err(e) => {
                metrics::counter!(MARK_ERRORS).increment(1);
                warn!(topic, partition, offset, error = ?e, "Failed to mark offset");
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("chained", &self.chained)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingMarker;

    fn ack(marker: &Arc<RecordingMarker>, topic: &str, partition: i32, offset: i64) -> Ack {
        Ack::new(marker.clone(), topic, partition, offset)
    }

    #[test]
    fn chain_keeps_anchor_and_highest_offsets() {
        let marker = Arc::new(RecordingMarker::default());

        let mut first = ack(&marker, "t", 0, 10);
        first.chain(ack(&marker, "t", 0, 11));
        first.chain(ack(&marker, "t", 1, 7));
        first.chain(ack(&marker, "t", 0, 9));

        assert_eq!(first.topic(), "t");
        assert_eq!(first.partition(), 0);
        assert_eq!(first.offset(), 10);
        assert_eq!(first.chained_offset("t", 0), Some(11));
        assert_eq!(first.chained_offset("t", 1), Some(7));
        assert_eq!(first.chained_offset("t", 2), None);
        assert_eq!(first.covered_offset("t", 0), Some(11));
    }

    #[test]
    fn chain_takes_union_of_both_acks() {
        let marker = Arc::new(RecordingMarker::default());

        let mut later = ack(&marker, "other", 3, 40);
        later.chain(ack(&marker, "t", 0, 20));
        later.chain(ack(&marker, "other", 4, 41));

        let mut first = ack(&marker, "t", 0, 5);
        first.chain(ack(&marker, "t", 0, 25));
        first.chain(later);

        assert_eq!(first.chained_offset("other", 3), Some(40));
        assert_eq!(first.chained_offset("other", 4), Some(41));
        assert_eq!(first.chained_offset("t", 0), Some(25));
    }

    #[test]
    fn mark_covers_anchor_then_chained() {
        let marker = Arc::new(RecordingMarker::default());

        let mut first = ack(&marker, "t", 0, 10);
        first.chain(ack(&marker, "t", 0, 12));
        first.chain(ack(&marker, "u", 2, 3));
        first.mark().expect("mark failed");

        let marks = marker.marks();
        assert_eq!(marks[0], ("t".to_string(), 0, 10));
        assert_eq!(marks.len(), 3);
        assert_eq!(marker.highest("t", 0), Some(12));
        assert_eq!(marker.highest("u", 2), Some(3));
    }

    #[test]
    fn mark_attempts_every_offset_and_returns_failure() {
        let marker = Arc::new(RecordingMarker::failing_on("t", 1));

        let mut first = ack(&marker, "t", 0, 1);
        first.chain(ack(&marker, "t", 1, 2));
        first.chain(ack(&marker, "t", 2, 3));

        assert!(matches!(first.mark(), Err(OffsetErr::Gone)));
        assert_eq!(marker.highest("t", 0), Some(1));
        assert_eq!(marker.highest("t", 2), Some(3));
        assert_eq!(marker.highest("t", 1), None);
    }
}
