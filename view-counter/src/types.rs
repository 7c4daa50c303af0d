use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use common_batching::Buffer;

/// One observed view of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub entity_id: String,
    pub occurred_at: Option<DateTime<Utc>>,
}

/// A decoded event together with where it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedView {
    pub event: RawEvent,
    pub partition: i32,
    pub offset: i64,
}

/// Views aggregated per entity, along with the offsets they cover.
///
/// Pushing a view bumps its entity's delta and moves its partition's
/// watermark to the offset after it. `len` counts raw events, so the batch
/// size bounds the number of messages between two writes rather than the
/// number of rows.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ViewBatch {
    deltas: HashMap<String, i64>,
    offsets: BTreeMap<i32, i64>,
    events: usize,
}

impl ViewBatch {
    pub fn deltas(&self) -> &HashMap<String, i64> {
        &self.deltas
    }

    /// Partition to next offset to consume, i.e. the offsets to commit once
    /// this batch is stored.
    pub fn offsets(&self) -> &BTreeMap<i32, i64> {
        &self.offsets
    }

    pub fn events(&self) -> usize {
        self.events
    }

    pub fn entities(&self) -> usize {
        self.deltas.len()
    }

    fn advance(&mut self, partition: i32, next_offset: i64) {
        let watermark = self.offsets.entry(partition).or_insert(next_offset);
        *watermark = (*watermark).max(next_offset);
    }
}

impl Buffer for ViewBatch {
    type Item = ConsumedView;

    fn push(&mut self, view: ConsumedView) {
        *self.deltas.entry(view.event.entity_id).or_insert(0) += 1;
        self.advance(view.partition, view.offset + 1);
        self.events += 1;
    }

    fn len(&self) -> usize {
        self.events
    }

    fn merge(&mut self, other: Self) {
        for (entity_id, delta) in other.deltas {
            *self.deltas.entry(entity_id).or_insert(0) += delta;
        }
        for (partition, next_offset) in other.offsets {
            self.advance(partition, next_offset);
        }
        self.events += other.events;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(entity_id: &str, partition: i32, offset: i64) -> ConsumedView {
        ConsumedView {
            event: RawEvent {
                entity_id: entity_id.to_string(),
                occurred_at: None,
            },
            partition,
            offset,
        }
    }

    #[test]
    fn views_of_one_entity_collapse_into_one_delta() {
        let mut batch = ViewBatch::default();
        for offset in 0..7 {
            batch.push(view("reel-1", 0, offset));
        }

        assert_eq!(batch.deltas(), &HashMap::from([("reel-1".to_string(), 7)]));
        assert_eq!(batch.entities(), 1);
        assert_eq!(batch.len(), 7);
    }

    #[test]
    fn watermark_is_next_offset_after_highest_seen() {
        let mut batch = ViewBatch::default();
        batch.push(view("a", 0, 10));
        batch.push(view("b", 1, 4));
        batch.push(view("c", 0, 8));

        assert_eq!(batch.offsets(), &BTreeMap::from([(0, 11), (1, 5)]));
    }

    #[test]
    fn merge_sums_deltas_and_keeps_highest_watermarks() {
        let mut retained = ViewBatch::default();
        retained.push(view("a", 0, 1));
        retained.push(view("a", 0, 2));
        retained.push(view("b", 1, 9));

        let mut fresh = ViewBatch::default();
        fresh.push(view("a", 0, 3));
        fresh.push(view("c", 2, 0));

        retained.merge(fresh);

        assert_eq!(
            retained.deltas(),
            &HashMap::from([
                ("a".to_string(), 3),
                ("b".to_string(), 1),
                ("c".to_string(), 1),
            ])
        );
        assert_eq!(retained.offsets(), &BTreeMap::from([(0, 4), (1, 10), (2, 1)]));
        assert_eq!(retained.events(), 5);
    }
}
