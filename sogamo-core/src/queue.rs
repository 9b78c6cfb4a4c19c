//! Bounded, ordered buffer of records waiting for delivery.
//!
//! A [`RecordQueue`] holds two independent lanes, one for events and one for
//! profile ops, plus a side sequence of profile ops that are withheld until
//! the user is identified.
//!
//! ```text
//!            push                 claim_batch            commit
//!   record ───────► pending ───────────────► in-flight ─────────► gone
//!                      ▲                         │
//!                      └──────── rollback ───────┘
//! ```
//!
//! Each lane has at most one in-flight batch. Claiming while a batch is out
//! returns nothing, which is what keeps a record from being sent twice.
//! Batch IDs are never reused, so a commit or rollback that arrives after
//! [`RecordQueue::clear`] does not match anything and cannot bring records
//! back.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::types::{QueueKind, Record, RecordKind};

/// Identifies one claimed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId {
    kind: QueueKind,
    seq: u64,
}

impl BatchId {
    pub fn kind(&self) -> QueueKind {
        self.kind
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.seq)
    }
}

/// Records handed out by [`RecordQueue::claim_batch`]
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub id: BatchId,
    pub records: Vec<Record>,
}

impl ClaimedBatch {
    pub fn kind(&self) -> QueueKind {
        self.id.kind
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Default)]
struct Lane {
    pending: VecDeque<Record>,
    in_flight: Option<(BatchId, Vec<Record>)>,
}

impl Lane {
    fn in_flight_len(&self) -> usize {
        self.in_flight.as_ref().map_or(0, |(_, records)| records.len())
    }
}

/// Pending records for one project
#[derive(Debug)]
pub struct RecordQueue {
    events: Lane,
    people: Lane,
    withheld: VecDeque<Record>,
    max_len: usize,
    next_batch: u64,
}

impl RecordQueue {
    /// Create an empty queue keeping at most `max_len` pending records per lane
    pub fn new(max_len: usize) -> Self {
        Self {
            events: Lane::default(),
            people: Lane::default(),
            withheld: VecDeque::new(),
            max_len: max_len.max(1),
            next_batch: 0,
        }
    }

    fn lane(&self, kind: QueueKind) -> &Lane {
        match kind {
            QueueKind::Events => &self.events,
            QueueKind::People => &self.people,
        }
    }

    fn lane_mut(&mut self, kind: QueueKind) -> &mut Lane {
        match kind {
            QueueKind::Events => &mut self.events,
            QueueKind::People => &mut self.people,
        }
    }

    /// Append a record, evicting the oldest pending record when full.
    ///
    /// Profile ops without a distinct ID go to the withheld sequence.
    pub fn push(&mut self, record: Record) {
        if record.is_withheld() {
            push_bounded(&mut self.withheld, record, self.max_len, "withheld");
            return;
        }
        let kind = record.queue_kind();
        let max_len = self.max_len;
        push_bounded(&mut self.lane_mut(kind).pending, record, max_len, kind.as_str());
    }

    /// Append a record read back from a snapshot.
    ///
    /// Nothing is evicted: a snapshot taken while a batch was in flight can
    /// hold more than `max_len` records per lane, and every one of them is
    /// kept. The next [`RecordQueue::push`] trims the lane back to the bound.
    pub fn restore(&mut self, record: Record) {
        if record.is_withheld() {
            self.withheld.push_back(record);
        } else {
            let kind = record.queue_kind();
            self.lane_mut(kind).pending.push_back(record);
        }
    }

    /// Stamp every withheld profile op with `distinct_id` and move them, in
    /// creation order, to the back of the people lane.
    ///
    /// Returns how many ops were released.
    pub fn release_withheld(&mut self, distinct_id: &str) -> usize {
        let released = self.withheld.len();
        let max_len = self.max_len;
        while let Some(record) = self.withheld.pop_front() {
            let record = match record.kind {
                RecordKind::ProfileOp(ref op) => Record {
                    id: record.id,
                    created_at: record.created_at,
                    kind: RecordKind::ProfileOp(op.stamped(distinct_id)),
                },
                RecordKind::Event(_) => record,
            };
            push_bounded(&mut self.people.pending, record, max_len, "people");
        }
        released
    }

    /// Move up to `max_size` records from the front of a lane to in-flight.
    ///
    /// Returns `None` when the lane is empty or already has a batch out.
    pub fn claim_batch(&mut self, kind: QueueKind, max_size: usize) -> Option<ClaimedBatch> {
        let seq = self.next_batch;
        let lane = self.lane_mut(kind);
        if lane.in_flight.is_some() || lane.pending.is_empty() || max_size == 0 {
            return None;
        }

        let take = max_size.min(lane.pending.len());
        let records: Vec<Record> = lane.pending.drain(..take).collect();
        let id = BatchId { kind, seq };
        lane.in_flight = Some((id, records.clone()));
        self.next_batch += 1;

        Some(ClaimedBatch { id, records })
    }

    /// Drop a delivered batch for good.
    ///
    /// Returns false when `id` is not the lane's current in-flight batch.
    pub fn commit(&mut self, id: BatchId) -> bool {
        let lane = self.lane_mut(id.kind);
        match &lane.in_flight {
            Some((current, _)) if *current == id => {
                lane.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Put an undelivered batch back at the front of its lane, in order.
    ///
    /// Returns false when `id` is not the lane's current in-flight batch.
    pub fn rollback(&mut self, id: BatchId) -> bool {
        let lane = self.lane_mut(id.kind);
        match lane.in_flight.take() {
            Some((current, records)) if current == id => {
                for record in records.into_iter().rev() {
                    lane.pending.push_front(record);
                }
                true
            }
            other => {
                lane.in_flight = other;
                false
            }
        }
    }

    /// Remove some records from the in-flight batch so that a later rollback
    /// does not put them back. Used for records that can never be encoded.
    ///
    /// Returns how many records were removed.
    pub fn discard_in_flight(&mut self, id: BatchId, record_ids: &[Uuid]) -> usize {
        let lane = self.lane_mut(id.kind);
        match &mut lane.in_flight {
            Some((current, records)) if *current == id => {
                let before = records.len();
                records.retain(|record| !record_ids.contains(&record.id));
                before - records.len()
            }
            _ => 0,
        }
    }

    /// Drop every pending, withheld and in-flight record
    pub fn clear(&mut self) {
        for kind in QueueKind::ALL {
            let lane = self.lane_mut(kind);
            lane.pending.clear();
            lane.in_flight = None;
        }
        self.withheld.clear();
    }

    pub fn pending_len(&self, kind: QueueKind) -> usize {
        self.lane(kind).pending.len()
    }

    pub fn in_flight_len(&self, kind: QueueKind) -> usize {
        self.lane(kind).in_flight_len()
    }

    pub fn is_in_flight(&self, kind: QueueKind) -> bool {
        self.lane(kind).in_flight.is_some()
    }

    pub fn withheld_len(&self) -> usize {
        self.withheld.len()
    }

    /// Whether a lane has claimable records
    pub fn has_pending(&self, kind: QueueKind) -> bool {
        !self.lane(kind).pending.is_empty()
    }

    /// Total of pending, in-flight and withheld records
    pub fn total_len(&self) -> usize {
        QueueKind::ALL
            .iter()
            .map(|kind| self.pending_len(*kind) + self.in_flight_len(*kind))
            .sum::<usize>()
            + self.withheld.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Pending records of a lane, front first
    pub fn pending(&self, kind: QueueKind) -> impl Iterator<Item = &Record> {
        self.lane(kind).pending.iter()
    }

    /// Every record of a lane that still needs delivering, in the order it
    /// would be sent after a restart: in-flight first, then pending. The
    /// people lane also carries the withheld ops at the end.
    pub fn persisted_records(&self, kind: QueueKind) -> Vec<Record> {
        let lane = self.lane(kind);
        let mut records: Vec<Record> = lane
            .in_flight
            .iter()
            .flat_map(|(_, batch)| batch.iter().cloned())
            .collect();
        records.extend(lane.pending.iter().cloned());
        if kind == QueueKind::People {
            records.extend(self.withheld.iter().cloned());
        }
        records
    }
}

fn push_bounded(seq: &mut VecDeque<Record>, record: Record, max_len: usize, lane: &str) {
    while seq.len() >= max_len {
        if let Some(evicted) = seq.pop_front() {
            tracing::warn!(
                lane,
                record_id = %evicted.id,
                record = evicted.label(),
                "Queue full, dropping oldest record"
            );
        }
    }
    seq.push_back(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProfileOpType, Properties};

    fn event(name: &str) -> Record {
        Record::event(name, Properties::new())
    }

    fn names(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r.label().to_string()).collect()
    }

    fn pending_names(queue: &RecordQueue, kind: QueueKind) -> Vec<String> {
        queue.pending(kind).map(|r| r.label().to_string()).collect()
    }

    #[test]
    fn test_claim_fail_rollback_then_commit() {
        let mut queue = RecordQueue::new(10);
        for name in ["A", "B", "C"] {
            queue.push(event(name));
        }

        let batch = queue.claim_batch(QueueKind::Events, 2).unwrap();
        assert_eq!(names(&batch.records), vec!["A", "B"]);
        assert!(queue.is_in_flight(QueueKind::Events));

        assert!(queue.rollback(batch.id));
        assert_eq!(pending_names(&queue, QueueKind::Events), vec!["A", "B", "C"]);

        let batch = queue.claim_batch(QueueKind::Events, 3).unwrap();
        assert_eq!(names(&batch.records), vec!["A", "B", "C"]);
        assert!(queue.commit(batch.id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_single_in_flight_batch_per_lane() {
        let mut queue = RecordQueue::new(10);
        queue.push(event("A"));
        queue.push(event("B"));
        queue.push(Record::profile_op(
            ProfileOpType::Set,
            Properties::new(),
            Some("u".to_string()),
        ));

        let first = queue.claim_batch(QueueKind::Events, 1).unwrap();
        assert!(queue.claim_batch(QueueKind::Events, 1).is_none());
        // the other lane is independent
        assert!(queue.claim_batch(QueueKind::People, 1).is_some());

        queue.commit(first.id);
        let second = queue.claim_batch(QueueKind::Events, 5).unwrap();
        assert_eq!(names(&second.records), vec!["B"]);
    }

    #[test]
    fn test_claim_empty_lane() {
        let mut queue = RecordQueue::new(10);
        assert!(queue.claim_batch(QueueKind::Events, 5).is_none());
        queue.push(event("A"));
        assert!(queue.claim_batch(QueueKind::Events, 0).is_none());
    }

    #[test]
    fn test_push_evicts_oldest_pending_not_in_flight() {
        let mut queue = RecordQueue::new(3);
        for name in ["A", "B", "C"] {
            queue.push(event(name));
        }
        let batch = queue.claim_batch(QueueKind::Events, 2).unwrap();

        for name in ["D", "E", "F"] {
            queue.push(event(name));
        }
        // C was the oldest pending record; A and B are in flight
        assert_eq!(pending_names(&queue, QueueKind::Events), vec!["D", "E", "F"]);
        assert_eq!(queue.in_flight_len(QueueKind::Events), 2);

        assert!(queue.rollback(batch.id));
        assert_eq!(
            pending_names(&queue, QueueKind::Events),
            vec!["A", "B", "D", "E", "F"]
        );
    }

    #[test]
    fn test_withheld_ops_are_not_claimable_until_released() {
        let mut queue = RecordQueue::new(10);
        queue.push(Record::profile_op(ProfileOpType::Set, Properties::new(), None));
        queue.push(Record::profile_op(ProfileOpType::Increment, Properties::new(), None));

        assert_eq!(queue.withheld_len(), 2);
        assert!(queue.claim_batch(QueueKind::People, 10).is_none());

        assert_eq!(queue.release_withheld("user-1"), 2);
        assert_eq!(queue.withheld_len(), 0);

        let batch = queue.claim_batch(QueueKind::People, 10).unwrap();
        assert_eq!(names(&batch.records), vec!["set", "increment"]);
        for record in &batch.records {
            match &record.kind {
                RecordKind::ProfileOp(op) => assert_eq!(op.distinct_id.as_deref(), Some("user-1")),
                RecordKind::Event(_) => panic!("unexpected event"),
            }
        }
    }

    #[test]
    fn test_clear_voids_in_flight_batch() {
        let mut queue = RecordQueue::new(10);
        queue.push(event("A"));
        queue.push(event("B"));
        queue.push(event("C"));
        let batch = queue.claim_batch(QueueKind::Events, 1).unwrap();

        queue.clear();
        assert!(queue.is_empty());

        assert!(!queue.commit(batch.id));
        assert!(!queue.rollback(batch.id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stale_batch_id_does_not_touch_new_batch() {
        let mut queue = RecordQueue::new(10);
        queue.push(event("A"));
        let stale = queue.claim_batch(QueueKind::Events, 1).unwrap();
        queue.clear();

        queue.push(event("B"));
        let fresh = queue.claim_batch(QueueKind::Events, 1).unwrap();
        assert_ne!(stale.id, fresh.id);
        assert!(!queue.rollback(stale.id));
        assert!(queue.is_in_flight(QueueKind::Events));
        assert!(queue.commit(fresh.id));
    }

    #[test]
    fn test_discard_in_flight_survives_rollback() {
        let mut queue = RecordQueue::new(10);
        for name in ["A", "B", "C"] {
            queue.push(event(name));
        }
        let batch = queue.claim_batch(QueueKind::Events, 3).unwrap();
        let bad = batch.records[1].id;

        assert_eq!(queue.discard_in_flight(batch.id, &[bad]), 1);
        assert!(queue.rollback(batch.id));
        assert_eq!(pending_names(&queue, QueueKind::Events), vec!["A", "C"]);
    }

    #[test]
    fn test_restore_keeps_records_beyond_bound() {
        let mut queue = RecordQueue::new(3);
        for name in ["A", "B", "C", "D", "E"] {
            queue.restore(event(name));
        }
        queue.restore(Record::profile_op(ProfileOpType::Set, Properties::new(), None));

        assert_eq!(
            pending_names(&queue, QueueKind::Events),
            vec!["A", "B", "C", "D", "E"]
        );
        assert_eq!(queue.withheld_len(), 1);

        queue.push(event("F"));
        assert_eq!(pending_names(&queue, QueueKind::Events), vec!["D", "E", "F"]);
    }

    #[test]
    fn test_persisted_records_order() {
        let mut queue = RecordQueue::new(10);
        queue.push(event("A"));
        queue.push(event("B"));
        queue.claim_batch(QueueKind::Events, 1).unwrap();
        queue.push(event("C"));
        queue.push(Record::profile_op(ProfileOpType::Set, Properties::new(), Some("u".into())));
        queue.push(Record::profile_op(ProfileOpType::Union, Properties::new(), None));

        assert_eq!(
            names(&queue.persisted_records(QueueKind::Events)),
            vec!["A", "B", "C"]
        );
        assert_eq!(
            names(&queue.persisted_records(QueueKind::People)),
            vec!["set", "union"]
        );
        assert_eq!(queue.total_len(), 5);
    }
}
