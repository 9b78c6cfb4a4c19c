//! State owned by one project: identity, super properties and the queue.
//!
//! Both live behind a single mutex so that an identification and the
//! release of withheld profile ops happen as one step, and so a snapshot
//! never sees a half-claimed batch.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::persistence::ProjectSnapshot;
use crate::properties::{IdentifyOutcome, PropertyStore};
use crate::queue::RecordQueue;
use crate::types::{QueueKind, Record};

/// Everything a tracker mutates on behalf of the host
#[derive(Debug)]
pub struct ProjectState {
    pub properties: PropertyStore,
    pub queue: RecordQueue,
}

impl ProjectState {
    pub fn new(max_queue_length: usize) -> Self {
        Self {
            properties: PropertyStore::new(),
            queue: RecordQueue::new(max_queue_length),
        }
    }

    /// Rebuild state from a snapshot.
    ///
    /// Every saved record comes back, including a batch that was in flight
    /// when the snapshot was taken. Profile ops saved without a distinct ID
    /// are withheld again, unless the snapshot already knows the people
    /// distinct ID.
    pub fn from_snapshot(snapshot: ProjectSnapshot, max_queue_length: usize) -> Self {
        let properties = PropertyStore::from_parts(
            snapshot.distinct_id,
            snapshot.people_distinct_id,
            snapshot.super_properties,
            snapshot.once_defaults,
        );

        let mut queue = RecordQueue::new(max_queue_length);
        for record in snapshot
            .pending_events
            .into_iter()
            .chain(snapshot.pending_profile_ops)
        {
            queue.restore(record);
        }
        if let Some(people_id) = properties.people_distinct_id() {
            queue.release_withheld(people_id);
        }

        Self { properties, queue }
    }

    /// Consistent copy of the state for persisting
    pub fn to_snapshot(&self, token: &str) -> ProjectSnapshot {
        ProjectSnapshot {
            token: token.to_string(),
            distinct_id: self.properties.distinct_id().to_string(),
            people_distinct_id: self.properties.people_distinct_id().map(str::to_string),
            super_properties: self.properties.current_super_properties(),
            once_defaults: self.properties.once_defaults().clone(),
            pending_events: self.queue.persisted_records(QueueKind::Events),
            pending_profile_ops: self.queue.persisted_records(QueueKind::People),
            saved_at: Utc::now(),
        }
    }

    /// Identify the user for events and, the first time, for profile ops
    pub fn identify(&mut self, distinct_id: &str) -> (IdentifyOutcome, usize) {
        let outcome = self.properties.identify(distinct_id);
        let released = if outcome.people_identified {
            self.queue.release_withheld(distinct_id)
        } else {
            0
        };
        (outcome, released)
    }

    /// Identify the user for profile ops only
    pub fn people_identify(&mut self, distinct_id: &str) -> usize {
        if self.properties.people_identify(distinct_id) {
            self.queue.release_withheld(distinct_id)
        } else {
            0
        }
    }

    /// Queue a record built against the current identity
    pub fn push(&mut self, record: Record) {
        self.queue.push(record);
    }

    /// Forget the user and drop every undelivered record
    pub fn reset(&mut self) {
        self.properties.reset();
        self.queue.clear();
    }
}

/// Lock the project state.
///
/// A panic while holding the lock leaves the data structurally intact (every
/// mutation is a single push, drain or swap), so a poisoned lock is reused.
pub(crate) fn lock_state(state: &Mutex<ProjectState>) -> MutexGuard<'_, ProjectState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
