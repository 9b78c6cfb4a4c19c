//! Profile operations for the current user.
//!
//! Ops recorded before the people distinct ID is known are withheld and go
//! out, in order, once [`People::identify`] or
//! [`Tracker::identify`](crate::Tracker::identify) is called.

use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;

use crate::state::{lock_state, ProjectState};
use crate::types::{date_value, ProfileOpType, Properties, Record};

/// Handle returned by [`Tracker::people`](crate::Tracker::people)
pub struct People<'a> {
    state: &'a Mutex<ProjectState>,
}

impl<'a> People<'a> {
    pub(crate) fn new(state: &'a Mutex<ProjectState>) -> Self {
        Self { state }
    }

    /// Set the people distinct ID without touching the event distinct ID
    pub fn identify(&self, distinct_id: &str) {
        let released = lock_state(self.state).people_identify(distinct_id);
        if released > 0 {
            tracing::debug!(released, "Released withheld profile ops");
        }
    }

    /// Set profile properties, overwriting existing values
    pub fn set(&self, properties: Properties) {
        self.push(ProfileOpType::Set, properties);
    }

    pub fn set_property(&self, key: &str, value: impl Into<Value>) {
        self.set(single(key, value.into()));
    }

    /// Set profile properties that do not have a value yet
    pub fn set_once(&self, properties: Properties) {
        self.push(ProfileOpType::SetOnce, properties);
    }

    /// Add numeric amounts to profile properties
    pub fn increment(&self, properties: Properties) {
        self.push(ProfileOpType::Increment, properties);
    }

    pub fn increment_by(&self, key: &str, amount: impl Into<Value>) {
        self.increment(single(key, amount.into()));
    }

    /// Append values to list properties
    pub fn append(&self, properties: Properties) {
        self.push(ProfileOpType::Append, properties);
    }

    /// Merge arrays into list properties, skipping values already present
    pub fn union(&self, properties: Properties) {
        self.push(ProfileOpType::Union, properties);
    }

    pub fn track_charge(&self, amount: f64) {
        self.track_charge_with_properties(amount, Properties::new());
    }

    /// Record a transaction. `$amount` and `$time` are filled in unless
    /// `properties` already carries them.
    pub fn track_charge_with_properties(&self, amount: f64, mut properties: Properties) {
        properties.insert("$amount".to_string(), Value::from(amount));
        properties
            .entry("$time")
            .or_insert_with(|| date_value(Utc::now()));
        self.push(ProfileOpType::TrackCharge, properties);
    }

    /// Remove every recorded transaction
    pub fn clear_charges(&self) {
        self.push(ProfileOpType::ClearCharges, Properties::new());
    }

    /// Delete the profile on the service
    pub fn delete_user(&self) {
        self.push(ProfileOpType::DeleteUser, Properties::new());
    }

    fn push(&self, op: ProfileOpType, properties: Properties) {
        let mut state = lock_state(self.state);
        let distinct_id = state.properties.people_distinct_id().map(str::to_string);
        if distinct_id.is_none() {
            tracing::trace!(op = op.as_str(), "Profile op withheld until identify");
        }
        state.push(Record::profile_op(op, properties, distinct_id));
    }
}

fn single(key: &str, value: Value) -> Properties {
    let mut properties = Properties::new();
    properties.insert(key.to_string(), value);
    properties
}
