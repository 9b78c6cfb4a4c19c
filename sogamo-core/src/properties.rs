//! Identity and super-property state for one project.
//!
//! The store is plain data plus merge logic. It never touches storage or the
//! queue; the [`Tracker`](crate::Tracker) decides when to persist and which
//! records to release after an identification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{Properties, LIB_NAME, LIB_VERSION};

/// Super property carrying the user's display name in live views
pub const NAME_TAG_PROPERTY: &str = "mp_name_tag";

/// What an identification changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdentifyOutcome {
    /// The event distinct ID changed
    pub distinct_id_changed: bool,
    /// The people distinct ID was set for the first time (withheld ops can go)
    pub people_identified: bool,
}

/// Process-wide identity and default properties for one project token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyStore {
    distinct_id: String,
    people_distinct_id: Option<String>,
    super_properties: Properties,
    once_defaults: Properties,
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyStore {
    /// Fresh store with a generated distinct ID
    pub fn new() -> Self {
        Self {
            distinct_id: default_distinct_id(),
            people_distinct_id: None,
            super_properties: Properties::new(),
            once_defaults: Properties::new(),
        }
    }

    /// Rebuild a store from persisted fields
    pub fn from_parts(
        distinct_id: String,
        people_distinct_id: Option<String>,
        super_properties: Properties,
        once_defaults: Properties,
    ) -> Self {
        let distinct_id = if distinct_id.is_empty() {
            default_distinct_id()
        } else {
            distinct_id
        };
        Self {
            distinct_id,
            people_distinct_id,
            super_properties,
            once_defaults,
        }
    }

    pub fn distinct_id(&self) -> &str {
        &self.distinct_id
    }

    pub fn people_distinct_id(&self) -> Option<&str> {
        self.people_distinct_id.as_deref()
    }

    /// Snapshot of the current super properties
    pub fn current_super_properties(&self) -> Properties {
        self.super_properties.clone()
    }

    pub fn super_properties(&self) -> &Properties {
        &self.super_properties
    }

    pub fn once_defaults(&self) -> &Properties {
        &self.once_defaults
    }

    /// Set the distinct ID used for events.
    ///
    /// The first identification also binds the people distinct ID. Calling
    /// again with the same ID changes nothing.
    pub fn identify(&mut self, distinct_id: &str) -> IdentifyOutcome {
        let mut outcome = IdentifyOutcome::default();
        if distinct_id.is_empty() {
            return outcome;
        }

        if self.distinct_id != distinct_id {
            self.distinct_id = distinct_id.to_string();
            outcome.distinct_id_changed = true;
        }
        if self.people_distinct_id.is_none() {
            self.people_distinct_id = Some(distinct_id.to_string());
            outcome.people_identified = true;
        }
        outcome
    }

    /// Set only the distinct ID used for profile ops.
    ///
    /// Returns true when this releases withheld ops, i.e. the people ID was
    /// previously unset.
    pub fn people_identify(&mut self, distinct_id: &str) -> bool {
        if distinct_id.is_empty() {
            return false;
        }
        let first = self.people_distinct_id.is_none();
        self.people_distinct_id = Some(distinct_id.to_string());
        first
    }

    /// Merge `props` into the super properties, overwriting existing keys
    pub fn register_super_properties(&mut self, props: Properties) {
        for (key, value) in props {
            self.super_properties.insert(key, value);
        }
    }

    /// Merge `props` into the super properties without overwriting.
    ///
    /// An existing key is replaced only when its current value equals the
    /// default value for that key: `default_value` when given, otherwise the
    /// default recorded by an earlier register-once call.
    pub fn register_super_properties_once(&mut self, props: Properties, default_value: Option<Value>) {
        for (key, value) in props {
            if let Some(default) = &default_value {
                self.once_defaults.insert(key.clone(), default.clone());
            }

            let overwrite = match self.super_properties.get(&key) {
                None => true,
                Some(current) => self.once_defaults.get(&key) == Some(current),
            };
            if overwrite {
                self.super_properties.insert(key, value);
            }
        }
    }

    /// Remove one super property; unknown keys are ignored
    pub fn unregister(&mut self, key: &str) {
        self.super_properties.shift_remove(key);
    }

    pub fn clear_super_properties(&mut self) {
        self.super_properties.clear();
    }

    /// Register the display name shown for this user in live views
    pub fn set_name_tag(&mut self, name_tag: &str) {
        self.super_properties
            .insert(NAME_TAG_PROPERTY.to_string(), Value::String(name_tag.to_string()));
    }

    /// Build the property map for a new event.
    ///
    /// Precedence, lowest first: library defaults, identity, super
    /// properties, explicit properties.
    pub fn event_properties(&self, token: &str, time: i64, explicit: Properties) -> Properties {
        let mut merged = Properties::new();
        merged.insert("$lib".to_string(), Value::from(LIB_NAME));
        merged.insert("$lib_version".to_string(), Value::from(LIB_VERSION));
        merged.insert("token".to_string(), Value::from(token));
        merged.insert("time".to_string(), Value::from(time));
        merged.insert("distinct_id".to_string(), Value::from(self.distinct_id.as_str()));

        for (key, value) in &self.super_properties {
            merged.insert(key.clone(), value.clone());
        }
        for (key, value) in explicit {
            merged.insert(key, value);
        }
        merged
    }

    /// Forget everything and start over with a new generated distinct ID
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

fn default_distinct_id() -> String {
    Uuid::new_v4().to_string()
}
