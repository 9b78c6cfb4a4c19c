//! Core domain types for sogamo
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Record** | One tracked item waiting for delivery: an event or a profile operation |
//! | **Event** | A named occurrence with properties, stamped with the distinct ID at creation |
//! | **Profile op** | A mutation of the current user's profile (set, increment, ...) |
//! | **Lane** | One ordered sequence of records delivered to one endpoint |
//! | **Super property** | A property merged into every event tracked afterwards |
//! | **Distinct ID** | The identifier tying records to one user |
//!
//! Records are immutable once created. The only exception is the release of a
//! withheld profile op, which produces a stamped copy through
//! [`ProfileOp::stamped`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Property mapping carried by records and super properties.
///
/// Keys keep insertion order.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Library name sent with every event
pub const LIB_NAME: &str = "sogamo-rust";

/// Library version sent with every event
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format used for date-typed property values
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Encode a timestamp as a date-typed property value.
pub fn date_value(ts: DateTime<Utc>) -> serde_json::Value {
    serde_json::Value::String(ts.format(DATE_FORMAT).to_string())
}

// ============================================
// Lanes
// ============================================

/// Which delivery lane a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Tracked events, delivered to `/track`
    Events,
    /// Profile operations, delivered to `/engage`
    People,
}

impl QueueKind {
    /// Both lanes, in the order a flush drains them
    pub const ALL: [QueueKind; 2] = [QueueKind::Events, QueueKind::People];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Events => "events",
            QueueKind::People => "people",
        }
    }

    /// Path appended to the server URL for this lane
    pub fn endpoint(&self) -> &'static str {
        match self {
            QueueKind::Events => "/track",
            QueueKind::People => "/engage",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// Profile operations
// ============================================

/// Kind of profile mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileOpType {
    Set,
    SetOnce,
    Increment,
    Append,
    Union,
    TrackCharge,
    ClearCharges,
    DeleteUser,
}

impl ProfileOpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileOpType::Set => "set",
            ProfileOpType::SetOnce => "set_once",
            ProfileOpType::Increment => "increment",
            ProfileOpType::Append => "append",
            ProfileOpType::Union => "union",
            ProfileOpType::TrackCharge => "track_charge",
            ProfileOpType::ClearCharges => "clear_charges",
            ProfileOpType::DeleteUser => "delete_user",
        }
    }
}

/// A queued profile mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileOp {
    /// What to do with `properties`
    pub op: ProfileOpType,
    /// Operation arguments
    pub properties: Properties,
    /// People distinct ID; `None` while the op is withheld
    pub distinct_id: Option<String>,
}

impl ProfileOp {
    /// Copy of this op bound to `distinct_id`
    pub fn stamped(&self, distinct_id: &str) -> Self {
        Self {
            op: self.op,
            properties: self.properties.clone(),
            distinct_id: Some(distinct_id.to_string()),
        }
    }
}

// ============================================
// Events
// ============================================

/// A tracked event with its fully merged properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event name
    pub name: String,
    /// Defaults, super properties and explicit properties, already merged
    pub properties: Properties,
}

// ============================================
// Records
// ============================================

/// Payload of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordKind {
    Event(EventRecord),
    ProfileOp(ProfileOp),
}

/// One tracked item waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique record ID
    pub id: Uuid,
    /// When the tracking call was made
    pub created_at: DateTime<Utc>,
    /// Event or profile op
    #[serde(flatten)]
    pub kind: RecordKind,
}

impl Record {
    pub fn event(name: impl Into<String>, properties: Properties) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            kind: RecordKind::Event(EventRecord {
                name: name.into(),
                properties,
            }),
        }
    }

    pub fn profile_op(op: ProfileOpType, properties: Properties, distinct_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            kind: RecordKind::ProfileOp(ProfileOp {
                op,
                properties,
                distinct_id,
            }),
        }
    }

    /// Lane this record is delivered through
    pub fn queue_kind(&self) -> QueueKind {
        match self.kind {
            RecordKind::Event(_) => QueueKind::Events,
            RecordKind::ProfileOp(_) => QueueKind::People,
        }
    }

    /// Whether this is a profile op still waiting for identification
    pub fn is_withheld(&self) -> bool {
        matches!(&self.kind, RecordKind::ProfileOp(op) if op.distinct_id.is_none())
    }

    /// Short name for logging
    pub fn label(&self) -> &str {
        match &self.kind {
            RecordKind::Event(event) => &event.name,
            RecordKind::ProfileOp(op) => op.op.as_str(),
        }
    }
}
