//! Snapshot repository
//!
//! Reads and writes [`ProjectSnapshot`] rows, one per project token.

use crate::error::{Error, Result};
use crate::types::{Properties, Record};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Layout version written with every snapshot
pub const SNAPSHOT_FORMAT_VERSION: i64 = 1;

/// Point-in-time copy of everything a project needs to survive a restart
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSnapshot {
    /// Project token (primary key)
    pub token: String,
    /// Distinct ID used for events
    pub distinct_id: String,
    /// Distinct ID used for profile ops, if identified
    pub people_distinct_id: Option<String>,
    /// Registered super properties, in registration order
    pub super_properties: Properties,
    /// Defaults recorded by register-once calls
    pub once_defaults: Properties,
    /// Undelivered events, oldest first
    pub pending_events: Vec<Record>,
    /// Undelivered profile ops, oldest first; withheld ops have no distinct ID
    pub pending_profile_ops: Vec<Record>,
    /// When the snapshot was taken
    pub saved_at: DateTime<Utc>,
}

/// Snapshot database handle (single connection)
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

impl SnapshotStore {
    /// Open or create a snapshot database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        super::schema::run_migrations(&conn)
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the snapshot for `snapshot.token`.
    ///
    /// The write happens in one transaction, so readers see either the
    /// previous snapshot or this one.
    pub fn save(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        let super_properties = serde_json::to_string(&snapshot.super_properties)?;
        let once_defaults = serde_json::to_string(&snapshot.once_defaults)?;
        let pending_events = serde_json::to_string(&snapshot.pending_events)?;
        let pending_profile_ops = serde_json::to_string(&snapshot.pending_profile_ops)?;

        let mut conn = self.connection();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO snapshots (
                token, distinct_id, people_distinct_id, super_properties, once_defaults,
                pending_events, pending_profile_ops, saved_at, format_version
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(token) DO UPDATE SET
                distinct_id = excluded.distinct_id,
                people_distinct_id = excluded.people_distinct_id,
                super_properties = excluded.super_properties,
                once_defaults = excluded.once_defaults,
                pending_events = excluded.pending_events,
                pending_profile_ops = excluded.pending_profile_ops,
                saved_at = excluded.saved_at,
                format_version = excluded.format_version
            "#,
            params![
                snapshot.token,
                snapshot.distinct_id,
                snapshot.people_distinct_id,
                super_properties,
                once_defaults,
                pending_events,
                pending_profile_ops,
                snapshot.saved_at.to_rfc3339(),
                SNAPSHOT_FORMAT_VERSION,
            ],
        )?;
        tx.commit()?;

        tracing::debug!(
            token = %snapshot.token,
            events = snapshot.pending_events.len(),
            profile_ops = snapshot.pending_profile_ops.len(),
            "Saved snapshot"
        );
        Ok(())
    }

    /// Load the snapshot for a token.
    ///
    /// Returns `Ok(None)` when nothing was saved yet and
    /// [`Error::Persistence`] when the stored row cannot be decoded.
    pub fn load(&self, token: &str) -> Result<Option<ProjectSnapshot>> {
        let conn = self.connection();
        let raw = conn
            .query_row(
                "SELECT * FROM snapshots WHERE token = ?",
                [token],
                Self::row_to_raw,
            )
            .optional()?;

        raw.map(RawSnapshot::decode).transpose()
    }

    /// Remove the snapshot for a token
    pub fn delete(&self, token: &str) -> Result<bool> {
        let conn = self.connection();
        let removed = conn.execute("DELETE FROM snapshots WHERE token = ?", [token])?;
        Ok(removed > 0)
    }

    /// Tokens that have a saved snapshot
    pub fn tokens(&self) -> Result<Vec<String>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT token FROM snapshots ORDER BY token")?;
        let tokens = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tokens)
    }

    fn row_to_raw(row: &Row) -> rusqlite::Result<RawSnapshot> {
        Ok(RawSnapshot {
            token: row.get("token")?,
            distinct_id: row.get("distinct_id")?,
            people_distinct_id: row.get("people_distinct_id")?,
            super_properties: row.get("super_properties")?,
            once_defaults: row.get("once_defaults")?,
            pending_events: row.get("pending_events")?,
            pending_profile_ops: row.get("pending_profile_ops")?,
            saved_at: row.get("saved_at")?,
            format_version: row.get("format_version")?,
        })
    }
}

/// Row contents before JSON decoding
struct RawSnapshot {
    token: String,
    distinct_id: String,
    people_distinct_id: Option<String>,
    super_properties: String,
    once_defaults: String,
    pending_events: String,
    pending_profile_ops: String,
    saved_at: String,
    format_version: i64,
}

impl RawSnapshot {
    fn decode(self) -> Result<ProjectSnapshot> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::Persistence(format!(
                "snapshot for {} has unsupported format version {}",
                self.token, self.format_version
            )));
        }

        let corrupt =
            |field: &str, e: serde_json::Error| Error::Persistence(format!("corrupt {}: {}", field, e));

        Ok(ProjectSnapshot {
            super_properties: serde_json::from_str(&self.super_properties)
                .map_err(|e| corrupt("super_properties", e))?,
            once_defaults: serde_json::from_str(&self.once_defaults)
                .map_err(|e| corrupt("once_defaults", e))?,
            pending_events: serde_json::from_str(&self.pending_events)
                .map_err(|e| corrupt("pending_events", e))?,
            pending_profile_ops: serde_json::from_str(&self.pending_profile_ops)
                .map_err(|e| corrupt("pending_profile_ops", e))?,
            saved_at: DateTime::parse_from_rfc3339(&self.saved_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::Persistence(format!("corrupt saved_at: {}", e)))?,
            token: self.token,
            distinct_id: self.distinct_id,
            people_distinct_id: self.people_distinct_id,
        })
    }
}
