//! Durable snapshots of tracker state
//!
//! This module stores, per project token, the identity, super properties and
//! every undelivered record in a SQLite database:
//! - Schema migrations
//! - One row per token, replaced atomically on every save
//! - Decoding failures surface as [`Error::Persistence`](crate::Error::Persistence)
//!   so callers can fall back to empty state

pub mod schema;
pub mod store;

pub use store::{ProjectSnapshot, SnapshotStore, SNAPSHOT_FORMAT_VERSION};
