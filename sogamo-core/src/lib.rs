//! # sogamo-core
//!
//! Core library for sogamo - a client-side analytics tracker.
//!
//! This library provides:
//! - Event and profile-op recording with super properties
//! - A bounded, ordered queue with at most one batch in flight per lane
//! - Batched delivery with backoff, a host delivery gate and time-boxed flushes
//! - Durable snapshots in SQLite that survive restarts
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Records move through three stages:
//! - **Pending:** queued in memory and included in every snapshot
//! - **In flight:** claimed by a flush attempt, still included in snapshots
//! - **Gone:** acknowledged by the service, dropped as malformed, or cleared by a reset
//!
//! ## Example
//!
//! ```rust,no_run
//! use sogamo_core::{Config, SnapshotStore, Tracker};
//!
//! # async fn run() -> sogamo_core::Result<()> {
//! let config = Config::load()?;
//! let store = SnapshotStore::open(&Config::database_path())?;
//! let tracker = Tracker::with_http("project-token", config.tracker, Some(store))?;
//!
//! tracker.identify("user-42");
//! tracker.track("Level Complete");
//! tracker.people().increment_by("levels", 1);
//! tracker.flush().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::{Config, LoggingConfig, TrackerConfig};
pub use delivery::{DeliveryGate, GateDecision, HttpTransport, Payload, Transport};
pub use error::{Error, Result, TransportError};
pub use flush::{FlushReport, FlushStats, LaneStatus, Trigger};
pub use people::People;
pub use persistence::{ProjectSnapshot, SnapshotStore};
pub use tracker::Tracker;
pub use types::*;

// Public modules
pub mod config;
pub mod delivery;
pub mod error;
pub mod flush;
pub mod logging;
pub mod people;
pub mod persistence;
pub mod properties;
pub mod queue;
pub mod state;
pub mod tracker;
pub mod types;
