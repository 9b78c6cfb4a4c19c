//! Host-facing tracker for one project token.
//!
//! A [`Tracker`] owns the project state, the flush controller, the optional
//! snapshot store and the background timer. Tracking calls are synchronous,
//! never fail and never block on the network; delivery happens on the timer,
//! on [`Tracker::flush`] and on the lifecycle hooks.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sogamo_core::{HttpTransport, SnapshotStore, Tracker, TrackerConfig};
//!
//! # async fn run() -> sogamo_core::Result<()> {
//! let store = SnapshotStore::open(&sogamo_core::Config::database_path())?;
//! let tracker = Tracker::new(
//!     "project-token",
//!     TrackerConfig::default(),
//!     Some(store),
//!     Arc::new(HttpTransport::new()?),
//! )?;
//! tracker.start();
//! tracker.track("App Opened");
//! tracker.on_terminate().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::TrackerConfig;
use crate::delivery::{DeliveryGate, HttpTransport, Transport};
use crate::error::Result;
use crate::flush::{FlushController, FlushReport, FlushStats, LaneStatus, Trigger};
use crate::people::People;
use crate::persistence::SnapshotStore;
use crate::state::{lock_state, ProjectState};
use crate::types::{Properties, QueueKind, Record};

/// Event tracked by [`Tracker::create_alias`]
pub const CREATE_ALIAS_EVENT: &str = "$create_alias";

/// Writes consistent snapshots of one project
#[derive(Clone)]
struct Persister {
    token: String,
    state: Arc<Mutex<ProjectState>>,
    store: Option<Arc<SnapshotStore>>,
}

impl Persister {
    fn save(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = lock_state(&self.state).to_snapshot(&self.token);
        store.save(&snapshot)
    }

    /// Save and log failures; the next cycle tries again
    fn save_logged(&self) {
        if let Err(e) = self.save() {
            tracing::warn!(token = %self.token, error = %e, "Failed to save snapshot");
        }
    }

    /// Like [`Persister::save_logged`], for async callers. The copy is taken
    /// under the state lock; the SQLite write runs on the blocking pool.
    async fn save_in_background(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = lock_state(&self.state).to_snapshot(&self.token);
        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(token = %self.token, error = %e, "Failed to save snapshot");
            }
            Err(e) => {
                tracing::warn!(token = %self.token, error = %e, "Snapshot task failed");
            }
        }
    }
}

struct TimerHandle {
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Records events and profile ops for one project and delivers them
pub struct Tracker {
    token: String,
    config: TrackerConfig,
    state: Arc<Mutex<ProjectState>>,
    controller: Arc<FlushController>,
    persister: Persister,
    timer: Mutex<Option<TimerHandle>>,
}

impl Tracker {
    /// Create a tracker, restoring any snapshot saved for `token`.
    ///
    /// An unreadable snapshot is logged and replaced by empty state. Only an
    /// invalid configuration is an error.
    pub fn new(
        token: impl Into<String>,
        config: TrackerConfig,
        store: Option<SnapshotStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let token = token.into();
        let store = store.map(Arc::new);

        let state = Arc::new(Mutex::new(restore(&token, &config, store.as_deref())));
        let controller = Arc::new(FlushController::new(
            token.clone(),
            state.clone(),
            transport,
            config.clone(),
        ));
        let persister = Persister {
            token: token.clone(),
            state: state.clone(),
            store,
        };

        Ok(Self {
            token,
            config,
            state,
            controller,
            persister,
            timer: Mutex::new(None),
        })
    }

    /// Tracker delivering over HTTP to `config.server_url`
    pub fn with_http(
        token: impl Into<String>,
        config: TrackerConfig,
        store: Option<SnapshotStore>,
    ) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new()?);
        Self::new(token, config, store, transport)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    // ============================================
    // Tracking
    // ============================================

    pub fn track(&self, event: &str) {
        self.track_with_properties(event, Properties::new());
    }

    /// Queue an event stamped with the current identity and super properties.
    /// `properties` win over super properties on key collisions.
    pub fn track_with_properties(&self, event: &str, properties: Properties) {
        let mut state = lock_state(&self.state);
        let merged = state
            .properties
            .event_properties(&self.token, Utc::now().timestamp(), properties);
        state.push(Record::event(event, merged));
        tracing::trace!(event, "Tracked event");
    }

    /// Tie `alias` to `distinct_id` on the service
    pub fn create_alias(&self, alias: &str, distinct_id: &str) {
        if alias.is_empty() || distinct_id.is_empty() {
            tracing::warn!(alias, distinct_id, "Ignoring alias with an empty id");
            return;
        }
        let mut properties = Properties::new();
        properties.insert("alias".to_string(), Value::from(alias));
        properties.insert("distinct_id".to_string(), Value::from(distinct_id));
        self.track_with_properties(CREATE_ALIAS_EVENT, properties);
    }

    /// Use `distinct_id` for everything tracked from now on.
    ///
    /// The first call also identifies the profile and releases profile ops
    /// recorded so far.
    pub fn identify(&self, distinct_id: &str) {
        let (outcome, released) = lock_state(&self.state).identify(distinct_id);
        if outcome.distinct_id_changed || released > 0 {
            tracing::debug!(
                changed = outcome.distinct_id_changed,
                released,
                "Identified user"
            );
        }
    }

    pub fn distinct_id(&self) -> String {
        lock_state(&self.state).properties.distinct_id().to_string()
    }

    pub fn people_distinct_id(&self) -> Option<String> {
        lock_state(&self.state)
            .properties
            .people_distinct_id()
            .map(str::to_string)
    }

    /// Profile operations for the current user
    pub fn people(&self) -> People<'_> {
        People::new(&self.state)
    }

    // ============================================
    // Super properties
    // ============================================

    pub fn register_super_properties(&self, properties: Properties) {
        lock_state(&self.state)
            .properties
            .register_super_properties(properties);
    }

    /// Register super properties without overwriting existing ones, unless
    /// an existing value equals `default_value`
    pub fn register_super_properties_once(&self, properties: Properties, default_value: Option<Value>) {
        lock_state(&self.state)
            .properties
            .register_super_properties_once(properties, default_value);
    }

    pub fn unregister_super_property(&self, key: &str) {
        lock_state(&self.state).properties.unregister(key);
    }

    pub fn clear_super_properties(&self) {
        lock_state(&self.state).properties.clear_super_properties();
    }

    pub fn current_super_properties(&self) -> Properties {
        lock_state(&self.state).properties.current_super_properties()
    }

    /// Display name for this user in live views
    pub fn set_name_tag(&self, name_tag: &str) {
        lock_state(&self.state).properties.set_name_tag(name_tag);
    }

    /// Forget the user and drop every undelivered record, then persist
    pub fn reset(&self) {
        lock_state(&self.state).reset();
        tracing::info!(token = %self.token, "Tracker reset");
        self.persister.save_logged();
    }

    // ============================================
    // Delivery
    // ============================================

    /// Deliver what is queued now, ignoring any backoff delay
    pub async fn flush(&self) -> FlushReport {
        self.controller.attempt_flush(Trigger::Manual).await
    }

    /// Like [`flush`](Self::flush) but gives up after `budget`, putting the
    /// unfinished batch back in the queue
    pub async fn flush_with_budget(&self, budget: Duration) -> Option<FlushReport> {
        self.controller.flush_with_budget(budget).await
    }

    /// Save a snapshot now
    pub fn archive(&self) -> Result<()> {
        self.persister.save()
    }

    pub fn set_delivery_gate(&self, gate: Option<Arc<dyn DeliveryGate>>) {
        self.controller.set_delivery_gate(gate);
    }

    pub fn set_server_url(&self, url: &str) -> Result<()> {
        self.controller.set_server_url(url)
    }

    /// Change the flush timer period; 0 makes flushing manual-only
    pub fn set_flush_interval(&self, secs: u64) {
        self.controller.set_flush_interval_secs(secs);
        if let Some(timer) = self.timer_lock().as_ref() {
            timer.wake.notify_one();
        }
    }

    pub fn stats(&self) -> FlushStats {
        self.controller.stats()
    }

    pub fn lane_status(&self, kind: QueueKind) -> LaneStatus {
        self.controller.lane_status(kind)
    }

    /// Records of a lane not yet delivered, in flight included
    pub fn pending_count(&self, kind: QueueKind) -> usize {
        let state = lock_state(&self.state);
        state.queue.pending_len(kind) + state.queue.in_flight_len(kind)
    }

    /// Profile ops waiting for an identify
    pub fn withheld_count(&self) -> usize {
        lock_state(&self.state).queue.withheld_len()
    }

    // ============================================
    // Timer and lifecycle
    // ============================================

    /// Start the flush and snapshot timer on the current tokio runtime.
    /// Does nothing if it is already running or there is no runtime.
    pub fn start(&self) {
        let mut timer = self.timer_lock();
        if timer.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(token = %self.token, "No tokio runtime, timer not started");
            return;
        };

        let wake = Arc::new(Notify::new());
        let task = runtime.spawn(run_timer(
            self.controller.clone(),
            self.persister.clone(),
            self.config.snapshot_interval(),
            wake.clone(),
        ));
        *timer = Some(TimerHandle { wake, task });
        tracing::debug!(token = %self.token, "Timer started");
    }

    /// Stop the timer. A flush it was running is cancelled and rolled back.
    pub async fn stop(&self) {
        let handle = self.timer_lock().take();
        if let Some(handle) = handle {
            handle.task.abort();
            let _ = handle.task.await;
            tracing::debug!(token = %self.token, "Timer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer_lock().is_some()
    }

    /// Host moved to the background: pause the timer, try a short flush and
    /// save a snapshot
    pub async fn on_background(&self) {
        self.stop().await;
        if self.config.flush_on_background {
            self.controller
                .flush_with_budget(self.config.background_flush_budget())
                .await;
        }
        self.persister.save_in_background().await;
    }

    /// Host is back in the foreground: resume the timer
    pub fn on_foreground(&self) {
        self.start();
    }

    /// Host is about to exit: stop the timer, try a last flush and save a
    /// final snapshot
    pub async fn on_terminate(&self) {
        self.stop().await;
        self.controller
            .flush_with_budget(self.config.background_flush_budget())
            .await;
        self.persister.save_in_background().await;
    }

    fn timer_lock(&self) -> std::sync::MutexGuard<'_, Option<TimerHandle>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_lock().take() {
            handle.task.abort();
        }
    }
}

fn restore(token: &str, config: &TrackerConfig, store: Option<&SnapshotStore>) -> ProjectState {
    let Some(store) = store else {
        return ProjectState::new(config.max_queue_length);
    };
    match store.load(token) {
        Ok(Some(snapshot)) => {
            let state = ProjectState::from_snapshot(snapshot, config.max_queue_length);
            tracing::info!(
                token,
                events = state.queue.pending_len(QueueKind::Events),
                profile_ops = state.queue.pending_len(QueueKind::People),
                withheld = state.queue.withheld_len(),
                "Restored snapshot"
            );
            state
        }
        Ok(None) => ProjectState::new(config.max_queue_length),
        Err(e) => {
            tracing::warn!(token, error = %e, "Snapshot unreadable, starting empty");
            ProjectState::new(config.max_queue_length)
        }
    }
}

async fn run_timer(
    controller: Arc<FlushController>,
    persister: Persister,
    snapshot_every: Option<Duration>,
    wake: Arc<Notify>,
) {
    let mut next_flush = flush_deadline(&controller);
    let mut next_snapshot = snapshot_every.map(|period| Instant::now() + period);

    loop {
        tokio::select! {
            _ = wait_until(next_flush) => {
                controller.attempt_flush(Trigger::Timer).await;
                next_flush = flush_deadline(&controller);
            }
            _ = wait_until(next_snapshot) => {
                persister.save_in_background().await;
                next_snapshot = snapshot_every.map(|period| Instant::now() + period);
            }
            _ = wake.notified() => {
                next_flush = flush_deadline(&controller);
            }
        }
    }
}

fn flush_deadline(controller: &FlushController) -> Option<Instant> {
    controller
        .settings()
        .flush_interval()
        .map(|period| Instant::now() + period)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
