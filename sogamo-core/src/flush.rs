//! Flush controller: drains the queue through a [`Transport`].
//!
//! Each lane runs its own small state machine:
//!
//! ```text
//!   Idle ──attempt──► Flushing ──success──► Idle
//!                        │
//!                        └──retryable failure──► Idle (backing off)
//! ```
//!
//! Timer and manual triggers go through the same [`FlushController::attempt_flush`],
//! so a lane that is already flushing is skipped no matter who asked. A timer
//! trigger also skips a lane that is backing off; a manual trigger does not.
//!
//! Every batch is wrapped in a guard that rolls it back when dropped. If the
//! flush future is cancelled mid-send (for example by the time box in
//! [`FlushController::flush_with_budget`]) the batch goes back to the front
//! of its lane and the lane returns to `Idle`.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::delivery::{encode_batch, DeliveryGate, GateDecision, Transport};
use crate::error::{Result, TransportError};
use crate::queue::{BatchId, ClaimedBatch};
use crate::state::{lock_state, ProjectState};
use crate::types::QueueKind;

/// What started a flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic timer; respects backoff
    Timer,
    /// Explicit request from the host; ignores backoff
    Manual,
}

/// Current state of one lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneStatus {
    Idle,
    Flushing,
}

#[derive(Debug)]
struct LaneState {
    status: LaneStatus,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Default for LaneState {
    fn default() -> Self {
        Self {
            status: LaneStatus::Idle,
            failures: 0,
            retry_at: None,
        }
    }
}

/// Running totals since the controller was created
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushStats {
    /// Batches acknowledged by the service
    pub batches_sent: usize,
    /// Records in those batches
    pub records_sent: usize,
    /// Records dropped after a permanent failure or an encoding error
    pub records_dropped: usize,
    /// Retryable delivery failures
    pub failures: usize,
    /// Attempts held back by the delivery gate
    pub deferrals: usize,
}

/// Outcome of a single flush attempt
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// The delivery gate said no; nothing was claimed
    pub deferred: bool,
    pub batches_sent: usize,
    pub records_sent: usize,
    pub records_dropped: usize,
    pub retryable_failures: usize,
    /// Lanes skipped because another attempt was already flushing them
    pub busy: Vec<QueueKind>,
    /// Lanes skipped because they are waiting out a backoff delay
    pub backing_off: Vec<QueueKind>,
}

impl FlushReport {
    /// Whether the attempt did any work at all
    pub fn is_noop(&self) -> bool {
        self.batches_sent == 0 && self.records_dropped == 0 && self.retryable_failures == 0
    }
}

/// Settings read at the start of each lane drain
#[derive(Debug, Clone)]
struct DrainSettings {
    base_url: String,
    batch_size: usize,
    max_batches: usize,
    request_timeout: Duration,
}

enum Skip {
    Busy,
    BackingOff,
}

/// Drives delivery for one project
pub struct FlushController {
    token: String,
    state: Arc<Mutex<ProjectState>>,
    transport: Arc<dyn Transport>,
    gate: RwLock<Option<Arc<dyn DeliveryGate>>>,
    settings: Mutex<TrackerConfig>,
    lanes: Mutex<[LaneState; 2]>,
    stats: Mutex<FlushStats>,
}

impl FlushController {
    pub fn new(
        token: impl Into<String>,
        state: Arc<Mutex<ProjectState>>,
        transport: Arc<dyn Transport>,
        settings: TrackerConfig,
    ) -> Self {
        Self {
            token: token.into(),
            state,
            transport,
            gate: RwLock::new(None),
            settings: Mutex::new(settings),
            lanes: Mutex::new([LaneState::default(), LaneState::default()]),
            stats: Mutex::new(FlushStats::default()),
        }
    }

    /// Install or remove the delivery gate
    pub fn set_delivery_gate(&self, gate: Option<Arc<dyn DeliveryGate>>) {
        *self.gate.write().unwrap_or_else(PoisonError::into_inner) = gate;
    }

    /// Point delivery at another server. Takes effect from the next batch.
    pub fn set_server_url(&self, url: impl Into<String>) -> Result<()> {
        let mut settings = self.settings_lock();
        let mut updated = settings.clone();
        updated.server_url = url.into();
        updated.validate()?;
        *settings = updated;
        Ok(())
    }

    /// Change the timer period; 0 makes flushing manual-only
    pub fn set_flush_interval_secs(&self, secs: u64) {
        self.settings_lock().flush_interval_secs = secs;
    }

    /// Copy of the current settings
    pub fn settings(&self) -> TrackerConfig {
        self.settings_lock().clone()
    }

    pub fn stats(&self) -> FlushStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn lane_status(&self, kind: QueueKind) -> LaneStatus {
        self.lanes_lock()[lane_index(kind)].status
    }

    /// Retryable failures in a row for a lane
    pub fn consecutive_failures(&self, kind: QueueKind) -> u32 {
        self.lanes_lock()[lane_index(kind)].failures
    }

    /// Time left before a timer trigger will try the lane again
    pub fn retry_in(&self, kind: QueueKind) -> Option<Duration> {
        let retry_at = self.lanes_lock()[lane_index(kind)].retry_at?;
        let now = Instant::now();
        (retry_at > now).then(|| retry_at - now)
    }

    /// Try to deliver what is queued: events first, then profile ops.
    ///
    /// Never fails; problems are logged and reflected in the report.
    pub async fn attempt_flush(&self, trigger: Trigger) -> FlushReport {
        let mut report = FlushReport::default();

        let mut guards = Vec::with_capacity(QueueKind::ALL.len());
        for kind in QueueKind::ALL {
            match self.acquire_lane(kind, trigger) {
                Ok(guard) => guards.push(guard),
                Err(Skip::Busy) => report.busy.push(kind),
                Err(Skip::BackingOff) => report.backing_off.push(kind),
            }
        }
        if guards.is_empty() {
            tracing::trace!(?trigger, "No lane available to flush");
            return report;
        }

        if self.gate_decision() == GateDecision::Defer {
            tracing::debug!(?trigger, "Delivery deferred by gate");
            self.update_stats(|stats| stats.deferrals += 1);
            report.deferred = true;
            return report;
        }

        let settings = self.drain_settings();
        for guard in &guards {
            self.drain_lane(guard.kind, &settings, &mut report).await;
        }

        if !report.is_noop() {
            tracing::debug!(
                ?trigger,
                batches = report.batches_sent,
                records = report.records_sent,
                dropped = report.records_dropped,
                failures = report.retryable_failures,
                "Flush attempt finished"
            );
        }
        report
    }

    /// Manual flush that gives up after `budget`.
    ///
    /// Returns `None` when the budget ran out. The batch being sent at that
    /// moment is rolled back.
    pub async fn flush_with_budget(&self, budget: Duration) -> Option<FlushReport> {
        match tokio::time::timeout(budget, self.attempt_flush(Trigger::Manual)).await {
            Ok(report) => Some(report),
            Err(_) => {
                tracing::warn!(budget_ms = budget.as_millis() as u64, "Flush did not finish in time");
                None
            }
        }
    }

    async fn drain_lane(&self, kind: QueueKind, settings: &DrainSettings, report: &mut FlushReport) {
        let url = format!("{}{}", settings.base_url, kind.endpoint());

        for _ in 0..settings.max_batches {
            let Some(batch) = self.claim(kind, settings.batch_size) else {
                break;
            };
            let in_flight = InFlight::new(&self.state, batch.id);

            let encoded = encode_batch(&batch, &self.token);
            if !encoded.rejected.is_empty() {
                let ids: Vec<Uuid> = encoded.rejected.iter().map(|(id, _)| *id).collect();
                for (id, error) in &encoded.rejected {
                    tracing::warn!(lane = %kind, record_id = %id, error = %error, "Dropping record that cannot be encoded");
                }
                let dropped = in_flight.discard(&ids);
                report.records_dropped += dropped;
                self.update_stats(|stats| stats.records_dropped += dropped);
            }

            let Some(payload) = encoded.payload else {
                in_flight.commit();
                continue;
            };

            let result = self
                .transport
                .send(&url, &payload, settings.request_timeout)
                .await;

            match result {
                Ok(()) => {
                    if !in_flight.commit() {
                        tracing::debug!(batch = %batch.id, "Batch delivered after the queue was reset");
                    }
                    self.record_success(kind);
                    report.batches_sent += 1;
                    report.records_sent += payload.record_count;
                    self.update_stats(|stats| {
                        stats.batches_sent += 1;
                        stats.records_sent += payload.record_count;
                    });
                }
                Err(TransportError::Permanent(message)) => {
                    tracing::warn!(
                        lane = %kind,
                        batch = %batch.id,
                        records = payload.record_count,
                        error = %message,
                        "Service rejected batch, dropping it"
                    );
                    if in_flight.commit() {
                        report.records_dropped += payload.record_count;
                        self.update_stats(|stats| stats.records_dropped += payload.record_count);
                    }
                    self.record_success(kind);
                }
                Err(TransportError::Retryable(message)) => {
                    in_flight.rollback();
                    let delay = self.record_failure(kind, batch.len());
                    report.retryable_failures += 1;
                    tracing::warn!(
                        lane = %kind,
                        batch = %batch.id,
                        error = %message,
                        retry_in_ms = delay.as_millis() as u64,
                        "Delivery failed, batch kept for retry"
                    );
                    break;
                }
            }
        }
    }

    fn acquire_lane(&self, kind: QueueKind, trigger: Trigger) -> std::result::Result<LaneGuard<'_>, Skip> {
        let mut lanes = self.lanes_lock();
        let lane = &mut lanes[lane_index(kind)];
        if lane.status == LaneStatus::Flushing {
            return Err(Skip::Busy);
        }
        if trigger == Trigger::Timer && lane.retry_at.is_some_and(|at| at > Instant::now()) {
            return Err(Skip::BackingOff);
        }
        lane.status = LaneStatus::Flushing;
        Ok(LaneGuard {
            controller: self,
            kind,
        })
    }

    fn gate_decision(&self) -> GateDecision {
        let gate = self
            .gate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        gate.map_or(GateDecision::Allow, |gate| gate.should_flush())
    }

    fn claim(&self, kind: QueueKind, batch_size: usize) -> Option<ClaimedBatch> {
        lock_state(&self.state).queue.claim_batch(kind, batch_size)
    }

    fn drain_settings(&self) -> DrainSettings {
        let settings = self.settings_lock();
        DrainSettings {
            base_url: settings.base_url().to_string(),
            batch_size: settings.max_batch_size,
            max_batches: settings.max_batches_per_flush,
            request_timeout: settings.request_timeout(),
        }
    }

    fn record_success(&self, kind: QueueKind) {
        let mut lanes = self.lanes_lock();
        let lane = &mut lanes[lane_index(kind)];
        lane.failures = 0;
        lane.retry_at = None;
    }

    fn record_failure(&self, kind: QueueKind, records: usize) -> Duration {
        let (initial, max) = {
            let settings = self.settings_lock();
            (settings.initial_backoff(), settings.max_backoff())
        };
        let delay = {
            let mut lanes = self.lanes_lock();
            let lane = &mut lanes[lane_index(kind)];
            lane.failures = lane.failures.saturating_add(1);
            let delay = backoff_delay(initial, max, lane.failures);
            lane.retry_at = Some(Instant::now() + delay);
            delay
        };
        tracing::trace!(lane = %kind, records, "Recorded delivery failure");
        self.update_stats(|stats| stats.failures += 1);
        delay
    }

    fn update_stats(&self, f: impl FnOnce(&mut FlushStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn settings_lock(&self) -> std::sync::MutexGuard<'_, TrackerConfig> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lanes_lock(&self) -> std::sync::MutexGuard<'_, [LaneState; 2]> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Delay before the next timer-driven attempt after `failures` failures in a
/// row: `initial * 2^(failures - 1)`, capped at `max`.
pub fn backoff_delay(initial: Duration, max: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (failures - 1).min(31);
    initial.saturating_mul(1u32 << exponent).min(max)
}

fn lane_index(kind: QueueKind) -> usize {
    match kind {
        QueueKind::Events => 0,
        QueueKind::People => 1,
    }
}

/// Marks a lane as flushing for as long as it lives
struct LaneGuard<'a> {
    controller: &'a FlushController,
    kind: QueueKind,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        self.controller.lanes_lock()[lane_index(self.kind)].status = LaneStatus::Idle;
    }
}

/// A claimed batch that rolls back unless settled
struct InFlight<'a> {
    state: &'a Mutex<ProjectState>,
    id: BatchId,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(state: &'a Mutex<ProjectState>, id: BatchId) -> Self {
        Self {
            state,
            id,
            settled: false,
        }
    }

    fn discard(&self, record_ids: &[Uuid]) -> usize {
        lock_state(self.state).queue.discard_in_flight(self.id, record_ids)
    }

    /// False when the batch was voided by a reset in the meantime
    fn commit(mut self) -> bool {
        self.settled = true;
        lock_state(self.state).queue.commit(self.id)
    }

    fn rollback(mut self) -> bool {
        self.settled = true;
        lock_state(self.state).queue.rollback(self.id)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled && lock_state(self.state).queue.rollback(self.id) {
            tracing::debug!(batch = %self.id, "Flush cancelled, batch rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Payload;
    use crate::types::{Properties, Record};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Records every payload and answers from a script (success once it runs out)
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<std::result::Result<(), TransportError>>>,
        sent: Mutex<Vec<(String, serde_json::Value)>>,
        delay: Option<Duration>,
    }

    impl ScriptedTransport {
        fn with_responses(responses: Vec<std::result::Result<(), TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        fn sent_names(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, body)| body.as_array().cloned().unwrap_or_default())
                .filter_map(|object| object["event"].as_str().map(str::to_string))
                .collect()
        }

        fn send_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            url: &str,
            payload: &Payload,
            _timeout: Duration,
        ) -> std::result::Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push((url.to_string(), payload.body.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn settings(batch_size: usize) -> TrackerConfig {
        TrackerConfig {
            server_url: "http://collector.test".to_string(),
            max_batch_size: batch_size,
            ..TrackerConfig::default()
        }
    }

    fn controller(transport: Arc<ScriptedTransport>, batch_size: usize) -> (FlushController, Arc<Mutex<ProjectState>>) {
        let state = Arc::new(Mutex::new(ProjectState::new(100)));
        let controller = FlushController::new("tok", state.clone(), transport, settings(batch_size));
        (controller, state)
    }

    fn push_events(state: &Mutex<ProjectState>, names: &[&str]) {
        let mut state = state.lock().unwrap();
        for name in names {
            state.push(Record::event(*name, Properties::new()));
        }
    }

    fn pending(state: &Mutex<ProjectState>, kind: QueueKind) -> Vec<String> {
        state
            .lock()
            .unwrap()
            .queue
            .pending(kind)
            .map(|r| r.label().to_string())
            .collect()
    }

    #[test]
    fn test_backoff_delay() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(initial, max, 0), Duration::ZERO);
        assert_eq!(backoff_delay(initial, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(initial, max, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(initial, max, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(initial, max, 7), max);
        assert_eq!(backoff_delay(initial, max, u32::MAX), max);
    }

    #[tokio::test]
    async fn test_delivers_in_order_across_batches() {
        crate::logging::init_test();
        let transport = Arc::new(ScriptedTransport::default());
        let (controller, state) = controller(transport.clone(), 2);
        push_events(&state, &["A", "B", "C", "D", "E"]);

        let report = controller.attempt_flush(Trigger::Manual).await;

        assert_eq!(report.batches_sent, 3);
        assert_eq!(report.records_sent, 5);
        assert_eq!(transport.sent_names(), vec!["A", "B", "C", "D", "E"]);
        assert_eq!(transport.sent.lock().unwrap()[0].0, "http://collector.test/track");
        assert!(state.lock().unwrap().queue.is_empty());
        assert_eq!(controller.lane_status(QueueKind::Events), LaneStatus::Idle);
    }

    #[tokio::test]
    async fn test_batch_cap_per_attempt() {
        let transport = Arc::new(ScriptedTransport::default());
        let state = Arc::new(Mutex::new(ProjectState::new(100)));
        let mut config = settings(1);
        config.max_batches_per_flush = 2;
        let controller = FlushController::new("tok", state.clone(), transport.clone(), config);
        push_events(&state, &["A", "B", "C"]);

        let report = controller.attempt_flush(Trigger::Manual).await;
        assert_eq!(report.batches_sent, 2);
        assert_eq!(pending(&state, QueueKind::Events), vec!["C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_rolls_back_and_backs_off() {
        let transport = Arc::new(ScriptedTransport::with_responses(vec![Err(
            TransportError::Retryable("503".to_string()),
        )]));
        let (controller, state) = controller(transport.clone(), 2);
        push_events(&state, &["A", "B", "C"]);

        let report = controller.attempt_flush(Trigger::Timer).await;
        assert_eq!(report.retryable_failures, 1);
        assert_eq!(pending(&state, QueueKind::Events), vec!["A", "B", "C"]);
        assert_eq!(controller.consecutive_failures(QueueKind::Events), 1);
        assert!(controller.retry_in(QueueKind::Events).is_some());

        // the timer waits out the backoff
        let report = controller.attempt_flush(Trigger::Timer).await;
        assert_eq!(report.backing_off, vec![QueueKind::Events]);
        assert_eq!(transport.send_count(), 1);

        // an explicit flush does not
        let report = controller.attempt_flush(Trigger::Manual).await;
        assert_eq!(report.records_sent, 3);
        assert_eq!(transport.sent_names(), vec!["A", "B", "A", "B", "C"]);
        assert_eq!(controller.consecutive_failures(QueueKind::Events), 0);
        assert!(controller.retry_in(QueueKind::Events).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_retries_after_backoff_elapses() {
        let transport = Arc::new(ScriptedTransport::with_responses(vec![Err(
            TransportError::Retryable("timeout".to_string()),
        )]));
        let (controller, state) = controller(transport.clone(), 10);
        push_events(&state, &["A"]);

        controller.attempt_flush(Trigger::Timer).await;
        tokio::time::advance(Duration::from_millis(1001)).await;

        let report = controller.attempt_flush(Trigger::Timer).await;
        assert_eq!(report.records_sent, 1);
        assert!(state.lock().unwrap().queue.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_batch() {
        let transport = Arc::new(ScriptedTransport::with_responses(vec![Err(
            TransportError::Permanent("400".to_string()),
        )]));
        let (controller, state) = controller(transport.clone(), 2);
        push_events(&state, &["A", "B", "C"]);

        let report = controller.attempt_flush(Trigger::Manual).await;

        assert_eq!(report.records_dropped, 2);
        assert_eq!(report.records_sent, 1);
        assert!(state.lock().unwrap().queue.is_empty());
        assert_eq!(controller.stats().records_dropped, 2);
        assert_eq!(controller.consecutive_failures(QueueKind::Events), 0);
    }

    #[tokio::test]
    async fn test_malformed_record_dropped_rest_delivered() {
        let transport = Arc::new(ScriptedTransport::with_responses(vec![Err(
            TransportError::Retryable("503".to_string()),
        )]));
        let (controller, state) = controller(transport.clone(), 10);
        push_events(&state, &["A", "", "C"]);

        let report = controller.attempt_flush(Trigger::Manual).await;
        assert_eq!(report.records_dropped, 1);
        // the rollback does not bring the malformed record back
        assert_eq!(pending(&state, QueueKind::Events), vec!["A", "C"]);

        let report = controller.attempt_flush(Trigger::Manual).await;
        assert_eq!(report.records_sent, 2);
        assert_eq!(report.records_dropped, 0);
    }

    #[tokio::test]
    async fn test_gate_defers_without_claiming() {
        let transport = Arc::new(ScriptedTransport::default());
        let (controller, state) = controller(transport.clone(), 10);
        push_events(&state, &["A"]);
        controller.set_delivery_gate(Some(Arc::new(|| GateDecision::Defer)));

        let report = controller.attempt_flush(Trigger::Manual).await;
        assert!(report.deferred);
        assert_eq!(transport.send_count(), 0);
        assert_eq!(pending(&state, QueueKind::Events), vec!["A"]);
        assert_eq!(controller.stats().deferrals, 1);

        controller.set_delivery_gate(None);
        let report = controller.attempt_flush(Trigger::Manual).await;
        assert_eq!(report.records_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_attempts_are_single_flight() {
        let transport = Arc::new(ScriptedTransport::slow(Duration::from_secs(1)));
        let (controller, state) = controller(transport.clone(), 10);
        push_events(&state, &["A", "B"]);

        let (first, second) = tokio::join!(
            controller.attempt_flush(Trigger::Timer),
            controller.attempt_flush(Trigger::Manual)
        );

        assert_eq!(first.records_sent, 2);
        assert!(second.busy.contains(&QueueKind::Events));
        assert_eq!(second.records_sent, 0);
        assert_eq!(transport.send_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_expiry_rolls_back() {
        let transport = Arc::new(ScriptedTransport::slow(Duration::from_secs(30)));
        let (controller, state) = controller(transport.clone(), 1);
        push_events(&state, &["A", "B"]);

        let report = controller.flush_with_budget(Duration::from_secs(5)).await;

        assert!(report.is_none());
        assert_eq!(pending(&state, QueueKind::Events), vec!["A", "B"]);
        assert!(!state.lock().unwrap().queue.is_in_flight(QueueKind::Events));
        assert_eq!(controller.lane_status(QueueKind::Events), LaneStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_during_send_does_not_resurrect() {
        let transport = Arc::new(ScriptedTransport::slow(Duration::from_secs(1)));
        let (controller, state) = controller(transport.clone(), 10);
        push_events(&state, &["A", "B"]);

        let reset = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            state.lock().unwrap().reset();
        };
        let (report, ()) = tokio::join!(controller.attempt_flush(Trigger::Manual), reset);

        assert_eq!(report.batches_sent, 1);
        assert!(state.lock().unwrap().queue.is_empty());
    }

    #[tokio::test]
    async fn test_people_lane_goes_to_engage() {
        let transport = Arc::new(ScriptedTransport::default());
        let (controller, state) = controller(transport.clone(), 10);
        {
            let mut state = state.lock().unwrap();
            let mut props = Properties::new();
            props.insert("plan".to_string(), serde_json::json!("pro"));
            state.push(Record::profile_op(
                crate::types::ProfileOpType::Set,
                props,
                Some("u".to_string()),
            ));
        }

        controller.attempt_flush(Trigger::Manual).await;
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "http://collector.test/engage");
        assert_eq!(sent[0].1[0]["$set"]["plan"], "pro");
    }

    #[test]
    fn test_set_server_url_validates() {
        let transport = Arc::new(ScriptedTransport::default());
        let (controller, _) = controller(transport, 10);
        assert!(controller.set_server_url("ftp://nope").is_err());
        assert!(controller.set_server_url("https://eu.sogamo.com/").is_ok());
        assert_eq!(controller.settings().base_url(), "https://eu.sogamo.com");
    }
}
