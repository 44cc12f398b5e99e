//! Per-DLQ failure tracking and circuit breaking
//!
//! ## Circuit States
//!
//! ```text
//! ┌─────────┐  consecutive >= threshold  ┌────────┐
//! │ CLOSED  │ ─────────────────────────> │  OPEN  │ <── failure (cooldown restarts)
//! └─────────┘                            └────────┘
//!      ^                                      │
//!      │                                      │ cooldown elapsed (checked lazily)
//!      │                                      v
//!      │        probe success          ┌─────────────┐
//!      └────────────────────────────── │  HALF-OPEN  │
//!                                      └─────────────┘
//!                                             │ probe failure
//!                                             └──────────> OPEN
//! ```
//!
//! The tracker is owned by its consumer task and never shared. Read-only
//! snapshots go out through a `watch` channel to [`CircuitView`]s, which the
//! [`CircuitRegistry`] collects for the health surface.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit phase
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    /// Messages flow normally
    Closed,
    /// Republishing is suspended until the cooldown elapses
    Open,
    /// Cooldown elapsed; the next publish is a probe
    HalfOpen,
}

/// Failure counters for one DLQ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureState {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Stays set through half-open until a probe succeeds
    pub circuit_open: bool,
}

/// What the tracker publishes after every change
#[derive(Debug, Clone)]
pub struct FailureSnapshot {
    pub state: FailureState,
    pub circuit: CircuitState,
    pub reopen_at: Option<Instant>,
}

impl Default for FailureSnapshot {
    fn default() -> Self {
        Self {
            state: FailureState::default(),
            circuit: CircuitState::Closed,
            reopen_at: None,
        }
    }
}

pub struct FailureTracker {
    dlq_name: String,
    threshold: u32,
    cooldown: Duration,
    state: FailureState,
    circuit: CircuitState,
    reopen_at: Option<Instant>,
    snapshots: watch::Sender<FailureSnapshot>,
}

impl FailureTracker {
    /// `threshold` below 1 is treated as 1
    pub fn new(dlq_name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        let (snapshots, _) = watch::channel(FailureSnapshot::default());
        Self {
            dlq_name: dlq_name.into(),
            threshold: threshold.max(1),
            cooldown,
            state: FailureState::default(),
            circuit: CircuitState::Closed,
            reopen_at: None,
            snapshots,
        }
    }

    pub fn dlq_name(&self) -> &str {
        &self.dlq_name
    }

    pub fn state(&self) -> &FailureState {
        &self.state
    }

    pub fn circuit(&self) -> CircuitState {
        self.circuit
    }

    /// When an open circuit moves to half-open
    pub fn reopen_at(&self) -> Option<Instant> {
        match self.circuit {
            CircuitState::Open => self.reopen_at,
            _ => None,
        }
    }

    /// Read-only view for other tasks
    pub fn view(&self) -> CircuitView {
        CircuitView {
            dlq_name: self.dlq_name.clone(),
            snapshots: self.snapshots.subscribe(),
        }
    }

    /// Whether redelivery is suspended at `now`.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open here;
    /// there is no timer behind it.
    pub fn is_circuit_open(&mut self, now: Instant) -> bool {
        if self.circuit == CircuitState::Open && self.reopen_at.is_some_and(|at| now >= at) {
            self.circuit = CircuitState::HalfOpen;
            info!(dlq_name = %self.dlq_name, "Circuit half-open, next message is a probe");
            self.publish();
        }
        self.circuit == CircuitState::Open
    }

    /// State handed to the redelivery policy: `circuit_open` is only set
    /// while messages must be rejected, so a half-open probe gets through.
    pub fn decision_state(&mut self, now: Instant) -> FailureState {
        let circuit_open = self.is_circuit_open(now);
        FailureState {
            circuit_open,
            ..self.state.clone()
        }
    }

    pub fn record_success(&mut self) {
        let changed = self.state.consecutive_failures != 0 || self.circuit != CircuitState::Closed;

        self.state.consecutive_failures = 0;
        if self.circuit != CircuitState::Closed {
            info!(dlq_name = %self.dlq_name, "Circuit closed, probe succeeded");
            self.circuit = CircuitState::Closed;
            self.state.circuit_open = false;
            self.reopen_at = None;
        }

        if changed {
            self.publish();
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.state.last_failure_at = Some(Utc::now());

        match self.circuit {
            CircuitState::Closed if self.state.consecutive_failures >= self.threshold => {
                warn!(
                    dlq_name = %self.dlq_name,
                    consecutive_failures = self.state.consecutive_failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "Circuit opened"
                );
                self.open(now);
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                self.reopen_at = Some(now + self.cooldown);
            }
            CircuitState::HalfOpen => {
                warn!(dlq_name = %self.dlq_name, "Probe failed, circuit reopened");
                self.open(now);
            }
        }

        self.publish();
    }

    fn open(&mut self, now: Instant) {
        self.circuit = CircuitState::Open;
        self.state.circuit_open = true;
        self.reopen_at = Some(now + self.cooldown);
    }

    fn publish(&self) {
        self.snapshots.send_replace(FailureSnapshot {
            state: self.state.clone(),
            circuit: self.circuit,
            reopen_at: self.reopen_at(),
        });
    }
}

/// Read-only, thread-safe view of one tracker
#[derive(Debug, Clone)]
pub struct CircuitView {
    dlq_name: String,
    snapshots: watch::Receiver<FailureSnapshot>,
}

impl CircuitView {
    pub fn dlq_name(&self) -> &str {
        &self.dlq_name
    }

    pub fn snapshot(&self) -> FailureSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.snapshots.borrow().state.circuit_open
    }

    pub fn report(&self, now: Instant) -> CircuitReport {
        let snapshot = self.snapshot();
        CircuitReport {
            dlq_name: self.dlq_name.clone(),
            state: snapshot.circuit,
            circuit_open: snapshot.state.circuit_open,
            consecutive_failures: snapshot.state.consecutive_failures,
            last_failure_at: snapshot.state.last_failure_at,
            cooldown_remaining_secs: snapshot
                .reopen_at
                .map(|at| at.saturating_duration_since(now).as_secs()),
        }
    }
}

/// Circuit status of one DLQ as served by `/circuits`
#[derive(Debug, Clone, Serialize)]
pub struct CircuitReport {
    pub dlq_name: String,
    pub state: CircuitState,
    pub circuit_open: bool,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: Option<u64>,
}

/// Circuit views keyed by DLQ name
#[derive(Debug, Clone, Default)]
pub struct CircuitRegistry {
    views: Arc<BTreeMap<String, CircuitView>>,
}

impl CircuitRegistry {
    pub fn new(views: impl IntoIterator<Item = CircuitView>) -> Self {
        Self {
            views: Arc::new(
                views
                    .into_iter()
                    .map(|view| (view.dlq_name.clone(), view))
                    .collect(),
            ),
        }
    }

    /// `None` for an unknown DLQ
    pub fn is_circuit_open(&self, dlq_name: &str) -> Option<bool> {
        self.views.get(dlq_name).map(CircuitView::is_circuit_open)
    }

    pub fn get(&self, dlq_name: &str) -> Option<&CircuitView> {
        self.views.get(dlq_name)
    }

    pub fn dlq_names(&self) -> impl Iterator<Item = &str> {
        self.views.keys().map(String::as_str)
    }

    pub fn report(&self) -> Vec<CircuitReport> {
        let now = Instant::now();
        self.views.values().map(|view| view.report(now)).collect()
    }

    pub fn open_count(&self) -> usize {
        self.views.values().filter(|v| v.is_circuit_open()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(30);

    fn tracker(threshold: u32) -> FailureTracker {
        FailureTracker::new("bot-events.dlq", threshold, COOLDOWN)
    }

    #[test]
    fn test_opens_at_threshold() {
        let t0 = Instant::now();
        let mut tracker = tracker(3);

        tracker.record_failure(t0);
        tracker.record_failure(t0);
        assert!(!tracker.is_circuit_open(t0));
        assert!(!tracker.state().circuit_open);

        tracker.record_failure(t0);
        assert!(tracker.is_circuit_open(t0));
        assert!(tracker.state().circuit_open);
        assert_eq!(tracker.state().consecutive_failures, 3);
        assert!(tracker.state().last_failure_at.is_some());
        assert_eq!(tracker.reopen_at(), Some(t0 + COOLDOWN));
    }

    #[test]
    fn test_threshold_of_one() {
        let t0 = Instant::now();
        let mut tracker = tracker(1);
        tracker.record_failure(t0);
        assert_eq!(tracker.circuit(), CircuitState::Open);
    }

    #[test]
    fn test_zero_threshold_treated_as_one() {
        let t0 = Instant::now();
        let mut tracker = tracker(0);
        assert!(!tracker.is_circuit_open(t0));
        tracker.record_failure(t0);
        assert!(tracker.is_circuit_open(t0));
    }

    #[test]
    fn test_success_resets_counter() {
        let t0 = Instant::now();
        let mut tracker = tracker(3);
        tracker.record_failure(t0);
        tracker.record_failure(t0);
        tracker.record_success();
        assert_eq!(tracker.state().consecutive_failures, 0);

        tracker.record_failure(t0);
        tracker.record_failure(t0);
        assert!(!tracker.is_circuit_open(t0));
    }

    #[test]
    fn test_half_open_after_cooldown_checked_lazily() {
        let t0 = Instant::now();
        let mut tracker = tracker(1);
        tracker.record_failure(t0);

        assert!(tracker.is_circuit_open(t0 + Duration::from_secs(29)));
        assert_eq!(tracker.circuit(), CircuitState::Open);

        assert!(!tracker.is_circuit_open(t0 + COOLDOWN));
        assert_eq!(tracker.circuit(), CircuitState::HalfOpen);
        // Still reported open until a probe succeeds
        assert!(tracker.state().circuit_open);
    }

    #[test]
    fn test_repeated_queries_do_not_restart_cooldown() {
        let t0 = Instant::now();
        let mut tracker = tracker(1);
        tracker.record_failure(t0);

        for secs in 1..30 {
            assert!(tracker.is_circuit_open(t0 + Duration::from_secs(secs)));
        }
        assert_eq!(tracker.reopen_at(), Some(t0 + COOLDOWN));
        assert!(!tracker.is_circuit_open(t0 + COOLDOWN));
    }

    #[test]
    fn test_failure_while_open_restarts_cooldown() {
        let t0 = Instant::now();
        let mut tracker = tracker(1);
        tracker.record_failure(t0);

        let t1 = t0 + Duration::from_secs(20);
        tracker.record_failure(t1);
        assert_eq!(tracker.reopen_at(), Some(t1 + COOLDOWN));
        assert!(tracker.is_circuit_open(t0 + COOLDOWN));
        assert!(!tracker.is_circuit_open(t1 + COOLDOWN));
    }

    #[test]
    fn test_probe_success_closes() {
        let t0 = Instant::now();
        let mut tracker = tracker(2);
        tracker.record_failure(t0);
        tracker.record_failure(t0);
        assert!(!tracker.is_circuit_open(t0 + COOLDOWN));

        tracker.record_success();
        assert_eq!(tracker.circuit(), CircuitState::Closed);
        assert_eq!(tracker.state().consecutive_failures, 0);
        assert!(!tracker.state().circuit_open);
        assert_eq!(tracker.reopen_at(), None);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let t0 = Instant::now();
        let mut tracker = tracker(2);
        tracker.record_failure(t0);
        tracker.record_failure(t0);

        let probe_at = t0 + COOLDOWN;
        assert!(!tracker.is_circuit_open(probe_at));
        tracker.record_failure(probe_at);

        assert_eq!(tracker.circuit(), CircuitState::Open);
        assert_eq!(tracker.reopen_at(), Some(probe_at + COOLDOWN));
        assert!(tracker.is_circuit_open(probe_at + Duration::from_secs(1)));
    }

    #[test]
    fn test_decision_state_lets_probe_through() {
        let t0 = Instant::now();
        let mut tracker = tracker(1);
        tracker.record_failure(t0);

        assert!(tracker.decision_state(t0).circuit_open);
        let probe = tracker.decision_state(t0 + COOLDOWN);
        assert!(!probe.circuit_open);
        assert_eq!(probe.consecutive_failures, 1);
    }

    #[test]
    fn test_view_follows_tracker() {
        let t0 = Instant::now();
        let mut tracker = tracker(1);
        let view = tracker.view();
        assert!(!view.is_circuit_open());

        tracker.record_failure(t0);
        assert!(view.is_circuit_open());
        assert_eq!(view.snapshot().circuit, CircuitState::Open);

        let report = view.report(t0 + Duration::from_secs(10));
        assert_eq!(report.state, CircuitState::Open);
        assert_eq!(report.consecutive_failures, 1);
        assert_eq!(report.cooldown_remaining_secs, Some(20));

        tracker.record_success();
        assert!(!view.is_circuit_open());
        assert_eq!(view.report(t0).cooldown_remaining_secs, None);
    }

    #[test]
    fn test_registry_lookup() {
        let t0 = Instant::now();
        let mut bots = FailureTracker::new("bot-events.dlq", 1, COOLDOWN);
        let notifications = FailureTracker::new("notifications.dlq", 1, COOLDOWN);
        let registry = CircuitRegistry::new([bots.view(), notifications.view()]);

        bots.record_failure(t0);

        assert_eq!(registry.is_circuit_open("bot-events.dlq"), Some(true));
        assert_eq!(registry.is_circuit_open("notifications.dlq"), Some(false));
        assert_eq!(registry.is_circuit_open("unknown.dlq"), None);
        assert_eq!(registry.open_count(), 1);
        assert_eq!(
            registry.dlq_names().collect::<Vec<_>>(),
            vec!["bot-events.dlq", "notifications.dlq"]
        );
        assert_eq!(registry.report().len(), 2);
    }

    #[test]
    fn test_circuit_state_labels() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(
            serde_json::to_string(&CircuitState::Open).unwrap(),
            r#""open""#
        );
    }
}
