//! Periodic reporting cycle
//!
//! ```text
//!   Idle --start()--> Armed --fire--> Reporting --publish/skip--> Armed
//! ```
//!
//! `start` arms the cadence timer and performs the first report before
//! returning, so the hub has data without waiting a full interval. Each
//! cycle gathers dynamic facts on the blocking pool under a deadline, builds
//! a `DeviceSnapshot` and queues it on the values topic. In stall mode only
//! the very first report is published. Cycles that start while the broker
//! connection is down are dropped rather than queued behind the reconnect.

use crate::metrics::MetricsProvider;
use crate::snapshot::{DeviceSnapshot, DynamicFacts, StaticFacts};
use crate::state::{ReportingState, Shared};
use crate::timer::RearmableTimer;
use crate::transport::Outbox;
use chrono::Local;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound for one round of metric gathering
pub const GATHER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Armed,
    Reporting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Published,
    /// Stall mode after the first report
    Skipped,
    /// Broker connection down
    Offline,
    Failed,
}

pub struct ReportingEngine {
    provider: Arc<dyn MetricsProvider>,
    facts: Arc<StaticFacts>,
    outbox: Outbox,
    values_topic: String,
    state: Shared<ReportingState>,
    stall: bool,
    interval_minutes: i64,
    gather_timeout: Duration,
    phase: EnginePhase,
    timer: RearmableTimer,
    ticks: mpsc::Receiver<()>,
}

impl ReportingEngine {
    pub fn new(
        provider: Arc<dyn MetricsProvider>,
        facts: Arc<StaticFacts>,
        outbox: Outbox,
        values_topic: String,
        state: Shared<ReportingState>,
        interval_minutes: i64,
        stall: bool,
    ) -> Self {
        let (timer, ticks) = RearmableTimer::new("reporting");
        Self {
            provider,
            facts,
            outbox,
            values_topic,
            state,
            stall,
            interval_minutes,
            gather_timeout: GATHER_TIMEOUT,
            phase: EnginePhase::Idle,
            timer,
            ticks,
        }
    }

    pub fn with_gather_timeout(mut self, limit: Duration) -> Self {
        self.gather_timeout = limit;
        self
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Arm the cadence timer, report once, then keep reporting on every fire
    pub async fn start(mut self) -> JoinHandle<()> {
        let period = self.state.lock().cadence.reporting;
        self.timer.rearm(period);
        self.phase = EnginePhase::Armed;
        info!("Reporting every {} min{}", self.interval_minutes, if self.stall { " (stall mode)" } else { "" });

        debug!("* first reporting!");
        self.report().await;

        tokio::spawn(async move {
            while self.ticks.recv().await.is_some() {
                self.on_timer_fire().await;
            }
            debug!("Reporting loop finished");
        })
    }

    pub async fn on_timer_fire(&mut self) -> ReportOutcome {
        info!("Time to report! {}", Local::now().format("%H:%M:%S - %Y/%m/%d"));
        self.report().await
    }

    /// One cycle: gather, build, publish (or skip in stall mode)
    pub async fn report(&mut self) -> ReportOutcome {
        self.phase = EnginePhase::Reporting;
        let outcome = self.run_cycle().await;
        self.phase = EnginePhase::Armed;
        outcome
    }

    async fn run_cycle(&mut self) -> ReportOutcome {
        if !self.state.lock().connected {
            warn!("Not connected to broker, report skipped");
            return ReportOutcome::Offline;
        }

        let provider = Arc::clone(&self.provider);
        let gathered = tokio::time::timeout(
            self.gather_timeout,
            tokio::task::spawn_blocking(move || DynamicFacts::gather(provider.as_ref())),
        )
        .await;

        let dynamic = match gathered {
            Ok(Ok(dynamic)) => dynamic,
            Ok(Err(e)) => {
                error!("Metric gathering task failed: {}", e);
                return ReportOutcome::Failed;
            }
            Err(_) => {
                warn!("Metric gathering exceeded {:?}, skipping this cycle", self.gather_timeout);
                return ReportOutcome::Failed;
            }
        };

        let (pending, already_reported) = {
            let state = self.state.lock();
            (state.pending_updates.count, state.reported_first_time)
        };

        if self.stall && already_reported {
            info!("Time to report! {} but SKIPPED (Test: stall)", Local::now().format("%H:%M:%S - %Y/%m/%d"));
            return ReportOutcome::Skipped;
        }

        let snapshot = DeviceSnapshot::build(&self.facts, dynamic, pending, self.interval_minutes, Local::now());
        let payload = match snapshot.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize snapshot: {}", e);
                return ReportOutcome::Failed;
            }
        };

        if let Err(e) = self
            .outbox
            .publish(self.values_topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
        {
            error!("Failed to queue report: {:#}", e);
            return ReportOutcome::Failed;
        }

        let mut state = self.state.lock();
        state.reported_first_time = true;
        state.cycles_completed += 1;
        debug!("Report #{} queued on {}", state.cycles_completed, self.values_topic);
        ReportOutcome::Published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::fixture::FixedProvider;
    use crate::state::{new_state, Cadence, LIVENESS_INTERVAL};
    use rpi_monitor_devkit::{MockMqttClient, TestHarness};
    use std::sync::atomic::Ordering;

    const TOPIC: &str = "home/nodes/sensor/rpi-foo/monitor";
    const INTERVAL: Duration = Duration::from_secs(180);

    fn state() -> Shared<ReportingState> {
        let state = new_state(ReportingState::new(Cadence {
            reporting: INTERVAL,
            liveness: LIVENESS_INTERVAL,
            update_check: Duration::from_secs(6 * 3600),
        }));
        state.lock().connected = true;
        state
    }

    fn engine(
        mock: &MockMqttClient,
        provider: Arc<FixedProvider>,
        state: Shared<ReportingState>,
        stall: bool,
    ) -> (ReportingEngine, Outbox) {
        let facts = Arc::new(StaticFacts::collect(provider.as_ref(), "home").unwrap());
        let (outbox, _worker) = Outbox::spawn(mock.clone(), Duration::ZERO);
        let engine = ReportingEngine::new(provider, facts, outbox.clone(), TOPIC.to_string(), state, 3, stall);
        (engine, outbox)
    }

    #[tokio::test]
    async fn test_single_report_published() {
        let mut harness = TestHarness::new();
        let state = state();
        let provider = Arc::new(FixedProvider::new("foo", "b8:27:eb:12:34:56"));
        let (mut engine, outbox) = engine(&harness.mqtt_client, provider, state.clone(), false);
        assert_eq!(engine.phase(), EnginePhase::Idle);

        assert_eq!(engine.report().await, ReportOutcome::Published);
        assert_eq!(engine.phase(), EnginePhase::Armed);
        outbox.flush().await.unwrap();

        harness.expect_messages(TOPIC, 1);
        harness.verify_expectations().unwrap();
        harness.assert_field_equals(TOPIC, "info.Hostname", &serde_json::json!("foo")).unwrap();
        harness.assert_field_exists(TOPIC, "info.Timestamp").unwrap();
        assert!(state.lock().reported_first_time);
        assert!(harness.mqtt_client.find_messages_by_topic(TOPIC).iter().all(|m| !m.retain));
    }

    #[tokio::test]
    async fn test_stall_mode_publishes_once() {
        let mock = MockMqttClient::new();
        let state = state();
        let provider = Arc::new(FixedProvider::new("foo", "b8:27:eb:12:34:56"));
        let (mut engine, outbox) = engine(&mock, provider.clone(), state.clone(), true);

        assert_eq!(engine.report().await, ReportOutcome::Published);
        for _ in 0..4 {
            assert_eq!(engine.on_timer_fire().await, ReportOutcome::Skipped);
        }
        outbox.flush().await.unwrap();

        assert_eq!(mock.find_messages_by_topic(TOPIC).len(), 1);
        let state = state.lock();
        assert!(state.reported_first_time);
        assert_eq!(state.cycles_completed, 1);
        // metrics are still refreshed on skipped cycles
        assert_eq!(provider.temperature_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_pending_update_count_included() {
        let mock = MockMqttClient::new();
        let state = state();
        state.lock().pending_updates.count = 7;
        let provider = Arc::new(FixedProvider::new("foo", "b8:27:eb:12:34:56"));
        let (mut engine, outbox) = engine(&mock, provider, state, false);

        engine.report().await;
        outbox.flush().await.unwrap();

        let last: serde_json::Value = mock.get_last_json_message(TOPIC).unwrap().unwrap();
        assert_eq!(last["info"]["OS_Pending_Updates"], 7);
    }

    #[tokio::test]
    async fn test_stuck_gathering_fails_the_cycle() {
        let mock = MockMqttClient::new();
        let state = state();
        let mut provider = FixedProvider::new("foo", "b8:27:eb:12:34:56");
        provider.stuck_for = Some(Duration::from_millis(500));
        let (engine, outbox) = engine(&mock, Arc::new(provider), state.clone(), false);
        let mut engine = engine.with_gather_timeout(Duration::from_millis(50));

        assert_eq!(engine.report().await, ReportOutcome::Failed);
        assert_eq!(engine.phase(), EnginePhase::Armed);
        outbox.flush().await.unwrap();

        assert!(mock.find_messages_by_topic(TOPIC).is_empty());
        let state = state.lock();
        assert!(!state.reported_first_time);
        assert_eq!(state.cycles_completed, 0);
    }

    #[tokio::test]
    async fn test_disconnected_cycle_is_dropped() {
        let mock = MockMqttClient::new();
        let state = state();
        state.lock().connected = false;
        let provider = Arc::new(FixedProvider::new("foo", "b8:27:eb:12:34:56"));
        let (mut engine, outbox) = engine(&mock, provider.clone(), state.clone(), false);

        assert_eq!(engine.report().await, ReportOutcome::Offline);
        state.lock().connected = true;
        assert_eq!(engine.on_timer_fire().await, ReportOutcome::Published);
        outbox.flush().await.unwrap();

        assert_eq!(mock.find_messages_by_topic(TOPIC).len(), 1);
        assert_eq!(provider.temperature_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.lock().cycles_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reports_immediately_then_every_interval() {
        let mock = MockMqttClient::new();
        let state = state();
        let provider = Arc::new(FixedProvider::new("foo", "b8:27:eb:12:34:56"));
        let (engine, outbox) = engine(&mock, provider, state.clone(), false);

        let handle = engine.start().await;
        outbox.flush().await.unwrap();
        assert_eq!(mock.find_messages_by_topic(TOPIC).len(), 1);

        tokio::time::sleep(INTERVAL * 3 + Duration::from_millis(10)).await;
        outbox.flush().await.unwrap();
        assert_eq!(mock.find_messages_by_topic(TOPIC).len(), 4);
        assert_eq!(state.lock().cycles_completed, 4);

        handle.abort();
    }
}
