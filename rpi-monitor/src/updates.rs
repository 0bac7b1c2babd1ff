//! Pending OS update checks
//!
//! Runs on its own (hours-long) cadence, outside the reporting cycle. Each
//! check stores the result for the next snapshot and publishes `on`/`off` to
//! the binary sensor plus the package list as its attributes.

use crate::discovery::{PAYLOAD_OFF, PAYLOAD_ON};
use crate::metrics::{MetricsProvider, PendingUpdates};
use crate::state::{ReportingState, Shared};
use crate::timer::RearmableTimer;
use crate::transport::Outbox;
use anyhow::{Context, Result};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// `apt-get -s` refreshes nothing, but dpkg can hold it for a while
const CHECK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct UpdateChecker {
    provider: Arc<dyn MetricsProvider>,
    outbox: Outbox,
    state: Shared<ReportingState>,
    state_topic: String,
    attributes_topic: String,
}

impl UpdateChecker {
    pub fn new(
        provider: Arc<dyn MetricsProvider>,
        outbox: Outbox,
        state: Shared<ReportingState>,
        state_topic: String,
        attributes_topic: String,
    ) -> Self {
        Self {
            provider,
            outbox,
            state,
            state_topic,
            attributes_topic,
        }
    }

    pub async fn check(&self) -> Result<PendingUpdates> {
        info!("* check for pending updates ...");
        let provider = Arc::clone(&self.provider);
        let pending = tokio::time::timeout(
            CHECK_TIMEOUT,
            tokio::task::spawn_blocking(move || provider.pending_updates()),
        )
        .await
        .context("Pending update check timed out")?
        .context("Pending update check task failed")??;

        info!("{} pending updates", pending.count);
        self.state.lock().pending_updates = pending.clone();

        let flag = if pending.count > 0 { PAYLOAD_ON } else { PAYLOAD_OFF };
        self.outbox
            .publish(self.state_topic.as_str(), QoS::AtLeastOnce, false, flag)
            .await?;
        let attributes = serde_json::to_vec(&pending.packages)?;
        self.outbox
            .publish(self.attributes_topic.as_str(), QoS::AtLeastOnce, false, attributes)
            .await?;

        Ok(pending)
    }

    /// Re-check every `period`; a failed check keeps the previous result
    pub fn start(self, period: Duration) -> JoinHandle<()> {
        let (mut timer, mut ticks) = RearmableTimer::new("update-check");
        timer.rearm(period);

        tokio::spawn(async move {
            let _timer = timer;
            while ticks.recv().await.is_some() {
                if let Err(e) = self.check().await {
                    warn!("Failed to check for pending updates: {:#}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::fixture::FixedProvider;
    use crate::state::{new_state, Cadence, LIVENESS_INTERVAL};
    use rpi_monitor_devkit::MockMqttClient;
    use std::collections::BTreeMap;

    const STATE: &str = "home/nodes/binary_sensor/rpi-foo/state";
    const ATTRIBUTES: &str = "home/nodes/binary_sensor/rpi-foo/attributes";

    fn checker(mock: &MockMqttClient, pending: PendingUpdates) -> (UpdateChecker, Outbox, Shared<ReportingState>) {
        let mut provider = FixedProvider::new("foo", "b8:27:eb:12:34:56");
        provider.pending = pending;
        let state = new_state(ReportingState::new(Cadence {
            reporting: Duration::from_secs(180),
            liveness: LIVENESS_INTERVAL,
            update_check: Duration::from_secs(4 * 3600),
        }));
        let (outbox, _worker) = Outbox::spawn(mock.clone(), Duration::ZERO);
        let checker = UpdateChecker::new(
            Arc::new(provider),
            outbox.clone(),
            state.clone(),
            STATE.to_string(),
            ATTRIBUTES.to_string(),
        );
        (checker, outbox, state)
    }

    #[tokio::test]
    async fn test_pending_updates_publish_on() {
        let mock = MockMqttClient::new();
        let pending = PendingUpdates {
            count: 1,
            packages: BTreeMap::from([("openssl".to_string(), "1.1 -> 1.2".to_string())]),
        };
        let (checker, outbox, state) = checker(&mock, pending);

        checker.check().await.unwrap();
        outbox.flush().await.unwrap();

        assert_eq!(mock.find_messages_by_topic(STATE)[0].text(), "on");
        let attributes: serde_json::Value = mock.get_last_json_message(ATTRIBUTES).unwrap().unwrap();
        assert_eq!(attributes["openssl"], "1.1 -> 1.2");
        assert_eq!(state.lock().pending_updates.count, 1);
    }

    #[tokio::test]
    async fn test_no_updates_publish_off() {
        let mock = MockMqttClient::new();
        let (checker, outbox, _state) = checker(&mock, PendingUpdates::default());

        checker.check().await.unwrap();
        outbox.flush().await.unwrap();

        assert_eq!(mock.find_messages_by_topic(STATE)[0].text(), "off");
        assert_eq!(mock.find_messages_by_topic(ATTRIBUTES)[0].text(), "{}");
    }
}
