//! Availability heartbeat
//!
//! Republishes `online` (retained) to the three status topics on its own
//! cadence. `publish_status` is also the explicit `offline` path used at
//! shutdown; the broker-side last will only covers crashes.

use crate::timer::RearmableTimer;
use crate::topics::STATUS_ONLINE;
use crate::transport::Outbox;
use anyhow::Result;
use rumqttc::QoS;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub async fn publish_status(outbox: &Outbox, topics: &[String], status: &str) -> Result<()> {
    debug!("- SEND: {} -", status);
    for topic in topics {
        outbox.publish(topic.as_str(), QoS::AtLeastOnce, true, status).await?;
    }
    Ok(())
}

pub struct LivenessTimer {
    outbox: Outbox,
    topics: Vec<String>,
    period: Duration,
}

impl LivenessTimer {
    pub fn new(outbox: Outbox, topics: Vec<String>, period: Duration) -> Self {
        Self { outbox, topics, period }
    }

    pub fn start(self) -> JoinHandle<()> {
        let (mut timer, mut ticks) = RearmableTimer::new("liveness");
        timer.rearm(self.period);

        tokio::spawn(async move {
            // keep the ticker alive as long as this task
            let _timer = timer;
            while ticks.recv().await.is_some() {
                if let Err(e) = publish_status(&self.outbox, &self.topics, STATUS_ONLINE).await {
                    warn!("Failed to publish liveness: {:#}", e);
                }
            }
        })
    }
}
