//! Message bus plumbing
//!
//! - `Publisher`: what the daemon needs from an MQTT client
//! - `Outbox`: single publisher task fed over a bounded channel, pacing
//!   consecutive sends so bursts never hammer the broker
//! - `session`: connection lifecycle on top of `rumqttc`

pub mod session;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, QoS};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Delay after every send
pub const PUBLISH_PACE: Duration = Duration::from_millis(500);

const OUTBOX_CAPACITY: usize = 64;

pub trait Publisher: Clone + Send + Sync + 'static {
    fn publish_message(
        &self,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn subscribe_topic(&self, topic: String, qos: QoS) -> impl Future<Output = Result<()>> + Send;
}

impl Publisher for AsyncClient {
    fn publish_message(
        &self,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.publish(topic, qos, retain, payload)
                .await
                .context("Failed to queue MQTT publish")
        }
    }

    fn subscribe_topic(&self, topic: String, qos: QoS) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.subscribe(topic, qos)
                .await
                .context("Failed to queue MQTT subscribe")
        }
    }
}

#[cfg(test)]
impl Publisher for rpi_monitor_devkit::MockMqttClient {
    fn publish_message(
        &self,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send {
        self.publish(topic, qos, retain, payload)
    }

    fn subscribe_topic(&self, topic: String, qos: QoS) -> impl Future<Output = Result<()>> + Send {
        self.subscribe(topic, qos)
    }
}

#[derive(Debug)]
enum OutboxItem {
    Message {
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    },
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle queueing messages for the publisher task
#[derive(Debug, Clone)]
pub struct Outbox {
    queue: mpsc::Sender<OutboxItem>,
}

/// Owner of the publisher task; finishes once every `Outbox` clone is gone
pub struct OutboxWorker {
    handle: JoinHandle<u64>,
}

impl Outbox {
    pub fn spawn<P: Publisher>(publisher: P, pace: Duration) -> (Outbox, OutboxWorker) {
        let (queue, mut items) = mpsc::channel::<OutboxItem>(OUTBOX_CAPACITY);

        let handle = tokio::spawn(async move {
            let mut sent = 0u64;
            while let Some(item) = items.recv().await {
                match item {
                    OutboxItem::Message { topic, qos, retain, payload } => {
                        trace!("-> {} {}", topic, String::from_utf8_lossy(&payload));
                        match publisher.publish_message(topic.clone(), qos, retain, payload).await {
                            Ok(()) => sent += 1,
                            Err(e) => warn!("Failed to publish to {}: {:#}", topic, e),
                        }
                        if !pace.is_zero() {
                            tokio::time::sleep(pace).await;
                        }
                    }
                    OutboxItem::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Outbox closed after {} messages", sent);
            sent
        });

        (Outbox { queue }, OutboxWorker { handle })
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let topic = topic.into();
        self.queue
            .send(OutboxItem::Message {
                topic: topic.clone(),
                qos,
                retain,
                payload: payload.into(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("outbox closed, dropping message for {}", topic))
    }

    /// Wait until everything queued before this call has been handed to the client
    pub async fn flush(&self) -> Result<()> {
        let (done, waiter) = oneshot::channel();
        self.queue
            .send(OutboxItem::Flush(done))
            .await
            .map_err(|_| anyhow::anyhow!("outbox closed"))?;
        waiter.await.context("outbox stopped before flushing")
    }
}

impl OutboxWorker {
    /// Wait (bounded) for the queue to empty; returns the number of messages sent
    pub async fn drain(self, limit: Duration) -> Result<u64> {
        tokio::time::timeout(limit, self.handle)
            .await
            .context("timed out draining outbox")?
            .context("outbox task failed")
    }
}
