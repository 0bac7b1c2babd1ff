//! Coordinator: wires every component and owns the serve loop
//!
//! Startup order matters: identity and configuration problems must surface
//! before the broker sees us, discovery must precede the first report, and
//! the pending-update count must be known when the first snapshot is built.

use crate::commands::{CommandDispatcher, DispatchOutcome, ShellRunner, SystemShell};
use crate::config::MonitorConfig;
use crate::discovery::{self, DeviceIdentity, DiscoveryPublisher};
use crate::liveness::{self, LivenessTimer};
use crate::metrics::{LinuxProvider, MetricsProvider};
use crate::notify::Notifier;
use crate::reporting::ReportingEngine;
use crate::snapshot::StaticFacts;
use crate::state::{new_state, Cadence, ReportingState, LIVENESS_INTERVAL};
use crate::topics::{Category, TopicLayout, STATUS_OFFLINE, STATUS_ONLINE};
use crate::transport::session::{self, DaemonEvent};
use crate::transport::{Outbox, Publisher, PUBLISH_PACE};
use crate::updates::UpdateChecker;
use anyhow::{Context, Result};
use rumqttc::QoS;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 32;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub async fn run(config: MonitorConfig, stall: bool, notifier: &Notifier) -> Result<()> {
    let provider: Arc<dyn MetricsProvider> = Arc::new(LinuxProvider::new());

    let facts = {
        let provider = Arc::clone(&provider);
        let domain = config.daemon.fallback_domain.clone();
        tokio::task::spawn_blocking(move || StaticFacts::collect(provider.as_ref(), &domain))
            .await
            .context("Static fact collection panicked")??
    };
    let facts = Arc::new(facts);
    info!("Monitoring {} ({}), model {}", facts.hostname, facts.fqdn, facts.model);

    let topics = TopicLayout::new(&config.mqtt, &facts.hostname);
    let identity = DeviceIdentity::new(&facts);
    let entities = discovery::entity_table(&facts, &config.commands)?;
    let shell = SystemShell::locate()?;

    let state = new_state(ReportingState::new(Cadence {
        reporting: config.reporting_interval(),
        liveness: LIVENESS_INTERVAL,
        update_check: config.update_check_interval(),
    }));
    let cadence = state.lock().cadence;

    let client_id = format!("{}-{}", env!("CARGO_PKG_NAME"), identity.unique_id);
    let options = session::mqtt_options(&config.mqtt, &client_id, &topics.status(Category::Sensor))?;
    let (client, eventloop) = session::connect(options).await?;
    notifier.ready();
    notifier.status(&format!("connected to {}:{}", config.mqtt.hostname, config.mqtt.port));

    let (event_tx, mut events) = mpsc::channel(EVENT_CAPACITY);
    let pump = session::spawn_pump(eventloop, state.clone(), event_tx);
    let (outbox, outbox_worker) = Outbox::spawn(client.clone(), PUBLISH_PACE);
    let status_topics = topics.status_topics();

    let dispatcher = CommandDispatcher::new(topics.clone(), config.commands.clone(), shell, outbox.clone());
    let mut serving = Session::new(client.clone(), outbox.clone(), status_topics.clone(), dispatcher);
    serving.restore().await?;
    if serving.subscription.is_none() {
        info!("No commands configured, not subscribing");
    }

    let liveness = LivenessTimer::new(outbox.clone(), status_topics, cadence.liveness).start();

    DiscoveryPublisher::new(topics.clone(), identity, entities)
        .announce(&outbox)
        .await?;

    let checker = UpdateChecker::new(
        Arc::clone(&provider),
        outbox.clone(),
        state.clone(),
        topics.binary_state(),
        topics.binary_attributes(),
    );
    if let Err(e) = checker.check().await {
        warn!("Initial pending update check failed: {:#}", e);
    }
    let updates = checker.start(cadence.update_check);

    let engine = ReportingEngine::new(
        Arc::clone(&provider),
        Arc::clone(&facts),
        outbox,
        topics.values(),
        state.clone(),
        config.daemon.reporting_interval_minutes,
        stall,
    );
    let reporting = engine.start().await;

    serving.serve(&mut events, shutdown_signal(), notifier).await;

    notifier.stopping();
    for task in [reporting, liveness, updates] {
        task.abort();
        let _ = task.await;
    }

    serving.close().await?;
    match outbox_worker.drain(SHUTDOWN_GRACE).await {
        Ok(sent) => debug!("Outbox drained, {} messages sent", sent),
        Err(e) => warn!("{:#}", e),
    }

    client.disconnect().await.context("Failed to disconnect from broker")?;
    if tokio::time::timeout(SHUTDOWN_GRACE, pump).await.is_err() {
        warn!("MQTT event loop did not stop in time");
    }
    info!("* MQTT Disconnect()");
    Ok(())
}

/// What the serve loop needs once startup is complete
struct Session<P: Publisher, R: ShellRunner> {
    client: P,
    outbox: Outbox,
    status_topics: Vec<String>,
    subscription: Option<String>,
    dispatcher: CommandDispatcher<R>,
}

impl<P: Publisher, R: ShellRunner> Session<P, R> {
    fn new(client: P, outbox: Outbox, status_topics: Vec<String>, dispatcher: CommandDispatcher<R>) -> Self {
        let subscription = dispatcher.subscription();
        Self {
            client,
            outbox,
            status_topics,
            subscription,
            dispatcher,
        }
    }

    async fn restore(&self) -> Result<()> {
        restore_session(&self.client, &self.outbox, &self.status_topics, self.subscription.as_deref()).await
    }

    /// Route broker events until `shutdown` resolves or the event loop stops
    async fn serve<S>(&mut self, events: &mut mpsc::Receiver<DaemonEvent>, shutdown: S, notifier: &Notifier)
    where
        S: Future<Output = std::io::Result<&'static str>>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event, notifier).await,
                    None => {
                        warn!("MQTT event loop stopped");
                        return;
                    }
                },
                signal = &mut shutdown => {
                    match signal {
                        Ok(name) => info!("Received {}, shutting down", name),
                        Err(e) => warn!("Signal handling failed ({}), shutting down", e),
                    }
                    return;
                }
            }
        }
    }

    async fn handle(&mut self, event: DaemonEvent, notifier: &Notifier) {
        match event {
            DaemonEvent::Message { topic, payload } => match self.dispatcher.dispatch(&topic, &payload) {
                DispatchOutcome::Spawned | DispatchOutcome::Ignored => {}
                DispatchOutcome::Rejected => notifier.status(&format!("invalid command on {}", topic)),
                DispatchOutcome::Foreign => debug!("Ignoring message on {}", topic),
            },
            DaemonEvent::Reconnected => {
                notifier.status("reconnected to broker");
                if let Err(e) = self.restore().await {
                    warn!("Failed to restore session after reconnect: {:#}", e);
                }
            }
        }
    }

    /// Abort running commands and queue the offline status; releases this
    /// session's outbox handles so the worker can drain
    async fn close(mut self) -> Result<()> {
        self.dispatcher.abort_running().await;
        liveness::publish_status(&self.outbox, &self.status_topics, STATUS_OFFLINE).await
    }
}

/// Availability and command subscription, after the first connect and every reconnect
async fn restore_session<P: Publisher>(
    client: &P,
    outbox: &Outbox,
    status_topics: &[String],
    subscription: Option<&str>,
) -> Result<()> {
    liveness::publish_status(outbox, status_topics, STATUS_ONLINE).await?;
    if let Some(topic) = subscription {
        client.subscribe_topic(topic.to_string(), QoS::AtLeastOnce).await?;
        info!("Subscribed to commands on: {}", topic);
    }
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}
