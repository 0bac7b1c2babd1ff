//! MQTT connection lifecycle
//!
//! - options: keep-alive, credentials, last will, optional TLS
//! - initial connect: poll until the first ConnAck; refusal or failure is fatal
//! - pump: forward inbound publishes to the coordinator and report later
//!   ConnAcks (the client reconnects on its own) as `Reconnected`

use crate::config::MqttConfig;
use crate::error::StartupError;
use crate::state::{ReportingState, Shared};
use crate::topics::STATUS_OFFLINE;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, LastWill,
    MqttOptions, Outgoing, QoS, TlsConfiguration, Transport,
};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const REQUEST_CAPACITY: usize = 32;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    Message { topic: String, payload: Vec<u8> },
    /// Broker accepted a reconnect; subscriptions and status must be restored
    Reconnected,
}

pub fn mqtt_options(config: &MqttConfig, client_id: &str, will_topic: &str) -> Result<MqttOptions, StartupError> {
    let mut options = MqttOptions::new(client_id, config.hostname.as_str(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keepalive));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(will_topic, STATUS_OFFLINE, QoS::AtLeastOnce, true));

    if let Some(username) = &config.username {
        options.set_credentials(username.as_str(), config.password.clone().unwrap_or_default());
    }

    if config.tls {
        let transport = match &config.tls_ca_cert {
            Some(ca_path) => {
                let ca = read_pem(ca_path)?;
                let client_auth = match (&config.tls_certfile, &config.tls_keyfile) {
                    (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
                    (None, None) => None,
                    _ => {
                        return Err(StartupError::Connection(
                            "tls_certfile and tls_keyfile must be given together".to_string(),
                        ))
                    }
                };
                Transport::tls_with_config(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth,
                })
            }
            None => Transport::tls_with_default_config(),
        };
        options.set_transport(transport);
        debug!("TLS enabled for broker connection");
    }

    Ok(options)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, StartupError> {
    std::fs::read(path).map_err(|e| StartupError::Connection(format!("failed to read {}: {}", path.display(), e)))
}

/// Connect once; returns after the broker acknowledged the session
pub async fn connect(options: MqttOptions) -> Result<(AsyncClient, EventLoop), StartupError> {
    let broker = format!("{}:{}", options.broker_address().0, options.broker_address().1);
    info!("Connecting to MQTT broker {} ...", broker);

    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

    let acknowledged = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(StartupError::ConnectionRefused(format!("{:?}", ack.code)))
                    };
                }
                Ok(event) => trace!("pre-connect event: {:?}", event),
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(StartupError::ConnectionRefused(format!("{:?}", code)));
                }
                Err(e) => return Err(StartupError::Connection(format!("{} ({})", e, broker))),
            }
        }
    })
    .await
    .map_err(|_| StartupError::Connection(format!("no answer from {} within {:?}", broker, CONNECT_TIMEOUT)))?;

    acknowledged?;
    info!("MQTT connection established");
    Ok((client, eventloop))
}

/// Drive the event loop until the client disconnects
pub fn spawn_pump(
    mut eventloop: EventLoop,
    state: Shared<ReportingState>,
    events: mpsc::Sender<DaemonEvent>,
) -> JoinHandle<()> {
    state.lock().connected = true;

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    debug!("Received MQTT message on topic: {}", publish.topic);
                    let event = DaemonEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("MQTT connection re-established");
                        state.lock().connected = true;
                        if events.send(DaemonEvent::Reconnected).await.is_err() {
                            break;
                        }
                    } else {
                        warn!("Broker refused reconnect: {:?}", ack.code);
                    }
                }
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    debug!("on_subscribe() - {} - {:?}", ack.pkid, ack.return_codes);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    state.lock().connected = false;
                    error!("MQTT connection error: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
        state.lock().connected = false;
    })
}
