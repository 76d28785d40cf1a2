use crate::config::Config;
use crate::models::GeneratorProfile;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use rustls::ClientConfig;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const KEEP_ALIVE_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("MQTT handshake with {broker} failed: {reason}")]
    Handshake { broker: String, reason: String },
    #[error("broker {broker} rejected the connection: {reason}")]
    Rejected { broker: String, reason: String },
    #[error("connection to {broker} timed out after {seconds}s")]
    Timeout { broker: String, seconds: u64 },
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to serialize telemetry payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Observer for the transport's asynchronous connection events. Injected
/// into the service; implementations must not block and must not touch the
/// publish loop's state.
pub trait ConnectionEvents: Send + Sync {
    fn on_connection_lost(&self, reason: &str);
    fn on_delivery_acknowledged(&self, packet_id: u16);
    fn on_message_arrived(&self, topic: &str, payload: &[u8]);
}

/// Default observer: records everything in the log and nothing else.
pub struct LogConnectionEvents;

impl ConnectionEvents for LogConnectionEvents {
    fn on_connection_lost(&self, reason: &str) {
        error!("Connection lost: {}", reason);
    }

    fn on_delivery_acknowledged(&self, packet_id: u16) {
        debug!("Broker acknowledged delivery of packet {}", packet_id);
    }

    fn on_message_arrived(&self, topic: &str, _payload: &[u8]) {
        // Publish-only client; nothing subscribes, so this should not fire.
        warn!("Unexpected inbound message on topic '{}'", topic);
    }
}

#[derive(Debug)]
enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns the single publish-only MQTT session for the process lifetime and
/// drives the sample-generate-publish cadence.
pub struct MqttService {
    client_state: Mutex<ClientState>,
    client: Mutex<Option<AsyncClient>>,
    events: Arc<dyn ConnectionEvents>,
    pub(crate) config: Config,
}

impl MqttService {
    pub fn new(config: Config, events: Arc<dyn ConnectionEvents>) -> Arc<Self> {
        Arc::new(Self {
            client_state: Mutex::new(ClientState::Disconnected),
            client: Mutex::new(None),
            events,
            config,
        })
    }

    /// Opens the TLS session and waits for the broker's CONNACK. Failure
    /// here is fatal for the process; there is no retry.
    pub async fn connect(self: Arc<Self>, tls: ClientConfig) -> Result<(), ConnectionError> {
        let broker = format!("{}:{}", self.config.broker_host, self.config.broker_port);
        let client_id = generate_client_id(&self.config.machine_id);
        debug!(
            "Configuring MQTT broker at {} (client id '{}')...",
            broker, client_id
        );

        let mut options = MqttOptions::new(
            client_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        options.set_clean_session(true);
        options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(tls))));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        {
            let mut client_lock = self.client.lock().await;
            *client_lock = Some(client);
        }
        {
            let mut client_state = self.client_state.lock().await;
            *client_state = ClientState::Connecting;
        }

        info!("Connecting to ssl://{} ...", broker);
        let handshake = timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            return Ok(());
                        }
                        return Err(ConnectionError::Rejected {
                            broker: broker.clone(),
                            reason: format!("{:?}", ack.code),
                        });
                    }
                    Ok(event) => {
                        debug!("Pre-connack event: {:?}", event);
                    }
                    Err(e) => {
                        return Err(ConnectionError::Handshake {
                            broker: broker.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        })
        .await;

        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    broker,
                    seconds: CONNECT_TIMEOUT_SECS,
                })
            }
        }

        {
            let mut client_state = self.client_state.lock().await;
            *client_state = ClientState::Connected;
        }
        info!(
            "Connected. Publishing telemetry to topic: {}",
            self.config.telemetry_topic
        );

        let service = self.clone();
        tokio::spawn(async move {
            service.observe_events(eventloop).await;
        });

        Ok(())
    }

    /// Runs the publish loop forever: draw the anomaly decision, generate a
    /// reading, serialize, publish, sleep one interval. Only a transport
    /// error propagating out of the publish hand-off ends the loop.
    pub async fn run(self: Arc<Self>, profile: GeneratorProfile) -> Result<(), ConnectionError> {
        let interval = Duration::from_secs(self.config.publish_interval_secs);
        let qos = qos_level(self.config.qos);

        loop {
            let (reading, anomaly) = {
                let mut rng = rand::thread_rng();
                let anomaly = profile.draw_anomaly(&mut rng);
                (profile.generate_reading(&mut rng, anomaly), anomaly)
            };

            let payload = serde_json::to_string(&reading)?;
            self.publish(&payload, qos).await?;

            if anomaly {
                info!("[PUB] {} [ANOMALY]", payload);
            } else {
                info!("[PUB] {}", payload);
            }

            sleep(interval).await;
        }
    }

    /// Hands one payload to the transport's delivery queue. Under QoS 1 this
    /// does not await the broker's acknowledgment; acks surface through the
    /// injected `ConnectionEvents` observer.
    async fn publish(&self, payload: &str, qos: QoS) -> Result<(), ConnectionError> {
        let topic = &self.config.telemetry_topic;
        let client = self.client.lock().await;
        let client = client.as_ref().ok_or_else(|| ConnectionError::Publish {
            topic: topic.clone(),
            reason: "client is not connected".to_string(),
        })?;

        client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| ConnectionError::Publish {
                topic: topic.clone(),
                reason: e.to_string(),
            })
    }

    /// Drives the rumqttc event loop after the handshake, forwarding
    /// transport events to the observer. A poll error marks the session
    /// Disconnected and ends the task; no reconnect is attempted, so the
    /// session stays down until the process is restarted.
    async fn observe_events(self: Arc<Self>, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    self.events.on_delivery_acknowledged(ack.pkid);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.events.on_message_arrived(&publish.topic, &publish.payload);
                }
                Ok(Event::Outgoing(_)) => {
                    debug!("Outgoing event.");
                }
                Ok(event) => {
                    debug!("Unhandled event: {:?}", event);
                }
                Err(e) => {
                    self.events.on_connection_lost(&e.to_string());
                    let mut client_state = self.client_state.lock().await;
                    *client_state = ClientState::Disconnected;
                    return;
                }
            }
        }
    }
}

/// Unique per process start, so restarts never collide with a stale broker
/// session under the same id.
fn generate_client_id(machine_id: &str) -> String {
    format!("{}-sim-{}", machine_id, Uuid::new_v4().simple())
}

fn qos_level(raw: u8) -> QoS {
    match raw {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn client_ids_are_unique_per_generation() {
        let a = generate_client_id("NC_Machine_AC");
        let b = generate_client_id("NC_Machine_AC");
        assert!(a.starts_with("NC_Machine_AC-sim-"));
        assert_ne!(a, b);
    }

    #[test]
    fn qos_defaults_to_at_least_once() {
        assert_eq!(qos_level(0), QoS::AtMostOnce);
        assert_eq!(qos_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_level(2), QoS::ExactlyOnce);
    }

    struct CountingEvents {
        lost: AtomicUsize,
        acked: AtomicUsize,
    }

    impl ConnectionEvents for CountingEvents {
        fn on_connection_lost(&self, _reason: &str) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }

        fn on_delivery_acknowledged(&self, _packet_id: u16) {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message_arrived(&self, _topic: &str, _payload: &[u8]) {}
    }

    #[test]
    fn observer_is_injectable_as_a_trait_object() {
        let events = Arc::new(CountingEvents {
            lost: AtomicUsize::new(0),
            acked: AtomicUsize::new(0),
        });
        let observer: Arc<dyn ConnectionEvents> = events.clone();

        observer.on_delivery_acknowledged(7);
        observer.on_connection_lost("network unreachable");
        observer.on_message_arrived("factory/telemetry", b"{}");

        assert_eq!(events.acked.load(Ordering::SeqCst), 1);
        assert_eq!(events.lost.load(Ordering::SeqCst), 1);
    }
}
