//! Horizontal sync bridge: relays room traffic between server processes.
//!
//! ```text
//!  process A                    relay (MQTT)                   process B
//! ┌──────────┐  publish   ┌──────────────────────┐  deliver  ┌──────────┐
//! │ pub conn ├───────────►│  <prefix>/<room_id>  ├──────────►│ sub conn │
//! │ sub conn │◄───────────┤                      │◄──────────┤ pub conn │
//! └──────────┘  deliver   └──────────────────────┘  publish  └──────────┘
//! ```
//!
//! Publishing and subscribing use two independent connections, each with
//! its own status stream. Reconnecting is left to the relay client, which
//! dials again on the poll after an error; the driver only paces those
//! polls by the configured delay and reports what the event loop says.
//!
//! Every envelope carries the id of the publishing process; a process
//! drops its own envelopes on receipt.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bridge host is not configured (set CANOPY_BRIDGE_HOST)")]
    MissingHost,
    #[error("Invalid bridge port '{0}'")]
    InvalidPort(String),
    #[error("Invalid bridge setting: {0}")]
    InvalidSetting(String),
    #[error("Relay client error: {0}")]
    Client(String),
    #[error("Envelope encoding error: {0}")]
    Encoding(String),
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(e: rumqttc::ClientError) -> Self {
        BridgeError::Client(e.to_string())
    }
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Topic prefix shared by all cooperating processes
    pub key_prefix: String,
    /// How often peers behind the bridge republish their awareness
    pub heartbeat_interval: Duration,
    /// Silence after which a bridged peer counts as gone
    pub peer_ttl: Duration,
    /// Pause before polling a connection again after an error
    pub reconnect_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            password: None,
            key_prefix: "canopy".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            peer_ttl: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl BridgeConfig {
    /// Read `CANOPY_BRIDGE_HOST`, `CANOPY_BRIDGE_PORT`,
    /// `CANOPY_BRIDGE_PASSWORD`, `CANOPY_BRIDGE_KEY_PREFIX`,
    /// `CANOPY_BRIDGE_HEARTBEAT_SECS`, `CANOPY_BRIDGE_PEER_TTL_SECS` and
    /// `CANOPY_BRIDGE_RECONNECT_MS`.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`BridgeConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let host = lookup("CANOPY_BRIDGE_HOST")
            .filter(|h| !h.trim().is_empty())
            .ok_or(BridgeError::MissingHost)?;
        let port = match lookup("CANOPY_BRIDGE_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| BridgeError::InvalidPort(raw))?,
            None => defaults.port,
        };
        let number = |name: &str| -> Result<Option<u64>, BridgeError> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| BridgeError::InvalidSetting(format!("{name}='{raw}' is not a number"))),
                None => Ok(None),
            }
        };
        let heartbeat_interval = number("CANOPY_BRIDGE_HEARTBEAT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval);
        let peer_ttl = number("CANOPY_BRIDGE_PEER_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.peer_ttl);
        let reconnect_delay = number("CANOPY_BRIDGE_RECONNECT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_delay);
        if heartbeat_interval.is_zero() || peer_ttl <= heartbeat_interval {
            return Err(BridgeError::InvalidSetting(format!(
                "peer TTL {peer_ttl:?} must exceed a non-zero heartbeat interval {heartbeat_interval:?}"
            )));
        }

        Ok(Self {
            host,
            port,
            password: lookup("CANOPY_BRIDGE_PASSWORD").filter(|p| !p.is_empty()),
            key_prefix: lookup("CANOPY_BRIDGE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            heartbeat_interval,
            peer_ttl,
            reconnect_delay,
        })
    }
}

/// Connection status reported by each side of the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubConnectionState {
    Connecting,
    Connect,
    Ready,
    Reconnecting(Duration),
    Error(String),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeRole {
    Publisher,
    Subscriber,
}

/// One status transition of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatus {
    pub role: BridgeRole,
    pub state: PubSubConnectionState,
}

/// What travels on a room topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeEnvelope {
    /// Id of the publishing process
    pub origin: Uuid,
    pub room: String,
    /// Encoded protocol message
    pub payload: Vec<u8>,
}

impl BridgeEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BridgeError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BridgeError::Encoding(e.to_string()))?;
        Ok(envelope)
    }
}

/// A message received from another process.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeMessage {
    pub room: String,
    pub payload: Vec<u8>,
}

/// Decode a raw relay payload, dropping envelopes published by `process_id`.
pub fn decode_incoming(process_id: Uuid, bytes: &[u8]) -> Option<BridgeMessage> {
    match BridgeEnvelope::decode(bytes) {
        Ok(envelope) if envelope.origin == process_id => None,
        Ok(envelope) => Some(BridgeMessage {
            room: envelope.room,
            payload: envelope.payload,
        }),
        Err(e) => {
            log::warn!("Dropping undecodable bridge payload: {}", e);
            None
        }
    }
}

/// Two relay connections shared by everything in one process.
pub struct SyncBridge {
    config: BridgeConfig,
    process_id: Uuid,
    publisher: AsyncClient,
    subscriber: AsyncClient,
    rooms: Arc<Mutex<BTreeSet<String>>>,
    message_tx: broadcast::Sender<BridgeMessage>,
    status_tx: broadcast::Sender<BridgeStatus>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncBridge {
    /// Create both connections and start driving them.
    ///
    /// Returns immediately; connection progress is reported through
    /// [`SyncBridge::status`].
    pub fn start(config: BridgeConfig) -> Result<Arc<Self>, BridgeError> {
        if config.host.trim().is_empty() {
            return Err(BridgeError::MissingHost);
        }
        let process_id = Uuid::new_v4();
        let (publisher, pub_loop) = AsyncClient::new(Self::options(&config, process_id, "pub"), 256);
        let (subscriber, sub_loop) = AsyncClient::new(Self::options(&config, process_id, "sub"), 256);
        let (message_tx, _) = broadcast::channel(1024);
        let (status_tx, _) = broadcast::channel(64);

        let bridge = Arc::new(Self {
            config,
            process_id,
            publisher,
            subscriber,
            rooms: Arc::new(Mutex::new(BTreeSet::new())),
            message_tx,
            status_tx,
            drivers: Mutex::new(Vec::new()),
        });

        let reconnect_delay = bridge.config.reconnect_delay;
        let pub_driver = tokio::spawn(drive(
            BridgeRole::Publisher,
            pub_loop,
            reconnect_delay,
            bridge.status_tx.clone(),
            None,
        ));
        let sub_driver = tokio::spawn(drive(
            BridgeRole::Subscriber,
            sub_loop,
            reconnect_delay,
            bridge.status_tx.clone(),
            Some(SubscriberSide {
                process_id,
                client: bridge.subscriber.clone(),
                rooms: bridge.rooms.clone(),
                key_prefix: bridge.config.key_prefix.clone(),
                message_tx: bridge.message_tx.clone(),
            }),
        ));
        crate::store::lock(&bridge.drivers).extend([pub_driver, sub_driver]);

        log::info!(
            "Sync bridge {} started against {}:{}",
            process_id,
            bridge.config.host,
            bridge.config.port
        );
        Ok(bridge)
    }

    fn options(config: &BridgeConfig, process_id: Uuid, side: &str) -> MqttOptions {
        let mut options = MqttOptions::new(
            format!("canopy-{}-{}", process_id.simple(), side),
            config.host.clone(),
            config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(password) = &config.password {
            options.set_credentials("canopy", password.clone());
        }
        options
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Relay topic of a room.
    pub fn topic(&self, room: &str) -> String {
        room_topic(&self.config.key_prefix, room)
    }

    /// Queue `payload` for every other process subscribed to `room`.
    ///
    /// Never blocks; fails when the outgoing request queue is full.
    pub fn publish(&self, room: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        let envelope = BridgeEnvelope {
            origin: self.process_id,
            room: room.to_string(),
            payload,
        };
        let bytes = envelope.encode()?;
        log::trace!("Bridge publish {} bytes to {}", bytes.len(), room);
        self.publisher
            .try_publish(self.topic(room), QoS::AtLeastOnce, false, bytes)?;
        Ok(())
    }

    pub async fn subscribe_room(&self, room: &str) -> Result<(), BridgeError> {
        let added = crate::store::lock(&self.rooms).insert(room.to_string());
        if added {
            self.subscriber.subscribe(self.topic(room), QoS::AtLeastOnce).await?;
            log::debug!("Bridge subscribed to {}", self.topic(room));
        }
        Ok(())
    }

    pub async fn unsubscribe_room(&self, room: &str) -> Result<(), BridgeError> {
        let removed = crate::store::lock(&self.rooms).remove(room);
        if removed {
            self.subscriber.unsubscribe(self.topic(room)).await?;
            log::debug!("Bridge unsubscribed from {}", self.topic(room));
        }
        Ok(())
    }

    pub fn subscribed_rooms(&self) -> Vec<String> {
        crate::store::lock(&self.rooms).iter().cloned().collect()
    }

    /// Messages from other processes, for every subscribed room.
    pub fn messages(&self) -> broadcast::Receiver<BridgeMessage> {
        self.message_tx.subscribe()
    }

    /// Status transitions of both connections.
    pub fn status(&self) -> broadcast::Receiver<BridgeStatus> {
        self.status_tx.subscribe()
    }

    /// Disconnect both sides. Each driver reports `End` once its
    /// disconnect goes out.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.publisher.disconnect().await?;
        self.subscriber.disconnect().await?;
        Ok(())
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        for driver in crate::store::lock(&self.drivers).drain(..) {
            driver.abort();
        }
    }
}

fn room_topic(prefix: &str, room: &str) -> String {
    format!("{}/{}", prefix, room)
}

struct SubscriberSide {
    process_id: Uuid,
    client: AsyncClient,
    rooms: Arc<Mutex<BTreeSet<String>>>,
    key_prefix: String,
    message_tx: broadcast::Sender<BridgeMessage>,
}

fn report(status_tx: &broadcast::Sender<BridgeStatus>, role: BridgeRole, state: PubSubConnectionState) {
    log::debug!("Bridge {:?}: {:?}", role, state);
    // No receivers is fine.
    let _ = status_tx.send(BridgeStatus { role, state });
}

/// Poll one relay connection until its disconnect goes out.
///
/// Every state reported comes from an event-loop outcome: `Connect` and
/// `Ready` from a ConnAck, `Error` from a failed poll. After an error the
/// client reconnects on its next poll, so `Reconnecting` announces the
/// pause before that poll and `Connecting` the poll itself.
async fn drive(
    role: BridgeRole,
    mut event_loop: EventLoop,
    reconnect_delay: Duration,
    status_tx: broadcast::Sender<BridgeStatus>,
    subscriber: Option<SubscriberSide>,
) {
    report(&status_tx, role, PubSubConnectionState::Connecting);
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                log::info!("Bridge {:?} connected: {:?}", role, ack.code);
                report(&status_tx, role, PubSubConnectionState::Connect);
                if let Some(side) = &subscriber {
                    // A fresh session has no subscriptions.
                    let rooms: Vec<String> = crate::store::lock(&side.rooms).iter().cloned().collect();
                    for room in rooms {
                        let topic = room_topic(&side.key_prefix, &room);
                        if let Err(e) = side.client.try_subscribe(topic, QoS::AtLeastOnce) {
                            log::warn!("Bridge resubscribe to {} failed: {}", room, e);
                        }
                    }
                }
                report(&status_tx, role, PubSubConnectionState::Ready);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some(side) = &subscriber {
                    if let Some(msg) = decode_incoming(side.process_id, &publish.payload) {
                        let _ = side.message_tx.send(msg);
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                log::trace!("Bridge subscription acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                report(&status_tx, role, PubSubConnectionState::End);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("Bridge {:?} error: {}", role, e);
                report(&status_tx, role, PubSubConnectionState::Error(e.to_string()));
                report(&status_tx, role, PubSubConnectionState::Reconnecting(reconnect_delay));
                tokio::time::sleep(reconnect_delay).await;
                report(&status_tx, role, PubSubConnectionState::Connecting);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_config_from_lookup() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("CANOPY_BRIDGE_HOST", "relay.internal"),
            ("CANOPY_BRIDGE_PORT", "2883"),
            ("CANOPY_BRIDGE_PASSWORD", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(config.host, "relay.internal");
        assert_eq!(config.port, 2883);
        assert_eq!(config.password.as_deref(), Some("s3cret"));
        assert_eq!(config.key_prefix, "canopy");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.peer_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_liveness_settings_from_lookup() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("CANOPY_BRIDGE_HOST", "h"),
            ("CANOPY_BRIDGE_HEARTBEAT_SECS", "2"),
            ("CANOPY_BRIDGE_PEER_TTL_SECS", "7"),
            ("CANOPY_BRIDGE_RECONNECT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.peer_ttl, Duration::from_secs(7));
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));

        // A TTL that a live peer's heartbeat cannot beat.
        assert!(matches!(
            BridgeConfig::from_lookup(lookup(&[
                ("CANOPY_BRIDGE_HOST", "h"),
                ("CANOPY_BRIDGE_HEARTBEAT_SECS", "30"),
                ("CANOPY_BRIDGE_PEER_TTL_SECS", "30"),
            ])),
            Err(BridgeError::InvalidSetting(_))
        ));
        assert!(matches!(
            BridgeConfig::from_lookup(lookup(&[("CANOPY_BRIDGE_HOST", "h"), ("CANOPY_BRIDGE_RECONNECT_MS", "soon")])),
            Err(BridgeError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_missing_host_is_fatal() {
        let err = BridgeConfig::from_lookup(lookup(&[("CANOPY_BRIDGE_PORT", "1883")])).unwrap_err();
        assert!(matches!(err, BridgeError::MissingHost));
        assert!(matches!(
            BridgeConfig::from_lookup(lookup(&[("CANOPY_BRIDGE_HOST", "  ")])),
            Err(BridgeError::MissingHost)
        ));
    }

    #[test]
    fn test_bad_port_is_error() {
        let err = BridgeConfig::from_lookup(lookup(&[
            ("CANOPY_BRIDGE_HOST", "h"),
            ("CANOPY_BRIDGE_PORT", "99999"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPort(p) if p == "99999"));
    }

    #[test]
    fn test_own_envelopes_are_dropped() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let envelope = |origin| {
            BridgeEnvelope {
                origin,
                room: "board".into(),
                payload: vec![7, 7],
            }
            .encode()
            .unwrap()
        };

        assert!(decode_incoming(me, &envelope(me)).is_none());
        assert_eq!(
            decode_incoming(me, &envelope(other)),
            Some(BridgeMessage {
                room: "board".into(),
                payload: vec![7, 7]
            })
        );
        assert!(decode_incoming(me, &[0xFF, 0xFE, 0xFD]).is_none());
    }

    #[test]
    fn test_room_topic() {
        assert_eq!(room_topic("canopy", "board-1"), "canopy/board-1");
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_each_attempt() {
        // Nothing listens on this port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let bridge = SyncBridge::start(BridgeConfig {
            port,
            reconnect_delay: Duration::from_millis(50),
            ..BridgeConfig::default()
        })
        .unwrap();
        let mut status = bridge.status();

        // Follow the publisher from its first failure through the retry.
        let mut states = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, status.recv()).await {
            if event.role != BridgeRole::Publisher {
                continue;
            }
            if states.is_empty() && !matches!(event.state, PubSubConnectionState::Error(_)) {
                continue;
            }
            states.push(event.state);
            if states.len() == 4 {
                break;
            }
        }

        assert_eq!(states.len(), 4);
        assert!(matches!(states[0], PubSubConnectionState::Error(_)));
        assert_eq!(states[1], PubSubConnectionState::Reconnecting(Duration::from_millis(50)));
        assert_eq!(states[2], PubSubConnectionState::Connecting);
        assert!(matches!(states[3], PubSubConnectionState::Error(_)));
        assert_eq!(bridge.topic("r"), "canopy/r");
    }
}
