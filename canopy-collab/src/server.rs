//! WebSocket relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (room_id) ── YrsDocument ── BroadcastGroup
//! Client B ──┘         │                               │
//!                      ├── SnapshotStore               ├── awareness cache
//!                      │     (fetch on create,         │
//!                      │      persist on tick/close)   │
//!                      │                    ┌──────────┼───────────┐
//!                      ▼                    ▼          ▼           ▼
//!                 SyncBridge ◄──► other  Client A   Client B    Client C
//!                                 processes
//! ```
//!
//! Each room maintains:
//! - a [`YrsDocument`] holding the merged state
//! - a [`BroadcastGroup`] fanning messages out to connected peers
//! - the latest awareness frame of every peer, replayed to joiners
//!
//! A connection that falls behind its room's channel is sent the full
//! state and an awareness snapshot in place of the frames it missed. With
//! a bridge, local awareness is republished every heartbeat interval and
//! bridged peers not heard from within the peer TTL are announced as
//! gone.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use canopy_core::ReplicatedDocument;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bridge::{BridgeConfig, BridgeError, BridgeMessage, SyncBridge};
use crate::broadcast::{Room, RoomManager};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::snapshot::{MemorySnapshotStore, RocksSnapshotStore, SnapshotError, SnapshotStore, StoreConfig};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Seconds between snapshots of a live room (0 = only on close)
    pub snapshot_interval_secs: u64,
    /// RocksDB snapshot path (None = in-memory snapshots)
    pub snapshot_path: Option<PathBuf>,
    /// Relay to other server processes
    pub bridge: Option<BridgeConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            snapshot_interval_secs: 30,
            snapshot_path: None,
            bridge: None,
        }
    }
}

impl ServerConfig {
    /// Read `CANOPY_BIND_ADDR`, `CANOPY_BROADCAST_CAPACITY`,
    /// `CANOPY_SNAPSHOT_PATH`, `CANOPY_SNAPSHOT_INTERVAL_SECS` and
    /// `CANOPY_BRIDGE`. With `CANOPY_BRIDGE=1` the bridge settings are
    /// read as well and a missing host is an error.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |name: &str, default: u64| -> Result<u64, ServerError> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| ServerError::Config(format!("{name}='{raw}' is not a number"))),
                None => Ok(default),
            }
        };

        let broadcast_capacity = number("CANOPY_BROADCAST_CAPACITY", defaults.broadcast_capacity as u64)? as usize;
        if broadcast_capacity == 0 {
            return Err(ServerError::Config("CANOPY_BROADCAST_CAPACITY must be positive".into()));
        }
        let bridge = match lookup("CANOPY_BRIDGE").as_deref().map(str::trim) {
            Some("1") | Some("true") => Some(BridgeConfig::from_lookup(&lookup)?),
            _ => None,
        };

        Ok(Self {
            bind_addr: lookup("CANOPY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            broadcast_capacity,
            snapshot_interval_secs: number("CANOPY_SNAPSHOT_INTERVAL_SECS", defaults.snapshot_interval_secs)?,
            snapshot_path: lookup("CANOPY_SNAPSHOT_PATH").map(PathBuf::from),
            bridge,
        })
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_snapshots: u64,
    pub bridged_messages: u64,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    snapshots: Arc<dyn SnapshotStore>,
    bridge: Option<Arc<SyncBridge>>,
}

/// The relay server.
pub struct SyncServer {
    shared: Shared,
}

impl SyncServer {
    /// Create a server, opening the snapshot store and starting the bridge
    /// as configured. Must be called within a Tokio runtime when a bridge
    /// is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let snapshots: Arc<dyn SnapshotStore> = match &config.snapshot_path {
            Some(path) => Arc::new(RocksSnapshotStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemorySnapshotStore::new()),
        };
        Self::with_snapshot_store(config, snapshots)
    }

    pub fn with_snapshot_store(config: ServerConfig, snapshots: Arc<dyn SnapshotStore>) -> Result<Self, ServerError> {
        let bridge = match &config.bridge {
            Some(bridge_config) => Some(SyncBridge::start(bridge_config.clone())?),
            None => None,
        };
        Ok(Self {
            shared: Shared {
                rooms: Arc::new(RoomManager::new(config.broadcast_capacity)),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                snapshots,
                bridge,
                config,
            },
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        if let Some(bridge) = &self.shared.bridge {
            let shared = self.shared.clone();
            let messages = bridge.messages();
            tokio::spawn(async move { Self::ingest_bridge(shared, messages).await });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Publish a locally originated message to the other processes.
    fn relay(shared: &Shared, room_id: &str, frame: &[u8]) {
        if let Some(bridge) = &shared.bridge {
            if let Err(e) = bridge.publish(room_id, frame.to_vec()) {
                log::warn!("Bridge publish for room {room_id} failed: {e}");
            }
        }
    }

    fn load_snapshot(shared: &Shared, room: &Room) {
        match shared.snapshots.fetch_snapshot(&room.id) {
            Ok(Some(snapshot)) => match room.doc.apply_update(&snapshot) {
                Ok(()) => log::info!("Loaded snapshot for room {} ({} bytes)", room.id, snapshot.len()),
                Err(e) => log::error!("Snapshot for room {} is unreadable: {e}", room.id),
            },
            Ok(None) => {}
            Err(e) => log::error!("Failed to fetch snapshot for room {}: {e}", room.id),
        }
    }

    /// Write the room's full state to the snapshot store.
    fn save_snapshot(shared: &Shared, room: &Room) -> bool {
        let snapshot = room.doc.encode_update();
        match shared.snapshots.persist_snapshot(&room.id, &snapshot) {
            Ok(()) => {
                log::debug!("Persisted snapshot for room {}", room.id);
                true
            }
            Err(e) => {
                // Keep the room dirty so the next tick retries.
                room.mark_dirty();
                log::error!("Failed to persist snapshot for room {}: {e}", room.id);
                false
            }
        }
    }

    async fn persist(shared: &Shared, room: &Room) {
        if Self::save_snapshot(shared, room) {
            shared.stats.write().await.persisted_snapshots += 1;
        }
    }

    /// Frames that bring a lagging peer back in step: the full state, then
    /// the awareness of everyone else in the room.
    async fn resync_frames(room: &Room, peer_id: &Uuid) -> Result<Vec<Vec<u8>>, ServerError> {
        let state = SyncMessage::sync_step2(Uuid::nil(), room.id.as_str(), room.doc.encode_update());
        let mut records = Vec::new();
        for frame in room.group.awareness_frames(peer_id).await {
            match SyncMessage::decode(&frame).and_then(|msg| msg.awareness_record()) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable awareness in room {}: {e}", room.id),
            }
        }
        let snapshot = SyncMessage::awareness_snapshot(room.id.as_str(), &records)?;
        Ok(vec![state.encode()?, snapshot.encode()?])
    }

    /// Forget bridged peers of `room` that went quiet and tell the local
    /// peers they left. Returns the expired ids.
    async fn expire_bridged(room: &Room, now: Instant, ttl: Duration) -> Vec<Uuid> {
        let expired = room.group.evict_idle_remote(now, ttl).await;
        for peer_id in &expired {
            log::info!("Bridged peer {peer_id} in room {} timed out", room.id);
            match SyncMessage::peer_left(*peer_id, room.id.as_str()).encode() {
                Ok(frame) => {
                    room.group.broadcast_raw(Arc::new(frame));
                }
                Err(e) => log::error!("Failed to encode leave of {peer_id}: {e}"),
            }
        }
        expired
    }

    /// While `room` is live, republish its local awareness to the other
    /// processes and expire bridged peers that stopped doing the same.
    fn spawn_liveness(shared: Shared, room: Weak<Room>) {
        let Some(bridge) = shared.bridge.clone() else {
            return;
        };
        let heartbeat = bridge.config().heartbeat_interval;
        let ttl = bridge.config().peer_ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(room) = room.upgrade() else {
                    break;
                };
                for frame in room.group.local_awareness_frames().await {
                    Self::relay(&shared, &room.id, &frame);
                }
                Self::expire_bridged(&room, Instant::now(), ttl).await;
            }
        });
    }

    /// Persist `room` every interval while it is live and changed.
    fn spawn_ticker(shared: Shared, room: Weak<Room>) {
        let secs = shared.config.snapshot_interval_secs;
        if secs == 0 {
            return;
        }
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(room) = room.upgrade() else {
                    break;
                };
                if room.take_dirty() {
                    Self::persist(&shared, &room).await;
                }
            }
        });
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut peer_id: Option<Uuid> = None;
        let mut room: Option<Arc<Room>> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let sync_msg = match SyncMessage::decode(&data) {
                                    Ok(sync_msg) => sync_msg,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = shared.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }

                                match sync_msg.msg_type {
                                    MessageType::PeerJoined => {
                                        if room.is_some() {
                                            log::warn!("Peer {} sent a second join", sync_msg.peer_id);
                                            continue;
                                        }
                                        let joined = shared
                                            .rooms
                                            .join(&sync_msg.room_id, sync_msg.peer_id, |new_room| {
                                                Self::load_snapshot(&shared, new_room)
                                            })
                                            .await;
                                        if joined.created {
                                            Self::spawn_ticker(shared.clone(), Arc::downgrade(&joined.room));
                                            Self::spawn_liveness(shared.clone(), Arc::downgrade(&joined.room));
                                            if let Some(bridge) = &shared.bridge {
                                                if let Err(e) = bridge.subscribe_room(&joined.room.id).await {
                                                    log::error!("Bridge subscribe for room {} failed: {e}", joined.room.id);
                                                }
                                            }
                                        }
                                        peer_id = Some(sync_msg.peer_id);
                                        broadcast_rx = Some(joined.rx);

                                        // Full state first, then everybody's awareness.
                                        let state = SyncMessage::sync_step2(
                                            Uuid::nil(),
                                            joined.room.id.as_str(),
                                            joined.room.doc.encode_update(),
                                        );
                                        ws_sender.send(Message::Binary(state.encode()?.into())).await?;
                                        for frame in joined.room.group.awareness_frames(&sync_msg.peer_id).await {
                                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                                        }

                                        joined.room.group.broadcast_raw(Arc::new(data.to_vec()));
                                        Self::relay(&shared, &joined.room.id, &data);
                                        shared.stats.write().await.active_rooms = shared.rooms.room_count().await;
                                        log::info!("Peer {} joined room {}", sync_msg.peer_id, joined.room.id);
                                        room = Some(joined.room);
                                    }

                                    MessageType::Delta => {
                                        let Some(current) = &room else { continue };
                                        if let Err(e) = current.doc.apply_update(&sync_msg.payload) {
                                            log::warn!("Rejected delta from {} in room {}: {e}", sync_msg.peer_id, current.id);
                                            continue;
                                        }
                                        current.mark_dirty();
                                        current.group.broadcast_raw(Arc::new(data.to_vec()));
                                        Self::relay(&shared, &current.id, &data);
                                    }

                                    MessageType::SyncStep1 => {
                                        let Some(current) = &room else { continue };
                                        match current.doc.encode_diff(&sync_msg.payload) {
                                            Ok(diff) => {
                                                let response = SyncMessage::sync_step2(Uuid::nil(), current.id.as_str(), diff);
                                                ws_sender.send(Message::Binary(response.encode()?.into())).await?;
                                            }
                                            Err(e) => log::warn!("Bad state vector from {}: {e}", sync_msg.peer_id),
                                        }
                                    }

                                    MessageType::Awareness => {
                                        let Some(current) = &room else { continue };
                                        if Some(sync_msg.peer_id) != peer_id {
                                            log::warn!("Ignoring awareness for foreign peer {}", sync_msg.peer_id);
                                            continue;
                                        }
                                        log::trace!("Awareness from {} in room {}", sync_msg.peer_id, current.id);
                                        let frame = Arc::new(data.to_vec());
                                        current.group.set_awareness(sync_msg.peer_id, frame.clone()).await;
                                        current.group.broadcast_raw(frame);
                                        Self::relay(&shared, &current.id, &data);
                                    }

                                    MessageType::Ping => {
                                        let pong = SyncMessage::pong(sync_msg.peer_id);
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }

                                    _ => {
                                        log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    msg = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(frame) => {
                                // Don't echo back to sender
                                if let Ok(sync_msg) = SyncMessage::decode(&frame) {
                                    if Some(sync_msg.peer_id) == peer_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer_id:?} lagged by {n} messages, resyncing");
                                if let (Some(pid), Some(current)) = (&peer_id, &room) {
                                    for frame in Self::resync_frames(current, pid).await? {
                                        ws_sender.send(Message::Binary(frame.into())).await?;
                                    }
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok::<(), ServerError>(())
        }
        .await;

        if let (Some(pid), Some(current)) = (peer_id, room) {
            Self::leave(&shared, &current, pid).await;
        }
        shared.stats.write().await.active_connections -= 1;
        result
    }

    /// Drop a peer from its room, announcing the departure locally and to
    /// other processes. The last local peer out persists the room before it
    /// is unregistered; if that fails the room stays live.
    async fn leave(shared: &Shared, room: &Room, peer_id: Uuid) {
        let mut saved = false;
        let closed = shared
            .rooms
            .leave(&room.id, &peer_id, |closing| {
                saved = Self::save_snapshot(shared, closing);
                saved
            })
            .await;
        if saved {
            shared.stats.write().await.persisted_snapshots += 1;
        }

        let leave_msg = SyncMessage::peer_left(peer_id, room.id.as_str());
        match leave_msg.encode() {
            Ok(frame) => {
                room.group.broadcast_raw(Arc::new(frame.clone()));
                Self::relay(shared, &room.id, &frame);
            }
            Err(e) => log::error!("Failed to encode leave of {peer_id}: {e}"),
        }
        log::info!("Peer {} left room {}", peer_id, room.id);

        if let Some(closed) = closed {
            if let Some(bridge) = &shared.bridge {
                if let Err(e) = bridge.unsubscribe_room(&closed.id).await {
                    log::warn!("Bridge unsubscribe for room {} failed: {e}", closed.id);
                }
            }
            log::info!("Room {} removed (empty)", closed.id);
        }
        shared.stats.write().await.active_rooms = shared.rooms.room_count().await;
    }

    /// Merge and fan out traffic from other processes.
    async fn ingest_bridge(shared: Shared, mut messages: broadcast::Receiver<BridgeMessage>) {
        loop {
            let bridged = match messages.recv().await {
                Ok(bridged) => bridged,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Bridge ingest lagged by {n} messages");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            shared.stats.write().await.bridged_messages += 1;
            if let Err(e) = Self::apply_bridged(&shared, bridged).await {
                log::warn!("Dropping bridged message: {e}");
            }
        }
    }

    async fn apply_bridged(shared: &Shared, bridged: BridgeMessage) -> Result<(), ServerError> {
        let Some(room) = shared.rooms.get(&bridged.room).await else {
            return Ok(());
        };
        let msg = SyncMessage::decode(&bridged.payload)?;
        let frame = Arc::new(bridged.payload);

        match msg.msg_type {
            MessageType::Delta | MessageType::SyncStep2 => {
                if msg.msg_type == MessageType::Delta {
                    room.group.touch(&msg.peer_id).await;
                }
                if let Err(e) = room.doc.apply_update(&msg.payload) {
                    log::warn!("Rejected bridged update for room {}: {e}", room.id);
                    return Ok(());
                }
                room.mark_dirty();
                room.group.broadcast_raw(frame);
            }
            MessageType::Awareness => {
                room.group.set_awareness(msg.peer_id, frame.clone()).await;
                room.group.broadcast_raw(frame);
            }
            MessageType::PeerJoined => {
                room.group.track_remote(msg.peer_id).await;
                room.group.broadcast_raw(frame);
                // Bring the newcomer's process up to date.
                for awareness in room.group.local_awareness_frames().await {
                    Self::relay(shared, &room.id, &awareness);
                }
                let state = SyncMessage::sync_step2(Uuid::nil(), room.id.as_str(), room.doc.encode_update());
                Self::relay(shared, &room.id, &state.encode()?);
            }
            MessageType::PeerLeft => {
                room.group.remove_peer(&msg.peer_id).await;
                room.group.broadcast_raw(frame);
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.shared.rooms
    }

    pub fn bridge(&self) -> Option<&Arc<SyncBridge>> {
        self.shared.bridge.as_ref()
    }
}
