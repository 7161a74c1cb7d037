//! Relay transport: peers in different processes meeting on a pub/sub
//! room topic, with no relay server in between.
//!
//! There is no authoritative copy of the document anywhere, so every
//! store keeps a mirror of the merged state and answers newcomers with it.
//! Peers sharing one [`SyncBridge`] do not hear each other; in-process
//! peers belong on an [`super::InProcessHub`].
//!
//! Nothing tells a peer that another one crashed. Every store republishes
//! its awareness each heartbeat interval, and a remote record not heard
//! from within the bridge's peer TTL is dropped, taking its lock with it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canopy_core::{ReplicatedDocument, YrsDocument};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::{lock, AwarenessCallback, Listeners, RemoteAwareness, SessionStore, StoreError, UpdateCallback};
use crate::awareness::AwarenessRecord;
use crate::bridge::{BridgeMessage, SyncBridge};
use crate::protocol::{MessageType, SyncMessage};

/// State touched by the pump task.
struct RelayPeer {
    client_id: Uuid,
    room_id: String,
    mirror: YrsDocument,
    local: Mutex<AwarenessRecord>,
    remote: Mutex<RemoteAwareness>,
    listeners: Listeners,
    clock: AtomicU64,
}

impl RelayPeer {
    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn awareness_message(&self) -> Option<SyncMessage> {
        let record = lock(&self.local).clone();
        if record.fields.is_empty() {
            return None;
        }
        match SyncMessage::awareness(self.client_id, self.room_id.as_str(), self.next_clock(), &record) {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::warn!("Awareness of {} not encodable: {}", self.client_id, e);
                None
            }
        }
    }

    /// The local record as a sign of life, sent even when it has no fields.
    fn heartbeat(&self) -> Option<SyncMessage> {
        let record = lock(&self.local).clone();
        match SyncMessage::awareness(self.client_id, self.room_id.as_str(), self.next_clock(), &record) {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::warn!("Heartbeat of {} not encodable: {}", self.client_id, e);
                None
            }
        }
    }

    /// Drop remote records silent for longer than `ttl`.
    fn expire(&self, now: Instant, ttl: Duration) {
        let snapshot = {
            let mut remote = lock(&self.remote);
            remote.evict_idle(now, ttl).then(|| remote.snapshot())
        };
        if let Some(snapshot) = snapshot {
            self.listeners.emit_awareness(&snapshot);
        }
    }

    /// Decode and handle one relayed message, publishing any replies.
    fn receive(&self, bridge: &SyncBridge, incoming: BridgeMessage) {
        if incoming.room != self.room_id {
            return;
        }
        let msg = match SyncMessage::decode(&incoming.payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable relayed message: {}", e);
                return;
            }
        };
        for reply in self.handle(msg) {
            if let Err(e) = publish(bridge, &self.room_id, &reply) {
                log::warn!("Relay reply from {} failed: {}", self.client_id, e);
            }
        }
    }

    /// Handle one message from another process. Returns the replies to
    /// publish.
    fn handle(&self, msg: SyncMessage) -> Vec<SyncMessage> {
        if msg.peer_id == self.client_id || msg.room_id != self.room_id {
            return Vec::new();
        }
        match msg.msg_type {
            MessageType::Delta | MessageType::SyncStep2 => {
                if let Err(e) = self.mirror.apply_update(&msg.payload) {
                    log::warn!("Dropping relayed update from {}: {}", msg.peer_id, e);
                    return Vec::new();
                }
                self.listeners.emit_update(&msg.payload);
                Vec::new()
            }
            MessageType::Awareness => {
                let Ok(record) = msg.awareness_record() else {
                    return Vec::new();
                };
                let snapshot = {
                    let mut remote = lock(&self.remote);
                    remote.upsert(record).then(|| remote.snapshot())
                };
                if let Some(snapshot) = snapshot {
                    self.listeners.emit_awareness(&snapshot);
                }
                Vec::new()
            }
            MessageType::PeerLeft => {
                let snapshot = {
                    let mut remote = lock(&self.remote);
                    remote.remove(&msg.peer_id).then(|| remote.snapshot())
                };
                if let Some(snapshot) = snapshot {
                    self.listeners.emit_awareness(&snapshot);
                }
                Vec::new()
            }
            MessageType::PeerJoined => {
                log::debug!("Peer {} joined {} through the relay", msg.peer_id, self.room_id);
                let mut replies: Vec<SyncMessage> = self.awareness_message().into_iter().collect();
                replies.push(SyncMessage::sync_step2(
                    self.client_id,
                    self.room_id.as_str(),
                    self.mirror.encode_update(),
                ));
                replies
            }
            MessageType::SyncStep1 => match self.mirror.encode_diff(&msg.payload) {
                Ok(diff) => vec![SyncMessage::sync_step2(self.client_id, self.room_id.as_str(), diff)],
                Err(e) => {
                    log::warn!("Bad state vector from {}: {}", msg.peer_id, e);
                    Vec::new()
                }
            },
            MessageType::AwarenessSnapshot | MessageType::Ping | MessageType::Pong => Vec::new(),
        }
    }
}

/// Publish `msg` on the peer's room through `bridge`.
fn publish(bridge: &SyncBridge, room_id: &str, msg: &SyncMessage) -> Result<(), StoreError> {
    let encoded = msg.encode()?;
    bridge.publish(room_id, encoded)?;
    Ok(())
}

/// Client of one room over a [`SyncBridge`].
pub struct RelayStore {
    bridge: Arc<SyncBridge>,
    peer: Arc<RelayPeer>,
    connected: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RelayStore {
    pub fn new(bridge: Arc<SyncBridge>, room_id: impl Into<String>) -> Self {
        let client_id = Uuid::new_v4();
        Self {
            bridge,
            peer: Arc::new(RelayPeer {
                client_id,
                room_id: room_id.into(),
                mirror: YrsDocument::new(),
                local: Mutex::new(AwarenessRecord::new(client_id)),
                remote: Mutex::new(RemoteAwareness::default()),
                listeners: Listeners::default(),
                clock: AtomicU64::new(0),
            }),
            connected: AtomicBool::new(false),
            pump: Mutex::new(None),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.peer.room_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Merged state as this peer knows it.
    pub fn encode_state(&self) -> Vec<u8> {
        self.peer.mirror.encode_update()
    }

    fn send(&self, msg: &SyncMessage) {
        if let Err(e) = publish(&self.bridge, &self.peer.room_id, msg) {
            log::warn!("Relay publish from {} failed: {}", self.peer.client_id, e);
        }
    }
}

impl SessionStore for RelayStore {
    async fn connect(&self) -> Result<(), StoreError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.bridge.subscribe_room(&self.peer.room_id).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let mut messages = self.bridge.messages();
        let bridge = self.bridge.clone();
        let peer = self.peer.clone();
        let every = self.bridge.config().heartbeat_interval;
        let ttl = self.bridge.config().peer_ttl;
        let pump = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(every);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick is immediate; connect announces us anyway.
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    received = messages.recv() => match received {
                        Ok(incoming) => peer.receive(&bridge, incoming),
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Relay peer {} skipped {} messages", peer.client_id, skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = heartbeat.tick() => {
                        if let Some(beat) = peer.heartbeat() {
                            if let Err(e) = publish(&bridge, &peer.room_id, &beat) {
                                log::warn!("Heartbeat from {} failed: {}", peer.client_id, e);
                            }
                        }
                        peer.expire(Instant::now(), ttl);
                    }
                }
            }
        });
        *lock(&self.pump) = Some(pump);

        let joined = SyncMessage::peer_joined(self.peer.client_id, self.peer.room_id.as_str());
        publish(&self.bridge, &self.peer.room_id, &joined)?;
        if let Some(awareness) = self.peer.awareness_message() {
            self.send(&awareness);
        }
        // Edits made while offline.
        let state = SyncMessage::sync_step2(
            self.peer.client_id,
            self.peer.room_id.as_str(),
            self.peer.mirror.encode_update(),
        );
        self.send(&state);
        log::info!("{} joined {} over the relay", self.peer.client_id, self.peer.room_id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.send(&SyncMessage::peer_left(self.peer.client_id, self.peer.room_id.as_str()));
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        let had_peers = lock(&self.peer.remote).clear();
        if had_peers {
            self.peer.listeners.emit_awareness(&[]);
        }
        Ok(())
    }

    fn on_awareness_change(&self, callback: AwarenessCallback) {
        self.peer.listeners.add_awareness(callback);
    }

    fn set_awareness_info(&self, field: &str, value: Option<Value>) {
        let changed = lock(&self.peer.local).set(field, value);
        if !changed || !self.is_connected() {
            return;
        }
        let record = lock(&self.peer.local).clone();
        match SyncMessage::awareness(
            self.peer.client_id,
            self.peer.room_id.as_str(),
            self.peer.next_clock(),
            &record,
        ) {
            Ok(msg) => self.send(&msg),
            Err(e) => log::warn!("Awareness of {} not encodable: {}", self.peer.client_id, e),
        }
    }

    fn publish_update(&self, update: Vec<u8>) {
        if let Err(e) = self.peer.mirror.apply_update(&update) {
            log::warn!("Local update rejected by mirror: {}", e);
            return;
        }
        // Offline edits live in the mirror and go out with the join state.
        if self.is_connected() {
            let msg = SyncMessage::delta(
                self.peer.client_id,
                self.peer.room_id.as_str(),
                self.peer.next_clock(),
                update,
            );
            self.send(&msg);
        }
    }

    fn on_document_update(&self, callback: UpdateCallback) {
        self.peer.listeners.add_update(callback);
    }

    fn local_client_id(&self) -> Uuid {
        self.peer.client_id
    }
}

impl Drop for RelayStore {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer(room: &str) -> RelayPeer {
        let client_id = Uuid::new_v4();
        RelayPeer {
            client_id,
            room_id: room.to_string(),
            mirror: YrsDocument::new(),
            local: Mutex::new(AwarenessRecord::new(client_id)),
            remote: Mutex::new(RemoteAwareness::default()),
            listeners: Listeners::default(),
            clock: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_relayed_updates_reach_mirror_and_listeners() {
        let p = peer("board");
        let got = Arc::new(Mutex::new(0));
        let g = got.clone();
        p.listeners.add_update(Arc::new(move |_: &[u8]| *g.lock().unwrap() += 1));

        let source = YrsDocument::new();
        source.set_map("scene", "root", json!("main"));
        let replies = p.handle(SyncMessage::delta(Uuid::new_v4(), "board", 1, source.encode_update()));

        assert!(replies.is_empty());
        assert_eq!(*got.lock().unwrap(), 1);
        assert_eq!(p.mirror.get_map("scene", "root"), Some(json!("main")));
    }

    #[test]
    fn test_other_rooms_and_own_messages_ignored() {
        let p = peer("board");
        let source = YrsDocument::new();
        source.set_map("scene", "root", json!("main"));

        p.handle(SyncMessage::delta(Uuid::new_v4(), "other", 1, source.encode_update()));
        p.handle(SyncMessage::delta(p.client_id, "board", 1, source.encode_update()));
        assert_eq!(p.mirror.get_map("scene", "root"), None);
    }

    #[test]
    fn test_awareness_join_and_leave() {
        let p = peer("board");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        p.listeners
            .add_awareness(Arc::new(move |records: &[AwarenessRecord]| s.lock().unwrap().push(records.len())));

        let other = Uuid::new_v4();
        let mut record = AwarenessRecord::new(other);
        record.set("pointer", Some(json!({"x": 3, "y": 4})));
        let msg = SyncMessage::awareness(other, "board", 1, &record).unwrap();
        p.handle(msg.clone());
        // Unchanged record is not a change.
        p.handle(msg);
        p.handle(SyncMessage::peer_left(other, "board"));

        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_newcomer_gets_awareness_and_state() {
        let p = peer("board");
        p.mirror.set_map("scene", "root", json!("main"));
        lock(&p.local).set("pointer", Some(json!({"x": 1, "y": 1})));

        let replies = p.handle(SyncMessage::peer_joined(Uuid::new_v4(), "board"));
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].msg_type, MessageType::Awareness);
        assert_eq!(replies[1].msg_type, MessageType::SyncStep2);

        let replica = YrsDocument::from_update(&replies[1].payload).unwrap();
        assert_eq!(replica.get_map("scene", "root"), Some(json!("main")));
    }

    #[test]
    fn test_newcomer_without_awareness_gets_state_only() {
        let p = peer("board");
        let replies = p.handle(SyncMessage::peer_joined(Uuid::new_v4(), "board"));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg_type, MessageType::SyncStep2);
    }

    #[test]
    fn test_silent_peer_is_dropped_with_its_lock() {
        let p = peer("board");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        p.listeners.add_awareness(Arc::new(move |records: &[AwarenessRecord]| {
            s.lock().unwrap().push(records.iter().map(|r| r.mutex_lock().is_some()).collect::<Vec<_>>())
        }));

        let crashed = Uuid::new_v4();
        let mut record = AwarenessRecord::new(crashed);
        record.set("userMutexLock", Some(json!({"user": {"id": "z", "name": "Z", "email": ""}, "nodeIds": ["n1"], "operation": "move"})));
        p.handle(SyncMessage::awareness(crashed, "board", 1, &record).unwrap());

        let ttl = Duration::from_secs(30);
        p.expire(Instant::now(), ttl);
        p.expire(Instant::now() + ttl + Duration::from_secs(1), ttl);

        assert_eq!(*seen.lock().unwrap(), vec![vec![true], vec![]]);
    }

    #[test]
    fn test_heartbeat_keeps_a_peer_alive() {
        let p = peer("board");
        let other = peer("board");
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        p.listeners.add_awareness(Arc::new(move |_: &[AwarenessRecord]| *s.lock().unwrap() += 1));

        // Even a peer with nothing to show announces itself.
        let beat = other.heartbeat().unwrap();
        assert_eq!(beat.msg_type, MessageType::Awareness);
        assert!(other.awareness_message().is_none());

        p.handle(beat);
        let ttl = Duration::from_secs(30);
        p.expire(Instant::now() + Duration::from_secs(25), ttl);
        // A repeated heartbeat refreshes the peer without being a change.
        p.handle(other.heartbeat().unwrap());
        p.expire(Instant::now() + Duration::from_secs(25), ttl);

        assert_eq!(lock(&p.remote).snapshot().len(), 1);
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
