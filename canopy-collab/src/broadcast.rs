//! Rooms and their fan-out.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each local peer gets an independent receiver that buffers up to
//! `capacity` messages; lagging peers drop messages.
//!
//! A group also remembers the latest awareness frame of every peer it
//! knows, local or bridged, so that a joining peer can be brought up to
//! date without waiting for everybody to republish. Bridged peers are only
//! known by what they send, so the group also notes when each was last
//! heard from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canopy_core::YrsDocument;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub local_peers: usize,
    pub remote_peers: usize,
}

#[derive(Debug, Clone, Default)]
struct PeerSlot {
    /// Connected to this process (as opposed to learned through the bridge)
    local: bool,
    /// Latest encoded awareness message
    awareness: Option<Arc<Vec<u8>>>,
    last_seen: Option<Instant>,
}

/// Fan-out group of one room.
///
/// Every message is delivered to every local receiver, the sender
/// included; filtering is the receiver's job.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerSlot>>,
    capacity: usize,
    /// Lock-free on the hot path
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of messages buffered per peer before a
    /// lagging peer starts dropping.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a locally connected peer. Returns its receiver.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.entry(peer_id).or_default().local = true;
        self.sender.subscribe()
    }

    /// Remember a peer connected to another process.
    pub async fn track_remote(&self, peer_id: Uuid) {
        self.peers.write().await.entry(peer_id).or_default().last_seen = Some(Instant::now());
    }

    /// Note that a known peer was heard from.
    pub async fn touch(&self, peer_id: &Uuid) {
        if let Some(slot) = self.peers.write().await.get_mut(peer_id) {
            slot.last_seen = Some(Instant::now());
        }
    }

    /// Forget bridged peers not heard from within `ttl` of `now`. Returns
    /// their ids. Local peers are never expired.
    pub async fn evict_idle_remote(&self, now: Instant, ttl: Duration) -> Vec<Uuid> {
        let mut peers = self.peers.write().await;
        let idle: Vec<Uuid> = peers
            .iter()
            .filter(|(_, slot)| !slot.local)
            .filter(|(_, slot)| slot.last_seen.map_or(true, |at| now.saturating_duration_since(at) > ttl))
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            peers.remove(id);
        }
        idle
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id).is_some()
    }

    /// Cache the latest awareness frame of `peer_id`.
    pub async fn set_awareness(&self, peer_id: Uuid, frame: Arc<Vec<u8>>) {
        let mut peers = self.peers.write().await;
        let slot = peers.entry(peer_id).or_default();
        slot.awareness = Some(frame);
        slot.last_seen = Some(Instant::now());
    }

    /// Cached awareness frames of every peer except `except`.
    pub async fn awareness_frames(&self, except: &Uuid) -> Vec<Arc<Vec<u8>>> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id != except)
            .filter_map(|(_, slot)| slot.awareness.clone())
            .collect()
    }

    /// Cached awareness frames of local peers only.
    pub async fn local_awareness_frames(&self) -> Vec<Arc<Vec<u8>>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|slot| slot.local)
            .filter_map(|slot| slot.awareness.clone())
            .collect()
    }

    /// Encode and send to every local receiver.
    ///
    /// Returns the number of receivers that got the message.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes without re-serializing.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn local_peer_count(&self) -> usize {
        self.peers.read().await.values().filter(|slot| slot.local).count()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        let local_peers = peers.values().filter(|slot| slot.local).count();
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            local_peers,
            remote_peers: peers.len() - local_peers,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One live room: authoritative document plus its fan-out group.
pub struct Room {
    pub id: String,
    pub doc: YrsDocument,
    pub group: BroadcastGroup,
    /// Changed since the last persisted snapshot
    dirty: AtomicBool,
}

impl Room {
    fn new(id: &str, capacity: usize) -> Self {
        Self {
            id: id.to_string(),
            doc: YrsDocument::new(),
            group: BroadcastGroup::new(capacity),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Returns whether the room had unsaved changes, clearing the flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

/// Result of [`RoomManager::join`].
pub struct Joined {
    pub room: Arc<Room>,
    pub rx: broadcast::Receiver<Arc<Vec<u8>>>,
    /// The room did not exist before this join
    pub created: bool,
}

/// Maps room ids to live rooms.
///
/// Joining and leaving happen under the registry lock, so a room is
/// never removed while a peer is joining it, and a closing room is saved
/// before anyone can open it again.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add a local peer to `room_id`, creating the room if needed.
    ///
    /// `init` runs once on a newly created room, before anyone can see it.
    pub async fn join<F>(&self, room_id: &str, peer_id: Uuid, init: F) -> Joined
    where
        F: FnOnce(&Room),
    {
        let mut rooms = self.rooms.write().await;
        let (room, created) = match rooms.get(room_id) {
            Some(room) => (room.clone(), false),
            None => {
                let room = Arc::new(Room::new(room_id, self.default_capacity));
                init(&room);
                rooms.insert(room_id.to_string(), room.clone());
                (room, true)
            }
        };
        let rx = room.group.add_peer(peer_id).await;
        Joined { room, rx, created }
    }

    /// Remove a local peer.
    ///
    /// When no local peer remains, `on_close` runs on the room while it is
    /// still registered and nobody can join. If it returns true the room
    /// is dropped from the registry and returned; otherwise it stays, and
    /// the next peer to join picks it up as it is.
    pub async fn leave<F>(&self, room_id: &str, peer_id: &Uuid, on_close: F) -> Option<Arc<Room>>
    where
        F: FnOnce(&Room) -> bool,
    {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(room_id)?.clone();
        room.group.remove_peer(peer_id).await;
        if room.group.local_peer_count().await > 0 || !on_close(&room) {
            return None;
        }
        rooms.remove(room_id);
        Some(room)
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::ReplicatedDocument;
    use serde_json::json;

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = Uuid::new_v4();

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.local_peer_count().await, 1);
        assert!(group.has_peer(&peer).await);

        assert!(group.remove_peer(&peer).await);
        assert!(!group.remove_peer(&peer).await);
        assert_eq!(group.local_peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let sender = Uuid::new_v4();
        let mut rx1 = group.add_peer(sender).await;
        let mut rx2 = group.add_peer(Uuid::new_v4()).await;

        let msg = SyncMessage::delta(sender, "r", 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        let got = rx1.recv().await.unwrap();
        assert_eq!(SyncMessage::decode(&got).unwrap(), msg);
        assert_eq!(*rx2.recv().await.unwrap(), *got);
    }

    #[tokio::test]
    async fn test_awareness_cache() {
        let group = BroadcastGroup::new(16);
        let local = Uuid::new_v4();
        let remote = Uuid::new_v4();
        let _rx = group.add_peer(local).await;
        group.track_remote(remote).await;

        group.set_awareness(local, Arc::new(vec![1])).await;
        group.set_awareness(remote, Arc::new(vec![2])).await;
        group.set_awareness(remote, Arc::new(vec![3])).await;

        assert_eq!(group.awareness_frames(&local).await, vec![Arc::new(vec![3])]);
        assert_eq!(group.local_awareness_frames().await, vec![Arc::new(vec![1])]);
        let stats = group.stats().await;
        assert_eq!((stats.local_peers, stats.remote_peers), (1, 1));
    }

    #[tokio::test]
    async fn test_join_runs_init_once() {
        let manager = RoomManager::new(16);
        let first = manager
            .join("board", Uuid::new_v4(), |room| room.doc.set_map("scene", "root", json!("main")))
            .await;
        let second = manager.join("board", Uuid::new_v4(), |_| panic!("room exists")).await;

        assert!(first.created);
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.room, &second.room));
        assert_eq!(second.room.doc.get_map("scene", "root"), Some(json!("main")));
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_leave_removes_empty_room() {
        let manager = RoomManager::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        manager.join("board", a, |_| {}).await;
        manager.join("board", b, |_| {}).await;
        manager.get("board").await.unwrap().group.track_remote(Uuid::new_v4()).await;

        assert!(manager.leave("board", &a, |_| panic!("room still has b")).await.is_none());
        // Bridged peers do not keep a room alive.
        let closed = manager.leave("board", &b, |_| true).await.unwrap();
        assert_eq!(closed.id, "board");
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.leave("board", &b, |_| true).await.is_none());
    }

    #[tokio::test]
    async fn test_closing_room_is_saved_before_it_can_reopen() {
        let manager = RoomManager::new(16);
        let saved: std::sync::Mutex<Option<Vec<u8>>> = std::sync::Mutex::new(None);
        let peer = Uuid::new_v4();

        let joined = manager.join("board", peer, |_| {}).await;
        joined.room.doc.set_map("scene", "root", json!("main"));
        manager
            .leave("board", &peer, |room| {
                *saved.lock().unwrap() = Some(room.doc.encode_update());
                true
            })
            .await;

        // A fresh room loads what the close just wrote.
        let reopened = manager
            .join("board", Uuid::new_v4(), |room| {
                let snapshot = saved.lock().unwrap().clone().unwrap();
                room.doc.apply_update(&snapshot).unwrap();
            })
            .await;
        assert!(reopened.created);
        assert_eq!(reopened.room.doc.get_map("scene", "root"), Some(json!("main")));
    }

    #[tokio::test]
    async fn test_failed_close_keeps_room() {
        let manager = RoomManager::new(16);
        let peer = Uuid::new_v4();
        let joined = manager.join("board", peer, |_| {}).await;
        joined.room.doc.set_map("scene", "root", json!("main"));

        assert!(manager.leave("board", &peer, |_| false).await.is_none());
        assert_eq!(manager.room_count().await, 1);

        let rejoined = manager.join("board", Uuid::new_v4(), |_| panic!("room was kept")).await;
        assert!(!rejoined.created);
        assert_eq!(rejoined.room.doc.get_map("scene", "root"), Some(json!("main")));
    }

    #[tokio::test]
    async fn test_silent_bridged_peers_expire() {
        let group = BroadcastGroup::new(16);
        let local = Uuid::new_v4();
        let quiet = Uuid::new_v4();
        let chatty = Uuid::new_v4();
        let _rx = group.add_peer(local).await;
        group.track_remote(quiet).await;
        group.set_awareness(chatty, Arc::new(vec![1])).await;

        let ttl = Duration::from_secs(30);
        assert!(group.evict_idle_remote(Instant::now(), ttl).await.is_empty());

        let later = Instant::now() + ttl + Duration::from_secs(1);
        let mut expired = group.evict_idle_remote(later, ttl).await;
        expired.sort();
        let mut expected = vec![quiet, chatty];
        expected.sort();
        assert_eq!(expired, expected);
        assert!(group.has_peer(&local).await);
        assert!(group.awareness_frames(&local).await.is_empty());
    }

    #[test]
    fn test_dirty_flag() {
        let room = Room::new("r", 4);
        assert!(!room.take_dirty());
        room.mark_dirty();
        assert!(room.take_dirty());
        assert!(!room.take_dirty());
    }
}
