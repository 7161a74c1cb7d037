//! WebSocket transport: a client of the relay server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Document update send/receive over the binary protocol
//! - Awareness record publishing and the remote awareness snapshot
//! - Offline queue for updates published while disconnected

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{lock, AwarenessCallback, Listeners, RemoteAwareness, SessionStore, StoreError, UpdateCallback};
use crate::awareness::AwarenessRecord;
use crate::protocol::{MessageType, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Offline queue for updates published while disconnected.
///
/// Queued updates are replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns false when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate { clock, payload });
        true
    }

    /// Drain all queued updates for replay.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|d| (d.clock, d.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// WebSocket client of one room on the relay server.
pub struct SocketStore {
    client_id: Uuid,
    room_id: String,
    server_url: String,
    state: Arc<Mutex<ConnectionState>>,
    /// Per-peer send counter
    clock: AtomicU64,
    offline_queue: Mutex<OfflineQueue>,
    outgoing_tx: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    local: Mutex<AwarenessRecord>,
    remote: Arc<Mutex<RemoteAwareness>>,
    listeners: Arc<Listeners>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketStore {
    /// `server_url` is the server base (e.g. `ws://127.0.0.1:9090`); the
    /// room id is appended as the path.
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        let client_id = Uuid::new_v4();
        Self {
            client_id,
            room_id: room_id.into(),
            server_url: server_url.into(),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            clock: AtomicU64::new(0),
            offline_queue: Mutex::new(OfflineQueue::new(10_000)),
            outgoing_tx: Mutex::new(None),
            local: Mutex::new(AwarenessRecord::new(client_id)),
            remote: Arc::new(Mutex::new(RemoteAwareness::default())),
            listeners: Arc::new(Listeners::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Current send counter value.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn offline_queue_len(&self) -> usize {
        lock(&self.offline_queue).len()
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), StoreError> {
        let encoded = msg.encode()?;
        match lock(&self.outgoing_tx).as_ref() {
            Some(tx) => tx.send(Outgoing::Frame(encoded)).map_err(|_| StoreError::NotConnected),
            None => Err(StoreError::NotConnected),
        }
    }

    fn send_awareness(&self, record: &AwarenessRecord) {
        let clock = self.clock();
        let result = SyncMessage::awareness(self.client_id, self.room_id.as_str(), clock, record)
            .map_err(StoreError::from)
            .and_then(|msg| self.send(&msg));
        if let Err(e) = result {
            log::debug!("Awareness from {} not sent: {}", self.client_id, e);
        }
    }

    fn spawn_reader<S>(&self, mut ws_reader: S) -> JoinHandle<()>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin
            + Send
            + 'static,
    {
        let client_id = self.client_id;
        let state = self.state.clone();
        let remote = self.remote.clone();
        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        let msg = match SyncMessage::decode(&data) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {}", e);
                                continue;
                            }
                        };
                        if msg.peer_id == client_id {
                            continue;
                        }
                        handle_incoming(msg, &remote, &listeners);
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *lock(&state) = ConnectionState::Disconnected;
            log::info!("Connection of {} closed", client_id);
            let had_peers = lock(&remote).clear();
            if had_peers {
                listeners.emit_awareness(&[]);
            }
        })
    }
}

fn handle_incoming(msg: SyncMessage, remote: &Mutex<RemoteAwareness>, listeners: &Listeners) {
    match msg.msg_type {
        MessageType::SyncStep2 | MessageType::Delta => {
            log::trace!("Update of {} bytes from {}", msg.payload.len(), msg.peer_id);
            listeners.emit_update(&msg.payload);
        }
        MessageType::Awareness => {
            let Ok(record) = msg.awareness_record() else {
                return;
            };
            let snapshot = {
                let mut remote = lock(remote);
                remote.upsert(record).then(|| remote.snapshot())
            };
            if let Some(snapshot) = snapshot {
                listeners.emit_awareness(&snapshot);
            }
        }
        MessageType::PeerLeft => {
            let snapshot = {
                let mut remote = lock(remote);
                remote.remove(&msg.peer_id).then(|| remote.snapshot())
            };
            if let Some(snapshot) = snapshot {
                listeners.emit_awareness(&snapshot);
            }
        }
        MessageType::AwarenessSnapshot => {
            let records = match msg.awareness_records() {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("Dropping awareness snapshot: {}", e);
                    return;
                }
            };
            log::debug!("Resynchronized awareness of {} peers", records.len());
            let snapshot = {
                let mut remote = lock(remote);
                remote.replace(records).then(|| remote.snapshot())
            };
            if let Some(snapshot) = snapshot {
                listeners.emit_awareness(&snapshot);
            }
        }
        MessageType::PeerJoined => {
            log::debug!("Peer {} joined {}", msg.peer_id, msg.room_id);
        }
        _ => {}
    }
}

impl SessionStore for SocketStore {
    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing frames, announces
    /// the peer, publishes the local record and replays the offline queue.
    async fn connect(&self) -> Result<(), StoreError> {
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Disconnected {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let url = format!("{}/{}", self.server_url, self.room_id);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *lock(&self.state) = ConnectionState::Disconnected;
                return Err(StoreError::Connect(format!("{}: {}", url, e)));
            }
        };
        let (mut ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let writer = tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                match outgoing {
                    Outgoing::Frame(data) => {
                        if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });
        *lock(&self.outgoing_tx) = Some(out_tx);

        self.send(&SyncMessage::peer_joined(self.client_id, self.room_id.as_str()))?;
        let record = lock(&self.local).clone();
        if !record.fields.is_empty() {
            self.send_awareness(&record);
        }

        *lock(&self.state) = ConnectionState::Connected;
        log::info!("Peer {} connected to {}", self.client_id, url);

        let queued = lock(&self.offline_queue).drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
            for (clock, payload) in queued {
                self.send(&SyncMessage::delta(self.client_id, self.room_id.as_str(), clock, payload))?;
            }
        }

        let reader = self.spawn_reader(ws_reader);
        lock(&self.tasks).extend([writer, reader]);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if let Some(tx) = lock(&self.outgoing_tx).take() {
            let _ = tx.send(Outgoing::Close);
        }
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        let mut tasks = tasks.into_iter();
        // The first handle is the writer: let it flush the close frame.
        if let Some(writer) = tasks.next() {
            let _ = writer.await;
        }
        for task in tasks {
            task.abort();
        }

        *lock(&self.state) = ConnectionState::Disconnected;
        let had_peers = lock(&self.remote).clear();
        if had_peers {
            self.listeners.emit_awareness(&[]);
        }
        Ok(())
    }

    fn on_awareness_change(&self, callback: AwarenessCallback) {
        self.listeners.add_awareness(callback);
    }

    fn set_awareness_info(&self, field: &str, value: Option<Value>) {
        let record = {
            let mut local = lock(&self.local);
            if !local.set(field, value) {
                return;
            }
            local.clone()
        };
        // Offline changes go out with the next connect.
        if self.connection_state() == ConnectionState::Connected {
            self.send_awareness(&record);
        }
    }

    fn publish_update(&self, update: Vec<u8>) {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let update = if self.connection_state() == ConnectionState::Connected {
            let msg = SyncMessage::delta(self.client_id, self.room_id.as_str(), clock, update);
            match self.send(&msg) {
                Ok(()) => return,
                Err(e) => {
                    log::debug!("Delta {} not sent ({}), queueing", clock, e);
                    msg.payload
                }
            }
        } else {
            update
        };
        if !lock(&self.offline_queue).enqueue(clock, update) {
            log::warn!("Offline queue full, dropping update {}", clock);
        }
    }

    fn on_document_update(&self, callback: UpdateCallback) {
        self.listeners.add_update(callback);
    }

    fn local_client_id(&self) -> Uuid {
        self.client_id
    }
}

impl Drop for SocketStore {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_creation() {
        let store = SocketStore::new("ws://localhost:9090", "board-1");
        assert_eq!(store.room_id(), "board-1");
        assert_eq!(store.server_url(), "ws://localhost:9090");
        assert_eq!(store.connection_state(), ConnectionState::Disconnected);
        assert_eq!(store.clock(), 0);
    }

    #[test]
    fn test_publish_offline_queues() {
        let store = SocketStore::new("ws://localhost:9090", "board-1");
        store.publish_update(vec![1, 2, 3]);
        store.publish_update(vec![4, 5, 6]);
        assert_eq!(store.offline_queue_len(), 2);
        assert_eq!(store.clock(), 2);
    }

    #[test]
    fn test_awareness_offline_is_kept_locally() {
        let store = SocketStore::new("ws://localhost:9090", "board-1");
        store.set_awareness_info("pointer", Some(serde_json::json!({"x": 0, "y": 0})));
        assert!(lock(&store.local).get("pointer").is_some());
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let store = SocketStore::new(format!("ws://127.0.0.1:{}", port), "r");
        assert!(matches!(store.connect().await, Err(StoreError::Connect(_))));
        assert_eq!(store.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_incoming_awareness_and_leave() {
        let remote = Mutex::new(RemoteAwareness::default());
        let listeners = Listeners::default();
        let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
        let s = seen.clone();
        listeners.add_awareness(Arc::new(move |records: &[AwarenessRecord]| s.lock().unwrap().push(records.len())));

        let peer = Uuid::new_v4();
        let mut record = AwarenessRecord::new(peer);
        record.set("pointer", Some(serde_json::json!({"x": 1, "y": 1})));
        let msg = SyncMessage::awareness(peer, "r", 1, &record).unwrap();

        handle_incoming(msg.clone(), &remote, &listeners);
        handle_incoming(msg, &remote, &listeners);
        handle_incoming(SyncMessage::peer_left(peer, "r"), &remote, &listeners);
        handle_incoming(SyncMessage::peer_left(peer, "r"), &remote, &listeners);

        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_awareness_snapshot_replaces_stale_peers() {
        let remote = Mutex::new(RemoteAwareness::default());
        let listeners = Listeners::default();
        let seen = Arc::new(Mutex::new(Vec::<Vec<Uuid>>::new()));
        let s = seen.clone();
        listeners.add_awareness(Arc::new(move |records: &[AwarenessRecord]| {
            s.lock().unwrap().push(records.iter().map(|r| r.client_id).collect())
        }));

        // A peer whose PeerLeft was never seen.
        let gone = AwarenessRecord::new(Uuid::new_v4());
        handle_incoming(SyncMessage::awareness(gone.client_id, "r", 1, &gone).unwrap(), &remote, &listeners);

        let mut present = AwarenessRecord::new(Uuid::new_v4());
        present.set("pointer", Some(serde_json::json!({"x": 5, "y": 5})));
        let snapshot = SyncMessage::awareness_snapshot("r", &[present.clone()]).unwrap();
        handle_incoming(snapshot.clone(), &remote, &listeners);
        // The same snapshot again changes nothing.
        handle_incoming(snapshot, &remote, &listeners);

        assert_eq!(*seen.lock().unwrap(), vec![vec![gone.client_id], vec![present.client_id]]);
        assert_eq!(lock(&remote).snapshot(), vec![present]);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(1, vec![1, 2, 3]);
        queue.enqueue(2, vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained[0], (1, vec![1, 2, 3]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2]));
        assert!(queue.enqueue(3, vec![3]));
        assert!(!queue.enqueue(4, vec![4]));
        queue.clear();
        assert!(queue.is_empty());
    }
}
