//! In-process transport: peers of one process sharing a hub.
//!
//! The hub keeps the authoritative document and the awareness record of
//! every connected peer. Every delivery is queued under the hub lock, so
//! each receiver sees snapshots in publish order. The queue is drained on
//! the caller's thread after the lock is released; a publish made from
//! inside a delivery is queued behind it and delivered by the outer drain.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use canopy_core::{ReplicatedDocument, YrsDocument};
use serde_json::Value;
use uuid::Uuid;

use super::socket::OfflineQueue;
use super::{lock, AwarenessCallback, Listeners, SessionStore, StoreError, UpdateCallback};
use crate::awareness::AwarenessRecord;

struct HubPeer {
    record: AwarenessRecord,
    listeners: Arc<Listeners>,
}

enum Delivery {
    Awareness(Arc<Listeners>, Vec<AwarenessRecord>),
    Update(Arc<Listeners>, Arc<[u8]>),
}

impl Delivery {
    fn run(self) {
        match self {
            Delivery::Awareness(listeners, records) => listeners.emit_awareness(&records),
            Delivery::Update(listeners, update) => listeners.emit_update(&update),
        }
    }
}

#[derive(Default)]
struct HubState {
    doc: YrsDocument,
    peers: BTreeMap<Uuid, HubPeer>,
    pending: VecDeque<Delivery>,
    draining: bool,
}

impl HubState {
    /// Remote view of `client_id`: every record but its own.
    fn snapshot_for(&self, client_id: &Uuid) -> Vec<AwarenessRecord> {
        self.peers
            .iter()
            .filter(|(id, _)| *id != client_id)
            .map(|(_, peer)| peer.record.clone())
            .collect()
    }

    /// Queue the current view of everyone except `origin`.
    fn fan_out(&mut self, origin: &Uuid) {
        let deliveries: Vec<Delivery> = self
            .peers
            .iter()
            .filter(|(id, _)| *id != origin)
            .map(|(id, peer)| Delivery::Awareness(peer.listeners.clone(), self.snapshot_for(id)))
            .collect();
        self.pending.extend(deliveries);
    }
}

/// Lets a later drain run if a listener panics.
struct Draining<'a>(&'a Mutex<HubState>);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(self.0).draining = false;
        }
    }
}

/// Shared meeting point of in-process peers. Cloning shares the hub.
#[derive(Clone, Default)]
pub struct InProcessHub {
    state: Arc<Mutex<HubState>>,
}

impl InProcessHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store attached to this hub with a fresh client id.
    pub fn store(&self) -> InProcessStore {
        InProcessStore::new(self.clone())
    }

    /// Ids of the peers currently connected.
    pub fn connected_peers(&self) -> Vec<Uuid> {
        lock(&self.state).peers.keys().copied().collect()
    }

    /// The hub's merged document state.
    pub fn encode_state(&self) -> Vec<u8> {
        lock(&self.state).doc.encode_update()
    }

    /// Run queued deliveries until the queue is empty. Returns at once if
    /// another call is already draining; that call delivers ours too.
    fn drain(&self) {
        {
            let mut state = lock(&self.state);
            if state.draining {
                return;
            }
            state.draining = true;
        }
        let _draining = Draining(&self.state);
        loop {
            let next = {
                let mut state = lock(&self.state);
                match state.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            next.run();
        }
    }

    fn attach(&self, client_id: Uuid, record: AwarenessRecord, listeners: Arc<Listeners>) -> bool {
        {
            let mut state = lock(&self.state);
            if state.peers.contains_key(&client_id) {
                return false;
            }
            state.peers.insert(client_id, HubPeer { record, listeners: listeners.clone() });
            let update: Arc<[u8]> = state.doc.encode_update().into();
            state.pending.push_back(Delivery::Update(listeners.clone(), update));
            let own_view = state.snapshot_for(&client_id);
            if !own_view.is_empty() {
                state.pending.push_back(Delivery::Awareness(listeners, own_view));
            }
            state.fan_out(&client_id);
        }
        self.drain();
        true
    }

    /// Remove a peer and tell the others. `farewell` receives an empty view
    /// in queue order, after anything already queued for it.
    fn detach(&self, client_id: &Uuid, farewell: Option<Arc<Listeners>>) -> bool {
        {
            let mut state = lock(&self.state);
            if state.peers.remove(client_id).is_none() {
                return false;
            }
            state.fan_out(client_id);
            if let Some(listeners) = farewell {
                state.pending.push_back(Delivery::Awareness(listeners, Vec::new()));
            }
        }
        self.drain();
        true
    }

    fn update_record(&self, record: AwarenessRecord) {
        {
            let mut state = lock(&self.state);
            let client_id = record.client_id;
            match state.peers.get_mut(&client_id) {
                Some(peer) => peer.record = record,
                None => return,
            }
            state.fan_out(&client_id);
        }
        self.drain();
    }

    fn publish(&self, origin: &Uuid, update: &[u8]) {
        {
            let mut state = lock(&self.state);
            if let Err(e) = state.doc.apply_update(update) {
                log::warn!("Hub rejected update from {}: {}", origin, e);
                return;
            }
            let shared: Arc<[u8]> = update.into();
            let deliveries: Vec<Delivery> = state
                .peers
                .iter()
                .filter(|(id, _)| *id != origin)
                .map(|(_, peer)| Delivery::Update(peer.listeners.clone(), shared.clone()))
                .collect();
            state.pending.extend(deliveries);
        }
        self.drain();
    }
}

/// One peer's connection to an [`InProcessHub`].
pub struct InProcessStore {
    hub: InProcessHub,
    client_id: Uuid,
    local: Mutex<AwarenessRecord>,
    listeners: Arc<Listeners>,
    offline_queue: Mutex<OfflineQueue>,
    connected: AtomicBool,
}

impl InProcessStore {
    pub fn new(hub: InProcessHub) -> Self {
        Self::with_client_id(hub, Uuid::new_v4())
    }

    pub fn with_client_id(hub: InProcessHub, client_id: Uuid) -> Self {
        Self {
            hub,
            client_id,
            local: Mutex::new(AwarenessRecord::new(client_id)),
            listeners: Arc::new(Listeners::default()),
            offline_queue: Mutex::new(OfflineQueue::new(10_000)),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current local awareness record.
    pub fn local_record(&self) -> AwarenessRecord {
        lock(&self.local).clone()
    }

    /// Leave the hub the way a crashed peer would: the record vanishes and
    /// nothing else is sent. Local listeners are not told.
    pub fn drop_without_goodbye(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            log::debug!("Peer {} dropped without goodbye", self.client_id);
            self.hub.detach(&self.client_id, None);
        }
    }
}

impl SessionStore for InProcessStore {
    async fn connect(&self) -> Result<(), StoreError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let record = self.local_record();
        self.hub.attach(self.client_id, record, self.listeners.clone());

        let queued = lock(&self.offline_queue).drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
        }
        for (_, update) in queued {
            self.hub.publish(&self.client_id, &update);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // Our remote view is now empty.
        self.hub.detach(&self.client_id, Some(self.listeners.clone()));
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
        if self.is_connected() {
            self.hub.update_record(record);
        }
    }

    fn publish_update(&self, update: Vec<u8>) {
        if self.is_connected() {
            self.hub.publish(&self.client_id, &update);
            return;
        }
        let mut queue = lock(&self.offline_queue);
        let clock = queue.len() as u64 + 1;
        if !queue.enqueue(clock, update) {
            log::warn!("Offline queue full, dropping update from {}", self.client_id);
        }
    }

    fn on_document_update(&self, callback: UpdateCallback) {
        self.listeners.add_update(callback);
    }

    fn local_client_id(&self) -> Uuid {
        self.client_id
    }
}

impl Drop for InProcessStore {
    fn drop(&mut self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.hub.detach(&self.client_id, None);
        }
    }
}
