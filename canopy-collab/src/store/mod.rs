//! Session Store Contract and its transports.
//!
//! Every transport carries two channels over one connection:
//!
//! ```text
//!              ┌────────────── awareness (ephemeral, per client) ──────────────┐
//! SessionStore │                                                               │ remote peers
//!              └────────────── document updates (opaque CRDT bytes) ───────────┘
//! ```
//!
//! Awareness callbacks receive the full list of remote records (the local
//! client's own record is never included) once per observed change.
//! Publishing awareness never touches the document.
//!
//! The transports form a closed set, selected at construction:
//! - [`local::InProcessStore`]: peers of one process sharing an [`local::InProcessHub`]
//! - [`socket::SocketStore`]: WebSocket client of the relay server
//! - [`relay::RelayStore`]: peers talking through the pub/sub bridge directly

pub mod local;
pub mod relay;
pub mod socket;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::AwarenessRecord;
use crate::bridge::BridgeError;
use crate::protocol::ProtocolError;

pub use local::{InProcessHub, InProcessStore};
pub use relay::RelayStore;
pub use socket::{ConnectionState, OfflineQueue, SocketStore};

/// Receives the full remote awareness snapshot.
pub type AwarenessCallback = Arc<dyn Fn(&[AwarenessRecord]) + Send + Sync>;

/// Receives one encoded document update.
pub type UpdateCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// The interface every transport satisfies.
pub trait SessionStore {
    fn connect(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Register an awareness listener. Several may be registered.
    fn on_awareness_change(&self, callback: AwarenessCallback);

    /// Set (`Some`) or clear (`None`) a field of the local record.
    fn set_awareness_info(&self, field: &str, value: Option<Value>);

    /// Send an encoded document update to every other peer.
    fn publish_update(&self, update: Vec<u8>);

    /// Register a listener for remote document updates, including the
    /// initial state delivered on connect.
    fn on_document_update(&self, callback: UpdateCallback);

    /// Transport-level id of this client.
    fn local_client_id(&self) -> Uuid;
}

/// A session's transport.
pub enum Transport {
    InProcess(InProcessStore),
    Socket(SocketStore),
    Relay(RelayStore),
}

impl Transport {
    pub fn as_in_process(&self) -> Option<&InProcessStore> {
        match self {
            Transport::InProcess(store) => Some(store),
            _ => None,
        }
    }

    pub fn as_socket(&self) -> Option<&SocketStore> {
        match self {
            Transport::Socket(store) => Some(store),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transport::InProcess(_) => "in-process",
            Transport::Socket(_) => "socket",
            Transport::Relay(_) => "relay",
        }
    }
}

impl From<InProcessStore> for Transport {
    fn from(store: InProcessStore) -> Self {
        Transport::InProcess(store)
    }
}

impl From<SocketStore> for Transport {
    fn from(store: SocketStore) -> Self {
        Transport::Socket(store)
    }
}

impl From<RelayStore> for Transport {
    fn from(store: RelayStore) -> Self {
        Transport::Relay(store)
    }
}

impl SessionStore for Transport {
    async fn connect(&self) -> Result<(), StoreError> {
        match self {
            Transport::InProcess(store) => store.connect().await,
            Transport::Socket(store) => store.connect().await,
            Transport::Relay(store) => store.connect().await,
        }
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        match self {
            Transport::InProcess(store) => store.disconnect().await,
            Transport::Socket(store) => store.disconnect().await,
            Transport::Relay(store) => store.disconnect().await,
        }
    }

    fn on_awareness_change(&self, callback: AwarenessCallback) {
        match self {
            Transport::InProcess(store) => store.on_awareness_change(callback),
            Transport::Socket(store) => store.on_awareness_change(callback),
            Transport::Relay(store) => store.on_awareness_change(callback),
        }
    }

    fn set_awareness_info(&self, field: &str, value: Option<Value>) {
        match self {
            Transport::InProcess(store) => store.set_awareness_info(field, value),
            Transport::Socket(store) => store.set_awareness_info(field, value),
            Transport::Relay(store) => store.set_awareness_info(field, value),
        }
    }

    fn publish_update(&self, update: Vec<u8>) {
        match self {
            Transport::InProcess(store) => store.publish_update(update),
            Transport::Socket(store) => store.publish_update(update),
            Transport::Relay(store) => store.publish_update(update),
        }
    }

    fn on_document_update(&self, callback: UpdateCallback) {
        match self {
            Transport::InProcess(store) => store.on_document_update(callback),
            Transport::Socket(store) => store.on_document_update(callback),
            Transport::Relay(store) => store.on_document_update(callback),
        }
    }

    fn local_client_id(&self) -> Uuid {
        match self {
            Transport::InProcess(store) => store.local_client_id(),
            Transport::Socket(store) => store.local_client_id(),
            Transport::Relay(store) => store.local_client_id(),
        }
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registered callbacks of one store.
///
/// Callbacks are cloned out before they run, so a callback may call back
/// into its own store.
#[derive(Default)]
pub(crate) struct Listeners {
    awareness: Mutex<Vec<AwarenessCallback>>,
    updates: Mutex<Vec<UpdateCallback>>,
}

impl Listeners {
    pub(crate) fn add_awareness(&self, callback: AwarenessCallback) {
        lock(&self.awareness).push(callback);
    }

    pub(crate) fn add_update(&self, callback: UpdateCallback) {
        lock(&self.updates).push(callback);
    }

    pub(crate) fn emit_awareness(&self, records: &[AwarenessRecord]) {
        let callbacks = lock(&self.awareness).clone();
        for callback in callbacks {
            callback(records);
        }
    }

    pub(crate) fn emit_update(&self, update: &[u8]) {
        let callbacks = lock(&self.updates).clone();
        for callback in callbacks {
            callback(update);
        }
    }
}

/// Last known awareness record of every remote client.
#[derive(Debug, Default)]
pub(crate) struct RemoteAwareness {
    records: BTreeMap<Uuid, AwarenessRecord>,
    /// When each client was last heard from
    seen: HashMap<Uuid, Instant>,
}

impl RemoteAwareness {
    /// Returns whether the snapshot changed.
    pub(crate) fn upsert(&mut self, record: AwarenessRecord) -> bool {
        self.upsert_at(record, Instant::now())
    }

    pub(crate) fn upsert_at(&mut self, record: AwarenessRecord, now: Instant) -> bool {
        self.seen.insert(record.client_id, now);
        match self.records.get(&record.client_id) {
            Some(existing) if *existing == record => false,
            _ => {
                self.records.insert(record.client_id, record);
                true
            }
        }
    }

    pub(crate) fn remove(&mut self, client_id: &Uuid) -> bool {
        self.seen.remove(client_id);
        self.records.remove(client_id).is_some()
    }

    /// Swap in a complete set of records. Returns whether the snapshot
    /// changed.
    pub(crate) fn replace(&mut self, records: Vec<AwarenessRecord>) -> bool {
        let now = Instant::now();
        let next: BTreeMap<Uuid, AwarenessRecord> = records.into_iter().map(|r| (r.client_id, r)).collect();
        self.seen = next.keys().map(|id| (*id, now)).collect();
        let changed = next != self.records;
        self.records = next;
        changed
    }

    /// Drop clients not heard from within `ttl` of `now`. Returns whether
    /// anything was dropped.
    pub(crate) fn evict_idle(&mut self, now: Instant, ttl: Duration) -> bool {
        let idle: Vec<Uuid> = self
            .seen
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            if self.remove(id) {
                log::info!("Dropping awareness of {} (silent for over {:?})", id, ttl);
            }
        }
        !idle.is_empty()
    }

    /// Drop everything. Returns whether anything was known.
    pub(crate) fn clear(&mut self) -> bool {
        let had_any = !self.records.is_empty();
        self.records.clear();
        self.seen.clear();
        had_any
    }

    pub(crate) fn snapshot(&self) -> Vec<AwarenessRecord> {
        self.records.values().cloned().collect()
    }
}
