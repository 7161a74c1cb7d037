//! # canopy-collab: collaboration layer for canopy scenes
//!
//! Keeps every peer's scene tree consistent and tells peers about each
//! other: who is here, where they point, and which nodes they have locked.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   SessionStore    ┌──────────────────────┐
//! │ CollabSession │ ◄───────────────► │ InProcessHub         │
//! │  SceneState   │   awareness +     │ SocketStore ─► SyncServer
//! │  Presence     │   doc updates     │ RelayStore ──► SyncBridge
//! │  Mutex        │                   └──────────────────────┘
//! └───────────────┘
//!                                    SyncServer ◄─ SyncBridge ─► SyncServer
//!                                        │                         │
//!                                  SnapshotStore             SnapshotStore
//! ```
//!
//! ## Modules
//!
//! - [`awareness`]: per-client ephemeral record and its well-known fields
//! - [`presence`]: roster of remote peers with deterministic colours
//! - [`mutex`]: advisory node locks negotiated through awareness
//! - [`store`]: the session store contract and its transports
//! - [`session`]: one user's scene, presence and locks wired together
//! - [`protocol`]: binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: rooms and their fan-out
//! - [`server`]: WebSocket relay server
//! - [`bridge`]: pub/sub bridge between server processes
//! - [`snapshot`]: room snapshot persistence

pub mod awareness;
pub mod bridge;
pub mod broadcast;
pub mod mutex;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod store;

// Re-exports for convenience
pub use awareness::{
    AwarenessRecord, Pointer, UserIdentity, UserMutexLock, MUTEX_LOCK_FIELD, POINTER_FIELD,
    SELECTION_FIELD, USER_FIELD,
};
pub use bridge::{BridgeConfig, BridgeError, BridgeStatus, PubSubConnectionState, SyncBridge};
pub use broadcast::{BroadcastGroup, BroadcastStats, Room, RoomManager};
pub use mutex::{LockBroadcast, LockEvent, MutexCoordinator, NodeLock, NodeVisuals, NoopVisuals};
pub use presence::{CursorColor, PeerInfo, PresenceTracker, RosterEvent};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{AcquireError, CollabSession};
pub use snapshot::{
    MemorySnapshotStore, RocksSnapshotStore, SnapshotError, SnapshotMetadata, SnapshotStore,
    StoreConfig,
};
pub use store::{
    ConnectionState, InProcessHub, InProcessStore, OfflineQueue, RelayStore, SessionStore,
    SocketStore, StoreError, Transport,
};
