//! Advisory mutex over scene node ids, replicated through awareness.
//!
//! Every peer keeps two views of the same set of locks:
//!
//! ```text
//! user_locks: peer id ──► UserMutexLock { user, nodeIds, operation, metadata }
//! node_locks: node id ──► NodeLock      { user, operation, metadata }
//! ```
//!
//! A node id is in `node_locks` iff it belongs to exactly one entry of
//! `user_locks`, and a peer holds at most one lock at a time.
//!
//! Local locks are published under the `userMutexLock` awareness field.
//! Remote ones are replayed locally with `broadcast = false`, so nothing
//! is ever echoed back. Each peer decides against its own last-seen
//! snapshot, which makes exclusion eventual: two peers whose lock
//! broadcasts cross in flight can both believe they won.
//!
//! The coordinator does no I/O. Publishes it wants are queued and picked
//! up with [`MutexCoordinator::take_broadcasts`] by whoever owns the
//! transport, after it has let go of the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use canopy_core::{ListenerId, Observers};
use serde_json::Value;

use crate::awareness::{AwarenessRecord, UserIdentity, UserMutexLock};
use crate::presence::RosterEvent;

/// Visual feedback for locked nodes, supplied by the rendering layer.
pub trait NodeVisuals: Send + Sync {
    fn lock_visually(&self, node_id: &str, user: &UserIdentity);
    fn release_visually(&self, node_id: &str);
}

/// [`NodeVisuals`] for headless sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVisuals;

impl NodeVisuals for NoopVisuals {
    fn lock_visually(&self, _node_id: &str, _user: &UserIdentity) {}
    fn release_visually(&self, _node_id: &str) {}
}

/// Node view of a lock.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLock {
    pub user: UserIdentity,
    pub operation: String,
    pub metadata: Option<Value>,
}

/// Awareness change requested by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum LockBroadcast {
    Publish(UserMutexLock),
    Clear,
}

impl LockBroadcast {
    /// Value for the `userMutexLock` field; `None` clears it.
    pub fn field_value(&self) -> Option<Value> {
        match self {
            LockBroadcast::Publish(lock) => serde_json::to_value(lock).ok(),
            LockBroadcast::Clear => None,
        }
    }
}

/// Lock set changes, local or replicated.
#[derive(Debug, Clone, PartialEq)]
pub enum LockEvent {
    Acquired {
        user: UserIdentity,
        node_ids: Vec<String>,
        operation: String,
    },
    Released {
        user: UserIdentity,
        node_ids: Vec<String>,
    },
}

pub struct MutexCoordinator {
    local: UserIdentity,
    user_locks: HashMap<String, UserMutexLock>,
    node_locks: HashMap<String, NodeLock>,
    visuals: Arc<dyn NodeVisuals>,
    outbox: Vec<LockBroadcast>,
    observers: Observers<LockEvent>,
}

impl MutexCoordinator {
    pub fn new(local: UserIdentity, visuals: Arc<dyn NodeVisuals>) -> Self {
        Self {
            local,
            user_locks: HashMap::new(),
            node_locks: HashMap::new(),
            visuals,
            outbox: Vec::new(),
            observers: Observers::new(),
        }
    }

    pub fn local_user(&self) -> &UserIdentity {
        &self.local
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&LockEvent) + Send + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Lock `node_ids` for the local peer and publish the lock.
    pub fn try_lock<S: AsRef<str>>(&mut self, node_ids: &[S], operation: &str, metadata: Option<Value>) -> bool {
        let local = self.local.clone();
        self.try_lock_as(&local, node_ids, operation, metadata, true)
    }

    /// Lock `node_ids` on behalf of `acting`.
    ///
    /// Fails if `acting` already holds a lock. Otherwise nodes are locked
    /// one by one in the given order, stopping at the first one that is
    /// already taken; on a partial acquisition every node taken so far is
    /// rolled back and `false` is returned.
    ///
    /// Ids are taken as given: a repeated id runs into its own provisional
    /// lock and fails the request, and an empty set is granted.
    pub fn try_lock_as<S: AsRef<str>>(
        &mut self,
        acting: &UserIdentity,
        node_ids: &[S],
        operation: &str,
        metadata: Option<Value>,
        broadcast: bool,
    ) -> bool {
        if self.user_locks.contains_key(&acting.id) {
            log::debug!("Lock refused: {} already holds a lock", acting.id);
            return false;
        }

        let requested: Vec<String> = node_ids.iter().map(|id| id.as_ref().to_string()).collect();

        let mut provisional = Vec::with_capacity(requested.len());
        for node_id in &requested {
            if let Some(holder) = self.node_locks.get(node_id) {
                log::debug!(
                    "Lock conflict on '{}': held by {} for '{}'",
                    node_id,
                    holder.user.id,
                    holder.operation
                );
                break;
            }
            self.node_locks.insert(
                node_id.clone(),
                NodeLock {
                    user: acting.clone(),
                    operation: operation.to_string(),
                    metadata: metadata.clone(),
                },
            );
            self.visuals.lock_visually(node_id, acting);
            provisional.push(node_id.clone());
        }

        if provisional.len() == requested.len() && !self.user_locks.contains_key(&acting.id) {
            let lock = UserMutexLock {
                user: acting.clone(),
                node_ids: requested.clone(),
                operation: operation.to_string(),
                metadata,
            };
            self.user_locks.insert(acting.id.clone(), lock.clone());
            if broadcast {
                self.outbox.push(LockBroadcast::Publish(lock));
            }
            log::debug!("{} locked {:?} for '{}'", acting.id, requested, operation);
            self.observers.notify(&LockEvent::Acquired {
                user: acting.clone(),
                node_ids: requested,
                operation: operation.to_string(),
            });
            return true;
        }

        for node_id in &provisional {
            self.node_locks.remove(node_id);
            self.visuals.release_visually(node_id);
        }
        false
    }

    /// Release the local peer's lock and clear the published field.
    pub fn release(&mut self) -> bool {
        let id = self.local.id.clone();
        self.release_as(&id, true)
    }

    /// Release whatever `peer_id` holds. Returns false when it held nothing.
    pub fn release_as(&mut self, peer_id: &str, broadcast: bool) -> bool {
        let Some(lock) = self.user_locks.remove(peer_id) else {
            return false;
        };
        for node_id in &lock.node_ids {
            let owned = self
                .node_locks
                .get(node_id)
                .is_some_and(|n| n.user.id == peer_id);
            if owned {
                self.node_locks.remove(node_id);
                self.visuals.release_visually(node_id);
            }
        }
        if broadcast {
            self.outbox.push(LockBroadcast::Clear);
        }
        log::debug!("{} released {:?}", peer_id, lock.node_ids);
        self.observers.notify(&LockEvent::Released {
            user: lock.user,
            node_ids: lock.node_ids,
        });
        true
    }

    /// Mirror remote locks from a full awareness snapshot.
    ///
    /// Published locks are replayed, changed ones are released and taken
    /// again, cleared fields release, and peers that vanished from the
    /// snapshot lose whatever they held.
    pub fn sync_remote(&mut self, records: &[AwarenessRecord]) {
        let mut present: HashMap<String, (UserIdentity, Option<UserMutexLock>)> = HashMap::new();
        for record in records {
            let Some(user) = record.user() else {
                continue;
            };
            if user.id == self.local.id {
                continue;
            }
            let lock = record.mutex_lock();
            // Another client of the same user may carry the lock.
            match present.get_mut(&user.id) {
                Some((_, existing)) if existing.is_none() => *existing = lock,
                Some(_) => {}
                None => {
                    present.insert(user.id.clone(), (user, lock));
                }
            }
        }

        let vanished: Vec<String> = self
            .user_locks
            .keys()
            .filter(|id| **id != self.local.id && !present.contains_key(*id))
            .cloned()
            .collect();
        for peer_id in vanished {
            log::info!("Releasing lock abandoned by {}", peer_id);
            self.release_as(&peer_id, false);
        }

        for (peer_id, (user, published)) in present {
            let replicated = self.user_locks.get(&peer_id).cloned();
            match (published, replicated) {
                (Some(published), Some(replicated)) => {
                    if !same_lock(&published, &replicated) {
                        self.release_as(&peer_id, false);
                        self.replay(&user, &published);
                    }
                }
                (Some(published), None) => self.replay(&user, &published),
                (None, Some(_)) => {
                    self.release_as(&peer_id, false);
                }
                (None, None) => {}
            }
        }
    }

    fn replay(&mut self, user: &UserIdentity, lock: &UserMutexLock) {
        let acquired = self.try_lock_as(user, lock.node_ids.as_slice(), &lock.operation, lock.metadata.clone(), false);
        if !acquired {
            log::debug!(
                "Remote lock of {} on {:?} overlaps a local view; retrying on next snapshot",
                user.id,
                lock.node_ids
            );
        }
    }

    /// Drop locks of peers that left the roster.
    pub fn on_roster_change(&mut self, event: &RosterEvent) {
        for user in &event.removed {
            if user.id != self.local.id && self.release_as(&user.id, false) {
                log::info!("Released lock of departed peer {}", user.id);
            }
        }
    }

    /// Awareness changes queued since the last call.
    pub fn take_broadcasts(&mut self) -> Vec<LockBroadcast> {
        std::mem::take(&mut self.outbox)
    }

    pub fn user_lock(&self, peer_id: &str) -> Option<&UserMutexLock> {
        self.user_locks.get(peer_id)
    }

    pub fn node_lock(&self, node_id: &str) -> Option<&NodeLock> {
        self.node_locks.get(node_id)
    }

    pub fn is_locked(&self, node_id: &str) -> bool {
        self.node_locks.contains_key(node_id)
    }

    /// Locked node ids, sorted.
    pub fn locked_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.node_locks.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// The local peer's current lock, if any.
    pub fn held(&self) -> Option<&UserMutexLock> {
        self.user_locks.get(&self.local.id)
    }
}

fn same_lock(a: &UserMutexLock, b: &UserMutexLock) -> bool {
    a.operation == b.operation && a.metadata == b.metadata && a.node_ids == b.node_ids
}
