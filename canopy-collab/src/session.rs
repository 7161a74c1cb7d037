//! One collaborative editing session.
//!
//! ```text
//!                 ┌──────────── CollabSession ────────────┐
//!  awareness ───► │ PresenceTracker ──roster──► Mutex     │
//!  snapshots      │        └──────────sync_remote──► Coord│──► userMutexLock
//!                 │                                       │
//!  doc updates ─► │ SceneState ──Committed──► pending ────│──► publish_update
//!                 └───────────────────────────────────────┘
//! ```
//!
//! Components sit behind their own mutexes and are never held at the same
//! time by awareness handling. Anything destined for the transport is
//! queued while a component is locked and flushed after it has been let
//! go. Scene, roster and lock events take the same route: components only
//! queue them, and session listeners run once no component is locked, so
//! a listener may call back into the session.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use canopy_core::{ListenerId, SceneEvent, SceneNode, SceneState, SharedObservers, YrsDocument};
use serde_json::json;
use thiserror::Error;

use crate::awareness::{AwarenessRecord, UserIdentity, UserMutexLock, MUTEX_LOCK_FIELD, POINTER_FIELD, SELECTION_FIELD, USER_FIELD};
use crate::mutex::{LockEvent, MutexCoordinator, NodeLock, NodeVisuals};
use crate::presence::{PeerInfo, PresenceTracker, RosterEvent};
use crate::store::{lock, SessionStore, StoreError, Transport};

/// Why [`CollabSession::acquire`] did not run its action.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AcquireError {
    #[error("Nodes {node_ids:?} are not available for '{operation}'")]
    Conflict { node_ids: Vec<String>, operation: String },
    #[error("Action did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

#[derive(Debug, Clone)]
enum SessionEvent {
    Scene(SceneEvent),
    Roster(RosterEvent),
    Lock(LockEvent),
}

#[derive(Default)]
struct EventQueue {
    pending: VecDeque<SessionEvent>,
    draining: bool,
}

/// Session listeners and the events waiting for them.
#[derive(Default)]
struct Notifier {
    queue: Mutex<EventQueue>,
    scene: Mutex<SharedObservers<SceneEvent>>,
    roster: Mutex<SharedObservers<RosterEvent>>,
    locks: Mutex<SharedObservers<LockEvent>>,
}

/// Lets a later dispatch run if a listener panics.
struct Draining<'a>(&'a Mutex<EventQueue>);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(self.0).draining = false;
        }
    }
}

impl Notifier {
    fn push(&self, event: SessionEvent) {
        lock(&self.queue).pending.push_back(event);
    }

    /// Deliver queued events in order. A call made from inside a listener
    /// returns at once; the outer call delivers whatever it queued.
    fn dispatch(&self) {
        {
            let mut queue = lock(&self.queue);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        let _draining = Draining(&self.queue);
        loop {
            let event = {
                let mut queue = lock(&self.queue);
                match queue.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            match &event {
                SessionEvent::Scene(e) => {
                    let listeners = lock(&self.scene).listeners();
                    listeners.iter().for_each(|l| l(e));
                }
                SessionEvent::Roster(e) => {
                    let listeners = lock(&self.roster).listeners();
                    listeners.iter().for_each(|l| l(e));
                }
                SessionEvent::Lock(e) => {
                    let listeners = lock(&self.locks).listeners();
                    listeners.iter().for_each(|l| l(e));
                }
            }
        }
    }
}

pub struct CollabSession {
    user: UserIdentity,
    transport: Arc<Transport>,
    scene: Arc<Mutex<SceneState<YrsDocument>>>,
    presence: Arc<Mutex<PresenceTracker>>,
    mutex: Arc<Mutex<MutexCoordinator>>,
    pending_updates: Arc<Mutex<Vec<Vec<u8>>>>,
    notifier: Arc<Notifier>,
}

impl CollabSession {
    /// Wire a session for `user` over `transport`. Nothing is sent until
    /// [`CollabSession::connect`].
    pub fn new(user: UserIdentity, transport: impl Into<Transport>, visuals: Arc<dyn NodeVisuals>) -> Self {
        let transport = Arc::new(transport.into());
        let scene = Arc::new(Mutex::new(SceneState::new(YrsDocument::new())));
        let presence = Arc::new(Mutex::new(PresenceTracker::new(user.id.clone())));
        let mutex = Arc::new(Mutex::new(MutexCoordinator::new(user.clone(), visuals)));
        let pending_updates: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let notifier = Arc::new(Notifier::default());

        {
            let pending = pending_updates.clone();
            let notifier = notifier.clone();
            lock(&scene).subscribe(move |event| {
                if let SceneEvent::Committed { update } = event {
                    lock(&pending).push(update.clone());
                }
                notifier.push(SessionEvent::Scene(event.clone()));
            });
        }
        {
            let notifier = notifier.clone();
            lock(&mutex).subscribe(move |event| notifier.push(SessionEvent::Lock(event.clone())));
        }
        {
            let presence = presence.clone();
            let mutex = mutex.clone();
            let notifier = notifier.clone();
            transport.on_awareness_change(Arc::new(move |records: &[AwarenessRecord]| {
                let roster = lock(&presence).apply(records);
                if let Some(event) = &roster {
                    notifier.push(SessionEvent::Roster(event.clone()));
                }
                {
                    let mut mutex = lock(&mutex);
                    if let Some(event) = &roster {
                        mutex.on_roster_change(event);
                    }
                    mutex.sync_remote(records);
                }
                notifier.dispatch();
            }));
        }
        {
            let scene = scene.clone();
            let notifier = notifier.clone();
            transport.on_document_update(Arc::new(move |update: &[u8]| {
                let merged = lock(&scene).apply_remote_update(update);
                if let Err(e) = merged {
                    log::warn!("Dropping remote update: {}", e);
                }
                notifier.dispatch();
            }));
        }

        log::debug!("Session for {} over {} transport", user.id, transport.kind());
        Self {
            user,
            transport,
            scene,
            presence,
            mutex,
            pending_updates,
            notifier,
        }
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Announce the user and start exchanging state.
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.transport
            .set_awareness_info(USER_FIELD, serde_json::to_value(&self.user).ok());
        self.flush();
        self.transport.connect().await?;
        log::info!("{} connected", self.user.id);
        Ok(())
    }

    /// Release any held lock, then leave.
    pub async fn disconnect(&self) -> Result<(), StoreError> {
        self.release();
        self.flush();
        self.transport.disconnect().await
    }

    /// Run structural edits against the scene; commits go out afterwards.
    pub fn edit<R>(&self, f: impl FnOnce(&mut SceneState<YrsDocument>) -> R) -> R {
        let result = f(&mut lock(&self.scene));
        self.flush();
        result
    }

    /// Read-only access to the scene.
    pub fn scene(&self) -> MutexGuard<'_, SceneState<YrsDocument>> {
        lock(&self.scene)
    }

    pub fn tree(&self) -> Option<SceneNode> {
        lock(&self.scene).tree()
    }

    /// Listen to commits and remote merges. Listeners run after the scene
    /// is unlocked and may use the session.
    pub fn on_scene_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SceneEvent) + Send + Sync + 'static,
    {
        lock(&self.notifier.scene).subscribe(listener)
    }

    // ─── Locks ────────────────────────────────────────────────────────

    pub fn try_lock<S: AsRef<str>>(&self, node_ids: &[S], operation: &str, metadata: Option<serde_json::Value>) -> bool {
        let acquired = lock(&self.mutex).try_lock(node_ids, operation, metadata);
        self.flush();
        acquired
    }

    pub fn release(&self) -> bool {
        let released = lock(&self.mutex).release();
        self.flush();
        released
    }

    /// Lock `node_ids`, run `action`, release.
    ///
    /// The lock is released however the action ends, including a panic or
    /// the returned future being dropped.
    pub async fn acquire<S, F, Fut, T>(&self, node_ids: &[S], operation: &str, action: F) -> Result<T, AcquireError>
    where
        S: AsRef<str>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock_guard(node_ids, operation)?;
        Ok(action().await)
    }

    /// Like [`CollabSession::acquire`], giving up on the action after
    /// `deadline`.
    pub async fn acquire_with_deadline<S, F, Fut, T>(
        &self,
        node_ids: &[S],
        operation: &str,
        deadline: Duration,
        action: F,
    ) -> Result<T, AcquireError>
    where
        S: AsRef<str>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock_guard(node_ids, operation)?;
        tokio::time::timeout(deadline, action())
            .await
            .map_err(|_| AcquireError::DeadlineExceeded(deadline))
    }

    fn lock_guard<S: AsRef<str>>(&self, node_ids: &[S], operation: &str) -> Result<LockGuard<'_>, AcquireError> {
        if !self.try_lock(node_ids, operation, None) {
            return Err(AcquireError::Conflict {
                node_ids: node_ids.iter().map(|id| id.as_ref().to_string()).collect(),
                operation: operation.to_string(),
            });
        }
        Ok(LockGuard { session: self })
    }

    pub fn on_lock_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LockEvent) + Send + Sync + 'static,
    {
        lock(&self.notifier.locks).subscribe(listener)
    }

    pub fn is_locked(&self, node_id: &str) -> bool {
        lock(&self.mutex).is_locked(node_id)
    }

    pub fn node_lock(&self, node_id: &str) -> Option<NodeLock> {
        lock(&self.mutex).node_lock(node_id).cloned()
    }

    pub fn user_lock(&self, peer_id: &str) -> Option<UserMutexLock> {
        lock(&self.mutex).user_lock(peer_id).cloned()
    }

    pub fn locked_nodes(&self) -> Vec<String> {
        lock(&self.mutex).locked_nodes()
    }

    /// The lock this session holds, if any.
    pub fn held(&self) -> Option<UserMutexLock> {
        lock(&self.mutex).held().cloned()
    }

    // ─── Presence ─────────────────────────────────────────────────────

    pub fn set_pointer(&self, x: f64, y: f64) {
        self.transport.set_awareness_info(POINTER_FIELD, Some(json!({"x": x, "y": y})));
    }

    pub fn clear_pointer(&self) {
        self.transport.set_awareness_info(POINTER_FIELD, None);
    }

    pub fn set_selection<S: AsRef<str>>(&self, node_ids: &[S]) {
        let ids: Vec<&str> = node_ids.iter().map(|id| id.as_ref()).collect();
        let value = if ids.is_empty() { None } else { Some(json!(ids)) };
        self.transport.set_awareness_info(SELECTION_FIELD, value);
    }

    pub fn roster(&self) -> Vec<PeerInfo> {
        lock(&self.presence).roster().values().cloned().collect()
    }

    pub fn peer(&self, user_id: &str) -> Option<PeerInfo> {
        lock(&self.presence).peer(user_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.presence).peer_count()
    }

    pub fn on_roster_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RosterEvent) + Send + Sync + 'static,
    {
        lock(&self.notifier.roster).subscribe(listener)
    }

    /// Send queued lock publishes and scene commits, then run listeners
    /// for whatever happened meanwhile.
    pub fn flush(&self) {
        let broadcasts = lock(&self.mutex).take_broadcasts();
        for broadcast in broadcasts {
            self.transport.set_awareness_info(MUTEX_LOCK_FIELD, broadcast.field_value());
        }
        let updates = std::mem::take(&mut *lock(&self.pending_updates));
        for update in updates {
            self.transport.publish_update(update);
        }
        self.notifier.dispatch();
    }
}

/// Releases the session's lock when dropped.
struct LockGuard<'a> {
    session: &'a CollabSession,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.session.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::NoopVisuals;
    use crate::store::InProcessHub;
    use canopy_core::MovePosition;

    fn session(hub: &InProcessHub, id: &str) -> CollabSession {
        CollabSession::new(UserIdentity::new(id, id.to_uppercase(), ""), hub.store(), Arc::new(NoopVisuals))
    }

    #[tokio::test]
    async fn test_edits_reach_other_sessions() {
        let hub = InProcessHub::new();
        let a = session(&hub, "a");
        let b = session(&hub, "b");
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        a.edit(|scene| {
            scene.initialize(SceneNode::container("main", "frame"), true);
            scene.add(SceneNode::leaf("c0", "rect"), "main", None, true);
            scene.add(SceneNode::leaf("c1", "rect"), "main", None, true);
        });
        b.edit(|scene| scene.move_node("c0", MovePosition::Front, true));

        assert_eq!(a.tree(), b.tree());
        let keys: Vec<String> = a.tree().unwrap().children().iter().map(|c| c.key.clone()).collect();
        assert_eq!(keys, vec!["c1", "c0"]);
    }

    #[tokio::test]
    async fn test_edits_before_connect_are_delivered() {
        let hub = InProcessHub::new();
        let a = session(&hub, "a");
        a.edit(|scene| scene.initialize(SceneNode::container("main", "frame"), true));
        a.connect().await.unwrap();

        let b = session(&hub, "b");
        b.connect().await.unwrap();
        assert_eq!(b.tree().unwrap().key, "main");
    }

    #[tokio::test]
    async fn test_roster_follows_connections() {
        let hub = InProcessHub::new();
        let a = session(&hub, "a");
        let b = session(&hub, "b");
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        assert_eq!(a.peer_count(), 1);
        assert_eq!(b.roster()[0].user.id, "a");

        b.set_pointer(3.0, 4.0);
        assert_eq!(a.peer("b").unwrap().pointer.map(|p| (p.x, p.y)), Some((3.0, 4.0)));

        b.disconnect().await.unwrap();
        assert_eq!(a.peer_count(), 0);
        // Our own view is empty once we leave.
        assert_eq!(b.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_releases_after_action() {
        let hub = InProcessHub::new();
        let a = session(&hub, "a");
        let b = session(&hub, "b");
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let seen_by_b = a
            .acquire(&["n1"], "move", || async { b.is_locked("n1") })
            .await
            .unwrap();
        assert!(seen_by_b);
        assert!(!a.is_locked("n1"));
        assert!(!b.is_locked("n1"));
    }

    #[tokio::test]
    async fn test_acquire_conflict_is_error() {
        let hub = InProcessHub::new();
        let a = session(&hub, "a");
        let b = session(&hub, "b");
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        assert!(a.try_lock(&["n1"], "move", None));
        let result = b.acquire(&["n1", "n2"], "resize", || async { 1 }).await;
        assert_eq!(
            result,
            Err(AcquireError::Conflict {
                node_ids: vec!["n1".into(), "n2".into()],
                operation: "resize".into(),
            })
        );
        assert!(!b.is_locked("n2"));
    }

    #[tokio::test]
    async fn test_deadline_releases_lock() {
        let hub = InProcessHub::new();
        let a = session(&hub, "a");
        a.connect().await.unwrap();

        let result = a
            .acquire_with_deadline(&["n1"], "move", Duration::from_millis(20), || {
                std::future::pending::<()>()
            })
            .await;
        assert_eq!(result, Err(AcquireError::DeadlineExceeded(Duration::from_millis(20))));
        assert!(a.held().is_none());
    }

    #[tokio::test]
    async fn test_dropped_acquire_releases_lock() {
        let hub = InProcessHub::new();
        let a = session(&hub, "a");
        a.connect().await.unwrap();

        {
            let pending = a.acquire(&["n1"], "move", || std::future::pending::<()>());
            let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;
        }
        assert!(!a.is_locked("n1"));
    }

    #[tokio::test]
    async fn test_disconnect_releases_held_lock() {
        let hub = InProcessHub::new();
        let a = session(&hub, "a");
        let b = session(&hub, "b");
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        assert!(a.try_lock(&["n1"], "move", None));
        assert!(b.is_locked("n1"));

        a.disconnect().await.unwrap();
        assert!(!b.is_locked("n1"));
        assert!(a.held().is_none());
    }

    #[tokio::test]
    async fn test_listeners_can_query_the_session() {
        let hub = InProcessHub::new();
        let a = Arc::new(session(&hub, "a"));
        let b = session(&hub, "b");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (weak, sink) = (Arc::downgrade(&a), seen.clone());
        a.on_roster_change(move |event| {
            if let Some(a) = weak.upgrade() {
                sink.lock().unwrap().push(format!("roster +{} peers={}", event.added.len(), a.peer_count()));
            }
        });
        let (weak, sink) = (Arc::downgrade(&a), seen.clone());
        a.on_lock_event(move |event| {
            if let (Some(a), LockEvent::Acquired { node_ids, .. }) = (weak.upgrade(), event) {
                sink.lock().unwrap().push(format!("lock {} held={}", node_ids[0], a.is_locked(&node_ids[0])));
            }
        });
        let (weak, sink) = (Arc::downgrade(&a), seen.clone());
        a.on_scene_event(move |event| {
            if let (Some(a), SceneEvent::RemoteApplied) = (weak.upgrade(), event) {
                // The empty state on join counts as a merge too.
                if let Some(root) = a.tree() {
                    sink.lock().unwrap().push(format!("scene root={}", root.key));
                }
            }
        });

        a.connect().await.unwrap();
        b.connect().await.unwrap();
        assert!(b.try_lock(&["n1"], "move", None));
        b.edit(|scene| scene.initialize(SceneNode::container("main", "frame"), true));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "roster +1 peers=1".to_string(),
                "lock n1 held=true".to_string(),
                "scene root=main".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_listener_may_lock_from_inside_a_notification() {
        let hub = InProcessHub::new();
        let a = Arc::new(session(&hub, "a"));
        let b = session(&hub, "b");
        a.connect().await.unwrap();

        let weak = Arc::downgrade(&a);
        a.on_roster_change(move |event| {
            if let Some(a) = weak.upgrade() {
                if !event.added.is_empty() {
                    assert!(a.try_lock(&["n1"], "move", None));
                }
            }
        });
        b.connect().await.unwrap();

        assert!(a.held().is_some());
        assert_eq!(holder(&b, "n1"), Some("a".to_string()));
        assert!(!b.try_lock(&["n1"], "move", None));
    }

    fn holder(session: &CollabSession, node_id: &str) -> Option<String> {
        session.node_lock(node_id).map(|lock| lock.user.id)
    }
}
