//! Lock negotiation between sessions sharing an in-process hub.
//!
//! Every peer keeps its own view of who holds what; these tests check that
//! the views agree after each awareness exchange.

use std::sync::{Arc, Mutex};

use canopy_collab::mutex::{LockEvent, NodeVisuals};
use canopy_collab::{AcquireError, CollabSession, InProcessHub, UserIdentity};

/// Records visual lock state per node.
#[derive(Default)]
struct RecordingVisuals {
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingVisuals {
    fn last_for(&self, node_id: &str) -> Option<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(node, _)| node == node_id)
            .map(|(_, holder)| holder.clone())
    }
}

impl NodeVisuals for RecordingVisuals {
    fn lock_visually(&self, node_id: &str, user: &UserIdentity) {
        self.calls.lock().unwrap().push((node_id.to_string(), Some(user.id.clone())));
    }

    fn release_visually(&self, node_id: &str) {
        self.calls.lock().unwrap().push((node_id.to_string(), None));
    }
}

fn user(id: &str) -> UserIdentity {
    UserIdentity::new(id, id.to_uppercase(), format!("{id}@example.com"))
}

async fn connected(hub: &InProcessHub, id: &str) -> (CollabSession, Arc<RecordingVisuals>) {
    let visuals = Arc::new(RecordingVisuals::default());
    let session = CollabSession::new(user(id), hub.store(), visuals.clone());
    session.connect().await.unwrap();
    (session, visuals)
}

fn holder(session: &CollabSession, node_id: &str) -> Option<String> {
    session.node_lock(node_id).map(|lock| lock.user.id)
}

#[tokio::test]
async fn test_overlapping_lock_is_refused_atomically() {
    let hub = InProcessHub::new();
    let (a, _) = connected(&hub, "a").await;
    let (b, _) = connected(&hub, "b").await;

    assert!(a.try_lock(&["n1", "n2"], "move", None));
    assert!(!b.try_lock(&["n2", "n3"], "move", None));

    for view in [&a, &b] {
        assert!(!view.is_locked("n3"));
        assert_eq!(holder(view, "n1").as_deref(), Some("a"));
        assert_eq!(holder(view, "n2").as_deref(), Some("a"));
    }
    assert!(b.held().is_none());
}

#[tokio::test]
async fn test_retry_after_release_succeeds() {
    let hub = InProcessHub::new();
    let (a, _) = connected(&hub, "a").await;
    let (b, _) = connected(&hub, "b").await;

    assert!(a.try_lock(&["n1", "n2"], "move", None));
    assert!(!b.try_lock(&["n2", "n3"], "move", None));

    assert!(a.release());
    assert!(!b.is_locked("n1"));
    assert!(!b.is_locked("n2"));

    assert!(b.try_lock(&["n2", "n3"], "move", None));
    assert_eq!(holder(&a, "n2").as_deref(), Some("b"));
    assert_eq!(holder(&a, "n3").as_deref(), Some("b"));
    assert!(!a.is_locked("n1"));
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let hub = InProcessHub::new();
    let (a, _) = connected(&hub, "a").await;
    let (b, _) = connected(&hub, "b").await;

    assert!(a.try_lock(&["n1"], "move", None));
    assert!(a.release());
    assert!(!a.release());
    assert!(b.locked_nodes().is_empty());
}

#[tokio::test]
async fn test_disjoint_locks_coexist() {
    let hub = InProcessHub::new();
    let (a, _) = connected(&hub, "a").await;
    let (b, _) = connected(&hub, "b").await;

    assert!(a.try_lock(&["n1", "n2"], "move", None));
    assert!(b.try_lock(&["n3", "n4"], "resize", None));

    assert_eq!(a.locked_nodes(), vec!["n1", "n2", "n3", "n4"]);
    assert_eq!(b.locked_nodes(), vec!["n1", "n2", "n3", "n4"]);
    assert_eq!(a.user_lock("b").unwrap().operation, "resize");
}

#[tokio::test]
async fn test_vanished_peer_loses_its_lock() {
    let hub = InProcessHub::new();
    let (a, _) = connected(&hub, "a").await;
    let (b, b_visuals) = connected(&hub, "b").await;

    assert!(a.try_lock(&["n4"], "move", None));
    assert_eq!(b_visuals.last_for("n4"), Some(Some("a".to_string())));

    let released = Arc::new(Mutex::new(Vec::new()));
    let r = released.clone();
    b.on_lock_event(move |event| {
        if let LockEvent::Released { user, node_ids } = event {
            r.lock().unwrap().push((user.id.clone(), node_ids.clone()));
        }
    });

    a.transport().as_in_process().unwrap().drop_without_goodbye();

    assert!(!b.is_locked("n4"));
    assert_eq!(b_visuals.last_for("n4"), Some(None));
    assert_eq!(*released.lock().unwrap(), vec![("a".to_string(), vec!["n4".to_string()])]);
    assert_eq!(b.peer_count(), 0);
    assert!(b.try_lock(&["n4"], "move", None));
}

#[tokio::test]
async fn test_late_joiner_sees_existing_locks() {
    let hub = InProcessHub::new();
    let (a, _) = connected(&hub, "a").await;
    assert!(a.try_lock(&["n1"], "rotate", Some(serde_json::json!({"angle": 90}))));

    let (b, _) = connected(&hub, "b").await;
    let lock = b.node_lock("n1").unwrap();
    assert_eq!(lock.user.id, "a");
    assert_eq!(lock.operation, "rotate");
    assert_eq!(lock.metadata, Some(serde_json::json!({"angle": 90})));
    assert!(!b.try_lock(&["n1"], "move", None));
}

#[tokio::test]
async fn test_acquire_is_visible_while_running() {
    let hub = InProcessHub::new();
    let (a, _) = connected(&hub, "a").await;
    let (b, _) = connected(&hub, "b").await;

    let result = a
        .acquire(&["n1", "n2"], "move", || async {
            let refused = b.acquire(&["n2"], "move", || async {}).await;
            (b.is_locked("n1"), refused)
        })
        .await
        .unwrap();

    assert!(result.0);
    assert!(matches!(result.1, Err(AcquireError::Conflict { .. })));
    assert!(b.locked_nodes().is_empty());
}

#[tokio::test]
async fn test_lock_taken_inside_a_notification_reaches_everyone() {
    let hub = InProcessHub::new();
    let (a, _) = connected(&hub, "a").await;
    let b = Arc::new(CollabSession::new(user("b"), hub.store(), Arc::new(RecordingVisuals::default())));
    b.connect().await.unwrap();

    // B grabs n1 as soon as it learns about C, while C's join is still
    // being delivered to the others.
    let weak = Arc::downgrade(&b);
    b.on_roster_change(move |event| {
        if event.added.iter().any(|u| u.id == "c") {
            if let Some(b) = weak.upgrade() {
                b.try_lock(&["n1"], "move", None);
            }
        }
    });
    let (c, _) = connected(&hub, "c").await;

    assert_eq!(b.held().map(|lock| lock.node_ids), Some(vec!["n1".to_string()]));
    for view in [&a, &c] {
        assert_eq!(holder(view, "n1").as_deref(), Some("b"));
        assert!(!view.try_lock(&["n1"], "move", None));
    }
}

#[tokio::test]
async fn test_lock_listener_sees_settled_state() {
    let hub = InProcessHub::new();
    let (a, _) = connected(&hub, "a").await;
    let b = Arc::new(CollabSession::new(user("b"), hub.store(), Arc::new(RecordingVisuals::default())));
    b.connect().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (weak, sink) = (Arc::downgrade(&b), seen.clone());
    b.on_lock_event(move |event| {
        if let Some(b) = weak.upgrade() {
            let kind = match event {
                LockEvent::Acquired { .. } => "acquired",
                LockEvent::Released { .. } => "released",
            };
            sink.lock().unwrap().push((kind, b.locked_nodes(), b.peer_count()));
        }
    });

    assert!(a.try_lock(&["n1", "n2"], "move", None));
    assert!(a.release());

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("acquired", vec!["n1".to_string(), "n2".to_string()], 1),
            ("released", vec![], 1),
        ]
    );
}

#[test]
fn test_sessions_on_many_threads_agree() {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let hub = InProcessHub::new();
    let sessions: Vec<Arc<CollabSession>> = (0..4)
        .map(|i| {
            let session = CollabSession::new(user(&format!("p{i}")), hub.store(), Arc::new(RecordingVisuals::default()));
            rt.block_on(session.connect()).unwrap();
            Arc::new(session)
        })
        .collect();

    let handles: Vec<_> = sessions
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, session)| {
            std::thread::spawn(move || {
                let node = format!("n{i}");
                for _ in 0..25 {
                    assert!(session.try_lock(&[node.as_str()], "move", None));
                    assert!(session.release());
                }
                assert!(session.try_lock(&[node.as_str()], "move", None));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for view in &sessions {
        assert_eq!(view.locked_nodes(), vec!["n0", "n1", "n2", "n3"]);
        for i in 0..4 {
            assert_eq!(holder(view, &format!("n{i}")), Some(format!("p{i}")));
        }
    }
}
