//! Peer roster derived from awareness snapshots.
//!
//! ```text
//! awareness snapshot ──► PresenceTracker::apply ──► roster (peer id → PeerInfo)
//!                                   │
//!                                   └──► RosterEvent { added, removed }
//!                                        only when membership changed
//! ```
//!
//! Pointer and selection fields are refreshed on every snapshot but never
//! produce a roster event, so cursor churn stays quiet.

use std::collections::BTreeMap;

use canopy_core::{ListenerId, Observers};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::{AwarenessRecord, Pointer, UserIdentity};

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, visually distinct color for a peer id.
    ///
    /// HSL with fixed saturation and lightness; only the hue depends on the
    /// id, so every peer derives the same color for the same user.
    pub fn from_id(id: &str) -> Self {
        let hash = match Uuid::parse_str(id) {
            Ok(uuid) => uuid.as_u128(),
            Err(_) => u128::from(fnv1a(id.as_bytes())),
        };
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb` form for UI layers that want CSS colors.
    pub fn to_hex(&self) -> String {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", c(self.r), c(self.g), c(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// A remote peer as seen through awareness.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub user: UserIdentity,
    /// Client that announced this user most recently
    pub client_id: Uuid,
    pub color: CursorColor,
    pub pointer: Option<Pointer>,
    pub selection: Vec<String>,
}

/// Roster membership change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RosterEvent {
    pub added: Vec<UserIdentity>,
    pub removed: Vec<UserIdentity>,
}

impl RosterEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct PresenceTracker {
    local_id: String,
    roster: BTreeMap<String, PeerInfo>,
    observers: Observers<RosterEvent>,
}

impl PresenceTracker {
    /// `local_id` is the local user's id; it never enters the roster.
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            roster: BTreeMap::new(),
            observers: Observers::new(),
        }
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&RosterEvent) + Send + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Reconcile the roster with the full list of remote records.
    ///
    /// Returns the membership change, if any, after notifying listeners.
    pub fn apply(&mut self, records: &[AwarenessRecord]) -> Option<RosterEvent> {
        let mut present: BTreeMap<String, PeerInfo> = BTreeMap::new();
        for record in records {
            let Some(user) = record.user() else {
                continue;
            };
            if user.id == self.local_id || present.contains_key(&user.id) {
                continue;
            }
            let color = CursorColor::from_id(&user.id);
            present.insert(
                user.id.clone(),
                PeerInfo {
                    user,
                    client_id: record.client_id,
                    color,
                    pointer: record.pointer(),
                    selection: record.selection(),
                },
            );
        }

        let mut event = RosterEvent::default();
        for (id, peer) in &present {
            if !self.roster.contains_key(id) {
                event.added.push(peer.user.clone());
            }
        }
        for (id, peer) in &self.roster {
            if !present.contains_key(id) {
                event.removed.push(peer.user.clone());
            }
        }
        self.roster = present;

        if event.is_empty() {
            return None;
        }
        for user in &event.added {
            log::info!("Presence: {} ({}) joined", user.name, user.id);
        }
        for user in &event.removed {
            log::info!("Presence: {} ({}) left", user.name, user.id);
        }
        self.observers.notify(&event);
        Some(event)
    }

    pub fn roster(&self) -> &BTreeMap<String, PeerInfo> {
        &self.roster
    }

    pub fn peer(&self, id: &str) -> Option<&PeerInfo> {
        self.roster.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.roster.contains_key(id)
    }

    pub fn peer_count(&self) -> usize {
        self.roster.len()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{POINTER_FIELD, USER_FIELD};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn record(user_id: &str) -> AwarenessRecord {
        let mut r = AwarenessRecord::new(Uuid::new_v4());
        r.set_user(&UserIdentity::new(user_id, user_id.to_uppercase(), ""));
        r
    }

    #[test]
    fn test_color_stable_and_distinct() {
        let a1 = CursorColor::from_id("alice");
        let a2 = CursorColor::from_id("alice");
        let b = CursorColor::from_id("bob");
        assert_eq!(a1, a2);
        assert_ne!(a1.to_array(), b.to_array());
        for v in a1.to_array() {
            assert!((0.0..=1.0).contains(&v));
        }
        assert_eq!(a1.to_hex().len(), 7);
    }

    #[test]
    fn test_color_from_uuid_id() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(CursorColor::from_id(id), CursorColor::from_id(id));
    }

    #[test]
    fn test_add_and_remove_peers() {
        let mut tracker = PresenceTracker::new("me");
        let a = record("a");
        let b = record("b");

        let event = tracker.apply(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(event.added.len(), 2);
        assert!(event.removed.is_empty());
        assert_eq!(tracker.peer_count(), 2);

        let event = tracker.apply(&[b]).unwrap();
        assert_eq!(event.removed, vec![a.user().unwrap()]);
        assert!(!tracker.contains("a"));
    }

    #[test]
    fn test_pointer_churn_emits_nothing() {
        let mut tracker = PresenceTracker::new("me");
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        tracker.subscribe(move |_| *c.lock().unwrap() += 1);

        let mut a = record("a");
        tracker.apply(&[a.clone()]);
        for i in 0..5 {
            a.set(POINTER_FIELD, Some(json!({"x": i, "y": i})));
            assert!(tracker.apply(&[a.clone()]).is_none());
        }
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(tracker.peer("a").unwrap().pointer, Some(Pointer { x: 4.0, y: 4.0 }));
    }

    #[test]
    fn test_local_and_anonymous_records_ignored() {
        let mut tracker = PresenceTracker::new("me");
        let mut anonymous = AwarenessRecord::new(Uuid::new_v4());
        anonymous.set(USER_FIELD, Some(json!(42)));

        assert!(tracker.apply(&[record("me"), anonymous]).is_none());
        assert_eq!(tracker.peer_count(), 0);
    }

    #[test]
    fn test_same_user_on_two_clients_counts_once() {
        let mut tracker = PresenceTracker::new("me");
        let event = tracker.apply(&[record("a"), record("a")]).unwrap();
        assert_eq!(event.added.len(), 1);
        assert_eq!(tracker.peer_count(), 1);
    }
}
