//! Scene State Engine.
//!
//! Tree operations over a [`ReplicatedDocument`]. The tree is stored flat so
//! that concurrent edits from different peers merge per node:
//!
//! ```text
//! map "scene"            root -> "root"
//! map "nodes"            "root" -> {type, props, zIndex, container: true}
//!                        "r1"   -> {type, props, zIndex, container: false}
//! array "children:root"  ["r1", "g1", ...]
//! ```
//!
//! Structural misuse (missing parent, duplicate key, unknown node) is
//! logged with `warn!` and leaves the document untouched. The `commit`
//! flag only controls whether a [`SceneEvent::Committed`] signal is emitted;
//! it is not a transaction and nothing is rolled back.

mod query;

use std::collections::HashSet;

use serde_json::{json, Map, Value};

use crate::document::{DocumentError, ReplicatedDocument};
use crate::observer::{ListenerId, Observers};
use crate::{MovePosition, SceneNode};

pub use query::{find, find_by_type, NodeLocation};

const NODES: &str = "nodes";
const SCENE: &str = "scene";
const ROOT_FIELD: &str = "root";

fn children_array(key: &str) -> String {
    format!("children:{key}")
}

/// Signals emitted after mutations.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    /// Local edits were committed. `update` holds everything changed since
    /// the previous commit, ready to be sent to other peers.
    Committed { update: Vec<u8> },
    /// A remote update was merged; the tree needs a redraw.
    RemoteApplied,
}

pub struct SceneState<D: ReplicatedDocument> {
    doc: D,
    observers: Observers<SceneEvent>,
    /// State vector at the last commit.
    committed_state: Vec<u8>,
    /// Local edits made with `commit = false` since the last commit.
    dirty: bool,
}

impl<D: ReplicatedDocument> SceneState<D> {
    pub fn new(doc: D) -> Self {
        let committed_state = doc.state_vector();
        Self {
            doc,
            observers: Observers::new(),
            committed_state,
            dirty: false,
        }
    }

    pub fn document(&self) -> &D {
        &self.doc
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&SceneEvent) + Send + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Seed an empty document with `root`. Warns and does nothing if a root
    /// already exists.
    pub fn initialize(&mut self, root: SceneNode, commit: bool) -> bool {
        if let Some(existing) = self.root_key() {
            log::warn!("Scene already initialized with root '{}'", existing);
            return false;
        }
        if let Some(dup) = first_duplicate(&root) {
            log::warn!("Cannot initialize scene: key '{}' appears twice", dup);
            return false;
        }
        let mut root = root;
        root.z_index = 0;
        let key = root.key.clone();
        self.write_subtree(&root);
        self.doc.set_map(SCENE, ROOT_FIELD, Value::String(key.clone()));
        log::debug!("Scene initialized with root '{}'", key);
        self.finish(commit);
        true
    }

    pub fn root_key(&self) -> Option<String> {
        match self.doc.get_map(SCENE, ROOT_FIELD) {
            Some(Value::String(key)) => Some(key),
            _ => None,
        }
    }

    /// Materialize the current tree. `None` when the scene is empty.
    pub fn tree(&self) -> Option<SceneNode> {
        let root = self.root_key()?;
        let mut visited = HashSet::new();
        self.materialize(&root, &mut visited)
    }

    /// Insert `node` (with its subtree) under `parent_key`.
    ///
    /// With `index`, the node is inserted there (clamped to the sibling
    /// count) and all siblings are re-indexed. Without, it is appended with
    /// `zIndex` equal to the previous sibling count.
    pub fn add(&mut self, node: SceneNode, parent_key: &str, index: Option<usize>, commit: bool) -> bool {
        let Some(tree) = self.tree() else {
            log::warn!("Cannot add '{}': scene is empty", node.key);
            return false;
        };
        if let Some(dup) = first_duplicate(&node) {
            log::warn!("Cannot add '{}': key '{}' appears twice in the new subtree", node.key, dup);
            return false;
        }
        if let Some(existing) = node
            .subtree_keys()
            .into_iter()
            .find(|k| find(Some(&tree), k).is_found())
        {
            log::warn!("Cannot add '{}': key '{}' already exists", node.key, existing);
            return false;
        }
        let parent = find(Some(&tree), parent_key);
        let Some(parent_node) = parent.node else {
            log::warn!("Cannot add '{}': parent '{}' not found", node.key, parent_key);
            return false;
        };
        if !parent_node.is_container() {
            log::warn!("Cannot add '{}': parent '{}' is not a container", node.key, parent_key);
            return false;
        }

        let array = children_array(parent_key);
        let sibling_count = self.doc.get_array(&array).len();
        let key = node.key.clone();
        let mut node = node;

        match index {
            Some(index) => {
                let at = index.min(sibling_count);
                self.write_subtree(&node);
                self.doc.insert_array(&array, at as u32, vec![Value::String(key.clone())]);
                self.reindex(parent_key);
            }
            None => {
                node.z_index = sibling_count as i64;
                self.write_subtree(&node);
                self.doc.insert_array(&array, sibling_count as u32, vec![Value::String(key.clone())]);
            }
        }
        log::trace!("Added '{}' under '{}'", key, parent_key);
        self.finish(commit);
        true
    }

    /// Shallow-merge `patch.props` into the stored node. Props missing from
    /// the patch are kept.
    pub fn update(&mut self, patch: &SceneNode, commit: bool) -> bool {
        let Some(mut record) = self.record(&patch.key) else {
            log::warn!("Cannot update '{}': node not found", patch.key);
            return false;
        };
        let mut props = match record.remove("props") {
            Some(Value::Object(props)) => props,
            _ => Map::new(),
        };
        for (name, value) in &patch.props {
            props.insert(name.clone(), value.clone());
        }
        record.insert("props".into(), Value::Object(props));
        self.doc.set_map(NODES, &patch.key, Value::Object(record));
        self.finish(commit);
        true
    }

    /// Remove `key` and its subtree. Remaining siblings are re-indexed.
    pub fn remove(&mut self, key: &str, commit: bool) -> bool {
        if !self.remove_one(key) {
            return false;
        }
        self.finish(commit);
        true
    }

    /// Remove several nodes, emitting at most one commit signal for all of
    /// them. Returns how many were removed.
    pub fn remove_batch<I, K>(&mut self, keys: I, commit: bool) -> usize
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let removed = keys
            .into_iter()
            .filter(|key| self.remove_one(key.as_ref()))
            .count();
        if removed > 0 {
            self.finish(commit);
        }
        removed
    }

    /// Reorder `key` among its siblings. UP at the end and DOWN at the
    /// start clamp, leaving the order unchanged.
    pub fn move_node(&mut self, key: &str, position: MovePosition, commit: bool) -> bool {
        let Some(parent_key) = self.parent_of(key, "move") else {
            return false;
        };
        let array = children_array(&parent_key);
        let siblings = self.doc.get_array(&array);
        let Some(index) = siblings.iter().position(|v| v.as_str() == Some(key)) else {
            log::warn!("Cannot move '{}': not listed under '{}'", key, parent_key);
            return false;
        };
        // Length of the list once the node is taken out.
        let remaining = siblings.len() - 1;
        let target = match position {
            MovePosition::Up => (index + 1).min(remaining),
            MovePosition::Down => index.saturating_sub(1),
            MovePosition::Front => remaining,
            MovePosition::Back => 0,
        };
        if target != index {
            self.doc.delete_array(&array, index as u32, 1);
            self.doc.insert_array(&array, target as u32, vec![Value::String(key.to_string())]);
        }
        self.reindex(&parent_key);
        self.finish(commit);
        true
    }

    /// Emit one [`SceneEvent::Committed`] covering every change since the
    /// previous commit.
    pub fn commit(&mut self) {
        let update = match self.doc.encode_diff(&self.committed_state) {
            Ok(update) => update,
            Err(e) => {
                log::error!("Failed to encode commit diff, sending full state: {}", e);
                self.doc.encode_update()
            }
        };
        self.committed_state = self.doc.state_vector();
        self.dirty = false;
        self.observers.notify(&SceneEvent::Committed { update });
    }

    /// Merge an update received from another peer.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<(), DocumentError> {
        self.doc.apply_update(update)?;
        if !self.dirty {
            // Nothing local is pending, so the next commit need not carry
            // what the peer just sent us.
            self.committed_state = self.doc.state_vector();
        }
        self.observers.notify(&SceneEvent::RemoteApplied);
        Ok(())
    }

    /// The whole document as a single update, for peers joining late.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.encode_update()
    }

    fn finish(&mut self, commit: bool) {
        if commit {
            self.commit();
        } else {
            self.dirty = true;
        }
    }

    fn remove_one(&mut self, key: &str) -> bool {
        let Some(parent_key) = self.parent_of(key, "remove") else {
            return false;
        };
        let subtree = self
            .tree()
            .and_then(|tree| find(Some(&tree), key).node.map(SceneNode::subtree_keys))
            .unwrap_or_else(|| vec![key.to_string()]);

        let array = children_array(&parent_key);
        if let Some(index) = self
            .doc
            .get_array(&array)
            .iter()
            .position(|v| v.as_str() == Some(key))
        {
            self.doc.delete_array(&array, index as u32, 1);
        }
        for k in &subtree {
            self.doc.delete_map(NODES, k);
            let children = children_array(k);
            let len = self.doc.get_array(&children).len();
            if len > 0 {
                self.doc.delete_array(&children, 0, len as u32);
            }
        }
        self.reindex(&parent_key);
        log::trace!("Removed '{}' ({} nodes)", key, subtree.len());
        true
    }

    /// Parent key of `key`, warning on behalf of `action` when there is none.
    fn parent_of(&self, key: &str, action: &str) -> Option<String> {
        let tree = self.tree();
        let location = find(tree.as_ref(), key);
        if !location.is_found() {
            log::warn!("Cannot {} '{}': node not found", action, key);
            return None;
        }
        match location.parent {
            Some(parent) => Some(parent.key.clone()),
            None => {
                log::warn!("Cannot {} the root node '{}'", action, key);
                None
            }
        }
    }

    /// Reassign `zIndex` 0..n-1 to the children of `parent_key` in list order.
    fn reindex(&self, parent_key: &str) {
        let keys = self.doc.get_array(&children_array(parent_key));
        for (index, key) in keys.iter().filter_map(Value::as_str).enumerate() {
            let Some(mut record) = self.record(key) else {
                continue;
            };
            if record.get("zIndex").and_then(Value::as_i64) != Some(index as i64) {
                record.insert("zIndex".into(), Value::from(index as i64));
                self.doc.set_map(NODES, key, Value::Object(record));
            }
        }
    }

    fn record(&self, key: &str) -> Option<Map<String, Value>> {
        match self.doc.get_map(NODES, key) {
            Some(Value::Object(record)) => Some(record),
            _ => None,
        }
    }

    fn write_subtree(&self, node: &SceneNode) {
        let record = json!({
            "type": node.node_type,
            "props": node.props,
            "zIndex": node.z_index,
            "container": node.is_container(),
        });
        self.doc.set_map(NODES, &node.key, record);

        if let Some(children) = &node.children {
            let keys = children.iter().map(|c| Value::String(c.key.clone())).collect();
            self.doc.insert_array(&children_array(&node.key), 0, keys);
            for (index, child) in children.iter().enumerate() {
                let mut child = child.clone();
                child.z_index = index as i64;
                self.write_subtree(&child);
            }
        }
    }

    fn materialize(&self, key: &str, visited: &mut HashSet<String>) -> Option<SceneNode> {
        // Concurrent edits can list a key under two parents; first one wins.
        if !visited.insert(key.to_string()) {
            return None;
        }
        let record = self.record(key)?;
        let container = record.get("container").and_then(Value::as_bool).unwrap_or(false);
        let children = if container {
            let keys = self.doc.get_array(&children_array(key));
            Some(
                keys.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|child| self.materialize(child, visited))
                    .collect(),
            )
        } else {
            None
        };
        Some(SceneNode {
            key: key.to_string(),
            node_type: record
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            props: match record.get("props") {
                Some(Value::Object(props)) => props.clone(),
                _ => Map::new(),
            },
            children,
            z_index: record.get("zIndex").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

fn first_duplicate(node: &SceneNode) -> Option<String> {
    let mut seen = HashSet::new();
    node.subtree_keys().into_iter().find(|k| !seen.insert(k.clone()))
}
