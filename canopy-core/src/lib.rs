//! # canopy-core
//!
//! Scene graph state for collaborative editing.
//!
//! The tree lives inside a replicated document ([`document::YrsDocument`]);
//! [`scene::SceneState`] is the only thing that mutates it, which keeps key
//! uniqueness and contiguous sibling `zIndex` values intact on every peer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod document;
pub mod observer;
pub mod scene;

pub use document::{DocumentError, ReplicatedDocument, YrsDocument};
pub use observer::{ListenerId, Observers, SharedObservers};
pub use scene::{find, find_by_type, NodeLocation, SceneEvent, SceneState};

/// Key used for the root container when none is given.
pub const ROOT_KEY: &str = "root";

/// One editable element of the scene.
///
/// A node is a container iff `children` is `Some`, even when the list is
/// empty.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SceneNode {
    pub key: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<SceneNode>>,
    #[serde(rename = "zIndex", default)]
    pub z_index: i64,
}

impl SceneNode {
    pub fn leaf(key: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            node_type: node_type.into(),
            props: Map::new(),
            children: None,
            z_index: 0,
        }
    }

    pub fn container(key: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            children: Some(Vec::new()),
            ..Self::leaf(key, node_type)
        }
    }

    pub fn with_prop(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(name.into(), value.into());
        self
    }

    /// Append a child, turning the node into a container if needed.
    pub fn with_child(mut self, child: SceneNode) -> Self {
        self.children.get_or_insert_with(Vec::new).push(child);
        self
    }

    pub fn is_container(&self) -> bool {
        self.children.is_some()
    }

    /// Children in sibling order. Empty for leaves.
    pub fn children(&self) -> &[SceneNode] {
        self.children.as_deref().unwrap_or(&[])
    }

    /// Keys of this node and its whole subtree, preorder.
    pub fn subtree_keys(&self) -> Vec<String> {
        let mut keys = vec![self.key.clone()];
        for child in self.children() {
            keys.extend(child.subtree_keys());
        }
        keys
    }
}

/// Where [`SceneState::move_node`] puts a node among its siblings.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovePosition {
    /// One step towards the end (drawn later).
    Up,
    /// One step towards the start.
    Down,
    /// Last among siblings.
    Front,
    /// First among siblings.
    Back,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_json_shape() {
        let node = SceneNode::container("frame", "group")
            .with_prop("name", "Frame 1")
            .with_child(SceneNode::leaf("r1", "rect"));

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["type"], "group");
        assert_eq!(value["zIndex"], 0);
        assert_eq!(value["props"]["name"], "Frame 1");
        assert_eq!(value["children"][0]["key"], "r1");
        assert!(value["children"][0].get("children").is_none());
    }

    #[test]
    fn test_node_from_json_defaults() {
        let node: SceneNode = serde_json::from_value(json!({"key": "a", "type": "text"})).unwrap();
        assert!(!node.is_container());
        assert!(node.props.is_empty());
        assert_eq!(node.children(), &[] as &[SceneNode]);
    }

    #[test]
    fn test_subtree_keys() {
        let node = SceneNode::container("g", "group")
            .with_child(SceneNode::leaf("a", "rect"))
            .with_child(SceneNode::container("h", "group").with_child(SceneNode::leaf("b", "rect")));
        assert_eq!(node.subtree_keys(), vec!["g", "a", "h", "b"]);
    }

    #[test]
    fn test_move_position_serde() {
        assert_eq!(serde_json::to_value(MovePosition::Front).unwrap(), json!("FRONT"));
    }
}
