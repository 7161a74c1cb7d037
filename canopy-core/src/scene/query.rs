//! Read-only lookups over a materialized tree.

use crate::SceneNode;

/// Result of [`find`]. Every field is `None` when the key is absent.
///
/// The root has a node but no parent and no index.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeLocation<'a> {
    pub node: Option<&'a SceneNode>,
    pub parent: Option<&'a SceneNode>,
    pub index: Option<usize>,
}

impl NodeLocation<'_> {
    pub fn is_found(&self) -> bool {
        self.node.is_some()
    }
}

/// Depth-first search for `key`. Never panics, including on an empty tree.
pub fn find<'a>(tree: Option<&'a SceneNode>, key: &str) -> NodeLocation<'a> {
    let Some(root) = tree else {
        return NodeLocation::default();
    };
    if root.key == key {
        return NodeLocation {
            node: Some(root),
            parent: None,
            index: None,
        };
    }
    find_in(root, key).unwrap_or_default()
}

fn find_in<'a>(parent: &'a SceneNode, key: &str) -> Option<NodeLocation<'a>> {
    for (index, child) in parent.children().iter().enumerate() {
        if child.key == key {
            return Some(NodeLocation {
                node: Some(child),
                parent: Some(parent),
                index: Some(index),
            });
        }
        if let Some(found) = find_in(child, key) {
            return Some(found);
        }
    }
    None
}

/// Every node whose type is `node_type`, in depth-first order.
pub fn find_by_type<'a>(tree: Option<&'a SceneNode>, node_type: &str) -> Vec<&'a SceneNode> {
    let mut out = Vec::new();
    if let Some(root) = tree {
        collect(root, node_type, &mut out);
    }
    out
}

fn collect<'a>(node: &'a SceneNode, node_type: &str, out: &mut Vec<&'a SceneNode>) {
    if node.node_type == node_type {
        out.push(node);
    }
    for child in node.children() {
        collect(child, node_type, out);
    }
}
