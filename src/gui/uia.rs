//! Accessibility-tree extraction with stable child keys
//!
//! Converts a backend walk into the addressable recursive structure returned
//! by `get_window_uia_structure`. Child keys combine control type, automation
//! id (or a sanitized name prefix), and sibling index, so two walks of an
//! unchanged UI produce identical trees and any node can be named by path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::gui::backend::{RawUiaNode, Rect};

/// Marker stored on nodes cut off by the depth bound
pub const MAX_DEPTH_MARKER: &str = "max depth reached";

/// Length cap applied to sanitized name fragments in child keys
const KEY_NAME_LEN: usize = 30;

/// One node of the extracted accessibility tree
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UiaNode {
    pub control_type: String,
    pub name: String,
    pub automation_id: String,
    pub class_name: String,
    pub is_enabled: bool,
    pub is_visible: bool,
    pub is_keyboard_focusable: bool,
    pub rectangle: Rect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub texts: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, UiaNode>,
    /// Set when the subtree was unreadable or the depth bound was hit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A flattened, path-addressed element surfaced for scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementCandidate {
    pub path: String,
    pub control_type: String,
    pub name: String,
    pub automation_id: String,
    pub rect: Rect,
    pub is_enabled: bool,
    pub is_keyboard_focusable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Builds the addressable tree from a raw backend walk
///
/// The depth bound is strict: a node sitting at `max_depth` is emitted with
/// its properties, the depth marker, and no children.
#[must_use]
pub fn build_tree(raw: &RawUiaNode, max_depth: usize) -> UiaNode {
    build_node(raw, 0, max_depth)
}

fn build_node(raw: &RawUiaNode, depth: usize, max_depth: usize) -> UiaNode {
    let mut node = UiaNode {
        control_type: raw.control_type.clone(),
        name: raw.name.clone(),
        automation_id: raw.automation_id.clone(),
        class_name: raw.class_name.clone(),
        is_enabled: raw.is_enabled,
        is_visible: raw.is_visible,
        is_keyboard_focusable: raw.is_keyboard_focusable,
        rectangle: raw.rect,
        value: raw.value.clone(),
        texts: raw.texts.clone(),
        children: BTreeMap::new(),
        error: raw.error.clone(),
    };

    if node.error.is_some() {
        return node;
    }
    if depth >= max_depth {
        node.error = Some(MAX_DEPTH_MARKER.to_string());
        return node;
    }

    for (index, child) in raw.children.iter().enumerate() {
        let key = child_key(child, index);
        node.children
            .insert(key, build_node(child, depth + 1, max_depth));
    }
    node
}

/// Derives the stable key for a child at `index`
#[must_use]
pub fn child_key(child: &RawUiaNode, index: usize) -> String {
    let control_type = if child.control_type.is_empty() {
        "Unknown"
    } else {
        &child.control_type
    };
    if !child.automation_id.is_empty() {
        format!("{control_type}_{}_{index}", child.automation_id)
    } else if !child.name.is_empty() {
        format!("{control_type}_{}_{index}", sanitize_name(&child.name))
    } else {
        format!("{control_type}_{index}")
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .take(KEY_NAME_LEN)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Flattens the tree into path-addressed candidates for element scoring
///
/// Paths are `/`-joined child keys from the root.
#[must_use]
pub fn collect_candidates(tree: &UiaNode) -> Vec<ElementCandidate> {
    let mut out = Vec::new();
    collect_into(tree, "", &mut out);
    out
}

fn collect_into(node: &UiaNode, path: &str, out: &mut Vec<ElementCandidate>) {
    if !path.is_empty() {
        out.push(ElementCandidate {
            path: path.to_string(),
            control_type: node.control_type.clone(),
            name: node.name.clone(),
            automation_id: node.automation_id.clone(),
            rect: node.rectangle,
            is_enabled: node.is_enabled,
            is_keyboard_focusable: node.is_keyboard_focusable,
            value: node.value.clone(),
        });
    }
    for (key, child) in &node.children {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}/{key}")
        };
        collect_into(child, &child_path, out);
    }
}

/// Resolves a `/`-separated path to a node, if present
#[must_use]
pub fn resolve_path<'a>(tree: &'a UiaNode, path: &str) -> Option<&'a UiaNode> {
    let mut node = tree;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        node = node.children.get(segment)?;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(control_type: &str, name: &str, automation_id: &str) -> RawUiaNode {
        RawUiaNode {
            control_type: control_type.to_string(),
            name: name.to_string(),
            automation_id: automation_id.to_string(),
            is_enabled: true,
            is_visible: true,
            ..RawUiaNode::default()
        }
    }

    fn sample_tree() -> RawUiaNode {
        let mut root = leaf("Window", "Cursor", "");
        let mut pane = leaf("Pane", "", "");
        pane.children.push(leaf("Edit", "Chat Input", "chat-box"));
        pane.children.push(leaf("Button", "Send", ""));
        root.children.push(pane);
        root.children.push(leaf("Document", "editor", ""));
        root
    }

    #[test]
    fn keys_prefer_automation_id_then_name_then_index() {
        assert_eq!(child_key(&leaf("Edit", "Chat", "chat-box"), 0), "Edit_chat-box_0");
        assert_eq!(child_key(&leaf("Button", "Send Now", ""), 1), "Button_Send_Now_1");
        assert_eq!(child_key(&leaf("Pane", "", ""), 2), "Pane_2");
    }

    #[test]
    fn sanitized_names_are_capped_and_alphanumeric() {
        let long = "a".repeat(50) + "!@#";
        let key = child_key(&leaf("Text", &long, ""), 0);
        assert_eq!(key, format!("Text_{}_0", "a".repeat(30)));
    }

    #[test]
    fn two_walks_of_the_same_tree_are_identical() {
        let raw = sample_tree();
        let first = build_tree(&raw, 15);
        let second = build_tree(&raw, 15);
        assert_eq!(first, second);
    }

    #[test]
    fn depth_zero_yields_single_marked_node() {
        let raw = sample_tree();
        let tree = build_tree(&raw, 0);
        assert!(tree.children.is_empty());
        assert_eq!(tree.error.as_deref(), Some(MAX_DEPTH_MARKER));
        assert_eq!(tree.control_type, "Window");
    }

    #[test]
    fn depth_bound_is_strict() {
        let raw = sample_tree();
        let tree = build_tree(&raw, 1);
        // Depth-1 children exist but are marked and childless
        let pane = tree.children.values().next().unwrap();
        assert_eq!(pane.error.as_deref(), Some(MAX_DEPTH_MARKER));
        assert!(pane.children.is_empty());
        assert!(tree.error.is_none());
    }

    #[test]
    fn unreadable_subtree_keeps_siblings() {
        let mut raw = sample_tree();
        raw.children[0].error = Some("access denied".to_string());
        let tree = build_tree(&raw, 15);
        assert_eq!(tree.children.len(), 2);
        let broken = tree.children.get("Pane_0").unwrap();
        assert_eq!(broken.error.as_deref(), Some("access denied"));
        assert!(broken.children.is_empty());
        let healthy = tree.children.get("Document_editor_1").unwrap();
        assert!(healthy.error.is_none());
    }

    #[test]
    fn candidates_are_path_addressed_and_resolvable() {
        let raw = sample_tree();
        let tree = build_tree(&raw, 15);
        let candidates = collect_candidates(&tree);
        let edit = candidates
            .iter()
            .find(|c| c.control_type == "Edit")
            .unwrap();
        assert_eq!(edit.path, "Pane_0/Edit_chat-box_0");
        let resolved = resolve_path(&tree, &edit.path).unwrap();
        assert_eq!(resolved.name, "Chat Input");
    }
}
