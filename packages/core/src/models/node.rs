//! Navigation Node Data Structures
//!
//! This module defines [`NavNode`], one row of a materialized hierarchy, and
//! its identity key [`NodeKey`].
//!
//! # Architecture
//!
//! - **Identity key**: kind, specification id, grouping value and instance keys,
//!   hashed with SHA-256 into a stable hex digest
//! - **Parent-independent hash**: the parent path is kept next to the hash but
//!   never feeds into it, so the same instance reached through a cycle hashes
//!   identically
//! - **Extended data**: hide flags, children hint and grouping details that
//!   travel with the node into the cache
//!
//! # Examples
//!
//! ```rust
//! use hierarchy_core::models::{NavNode, NodeKey, NodeKind};
//!
//! let key = NodeKey::instance("widgets", "Widget", vec!["w-1".to_string()]);
//! let node = NavNode::new(key, "Widget One");
//! assert!(!node.is_grouping());
//! assert_eq!(node.key.hash.len(), 64);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::rules::ChildrenHint;

/// What a node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// One or more instances sharing a single row
    Instance,
    ClassGrouping,
    LabelGrouping,
    PropertyGrouping,
    RelationshipGrouping,
    Custom,
}

impl NodeKind {
    /// Tag used in generated SQL and in the cache's NodeKeys table
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Instance => "instance",
            NodeKind::ClassGrouping => "class-grouping",
            NodeKind::LabelGrouping => "label-grouping",
            NodeKind::PropertyGrouping => "property-grouping",
            NodeKind::RelationshipGrouping => "relationship-grouping",
            NodeKind::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "instance" => Some(NodeKind::Instance),
            "class-grouping" => Some(NodeKind::ClassGrouping),
            "label-grouping" => Some(NodeKind::LabelGrouping),
            "property-grouping" => Some(NodeKind::PropertyGrouping),
            "relationship-grouping" => Some(NodeKind::RelationshipGrouping),
            "custom" => Some(NodeKind::Custom),
            _ => None,
        }
    }

    pub fn is_grouping(&self) -> bool {
        matches!(
            self,
            NodeKind::ClassGrouping
                | NodeKind::LabelGrouping
                | NodeKind::PropertyGrouping
                | NodeKind::RelationshipGrouping
        )
    }
}

/// Tri-state children flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HasChildren {
    #[default]
    Unknown,
    Yes,
    No,
}

impl HasChildren {
    pub fn is_determined(&self) -> bool {
        !matches!(self, HasChildren::Unknown)
    }

    pub fn from_bool(value: bool) -> Self {
        if value {
            HasChildren::Yes
        } else {
            HasChildren::No
        }
    }
}

/// Identity of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeKey {
    pub kind: NodeKind,

    /// Identifier of the specification that produced the node
    pub specification_id: String,

    /// Class of the instance, the grouped class, or the custom node type
    pub class_name: Option<String>,

    /// Grouped label / property value / range key for grouping nodes
    pub grouping_value: Option<Value>,

    /// Ids of the instances the node stands for, sorted
    pub instance_keys: Vec<String>,

    /// SHA-256 hex digest over kind, specification, class and grouping value
    /// (plus instance keys for non-grouping nodes)
    pub hash: String,

    /// Hashes of the ancestors from the root down to and including this node
    #[serde(default)]
    pub path_from_root: Vec<String>,
}

impl NodeKey {
    /// Build a key and compute its hash
    pub fn new(
        kind: NodeKind,
        specification_id: impl Into<String>,
        class_name: Option<String>,
        grouping_value: Option<Value>,
        mut instance_keys: Vec<String>,
    ) -> Self {
        instance_keys.sort();
        instance_keys.dedup();
        let mut key = Self {
            kind,
            specification_id: specification_id.into(),
            class_name,
            grouping_value,
            instance_keys,
            hash: String::new(),
            path_from_root: Vec::new(),
        };
        key.hash = key.compute_hash();
        key
    }

    pub fn instance(specification_id: impl Into<String>, class_name: &str, instance_keys: Vec<String>) -> Self {
        Self::new(
            NodeKind::Instance,
            specification_id,
            Some(class_name.to_string()),
            None,
            instance_keys,
        )
    }

    pub fn custom(specification_id: impl Into<String>, node_type: &str) -> Self {
        Self::new(
            NodeKind::Custom,
            specification_id,
            Some(node_type.to_string()),
            None,
            Vec::new(),
        )
    }

    /// Replace the instance keys (after a merge) and refresh the hash
    pub fn set_instance_keys(&mut self, mut keys: Vec<String>) {
        keys.sort();
        keys.dedup();
        self.instance_keys = keys;
        self.hash = self.compute_hash();
        if let Some(last) = self.path_from_root.last_mut() {
            *last = self.hash.clone();
        }
    }

    /// Anchor the key under its parent's path
    pub fn set_parent_path(&mut self, parent_path: &[String]) {
        self.path_from_root = parent_path.to_vec();
        self.path_from_root.push(self.hash.clone());
    }

    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.specification_id.as_bytes());
        hasher.update([0u8]);
        if let Some(class_name) = &self.class_name {
            hasher.update(class_name.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(value) = &self.grouping_value {
            hasher.update(value.to_string().as_bytes());
        }
        if !self.kind.is_grouping() {
            for key in &self.instance_keys {
                hasher.update([0u8]);
                hasher.update(key.as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Metadata carried alongside a node through caching and finalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeExtendedData {
    pub ruleset_id: String,

    /// Virtual ancestors between the node and its displayed parent, nearest first
    pub virtual_parent_ids: Vec<Uuid>,

    pub hide_in_hierarchy: bool,
    pub hide_if_no_children: bool,
    pub hide_if_only_one_child: bool,
    pub hide_if_grouping_value_not_specified: bool,
    pub hide_expression: Option<String>,
    pub children_hint: ChildrenHint,

    /// How many similar ancestors are tolerated before the branch is cut
    pub allowed_similar_ancestors: usize,

    /// Position of the grouping handler that produced a grouping node
    pub grouping_level: Option<usize>,

    /// Property name for property-grouping nodes
    pub property_name: Option<String>,

    /// Number of instances behind a grouping node
    pub grouped_count: Option<usize>,

    /// Instance nodes flagged for the post-process same-label merge
    pub merge_same_label: bool,

    pub is_customized: bool,

    /// Values captured by artifact rules
    pub artifacts: BTreeMap<String, Value>,

    /// Values produced by extended-data customization rules
    pub extra: BTreeMap<String, Value>,
}

/// One row of a materialized hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavNode {
    /// Assigned when the node is first cached
    pub id: Uuid,

    /// Displayed parent; `None` for root nodes
    pub parent_id: Option<Uuid>,

    pub key: NodeKey,
    pub label: String,
    pub description: Option<String>,
    pub image_id: Option<String>,
    pub has_children: HasChildren,
    pub supports_filtering: bool,
    pub extended: NodeExtendedData,
}

impl NavNode {
    pub fn new(key: NodeKey, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::nil(),
            parent_id: None,
            key,
            label: label.into(),
            description: None,
            image_id: None,
            has_children: HasChildren::Unknown,
            supports_filtering: false,
            extended: NodeExtendedData::default(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.key.kind
    }

    pub fn is_grouping(&self) -> bool {
        self.key.kind.is_grouping()
    }

    pub fn instance_keys(&self) -> &[String] {
        &self.key.instance_keys
    }

    pub fn specification_id(&self) -> &str {
        &self.key.specification_id
    }

    /// Whether a property-grouping node groups null or empty values
    pub fn has_unspecified_grouping_value(&self) -> bool {
        if self.key.kind != NodeKind::PropertyGrouping {
            return false;
        }
        match &self.key.grouping_value {
            None | Some(Value::Null) => true,
            Some(Value::String(value)) => value.is_empty(),
            Some(_) => false,
        }
    }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
