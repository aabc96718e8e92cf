//! Resolved rule types
//!
//! These are the already-parsed rules a [`RulesLookup`](crate::lookup::RulesLookup)
//! hands to the engine. Conditions and value expressions stay as opaque strings
//! for the [`ExpressionEvaluator`](crate::lookup::ExpressionEvaluator).
//!
//! # Examples
//!
//! ```rust
//! use hierarchy_core::models::{ChildNodeSpecification, SpecificationKind};
//!
//! let json = r#"{
//!     "id": "widgets",
//!     "kind": { "type": "instancesOfSpecificClasses", "classes": ["Widget"] },
//!     "groupByClass": true,
//!     "groupByLabel": true
//! }"#;
//! let spec: ChildNodeSpecification = serde_json::from_str(json).unwrap();
//! assert!(matches!(spec.kind, SpecificationKind::InstancesOfSpecificClasses { .. }));
//! assert!(spec.group_by_class);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

fn default_true() -> bool {
    true
}

/// Static knowledge about whether nodes have children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChildrenHint {
    #[default]
    Unknown,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipDirection {
    #[default]
    Forward,
    Backward,
}

/// What a specification selects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SpecificationKind {
    /// Instances of every class in the schema
    AllInstances,

    #[serde(rename_all = "camelCase")]
    InstancesOfSpecificClasses {
        classes: Vec<String>,
        #[serde(default)]
        polymorphic: bool,
    },

    /// Instances related to the parent instance node
    #[serde(rename_all = "camelCase")]
    RelatedInstances {
        relationship: String,
        #[serde(default)]
        direction: RelationshipDirection,
        #[serde(default)]
        target_classes: Vec<String>,
    },

    /// A single node defined entirely by the rule
    #[serde(rename_all = "camelCase")]
    CustomNode {
        node_type: Option<String>,
        label: Option<String>,
        description: Option<String>,
        image_id: Option<String>,
    },
}

/// One child (or root) node specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildNodeSpecification {
    pub id: String,
    pub kind: SpecificationKind,
    #[serde(default)]
    pub group_by_class: bool,
    #[serde(default)]
    pub group_by_label: bool,

    /// Related-instances specifications only: group under the relationship
    #[serde(default)]
    pub group_by_relationship: bool,
    #[serde(default)]
    pub hide_nodes_in_hierarchy: bool,
    #[serde(default)]
    pub hide_if_no_children: bool,
    #[serde(default)]
    pub hide_expression: Option<String>,
    #[serde(default)]
    pub has_children: ChildrenHint,
    #[serde(default)]
    pub suppress_similar_ancestors_check: bool,
    #[serde(default)]
    pub do_not_sort: bool,
    #[serde(default)]
    pub priority: i32,

    /// Extra SQL predicate over the `this` instance alias
    #[serde(default)]
    pub instance_filter: Option<String>,
}

impl ChildNodeSpecification {
    pub fn new(id: impl Into<String>, kind: SpecificationKind) -> Self {
        Self {
            id: id.into(),
            kind,
            group_by_class: false,
            group_by_label: false,
            group_by_relationship: false,
            hide_nodes_in_hierarchy: false,
            hide_if_no_children: false,
            hide_expression: None,
            has_children: ChildrenHint::Unknown,
            suppress_similar_ancestors_check: false,
            do_not_sort: false,
            priority: 0,
            instance_filter: None,
        }
    }

    /// Stable digest of the whole specification
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(json.as_bytes()))
    }

    /// Whether any hide rule could shrink this specification's node count to zero
    pub fn may_hide_nodes(&self) -> bool {
        self.hide_nodes_in_hierarchy || self.hide_if_no_children || self.hide_expression.is_some()
    }
}

/// A group of specifications applied under a parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRule {
    #[serde(default)]
    pub priority: i32,

    /// Expression that must evaluate to true for the rule to apply
    #[serde(default)]
    pub condition: Option<String>,

    /// Child rules only: parent instance class (polymorphic match)
    #[serde(default)]
    pub parent_class: Option<String>,

    /// Child rules only: parent custom node type
    #[serde(default)]
    pub parent_node_type: Option<String>,

    pub specifications: Vec<ChildNodeSpecification>,
}

/// Grouping rule targeting a class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingRule {
    pub class: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub condition: Option<String>,
    pub groups: Vec<GroupSpecification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SameLabelStage {
    #[default]
    Query,
    PostProcess,
}

/// One grouping level inside a grouping rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GroupSpecification {
    /// Group by a base class (or by the rule's class when `base_class` is absent)
    #[serde(rename_all = "camelCase")]
    ClassGroup {
        #[serde(default)]
        base_class: Option<String>,
        #[serde(default)]
        create_group_for_single_item: bool,
    },

    #[serde(rename_all = "camelCase")]
    PropertyGroup {
        property: String,
        #[serde(default)]
        ranges: Vec<PropertyRange>,
        #[serde(default)]
        create_group_for_single_item: bool,
        #[serde(default = "default_true")]
        create_group_for_unspecified_values: bool,
        #[serde(default)]
        image_id: Option<String>,

        /// What instances are grouped by when no ranges are given
        #[serde(default)]
        property_grouping_value: PropertyGroupingValue,

        /// What the groups are ordered by
        #[serde(default)]
        sorting_value: PropertyGroupingValue,
    },

    #[serde(rename_all = "camelCase")]
    SameLabelInstanceGroup {
        #[serde(default)]
        application_stage: SameLabelStage,
    },
}

/// Property grouping key or sort key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyGroupingValue {
    /// The raw stored value
    PropertyValue,
    /// The value as displayed
    #[default]
    DisplayLabel,
}

/// Numeric range bucket for property grouping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRange {
    pub from: f64,
    pub to: f64,
    #[serde(default)]
    pub label: Option<String>,
}

impl PropertyRange {
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{} - {}", self.from, self.to))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortingRule {
    pub class: String,
    #[serde(default)]
    pub property: Option<String>,
    #[serde(default = "default_true")]
    pub ascending: bool,
    #[serde(default)]
    pub do_not_sort: bool,
    #[serde(default)]
    pub priority: i32,
}

/// What a customization rule changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CustomizationKind {
    #[serde(rename_all = "camelCase")]
    LabelOverride {
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ImageIdOverride { image_id: String },
    ExtendedData { items: BTreeMap<String, String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomizationRule {
    /// Instance class the rule applies to; `None` applies to every node
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub kind: CustomizationKind,
}

/// Values captured per row while a data source is read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRule {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    pub items: BTreeMap<String, String>,
}

/// A complete ruleset definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RulesetDefinition {
    pub id: String,
    pub root_rules: Vec<NodeRule>,
    pub child_rules: Vec<NodeRule>,
    pub grouping_rules: Vec<GroupingRule>,
    pub sorting_rules: Vec<SortingRule>,
    pub customization_rules: Vec<CustomizationRule>,
    pub artifact_rules: Vec<ArtifactRule>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_group_specification_defaults() {
        let group: GroupSpecification =
            serde_json::from_value(json!({ "type": "propertyGroup", "property": "Color" })).unwrap();
        match group {
            GroupSpecification::PropertyGroup {
                create_group_for_single_item,
                create_group_for_unspecified_values,
                ranges,
                property_grouping_value,
                sorting_value,
                ..
            } => {
                assert!(!create_group_for_single_item);
                assert!(create_group_for_unspecified_values);
                assert!(ranges.is_empty());
                assert_eq!(property_grouping_value, PropertyGroupingValue::DisplayLabel);
                assert_eq!(sorting_value, PropertyGroupingValue::DisplayLabel);
            }
            other => panic!("unexpected group {:?}", other),
        }
    }

    #[test]
    fn test_ruleset_definition_parses() {
        let definition: RulesetDefinition = serde_json::from_value(json!({
            "id": "demo",
            "rootRules": [{
                "specifications": [{
                    "id": "folders",
                    "kind": { "type": "customNode", "nodeType": "folder", "label": "Folders" }
                }]
            }],
            "sortingRules": [{ "class": "Widget", "doNotSort": true }]
        }))
        .unwrap();
        assert_eq!(definition.root_rules.len(), 1);
        assert!(definition.sorting_rules[0].ascending);
        assert!(definition.child_rules.is_empty());
    }

    #[test]
    fn test_specification_hash_changes_with_flags() {
        let spec = ChildNodeSpecification::new("s", SpecificationKind::AllInstances);
        let mut hidden = spec.clone();
        hidden.hide_if_no_children = true;
        assert_ne!(spec.hash(), hidden.hash());
        assert_eq!(spec.hash(), spec.clone().hash());
        assert!(hidden.may_hide_nodes());
        assert!(!spec.may_hide_nodes());
    }

    #[test]
    fn test_range_label() {
        let range = PropertyRange { from: 1.0, to: 5.0, label: None };
        assert_eq!(range.display_label(), "1 - 5");
    }
}
