//! Navigation query rows to nodes

use anyhow::{anyhow, Context};
use rusqlite::types::ValueRef;
use rusqlite::Row;
use serde_json::Value;

use crate::models::{ChildNodeSpecification, ChildrenHint, NavNode, NodeKey, NodeKind};

use super::builder::QueryBranch;
use super::grouping::GroupingHandler;

/// Maps rows of one [`NavigationQuery`](super::NavigationQuery) into nodes
pub struct NodeReader<'a> {
    pub specification: &'a ChildNodeSpecification,
    pub branches: &'a [QueryBranch],
    pub ruleset_id: &'a str,

    /// Similar-ancestor budget for instance nodes of the specification
    pub allowed_similar_ancestors: usize,
}

impl NodeReader<'_> {
    pub fn read(&self, row: &Row<'_>) -> anyhow::Result<NavNode> {
        let node_type: String = row.get(0).context("Failed to get node type")?;
        let class_name: Option<String> = row.get(1).context("Failed to get class name")?;
        let label: Option<String> = row.get(2).context("Failed to get label")?;
        let grouping_value = value_from_sql(row.get_ref(3).context("Failed to get grouping value")?);
        let grouped_count: i64 = row.get(4).context("Failed to get grouped count")?;
        let instance_keys: String = row.get(5).context("Failed to get instance keys")?;
        let branch_index: i64 = row.get(6).context("Failed to get branch index")?;

        let kind = NodeKind::parse(&node_type).ok_or_else(|| anyhow!("Unknown node type '{}'", node_type))?;
        let instance_keys: Vec<String> =
            serde_json::from_str(&instance_keys).context("Failed to parse instance keys")?;
        let branch = self
            .branches
            .get(branch_index as usize)
            .ok_or_else(|| anyhow!("Row refers to missing branch {}", branch_index))?;

        let key = NodeKey::new(
            kind,
            self.specification.id.as_str(),
            class_name,
            if kind.is_grouping() { Some(grouping_value) } else { None },
            instance_keys,
        );
        let mut node = NavNode::new(key, label.unwrap_or_default());
        node.supports_filtering = true;
        node.extended.ruleset_id = self.ruleset_id.to_string();
        node.extended.grouped_count = Some(grouped_count.max(0) as usize);

        if kind.is_grouping() {
            self.apply_grouping(&mut node, branch);
        } else {
            self.apply_instance(&mut node);
        }
        Ok(node)
    }

    fn apply_instance(&self, node: &mut NavNode) {
        let spec = self.specification;
        node.extended.hide_in_hierarchy = spec.hide_nodes_in_hierarchy;
        node.extended.hide_if_no_children = spec.hide_if_no_children;
        node.extended.hide_expression = spec.hide_expression.clone();
        node.extended.children_hint = spec.has_children;
        node.extended.allowed_similar_ancestors = self.allowed_similar_ancestors;
    }

    fn apply_grouping(&self, node: &mut NavNode, branch: &QueryBranch) {
        node.extended.grouping_level = branch.handler_index;
        node.extended.children_hint = ChildrenHint::Always;
        match &branch.handler {
            Some(GroupingHandler::BaseClass {
                create_group_for_single_item,
                ..
            }) => {
                node.extended.hide_if_only_one_child = !create_group_for_single_item;
            }
            Some(GroupingHandler::Property {
                property,
                create_group_for_single_item,
                create_group_for_unspecified_values,
                image_id,
                ..
            }) => {
                node.extended.property_name = Some(property.clone());
                node.extended.hide_if_only_one_child = !create_group_for_single_item;
                node.extended.hide_if_grouping_value_not_specified = !create_group_for_unspecified_values;
                node.image_id = image_id.clone();
            }
            _ => {}
        }
    }
}

fn value_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}
