//! Node finalization
//!
//! Before a node reaches a consumer it is finalized once:
//!
//! 1. **Children**: `has_children` is decided from the specification's hint,
//!    the similar-ancestor limit, or a bounded probe of the level below
//! 2. **Customization**: label, image and extended-data rules are applied
//!
//! The finalized node is written back to the cache, so a node is probed and
//! customized at most once.
//!
//! # Similar ancestors
//!
//! Recursive rulesets (an instance related to itself, directly or through a
//! cycle) would materialize an endless hierarchy. A node whose ancestry
//! already holds `max(allowed, 1)` nodes similar to it reports no children.
//! Two nodes are similar when their key hashes are equal; grouping nodes must
//! also group the same instances.

use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::Result;
use crate::lookup::ExpressionContext;
use crate::models::{ChildrenHint, CustomizationKind, HasChildren, NavNode, NodeKind, TrackedVariables};
use crate::providers::{ContextId, LevelParent, ProviderArena, ProviderFlags};

/// Finalizes nodes read from a provider arena
pub struct NodesFinalizer;

impl NodesFinalizer {
    /// Decide children and apply customization, persisting any change
    pub fn finalize(arena: &mut ProviderArena, context: ContextId, node: &mut NavNode) -> Result<()> {
        let mut changed = false;
        if !node.has_children.is_determined() {
            node.has_children = Self::determine_children(arena, context, node)?;
            changed = true;
        }
        if !node.extended.is_customized {
            changed |= Self::customize(arena, context, node)?;
        }
        if !changed {
            return Ok(());
        }
        arena.env.cache.update_node(node)?;
        if node.has_children.is_determined() {
            if let Some(cached) = arena.env.cache.get_cached_node(node.id)? {
                arena.env.cache.refresh_finalized(cached.data_source_id)?;
            }
        }
        Ok(())
    }

    /// Whether the node has children
    ///
    /// # Returns
    ///
    /// A determined value: [`HasChildren::Yes`] or [`HasChildren::No`].
    pub fn determine_children(arena: &mut ProviderArena, context: ContextId, node: &NavNode) -> Result<HasChildren> {
        if node.has_children.is_determined() {
            return Ok(node.has_children);
        }
        match node.extended.children_hint {
            ChildrenHint::Always => return Ok(HasChildren::Yes),
            ChildrenHint::Never => return Ok(HasChildren::No),
            ChildrenHint::Unknown => {}
        }
        let allowed = node.extended.allowed_similar_ancestors.max(1);
        let similar = Self::similar_ancestors(arena, node)?;
        if similar >= allowed {
            tracing::debug!(node = %node.label, similar, "similar ancestor limit reached, branch cut");
            return Ok(HasChildren::No);
        }
        let probe = arena.create_hierarchy_level_provider(
            Some(context),
            LevelParent::physical(node.clone()),
            ProviderFlags::probe(),
        )?;
        Ok(HasChildren::from_bool(arena.has_nodes(probe)?))
    }

    fn similar_ancestors(arena: &ProviderArena, node: &NavNode) -> Result<usize> {
        let cache = &arena.env.cache;
        let mut similar = 0;
        for ancestor in cache.node_ancestors(node.id)? {
            let ancestor = ancestor.node;
            if ancestor.key.hash != node.key.hash {
                continue;
            }
            if node.is_grouping()
                && (ancestor.extended.grouped_count != node.extended.grouped_count
                    || cache.grouped_instances_differ(ancestor.id, node.id)?)
            {
                continue;
            }
            similar += 1;
        }
        Ok(similar)
    }

    /// Apply customization rules, the highest-priority matching rule of each kind
    ///
    /// # Returns
    ///
    /// `true` when the node was customized. A failing rule leaves the node
    /// uncustomized and is logged.
    pub fn customize(arena: &ProviderArena, context: ContextId, node: &mut NavNode) -> Result<bool> {
        let rules = arena.env.rules.customization_rules();
        if rules.is_empty() {
            return Ok(false);
        }
        let tracked = TrackedVariables::new(arena.env.variables.clone());
        let parent = arena.context(context).parent_node.as_ref();
        let evaluator = arena.env.evaluator.as_ref();
        let mut customized = node.clone();

        let applied: Result<()> = (|| {
            let expression_context = ExpressionContext::new(&tracked).with_node(node).with_parent(parent);
            let mut applied_kinds = BTreeSet::new();
            for rule in &rules {
                let kind = match &rule.kind {
                    CustomizationKind::LabelOverride { .. } => "label",
                    CustomizationKind::ImageIdOverride { .. } => "image",
                    CustomizationKind::ExtendedData { .. } => "extendedData",
                };
                if applied_kinds.contains(kind) {
                    continue;
                }
                if let Some(class) = &rule.class {
                    let matches = node.kind() == NodeKind::Instance
                        && node
                            .key
                            .class_name
                            .as_deref()
                            .is_some_and(|name| arena.env.schema.is_a(name, class));
                    if !matches {
                        continue;
                    }
                }
                if let Some(condition) = &rule.condition {
                    if !evaluator.evaluate_bool(condition, &expression_context)? {
                        continue;
                    }
                }
                match &rule.kind {
                    CustomizationKind::LabelOverride { label, description } => {
                        if let Some(label) = label {
                            customized.label = text(evaluator.evaluate_value(label, &expression_context)?);
                        }
                        if let Some(description) = description {
                            customized.description =
                                Some(text(evaluator.evaluate_value(description, &expression_context)?));
                        }
                    }
                    CustomizationKind::ImageIdOverride { image_id } => {
                        customized.image_id = Some(text(evaluator.evaluate_value(image_id, &expression_context)?));
                    }
                    CustomizationKind::ExtendedData { items } => {
                        for (name, expression) in items {
                            let value = evaluator.evaluate_value(expression, &expression_context)?;
                            customized.extended.extra.insert(name.clone(), value);
                        }
                    }
                }
                applied_kinds.insert(kind);
            }
            Ok(())
        })();

        if let Err(err) = applied {
            if err.is_cancelled() {
                return Err(err);
            }
            tracing::warn!(node = %node.label, error = %err, "customization failed, node left uncustomized");
            return Ok(false);
        }
        customized.extended.is_customized = true;
        *node = customized;

        let used = tracked.used_names();
        if !used.is_empty() {
            Self::record_used_variables(arena, node.id, &used)?;
        }
        Ok(true)
    }

    fn record_used_variables(arena: &ProviderArena, node_id: Uuid, used: &BTreeSet<String>) -> Result<()> {
        if let Some(cached) = arena.env.cache.get_cached_node(node_id)? {
            arena
                .env
                .cache
                .update_related_variables(cached.data_source_id, &arena.env.variables.subset(used))?;
        }
        Ok(())
    }
}

fn text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_of_values() {
        assert_eq!(text(serde_json::json!("Widget")), "Widget");
        assert_eq!(text(serde_json::json!(3)), "3");
        assert_eq!(text(serde_json::Value::Null), "");
    }
}
