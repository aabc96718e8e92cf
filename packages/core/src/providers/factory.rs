//! Hierarchy level factory
//!
//! Builds the provider tree for one hierarchy level:
//!
//! ```text
//! LabelCollapse
//!   └── SameLabelMerge (only when a grouping rule asks for it)
//!         └── Multi
//!               ├── DataSource (specification 0)
//!               ├── DataSource (specification 1)
//!               └── ...
//! ```
//!
//! A level already materialized for the request's variables is rebuilt from
//! its cached data sources without evaluating a single rule.

use std::sync::Arc;
use uuid::Uuid;

use crate::cache::LockPolicy;
use crate::error::{HierarchyError, Result};
use crate::lookup::ExpressionContext;
use crate::models::{
    ChildNodeSpecification, CombinedHierarchyLevelIdentifier, DataSourceCustomData, HierarchyLevelIdentifier,
    NavNode, NodeKey, NodeKind, NodeRule, SpecificationKind, TrackedVariables,
};
use crate::query::{GroupingResolver, NavigationQueryBuilder, QueryContext};

use super::arena::{ProviderArena, ProviderId, ProviderKind};
use super::context::{ContextId, ProviderContext, ProviderFlags};
use super::data_source::{DataSourceProvider, NodeSource};

/// Where a new hierarchy level hangs
#[derive(Debug, Clone, Default)]
pub struct LevelParent {
    /// Node whose children the level holds; `None` for the root level
    pub node: Option<NavNode>,
    pub physical_parent_id: Option<Uuid>,
    pub parent_path: Vec<String>,
    pub virtual_parent_ids: Vec<Uuid>,
}

impl LevelParent {
    pub fn root() -> Self {
        Self::default()
    }

    /// Children of a displayed node
    pub fn physical(node: NavNode) -> Self {
        Self {
            physical_parent_id: Some(node.id),
            parent_path: node.key.path_from_root.clone(),
            virtual_parent_ids: Vec::new(),
            node: Some(node),
        }
    }

    /// Children of a virtual node, displayed under the virtual node's own parent
    pub fn virtual_node(node: NavNode) -> Self {
        let mut parent_path = node.key.path_from_root.clone();
        parent_path.pop();
        let mut virtual_parent_ids = vec![node.id];
        virtual_parent_ids.extend(node.extended.virtual_parent_ids.iter().copied());
        Self {
            physical_parent_id: node.parent_id,
            parent_path,
            virtual_parent_ids,
            node: Some(node),
        }
    }
}

/// A specification selected for a level, with what it is evaluated against
struct SelectedSpecification {
    specification: ChildNodeSpecification,
    spec_parent: Option<NavNode>,
    group_chain: Vec<NavNode>,
}

impl ProviderArena {
    /// Create the provider of the level below `level_parent`
    ///
    /// # Arguments
    ///
    /// * `parent` - Context the level is created from (`None` for a request root)
    /// * `level_parent` - Node the level belongs to
    /// * `flags` - Overrides for every provider of the level
    ///
    /// # Errors
    ///
    /// Cache failures, lock timeouts and cancellation. Misconfigured
    /// specifications do not fail the level; they yield no nodes.
    pub fn create_hierarchy_level_provider(
        &mut self,
        parent: Option<ContextId>,
        level_parent: LevelParent,
        flags: ProviderFlags,
    ) -> Result<ProviderId> {
        self.env.cancel.check()?;
        let combined = CombinedHierarchyLevelIdentifier::new(
            self.env.connection_id(),
            self.env.ruleset_id(),
            level_parent.physical_parent_id,
        );
        let virtual_parent = level_parent.node.as_ref().map(|node| node.id);
        let level = self.env.cache.get_or_create_hierarchy_level(&combined, virtual_parent)?;
        let lock = Arc::new(self.env.cache.level_lock(level.physical_level_id, self.env.cancel.clone()));
        lock.wait_for_unlock()?;

        let mut context = ProviderContext::new(level_parent.node, level_parent.physical_parent_id);
        context.parent_path = level_parent.parent_path;
        context.virtual_parent_ids = level_parent.virtual_parent_ids;
        context.hierarchy_level = Some(level.clone());
        context.lock = LockPolicy::Level(lock);
        context.flags = flags;
        let level_context = self.add_context(parent, context);

        let cached = self.env.cache.is_initialized(
            level.id,
            self.env.instance_filter.as_deref(),
            self.env.result_set_size_limit,
            &self.env.variables,
        )? && !self.env.cache.might_have_new_variation(level.id, &self.env.variables)?;

        let (children, merge_same_label) = if cached {
            self.cached_providers(level_context, &level)?
        } else {
            self.specification_providers(level_context)?
        };
        let multi = self.add_provider(level_context, ProviderKind::Multi(children));
        self.post_process(level_context, multi, merge_same_label)
    }

    fn cached_providers(
        &mut self,
        level_context: ContextId,
        level: &HierarchyLevelIdentifier,
    ) -> Result<(Vec<ProviderId>, bool)> {
        let infos = self.env.cache.find_data_sources(
            level.id,
            None,
            self.env.instance_filter.as_deref(),
            self.env.result_set_size_limit,
            &self.env.variables,
        )?;
        tracing::debug!(level = %level.id, data_sources = infos.len(), "hierarchy level served from cache");
        let mut merge_same_label = false;
        let mut children = Vec::with_capacity(infos.len());
        for info in infos {
            merge_same_label |= DataSourceCustomData::from_info(&info).merge_same_label;
            let provider = DataSourceProvider::cached(info);
            children.push(self.add_provider(level_context, ProviderKind::DataSource(Box::new(provider))));
        }
        Ok((children, merge_same_label))
    }

    fn specification_providers(&mut self, level_context: ContextId) -> Result<(Vec<ProviderId>, bool)> {
        let tracked = TrackedVariables::new(self.env.variables.clone());
        let parent_node = self.context(level_context).parent_node.clone();
        let selected: Vec<SelectedSpecification> = match &parent_node {
            Some(node) if node.is_grouping() => self.grouping_parent_specification(node)?.into_iter().collect(),
            _ => self
                .matching_specifications(parent_node.as_ref(), &tracked)
                .into_iter()
                .map(|specification| SelectedSpecification {
                    specification,
                    spec_parent: parent_node.clone(),
                    group_chain: Vec::new(),
                })
                .collect(),
        };

        let mut merge_same_label = false;
        let mut children = Vec::with_capacity(selected.len());
        let mut contexts = Vec::with_capacity(selected.len());
        for (index, selected) in selected.into_iter().enumerate() {
            let mut context = self.context(level_context).derive();
            let source = match self.specification_source(&selected, &tracked, &mut context) {
                Ok(source) => source,
                Err(err @ (HierarchyError::Misconfiguration { .. } | HierarchyError::Expression { .. })) => {
                    tracing::warn!(
                        specification = %selected.specification.id,
                        error = %err,
                        "specification yields no nodes"
                    );
                    NodeSource::Empty
                }
                Err(err) => return Err(err),
            };
            merge_same_label |= context.merge_same_label;
            context.specification = Some(selected.specification);
            context.spec_parent = selected.spec_parent;
            context.group_chain = selected.group_chain;
            let spec_context = self.add_context(Some(level_context), context);
            let provider = DataSourceProvider::new(source, vec![index as u64]);
            children.push(self.add_provider(spec_context, ProviderKind::DataSource(Box::new(provider))));
            contexts.push(spec_context);
        }

        let used = tracked.used_names();
        for context in contexts.into_iter().chain(std::iter::once(level_context)) {
            self.context_mut(context).used_variables.extend(used.iter().cloned());
        }
        Ok((children, merge_same_label))
    }

    /// Specifications of the rules that apply under `parent`, in rule order
    fn matching_specifications(
        &self,
        parent: Option<&NavNode>,
        tracked: &TrackedVariables,
    ) -> Vec<ChildNodeSpecification> {
        let rules = match parent {
            None => self.env.rules.root_rules(),
            Some(parent) => self.env.rules.child_rules(parent),
        };
        let mut specifications = Vec::new();
        for rule in rules {
            if !self.rule_applies(&rule, parent, tracked) {
                continue;
            }
            let mut rule_specifications = rule.specifications;
            rule_specifications.sort_by(|a, b| b.priority.cmp(&a.priority));
            specifications.extend(rule_specifications);
        }
        specifications
    }

    fn rule_applies(&self, rule: &NodeRule, parent: Option<&NavNode>, tracked: &TrackedVariables) -> bool {
        if let Some(parent_class) = &rule.parent_class {
            let matches = parent.is_some_and(|parent| {
                parent.kind() == NodeKind::Instance
                    && parent
                        .key
                        .class_name
                        .as_deref()
                        .is_some_and(|class| self.env.schema.is_a(class, parent_class))
            });
            if !matches {
                return false;
            }
        }
        let Some(condition) = &rule.condition else {
            return true;
        };
        let context = ExpressionContext::new(tracked).with_parent(parent);
        match self.env.evaluator.evaluate_bool(condition, &context) {
            Ok(applies) => applies,
            Err(err) => {
                tracing::warn!(condition = %condition, error = %err, "rule condition failed, rule skipped");
                false
            }
        }
    }

    /// The specification a grouping node belongs to, with its grouping ancestry
    fn grouping_parent_specification(&self, node: &NavNode) -> Result<Option<SelectedSpecification>> {
        let mut group_chain = vec![node.clone()];
        let mut spec_parent = None;
        for ancestor in self.env.cache.node_ancestors(node.id)? {
            let ancestor = ancestor.node;
            if ancestor.is_grouping() && ancestor.specification_id() == node.specification_id() {
                group_chain.push(ancestor);
            } else {
                spec_parent = Some(ancestor);
                break;
            }
        }
        group_chain.reverse();

        let rules = match &spec_parent {
            None => self.env.rules.root_rules(),
            Some(parent) => self.env.rules.child_rules(parent),
        };
        let specification = rules
            .into_iter()
            .flat_map(|rule| rule.specifications)
            .find(|specification| specification.id == node.specification_id());
        let Some(specification) = specification else {
            tracing::warn!(
                specification = %node.specification_id(),
                node = %node.label,
                "grouping node refers to an unknown specification"
            );
            return Ok(None);
        };
        Ok(Some(SelectedSpecification {
            specification,
            spec_parent,
            group_chain,
        }))
    }

    fn specification_source(
        &self,
        selected: &SelectedSpecification,
        tracked: &TrackedVariables,
        context: &mut ProviderContext,
    ) -> Result<NodeSource> {
        let specification = &selected.specification;
        if let SpecificationKind::CustomNode {
            node_type,
            label,
            description,
            image_id,
        } = &specification.kind
        {
            let (Some(node_type), Some(label)) = (node_type, label) else {
                return Err(HierarchyError::misconfiguration(format!(
                    "custom node specification '{}' needs a type and a label",
                    specification.id
                )));
            };
            let mut node = NavNode::new(NodeKey::custom(specification.id.as_str(), node_type), label.as_str());
            node.description = description.clone();
            node.image_id = image_id.clone();
            node.extended.hide_in_hierarchy = specification.hide_nodes_in_hierarchy;
            node.extended.hide_if_no_children = specification.hide_if_no_children;
            node.extended.hide_expression = specification.hide_expression.clone();
            node.extended.children_hint = specification.has_children;
            node.extended.allowed_similar_ancestors = if specification.suppress_similar_ancestors_check {
                self.env.config().max_allowed_similar_ancestors_when_suppressed
            } else {
                0
            };
            return Ok(NodeSource::Custom(node));
        }

        let grouping_rules = self.env.rules.grouping_rules();
        let resolved = GroupingResolver::new(self.env.schema.as_ref(), self.env.evaluator.as_ref()).resolve(
            specification,
            &grouping_rules,
            selected.spec_parent.as_ref(),
            tracked,
        )?;
        let sorting_rules = self.env.rules.sorting_rules();
        let query = NavigationQueryBuilder::new(QueryContext {
            specification,
            spec_parent: selected.spec_parent.as_ref(),
            group_chain: &selected.group_chain,
            handlers: &resolved.handlers,
            sorting_rules: &sorting_rules,
            schema: self.env.schema.as_ref(),
            instance_filter: self.env.instance_filter.as_deref(),
        })
        .build()?;
        context.handlers = resolved.handlers;
        context.merge_same_label = resolved.merge_same_label_after_query;
        Ok(query.map_or(NodeSource::Empty, NodeSource::Query))
    }
}
