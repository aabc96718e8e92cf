//! Data source providers
//!
//! A data source provider yields the direct nodes of one data source: the
//! rows of a navigation query, a single custom node, or nodes already in the
//! cache. Nodes are written once, inside one savepoint, the first time the
//! data source is read; afterwards every reader is served from the cache.
//!
//! # Visibility
//!
//! Freshly written nodes carrying hide flags are resolved lazily, one at a
//! time, when a reader reaches them:
//!
//! - hidden in hierarchy, lone group, unspecified group value: made virtual,
//!   and the node's children are read in its place
//! - hide expression holds, or no children while hiding childless nodes:
//!   made hidden
//!
//! # Large results
//!
//! A paged request over a query with a stable count above the configured
//! partial provider size splits the query into partial data sources of that
//! size. Only the pages that are actually read execute their query.

use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::cache::{get_result_or_lock, CachedNode, NodeVisibility};
use crate::error::{HierarchyError, Result};
use crate::finalizer::NodesFinalizer;
use crate::lookup::ExpressionContext;
use crate::models::{
    parts, ChildNodeSpecification, DataSourceClass, DataSourceCustomData, DataSourceIdentifier,
    DataSourceInfo, HasChildren, NavNode, NodeKind, PageCount, TrackedVariables,
};
use crate::query::{GroupingHandler, NavigationQuery, NodeReader, QueryBranch};

use super::arena::{InitState, ProviderArena, ProviderId, ProviderKind};
use super::context::{ContextId, ProviderContext, ProviderEnv, ProviderFlags};
use super::factory::LevelParent;
use super::paging::CountInfo;

/// Where a data source's nodes come from
#[derive(Debug, Clone)]
pub enum NodeSource {
    /// Nothing; used for specifications that select no classes
    Empty,
    Query(NavigationQuery),
    /// One page of a split query
    Page {
        query: NavigationQuery,
        offset: usize,
        limit: usize,
    },
    Custom(NavNode),
    /// An initialized data source found in the cache
    Cached,
}

/// Outcome of resolving a loaded node's visibility
#[derive(Debug, Clone)]
pub(crate) enum Resolved {
    Node(NavNode),
    /// Virtual node; its children provider yields in its place
    Expand(ProviderId),
    Skip,
}

#[derive(Debug, Clone)]
pub(crate) struct LoadedNode {
    cached: CachedNode,
    resolved: Option<Resolved>,
}

pub struct DataSourceProvider {
    pub source: NodeSource,
    /// Position among sibling providers, outermost first
    pub index: Vec<u64>,
    pub parent_data_source: Option<Uuid>,
    pub info: Option<DataSourceInfo>,
    pub total: Option<usize>,
    pub has_nodes: Option<bool>,
    nodes: Option<Vec<LoadedNode>>,
    partials: Option<Vec<ProviderId>>,
}

impl DataSourceProvider {
    pub fn new(source: NodeSource, index: Vec<u64>) -> Self {
        Self {
            source,
            index,
            parent_data_source: None,
            info: None,
            total: None,
            has_nodes: None,
            nodes: None,
            partials: None,
        }
    }

    /// Provider over an initialized cached data source
    pub fn cached(info: DataSourceInfo) -> Self {
        let mut provider = Self::new(NodeSource::Cached, info.identifier.index.clone());
        provider.parent_data_source = info.parent_id;
        provider.info = Some(info);
        provider
    }

    pub fn identifier(&self, context: &ProviderContext, env: &ProviderEnv) -> Result<DataSourceIdentifier> {
        Ok(DataSourceIdentifier {
            hierarchy_level_id: context.level()?.id,
            index: self.index.clone(),
            instance_filter: env.instance_filter.clone(),
            result_set_size_limit: env.result_set_size_limit,
        })
    }

    /// Forget loaded nodes; the next read starts over from the cache
    pub fn reset(&mut self) {
        self.nodes = None;
        self.partials = None;
    }

    fn is_loaded(&self) -> bool {
        self.nodes.is_some() || self.partials.is_some()
    }
}

/// Whether no node of the query can be hidden, so row count equals node count
fn count_is_stable(specification: Option<&ChildNodeSpecification>, branches: &[QueryBranch]) -> bool {
    if specification.is_some_and(ChildNodeSpecification::may_hide_nodes) {
        return false;
    }
    branches.iter().all(|branch| match &branch.handler {
        Some(GroupingHandler::BaseClass {
            create_group_for_single_item,
            ..
        }) => *create_group_for_single_item,
        Some(GroupingHandler::Property {
            create_group_for_single_item,
            create_group_for_unspecified_values,
            ..
        }) => *create_group_for_single_item && *create_group_for_unspecified_values,
        _ => true,
    })
}

fn needs_visibility_decision(node: &NavNode) -> bool {
    let extended = &node.extended;
    extended.hide_in_hierarchy
        || extended.hide_if_no_children
        || extended.hide_expression.is_some()
        || extended.hide_if_only_one_child
        || extended.hide_if_grouping_value_not_specified
}

/// Whether the node gives way to its children
fn yields_to_children(node: &NavNode) -> bool {
    let extended = &node.extended;
    extended.hide_in_hierarchy
        || (extended.hide_if_grouping_value_not_specified && node.has_unspecified_grouping_value())
        || (extended.hide_if_only_one_child && extended.grouped_count == Some(1))
}

fn node_types(nodes: &[NavNode]) -> String {
    let kinds: BTreeSet<&str> = nodes.iter().map(|node| node.kind().as_str()).collect();
    kinds.into_iter().collect::<Vec<_>>().join(",")
}

impl ProviderArena {
    // ========================================================================
    // Operations
    // ========================================================================

    pub(crate) fn data_source_total(&mut self, id: ProviderId) -> Result<CountInfo> {
        self.with_data_source(id, |arena, context, provider| {
            if let Some(total) = provider.total {
                return Ok(CountInfo::exact(total));
            }
            if !provider.is_loaded() {
                if let Some(total) = arena.peek_info(context, provider)?.and_then(|info| info.total_nodes_count) {
                    provider.total = Some(total);
                    arena.set_state(id, InitState::PartiallyInitialized)?;
                    return Ok(CountInfo::exact(total));
                }
            }
            arena.load(id, context, provider)?;
            let total = arena.resolved_total(context, provider)?;
            provider.total = Some(total);
            provider.has_nodes = Some(total > 0);
            if let Some(info) = &mut provider.info {
                if info.total_nodes_count != Some(total) || info.has_nodes != Some(total > 0) {
                    info.total_nodes_count = Some(total);
                    info.has_nodes = Some(total > 0);
                    arena.env.cache.update(info, parts::TOTAL_NODES_COUNT | parts::HAS_NODES)?;
                }
            }
            Ok(CountInfo::exact(total))
        })
    }

    pub(crate) fn data_source_has_nodes(&mut self, id: ProviderId) -> Result<bool> {
        self.with_data_source(id, |arena, context, provider| {
            if let Some(has_nodes) = provider.has_nodes {
                return Ok(has_nodes);
            }
            if let Some(total) = provider.total {
                return Ok(total > 0);
            }
            let parent_has_children = arena.context(context).parent_node.as_ref().map(|node| node.has_children);
            if parent_has_children == Some(HasChildren::No) {
                return Ok(false);
            }
            if !provider.is_loaded() {
                if let Some(has_nodes) = arena.peek_info(context, provider)?.and_then(|info| info.has_nodes) {
                    provider.has_nodes = Some(has_nodes);
                    return Ok(has_nodes);
                }
                if let Some(has_nodes) = arena.probe_exists(context, provider)? {
                    arena.set_state(id, InitState::PartiallyInitialized)?;
                    return Ok(has_nodes);
                }
            }
            arena.load(id, context, provider)?;
            let has_nodes = arena.resolved_has_nodes(context, provider)?;
            provider.has_nodes = Some(has_nodes);
            if let Some(info) = &mut provider.info {
                if info.has_nodes != Some(has_nodes) {
                    info.has_nodes = Some(has_nodes);
                    arena.env.cache.update(info, parts::HAS_NODES)?;
                }
            }
            Ok(has_nodes)
        })
    }

    pub(crate) fn data_source_range(&mut self, id: ProviderId, start: usize, size: Option<usize>) -> Result<Vec<NavNode>> {
        self.with_data_source(id, |arena, context, provider| {
            arena.load(id, context, provider)?;
            if let Some(partials) = provider.partials.clone() {
                return arena.read_children(&partials, start, size);
            }
            let mut skip = start;
            let mut nodes = Vec::new();
            for position in 0..provider.nodes.as_ref().map_or(0, Vec::len) {
                if size.is_some_and(|size| nodes.len() >= size) {
                    break;
                }
                match arena.resolve_entry(context, provider, position)? {
                    Resolved::Skip => {}
                    Resolved::Node(node) => {
                        if skip > 0 {
                            skip -= 1;
                        } else {
                            nodes.push(node);
                        }
                    }
                    Resolved::Expand(children) => {
                        let count = arena.total_count(children)?.count;
                        if skip >= count {
                            skip -= count;
                            continue;
                        }
                        let wanted = size.map(|size| size - nodes.len());
                        nodes.extend(arena.read_range(children, skip, wanted)?);
                        skip = 0;
                    }
                }
            }
            Ok(nodes)
        })
    }

    pub(crate) fn data_source_find(&mut self, id: ProviderId, node_id: Uuid) -> Result<Option<NavNode>> {
        self.with_data_source(id, |arena, context, provider| {
            arena.load(id, context, provider)?;
            if let Some(partials) = provider.partials.clone() {
                for partial in partials {
                    if let Some(node) = arena.find_node(partial, node_id)? {
                        return Ok(Some(node));
                    }
                }
                return Ok(None);
            }
            for position in 0..provider.nodes.as_ref().map_or(0, Vec::len) {
                match arena.resolve_entry(context, provider, position)? {
                    Resolved::Node(node) if node.id == node_id => return Ok(Some(node)),
                    Resolved::Expand(children) => {
                        if let Some(node) = arena.find_node(children, node_id)? {
                            return Ok(Some(node));
                        }
                    }
                    _ => {}
                }
            }
            Ok(None)
        })
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Cached row of the data source, if any, without locking or populating
    fn peek_info(&self, context: ContextId, provider: &mut DataSourceProvider) -> Result<Option<DataSourceInfo>> {
        if provider.info.is_none() {
            let identifier = provider.identifier(self.context(context), &self.env)?;
            provider.info = self.env.cache.find_data_source(&identifier, &self.env.variables)?;
        }
        Ok(provider.info.clone())
    }

    /// Make the provider's nodes (or partial pages) available
    fn load(&mut self, id: ProviderId, context: ContextId, provider: &mut DataSourceProvider) -> Result<()> {
        if provider.is_loaded() {
            return Ok(());
        }
        self.env.cancel.check()?;
        let cached = match (&provider.source, &provider.info) {
            (NodeSource::Cached, Some(info)) if info.is_initialized => Some(info.clone()),
            _ => None,
        };
        let found = match cached {
            Some(info) => Some(info),
            None => {
                let identifier = provider.identifier(self.context(context), &self.env)?;
                let lock = self.context(context).lock.clone();
                let cache = self.env.cache.clone();
                let variables = self.env.variables.clone();
                let found = get_result_or_lock(&lock, || {
                    Ok(cache
                        .find_data_source(&identifier, &variables)?
                        .filter(|info| info.is_initialized))
                })?;
                if found.is_none() {
                    let populated = self.populate(context, provider, &identifier);
                    lock.unlock();
                    populated?;
                }
                found
            }
        };
        if let Some(info) = found {
            self.adopt(context, provider, info)?;
        }
        let state = if provider.partials.is_some() {
            InitState::PartiallyInitialized
        } else {
            InitState::FullyInitialized
        };
        self.set_state(id, state)
    }

    /// Take over an initialized data source written earlier
    fn adopt(&mut self, context: ContextId, provider: &mut DataSourceProvider, info: DataSourceInfo) -> Result<()> {
        let custom = DataSourceCustomData::from_info(&info);
        provider.total = provider.total.or(info.total_nodes_count);
        provider.has_nodes = provider.has_nodes.or(info.has_nodes);
        if custom.page_counts.is_empty() {
            let nodes = self.env.cache.get_data_source_nodes(info.id)?;
            tracing::debug!(data_source = %info.id, nodes = nodes.len(), "data source served from cache");
            provider.nodes = Some(
                nodes
                    .into_iter()
                    .map(|cached| LoadedNode { cached, resolved: None })
                    .collect(),
            );
        } else {
            provider.partials = Some(self.page_providers(context, provider, &info, &custom.page_counts)?);
        }
        provider.info = Some(info);
        Ok(())
    }

    /// Child providers over the pages of a split data source
    fn page_providers(
        &mut self,
        context: ContextId,
        provider: &DataSourceProvider,
        info: &DataSourceInfo,
        page_counts: &[PageCount],
    ) -> Result<Vec<ProviderId>> {
        if let NodeSource::Query(query) = &provider.source {
            let mut offset = 0;
            let mut pages = Vec::with_capacity(page_counts.len());
            for (page, count) in page_counts.iter().enumerate() {
                let mut index = provider.index.clone();
                index.push(page as u64);
                let mut page_provider = DataSourceProvider::new(
                    NodeSource::Page {
                        query: query.clone(),
                        offset,
                        limit: count.total,
                    },
                    index,
                );
                page_provider.parent_data_source = Some(info.id);
                page_provider.total = Some(count.total);
                page_provider.has_nodes = Some(count.total > 0);
                pages.push(self.add_provider(context, ProviderKind::DataSource(Box::new(page_provider))));
                offset += count.total;
            }
            return Ok(pages);
        }
        let level = self.context(context).level()?.id;
        let cached = self.env.cache.find_data_sources(
            level,
            Some(info.id),
            self.env.instance_filter.as_deref(),
            self.env.result_set_size_limit,
            &self.env.variables,
        )?;
        if cached.len() != page_counts.len() {
            return Err(HierarchyError::invariant(format!(
                "data source {} has {} cached pages, expected {}",
                info.id,
                cached.len(),
                page_counts.len()
            )));
        }
        Ok(cached
            .into_iter()
            .map(|page| {
                let page_provider = DataSourceProvider::cached(page);
                self.add_provider(context, ProviderKind::DataSource(Box::new(page_provider)))
            })
            .collect())
    }

    /// Read the source and write the data source and its nodes
    ///
    /// Called with the level lock held.
    fn populate(
        &mut self,
        context: ContextId,
        provider: &mut DataSourceProvider,
        identifier: &DataSourceIdentifier,
    ) -> Result<()> {
        let existing = self.env.cache.find_data_source(identifier, &self.env.variables)?;
        let ctx = self.context(context);
        let mut info = existing.unwrap_or_else(|| {
            DataSourceInfo::new(identifier.clone(), ctx.related_variables(&self.env.variables))
        });
        info.parent_id = provider.parent_data_source;
        info.specification_hash = ctx.specification.as_ref().map(ChildNodeSpecification::hash);
        let may_hide = ctx.specification.as_ref().is_some_and(ChildNodeSpecification::may_hide_nodes);
        if ctx.merge_same_label {
            let custom = DataSourceCustomData {
                merge_same_label: true,
                ..DataSourceCustomData::from_info(&info)
            };
            info.custom_json = Some(serde_json::to_value(custom)?);
        }

        let source = provider.source.clone();
        let (nodes, stable) = match &source {
            NodeSource::Empty => (Vec::new(), true),
            NodeSource::Custom(node) => (vec![node.clone()], !may_hide),
            NodeSource::Cached => {
                return Err(HierarchyError::invariant(format!(
                    "cached data source {} is no longer initialized",
                    identifier.full_index()
                )));
            }
            NodeSource::Page { query, offset, limit } => {
                info.select_classes = select_classes(query);
                let (sql, bindings) = query.paged(*offset, *limit);
                (self.read_rows(context, query, &sql, &bindings)?, true)
            }
            NodeSource::Query(query) => {
                info.select_classes = select_classes(query);
                let stable = count_is_stable(ctx.specification.as_ref(), &query.branches);
                let may_split = stable && self.env.page_requested && self.env.rules.artifact_rules().is_empty();
                let total = if may_split || self.env.result_set_size_limit.is_some() {
                    let (sql, bindings) = query.count_query();
                    Some(self.env.store.query_scalar(&sql, &bindings, &self.env.cancel)?.max(0) as usize)
                } else {
                    None
                };
                if let (Some(limit), Some(actual)) = (self.env.result_set_size_limit, total) {
                    if actual > limit {
                        return Err(HierarchyError::ResultSetTooLarge { limit, actual });
                    }
                }
                let page_size = self.env.config().partial_provider_size.max(1);
                if let Some(total) = total.filter(|total| may_split && *total > page_size) {
                    return self.split_into_pages(context, provider, info, total, page_size);
                }
                let rows = self.read_rows(context, query, &query.sql, &query.bindings)?;
                if let Some(limit) = self.env.result_set_size_limit {
                    if rows.len() > limit {
                        return Err(HierarchyError::ResultSetTooLarge {
                            limit,
                            actual: rows.len(),
                        });
                    }
                }
                (rows, stable)
            }
        };
        self.store_nodes(context, provider, info, nodes, stable)
    }

    fn read_rows(
        &self,
        context: ContextId,
        query: &NavigationQuery,
        sql: &str,
        bindings: &[serde_json::Value],
    ) -> Result<Vec<NavNode>> {
        let specification = self
            .context(context)
            .specification
            .as_ref()
            .ok_or_else(|| HierarchyError::invariant("query data source without specification"))?;
        let allowed_similar_ancestors = if specification.suppress_similar_ancestors_check {
            self.env.config().max_allowed_similar_ancestors_when_suppressed
        } else {
            0
        };
        let reader = NodeReader {
            specification,
            branches: &query.branches,
            ruleset_id: self.env.ruleset_id(),
            allowed_similar_ancestors,
        };
        self.env
            .store
            .query_map(sql, bindings, &self.env.cancel, |row| reader.read(row))
    }

    fn split_into_pages(
        &mut self,
        context: ContextId,
        provider: &mut DataSourceProvider,
        mut info: DataSourceInfo,
        total: usize,
        page_size: usize,
    ) -> Result<()> {
        let page_counts: Vec<PageCount> = (0..total.div_ceil(page_size))
            .map(|page| PageCount {
                total: page_size.min(total - page * page_size),
            })
            .collect();
        let custom = DataSourceCustomData {
            page_counts: page_counts.clone(),
            ..DataSourceCustomData::from_info(&info)
        };
        info.custom_json = Some(serde_json::to_value(custom)?);
        info.direct_nodes_count = Some(0);
        info.total_nodes_count = Some(total);
        info.has_nodes = Some(total > 0);
        info.is_initialized = true;
        if info.id.is_nil() {
            self.env.cache.cache_data_source(&mut info)?;
        } else {
            self.env.cache.update(&info, parts::ALL)?;
        }
        tracing::debug!(data_source = %info.id, total, pages = page_counts.len(), "split data source into pages");
        provider.partials = Some(self.page_providers(context, provider, &info, &page_counts)?);
        provider.total = Some(total);
        provider.has_nodes = Some(total > 0);
        provider.info = Some(info);
        Ok(())
    }

    /// Write the data source and its nodes in one savepoint
    fn store_nodes(
        &mut self,
        context: ContextId,
        provider: &mut DataSourceProvider,
        mut info: DataSourceInfo,
        mut nodes: Vec<NavNode>,
        stable: bool,
    ) -> Result<()> {
        let used = self.apply_artifacts(context, &mut nodes)?;
        if !used.is_empty() {
            info.related_variables = info
                .related_variables
                .merged(&self.env.variables.subset(&used));
        }
        let ctx = self.context(context);
        for node in &mut nodes {
            node.parent_id = ctx.physical_parent_id;
            node.extended.ruleset_id = self.env.ruleset_id().to_string();
            node.extended.virtual_parent_ids = ctx.virtual_parent_ids.clone();
            node.extended.merge_same_label = ctx.merge_same_label && node.kind() == NodeKind::Instance;
            node.key.set_parent_path(&ctx.parent_path);
        }

        let count = nodes.len();
        info.direct_nodes_count = Some(count);
        info.node_types = Some(node_types(&nodes));
        info.is_initialized = true;
        if count == 0 {
            info.total_nodes_count = Some(0);
            info.has_nodes = Some(false);
            info.is_finalized = true;
        } else if stable {
            info.total_nodes_count = Some(count);
            info.has_nodes = Some(true);
        }

        let cache = self.env.cache.clone();
        let mut savepoint = cache.create_savepoint()?;
        if info.id.is_nil() {
            savepoint.cache_data_source(&mut info)?;
        } else {
            savepoint.update(&info, parts::ALL)?;
        }
        let mut loaded = Vec::with_capacity(count);
        for (index, mut node) in nodes.into_iter().enumerate() {
            self.env.cancel.check()?;
            let decided = !needs_visibility_decision(&node);
            savepoint.cache_node(info.id, index, &mut node, NodeVisibility::Visible, decided)?;
            loaded.push(LoadedNode {
                cached: CachedNode {
                    node,
                    data_source_id: info.id,
                    index,
                    visibility: NodeVisibility::Visible,
                    is_initialized: decided,
                },
                resolved: None,
            });
        }
        savepoint.commit()?;
        tracing::debug!(data_source = %info.id, nodes = count, "populated data source");

        provider.total = info.total_nodes_count;
        provider.has_nodes = info.has_nodes;
        provider.nodes = Some(loaded);
        provider.info = Some(info);
        Ok(())
    }

    /// Evaluate artifact rules per node
    ///
    /// # Returns
    ///
    /// Names of the variables the rules read.
    fn apply_artifacts(&self, context: ContextId, nodes: &mut [NavNode]) -> Result<BTreeSet<String>> {
        let rules = self.env.rules.artifact_rules();
        if rules.is_empty() || nodes.is_empty() {
            return Ok(BTreeSet::new());
        }
        let tracked = TrackedVariables::new(self.env.variables.clone());
        let parent = self.context(context).parent_node.as_ref();
        for node in nodes.iter_mut() {
            let mut artifacts = BTreeMap::new();
            for rule in &rules {
                if let Some(class) = &rule.class {
                    let matches = node
                        .key
                        .class_name
                        .as_deref()
                        .is_some_and(|name| self.env.schema.is_a(name, class));
                    if !matches {
                        continue;
                    }
                }
                let expression_context = ExpressionContext::new(&tracked).with_node(node).with_parent(parent);
                let captured: Result<Option<BTreeMap<String, serde_json::Value>>> = (|| {
                    if let Some(condition) = &rule.condition {
                        if !self.env.evaluator.evaluate_bool(condition, &expression_context)? {
                            return Ok(None);
                        }
                    }
                    let mut values = BTreeMap::new();
                    for (name, expression) in &rule.items {
                        values.insert(
                            name.clone(),
                            self.env.evaluator.evaluate_value(expression, &expression_context)?,
                        );
                    }
                    Ok(Some(values))
                })();
                match captured {
                    Ok(Some(values)) => artifacts.extend(values),
                    Ok(None) => {}
                    Err(err) => tracing::warn!(node = %node.label, error = %err, "artifact rule failed"),
                }
            }
            node.extended.artifacts.extend(artifacts);
        }
        Ok(tracked.used_names())
    }

    /// Answer `has_nodes` with an `EXISTS` query when the count is stable
    /// and the context only needs a bounded probe
    fn probe_exists(&mut self, context: ContextId, provider: &mut DataSourceProvider) -> Result<Option<bool>> {
        let NodeSource::Query(query) = &provider.source else {
            return Ok(None);
        };
        let flags: ProviderFlags = self.flags(context);
        if flags.max_nodes_to_load.is_none() && flags.disable_full_load != Some(true) {
            return Ok(None);
        }
        let ctx = self.context(context);
        if !count_is_stable(ctx.specification.as_ref(), &query.branches)
            || !self.env.rules.artifact_rules().is_empty()
        {
            return Ok(None);
        }
        let (sql, bindings) = query.exists_query();
        let exists = self.env.store.query_scalar(&sql, &bindings, &self.env.cancel)? != 0;

        let identifier = provider.identifier(ctx, &self.env)?;
        let lock = ctx.lock.clone();
        let cache = self.env.cache.clone();
        let variables = self.env.variables.clone();
        let existing = get_result_or_lock(&lock, || cache.find_data_source(&identifier, &variables))?;
        let info = match existing {
            Some(mut info) => {
                if info.has_nodes != Some(exists) {
                    info.has_nodes = Some(exists);
                    cache.update(&info, parts::HAS_NODES)?;
                }
                info
            }
            None => {
                let mut info = DataSourceInfo::new(identifier, ctx.related_variables(&variables));
                info.parent_id = provider.parent_data_source;
                info.specification_hash = ctx.specification.as_ref().map(ChildNodeSpecification::hash);
                info.select_classes = select_classes(query);
                info.has_nodes = Some(exists);
                let written = cache.cache_data_source(&mut info);
                lock.unlock();
                written?;
                info
            }
        };
        tracing::debug!(data_source = %info.id, exists, "probed data source");
        provider.info = Some(info);
        provider.has_nodes = Some(exists);
        Ok(Some(exists))
    }

    // ========================================================================
    // Visibility
    // ========================================================================

    fn resolve_entry(
        &mut self,
        context: ContextId,
        provider: &mut DataSourceProvider,
        position: usize,
    ) -> Result<Resolved> {
        let entry = provider
            .nodes
            .as_ref()
            .and_then(|nodes| nodes.get(position))
            .ok_or_else(|| HierarchyError::invariant(format!("no loaded node at {}", position)))?;
        if let Some(resolved) = &entry.resolved {
            return Ok(resolved.clone());
        }
        let cached = entry.cached.clone();
        let resolved = self.resolve_visibility(context, cached)?;
        if let Some(entry) = provider.nodes.as_mut().and_then(|nodes| nodes.get_mut(position)) {
            entry.resolved = Some(resolved.clone());
        }
        Ok(resolved)
    }

    fn resolve_visibility(&mut self, context: ContextId, cached: CachedNode) -> Result<Resolved> {
        let cache = self.env.cache.clone();
        match cached.visibility {
            NodeVisibility::Hidden => Ok(Resolved::Skip),
            NodeVisibility::Virtual => Ok(Resolved::Expand(self.virtual_children(context, cached.node)?)),
            NodeVisibility::Visible if cached.is_initialized => Ok(Resolved::Node(cached.node)),
            NodeVisibility::Visible => {
                let node = cached.node;
                if yields_to_children(&node) {
                    cache.make_virtual(node.id)?;
                    tracing::debug!(node = %node.label, "node made virtual");
                    return Ok(Resolved::Expand(self.virtual_children(context, node)?));
                }
                if let Some(expression) = node.extended.hide_expression.clone() {
                    if self.hide_expression_holds(context, &node, &expression, cached.data_source_id)? {
                        cache.make_hidden(node.id)?;
                        return Ok(Resolved::Skip);
                    }
                }
                if node.extended.hide_if_no_children
                    && NodesFinalizer::determine_children(self, context, &node)? == HasChildren::No
                {
                    cache.make_hidden(node.id)?;
                    return Ok(Resolved::Skip);
                }
                cache.set_node_initialized(node.id)?;
                Ok(Resolved::Node(node))
            }
        }
    }

    fn hide_expression_holds(
        &self,
        context: ContextId,
        node: &NavNode,
        expression: &str,
        data_source_id: Uuid,
    ) -> Result<bool> {
        let tracked = TrackedVariables::new(self.env.variables.clone());
        let parent = self.context(context).parent_node.as_ref();
        let expression_context = ExpressionContext::new(&tracked).with_node(node).with_parent(parent);
        let hidden = match self.env.evaluator.evaluate_bool(expression, &expression_context) {
            Ok(hidden) => hidden,
            Err(err) => {
                tracing::warn!(node = %node.label, error = %err, "hide expression failed, node stays visible");
                false
            }
        };
        let used = tracked.used_names();
        if !used.is_empty() {
            self.env
                .cache
                .update_related_variables(data_source_id, &self.env.variables.subset(&used))?;
        }
        Ok(hidden)
    }

    /// Children provider read in place of a virtual node
    fn virtual_children(&mut self, context: ContextId, node: NavNode) -> Result<ProviderId> {
        let flags = ProviderFlags {
            disable_post_processing: Some(true),
            ..ProviderFlags::default()
        };
        self.create_hierarchy_level_provider(Some(context), LevelParent::virtual_node(node), flags)
    }

    fn resolved_total(&mut self, context: ContextId, provider: &mut DataSourceProvider) -> Result<usize> {
        if let Some(partials) = provider.partials.clone() {
            let mut total = 0;
            for partial in partials {
                total += self.total_count(partial)?.count;
            }
            return Ok(total);
        }
        let mut total = 0;
        let mut used = BTreeSet::new();
        for position in 0..provider.nodes.as_ref().map_or(0, Vec::len) {
            match self.resolve_entry(context, provider, position)? {
                Resolved::Node(_) => total += 1,
                Resolved::Skip => {}
                Resolved::Expand(children) => {
                    total += self.total_count(children)?.count;
                    let children_context = self.context_of(children)?;
                    used.extend(self.context(children_context).used_variables.iter().cloned());
                }
            }
        }
        // counts through virtual nodes depend on the variables their levels read
        if let (Some(info), false) = (&provider.info, used.is_empty()) {
            self.env
                .cache
                .update_related_variables(info.id, &self.env.variables.subset(&used))?;
        }
        Ok(total)
    }

    fn resolved_has_nodes(&mut self, context: ContextId, provider: &mut DataSourceProvider) -> Result<bool> {
        if let Some(partials) = provider.partials.clone() {
            for partial in partials {
                if self.has_nodes(partial)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        for position in 0..provider.nodes.as_ref().map_or(0, Vec::len) {
            match self.resolve_entry(context, provider, position)? {
                Resolved::Node(_) => return Ok(true),
                Resolved::Skip => {}
                Resolved::Expand(children) => {
                    if self.has_nodes(children)? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

fn select_classes(query: &NavigationQuery) -> Vec<DataSourceClass> {
    query
        .classes
        .iter()
        .map(|class_name| DataSourceClass {
            class_name: class_name.clone(),
            polymorphic: false,
        })
        .collect()
}
