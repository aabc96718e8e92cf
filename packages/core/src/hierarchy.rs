//! Hierarchy Manager - request entry point
//!
//! [`HierarchyManager`] ties the instance store, the hierarchy cache, the
//! schema and the registered rulesets together. Every request builds a fresh
//! [`ProviderArena`]; everything durable lives in the cache, so concurrent
//! requests share materialized levels.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use hierarchy_core::lookup::{Ruleset, SchemaCatalog};
//! use hierarchy_core::store::InstanceStore;
//! use hierarchy_core::{HierarchyCache, HierarchyConfig, HierarchyManager, HierarchyRequest};
//! use serde_json::json;
//!
//! # fn main() -> hierarchy_core::Result<()> {
//! let store = Arc::new(InstanceStore::open_in_memory()?);
//! store.insert_instance("w1", "Widget", "Gear", &json!({}))?;
//! let cache = Arc::new(HierarchyCache::open_in_memory(HierarchyConfig::default())?);
//! let schema = Arc::new(SchemaCatalog::new().with_class("Widget", "Widget", &[]));
//!
//! let manager = HierarchyManager::new(cache, store, schema);
//! manager.register_ruleset(Arc::new(Ruleset::from_json_str(
//!     &json!({
//!         "id": "widgets",
//!         "rootRules": [{ "specifications": [{
//!             "id": "all-widgets",
//!             "kind": { "type": "instancesOfSpecificClasses", "classes": ["Widget"] },
//!             "hasChildren": "never"
//!         }]}]
//!     })
//!     .to_string(),
//! )?))?;
//!
//! let nodes = manager.get_children(&HierarchyRequest::new("widgets"))?;
//! assert_eq!(nodes.len(), 1);
//! assert_eq!(nodes[0].label, "Gear");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::cache::HierarchyCache;
use crate::cancel::CancellationToken;
use crate::error::{HierarchyError, Result};
use crate::lookup::{ExpressionEvaluator, RulesLookup, SchemaLookup, SimpleExpressionEvaluator};
use crate::models::{CombinedHierarchyLevelIdentifier, NavNode, RulesetVariables};
use crate::providers::{LevelParent, PageOptions, ProviderArena, ProviderEnv, ProviderFlags, ProviderId};
use crate::store::InstanceStore;

/// One hierarchy level request
#[derive(Debug, Clone)]
pub struct HierarchyRequest {
    pub ruleset_id: String,

    /// Node whose children are requested; `None` for root nodes
    pub parent_id: Option<Uuid>,

    pub variables: RulesetVariables,
    pub page: Option<PageOptions>,
    pub cancel: CancellationToken,
    pub instance_filter: Option<String>,
    pub result_set_size_limit: Option<usize>,
}

impl HierarchyRequest {
    pub fn new(ruleset_id: impl Into<String>) -> Self {
        Self {
            ruleset_id: ruleset_id.into(),
            parent_id: None,
            variables: RulesetVariables::new(),
            page: None,
            cancel: CancellationToken::new(),
            instance_filter: None,
            result_set_size_limit: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_variables(mut self, variables: RulesetVariables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_page(mut self, page: PageOptions) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Restrict instances with a SQL predicate over the `this` alias
    pub fn with_instance_filter(mut self, filter: impl Into<String>) -> Self {
        self.instance_filter = Some(filter.into());
        self
    }

    pub fn with_result_set_size_limit(mut self, limit: usize) -> Self {
        self.result_set_size_limit = Some(limit);
        self
    }
}

type RulesetMap = HashMap<String, Arc<dyn RulesLookup>>;

/// Entry point for hierarchy requests and cache invalidation
#[derive(Clone)]
pub struct HierarchyManager {
    cache: Arc<HierarchyCache>,
    store: Arc<InstanceStore>,
    schema: Arc<dyn SchemaLookup>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    rulesets: Arc<RwLock<RulesetMap>>,
}

impl HierarchyManager {
    pub fn new(cache: Arc<HierarchyCache>, store: Arc<InstanceStore>, schema: Arc<dyn SchemaLookup>) -> Self {
        Self {
            cache,
            store,
            schema,
            evaluator: Arc::new(SimpleExpressionEvaluator::new()),
            rulesets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the expression evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn cache(&self) -> &Arc<HierarchyCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    // ========================================================================
    // Rulesets
    // ========================================================================

    /// Register (or replace) a ruleset under its id
    pub fn register_ruleset(&self, rules: Arc<dyn RulesLookup>) -> Result<()> {
        let id = rules.ruleset_id().to_string();
        self.rulesets
            .write()
            .map_err(|_| HierarchyError::invariant("ruleset registry lock poisoned"))?
            .insert(id.clone(), rules);
        tracing::debug!(ruleset = %id, "registered ruleset");
        Ok(())
    }

    pub fn remove_ruleset(&self, ruleset_id: &str) -> Result<Option<Arc<dyn RulesLookup>>> {
        Ok(self
            .rulesets
            .write()
            .map_err(|_| HierarchyError::invariant("ruleset registry lock poisoned"))?
            .remove(ruleset_id))
    }

    fn ruleset(&self, ruleset_id: &str) -> Result<Arc<dyn RulesLookup>> {
        self.rulesets
            .read()
            .map_err(|_| HierarchyError::invariant("ruleset registry lock poisoned"))?
            .get(ruleset_id)
            .cloned()
            .ok_or_else(|| HierarchyError::misconfiguration(format!("ruleset '{}' is not registered", ruleset_id)))
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Build the provider tree of the requested level
    ///
    /// The returned provider finalizes every node it yields and reads the
    /// request's page. Use it with [`ProviderArena::cursor`] for incremental
    /// reads.
    ///
    /// # Errors
    ///
    /// - [`HierarchyError::Misconfiguration`] for an unknown ruleset
    /// - [`HierarchyError::Invariant`] when the parent node is not cached
    pub fn open_level(&self, request: &HierarchyRequest) -> Result<(ProviderArena, ProviderId)> {
        let rules = self.ruleset(&request.ruleset_id)?;
        let env = ProviderEnv {
            cache: self.cache.clone(),
            store: self.store.clone(),
            schema: self.schema.clone(),
            rules,
            evaluator: self.evaluator.clone(),
            variables: request.variables.clone(),
            cancel: request.cancel.clone(),
            instance_filter: request.instance_filter.clone(),
            result_set_size_limit: request.result_set_size_limit,
            page_requested: request.page.is_some_and(|page| page.size.is_some()),
        };
        let parent = match request.parent_id {
            None => LevelParent::root(),
            Some(parent_id) => {
                let node = self.cache.get_node(parent_id)?.ok_or_else(|| {
                    HierarchyError::invariant(format!("parent node {} is not in the hierarchy cache", parent_id))
                })?;
                LevelParent::physical(node)
            }
        };

        let mut arena = ProviderArena::new(env);
        let level = arena.create_hierarchy_level_provider(None, parent, ProviderFlags::default())?;
        let provider = arena.finalizing(level)?;
        if let Some(page) = request.page {
            arena.set_page(provider, page)?;
        }
        Ok((arena, provider))
    }

    /// Finalized nodes of the requested level and page
    pub fn get_children(&self, request: &HierarchyRequest) -> Result<Vec<NavNode>> {
        let (mut arena, provider) = self.open_level(request)?;
        let nodes = arena.nodes(provider)?;
        tracing::debug!(
            ruleset = %request.ruleset_id,
            parent = ?request.parent_id,
            nodes = nodes.len(),
            providers = arena.provider_count(),
            "read hierarchy level"
        );
        Ok(nodes)
    }

    /// Number of nodes [`get_children`](Self::get_children) returns for the same request
    pub fn get_children_count(&self, request: &HierarchyRequest) -> Result<usize> {
        let (mut arena, provider) = self.open_level(request)?;
        arena.count(provider)
    }

    pub fn get_node(&self, node_id: Uuid) -> Result<Option<NavNode>> {
        self.cache.get_node(node_id)
    }

    /// Find a cached node by the key hashes of its path from the root
    pub fn locate_node(&self, ruleset_id: &str, path: &[String]) -> Result<Option<NavNode>> {
        self.cache.locate_node(self.store.connection_id(), ruleset_id, path)
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Drop the cached level below `parent_id` (the root level for `None`)
    ///
    /// # Returns
    ///
    /// Number of physical levels removed.
    pub fn invalidate(&self, ruleset_id: &str, parent_id: Option<Uuid>) -> Result<usize> {
        let combined = CombinedHierarchyLevelIdentifier::new(self.store.connection_id(), ruleset_id, parent_id);
        self.remove_level(&combined)
    }

    fn remove_level(&self, combined: &CombinedHierarchyLevelIdentifier) -> Result<usize> {
        let Some(removal_id) = self.cache.create_removal_id(combined)? else {
            return Ok(0);
        };
        let removed = self.cache.remove_hierarchy_level(removal_id)?;
        tracing::info!(
            ruleset = %combined.ruleset_id,
            parent = ?combined.physical_parent_id,
            removed,
            "invalidated hierarchy level"
        );
        Ok(removed)
    }

    /// Drop every cached level of a ruleset
    pub fn clear(&self, ruleset_id: &str) -> Result<usize> {
        let removed = self.cache.clear(ruleset_id)?;
        tracing::info!(ruleset = %ruleset_id, removed, "cleared hierarchy cache");
        Ok(removed)
    }

    /// Drop every level of this store whose data sources select one of `classes`
    pub fn on_instances_changed(&self, classes: &[String]) -> Result<usize> {
        let mut removed = 0;
        for combined in self.cache.levels_using_classes(classes)? {
            if combined.connection_id != self.store.connection_id() {
                continue;
            }
            removed += self.remove_level(&combined)?;
        }
        Ok(removed)
    }
}
