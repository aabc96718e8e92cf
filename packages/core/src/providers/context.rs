//! Provider environment and per-level contexts

use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::{HierarchyCache, LockPolicy};
use crate::cancel::CancellationToken;
use crate::config::HierarchyConfig;
use crate::lookup::{ExpressionEvaluator, RulesLookup, SchemaLookup};
use crate::models::{
    ChildNodeSpecification, HierarchyLevelIdentifier, NavNode, RulesetVariables,
};
use crate::query::GroupingHandler;
use crate::store::InstanceStore;

/// Index of a context inside a [`ProviderArena`](super::ProviderArena)
pub type ContextId = usize;

/// Services and request inputs shared by every provider of one request
#[derive(Clone)]
pub struct ProviderEnv {
    pub cache: Arc<HierarchyCache>,
    pub store: Arc<InstanceStore>,
    pub schema: Arc<dyn SchemaLookup>,
    pub rules: Arc<dyn RulesLookup>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub variables: RulesetVariables,
    pub cancel: CancellationToken,

    /// Request-level instance predicate over the `this` alias
    pub instance_filter: Option<String>,
    pub result_set_size_limit: Option<usize>,

    /// Whether the request reads a bounded page
    pub page_requested: bool,
}

impl ProviderEnv {
    pub fn config(&self) -> &HierarchyConfig {
        self.cache.config()
    }

    pub fn connection_id(&self) -> &str {
        self.store.connection_id()
    }

    pub fn ruleset_id(&self) -> &str {
        self.rules.ruleset_id()
    }
}

/// Scoped provider behaviour overrides
///
/// Unset fields inherit from the nearest ancestor context that sets them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderFlags {
    /// Bound on nodes a probe needs; enables `EXISTS` probes
    pub max_nodes_to_load: Option<usize>,
    pub disable_full_load: Option<bool>,
    pub disable_post_processing: Option<bool>,
}

impl ProviderFlags {
    /// Flags of a children probe: one node is enough and nothing is post-processed
    pub fn probe() -> Self {
        Self {
            max_nodes_to_load: Some(1),
            disable_full_load: Some(true),
            disable_post_processing: Some(true),
        }
    }
}

/// Everything a provider needs to know about where it sits in the hierarchy
pub struct ProviderContext {
    pub parent: Option<ContextId>,

    /// Enclosing contexts, outermost first
    pub ancestry: Vec<ContextId>,

    /// Node whose children this context produces
    pub parent_node: Option<NavNode>,

    /// Nearest displayed ancestor; owns the physical level
    pub physical_parent_id: Option<Uuid>,

    /// Key path of the physical parent
    pub parent_path: Vec<String>,

    /// Virtual ancestors between produced nodes and the physical parent, nearest first
    pub virtual_parent_ids: Vec<Uuid>,

    pub hierarchy_level: Option<HierarchyLevelIdentifier>,
    pub lock: LockPolicy,

    pub specification: Option<ChildNodeSpecification>,
    pub spec_parent: Option<NavNode>,
    pub group_chain: Vec<NavNode>,
    pub handlers: Vec<GroupingHandler>,
    pub merge_same_label: bool,

    pub flags: ProviderFlags,

    /// Variables read while this context's rules were evaluated
    pub used_variables: BTreeSet<String>,
}

impl ProviderContext {
    pub fn new(parent_node: Option<NavNode>, physical_parent_id: Option<Uuid>) -> Self {
        Self {
            parent: None,
            ancestry: Vec::new(),
            parent_node,
            physical_parent_id,
            parent_path: Vec::new(),
            virtual_parent_ids: Vec::new(),
            hierarchy_level: None,
            lock: LockPolicy::default(),
            specification: None,
            spec_parent: None,
            group_chain: Vec::new(),
            handlers: Vec::new(),
            merge_same_label: false,
            flags: ProviderFlags::default(),
            used_variables: BTreeSet::new(),
        }
    }

    /// Copy of the level-wide part of this context, for a specification below it
    pub fn derive(&self) -> Self {
        Self {
            parent: None,
            ancestry: Vec::new(),
            parent_node: self.parent_node.clone(),
            physical_parent_id: self.physical_parent_id,
            parent_path: self.parent_path.clone(),
            virtual_parent_ids: self.virtual_parent_ids.clone(),
            hierarchy_level: self.hierarchy_level.clone(),
            lock: self.lock.clone(),
            specification: None,
            spec_parent: None,
            group_chain: Vec::new(),
            handlers: Vec::new(),
            merge_same_label: false,
            flags: ProviderFlags::default(),
            used_variables: self.used_variables.clone(),
        }
    }

    /// Level of the context
    ///
    /// # Errors
    ///
    /// [`HierarchyError::Invariant`](crate::HierarchyError::Invariant) for a
    /// context that was never attached to a level.
    pub fn level(&self) -> crate::Result<&HierarchyLevelIdentifier> {
        self.hierarchy_level
            .as_ref()
            .ok_or_else(|| crate::HierarchyError::invariant("provider context has no hierarchy level"))
    }

    /// Related variables a data source created in this context records
    pub fn related_variables(&self, variables: &RulesetVariables) -> RulesetVariables {
        variables.subset(&self.used_variables)
    }
}
