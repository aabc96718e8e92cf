//! Provider arena
//!
//! Providers and their contexts live in two vectors owned by one
//! [`ProviderArena`] per request and refer to each other by index. A provider
//! never holds a reference to its parent; ancestry is the list of context
//! indices from the root down.

use uuid::Uuid;

use crate::error::{HierarchyError, Result};
use crate::models::{DataSourceIdentifier, NavNode};

use super::context::{ContextId, ProviderContext, ProviderEnv, ProviderFlags};
use super::cursor::NodeCursor;
use super::data_source::DataSourceProvider;
use super::paging::{paged_count, split_page, CountInfo, PageOptions};

/// Index of a provider inside a [`ProviderArena`]
pub type ProviderId = usize;

/// Initialization progress of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitState {
    #[default]
    Uninitialized,
    /// Counts are known but nodes were not loaded
    PartiallyInitialized,
    FullyInitialized,
}

/// The provider variants
pub enum ProviderKind {
    /// Nodes of one data source
    DataSource(Box<DataSourceProvider>),
    /// Concatenation of child providers
    Multi(Vec<ProviderId>),
    /// Replaces a lone label-grouping node with its children
    LabelCollapse {
        inner: ProviderId,
        output: Option<ProviderId>,
    },
    /// Merges flagged instance nodes sharing a label
    SameLabelMerge {
        inner: ProviderId,
        merged: Option<Vec<NavNode>>,
    },
    /// Determines children and applies customization to every node it yields
    Finalizing { inner: ProviderId },
    /// A data source temporarily taken out of its slot
    Busy,
}

pub struct ProviderSlot {
    pub context: ContextId,
    pub kind: ProviderKind,
    pub page: PageOptions,
    pub state: InitState,
}

/// Cheap copy of a slot's variant, so dispatch does not hold a borrow
enum Shape {
    DataSource,
    Multi(Vec<ProviderId>),
    LabelCollapse(ProviderId),
    SameLabelMerge(ProviderId),
    Finalizing(ProviderId),
}

/// Owner of every provider and context of one request
pub struct ProviderArena {
    pub(crate) env: ProviderEnv,
    contexts: Vec<ProviderContext>,
    slots: Vec<ProviderSlot>,
}

impl ProviderArena {
    pub fn new(env: ProviderEnv) -> Self {
        Self {
            env,
            contexts: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn env(&self) -> &ProviderEnv {
        &self.env
    }

    pub fn provider_count(&self) -> usize {
        self.slots.len()
    }

    // ========================================================================
    // Contexts
    // ========================================================================

    /// Register a context below `parent`
    pub fn add_context(&mut self, parent: Option<ContextId>, mut context: ProviderContext) -> ContextId {
        context.parent = parent;
        context.ancestry = match parent {
            Some(parent) => {
                let mut ancestry = self.contexts[parent].ancestry.clone();
                ancestry.push(parent);
                ancestry
            }
            None => Vec::new(),
        };
        self.contexts.push(context);
        self.contexts.len() - 1
    }

    pub fn context(&self, id: ContextId) -> &ProviderContext {
        &self.contexts[id]
    }

    pub fn context_mut(&mut self, id: ContextId) -> &mut ProviderContext {
        &mut self.contexts[id]
    }

    /// Effective flags of a context: its own overrides, then its ancestors'
    pub fn flags(&self, id: ContextId) -> ProviderFlags {
        let context = &self.contexts[id];
        let chain = std::iter::once(context).chain(context.ancestry.iter().rev().map(|id| &self.contexts[*id]));
        let mut flags = ProviderFlags::default();
        for context in chain {
            flags.max_nodes_to_load = flags.max_nodes_to_load.or(context.flags.max_nodes_to_load);
            flags.disable_full_load = flags.disable_full_load.or(context.flags.disable_full_load);
            flags.disable_post_processing = flags
                .disable_post_processing
                .or(context.flags.disable_post_processing);
        }
        flags
    }

    // ========================================================================
    // Slots
    // ========================================================================

    pub(crate) fn add_provider(&mut self, context: ContextId, kind: ProviderKind) -> ProviderId {
        self.slots.push(ProviderSlot {
            context,
            kind,
            page: PageOptions::default(),
            state: InitState::Uninitialized,
        });
        self.slots.len() - 1
    }

    fn slot(&self, id: ProviderId) -> Result<&ProviderSlot> {
        self.slots
            .get(id)
            .ok_or_else(|| HierarchyError::invariant(format!("provider {} does not exist", id)))
    }

    pub(crate) fn slot_mut(&mut self, id: ProviderId) -> Result<&mut ProviderSlot> {
        self.slots
            .get_mut(id)
            .ok_or_else(|| HierarchyError::invariant(format!("provider {} does not exist", id)))
    }

    pub fn context_of(&self, id: ProviderId) -> Result<ContextId> {
        Ok(self.slot(id)?.context)
    }

    pub fn state(&self, id: ProviderId) -> Result<InitState> {
        Ok(self.slot(id)?.state)
    }

    pub(crate) fn set_state(&mut self, id: ProviderId, state: InitState) -> Result<()> {
        self.slot_mut(id)?.state = state;
        Ok(())
    }

    pub fn page(&self, id: ProviderId) -> Result<PageOptions> {
        Ok(self.slot(id)?.page)
    }

    /// Change the page a provider reads
    ///
    /// A data source whose page changes drops its loaded nodes and starts over
    /// from the cache.
    pub fn set_page(&mut self, id: ProviderId, page: PageOptions) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if slot.page == page {
            return Ok(());
        }
        slot.page = page;
        slot.state = InitState::Uninitialized;
        if let ProviderKind::DataSource(provider) = &mut slot.kind {
            provider.reset();
        }
        Ok(())
    }

    fn shape(&self, id: ProviderId) -> Result<Shape> {
        match &self.slot(id)?.kind {
            ProviderKind::DataSource(_) => Ok(Shape::DataSource),
            ProviderKind::Multi(children) => Ok(Shape::Multi(children.clone())),
            ProviderKind::LabelCollapse { inner, .. } => Ok(Shape::LabelCollapse(*inner)),
            ProviderKind::SameLabelMerge { inner, .. } => Ok(Shape::SameLabelMerge(*inner)),
            ProviderKind::Finalizing { inner } => Ok(Shape::Finalizing(*inner)),
            ProviderKind::Busy => Err(HierarchyError::invariant(format!("provider {} re-entered", id))),
        }
    }

    /// Run `f` on a data source provider taken out of its slot
    ///
    /// The provider is put back even when `f` fails.
    pub(crate) fn with_data_source<T, F>(&mut self, id: ProviderId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ProviderArena, ContextId, &mut DataSourceProvider) -> Result<T>,
    {
        let slot = self.slot_mut(id)?;
        let context = slot.context;
        let mut provider = match std::mem::replace(&mut slot.kind, ProviderKind::Busy) {
            ProviderKind::DataSource(provider) => provider,
            other => {
                slot.kind = other;
                return Err(HierarchyError::invariant(format!("provider {} is not a data source", id)));
            }
        };
        let result = f(self, context, &mut provider);
        self.slots[id].kind = ProviderKind::DataSource(provider);
        result
    }

    // ========================================================================
    // Provider operations
    // ========================================================================

    /// Number of nodes the provider yields, ignoring its page
    pub fn total_count(&mut self, id: ProviderId) -> Result<CountInfo> {
        self.env.cancel.check()?;
        match self.shape(id)? {
            Shape::DataSource => self.data_source_total(id),
            Shape::Multi(children) => {
                let mut total = CountInfo::exact(0);
                for child in children {
                    let count = self.total_count(child)?;
                    total.count += count.count;
                    total.is_accurate &= count.is_accurate;
                }
                self.set_state(id, InitState::PartiallyInitialized)?;
                Ok(total)
            }
            Shape::LabelCollapse(_) => {
                let output = self.collapse_output(id)?;
                self.total_count(output)
            }
            Shape::SameLabelMerge(_) => Ok(CountInfo::exact(self.merged_nodes(id)?.len())),
            Shape::Finalizing(inner) => self.total_count(inner),
        }
    }

    /// Number of nodes within the provider's page
    pub fn count(&mut self, id: ProviderId) -> Result<usize> {
        let page = self.page(id)?;
        let total = self.total_count(id)?;
        Ok(paged_count(total.count, page))
    }

    /// Whether the provider yields at least one node
    pub fn has_nodes(&mut self, id: ProviderId) -> Result<bool> {
        self.env.cancel.check()?;
        match self.shape(id)? {
            Shape::DataSource => self.data_source_has_nodes(id),
            Shape::Multi(children) => {
                for child in children {
                    if self.has_nodes(child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            // a collapsed label group stands for at least two instances
            Shape::LabelCollapse(inner) | Shape::SameLabelMerge(inner) | Shape::Finalizing(inner) => {
                self.has_nodes(inner)
            }
        }
    }

    /// Nodes within the provider's page
    pub fn nodes(&mut self, id: ProviderId) -> Result<Vec<NavNode>> {
        let page = self.page(id)?;
        if page.size == Some(0) {
            return Ok(Vec::new());
        }
        self.read_range(id, page.start, page.size)
    }

    /// Node at `index` within the provider's page
    pub fn node_at(&mut self, id: ProviderId, index: usize) -> Result<Option<NavNode>> {
        let page = self.page(id)?;
        if page.size.is_some_and(|size| index >= size) {
            return Ok(None);
        }
        Ok(self.read_range(id, page.start + index, Some(1))?.into_iter().next())
    }

    pub fn cursor(&self, id: ProviderId) -> NodeCursor {
        NodeCursor::new(id)
    }

    /// Read `size` nodes (or all) starting at `start`, ignoring the page
    pub(crate) fn read_range(&mut self, id: ProviderId, start: usize, size: Option<usize>) -> Result<Vec<NavNode>> {
        self.env.cancel.check()?;
        match self.shape(id)? {
            Shape::DataSource => self.data_source_range(id, start, size),
            Shape::Multi(children) => {
                let nodes = self.read_children(&children, start, size)?;
                self.set_state(id, InitState::FullyInitialized)?;
                Ok(nodes)
            }
            Shape::LabelCollapse(_) => {
                let output = self.collapse_output(id)?;
                self.read_range(output, start, size)
            }
            Shape::SameLabelMerge(_) => {
                let merged = self.merged_nodes(id)?;
                Ok(merged
                    .into_iter()
                    .skip(start)
                    .take(size.unwrap_or(usize::MAX))
                    .collect())
            }
            Shape::Finalizing(inner) => {
                let context = self.context_of(id)?;
                let mut nodes = self.read_range(inner, start, size)?;
                for node in &mut nodes {
                    crate::finalizer::NodesFinalizer::finalize(self, context, node)?;
                }
                Ok(nodes)
            }
        }
    }

    /// Read a range across consecutive child providers
    pub(crate) fn read_children(
        &mut self,
        children: &[ProviderId],
        start: usize,
        size: Option<usize>,
    ) -> Result<Vec<NavNode>> {
        let mut nodes = Vec::new();
        if start == 0 && size.is_none() {
            for child in children {
                nodes.extend(self.read_range(*child, 0, None)?);
            }
            return Ok(nodes);
        }
        let mut counts = Vec::with_capacity(children.len());
        for child in children {
            counts.push(self.total_count(*child)?.count);
        }
        for (child, page) in children.iter().zip(split_page(&counts, PageOptions { start, size })) {
            if page.size == Some(0) {
                continue;
            }
            nodes.extend(self.read_range(*child, page.start, page.size)?);
        }
        Ok(nodes)
    }

    /// Find a node by id among everything the provider yields
    pub fn find_node(&mut self, id: ProviderId, node_id: Uuid) -> Result<Option<NavNode>> {
        match self.shape(id)? {
            Shape::DataSource => self.data_source_find(id, node_id),
            Shape::Multi(children) => {
                for child in children {
                    if let Some(node) = self.find_node(child, node_id)? {
                        return Ok(Some(node));
                    }
                }
                Ok(None)
            }
            Shape::LabelCollapse(_) => {
                let output = self.collapse_output(id)?;
                self.find_node(output, node_id)
            }
            Shape::SameLabelMerge(_) => Ok(self.merged_nodes(id)?.into_iter().find(|node| node.id == node_id)),
            Shape::Finalizing(inner) => self.find_node(inner, node_id),
        }
    }

    /// Cache identity of a data source provider
    pub fn identifier(&self, id: ProviderId) -> Result<Option<DataSourceIdentifier>> {
        let slot = self.slot(id)?;
        match &slot.kind {
            ProviderKind::DataSource(provider) => match &provider.info {
                Some(info) => Ok(Some(info.identifier.clone())),
                None => Ok(Some(provider.identifier(&self.contexts[slot.context], &self.env)?)),
            },
            _ => Ok(None),
        }
    }

    /// Wrap a provider so every node it yields is finalized
    pub fn finalizing(&mut self, inner: ProviderId) -> Result<ProviderId> {
        let context = self.context_of(inner)?;
        Ok(self.add_provider(context, ProviderKind::Finalizing { inner }))
    }
}
