//! Hierarchy level post-processing
//!
//! Two wrappers run over a level's merged provider before consumers see it:
//!
//! - **Same-label merge**: instance nodes flagged by a post-process same-label
//!   grouping rule are merged into the first node carrying the same label;
//!   the others are hidden
//! - **Label-grouping collapse**: a level consisting of exactly one label
//!   grouping node shows the grouped nodes instead; the grouping node becomes
//!   virtual
//!
//! Both decisions are written to the cache, so later requests find the level
//! already in its post-processed shape.

use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::error::{HierarchyError, Result};
use crate::models::{parts, NavNode, NodeKind};
use crate::providers::{ContextId, LevelParent, ProviderArena, ProviderFlags, ProviderId, ProviderKind};

impl ProviderArena {
    /// Wrap a level provider in the post-processing stages
    ///
    /// Contexts with post-processing disabled (probes, children of virtual
    /// nodes) get `inner` back unchanged.
    pub fn post_process(&mut self, context: ContextId, inner: ProviderId, merge_same_label: bool) -> Result<ProviderId> {
        if self.flags(context).disable_post_processing == Some(true) {
            return Ok(inner);
        }
        let mut provider = inner;
        if merge_same_label {
            provider = self.add_provider(
                context,
                ProviderKind::SameLabelMerge {
                    inner: provider,
                    merged: None,
                },
            );
        }
        Ok(self.add_provider(
            context,
            ProviderKind::LabelCollapse {
                inner: provider,
                output: None,
            },
        ))
    }

    /// Provider a label-collapse wrapper reads from, decided on first use
    pub(crate) fn collapse_output(&mut self, id: ProviderId) -> Result<ProviderId> {
        let inner = match &self.slot_mut(id)?.kind {
            ProviderKind::LabelCollapse {
                output: Some(output), ..
            } => return Ok(*output),
            ProviderKind::LabelCollapse { inner, .. } => *inner,
            _ => return Err(HierarchyError::invariant(format!("provider {} is not a label collapse", id))),
        };
        let context = self.context_of(id)?;
        let nodes = self.read_range(inner, 0, Some(2))?;
        let output = match nodes.as_slice() {
            [node] if node.kind() == NodeKind::LabelGrouping => {
                self.env.cache.make_virtual(node.id)?;
                self.forget_total(node.id)?;
                tracing::debug!(node = %node.label, "collapsed lone label grouping node");
                let flags = ProviderFlags {
                    disable_post_processing: Some(true),
                    ..ProviderFlags::default()
                };
                self.create_hierarchy_level_provider(Some(context), LevelParent::virtual_node(node.clone()), flags)?
            }
            _ => inner,
        };
        if let ProviderKind::LabelCollapse { output: slot, .. } = &mut self.slot_mut(id)?.kind {
            *slot = Some(output);
        }
        Ok(output)
    }

    /// Nodes of a same-label merge wrapper, merged on first use
    pub(crate) fn merged_nodes(&mut self, id: ProviderId) -> Result<Vec<NavNode>> {
        let inner = match &self.slot_mut(id)?.kind {
            ProviderKind::SameLabelMerge {
                merged: Some(merged), ..
            } => return Ok(merged.clone()),
            ProviderKind::SameLabelMerge { inner, .. } => *inner,
            _ => return Err(HierarchyError::invariant(format!("provider {} is not a same-label merge", id))),
        };

        let mut merged: Vec<NavNode> = Vec::new();
        let mut by_label: HashMap<String, usize> = HashMap::new();
        let mut targets = BTreeSet::new();
        let mut hidden = Vec::new();
        for node in self.read_range(inner, 0, None)? {
            if node.extended.merge_same_label && node.kind() == NodeKind::Instance {
                if let Some(&target) = by_label.get(&node.label) {
                    let target_node = &mut merged[target];
                    let mut keys = target_node.key.instance_keys.clone();
                    keys.extend(node.key.instance_keys.iter().cloned());
                    target_node.key.set_instance_keys(keys);
                    targets.insert(target);
                    hidden.push(node.id);
                    continue;
                }
                by_label.insert(node.label.clone(), merged.len());
            }
            merged.push(node);
        }

        for target in &targets {
            self.env.cache.update_node(&merged[*target])?;
        }
        for node_id in &hidden {
            self.env.cache.make_hidden(*node_id)?;
            self.forget_total(*node_id)?;
        }
        if !hidden.is_empty() {
            tracing::debug!(merged = hidden.len(), "merged same-label instance nodes");
        }

        if let ProviderKind::SameLabelMerge { merged: slot, .. } = &mut self.slot_mut(id)?.kind {
            *slot = Some(merged.clone());
        }
        Ok(merged)
    }

    /// Drop the stored total of the data source holding `node_id`
    ///
    /// Needed whenever a node stops counting as one visible node.
    fn forget_total(&self, node_id: Uuid) -> Result<()> {
        let Some(cached) = self.env.cache.get_cached_node(node_id)? else {
            tracing::warn!(node = %node_id, "node vanished before its data source total was reset");
            return Ok(());
        };
        if let Some(mut info) = self.env.cache.get_data_source(cached.data_source_id)? {
            if info.total_nodes_count.is_some() {
                info.total_nodes_count = None;
                self.env.cache.update(&info, parts::TOTAL_NODES_COUNT)?;
            }
        }
        Ok(())
    }
}
