//! Bidirectional cursor over a provider's page

use crate::error::Result;
use crate::models::NavNode;

use super::arena::{ProviderArena, ProviderId};

/// Position over the nodes of one provider
///
/// The cursor only holds an index; every step reads through the arena, so
/// cursors stay valid while the provider loads lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCursor {
    provider: ProviderId,

    /// `None` before the first node
    position: Option<usize>,
}

impl NodeCursor {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            position: None,
        }
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Advance and return the node there, or `None` past the end
    pub fn next(&mut self, arena: &mut ProviderArena) -> Result<Option<NavNode>> {
        let position = self.position.map_or(0, |position| position + 1);
        let node = arena.node_at(self.provider, position)?;
        if node.is_some() {
            self.position = Some(position);
        }
        Ok(node)
    }

    /// Step back and return the node there, or `None` before the start
    pub fn prev(&mut self, arena: &mut ProviderArena) -> Result<Option<NavNode>> {
        let Some(position) = self.position.and_then(|position| position.checked_sub(1)) else {
            self.position = None;
            return Ok(None);
        };
        let node = arena.node_at(self.provider, position)?;
        self.position = Some(position);
        Ok(node)
    }
}
