//! Bounded in-memory node cache in front of the persistent node table

use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use super::CachedNode;

/// FIFO-evicting map of recently read nodes
#[derive(Debug)]
pub struct QuickNodeCache {
    capacity: usize,
    nodes: HashMap<Uuid, CachedNode>,
    order: VecDeque<Uuid>,
}

impl QuickNodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&CachedNode> {
        self.nodes.get(id)
    }

    pub fn insert(&mut self, node: CachedNode) {
        if self.capacity == 0 {
            return;
        }
        let id = node.node.id;
        if self.nodes.insert(id, node).is_none() {
            self.order.push_back(id);
        }
        while self.nodes.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.nodes.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn remove(&mut self, id: &Uuid) {
        if self.nodes.remove(id).is_some() {
            self.order.retain(|queued| queued != id);
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeVisibility;
    use crate::models::{NavNode, NodeKey};

    fn cached(label: &str) -> CachedNode {
        let mut node = NavNode::new(NodeKey::custom("s", "t"), label);
        node.id = Uuid::new_v4();
        CachedNode {
            node,
            data_source_id: Uuid::new_v4(),
            index: 0,
            visibility: NodeVisibility::Visible,
            is_initialized: false,
        }
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut quick = QuickNodeCache::new(2);
        let a = cached("a");
        let b = cached("b");
        let c = cached("c");
        let (a_id, b_id, c_id) = (a.node.id, b.node.id, c.node.id);

        quick.insert(a);
        quick.insert(b);
        quick.insert(c);

        assert_eq!(quick.len(), 2);
        assert!(quick.get(&a_id).is_none());
        assert!(quick.get(&b_id).is_some());
        assert!(quick.get(&c_id).is_some());
    }

    #[test]
    fn test_remove_and_zero_capacity() {
        let mut quick = QuickNodeCache::new(4);
        let a = cached("a");
        let id = a.node.id;
        quick.insert(a);
        quick.remove(&id);
        assert!(quick.is_empty());

        let mut disabled = QuickNodeCache::new(0);
        disabled.insert(cached("x"));
        assert!(disabled.is_empty());
    }
}
