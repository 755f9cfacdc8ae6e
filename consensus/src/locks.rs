use std::collections::HashMap;

use network::NodeId;
use storage::ItemId;

/// Advisory per-resource locks held by the leader.
///
/// There is no queue and no lease: a denied request must retry on its own,
/// and a holder that dies without releasing keeps the resource locked until
/// leadership moves to another node.
#[derive(Debug, Default)]
pub struct LockTable {
    holders: HashMap<ItemId, NodeId>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `resource` to `requester` if nobody holds it.
    pub fn acquire(&mut self, resource: ItemId, requester: NodeId) -> bool {
        if self.holders.contains_key(&resource) {
            return false;
        }
        self.holders.insert(resource, requester);
        true
    }

    /// Releases `resource` only when `requester` is the holder.
    pub fn release(&mut self, resource: ItemId, requester: NodeId) -> bool {
        match self.holders.get(&resource) {
            Some(holder) if *holder == requester => {
                self.holders.remove(&resource);
                true
            }
            _ => false,
        }
    }

    pub fn holder(&self, resource: ItemId) -> Option<NodeId> {
        self.holders.get(&resource).copied()
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_denied() {
        let mut table = LockTable::new();
        assert!(table.acquire(10, NodeId(1)));
        assert!(!table.acquire(10, NodeId(2)));
        assert!(!table.acquire(10, NodeId(1)));
        assert_eq!(table.holder(10), Some(NodeId(1)));
        assert!(table.acquire(11, NodeId(2)));
    }

    #[test]
    fn only_holder_releases() {
        let mut table = LockTable::new();
        table.acquire(10, NodeId(1));

        assert!(!table.release(10, NodeId(2)));
        assert_eq!(table.holder(10), Some(NodeId(1)));

        assert!(table.release(10, NodeId(1)));
        assert!(table.is_empty());
        assert!(!table.release(10, NodeId(1)));
        assert!(table.acquire(10, NodeId(2)));
    }
}
