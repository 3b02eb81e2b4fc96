//! The set of known execution nodes.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{Load, Node, NodeId, NodeSnapshot, NodeStatus};

/// All registered nodes, keyed by id.
///
/// Readers never iterate under the lock: every query clones the node list
/// first and then inspects each node under its own mutex, so a slow node
/// lock never blocks registration.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, returning the one it replaced.
    pub fn register(&self, node: Arc<Node>) -> Option<Arc<Node>> {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.id().clone(), node)
    }

    pub fn deregister(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// All nodes with a consistent snapshot each, lowest load first.
    ///
    /// Equal loads are ordered by node id so passes are deterministic.
    pub fn by_load(&self) -> Vec<(Arc<Node>, NodeSnapshot)> {
        let mut nodes: Vec<_> = self
            .all()
            .into_iter()
            .map(|n| {
                let snapshot = n.snapshot();
                (n, snapshot)
            })
            .collect();
        nodes.sort_by(|(a, sa), (b, sb)| sa.load.cmp(&sb.load).then_with(|| a.id().cmp(b.id())));
        nodes
    }

    /// Nodes that can take a `FLASH` sub-test: not in maintenance, with a
    /// spare slot and at least one free product.
    pub fn flash_candidates(
        &self,
        max_per_node: usize,
        pinned: Option<&str>,
    ) -> Vec<(Arc<Node>, NodeSnapshot)> {
        self.by_load()
            .into_iter()
            .filter(|(n, s)| {
                pinned.is_none_or(|p| n.id().as_str() == p)
                    && !s.maintenance
                    && s.running < max_per_node
                    && !s.free.is_empty()
            })
            .collect()
    }

    /// The least-loaded node with a spare slot, for `NOSE` sub-tests.
    pub fn first_with_capacity(
        &self,
        max_per_node: usize,
        pinned: Option<&str>,
    ) -> Option<Arc<Node>> {
        self.by_load()
            .into_iter()
            .find(|(n, s)| {
                pinned.is_none_or(|p| n.id().as_str() == p)
                    && !s.maintenance
                    && s.running < max_per_node
            })
            .map(|(n, _)| n)
    }

    /// The node a product is attached to, in any collection.
    pub fn find_product(&self, imei: &str) -> Option<Arc<Node>> {
        self.all().into_iter().find(|n| n.has_product(imei))
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses: Vec<_> = self.all().iter().map(|n| n.status()).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn loads(&self) -> Vec<(NodeId, Load)> {
        self.by_load()
            .into_iter()
            .map(|(n, s)| (n.id().clone(), s.load))
            .collect()
    }
}
