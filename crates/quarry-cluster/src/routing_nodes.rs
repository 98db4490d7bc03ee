//! Node-centric view of the routing table
//!
//! `RoutingNodes` inverts the routing table: for every node the shard copies
//! it holds, plus the copies that are not assigned anywhere. Copies of open
//! indices that exist in metadata but not yet in the routing table show up as
//! unassigned, so allocation sees them.

use crate::metadata::Metadata;
use crate::routing::{
    IndexRoutingTable, IndexShardRoutingTable, RoutingTable, ShardRouting, ShardState,
};
use quarry_common::{Error, NodeId, Result, ShardId};
use std::collections::BTreeMap;

/// Shard copies held by one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingNode {
    pub node_id: NodeId,
    pub shards: Vec<ShardRouting>,
}

impl RoutingNode {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            shards: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Whether any copy of `shard_id` lives here
    pub fn holds(&self, shard_id: &ShardId) -> bool {
        self.shards.iter().any(|s| &s.shard_id == shard_id)
    }
}

/// Per-node view of the routing table plus the unassigned list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingNodes {
    nodes: BTreeMap<NodeId, RoutingNode>,
    unassigned: Vec<ShardRouting>,
}

impl RoutingNodes {
    /// Build the view; indices missing from `metadata` are skipped
    pub fn build(routing_table: &RoutingTable, metadata: &Metadata) -> Self {
        let mut view = Self::default();

        for (name, index_table) in &routing_table.indices {
            if !metadata.has_index(name) {
                continue;
            }
            for copy in index_table.all_shards() {
                view.place(copy.clone());
            }
        }

        for index in metadata.open_indices() {
            if routing_table.has_index(&index.name) {
                continue;
            }
            let fresh = IndexRoutingTable::new_unassigned(index);
            view.unassigned.extend(fresh.all_shards().cloned());
        }

        view
    }

    fn place(&mut self, copy: ShardRouting) {
        match copy.current_node {
            Some(node) => self
                .nodes
                .entry(node)
                .or_insert_with(|| RoutingNode::new(node))
                .shards
                .push(copy),
            None => self.unassigned.push(copy),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&RoutingNode> {
        self.nodes.get(id)
    }

    /// Nodes holding at least one copy, in node id order
    pub fn iter(&self) -> impl Iterator<Item = &RoutingNode> {
        self.nodes.values()
    }

    pub fn unassigned(&self) -> &[ShardRouting] {
        &self.unassigned
    }

    /// Number of copies on a node (0 for unknown nodes)
    pub fn node_shard_count(&self, id: &NodeId) -> usize {
        self.nodes.get(id).map_or(0, RoutingNode::len)
    }

    /// Assigned and unassigned copies in `state`
    pub fn shards_with_state(&self, state: ShardState) -> Vec<&ShardRouting> {
        self.nodes
            .values()
            .flat_map(|n| n.shards.iter())
            .chain(self.unassigned.iter())
            .filter(|s| s.state == state)
            .collect()
    }

    /// Total copies in the view
    pub fn total_copies(&self) -> usize {
        self.nodes.values().map(RoutingNode::len).sum::<usize>() + self.unassigned.len()
    }

    /// Register a node with no copies so allocation can target it
    pub fn add_node(&mut self, id: NodeId) {
        self.nodes.entry(id).or_insert_with(|| RoutingNode::new(id));
    }

    /// Take every copy off `id` and return them, leaving them unplaced
    pub fn remove_node(&mut self, id: &NodeId) -> Vec<ShardRouting> {
        self.nodes.remove(id).map(|n| n.shards).unwrap_or_default()
    }

    /// Take the unassigned list, leaving it empty
    pub fn drain_unassigned(&mut self) -> Vec<ShardRouting> {
        std::mem::take(&mut self.unassigned)
    }

    /// Put a copy back: onto its node when assigned, else onto the unassigned list
    pub fn restore(&mut self, copy: ShardRouting) {
        self.place(copy);
    }

    /// Assign `copy` to `node` and mark it initializing
    pub fn assign(&mut self, mut copy: ShardRouting, node: NodeId) -> Result<()> {
        let target = self
            .nodes
            .get_mut(&node)
            .ok_or_else(|| Error::NodeNotFound(node.to_string()))?;
        if target.holds(&copy.shard_id) {
            return Err(Error::invariant(format!(
                "node {node} already holds a copy of {}",
                copy.shard_id
            )));
        }
        copy.initialize(node);
        target.shards.push(copy);
        Ok(())
    }

    /// Mutable copies on every node
    pub fn assigned_mut(&mut self) -> impl Iterator<Item = &mut ShardRouting> {
        self.nodes.values_mut().flat_map(|n| n.shards.iter_mut())
    }

    /// Turn the view back into a routing table at `version`
    pub fn into_routing_table(self, version: u64) -> RoutingTable {
        let mut by_shard: BTreeMap<ShardId, Vec<ShardRouting>> = BTreeMap::new();
        let copies = self
            .nodes
            .into_values()
            .flat_map(|n| n.shards)
            .chain(self.unassigned);
        for copy in copies {
            by_shard.entry(copy.shard_id.clone()).or_default().push(copy);
        }

        let mut indices: BTreeMap<String, IndexRoutingTable> = BTreeMap::new();
        for (shard_id, mut shards) in by_shard {
            // Primary first, replicas after
            shards.sort_by_key(|s| !s.primary);
            indices
                .entry(shard_id.index.clone())
                .or_insert_with(|| IndexRoutingTable {
                    index: shard_id.index.clone(),
                    shards: BTreeMap::new(),
                })
                .shards
                .insert(
                    shard_id.shard,
                    IndexShardRoutingTable { shard_id, shards },
                );
        }

        RoutingTable { version, indices }
    }
}
