//! Shard allocation
//!
//! `BalancedAllocator` computes the next routing table for a cluster state:
//! 1. Copies on nodes that left the cluster (or stopped being data nodes)
//!    become unassigned. If a lost primary has an active replica elsewhere,
//!    that replica is promoted.
//! 2. Unassigned primaries of open indices are placed, then replicas whose
//!    primary is assigned.
//! 3. Each copy goes to the data node with the fewest copies that does not
//!    already hold a copy of the same shard. Ties go to the lowest node id.
//!
//! Placed copies start out `Initializing`; `start_initializing` marks them
//! `Started` once they have recovered.

use crate::routing::{RoutingTable, ShardRouting, ShardState};
use crate::routing_nodes::RoutingNodes;
use crate::state::ClusterState;
use quarry_common::{NodeId, Result, ShardId};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Least-loaded shard allocator
#[derive(Clone, Copy, Debug, Default)]
pub struct BalancedAllocator;

impl BalancedAllocator {
    /// Compute a new routing table for `state`
    pub fn reroute(&self, state: &ClusterState) -> Result<RoutingTable> {
        let mut view = state.routing_nodes();
        let data_nodes: BTreeSet<NodeId> = state.nodes().data_nodes().map(|n| n.id).collect();

        let departed: Vec<NodeId> = view
            .iter()
            .map(|n| n.node_id)
            .filter(|id| !data_nodes.contains(id))
            .collect();
        let mut pending = view.drain_unassigned();
        for node in departed {
            let lost = view.remove_node(&node);
            if !lost.is_empty() {
                warn!("node {} left, {} shard copies unassigned", node.short(), lost.len());
            }
            for mut copy in lost {
                copy.move_to_unassigned();
                pending.push(copy);
            }
        }
        for node in &data_nodes {
            view.add_node(*node);
        }

        for copy in pending.iter_mut().filter(|c| c.primary) {
            if Self::promote_replica(&mut view, &copy.shard_id) {
                info!("promoted replica of {} to primary", copy.shard_id);
                copy.primary = false;
            }
        }

        // Primaries first, then shard order
        pending.sort_by(|a, b| b.primary.cmp(&a.primary).then_with(|| a.shard_id.cmp(&b.shard_id)));

        let mut assigned = 0usize;
        let mut deferred = Vec::new();
        for copy in pending {
            let open = state
                .metadata()
                .index(&copy.shard_id.index)
                .is_some_and(|i| i.is_open());
            if !open || (!copy.primary && !Self::primary_assigned(&view, &copy.shard_id)) {
                deferred.push(copy);
                continue;
            }
            match Self::pick_node(&view, &data_nodes, &copy.shard_id) {
                Some(node) => {
                    debug!("allocating {} to {}", copy, node.short());
                    view.assign(copy, node)?;
                    assigned += 1;
                }
                None => deferred.push(copy),
            }
        }

        let unassigned = deferred.len();
        for copy in deferred {
            view.restore(copy);
        }

        info!(
            "reroute: {} copies allocated, {} left unassigned across {} data nodes",
            assigned,
            unassigned,
            data_nodes.len()
        );
        Ok(view.into_routing_table(state.routing_table().version + 1))
    }

    /// Mark every initializing copy as started
    pub fn start_initializing(&self, state: &ClusterState) -> RoutingTable {
        let mut table = state.routing_table().clone();
        let mut started = 0usize;
        for index in table.indices.values_mut() {
            for shard in index.shards.values_mut() {
                for copy in &mut shard.shards {
                    if copy.state == ShardState::Initializing {
                        copy.start();
                        started += 1;
                    }
                }
            }
        }
        debug!("started {} initializing copies", started);
        table.version += 1;
        table
    }

    fn promote_replica(view: &mut RoutingNodes, shard_id: &ShardId) -> bool {
        let replica = view
            .assigned_mut()
            .find(|c| &c.shard_id == shard_id && !c.primary && c.active());
        match replica {
            Some(replica) => {
                replica.primary = true;
                true
            }
            None => false,
        }
    }

    fn primary_assigned(view: &RoutingNodes, shard_id: &ShardId) -> bool {
        view.iter()
            .flat_map(|n| n.shards.iter())
            .any(|c| c.primary && &c.shard_id == shard_id)
    }

    fn pick_node(
        view: &RoutingNodes,
        data_nodes: &BTreeSet<NodeId>,
        shard_id: &ShardId,
    ) -> Option<NodeId> {
        let mut best: Option<(usize, NodeId)> = None;
        for node in data_nodes {
            if view.node(node).is_some_and(|n| n.holds(shard_id)) {
                continue;
            }
            let load = view.node_shard_count(node);
            // BTreeSet order makes the first minimum the lowest node id
            if best.is_none_or(|(best_load, _)| load < best_load) {
                best = Some((load, *node));
            }
        }
        best.map(|(_, node)| node)
    }
}

/// Copies of a shard that are not started, for diagnostics
pub fn pending_copies<'a>(
    table: &'a RoutingTable,
    shard_id: &'a ShardId,
) -> impl Iterator<Item = &'a ShardRouting> {
    table
        .shard(shard_id)
        .into_iter()
        .flat_map(|s| s.shards.iter())
        .filter(|c| c.state != ShardState::Started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::IndexMetadata;
    use crate::nodes::{DiscoveryNode, DiscoveryNodes, NodeRole};
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn nodes(count: u16) -> DiscoveryNodes {
        (0..count).fold(DiscoveryNodes::new(), |acc, i| {
            acc.with_node(DiscoveryNode::new(
                format!("n{i}"),
                SocketAddr::from(([127, 0, 0, 1], 9300 + i)),
            ))
        })
    }

    fn state_with(nodes: DiscoveryNodes, shards: u32, replicas: u32) -> ClusterState {
        ClusterState::builder("test")
            .nodes(nodes)
            .put_index(IndexMetadata::new("books", shards, replicas).unwrap())
            .unwrap()
            .build()
    }

    fn apply(state: &ClusterState, table: RoutingTable) -> ClusterState {
        ClusterState::builder_from(state)
            .routing_table(table)
            .increment_version()
            .build()
    }

    #[test]
    fn test_allocates_everything_evenly() {
        let state = state_with(nodes(4), 2, 1);
        let table = BalancedAllocator.reroute(&state).unwrap();

        assert_eq!(table.count_with_state(ShardState::Unassigned), 0);
        assert_eq!(table.count_with_state(ShardState::Initializing), 4);

        let mut per_node: HashMap<NodeId, usize> = HashMap::new();
        for copy in table.all_shards() {
            *per_node.entry(copy.current_node.unwrap()).or_default() += 1;
        }
        assert_eq!(per_node.len(), 4);
        assert!(per_node.values().all(|c| *c == 1), "{per_node:?}");
    }

    #[test]
    fn test_never_two_copies_on_one_node() {
        let state = state_with(nodes(2), 2, 3);
        let table = BalancedAllocator.reroute(&state).unwrap();
        for shard in table.index("books").unwrap().shards.values() {
            let holders: BTreeSet<_> = shard.assigned().filter_map(|c| c.current_node).collect();
            assert_eq!(holders.len(), shard.assigned().count());
            assert_eq!(holders.len(), 2);
        }
        assert_eq!(table.count_with_state(ShardState::Unassigned), 4);
    }

    #[test]
    fn test_no_data_nodes_leaves_unassigned() {
        let master_only = DiscoveryNodes::new().with_node(
            DiscoveryNode::new("m", SocketAddr::from(([127, 0, 0, 1], 9300)))
                .with_roles([NodeRole::Master]),
        );
        let state = state_with(master_only, 2, 1);
        let table = BalancedAllocator.reroute(&state).unwrap();
        assert_eq!(table.count_with_state(ShardState::Unassigned), 4);
        assert_eq!(table.version, state.routing_table().version + 1);
    }

    #[test]
    fn test_start_initializing() {
        let state = state_with(nodes(2), 1, 1);
        let state = apply(&state, BalancedAllocator.reroute(&state).unwrap());
        let table = BalancedAllocator.start_initializing(&state);
        assert_eq!(table.count_with_state(ShardState::Started), 2);
        assert!(pending_copies(&table, &ShardId::new("books", 0)).next().is_none());
    }

    #[test]
    fn test_lost_primary_promotes_replica() {
        let state = state_with(nodes(3), 1, 1);
        let state = apply(&state, BalancedAllocator.reroute(&state).unwrap());
        let state = apply(&state, BalancedAllocator.start_initializing(&state));

        let shard_id = ShardId::new("books", 0);
        let primary_node = state.routing_table().primary(&shard_id).unwrap().current_node.unwrap();
        let replica_node = state
            .routing_table()
            .shard(&shard_id)
            .unwrap()
            .replicas()
            .next()
            .unwrap()
            .current_node
            .unwrap();

        let mut remaining = state.nodes().clone();
        remaining.remove(&primary_node);
        let state = ClusterState::builder_from(&state).nodes(remaining).build();

        let table = BalancedAllocator.reroute(&state).unwrap();
        let primary = table.primary(&shard_id).unwrap();
        assert_eq!(primary.current_node, Some(replica_node));
        assert_eq!(primary.state, ShardState::Started);

        let replica = table.shard(&shard_id).unwrap().replicas().next().unwrap();
        assert_eq!(replica.state, ShardState::Initializing);
        assert_ne!(replica.current_node, Some(replica_node));
        assert_ne!(replica.current_node, Some(primary_node));
    }
}
