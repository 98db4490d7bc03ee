//! Immutable cluster state snapshots
//!
//! A `ClusterState` never changes after `build()`. New versions are staged in
//! a `ClusterStateBuilder` that starts as a copy of an existing snapshot.
//! The node-centric routing view is derived from the routing table and
//! metadata, so it is computed lazily and at most once per snapshot.

use crate::codec;
use crate::metadata::{IndexMetadata, Metadata};
use crate::nodes::DiscoveryNodes;
use crate::routing::{RoutingTable, ShardState};
use crate::routing_nodes::RoutingNodes;
use quarry_common::Result;
use std::fmt;
use std::sync::OnceLock;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// One versioned snapshot of the cluster
pub struct ClusterState {
    cluster_name: String,
    version: u64,
    state_uuid: Uuid,
    metadata: Metadata,
    routing_table: RoutingTable,
    nodes: DiscoveryNodes,
    routing_nodes: OnceLock<RoutingNodes>,
    #[cfg(test)]
    routing_nodes_builds: AtomicUsize,
}

impl ClusterState {
    /// Assemble a snapshot from its parts with a fresh state uuid
    pub fn new(
        cluster_name: impl Into<String>,
        version: u64,
        metadata: Metadata,
        routing_table: RoutingTable,
        nodes: DiscoveryNodes,
    ) -> Self {
        Self::with_uuid(
            cluster_name.into(),
            version,
            Uuid::new_v4(),
            metadata,
            routing_table,
            nodes,
        )
    }

    pub(crate) fn with_uuid(
        cluster_name: String,
        version: u64,
        state_uuid: Uuid,
        metadata: Metadata,
        routing_table: RoutingTable,
        nodes: DiscoveryNodes,
    ) -> Self {
        Self {
            cluster_name,
            version,
            state_uuid,
            metadata,
            routing_table,
            nodes,
            routing_nodes: OnceLock::new(),
            #[cfg(test)]
            routing_nodes_builds: AtomicUsize::new(0),
        }
    }

    /// Builder for the first state of a cluster
    pub fn builder(cluster_name: impl Into<String>) -> ClusterStateBuilder {
        ClusterStateBuilder {
            cluster_name: cluster_name.into(),
            version: 0,
            state_uuid: Uuid::new_v4(),
            metadata: Metadata::new(),
            routing_table: RoutingTable::empty(),
            nodes: DiscoveryNodes::new(),
        }
    }

    /// Builder starting as a copy of `state`
    pub fn builder_from(state: &Self) -> ClusterStateBuilder {
        ClusterStateBuilder {
            cluster_name: state.cluster_name.clone(),
            version: state.version,
            state_uuid: state.state_uuid,
            metadata: state.metadata.clone(),
            routing_table: state.routing_table.clone(),
            nodes: state.nodes.clone(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub const fn version(&self) -> u64 {
        self.version
    }

    pub const fn state_uuid(&self) -> Uuid {
        self.state_uuid
    }

    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub const fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub const fn nodes(&self) -> &DiscoveryNodes {
        &self.nodes
    }

    /// A fresh, caller-owned routing view that may be mutated freely
    pub fn routing_nodes(&self) -> RoutingNodes {
        RoutingNodes::build(&self.routing_table, &self.metadata)
    }

    /// The shared routing view, computed on first use
    ///
    /// Concurrent first callers may race; exactly one computation is stored
    /// and every caller gets a reference to it.
    pub fn read_only_routing_nodes(&self) -> &RoutingNodes {
        self.routing_nodes.get_or_init(|| {
            #[cfg(test)]
            self.routing_nodes_builds.fetch_add(1, Ordering::SeqCst);
            RoutingNodes::build(&self.routing_table, &self.metadata)
        })
    }

    #[cfg(test)]
    pub(crate) fn routing_nodes_builds(&self) -> usize {
        self.routing_nodes_builds.load(Ordering::SeqCst)
    }

    /// Encode with the cluster state codec
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::serialize(self)
    }

    /// Decode with the cluster state codec
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::deserialize(bytes)
    }

    /// Multi-line human readable summary
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = self.write_summary(&mut out);
        out
    }

    fn write_summary(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "cluster [{}] version {} uuid {}",
            self.cluster_name, self.version, self.state_uuid
        )?;

        writeln!(out, "nodes ({}):", self.nodes.size())?;
        let master = self.nodes.master_node_id();
        for node in self.nodes.iter() {
            let roles: Vec<String> = node.roles.iter().map(|r| format!("{r:?}")).collect();
            writeln!(
                out,
                "  {} {} {} [{}]{}",
                node.id.short(),
                node.name,
                node.address,
                roles.join(","),
                if master == Some(node.id) { " *master" } else { "" }
            )?;
        }

        writeln!(out, "indices ({}):", self.metadata.indices.len())?;
        for index in self.metadata.indices.values() {
            writeln!(
                out,
                "  {} shards={} replicas={} state={:?}",
                index.name, index.number_of_shards, index.number_of_replicas, index.state
            )?;
        }

        writeln!(out, "routing (version {}):", self.routing_table.version)?;
        for copy in self.routing_table.all_shards() {
            writeln!(out, "  {copy}")?;
        }
        let unassigned = self.routing_table.count_with_state(ShardState::Unassigned);
        if unassigned > 0 {
            writeln!(out, "unassigned copies: {unassigned}")?;
        }
        Ok(())
    }
}

impl Clone for ClusterState {
    fn clone(&self) -> Self {
        Self::with_uuid(
            self.cluster_name.clone(),
            self.version,
            self.state_uuid,
            self.metadata.clone(),
            self.routing_table.clone(),
            self.nodes.clone(),
        )
    }
}

/// Equality ignores the memoized routing view
impl PartialEq for ClusterState {
    fn eq(&self, other: &Self) -> bool {
        self.cluster_name == other.cluster_name
            && self.version == other.version
            && self.state_uuid == other.state_uuid
            && self.metadata == other.metadata
            && self.routing_table == other.routing_table
            && self.nodes == other.nodes
    }
}

impl Eq for ClusterState {}

impl fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterState")
            .field("cluster_name", &self.cluster_name)
            .field("version", &self.version)
            .field("state_uuid", &self.state_uuid)
            .field("indices", &self.metadata.indices.len())
            .field("nodes", &self.nodes.size())
            .field("routing_version", &self.routing_table.version)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_summary(f)
    }
}

/// Mutable staging area for the next `ClusterState`
#[derive(Clone, Debug)]
pub struct ClusterStateBuilder {
    cluster_name: String,
    version: u64,
    state_uuid: Uuid,
    metadata: Metadata,
    routing_table: RoutingTable,
    nodes: DiscoveryNodes,
}

impl ClusterStateBuilder {
    #[must_use]
    pub const fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Next version with a new state uuid
    #[must_use]
    pub fn increment_version(mut self) -> Self {
        self.version += 1;
        self.state_uuid = Uuid::new_v4();
        self
    }

    #[must_use]
    pub const fn state_uuid(mut self, uuid: Uuid) -> Self {
        self.state_uuid = uuid;
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn routing_table(mut self, routing_table: RoutingTable) -> Self {
        self.routing_table = routing_table;
        self
    }

    #[must_use]
    pub fn nodes(mut self, nodes: DiscoveryNodes) -> Self {
        self.nodes = nodes;
        self
    }

    /// Create an index in metadata and add its unassigned routing
    pub fn put_index(mut self, index: IndexMetadata) -> Result<Self> {
        self.routing_table = self.routing_table.builder().add_as_new(&index)?.build();
        self.metadata.create_index(index)?;
        Ok(self)
    }

    /// Drop an index from metadata and routing
    pub fn remove_index(mut self, name: &str) -> Result<Self> {
        self.metadata.remove_index(name)?;
        self.routing_table = self.routing_table.builder().remove_index(name).build();
        Ok(self)
    }

    pub const fn current_version(&self) -> u64 {
        self.version
    }

    pub const fn current_metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn build(self) -> ClusterState {
        ClusterState::with_uuid(
            self.cluster_name,
            self.version,
            self.state_uuid,
            self.metadata,
            self.routing_table,
            self.nodes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::DiscoveryNode;
    use std::net::SocketAddr;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn sample() -> ClusterState {
        let nodes = DiscoveryNodes::new()
            .with_node(DiscoveryNode::new("n1", SocketAddr::from(([127, 0, 0, 1], 9300))));
        ClusterState::builder("test")
            .nodes(nodes)
            .put_index(IndexMetadata::new("books", 3, 1).unwrap())
            .unwrap()
            .version(7)
            .build()
    }

    #[test]
    fn test_builder_copies_then_overrides() {
        let state = sample();
        let next = ClusterState::builder_from(&state).increment_version().build();
        assert_eq!(next.version(), 8);
        assert_ne!(next.state_uuid(), state.state_uuid());
        assert_eq!(next.metadata(), state.metadata());
        assert_eq!(next.cluster_name(), "test");

        let same = ClusterState::builder_from(&state).build();
        assert_eq!(same, state);
    }

    #[test]
    fn test_put_index_twice_fails() {
        let err = ClusterState::builder("test")
            .put_index(IndexMetadata::new("books", 1, 0).unwrap())
            .unwrap()
            .put_index(IndexMetadata::new("books", 1, 0).unwrap())
            .unwrap_err();
        assert!(matches!(err, quarry_common::Error::IndexAlreadyExists(_)));
    }

    #[test]
    fn test_remove_index() {
        let state = ClusterState::builder_from(&sample())
            .remove_index("books")
            .unwrap()
            .build();
        assert!(!state.metadata().has_index("books"));
        assert!(state.routing_table().index("books").is_none());
    }

    #[test]
    fn test_read_only_routing_nodes_is_memoized() {
        let state = sample();
        let first: *const RoutingNodes = state.read_only_routing_nodes();
        let second: *const RoutingNodes = state.read_only_routing_nodes();
        assert!(std::ptr::eq(first, second));
        assert_eq!(state.routing_nodes_builds(), 1);
        assert_eq!(state.read_only_routing_nodes().unassigned().len(), 6);
    }

    #[test]
    fn test_concurrent_first_access_computes_once() {
        let state = Arc::new(sample());
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    std::ptr::from_ref(state.read_only_routing_nodes()) as usize
                })
            })
            .collect();

        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(state.routing_nodes_builds(), 1);
    }

    #[test]
    fn test_mutable_view_is_independent() {
        let state = sample();
        let mut view = state.routing_nodes();
        view.drain_unassigned();
        assert!(view.unassigned().is_empty());
        assert_eq!(state.read_only_routing_nodes().unassigned().len(), 6);
    }

    #[test]
    fn test_summary_mentions_indices() {
        let text = sample().summary();
        assert!(text.contains("cluster [test] version 7"));
        assert!(text.contains("books shards=3 replicas=1"));
        assert!(text.contains("unassigned copies: 6"));
    }
}
