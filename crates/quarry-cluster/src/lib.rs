//! Quarry Cluster - versioned cluster state and shard routing
//!
//! A `ClusterState` is an immutable snapshot of three parts:
//! - **Metadata**: which indices exist and how many shards/replicas they have
//! - **Routing table**: which node holds which copy of every shard
//! - **Discovery nodes**: cluster membership
//!
//! Snapshots are produced by `ClusterStateBuilder`, published through a
//! `ClusterStateStore` that never lets the version go backwards, and
//! persisted with a length-prefixed, checksummed binary codec.
//!
//! # Example
//! ```ignore
//! use quarry_cluster::{BalancedAllocator, ClusterState, IndexMetadata};
//!
//! let state = ClusterState::builder("prod")
//!     .nodes(nodes)
//!     .put_index(IndexMetadata::new("books", 3, 1)?)?
//!     .build();
//! let routing = BalancedAllocator::default().reroute(&state)?;
//! let state = ClusterState::builder_from(&state).routing_table(routing).increment_version().build();
//! ```

pub mod allocation;
pub mod codec;
pub mod metadata;
pub mod nodes;
pub mod operation;
pub mod persist;
pub mod routing;
pub mod routing_nodes;
pub mod state;
pub mod store;

pub use allocation::BalancedAllocator;
pub use metadata::{IndexMetadata, IndexState, Metadata};
pub use nodes::{DiscoveryNode, DiscoveryNodes, NodeRole};
pub use persist::ClusterStatePersister;
pub use routing::{
    IndexRoutingTable, IndexShardRoutingTable, RoutingTable, RoutingTableBuilder, ShardRouting,
    ShardState,
};
pub use routing_nodes::{RoutingNode, RoutingNodes};
pub use state::{ClusterState, ClusterStateBuilder};
pub use store::ClusterStateStore;
