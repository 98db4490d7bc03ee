//! Cluster membership

use quarry_common::{Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

/// Role a node plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Can be elected master
    Master,
    /// Holds shard data
    Data,
    /// Runs indexing pipelines
    Ingest,
}

/// A node known to the cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: NodeId,
    pub name: String,
    pub address: SocketAddr,
    pub roles: BTreeSet<NodeRole>,
    pub attributes: BTreeMap<String, String>,
}

impl DiscoveryNode {
    /// Create a node with a fresh id and all roles
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            address,
            roles: [NodeRole::Master, NodeRole::Data, NodeRole::Ingest]
                .into_iter()
                .collect(),
            attributes: BTreeMap::new(),
        }
    }

    /// Replace the role set
    #[must_use]
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    /// Add an attribute
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn is_data_node(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }

    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }
}

/// The set of nodes in the cluster, with the elected master and the local node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<NodeId, DiscoveryNode>,
    master_node_id: Option<NodeId>,
    local_node_id: Option<NodeId>,
}

impl DiscoveryNodes {
    /// Empty membership
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node
    pub fn add(&mut self, node: DiscoveryNode) {
        self.nodes.insert(node.id, node);
    }

    /// Builder-style `add`
    #[must_use]
    pub fn with_node(mut self, node: DiscoveryNode) -> Self {
        self.add(node);
        self
    }

    /// Remove a node; clears master/local ids pointing at it
    pub fn remove(&mut self, id: &NodeId) -> Option<DiscoveryNode> {
        let removed = self.nodes.remove(id);
        if self.master_node_id.as_ref() == Some(id) {
            self.master_node_id = None;
        }
        if self.local_node_id.as_ref() == Some(id) {
            self.local_node_id = None;
        }
        removed
    }

    /// Set the elected master; it must be a known master-eligible node
    pub fn set_master(&mut self, id: NodeId) -> Result<()> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
        if !node.is_master_eligible() {
            return Err(Error::configuration(format!(
                "node {} ({}) is not master eligible",
                node.name, id
            )));
        }
        self.master_node_id = Some(id);
        Ok(())
    }

    /// Set the local node; it must be a known node
    pub fn set_local(&mut self, id: NodeId) -> Result<()> {
        if !self.nodes.contains_key(&id) {
            return Err(Error::NodeNotFound(id.to_string()));
        }
        self.local_node_id = Some(id);
        Ok(())
    }

    pub fn get(&self, id: &NodeId) -> Option<&DiscoveryNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub const fn master_node_id(&self) -> Option<NodeId> {
        self.master_node_id
    }

    pub const fn local_node_id(&self) -> Option<NodeId> {
        self.local_node_id
    }

    pub fn master_node(&self) -> Option<&DiscoveryNode> {
        self.master_node_id.and_then(|id| self.nodes.get(&id))
    }

    /// All nodes in node id order
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    /// Data nodes in node id order
    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_data_node())
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
