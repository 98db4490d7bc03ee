//! Core type definitions for Quarry
//!
//! Identifiers for cluster nodes, shards and indexed entities.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Cluster node identity, a random v4 uuid fixed when the node first starts
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct NodeId(Uuid);

impl NodeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id, mostly for tests and fixtures
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// First eight hex digits, for log lines and CLI tables
    #[must_use]
    pub fn short(&self) -> String {
        let mut short = self.0.simple().to_string();
        short.truncate(8);
        short
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeId").field(&self.short()).finish()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of one logical shard of an index
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// Index the shard belongs to
    pub index: String,
    /// Shard number within the index (0..number_of_shards)
    pub shard: u32,
}

impl ShardId {
    /// Create a new shard ID
    #[must_use]
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }

    /// Directory name used for this shard under a node's data path
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("{}/{}", self.index, self.shard)
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId([{}][{}])", self.index, self.shard)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Identifier of an entity fed through the indexing pipeline
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct EntityId(String);

impl EntityId {
    /// Create a new entity ID
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({:?})", self.0)
    }
}

/// Document number within a single segment
pub type DocId = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_ordering_is_stable() {
        let a = NodeId::from_bytes([1u8; 16]);
        let b = NodeId::from_bytes([2u8; 16]);
        assert!(a < b);
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn test_shard_id_display() {
        let id = ShardId::new("products", 3);
        assert_eq!(id.to_string(), "[products][3]");
        assert_eq!(id.dir_name(), "products/3");
    }

    #[test]
    fn test_entity_id_from_number() {
        let id = EntityId::from(42u64);
        assert_eq!(id.as_str(), "42");
        assert_eq!(id.to_string(), "42");
    }
}
