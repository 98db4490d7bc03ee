//! Routing table: where every shard copy lives
//!
//! ```text
//! RoutingTable
//!   └─ IndexRoutingTable      (per index)
//!        └─ IndexShardRoutingTable (per shard number)
//!             └─ ShardRouting      (primary + replicas)
//! ```

use crate::metadata::IndexMetadata;
use quarry_common::{Error, NodeId, Result, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a shard copy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unassigned => "UNASSIGNED",
            Self::Initializing => "INITIALIZING",
            Self::Started => "STARTED",
            Self::Relocating => "RELOCATING",
        };
        f.write_str(s)
    }
}

/// One copy of a shard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub current_node: Option<NodeId>,
    pub relocating_node: Option<NodeId>,
    pub primary: bool,
    pub state: ShardState,
}

impl ShardRouting {
    /// New unassigned copy
    pub fn unassigned(shard_id: ShardId, primary: bool) -> Self {
        Self {
            shard_id,
            current_node: None,
            relocating_node: None,
            primary,
            state: ShardState::Unassigned,
        }
    }

    /// Assign to a node; the copy starts initializing there
    pub fn initialize(&mut self, node: NodeId) {
        self.current_node = Some(node);
        self.relocating_node = None;
        self.state = ShardState::Initializing;
    }

    /// Mark an initializing copy as started
    pub fn start(&mut self) {
        if self.state == ShardState::Initializing {
            self.state = ShardState::Started;
        }
    }

    /// Drop the node assignment
    pub fn move_to_unassigned(&mut self) {
        self.current_node = None;
        self.relocating_node = None;
        self.state = ShardState::Unassigned;
    }

    /// Started or relocating
    pub fn active(&self) -> bool {
        matches!(self.state, ShardState::Started | ShardState::Relocating)
    }

    pub fn assigned(&self) -> bool {
        self.current_node.is_some()
    }
}

impl fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} {}",
            self.shard_id,
            if self.primary { "[P]" } else { "[R]" },
            self.state
        )?;
        if let Some(node) = &self.current_node {
            write!(f, " on {}", node.short())?;
        }
        if let Some(node) = &self.relocating_node {
            write!(f, " -> {}", node.short())?;
        }
        Ok(())
    }
}

/// All copies of one shard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    pub shard_id: ShardId,
    pub shards: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    /// Unassigned primary plus `replicas` unassigned replicas
    pub fn unassigned(shard_id: ShardId, replicas: u32) -> Self {
        let mut shards = Vec::with_capacity(1 + replicas as usize);
        shards.push(ShardRouting::unassigned(shard_id.clone(), true));
        for _ in 0..replicas {
            shards.push(ShardRouting::unassigned(shard_id.clone(), false));
        }
        Self { shard_id, shards }
    }

    pub fn primary(&self) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| s.primary)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| !s.primary)
    }

    /// Copies currently assigned to a node
    pub fn assigned(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.assigned())
    }
}

/// Routing of all shards of one index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub index: String,
    pub shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTable {
    /// Fresh routing for a newly created index, every copy unassigned
    pub fn new_unassigned(metadata: &IndexMetadata) -> Self {
        let shards = (0..metadata.number_of_shards)
            .map(|n| {
                (
                    n,
                    IndexShardRoutingTable::unassigned(
                        ShardId::new(metadata.name.clone(), n),
                        metadata.number_of_replicas,
                    ),
                )
            })
            .collect();
        Self {
            index: metadata.name.clone(),
            shards,
        }
    }

    pub fn shard(&self, shard: u32) -> Option<&IndexShardRoutingTable> {
        self.shards.get(&shard)
    }

    /// Every copy of every shard
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values().flat_map(|s| s.shards.iter())
    }
}

/// Versioned routing for the whole cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub version: u64,
    pub indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    /// Empty table at version 0
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start a builder from this table
    #[must_use]
    pub fn builder(&self) -> RoutingTableBuilder {
        RoutingTableBuilder {
            version: self.version,
            indices: self.indices.clone(),
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    /// Routing of one shard
    pub fn shard(&self, shard_id: &ShardId) -> Result<&IndexShardRoutingTable> {
        self.indices
            .get(&shard_id.index)
            .ok_or_else(|| Error::IndexNotFound(shard_id.index.clone()))?
            .shard(shard_id.shard)
            .ok_or_else(|| Error::ShardNotFound(shard_id.to_string()))
    }

    /// Primary copy of a shard
    pub fn primary(&self, shard_id: &ShardId) -> Result<&ShardRouting> {
        self.shard(shard_id)?
            .primary()
            .ok_or_else(|| Error::ShardNotFound(format!("{shard_id} has no primary")))
    }

    /// Every copy in index, shard, primary-first order
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices.values().flat_map(IndexRoutingTable::all_shards)
    }

    /// Copies assigned to `node`
    pub fn shards_on_node<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a ShardRouting> {
        self.all_shards()
            .filter(move |s| s.current_node.as_ref() == Some(node))
    }

    /// Copies in `state`
    pub fn shards_with_state(&self, state: ShardState) -> impl Iterator<Item = &ShardRouting> {
        self.all_shards().filter(move |s| s.state == state)
    }

    /// Count copies in `state`
    pub fn count_with_state(&self, state: ShardState) -> usize {
        self.shards_with_state(state).count()
    }
}

/// Staging area for a new routing table
#[derive(Clone, Debug, Default)]
pub struct RoutingTableBuilder {
    version: u64,
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTableBuilder {
    /// Add routing for a newly created index
    pub fn add_as_new(mut self, metadata: &IndexMetadata) -> Result<Self> {
        if self.indices.contains_key(&metadata.name) {
            return Err(Error::IndexAlreadyExists(metadata.name.clone()));
        }
        self.indices.insert(
            metadata.name.clone(),
            IndexRoutingTable::new_unassigned(metadata),
        );
        Ok(self)
    }

    /// Put an index routing table, replacing any previous one
    #[must_use]
    pub fn put(mut self, table: IndexRoutingTable) -> Self {
        self.indices.insert(table.index.clone(), table);
        self
    }

    /// Remove an index; missing indices are ignored
    #[must_use]
    pub fn remove_index(mut self, name: &str) -> Self {
        self.indices.remove(name);
        self
    }

    /// Finish, bumping the version
    #[must_use]
    pub fn build(self) -> RoutingTable {
        RoutingTable {
            version: self.version + 1,
            indices: self.indices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn books() -> IndexMetadata {
        IndexMetadata::new("books", 2, 1).unwrap()
    }

    #[test]
    fn test_add_as_new_creates_unassigned_copies() {
        let table = RoutingTable::empty()
            .builder()
            .add_as_new(&books())
            .unwrap()
            .build();
        assert_eq!(table.version, 1);
        assert_eq!(table.all_shards().count(), 4);
        assert_eq!(table.count_with_state(ShardState::Unassigned), 4);

        let primary = table.primary(&ShardId::new("books", 1)).unwrap();
        assert!(primary.primary);
        assert!(!primary.assigned());
    }

    #[test]
    fn test_add_existing_index_fails() {
        let table = RoutingTable::empty()
            .builder()
            .add_as_new(&books())
            .unwrap()
            .build();
        assert!(matches!(
            table.builder().add_as_new(&books()),
            Err(Error::IndexAlreadyExists(_))
        ));
    }

    #[test]
    fn test_lookup_errors() {
        let table = RoutingTable::empty();
        assert!(matches!(
            table.shard(&ShardId::new("missing", 0)),
            Err(Error::IndexNotFound(_))
        ));
        let table = table.builder().add_as_new(&books()).unwrap().build();
        assert!(matches!(
            table.shard(&ShardId::new("books", 7)),
            Err(Error::ShardNotFound(_))
        ));
    }

    #[test]
    fn test_shard_routing_lifecycle() {
        let node = NodeId::new();
        let mut copy = ShardRouting::unassigned(ShardId::new("books", 0), true);
        copy.start();
        assert_eq!(copy.state, ShardState::Unassigned);

        copy.initialize(node);
        assert_eq!(copy.state, ShardState::Initializing);
        assert!(!copy.active());
        copy.start();
        assert!(copy.active());

        let mut table = RoutingTable::empty().builder().add_as_new(&books()).unwrap().build();
        let shard = table.indices.get_mut("books").unwrap().shards.get_mut(&0).unwrap();
        shard.shards[0] = copy.clone();
        assert_eq!(table.shards_on_node(&node).count(), 1);

        copy.move_to_unassigned();
        assert!(copy.current_node.is_none());
    }
}
