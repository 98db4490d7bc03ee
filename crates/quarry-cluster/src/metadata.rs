//! Cluster metadata: indices and persistent settings

use quarry_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Open/closed state of an index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    /// Shards are allocated and serve requests
    Open,
    /// Index is kept in metadata but has no routing entries
    Close,
}

/// Metadata of one index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index name
    pub name: String,
    /// Unique id, stable for the lifetime of the index
    pub uuid: Uuid,
    /// Number of primary shards (fixed at creation)
    pub number_of_shards: u32,
    /// Replicas per primary
    pub number_of_replicas: u32,
    /// Open or closed
    pub state: IndexState,
    /// Free-form index settings
    pub settings: BTreeMap<String, String>,
    /// Bumped on every change to this index's metadata
    pub version: u64,
}

impl IndexMetadata {
    /// Create metadata for a new open index
    pub fn new(name: impl Into<String>, number_of_shards: u32, number_of_replicas: u32) -> Result<Self> {
        let name = name.into();
        Self::validate_name(&name)?;
        if number_of_shards == 0 {
            return Err(Error::configuration(format!(
                "index [{name}] must have at least one shard"
            )));
        }
        Ok(Self {
            name,
            uuid: Uuid::new_v4(),
            number_of_shards,
            number_of_replicas,
            state: IndexState::Open,
            settings: BTreeMap::new(),
            version: 1,
        })
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::configuration("index name must not be empty"));
        }
        if name.starts_with(['_', '-', '+']) {
            return Err(Error::configuration(format!(
                "index name [{name}] must not start with '_', '-' or '+'"
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| c.is_ascii_uppercase() || matches!(c, '/' | '\\' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' | ',' | '#'))
        {
            return Err(Error::configuration(format!(
                "index name [{name}] contains invalid character {c:?}"
            )));
        }
        Ok(())
    }

    /// Copies per shard (primary + replicas)
    #[must_use]
    pub const fn copies_per_shard(&self) -> u32 {
        1 + self.number_of_replicas
    }

    /// Total shard copies of this index
    #[must_use]
    pub const fn total_copies(&self) -> u32 {
        self.number_of_shards * self.copies_per_shard()
    }

    /// Check whether the index is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == IndexState::Open
    }

    /// Add a setting
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// Cluster-wide metadata
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Cluster identity, assigned when the cluster first forms
    pub cluster_uuid: Uuid,
    /// Bumped on every metadata change
    pub version: u64,
    /// Indices by name
    pub indices: BTreeMap<String, IndexMetadata>,
    /// Settings that survive full cluster restarts
    pub persistent_settings: BTreeMap<String, String>,
}

impl Metadata {
    /// Create empty metadata for a new cluster
    #[must_use]
    pub fn new() -> Self {
        Self {
            cluster_uuid: Uuid::new_v4(),
            ..Default::default()
        }
    }

    /// Look up an index
    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    /// Look up an index, failing if it does not exist
    pub fn index_or_err(&self, name: &str) -> Result<&IndexMetadata> {
        self.index(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    /// Check whether an index exists
    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    /// Add a new index
    pub fn create_index(&mut self, index: IndexMetadata) -> Result<()> {
        if self.indices.contains_key(&index.name) {
            return Err(Error::IndexAlreadyExists(index.name));
        }
        self.indices.insert(index.name.clone(), index);
        self.version += 1;
        Ok(())
    }

    /// Remove an index
    pub fn remove_index(&mut self, name: &str) -> Result<IndexMetadata> {
        let removed = self
            .indices
            .remove(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        self.version += 1;
        Ok(removed)
    }

    /// Open or close an index
    pub fn set_index_state(&mut self, name: &str, state: IndexState) -> Result<()> {
        let index = self
            .indices
            .get_mut(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        if index.state != state {
            index.state = state;
            index.version += 1;
            self.version += 1;
        }
        Ok(())
    }

    /// Set a persistent setting
    pub fn put_setting(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.persistent_settings.insert(key.into(), value.into());
        self.version += 1;
    }

    /// Open indices
    pub fn open_indices(&self) -> impl Iterator<Item = &IndexMetadata> {
        self.indices.values().filter(|i| i.is_open())
    }

    /// Total shard copies across open indices
    pub fn total_open_copies(&self) -> u64 {
        self.open_indices().map(|i| u64::from(i.total_copies())).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_name_rules() {
        assert!(IndexMetadata::new("books", 1, 0).is_ok());
        assert!(IndexMetadata::new("Books", 1, 0).is_err());
        assert!(IndexMetadata::new("_hidden", 1, 0).is_err());
        assert!(IndexMetadata::new("a/b", 1, 0).is_err());
        assert!(IndexMetadata::new("books", 0, 0).is_err());
    }

    #[test]
    fn test_create_and_remove_index() {
        let mut meta = Metadata::new();
        meta.create_index(IndexMetadata::new("books", 2, 1).unwrap())
            .unwrap();
        assert_eq!(meta.version, 1);
        assert!(matches!(
            meta.create_index(IndexMetadata::new("books", 1, 0).unwrap()),
            Err(Error::IndexAlreadyExists(_))
        ));
        assert_eq!(meta.total_open_copies(), 4);

        meta.set_index_state("books", IndexState::Close).unwrap();
        assert_eq!(meta.total_open_copies(), 0);

        meta.remove_index("books").unwrap();
        assert!(matches!(
            meta.index_or_err("books"),
            Err(Error::IndexNotFound(_))
        ));
    }
}
