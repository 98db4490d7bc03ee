//! Configuration types for Quarry
//!
//! This module defines configuration structures used across components.
//! Every section has a `Default` and a `validate` step; `Config::validate`
//! runs before any component touches the disk.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Root configuration for Quarry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Directory/storage configuration
    pub store: StoreConfig,
    /// Batch indexing configuration
    pub indexing: IndexingConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| Error::configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.indexing.validate()?;
        self.cluster.validate()
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Data directory for shard stores and persisted cluster state
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "quarry-node".to_string(),
            data_dir: PathBuf::from("./quarry-data"),
        }
    }
}

/// Storage backend selection for shard directories
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StoreType {
    /// Memory-map primary extensions, buffered I/O for the rest
    #[default]
    Auto,
    /// Unbuffered positional reads
    Simple,
    /// Buffered random access
    Buffered,
    /// Memory-mapped access for every file
    Mmap,
    /// Page-cache bypassing reads (O_DIRECT / F_NOCACHE)
    Direct,
}

impl StoreType {
    /// Canonical configuration name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Simple => "simple",
            Self::Buffered => "buffered",
            Self::Mmap => "mmap",
            Self::Direct => "direct",
        }
    }
}

impl FromStr for StoreType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "default" => Ok(Self::Auto),
            "simple" | "simplefs" => Ok(Self::Simple),
            "buffered" | "niofs" => Ok(Self::Buffered),
            "mmap" | "mmapfs" => Ok(Self::Mmap),
            "direct" => Ok(Self::Direct),
            other => Err(Error::configuration(format!(
                "unknown store type [{other}], expected one of auto, simple, buffered, mmap, direct"
            ))),
        }
    }
}

impl TryFrom<String> for StoreType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StoreType> for String {
    fn from(value: StoreType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock implementation used by shard directories
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    /// OS-level advisory lock on the lock file
    #[default]
    Native,
    /// Marker file created exclusively, removed on release
    Simple,
}

/// Directory/storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection
    pub store_type: StoreType,
    /// Extensions served memory-mapped when `store_type` is auto
    pub primary_extensions: Vec<String>,
    /// Lock implementation
    pub lock_type: LockType,
    /// Shard paths live on a shared filesystem; locks retry instead of failing fast
    pub shared_filesystem: bool,
    /// Total time to keep retrying a lock on a shared filesystem (milliseconds)
    pub lock_timeout_ms: u64,
    /// Sleep between lock attempts on a shared filesystem (milliseconds)
    pub lock_poll_interval_ms: u64,
    /// Write throttle per directory handle (bytes/sec, None = unlimited)
    pub max_write_bytes_per_sec: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::Auto,
            primary_extensions: ["nvd", "dvd", "tim", "nrm"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            lock_type: LockType::Native,
            shared_filesystem: false,
            lock_timeout_ms: 10_000,
            lock_poll_interval_ms: 1_000,
            max_write_bytes_per_sec: None,
        }
    }
}

impl StoreConfig {
    /// Validate the store section
    pub fn validate(&self) -> Result<()> {
        if self.shared_filesystem && self.lock_poll_interval_ms == 0 {
            return Err(Error::configuration(
                "store.lock_poll_interval_ms must be positive on a shared filesystem",
            ));
        }
        if self.shared_filesystem && self.lock_timeout_ms < self.lock_poll_interval_ms {
            return Err(Error::configuration(format!(
                "store.lock_timeout_ms ({}) is shorter than store.lock_poll_interval_ms ({})",
                self.lock_timeout_ms, self.lock_poll_interval_ms
            )));
        }
        if self.max_write_bytes_per_sec == Some(0) {
            return Err(Error::configuration(
                "store.max_write_bytes_per_sec must be positive when set",
            ));
        }
        if let Some(ext) = self
            .primary_extensions
            .iter()
            .find(|e| e.is_empty() || e.contains('.'))
        {
            return Err(Error::configuration(format!(
                "invalid primary extension [{ext}], expected a bare extension such as \"tim\""
            )));
        }
        Ok(())
    }

    /// Lock timeout as a duration
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Lock poll interval as a duration
    #[must_use]
    pub const fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }
}

/// How entity loading interacts with the source's cache
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Neither read from nor write to the cache
    #[default]
    Ignore,
    /// Read from the cache, do not populate it
    Get,
    /// Populate the cache, do not read from it
    Put,
    /// Read and populate
    Normal,
    /// Always reload and overwrite cached entries
    Refresh,
}

/// What a failing pipeline does to its sibling pipelines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Other entity types keep indexing
    #[default]
    Isolate,
    /// The first failure aborts every pipeline of the run
    AbortAll,
}

/// Batch indexing pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Identifiers per loading batch
    pub batch_size_to_load_objects: usize,
    /// Entity loading threads per pipeline
    pub threads_to_load_objects: usize,
    /// Document building threads per pipeline
    pub threads_for_document_building: usize,
    /// Cache interaction while loading
    pub cache_mode: CacheMode,
    /// Stop after this many entities (None = all)
    pub limit_indexed_objects_to: Option<u64>,
    /// Capacity of the identifier batch queue
    pub id_queue_capacity: usize,
    /// Capacity of the loaded entity queue
    pub entity_queue_capacity: usize,
    /// Cross-pipeline failure handling
    pub failure_policy: FailurePolicy,
    /// Log progress every N documents
    pub progress_log_interval: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size_to_load_objects: 10,
            threads_to_load_objects: 2,
            threads_for_document_building: 2,
            cache_mode: CacheMode::Ignore,
            limit_indexed_objects_to: None,
            id_queue_capacity: 1,
            entity_queue_capacity: 32,
            failure_policy: FailurePolicy::Isolate,
            progress_log_interval: 1_000,
        }
    }
}

impl IndexingConfig {
    /// Validate the indexing section
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size_to_load_objects", self.batch_size_to_load_objects),
            ("threads_to_load_objects", self.threads_to_load_objects),
            (
                "threads_for_document_building",
                self.threads_for_document_building,
            ),
            ("id_queue_capacity", self.id_queue_capacity),
            ("entity_queue_capacity", self.entity_queue_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::configuration(format!(
                    "indexing.{name} must be at least 1"
                )));
            }
        }
        if self.progress_log_interval == 0 {
            return Err(Error::configuration(
                "indexing.progress_log_interval must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Cluster configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Shards for indices created without an explicit count
    pub default_number_of_shards: u32,
    /// Replicas for indices created without an explicit count
    pub default_number_of_replicas: u32,
    /// Persisted cluster state generations kept on disk
    pub state_generations_to_keep: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "quarry".to_string(),
            default_number_of_shards: 1,
            default_number_of_replicas: 1,
            state_generations_to_keep: 2,
        }
    }
}

impl ClusterConfig {
    /// Validate the cluster section
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("cluster.name must not be empty"));
        }
        if self.default_number_of_shards == 0 {
            return Err(Error::configuration(
                "cluster.default_number_of_shards must be at least 1",
            ));
        }
        if self.state_generations_to_keep == 0 {
            return Err(Error::configuration(
                "cluster.state_generations_to_keep must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.name, "quarry-node");
        assert_eq!(config.store.store_type, StoreType::Auto);
        assert_eq!(config.indexing.id_queue_capacity, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_type_aliases() {
        assert_eq!("default".parse::<StoreType>().unwrap(), StoreType::Auto);
        assert_eq!("niofs".parse::<StoreType>().unwrap(), StoreType::Buffered);
        assert_eq!("MMAPFS".parse::<StoreType>().unwrap(), StoreType::Mmap);
        assert_eq!("simplefs".parse::<StoreType>().unwrap(), StoreType::Simple);
    }

    #[test]
    fn test_unknown_store_type_rejected() {
        let err = "ramfs".parse::<StoreType>().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = Config::from_toml_str("[store]\nstore_type = \"ramfs\"\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [store]
            store_type = "niofs"
            shared_filesystem = true
            lock_timeout_ms = 200
            lock_poll_interval_ms = 50

            [indexing]
            threads_to_load_objects = 4
            failure_policy = "abort_all"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.store_type, StoreType::Buffered);
        assert!(config.store.shared_filesystem);
        assert_eq!(config.indexing.threads_to_load_objects, 4);
        assert_eq!(config.indexing.threads_for_document_building, 2);
        assert_eq!(config.indexing.failure_policy, FailurePolicy::AbortAll);
        assert_eq!(config.cluster.name, "quarry");
    }

    #[test]
    fn test_invalid_pipeline_parameters() {
        let config = IndexingConfig {
            threads_to_load_objects: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let store = StoreConfig {
            shared_filesystem: true,
            lock_timeout_ms: 10,
            lock_poll_interval_ms: 100,
            ..Default::default()
        };
        assert!(matches!(store.validate(), Err(Error::Configuration(_))));
    }
}
