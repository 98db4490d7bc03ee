//! On-disk cluster state generations
//!
//! Each published state is written as `state-<version>.st`:
//! write to `state-<version>.st.tmp`, fsync, rename into place, sync the
//! directory, then delete generations beyond the retention count. Loading
//! picks the highest complete generation and fails if it does not decode.

use crate::codec;
use crate::state::ClusterState;
use quarry_common::{Error, Result};
use quarry_store::{Directory, read_file};
use std::io::Write;
use tracing::{debug, info, warn};

const PREFIX: &str = "state-";
const SUFFIX: &str = ".st";
const TMP_SUFFIX: &str = ".tmp";

/// Writes and reads cluster state generations in a directory
#[derive(Debug)]
pub struct ClusterStatePersister {
    directory: Box<dyn Directory>,
    generations_to_keep: usize,
}

impl ClusterStatePersister {
    /// Persist into `directory`, keeping the newest `generations_to_keep` files
    pub fn new(directory: Box<dyn Directory>, generations_to_keep: usize) -> Self {
        Self {
            directory,
            generations_to_keep: generations_to_keep.max(1),
        }
    }

    pub fn directory(&self) -> &dyn Directory {
        self.directory.as_ref()
    }

    fn file_name(version: u64) -> String {
        format!("{PREFIX}{version}{SUFFIX}")
    }

    fn parse_generation(name: &str) -> Option<u64> {
        name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
    }

    /// Versions of complete generations on disk, ascending
    pub fn generations(&self) -> Result<Vec<u64>> {
        let mut versions: Vec<u64> = self
            .directory
            .list_all()?
            .iter()
            .filter_map(|n| Self::parse_generation(n))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Durably write `state` as a new generation
    pub fn persist(&self, state: &ClusterState) -> Result<()> {
        let bytes = codec::serialize(state)?;
        let name = Self::file_name(state.version());
        let tmp = format!("{name}{TMP_SUFFIX}");

        if self.directory.file_exists(&tmp)? {
            self.directory.delete_file(&tmp)?;
        }
        let mut out = self.directory.create_output(&tmp)?;
        out.write_all(&bytes)?;
        out.finish()?;

        if self.directory.file_exists(&name)? {
            self.directory.delete_file(&name)?;
        }
        self.directory.rename(&tmp, &name)?;
        self.directory.sync_meta_data()?;
        info!(
            "persisted cluster state version {} ({} bytes)",
            state.version(),
            bytes.len()
        );

        self.cleanup()
    }

    fn cleanup(&self) -> Result<()> {
        let versions = self.generations()?;
        if versions.len() <= self.generations_to_keep {
            return Ok(());
        }
        let stale = versions.len() - self.generations_to_keep;
        for version in &versions[..stale] {
            let name = Self::file_name(*version);
            if let Err(e) = self.directory.delete_file(&name) {
                warn!("failed to delete old cluster state {}: {}", name, e);
            } else {
                debug!("deleted old cluster state {}", name);
            }
        }
        Ok(())
    }

    /// Read the newest generation, if any
    pub fn load_latest(&self) -> Result<Option<ClusterState>> {
        let Some(version) = self.generations()?.last().copied() else {
            return Ok(None);
        };
        let name = Self::file_name(version);
        let bytes = read_file(self.directory.as_ref(), &name)?;
        let state = codec::deserialize(&bytes)
            .map_err(|e| Error::format(format!("{name}: {e}")))?;
        if state.version() != version {
            return Err(Error::format(format!(
                "{name} holds cluster state version {}",
                state.version()
            )));
        }
        Ok(Some(state))
    }
}
