//! Holder of the current cluster state
//!
//! Readers get a cheap `Arc` of the current snapshot. Writers go through
//! `publish` or `update`, which are serialized and never move the version
//! backwards. With a persister attached, a state is on disk before it
//! becomes visible.

use crate::persist::ClusterStatePersister;
use crate::state::ClusterState;
use parking_lot::{Mutex, RwLock};
use quarry_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Current cluster state plus the publication rules
#[derive(Debug)]
pub struct ClusterStateStore {
    current: RwLock<Arc<ClusterState>>,
    persister: Option<ClusterStatePersister>,
    update_lock: Mutex<()>,
}

impl ClusterStateStore {
    /// Store starting at `initial`, without persistence
    pub fn new(initial: ClusterState) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            persister: None,
            update_lock: Mutex::new(()),
        }
    }

    /// Store that persists every published state
    ///
    /// Starts from the newest persisted generation when there is one,
    /// otherwise persists and uses `initial`.
    pub fn with_persister(initial: ClusterState, persister: ClusterStatePersister) -> Result<Self> {
        let current = match persister.load_latest()? {
            Some(state) => {
                info!(
                    "recovered cluster state [{}] version {}",
                    state.cluster_name(),
                    state.version()
                );
                state
            }
            None => {
                persister.persist(&initial)?;
                initial
            }
        };
        Ok(Self {
            current: RwLock::new(Arc::new(current)),
            persister: Some(persister),
            update_lock: Mutex::new(()),
        })
    }

    /// Current snapshot
    pub fn current(&self) -> Arc<ClusterState> {
        Arc::clone(&self.current.read())
    }

    pub fn persister(&self) -> Option<&ClusterStatePersister> {
        self.persister.as_ref()
    }

    /// Make `state` current
    ///
    /// A lower version, or the same version with a different state uuid, is
    /// rejected with `StaleClusterState`. Re-publishing the current snapshot
    /// is a no-op.
    pub fn publish(&self, state: ClusterState) -> Result<Arc<ClusterState>> {
        let _guard = self.update_lock.lock();
        self.publish_locked(state)
    }

    fn publish_locked(&self, state: ClusterState) -> Result<Arc<ClusterState>> {
        let current = self.current();
        if state.version() < current.version()
            || (state.version() == current.version() && state.state_uuid() != current.state_uuid())
        {
            return Err(Error::StaleClusterState {
                current: current.version(),
                proposed: state.version(),
            });
        }
        if state.version() == current.version() {
            debug!("cluster state version {} already published", state.version());
            return Ok(current);
        }

        if let Some(persister) = &self.persister {
            persister.persist(&state)?;
        }
        let state = Arc::new(state);
        *self.current.write() = Arc::clone(&state);
        info!(
            "published cluster state version {} (was {})",
            state.version(),
            current.version()
        );
        Ok(state)
    }

    /// Run `task` against the current state and publish its result
    ///
    /// A task returning a state with the current version publishes nothing.
    pub fn update<F>(&self, source: &str, task: F) -> Result<Arc<ClusterState>>
    where
        F: FnOnce(&ClusterState) -> Result<ClusterState>,
    {
        let _guard = self.update_lock.lock();
        let current = self.current();
        let next = task(&current).inspect_err(|e| {
            debug!("cluster state update [{}] failed: {}", source, e);
        })?;
        if next.version() == current.version() {
            debug!("cluster state update [{}] made no change", source);
            return Ok(current);
        }
        debug!(
            "cluster state update [{}]: version {} -> {}",
            source,
            current.version(),
            next.version()
        );
        self.publish_locked(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::IndexMetadata;
    use quarry_store::{FsAccess, FsDirectory, NativeFsLockFactory};
    use std::thread;
    use tempfile::tempdir;

    fn initial() -> ClusterState {
        ClusterState::builder("test").version(1).build()
    }

    fn add_index(name: &'static str) -> impl FnOnce(&ClusterState) -> Result<ClusterState> {
        move |current| {
            Ok(ClusterState::builder_from(current)
                .put_index(IndexMetadata::new(name, 1, 0)?)?
                .increment_version()
                .build())
        }
    }

    #[test]
    fn test_publish_rejects_older_version() {
        let store = ClusterStateStore::new(initial());
        let v2 = ClusterState::builder_from(&store.current()).increment_version().build();
        store.publish(v2.clone()).unwrap();

        let err = store.publish(initial()).unwrap_err();
        assert!(matches!(
            err,
            Error::StaleClusterState {
                current: 2,
                proposed: 1
            }
        ));

        // Same snapshot again is fine, a conflicting one is not
        store.publish(v2).unwrap();
        let conflicting = ClusterState::builder("test").version(2).build();
        assert!(store.publish(conflicting).is_err());
    }

    #[test]
    fn test_update_noop_and_error() {
        let store = ClusterStateStore::new(initial());
        let same = store.update("noop", |s| Ok(s.clone())).unwrap();
        assert_eq!(same.version(), 1);

        store.update("create", add_index("books")).unwrap();
        let err = store.update("create again", add_index("books")).unwrap_err();
        assert!(matches!(err, Error::IndexAlreadyExists(_)));
        assert_eq!(store.current().version(), 2);
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let store = Arc::new(ClusterStateStore::new(initial()));
        let names = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let handles: Vec<_> = names
            .into_iter()
            .map(|name| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.update(name, add_index(name)).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let current = store.current();
        assert_eq!(current.version(), 1 + names.len() as u64);
        assert_eq!(current.metadata().indices.len(), names.len());
    }

    #[test]
    fn test_persisted_store_recovers() {
        let dir = tempdir().unwrap();
        let open = || {
            let directory =
                FsDirectory::open(dir.path(), FsAccess::Buffered, Arc::new(NativeFsLockFactory))
                    .unwrap();
            ClusterStatePersister::new(Box::new(directory), 2)
        };

        let store = ClusterStateStore::with_persister(initial(), open()).unwrap();
        store.update("create", add_index("books")).unwrap();
        drop(store);

        let store = ClusterStateStore::with_persister(initial(), open()).unwrap();
        assert_eq!(store.current().version(), 2);
        assert!(store.current().metadata().has_index("books"));
        assert_eq!(store.persister().unwrap().generations().unwrap(), vec![1, 2]);
    }
}
