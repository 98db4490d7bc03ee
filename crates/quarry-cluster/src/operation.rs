//! Document to shard routing
//!
//! A routing key (usually the document id) is hashed with xxHash64 and taken
//! modulo the index's primary shard count. The shard count is fixed at index
//! creation, so a key always lands on the same shard.

use crate::metadata::IndexMetadata;
use crate::routing::ShardRouting;
use crate::state::ClusterState;
use quarry_common::{Result, ShardId};
use xxhash_rust::xxh64::xxh64;

const ROUTING_SEED: u64 = 0;

/// Hash of a routing key
pub fn routing_hash(key: &str) -> u64 {
    xxh64(key.as_bytes(), ROUTING_SEED)
}

/// Shard a routing key maps to
pub fn shard_id(index: &IndexMetadata, routing_key: &str) -> ShardId {
    let shard = routing_hash(routing_key) % u64::from(index.number_of_shards);
    // number_of_shards is a u32, so the remainder fits
    ShardId::new(index.name.clone(), shard as u32)
}

/// Primary copy responsible for indexing `routing_key` into `index`
pub fn index_shard<'a>(
    state: &'a ClusterState,
    index: &str,
    routing_key: &str,
) -> Result<&'a ShardRouting> {
    let metadata = state.metadata().index_or_err(index)?;
    state.routing_table().primary(&shard_id(metadata, routing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::Error;

    #[test]
    fn test_routing_is_stable_and_in_range() {
        let index = IndexMetadata::new("books", 5, 0).unwrap();
        for i in 0..1000 {
            let key = format!("doc-{i}");
            let a = shard_id(&index, &key);
            let b = shard_id(&index, &key);
            assert_eq!(a, b);
            assert!(a.shard < 5);
            assert_eq!(a.index, "books");
        }
    }

    #[test]
    fn test_keys_spread_over_shards() {
        let index = IndexMetadata::new("books", 4, 0).unwrap();
        let mut counts = [0usize; 4];
        for i in 0..4000 {
            counts[shard_id(&index, &i.to_string()).shard as usize] += 1;
        }
        assert!(counts.iter().all(|c| *c > 700), "{counts:?}");
    }

    #[test]
    fn test_index_shard_returns_primary() {
        let state = ClusterState::builder("test")
            .put_index(IndexMetadata::new("books", 3, 1).unwrap())
            .unwrap()
            .build();
        let copy = index_shard(&state, "books", "doc-1").unwrap();
        assert!(copy.primary);
        assert!(matches!(
            index_shard(&state, "missing", "doc-1"),
            Err(Error::IndexNotFound(_))
        ));
    }
}
