//! Indexing backend that writes one segment per shard
//!
//! Documents are routed to a shard of the target index with the cluster
//! state's operation routing. Pending documents are kept apart per entity
//! type, so one pipeline's flush or discard never touches another's work.
//! Within a type each shard hands out doc ids and keeps one `PerThreadNorms`
//! slot per document building worker; a worker only ever locks its own slot.
//! Flushing a type merges its slots into a norms file plus segment info in
//! each shard's store directory, holding the shard's write lock.

use crate::source::{DocumentWork, IndexingBackend};
use parking_lot::{Mutex, RwLock};
use quarry_cluster::{ClusterState, IndexMetadata, operation};
use quarry_common::{DocId, Error, Result, ShardId};
use quarry_index::{
    FieldInfos, NormsFileInfo, NormsWriter, PerThreadNorms, SegmentMeta, encode_norm, length_norm,
};
use quarry_store::{Directory, DirectoryService, StoreDirectory, WRITE_LOCK_NAME};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// Segment written by a flush
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushedSegment {
    pub entity_type: String,
    pub shard_id: ShardId,
    pub segment: String,
    pub max_doc: u32,
    pub norms: NormsFileInfo,
}

/// Documents of one entity type on one shard, not yet flushed
struct PendingSegment {
    next_doc: AtomicU32,
    field_infos: Mutex<FieldInfos>,
    slots: Vec<Mutex<PerThreadNorms>>,
}

impl PendingSegment {
    fn new(workers: usize) -> Self {
        Self {
            next_doc: AtomicU32::new(0),
            field_infos: Mutex::new(FieldInfos::new()),
            slots: (0..workers).map(|_| Mutex::new(PerThreadNorms::new())).collect(),
        }
    }

    fn add(&self, slot: usize, work: &DocumentWork) -> Result<DocId> {
        // Lock order: slot, then field infos (same as flush)
        let mut norms = self.slots[slot].lock();

        // Repeats of a field share one norm: boosts multiply, terms add up
        let mut normed: BTreeMap<u32, (f32, usize)> = BTreeMap::new();
        {
            let mut infos = self.field_infos.lock();
            for field in &work.document.fields {
                let number = infos.add_field(field);
                if field.has_norms() {
                    let entry = normed.entry(number).or_insert((1.0, 0));
                    entry.0 *= field.boost;
                    entry.1 += field.num_terms();
                }
            }
        }

        // Doc ids are taken under the slot lock so every slot sees them in order
        let doc = self.next_doc.fetch_add(1, Ordering::SeqCst);
        for (number, (boost, terms)) in normed {
            norms.add(number, doc, encode_norm(length_norm(boost, terms)))?;
        }
        Ok(doc)
    }

    fn pending(&self) -> u32 {
        self.next_doc.load(Ordering::SeqCst)
    }
}

/// Pending documents of one entity type, per shard number
struct Partition {
    shards: BTreeMap<u32, PendingSegment>,
}

/// Store directory of one shard
struct ShardStore {
    shard_id: ShardId,
    directory: StoreDirectory,
    flush_lock: Mutex<()>,
}

impl ShardStore {
    fn next_segment_name(&self) -> Result<String> {
        let existing = SegmentMeta::list(&self.directory)?;
        Ok(format!("_{}", existing.len()))
    }

    fn flush(
        &self,
        entity_type: &str,
        pending: &PendingSegment,
    ) -> Result<Option<FlushedSegment>> {
        let _flushing = self.flush_lock.lock();
        let mut slots: Vec<_> = pending.slots.iter().map(|s| s.lock()).collect();
        let max_doc = pending.pending();
        if max_doc == 0 {
            return Ok(None);
        }

        let _write_lock = self.directory.obtain_lock(WRITE_LOCK_NAME)?;
        let segment = self.next_segment_name()?;
        let field_infos = pending.field_infos.lock().clone();

        let per_thread: Vec<&PerThreadNorms> = slots.iter().map(|s| &**s).collect();
        let norms = NormsWriter::flush(&per_thread, &field_infos, max_doc, &self.directory, &segment)?;

        let mut meta = SegmentMeta::new(segment.clone(), max_doc, &field_infos);
        meta.files.push(norms.file_name.clone());
        if let Err(e) = meta.write(&self.directory) {
            if let Err(cleanup) = self.directory.delete_file(&norms.file_name) {
                warn!(
                    "could not remove {} after failed flush of {}: {}",
                    norms.file_name, self.shard_id, cleanup
                );
            }
            return Err(e);
        }
        self.directory
            .sync(&[norms.file_name.clone(), SegmentMeta::file_name(&segment)])?;
        self.directory.sync_meta_data()?;

        for slot in &mut slots {
            slot.reset();
        }
        *pending.field_infos.lock() = FieldInfos::new();
        pending.next_doc.store(0, Ordering::SeqCst);

        info!(
            "flushed segment {} of {} for shard {} ({} docs, {} normed fields)",
            segment,
            entity_type,
            self.shard_id,
            max_doc,
            norms.fields.len()
        );
        Ok(Some(FlushedSegment {
            entity_type: entity_type.to_string(),
            shard_id: self.shard_id.clone(),
            segment,
            max_doc,
            norms,
        }))
    }
}

/// Routes documents of one index to per-shard segments
pub struct ShardSegmentBackend {
    index: IndexMetadata,
    workers: usize,
    stores: BTreeMap<u32, ShardStore>,
    partitions: RwLock<HashMap<String, Arc<Partition>>>,
    flushed: Mutex<Vec<FlushedSegment>>,
}

impl ShardSegmentBackend {
    /// Open one store directory per shard of `index` under `data_path`
    ///
    /// `workers` is the number of document building threads that will call
    /// `apply`; each gets its own norms slot per shard.
    pub fn new(
        state: &ClusterState,
        index: &str,
        service: &DirectoryService,
        data_path: &Path,
        workers: usize,
    ) -> Result<Self> {
        let index = state.metadata().index_or_err(index)?.clone();
        if workers == 0 {
            return Err(Error::configuration("segment backend needs at least one worker slot"));
        }

        let mut stores = BTreeMap::new();
        for number in 0..index.number_of_shards {
            let shard_id = ShardId::new(index.name.clone(), number);
            let directory = service.new_directory(data_path.join(shard_id.dir_name()))?;
            stores.insert(
                number,
                ShardStore {
                    shard_id,
                    directory,
                    flush_lock: Mutex::new(()),
                },
            );
        }
        debug!(
            "segment backend for {} over {} shards, {} worker slots",
            index.name,
            stores.len(),
            workers
        );

        Ok(Self {
            index,
            workers,
            stores,
            partitions: RwLock::new(HashMap::new()),
            flushed: Mutex::new(Vec::new()),
        })
    }

    pub fn index(&self) -> &IndexMetadata {
        &self.index
    }

    /// Documents applied since the last flush, per shard, over every entity type
    pub fn pending_docs(&self) -> BTreeMap<u32, u32> {
        let mut pending: BTreeMap<u32, u32> = self.stores.keys().map(|n| (*n, 0)).collect();
        for partition in self.partitions.read().values() {
            for (number, segment) in &partition.shards {
                *pending.entry(*number).or_default() += segment.pending();
            }
        }
        pending
    }

    /// Every segment flushed so far
    pub fn flushed_segments(&self) -> Vec<FlushedSegment> {
        self.flushed.lock().clone()
    }

    /// Store directory of a shard
    pub fn directory(&self, shard: u32) -> Option<&StoreDirectory> {
        self.stores.get(&shard).map(|s| &s.directory)
    }

    fn partition(&self, entity_type: &str) -> Arc<Partition> {
        if let Some(partition) = self.partitions.read().get(entity_type) {
            return partition.clone();
        }
        self.partitions
            .write()
            .entry(entity_type.to_string())
            .or_insert_with(|| {
                Arc::new(Partition {
                    shards: self
                        .stores
                        .keys()
                        .map(|n| (*n, PendingSegment::new(self.workers)))
                        .collect(),
                })
            })
            .clone()
    }

    fn flush_partition(&self, entity_type: &str, partition: &Partition) -> Result<()> {
        for (number, store) in &self.stores {
            let Some(pending) = partition.shards.get(number) else {
                continue;
            };
            if let Some(segment) = store.flush(entity_type, pending)? {
                self.flushed.lock().push(segment);
            }
        }
        Ok(())
    }
}

impl IndexingBackend for ShardSegmentBackend {
    fn apply(&self, work: DocumentWork) -> Result<()> {
        let shard_id = operation::shard_id(&self.index, work.id.as_str());
        if work.producer >= self.workers {
            return Err(Error::invariant(format!(
                "document builder {} has no norms slot ({} slots)",
                work.producer, self.workers
            )));
        }
        let partition = self.partition(&work.entity_type);
        let pending = partition
            .shards
            .get(&shard_id.shard)
            .ok_or_else(|| Error::ShardNotFound(shard_id.to_string()))?;
        pending.add(work.producer, &work)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let partitions: Vec<(String, Arc<Partition>)> = self
            .partitions
            .read()
            .iter()
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();
        for (entity_type, partition) in partitions {
            self.flush_partition(&entity_type, &partition)?;
        }
        Ok(())
    }

    fn flush_entity_type(&self, entity_type: &str) -> Result<()> {
        let partition = self.partitions.read().get(entity_type).cloned();
        match partition {
            Some(partition) => self.flush_partition(entity_type, &partition),
            None => Ok(()),
        }
    }

    fn discard(&self, entity_type: &str) -> Result<()> {
        if let Some(partition) = self.partitions.write().remove(entity_type) {
            let dropped: u32 = partition.shards.values().map(PendingSegment::pending).sum();
            debug!("discarded {} pending {} documents", dropped, entity_type);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::EntityId;
    use quarry_common::config::{StoreConfig, StoreType};
    use quarry_index::{DEFAULT_NORM, Document, Field, NormsReader};
    use tempfile::tempdir;

    fn state() -> ClusterState {
        ClusterState::builder("test")
            .put_index(IndexMetadata::new("books", 2, 0).unwrap())
            .unwrap()
            .build()
    }

    fn service() -> DirectoryService {
        DirectoryService::new(StoreConfig {
            store_type: StoreType::Buffered,
            ..Default::default()
        })
        .unwrap()
    }

    fn typed_work(entity_type: &str, id: u32, producer: usize, doc: Document) -> DocumentWork {
        DocumentWork {
            entity_type: entity_type.into(),
            id: EntityId::from(u64::from(id)),
            producer,
            document: doc,
        }
    }

    fn work(id: u32, producer: usize, doc: Document) -> DocumentWork {
        typed_work("book", id, producer, doc)
    }

    fn total_pending(backend: &ShardSegmentBackend) -> u32 {
        backend.pending_docs().values().sum()
    }

    #[test]
    fn test_unknown_index() {
        let dir = tempdir().unwrap();
        let err = ShardSegmentBackend::new(&state(), "films", &service(), dir.path(), 2)
            .err()
            .unwrap();
        assert!(matches!(err, Error::IndexNotFound(_)));
    }

    #[test]
    fn test_apply_and_flush_segments() {
        let dir = tempdir().unwrap();
        let backend = ShardSegmentBackend::new(&state(), "books", &service(), dir.path(), 2).unwrap();

        for i in 0..20u32 {
            let mut doc = Document::new().with_field(Field::keyword("id", i.to_string()));
            if i % 2 == 0 {
                doc.add(Field::text("title", "one two three four"));
            }
            backend.apply(work(i, (i % 2) as usize, doc)).unwrap();
        }
        assert_eq!(total_pending(&backend), 20);

        backend.flush().unwrap();
        let segments = backend.flushed_segments();
        assert_eq!(segments.iter().map(|s| s.max_doc).sum::<u32>(), 20);
        assert_eq!(total_pending(&backend), 0);

        for segment in &segments {
            assert_eq!(segment.entity_type, "book");
            let directory = backend.directory(segment.shard_id.shard).unwrap();
            let meta = SegmentMeta::read(directory, &segment.segment).unwrap();
            assert_eq!(meta.max_doc, segment.max_doc);

            let infos = meta.field_infos().unwrap();
            let reader = NormsReader::open(directory, &segment.segment, &infos, meta.max_doc).unwrap();
            let title = reader.norms("title").unwrap();
            assert_eq!(title.len(), meta.max_doc as usize);
            // 1/sqrt(4) for titled documents, default for the rest
            assert!(title.iter().all(|b| *b == encode_norm(0.5) || *b == DEFAULT_NORM));
            assert!(reader.norms("id").is_none());
        }

        // A second flush with nothing pending writes nothing
        backend.flush().unwrap();
        assert_eq!(backend.flushed_segments().len(), segments.len());
    }

    #[test]
    fn test_next_flush_uses_new_segment_name() {
        let dir = tempdir().unwrap();
        let backend = ShardSegmentBackend::new(&state(), "books", &service(), dir.path(), 1).unwrap();
        let doc = || Document::new().with_field(Field::text("title", "a"));

        // Keep applying the same id so both flushes hit one shard
        backend.apply(work(7, 0, doc())).unwrap();
        backend.flush().unwrap();
        backend.apply(work(7, 0, doc())).unwrap();
        backend.flush().unwrap();

        let names: Vec<String> = backend
            .flushed_segments()
            .into_iter()
            .map(|s| s.segment)
            .collect();
        assert_eq!(names, vec!["_0", "_1"]);
    }

    #[test]
    fn test_producer_without_slot_rejected() {
        let dir = tempdir().unwrap();
        let backend = ShardSegmentBackend::new(&state(), "books", &service(), dir.path(), 1).unwrap();
        let err = backend.apply(work(1, 3, Document::new())).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_repeated_field_gets_one_norm() {
        let dir = tempdir().unwrap();
        let backend = ShardSegmentBackend::new(&state(), "books", &service(), dir.path(), 1).unwrap();

        let doc = Document::new()
            .with_field(Field::text("tag", "rust"))
            .with_field(Field::text("tag", "search engine"))
            .with_field(Field::text("title", "one"));
        backend.apply(work(3, 0, doc)).unwrap();
        backend.flush().unwrap();

        let segments = backend.flushed_segments();
        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        let directory = backend.directory(segment.shard_id.shard).unwrap();
        let meta = SegmentMeta::read(directory, &segment.segment).unwrap();
        let infos = meta.field_infos().unwrap();
        let reader = NormsReader::open(directory, &segment.segment, &infos, meta.max_doc).unwrap();

        // Both values of "tag" count toward one length of three terms
        assert_eq!(reader.norms("tag").unwrap(), [encode_norm(length_norm(1.0, 3))]);
        assert_eq!(reader.norms("title").unwrap(), [encode_norm(length_norm(1.0, 1))]);
    }

    #[test]
    fn test_flush_of_one_type_leaves_others_pending() {
        let dir = tempdir().unwrap();
        let backend = ShardSegmentBackend::new(&state(), "books", &service(), dir.path(), 2).unwrap();
        let doc = || Document::new().with_field(Field::text("title", "one two"));

        for i in 0..10u32 {
            backend.apply(typed_work("author", i, 0, doc())).unwrap();
            backend.apply(typed_work("book", i, 1, doc())).unwrap();
        }
        assert_eq!(total_pending(&backend), 20);

        backend.flush_entity_type("book").unwrap();
        let segments = backend.flushed_segments();
        assert!(segments.iter().all(|s| s.entity_type == "book"));
        assert_eq!(segments.iter().map(|s| s.max_doc).sum::<u32>(), 10);
        assert_eq!(total_pending(&backend), 10);

        // Unknown types flush and discard as no-ops
        backend.flush_entity_type("film").unwrap();
        backend.discard("film").unwrap();
        assert_eq!(total_pending(&backend), 10);
    }

    #[test]
    fn test_discarded_type_is_never_flushed() {
        let dir = tempdir().unwrap();
        let backend = ShardSegmentBackend::new(&state(), "books", &service(), dir.path(), 1).unwrap();
        let doc = || Document::new().with_field(Field::text("title", "one"));

        for i in 0..6u32 {
            backend.apply(typed_work("good", i, 0, doc())).unwrap();
            backend.apply(typed_work("bad", i, 0, doc())).unwrap();
        }
        backend.discard("bad").unwrap();
        assert_eq!(total_pending(&backend), 6);

        backend.flush().unwrap();
        let segments = backend.flushed_segments();
        assert!(segments.iter().all(|s| s.entity_type == "good"));
        assert_eq!(segments.iter().map(|s| s.max_doc).sum::<u32>(), 6);
        assert_eq!(total_pending(&backend), 0);
    }

    #[test]
    fn test_failed_shard_keeps_earlier_segments_and_cleans_up() {
        let dir = tempdir().unwrap();
        let backend = ShardSegmentBackend::new(&state(), "books", &service(), dir.path(), 1).unwrap();
        for i in 0..20u32 {
            let doc = Document::new().with_field(Field::text("title", "one two"));
            backend.apply(work(i, 0, doc)).unwrap();
        }
        let before = backend.pending_docs();
        assert!(before.values().all(|n| *n > 0));

        // Shard 0 flushes first; a directory squatting on shard 1's segment info breaks its write
        let blocker = dir
            .path()
            .join(ShardId::new("books", 1).dir_name())
            .join(SegmentMeta::file_name("_0"));
        std::fs::create_dir(&blocker).unwrap();
        assert!(backend.flush().is_err());

        let segments = backend.flushed_segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].shard_id.shard, 0);
        let left: Vec<String> = backend.directory(1).unwrap().list_all().unwrap();
        assert!(!left.iter().any(|n| n.starts_with("_0.")), "{left:?}");
        assert_eq!(backend.pending_docs()[&0], 0);
        assert_eq!(backend.pending_docs()[&1], before[&1]);

        std::fs::remove_dir(&blocker).unwrap();
        backend.flush().unwrap();
        let segments = backend.flushed_segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments.iter().map(|s| s.max_doc).sum::<u32>(), 20);
    }
}
