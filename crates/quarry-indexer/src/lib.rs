//! Quarry Indexer - parallel batch indexing
//!
//! A `MassIndexer` runs one `BatchIndexingWorkspace` per entity type. Each
//! workspace is a three stage pipeline of named worker threads connected by
//! bounded channels: an identifier producer, entity loaders, and document
//! builders that hand finished documents to an `IndexingBackend`.
//!
//! `ShardSegmentBackend` is the backend that routes documents to the shards
//! of an index and flushes them as norms segments into each shard's store.
//!
//! # Example
//! ```ignore
//! let backend = Arc::new(ShardSegmentBackend::new(&state, "books", &service, data, 4)?);
//! let report = MassIndexer::new(config, backend)
//!     .type_to_index(BookSource::new(db))
//!     .start_and_wait()?;
//! ```

pub mod backend;
pub mod latch;
pub mod mass_indexer;
pub mod monitor;
pub mod source;
pub mod workspace;

pub use backend::{FlushedSegment, ShardSegmentBackend};
pub use latch::{CountDownGuard, CountDownLatch};
pub use mass_indexer::{MassIndexer, MassIndexerReport, PipelineContext};
pub use monitor::{LoggingProgressMonitor, ProgressMonitor};
pub use source::{DocumentWork, EntitySource, IdentifierStream, IndexingBackend};
pub use workspace::{BatchIndexingWorkspace, WorkspaceReport};
