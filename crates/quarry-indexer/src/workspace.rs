//! Batch indexing workspace: one pipeline for one entity type
//!
//! ```text
//!                  id queue                 entity queue
//! identifier ──▶ [bounded] ──▶ N loaders ──▶ [bounded] ──▶ M builders ──▶ backend
//!  producer      (batches)                  (entities)      (documents)
//! ```
//!
//! Consumers are started before producers. Each builder holds a guard on the
//! `producers_done` latch; the driver waits on it, flushes the backend for
//! its entity type, and finally counts down the shared `run_complete` latch.
//! The first worker failure is kept and raises the abort flag; from then on
//! every worker drains its input without processing it, so no sender blocks
//! forever and every latch is released. A failed or aborted run discards
//! what it already handed to the backend.

use crate::latch::CountDownLatch;
use crate::monitor::ProgressMonitor;
use crate::source::{DocumentWork, EntitySource, IndexingBackend};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use quarry_common::config::IndexingConfig;
use quarry_common::{EntityId, Error, Result};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const STAGE_IDENTIFIERS: &str = "identifier_producer";
pub const STAGE_LOADING: &str = "entity_loader";
pub const STAGE_BUILDING: &str = "document_builder";
const STAGE_SETUP: &str = "setup";

/// Outcome of one successful pipeline run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceReport {
    pub entity_type: String,
    pub identifiers: u64,
    pub entities_loaded: u64,
    pub documents_added: u64,
    pub elapsed: Duration,
}

/// State shared by the workers of one run
struct PipelineState<'a> {
    entity_type: &'a str,
    abort: &'a AtomicBool,
    first_error: Mutex<Option<Error>>,
    identifiers: AtomicU64,
    loaded: AtomicU64,
    added: AtomicU64,
}

impl<'a> PipelineState<'a> {
    fn new(entity_type: &'a str, abort: &'a AtomicBool) -> Self {
        Self {
            entity_type,
            abort,
            first_error: Mutex::new(None),
            identifiers: AtomicU64::new(0),
            loaded: AtomicU64::new(0),
            added: AtomicU64::new(0),
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Record a worker failure and stop the pipeline
    fn fail(&self, stage: &str, error: Error) {
        let error = match error {
            e @ Error::PipelineWorker { .. } => e,
            other => Error::pipeline_worker(self.entity_type, stage, other),
        };
        self.abort.store(true, Ordering::Release);

        let mut slot = self.first_error.lock();
        if slot.is_none() {
            error!("{}", error);
            *slot = Some(error);
        } else {
            warn!("additional failure after abort: {}", error);
        }
    }

    fn take_error(&self) -> Option<Error> {
        self.first_error.lock().take()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Runs the pipeline for one entity source
pub struct BatchIndexingWorkspace<'a, S: EntitySource> {
    source: &'a S,
    backend: Arc<dyn IndexingBackend>,
    monitor: Arc<dyn ProgressMonitor>,
    config: IndexingConfig,
    run_complete: Arc<CountDownLatch>,
    abort: Arc<AtomicBool>,
}

impl<'a, S: EntitySource> BatchIndexingWorkspace<'a, S> {
    pub fn new(
        source: &'a S,
        backend: Arc<dyn IndexingBackend>,
        monitor: Arc<dyn ProgressMonitor>,
        config: IndexingConfig,
        run_complete: Arc<CountDownLatch>,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            backend,
            monitor,
            config,
            run_complete,
            abort,
        }
    }

    /// Run to completion; `run_complete` is counted down on every path
    pub fn run(self) -> Result<WorkspaceReport> {
        let _complete = self.run_complete.guard();
        let started = Instant::now();

        let result = self.run_pipeline(started);
        match &result {
            Ok(report) => info!(
                "indexed {} {} documents in {:.1?}",
                report.documents_added, report.entity_type, report.elapsed
            ),
            Err(e) => error!(
                "indexing of {} failed after {:.1?}: {}",
                self.source.entity_type(),
                started.elapsed(),
                e
            ),
        }
        result
    }

    fn run_pipeline(&self, started: Instant) -> Result<WorkspaceReport> {
        self.config.validate()?;

        let entity_type = self.source.entity_type().to_string();
        let loaders = self.config.threads_to_load_objects;
        let builders = self.config.threads_for_document_building;
        info!(
            "indexing {} with {} loading and {} document building threads",
            entity_type, loaders, builders
        );

        let state = PipelineState::new(&entity_type, &self.abort);
        let (id_tx, id_rx) = bounded::<Vec<EntityId>>(self.config.id_queue_capacity);
        let (entity_tx, entity_rx) = bounded::<S::Entity>(self.config.entity_queue_capacity);
        let producers_done = Arc::new(CountDownLatch::new(builders));

        thread::scope(|scope| {
            let state = &state;
            let mut handles = Vec::with_capacity(builders + loaders + 1);

            for worker in 0..builders {
                let rx = entity_rx.clone();
                let done = producers_done.guard();
                let spawned = thread::Builder::new()
                    .name(format!("quarry-{entity_type}-build-{worker}"))
                    .spawn_scoped(scope, move || {
                        let _done = done;
                        self.build_documents(worker, &rx, state);
                    });
                match spawned {
                    Ok(handle) => handles.push((STAGE_BUILDING, handle)),
                    Err(e) => state.fail(STAGE_SETUP, e.into()),
                }
            }
            drop(entity_rx);

            for worker in 0..loaders {
                let rx = id_rx.clone();
                let tx = entity_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("quarry-{entity_type}-load-{worker}"))
                    .spawn_scoped(scope, move || self.load_entities(&rx, &tx, state));
                match spawned {
                    Ok(handle) => handles.push((STAGE_LOADING, handle)),
                    Err(e) => state.fail(STAGE_SETUP, e.into()),
                }
            }
            drop(id_rx);
            drop(entity_tx);

            let spawned = thread::Builder::new()
                .name(format!("quarry-{entity_type}-ids"))
                .spawn_scoped(scope, move || self.produce_identifiers(&id_tx, state));
            match spawned {
                Ok(handle) => handles.push((STAGE_IDENTIFIERS, handle)),
                Err(e) => state.fail(STAGE_SETUP, e.into()),
            }

            producers_done.wait();
            debug!("{} document builders finished", entity_type);

            for (stage, handle) in handles {
                if let Err(panic) = handle.join() {
                    state.fail(stage, Error::internal(panic_message(panic.as_ref())));
                }
            }
        });

        let failure = match state.take_error() {
            Some(error) => Some(error),
            None if state.aborted() => Some(Error::PipelineAborted(format!(
                "{entity_type}: stopped by another pipeline"
            ))),
            None => None,
        };
        if let Some(error) = failure {
            if let Err(e) = self.backend.discard(&entity_type) {
                warn!("could not discard pending {} documents: {}", entity_type, e);
            }
            return Err(error);
        }

        self.backend
            .flush_entity_type(&entity_type)
            .map_err(|e| Error::pipeline_worker(&entity_type, "flush", e))?;

        Ok(WorkspaceReport {
            entity_type: entity_type.clone(),
            identifiers: state.identifiers.load(Ordering::Relaxed),
            entities_loaded: state.loaded.load(Ordering::Relaxed),
            documents_added: state.added.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        })
    }

    fn produce_identifiers(&self, tx: &Sender<Vec<EntityId>>, state: &PipelineState<'_>) {
        let ids = match self.source.identifiers() {
            Ok(ids) => ids,
            Err(e) => return state.fail(STAGE_IDENTIFIERS, e),
        };
        let batch_size = self.config.batch_size_to_load_objects;
        let limit = self.config.limit_indexed_objects_to;
        let mut batch = Vec::with_capacity(batch_size);
        let mut produced = 0u64;

        for id in ids {
            if state.aborted() {
                return;
            }
            if limit.is_some_and(|limit| produced >= limit) {
                debug!("{}: stopping at limit of {} identifiers", state.entity_type, produced);
                break;
            }
            match id {
                Ok(id) => batch.push(id),
                Err(e) => return state.fail(STAGE_IDENTIFIERS, e),
            }
            produced += 1;
            state.identifiers.store(produced, Ordering::Relaxed);

            if batch.len() == batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                self.monitor.documents_to_add(full.len() as u64);
                if tx.send(full).is_err() {
                    return state.fail(
                        STAGE_IDENTIFIERS,
                        Error::internal("entity loaders exited early"),
                    );
                }
            }
        }

        if !batch.is_empty() {
            self.monitor.documents_to_add(batch.len() as u64);
            if tx.send(batch).is_err() {
                state.fail(STAGE_IDENTIFIERS, Error::internal("entity loaders exited early"));
            }
        }
    }

    fn load_entities(
        &self,
        rx: &Receiver<Vec<EntityId>>,
        tx: &Sender<S::Entity>,
        state: &PipelineState<'_>,
    ) {
        for ids in rx {
            if state.aborted() {
                continue;
            }
            match self.source.load(&ids, self.config.cache_mode) {
                Ok(entities) => {
                    let count = entities.len() as u64;
                    self.monitor.entities_loaded(count);
                    state.loaded.fetch_add(count, Ordering::Relaxed);
                    for entity in entities {
                        if tx.send(entity).is_err() {
                            state.fail(
                                STAGE_LOADING,
                                Error::internal("document builders exited early"),
                            );
                            break;
                        }
                    }
                }
                Err(e) => state.fail(STAGE_LOADING, e),
            }
        }
    }

    fn build_documents(&self, worker: usize, rx: &Receiver<S::Entity>, state: &PipelineState<'_>) {
        for entity in rx {
            if state.aborted() {
                continue;
            }
            let id = self.source.entity_id(&entity);
            let result = self.source.build_document(&entity).and_then(|document| {
                self.monitor.documents_built(1);
                self.backend.apply(DocumentWork {
                    entity_type: state.entity_type.to_string(),
                    id: id.clone(),
                    producer: worker,
                    document,
                })
            });
            match result {
                Ok(()) => {
                    self.monitor.documents_added(1);
                    state.added.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => state.fail(
                    STAGE_BUILDING,
                    Error::pipeline_worker(state.entity_type, STAGE_BUILDING, format!("{id}: {e}")),
                ),
            }
        }
    }
}
