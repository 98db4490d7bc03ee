//! Mass indexing of several entity types
//!
//! Every entity type gets its own `BatchIndexingWorkspace`, all running in
//! parallel against one backend and one progress monitor. The caller waits
//! on a single `run_complete` latch sized to the number of pipelines.
//!
//! With `FailurePolicy::Isolate` a failing pipeline stops only itself; with
//! `FailurePolicy::AbortAll` all pipelines share one abort flag and the first
//! failure drains every pipeline.

use crate::latch::CountDownLatch;
use crate::monitor::{LoggingProgressMonitor, ProgressMonitor};
use crate::source::{EntitySource, IndexingBackend};
use crate::workspace::{BatchIndexingWorkspace, WorkspaceReport};
use quarry_common::config::{FailurePolicy, IndexingConfig};
use quarry_common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// What one pipeline needs from the mass indexer
pub struct PipelineContext {
    pub backend: Arc<dyn IndexingBackend>,
    pub monitor: Arc<dyn ProgressMonitor>,
    pub config: IndexingConfig,
    pub run_complete: Arc<CountDownLatch>,
    pub abort: Arc<AtomicBool>,
}

type Pipeline<'a> = Box<dyn FnOnce(PipelineContext) -> Result<WorkspaceReport> + Send + 'a>;

/// Per entity type outcome of a mass indexing run
#[derive(Debug)]
pub struct MassIndexerReport {
    pub results: Vec<(String, Result<WorkspaceReport>)>,
    pub elapsed: Duration,
}

impl MassIndexerReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// Documents added by the pipelines that succeeded
    pub fn documents_added(&self) -> u64 {
        self.results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .map(|r| r.documents_added)
            .sum()
    }

    /// Entity types whose pipeline failed, with the error
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.results
            .iter()
            .filter_map(|(t, r)| r.as_ref().err().map(|e| (t.as_str(), e)))
    }

    pub fn result(&self, entity_type: &str) -> Option<&Result<WorkspaceReport>> {
        self.results
            .iter()
            .find(|(t, _)| t == entity_type)
            .map(|(_, r)| r)
    }
}

/// Indexes every registered entity type in parallel
pub struct MassIndexer<'a> {
    config: IndexingConfig,
    backend: Arc<dyn IndexingBackend>,
    monitor: Arc<dyn ProgressMonitor>,
    pipelines: Vec<(String, Pipeline<'a>)>,
}

impl<'a> MassIndexer<'a> {
    pub fn new(config: IndexingConfig, backend: Arc<dyn IndexingBackend>) -> Self {
        let monitor = Arc::new(LoggingProgressMonitor::new(config.progress_log_interval));
        Self {
            config,
            backend,
            monitor,
            pipelines: Vec::new(),
        }
    }

    #[must_use]
    pub fn monitor(mut self, monitor: Arc<dyn ProgressMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Register an entity type
    #[must_use]
    pub fn type_to_index<S: EntitySource + 'a>(mut self, source: S) -> Self {
        let entity_type = source.entity_type().to_string();
        let pipeline: Pipeline<'a> = Box::new(move |ctx: PipelineContext| {
            BatchIndexingWorkspace::new(
                &source,
                ctx.backend,
                ctx.monitor,
                ctx.config,
                ctx.run_complete,
                ctx.abort,
            )
            .run()
        });
        self.pipelines.push((entity_type, pipeline));
        self
    }

    /// Run all pipelines and wait for every one of them
    pub fn start_and_wait(self) -> Result<MassIndexerReport> {
        self.config.validate()?;
        let started = Instant::now();
        let run_complete = Arc::new(CountDownLatch::new(self.pipelines.len()));
        let shared_abort = Arc::new(AtomicBool::new(false));
        info!(
            "mass indexing {} entity types ({:?} failure policy)",
            self.pipelines.len(),
            self.config.failure_policy
        );

        let results = thread::scope(|scope| {
            let mut running = Vec::with_capacity(self.pipelines.len());
            let mut results = Vec::with_capacity(self.pipelines.len());

            for (entity_type, pipeline) in self.pipelines {
                let abort = match self.config.failure_policy {
                    FailurePolicy::AbortAll => Arc::clone(&shared_abort),
                    FailurePolicy::Isolate => Arc::new(AtomicBool::new(false)),
                };
                let ctx = PipelineContext {
                    backend: Arc::clone(&self.backend),
                    monitor: Arc::clone(&self.monitor),
                    config: self.config.clone(),
                    run_complete: Arc::clone(&run_complete),
                    abort,
                };
                let spawned = thread::Builder::new()
                    .name(format!("quarry-mass-{entity_type}"))
                    .spawn_scoped(scope, move || pipeline(ctx));
                match spawned {
                    Ok(handle) => running.push((entity_type, handle)),
                    Err(e) => {
                        // The pipeline never ran, so release its count here
                        run_complete.count_down();
                        results.push((entity_type, Err(e.into())));
                    }
                }
            }

            run_complete.wait();

            for (entity_type, handle) in running {
                let result = handle.join().unwrap_or_else(|_| {
                    Err(Error::internal(format!("{entity_type} pipeline panicked")))
                });
                results.push((entity_type, result));
            }
            results
        });

        self.monitor.indexing_completed();
        let report = MassIndexerReport {
            results,
            elapsed: started.elapsed(),
        };
        for (entity_type, e) in report.failures() {
            error!("mass indexing of {} failed: {}", entity_type, e);
        }
        info!(
            "mass indexing finished in {:.1?}: {} documents, {} failed entity types",
            report.elapsed,
            report.documents_added(),
            report.failures().count()
        );
        Ok(report)
    }
}
