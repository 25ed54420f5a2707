//! Worker registry
//!
//! Maps a job type string to a factory that builds a fresh worker for each
//! claimed job. Declarations (`max_workers`, `ensure_job`) are read once from
//! a probe instance when the factory is registered, so the pool never has to
//! construct a worker just to learn its limits.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::context::WorkerContext;
use crate::processor::ProcessorWorker;
use crate::processors::{AnnotationMetadata, ConvertJson, Perspective};
use crate::worker::{EnsureJob, Worker};
use crate::workers::{ExpireDatasets, UpdateChecker};

/// Builds a worker for one job run.
pub type WorkerFactory = Arc<dyn Fn(&WorkerContext) -> Box<dyn Worker> + Send + Sync>;

#[derive(Clone)]
pub struct RegistryEntry {
    pub factory: WorkerFactory,
    pub max_workers: u32,
    pub ensure: Option<EnsureJob>,
}

#[derive(Default)]
pub struct WorkerRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every worker type shipped with quarry.
    pub fn builtin(ctx: &WorkerContext) -> Self {
        let registry = Self::new();
        registry.register(ctx, |ctx| Box::new(ExpireDatasets::from_context(ctx)));
        registry.register(ctx, |ctx| Box::new(UpdateChecker::github(ctx)));
        registry.register(ctx, |ctx| Box::new(ProcessorWorker::new(Perspective::from_context(ctx))));
        registry.register(ctx, |_| Box::new(ProcessorWorker::new(ConvertJson)));
        registry.register(ctx, |_| Box::new(ProcessorWorker::new(AnnotationMetadata)));
        registry
    }

    /// Register a factory under the job type its workers report. A type
    /// registered twice keeps the later factory.
    pub fn register<F>(&self, ctx: &WorkerContext, factory: F)
    where
        F: Fn(&WorkerContext) -> Box<dyn Worker> + Send + Sync + 'static,
    {
        let probe = factory(ctx);
        let job_type = probe.job_type().to_string();
        let entry = RegistryEntry {
            factory: Arc::new(factory),
            max_workers: probe.max_workers().max(1),
            ensure: probe.ensure_job(),
        };
        ctx.mark_registered(&job_type);
        debug!(job.type = %job_type, max_workers = entry.max_workers, ensure = ?entry.ensure, "worker registered");
        if self.entries.insert(job_type.clone(), entry).is_some() {
            warn!(job.type = %job_type, "worker type registered twice, replacing earlier registration");
        }
    }

    pub fn get(&self, job_type: &str) -> Option<RegistryEntry> {
        self.entries.get(job_type).map(|e| e.value().clone())
    }

    /// Build a worker for a job, if its type is known.
    pub fn create(&self, job_type: &str, ctx: &WorkerContext) -> Option<Box<dyn Worker>> {
        let factory = self.entries.get(job_type).map(|e| Arc::clone(&e.factory))?;
        Some(factory(ctx))
    }

    /// `job_type -> max_workers` for every registered type.
    pub fn caps(&self) -> BTreeMap<String, u32> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().max_workers))
            .collect()
    }

    /// Every declared ensure-job, keyed by job type.
    pub fn ensure_jobs(&self) -> Vec<(String, EnsureJob)> {
        let mut jobs: Vec<(String, EnsureJob)> = self
            .entries
            .iter()
            .filter_map(|e| e.value().ensure.clone().map(|ensure| (e.key().clone(), ensure)))
            .collect();
        jobs.sort_by(|a, b| a.0.cmp(&b.0));
        jobs
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
