//! Processors: workers that turn a finished parent dataset into a new one.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use quarry_datasets::{Dataset, DatasetError, DatasetStore, ItemSource, NewDataset};
use quarry_queue::Job;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::context::WorkerContext;
use crate::worker::{WorkOutcome, Worker};

/// Seconds to wait before retrying when the parent is still being produced.
pub const PARENT_UNFINISHED_DELAY_SECS: u64 = 30;

const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A setting a processor understands.
#[derive(Debug, Clone)]
pub struct ProcessorOption {
    pub name: &'static str,
    pub default: Value,
    /// Removed from the stored parameters as soon as the run has read it.
    pub sensitive: bool,
}

impl ProcessorOption {
    pub fn new(name: &'static str, default: Value) -> Self {
        Self {
            name,
            default,
            sensitive: false,
        }
    }

    pub fn sensitive(name: &'static str) -> Self {
        Self {
            name,
            default: Value::Null,
            sensitive: true,
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn processor_type(&self) -> &'static str;

    fn max_workers(&self) -> u32 {
        1
    }

    /// Extension of the result artifact.
    fn extension(&self) -> &'static str {
        "ndjson"
    }

    fn options(&self) -> Vec<ProcessorOption> {
        Vec::new()
    }

    /// Produce the dataset. Returning without calling
    /// [`ProcessorRun::finish`] finishes it with zero rows; returning an
    /// error records a crash on the dataset.
    async fn process(&self, run: &mut ProcessorRun<'_>) -> Result<()>;
}

/// State of one processor run, handed to [`Processor::process`].
pub struct ProcessorRun<'a> {
    pub ctx: &'a WorkerContext,
    /// The dataset being produced.
    pub dataset: Dataset,
    /// The dataset being processed.
    pub parent: Dataset,
    /// Stored parameters merged with option defaults, including sensitive
    /// values that are no longer persisted.
    pub parameters: Map<String, Value>,
    finished: bool,
    failed: bool,
}

impl<'a> ProcessorRun<'a> {
    fn new(ctx: &'a WorkerContext, dataset: Dataset, parent: Dataset, parameters: Map<String, Value>) -> Self {
        Self {
            ctx,
            dataset,
            parent,
            parameters,
            finished: false,
            failed: false,
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name).filter(|v| !v.is_null())
    }

    pub fn parameter_bool(&self, name: &str) -> bool {
        self.parameter(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Items of the parent dataset.
    pub fn source(&self) -> ItemSource {
        ItemSource::new(self.ctx.datasets.result_path(&self.parent))
    }

    pub fn result_path(&self) -> PathBuf {
        self.ctx.datasets.result_path(&self.dataset)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.ctx.datasets.staging_path(&self.dataset.key)
    }

    pub fn update_status(&self, status: &str) -> Result<()> {
        self.ctx.datasets.update_status(&self.dataset.key, status)?;
        Ok(())
    }

    pub fn finish(&mut self, num_rows: usize) -> Result<()> {
        self.ctx.datasets.finish(&self.dataset.key, num_rows as i64)?;
        self.dataset.num_rows = num_rows as i64;
        self.dataset.is_finished = true;
        self.finished = true;
        Ok(())
    }

    pub fn finish_with_error(&mut self, message: &str) -> Result<()> {
        self.ctx.datasets.finish_with_error(&self.dataset.key, message)?;
        self.dataset.num_rows = 0;
        self.dataset.is_finished = true;
        self.dataset.status = message.to_string();
        self.finished = true;
        self.failed = true;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Runs a [`Processor`] as a queue worker. The job's `remote_id` is the key
/// of the dataset to produce.
pub struct ProcessorWorker<P> {
    processor: Arc<P>,
}

impl<P: Processor> ProcessorWorker<P> {
    pub fn new(processor: P) -> Self {
        Self {
            processor: Arc::new(processor),
        }
    }
}

#[async_trait]
impl<P: Processor + 'static> Worker for ProcessorWorker<P> {
    fn job_type(&self) -> &'static str {
        self.processor.processor_type()
    }

    fn max_workers(&self) -> u32 {
        self.processor.max_workers()
    }

    async fn work(&mut self, ctx: &WorkerContext, job: &Job) -> Result<WorkOutcome> {
        let key = job.remote_id.as_str();
        let Some(mut dataset) = ctx.datasets.get(key)? else {
            debug!(dataset.key = key, "dataset was deleted before it could be processed");
            return Ok(WorkOutcome::Finished);
        };
        // Sensitive parameters go on every path that will not run again.
        let options = self.processor.options();
        let mut redaction = Redaction::new(
            Arc::clone(&ctx.datasets),
            key,
            options.iter().filter(|o| o.sensitive).map(|o| o.name).collect(),
        );
        if dataset.is_finished {
            warn!(dataset.key = key, "job queued for a dataset that is already finished");
            return Ok(WorkOutcome::Finished);
        }
        let Some(parent_key) = dataset.key_parent.clone() else {
            ctx.datasets
                .finish_with_error(key, "This processor needs a parent dataset to run on")?;
            return Ok(WorkOutcome::Finished);
        };
        let Some(parent) = ctx.datasets.get(&parent_key)? else {
            warn!(dataset.key = key, parent = %parent_key, "processor queued for orphan dataset, cancelling");
            return Ok(WorkOutcome::Finished);
        };
        if !parent.is_finished {
            redaction.disarm();
            return Ok(WorkOutcome::Release {
                delay_secs: PARENT_UNFINISHED_DELAY_SECS,
            });
        }

        let parameters = resolve_parameters(&dataset.parameters, &options);
        redaction.apply();

        info!(dataset.key = key, processor = self.processor.processor_type(), "running processor");
        let extension = self.processor.extension();
        if !dataset.result_file.ends_with(&format!(".{extension}")) {
            dataset.result_file = ctx.datasets.set_result_extension(key, extension)?;
        }
        ctx.datasets.update_status(key, "Processing data")?;
        ctx.datasets.set_software_version(key, SOFTWARE_VERSION)?;

        let mut run = ProcessorRun::new(ctx, dataset, parent, parameters);
        let result = AssertUnwindSafe(self.processor.process(&mut run))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => after_process(&mut run)?,
            Ok(Err(e)) => crashed(&run, &format!("{e:#}")),
            Err(panic) => crashed(&run, &panic_text(panic.as_ref())),
        }
        Ok(WorkOutcome::Finished)
    }
}

/// Given parameters take precedence; options that were not given get their
/// default. Option order comes first, then any extra given parameters.
fn resolve_parameters(given: &Map<String, Value>, options: &[ProcessorOption]) -> Map<String, Value> {
    let mut resolved = Map::new();
    for option in options {
        let value = given
            .get(option.name)
            .cloned()
            .unwrap_or_else(|| option.default.clone());
        resolved.insert(option.name.to_string(), value);
    }
    for (name, value) in given {
        if !resolved.contains_key(name) {
            resolved.insert(name.clone(), value.clone());
        }
    }
    resolved
}

fn after_process(run: &mut ProcessorRun<'_>) -> Result<()> {
    if !run.finished {
        run.finish(0)?;
    }
    if run.dataset.num_rows > 0 {
        run.update_status("Dataset completed.")?;
    }
    remove_dir_if_present(&run.staging_dir());

    if run.failed {
        return Ok(());
    }
    for next in run.parameters.get("next").and_then(Value::as_array).into_iter().flatten() {
        let Some(next_type) = next.get("type").and_then(Value::as_str) else {
            warn!(dataset.key = %run.dataset.key, "follow-up processor without a type, skipping");
            continue;
        };
        if !run.ctx.has_worker(next_type) {
            warn!(dataset.key = %run.dataset.key, next = next_type, "follow-up processor is unknown or incompatible, skipping");
            continue;
        }
        if run.dataset.num_rows <= 0 {
            info!(dataset.key = %run.dataset.key, next = next_type, "no results, not running follow-up processor");
            continue;
        }
        let parameters = next
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let queued = run.ctx.create_dataset_and_queue(
            NewDataset::new(next_type, &run.dataset.owner)
                .parent(&run.dataset.key)
                .parameters(parameters),
        )?;
        info!(dataset.key = %run.dataset.key, next = next_type, child = %queued.key, "follow-up processor queued");
    }
    Ok(())
}

/// Record a crash: partial output goes, the dataset shows the error.
fn crashed(run: &ProcessorRun<'_>, reason: &str) {
    warn!(dataset.key = %run.dataset.key, reason, "processor crashed");
    let result = run.result_path();
    if let Err(e) = std::fs::remove_file(&result) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %result.display(), error = %e, "could not remove partial result");
        }
    }
    remove_dir_if_present(&run.staging_dir());

    let message = format!("Processor crashed: {reason}");
    match run.ctx.datasets.finish_with_error(&run.dataset.key, &message) {
        Ok(()) | Err(DatasetError::NotFound(_)) => {}
        Err(e) => warn!(error = %e, "could not record processor crash"),
    }
}

fn remove_dir_if_present(dir: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %e, "could not remove staging directory");
        }
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

/// Deletes sensitive parameters from the stored dataset. Applied explicitly
/// once they have been read, and again on drop if that point was never
/// reached.
struct Redaction {
    datasets: Arc<DatasetStore>,
    key: String,
    names: Vec<&'static str>,
    done: bool,
}

impl Redaction {
    fn new(datasets: Arc<DatasetStore>, key: &str, names: Vec<&'static str>) -> Self {
        Self {
            datasets,
            key: key.to_string(),
            done: names.is_empty(),
            names,
        }
    }

    /// Keep the parameters stored, for a run that will be retried.
    fn disarm(&mut self) {
        self.done = true;
    }

    fn apply(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        match self.datasets.delete_parameters(&self.key, &self.names) {
            Ok(n) => debug!(dataset.key = %self.key, removed = n, "sensitive parameters removed"),
            Err(DatasetError::NotFound(_)) => {}
            Err(e) => warn!(dataset.key = %self.key, error = %e, "could not remove sensitive parameters"),
        }
    }
}

impl Drop for Redaction {
    fn drop(&mut self) {
        self.apply();
    }
}
