#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use quarry_core::config::DatasourceConfig;
use quarry_core::{Clock, QuarryConfig};
use quarry_datasets::{Dataset, Item, ItemWriter, NewDataset};
use quarry_queue::Job;
use quarry_workers::WorkerContext;
use serde_json::{json, Value};
use tempfile::TempDir;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

pub const T0: i64 = 1_700_000_000;

pub struct Harness {
    pub dir: TempDir,
    pub clock: Clock,
    pub ctx: WorkerContext,
}

/// Config pointing every path into `dir`, with a fast, jitter-free pool.
pub fn config_in(dir: &Path) -> QuarryConfig {
    let mut config = QuarryConfig::default();
    config.database.path = dir.join("quarry.db").to_string_lossy().into_owned();
    config.storage.root = dir.to_string_lossy().into_owned();
    config.scheduler.poll_interval_ms = 10;
    config.scheduler.jitter_ms = 0;
    config.scheduler.heartbeat_secs = 1;
    config
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut QuarryConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    tweak(&mut config);
    let clock = Clock::manual(T0);
    let ctx = WorkerContext::open(config, clock.clone()).unwrap();
    Harness { dir, clock, ctx }
}

pub fn with_timeout(datasource: &str, secs: u64) -> impl FnOnce(&mut QuarryConfig) {
    let datasource = datasource.to_string();
    move |config| {
        let mut datasources = BTreeMap::new();
        datasources.insert(datasource, DatasourceConfig { timeout: Some(secs) });
        config.datasources = datasources;
    }
}

pub fn item(value: Value) -> Item {
    value.as_object().cloned().unwrap()
}

/// A finished top-level dataset whose result file holds `items`.
pub fn finished_parent(ctx: &WorkerContext, items: &[Value]) -> Dataset {
    let dataset = ctx
        .datasets
        .create(NewDataset::new("reddit-search", "alice").parameter("datasource", "reddit"))
        .unwrap();
    let mut writer = ItemWriter::create(&ctx.datasets.result_path(&dataset)).unwrap();
    for i in items {
        writer.write(&item(i.clone())).unwrap();
    }
    let n = writer.finish().unwrap();
    ctx.datasets.finish(&dataset.key, n as i64).unwrap();
    ctx.datasets.get(&dataset.key).unwrap().unwrap()
}

pub fn posts() -> Vec<Value> {
    vec![
        json!({"id": "p1", "body": "you are great"}),
        json!({"id": "p2", "body": ""}),
        json!({"id": "p3", "body": "you are terrible"}),
    ]
}

/// Claim the one queued job of `job_type`.
pub fn claim(ctx: &WorkerContext, job_type: &str) -> Job {
    let mut caps = BTreeMap::new();
    caps.insert(job_type.to_string(), 1);
    ctx.queue.claim_next(&caps).unwrap().unwrap()
}

/// Collects the messages of WARN events.
#[derive(Clone, Default)]
struct Warnings(Arc<Mutex<Vec<String>>>);

struct MessageField(String);

impl Visit for MessageField {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for Warnings {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            let mut message = MessageField(String::new());
            event.record(&mut message);
            self.0.lock().unwrap().push(message.0);
        }
    }
}

/// Run `f` on this thread and return what it logged at WARN level.
pub fn warnings_during<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
    let warnings = Warnings::default();
    let subscriber = tracing_subscriber::registry().with(warnings.clone());
    let out = tracing::subscriber::with_default(subscriber, f);
    let logged = warnings.0.lock().unwrap().clone();
    (out, logged)
}
