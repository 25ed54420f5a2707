use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashSet;
use quarry_core::{Clock, QuarryConfig};
use quarry_datasets::{Dataset, DatasetStore, NewDataset};
use quarry_notifications::{NotificationStore, Recipient};
use quarry_queue::JobQueue;
use quarry_users::UserStore;
use rusqlite::Connection;
use tracing::{info, instrument};

const USER_AGENT: &str = concat!("quarry/", env!("CARGO_PKG_VERSION"));

/// Everything a worker may touch while it runs.
///
/// Cheap to clone: every store sits behind an `Arc` and owns its own
/// connection to the shared database file.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<QuarryConfig>,
    pub clock: Clock,
    pub queue: Arc<JobQueue>,
    pub datasets: Arc<DatasetStore>,
    pub users: Arc<UserStore>,
    pub notifications: Arc<NotificationStore>,
    pub http: reqwest::Client,
    /// Job types some registry has a worker for.
    worker_types: Arc<DashSet<String>>,
}

impl WorkerContext {
    /// Open every store against `config.database.path`, creating schemas as
    /// needed.
    pub fn open(config: QuarryConfig, clock: Clock) -> Result<Self> {
        let db_path = config.database.path.clone();
        let busy = Duration::from_millis(config.database.busy_timeout_ms);
        info!(path = %db_path, "opening SQLite database");

        let queue = JobQueue::new(open_connection(&db_path, busy)?)?
            .with_clock(clock.clone())
            .with_limits(config.scheduler.max_attempts, config.scheduler.max_backoff_secs);
        let datasets = DatasetStore::new(
            open_connection(&db_path, busy)?,
            config.storage.results_dir(),
        )?
        .with_clock(clock.clone());
        let users = UserStore::new(open_connection(&db_path, busy)?)?.with_clock(clock.clone());
        let notifications =
            NotificationStore::new(open_connection(&db_path, busy)?)?.with_clock(clock.clone());

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            clock,
            queue: Arc::new(queue),
            datasets: Arc::new(datasets),
            users: Arc::new(users),
            notifications: Arc::new(notifications),
            http,
            worker_types: Arc::new(DashSet::new()),
        })
    }

    pub(crate) fn mark_registered(&self, job_type: &str) {
        self.worker_types.insert(job_type.to_string());
    }

    /// Whether a worker is registered for `job_type`.
    pub fn has_worker(&self, job_type: &str) -> bool {
        self.worker_types.contains(job_type)
    }

    /// Create a dataset and queue the job that produces it. The job type is
    /// the dataset type and the job is scoped to the new key.
    #[instrument(skip(self, new), fields(dataset.type = %new.dataset_type))]
    pub fn create_dataset_and_queue(&self, new: NewDataset) -> Result<Dataset> {
        let dataset = self.datasets.create(new)?;
        self.queue
            .enqueue_if_absent(&dataset.dataset_type, &dataset.key, 0)
            .with_context(|| format!("failed to queue job for dataset {}", dataset.key))?;
        Ok(dataset)
    }

    /// Delete a dataset with its whole subtree, then drop queued jobs for
    /// every removed key. Returns how many datasets were removed.
    #[instrument(skip(self))]
    pub fn delete_dataset(&self, key: &str) -> Result<usize> {
        let deleted = self.datasets.delete(key)?;
        for removed in &deleted {
            self.queue.delete_queued_for(removed)?;
        }
        Ok(deleted.len())
    }

    /// Delete a user together with their datasets and notifications.
    /// Returns how many datasets were removed.
    #[instrument(skip(self))]
    pub fn delete_user(&self, name: &str) -> Result<usize> {
        let mut removed = 0;
        for dataset in self.datasets.owned_by(name)? {
            removed += self.delete_dataset(&dataset.key)?;
        }
        self.notifications
            .delete_for_recipient(&Recipient::user(name))?;
        self.users.delete(name)?;
        info!(user = name, datasets = removed, "user deleted");
        Ok(removed)
    }
}

/// Open a connection to the shared database with WAL, foreign keys and a
/// busy timeout so concurrent writers wait for each other.
pub fn open_connection(path: &str, busy_timeout: Duration) -> Result<Connection> {
    ensure_parent_dir(path);
    let conn = Connection::open(path).with_context(|| format!("failed to open database {path}"))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}
