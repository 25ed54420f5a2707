use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `remote_id` used by jobs that are not tied to any particular resource.
pub const GLOBAL_REMOTE_ID: &str = "localhost";

/// Lifecycle state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed once `not_before` has passed.
    Queued,
    /// Claimed by an execution slot that has not sent a heartbeat yet.
    Claimed,
    /// Claimed and heartbeating.
    Running,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "claimed" => Ok(JobStatus::Claimed),
            "running" => Ok(JobStatus::Running),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Autoincrement primary key.
    pub id: i64,
    /// Worker type that runs this job.
    pub job_type: String,
    /// Scoping identity: a dataset key, or [`GLOBAL_REMOTE_ID`].
    pub remote_id: String,
    /// Free-form payload for the worker.
    pub details: Map<String, Value>,
    /// Seconds between runs for recurring jobs; 0 for one-shot jobs.
    pub interval: u64,
    pub status: JobStatus,
    /// Unix seconds before which the job may not be claimed.
    pub not_before: i64,
    pub claimed_at: Option<i64>,
    pub heartbeat_at: Option<i64>,
    /// Number of times the job has been claimed since it was last completed.
    pub attempts: u32,
    pub created_at: i64,
}

impl Job {
    pub fn is_recurring(&self) -> bool {
        self.interval > 0
    }
}

/// Returned by enqueue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRef {
    pub id: i64,
    /// False when an identical queued job already existed and was reused.
    pub inserted: bool,
}

/// A job to be enqueued.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub remote_id: String,
    pub interval: u64,
    pub details: Map<String, Value>,
    /// Seconds from now before the job becomes claimable.
    pub delay: u64,
}

impl NewJob {
    pub fn new(job_type: &str, remote_id: &str) -> Self {
        Self {
            job_type: job_type.to_string(),
            remote_id: remote_id.to_string(),
            interval: 0,
            details: Map::new(),
            delay: 0,
        }
    }

    pub fn interval(mut self, secs: u64) -> Self {
        self.interval = secs;
        self
    }

    pub fn delay(mut self, secs: u64) -> Self {
        self.delay = secs;
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}
