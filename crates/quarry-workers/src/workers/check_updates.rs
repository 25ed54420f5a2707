//! Notifies admins when a newer quarry release is published on GitHub.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quarry_core::update::{compare_versions, github_repo_id, tag_to_version};
use quarry_notifications::Recipient;
use quarry_queue::Job;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::WorkerContext;
use crate::worker::{EnsureJob, WorkOutcome, Worker};

pub const CHECK_UPDATES_TYPE: &str = "check-for-updates";

/// Every update notice starts with this.
pub const UPDATE_NOTICE_PREFIX: &str = "A new version of Quarry";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub tag_name: String,
    pub html_url: String,
}

/// Where the latest published release is looked up.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Latest release of `owner/repo`. `None` when the repository does not
    /// exist or is not public.
    async fn latest_release(&self, repo_id: &str) -> Result<Option<Release>>;
}

/// GitHub Releases API.
pub struct GithubReleases {
    http: reqwest::Client,
    api_base: String,
    timeout: Duration,
}

impl GithubReleases {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn latest_release(&self, repo_id: &str) -> Result<Option<Release>> {
        let url = format!(
            "{}/repos/{repo_id}/releases/latest",
            self.api_base.trim_end_matches('/')
        );
        // A missing repository answers 404 with a JSON body, so the status is
        // not checked before parsing.
        let resp: Value = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .timeout(self.timeout)
            .send()
            .await
            .context("failed to reach GitHub API")?
            .json()
            .await
            .context("failed to parse GitHub API response")?;

        if resp["message"].as_str() == Some("Not Found") {
            return Ok(None);
        }
        let tag_name = resp["tag_name"]
            .as_str()
            .context("missing tag_name in release")?
            .to_string();
        let html_url = resp["html_url"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://github.com/{repo_id}/releases"));
        Ok(Some(Release { tag_name, html_url }))
    }
}

pub struct UpdateChecker {
    github_url: Option<String>,
    interval: u64,
    version_file: PathBuf,
    source: Arc<dyn ReleaseSource>,
}

impl UpdateChecker {
    pub fn github(ctx: &WorkerContext) -> Self {
        let cfg = &ctx.config.update;
        let source = GithubReleases::new(
            ctx.http.clone(),
            cfg.api_base.clone(),
            Duration::from_secs(cfg.timeout_secs),
        );
        Self::with_source(ctx, Arc::new(source))
    }

    pub fn with_source(ctx: &WorkerContext, source: Arc<dyn ReleaseSource>) -> Self {
        Self {
            github_url: ctx.config.update.github_url.clone().filter(|u| !u.is_empty()),
            interval: ctx.config.update.interval_secs,
            version_file: ctx.config.storage.version_file(),
            source,
        }
    }

    async fn current_version(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.version_file).await {
            Ok(contents) => contents
                .lines()
                .next()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            Err(e) => {
                debug!(path = %self.version_file.display(), error = %e, "no version file, skipping update check");
                None
            }
        }
    }
}

#[async_trait]
impl Worker for UpdateChecker {
    fn job_type(&self) -> &'static str {
        CHECK_UPDATES_TYPE
    }

    fn ensure_job(&self) -> Option<EnsureJob> {
        self.github_url.as_ref().map(|url| EnsureJob {
            remote_id: url.clone(),
            interval: self.interval,
        })
    }

    async fn work(&mut self, ctx: &WorkerContext, _job: &Job) -> Result<WorkOutcome> {
        let Some(ref url) = self.github_url else {
            return Ok(WorkOutcome::Finished);
        };
        let Some(current) = self.current_version().await else {
            return Ok(WorkOutcome::Finished);
        };
        let repo_id = match github_repo_id(url) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "update.github_url may be misconfigured");
                return Ok(WorkOutcome::Finished);
            }
        };

        let release = match self.source.latest_release(&repo_id).await {
            Ok(Some(release)) => release,
            Ok(None) => {
                warn!(repo = %repo_id, "update.github_url may be misconfigured - repository does not exist or is private");
                return Ok(WorkOutcome::Finished);
            }
            Err(e) => {
                debug!(error = %format!("{e:#}"), "update check failed");
                return Ok(WorkOutcome::Finished);
            }
        };

        let latest = tag_to_version(&release.tag_name);
        if compare_versions(latest, &current) == Ordering::Greater {
            let notice = update_notice(&release.html_url, latest, &current);
            if ctx.notifications.replace_matching(
                &Recipient::Admins,
                UPDATE_NOTICE_PREFIX,
                &notice,
                true,
                None,
            )? {
                info!(%latest, %current, "new version available");
            }
        } else {
            let removed = ctx
                .notifications
                .delete_matching(&Recipient::Admins, UPDATE_NOTICE_PREFIX)?;
            debug!(%current, removed, "up to date");
        }
        Ok(WorkOutcome::Finished)
    }
}

fn update_notice(url: &str, latest: &str, current: &str) -> String {
    format!(
        "{UPDATE_NOTICE_PREFIX} is available at {url}. The latest version is {latest}; you are running version {current}."
    )
}
