mod common;

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use common::{claim, harness_with, Harness};
use quarry_notifications::Recipient;
use quarry_workers::workers::{Release, ReleaseSource, UpdateChecker, UPDATE_NOTICE_PREFIX};
use quarry_workers::Worker;

#[derive(Clone)]
enum Upstream {
    Tag(&'static str),
    Missing,
    Down,
}

struct FakeReleases {
    upstream: Upstream,
    asked: Mutex<Vec<String>>,
}

impl FakeReleases {
    fn new(upstream: Upstream) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            asked: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReleaseSource for FakeReleases {
    async fn latest_release(&self, repo_id: &str) -> anyhow::Result<Option<Release>> {
        self.asked.lock().unwrap().push(repo_id.to_string());
        match self.upstream {
            Upstream::Tag(tag) => Ok(Some(Release {
                tag_name: tag.to_string(),
                html_url: format!("https://github.com/{repo_id}/releases/tag/{tag}"),
            })),
            Upstream::Missing => Ok(None),
            Upstream::Down => Err(anyhow!("connection refused")),
        }
    }
}

fn installed(version: &str) -> Harness {
    let h = harness_with(|c| {
        c.update.github_url = Some("https://github.com/quarry-org/quarry/".to_string());
        c.scheduler.seed_on_start = false;
    });
    std::fs::write(h.ctx.config.storage.version_file(), format!("{version}\nbuilt from source\n")).unwrap();
    h
}

async fn check(h: &Harness, source: Arc<FakeReleases>) {
    let mut checker = UpdateChecker::with_source(&h.ctx, source);
    let ensure = checker.ensure_job().unwrap();
    assert_eq!(ensure.interval, 10_800);
    h.ctx
        .queue
        .enqueue_if_absent("check-for-updates", &ensure.remote_id, ensure.interval)
        .unwrap();
    let job = claim(&h.ctx, "check-for-updates");
    checker.work(&h.ctx, &job).await.unwrap();
    h.ctx.queue.complete(&job, Some(ensure.interval)).unwrap();
    h.clock.advance(ensure.interval as i64);
}

fn admin_notices(h: &Harness) -> Vec<String> {
    h.ctx
        .notifications
        .for_recipient(&Recipient::Admins)
        .unwrap()
        .into_iter()
        .map(|n| n.message)
        .collect()
}

#[tokio::test]
async fn newer_release_notifies_admins_once() {
    let h = installed("1.2.0");
    let source = FakeReleases::new(Upstream::Tag("v1.3.0"));
    check(&h, Arc::clone(&source)).await;
    check(&h, Arc::clone(&source)).await;

    assert_eq!(source.asked.lock().unwrap().as_slice(), ["quarry-org/quarry", "quarry-org/quarry"]);
    let notices = admin_notices(&h);
    assert_eq!(notices.len(), 1);
    assert!(notices[0].starts_with(UPDATE_NOTICE_PREFIX));
    assert!(notices[0].contains("1.3.0"));
    assert!(notices[0].contains("1.2.0"));
    assert!(h.ctx.notifications.for_recipient(&Recipient::Admins).unwrap()[0].dismissible);
}

#[tokio::test]
async fn newer_release_replaces_older_notice() {
    let h = installed("1.2.0");
    check(&h, FakeReleases::new(Upstream::Tag("v1.3.0"))).await;
    check(&h, FakeReleases::new(Upstream::Tag("v1.4.0"))).await;

    let notices = admin_notices(&h);
    assert_eq!(notices.len(), 1);
    assert!(notices[0].contains("1.4.0"));
}

#[tokio::test]
async fn up_to_date_clears_previous_notices() {
    let h = installed("1.2.0");
    h.ctx
        .notifications
        .add_notification(&Recipient::Admins, "A new version of Quarry is available at x.", true, None)
        .unwrap();
    h.ctx
        .notifications
        .add_notification(&Recipient::Admins, "Disk almost full", true, None)
        .unwrap();

    check(&h, FakeReleases::new(Upstream::Tag("v1.2.0"))).await;
    assert_eq!(admin_notices(&h), vec!["Disk almost full"]);
}

#[tokio::test]
async fn missing_repository_or_outage_changes_nothing() {
    let h = installed("1.2.0");
    check(&h, FakeReleases::new(Upstream::Missing)).await;
    check(&h, FakeReleases::new(Upstream::Down)).await;
    assert!(admin_notices(&h).is_empty());
}

#[tokio::test]
async fn no_version_file_means_no_check() {
    let h = installed("1.2.0");
    std::fs::remove_file(h.ctx.config.storage.version_file()).unwrap();
    let source = FakeReleases::new(Upstream::Tag("v9.0.0"));
    check(&h, Arc::clone(&source)).await;
    assert!(source.asked.lock().unwrap().is_empty());
    assert!(admin_notices(&h).is_empty());
}

#[tokio::test]
async fn no_repository_url_means_no_recurring_job() {
    let h = harness_with(|_| {});
    let checker = UpdateChecker::with_source(&h.ctx, FakeReleases::new(Upstream::Tag("v1.0.0")));
    assert_eq!(checker.job_type(), "check-for-updates");
    assert!(checker.ensure_job().is_none());
}
