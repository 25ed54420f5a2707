mod common;

use common::{finished_parent, harness, harness_with, posts, warnings_during, with_timeout, T0};
use quarry_datasets::NewDataset;
use quarry_notifications::Recipient;
use quarry_workers::workers::{ExpireDatasets, EXPIRY_WARNING_PREFIX};
use quarry_workers::{Worker, WorkerRegistry};
use serde_json::json;

const DAY: i64 = 86_400;

#[test]
fn datasource_timeout_deletes_old_top_level_datasets() {
    let h = harness_with(with_timeout("tumblr", 3600));
    let old = h
        .ctx
        .datasets
        .create(NewDataset::new("tumblr-search", "alice").parameter("datasource", "tumblr"))
        .unwrap();
    let kept = h
        .ctx
        .datasets
        .create(
            NewDataset::new("tumblr-search", "alice")
                .parameter("datasource", "tumblr")
                .parameter("keep", true),
        )
        .unwrap();
    let other_source = h
        .ctx
        .datasets
        .create(NewDataset::new("reddit-search", "alice").parameter("datasource", "reddit"))
        .unwrap();
    let child = h
        .ctx
        .create_dataset_and_queue(NewDataset::new("perspective", "alice").parent(&old.key))
        .unwrap();

    h.clock.advance(7200 - 60);
    let recent = h
        .ctx
        .datasets
        .create(NewDataset::new("tumblr-search", "alice").parameter("datasource", "tumblr"))
        .unwrap();
    h.clock.advance(60);

    let report = ExpireDatasets::sweep(&h.ctx);
    assert_eq!(report.datasource_ttl, 2);

    assert!(h.ctx.datasets.get(&old.key).unwrap().is_none());
    assert!(h.ctx.datasets.get(&child.key).unwrap().is_none());
    assert_eq!(h.ctx.queue.count(Some("perspective")).unwrap(), 0);
    assert!(h.ctx.datasets.get(&kept.key).unwrap().is_some());
    assert!(h.ctx.datasets.get(&recent.key).unwrap().is_some());
    assert!(h.ctx.datasets.get(&other_source.key).unwrap().is_some());

    assert_eq!(ExpireDatasets::sweep(&h.ctx).datasource_ttl, 0);
}

#[test]
fn explicit_expiry_ignores_datasource_settings() {
    let h = harness();
    let expired = h
        .ctx
        .datasets
        .create(
            NewDataset::new("reddit-search", "alice")
                .parameter("datasource", "reddit")
                .parameter("keep", true)
                .expires_after(T0 - 1),
        )
        .unwrap();
    let later = h
        .ctx
        .datasets
        .create(NewDataset::new("reddit-search", "alice").expires_after(T0 + 3600))
        .unwrap();

    let report = ExpireDatasets::sweep(&h.ctx);
    assert_eq!(report.explicit, 1);
    assert!(h.ctx.datasets.get(&expired.key).unwrap().is_none());
    assert!(h.ctx.datasets.get(&later.key).unwrap().is_some());
}

#[test]
fn expiry_warning_is_added_once() {
    let h = harness();
    h.ctx.users.create("alice", false).unwrap();
    h.ctx
        .users
        .set_value("alice", "delete-after", json!((T0 + 3 * DAY).to_string()))
        .unwrap();

    assert_eq!(ExpireDatasets::sweep(&h.ctx).users_warned, 1);
    assert_eq!(ExpireDatasets::sweep(&h.ctx).users_warned, 0);

    let notices = h.ctx.notifications.for_user("alice", false).unwrap();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.starts_with("WARNING: This account will be deleted at"));
    assert!(!notices[0].dismissible);
    assert_eq!(notices[0].expires_at, Some(T0 + 3 * DAY));
}

#[test]
fn moved_expiry_replaces_the_warning() {
    let h = harness();
    h.ctx.users.create("alice", false).unwrap();
    h.ctx.users.create("bob", false).unwrap();
    let set = |name: &str, at: i64| h.ctx.users.set_value(name, "delete-after", json!(at)).unwrap();
    let warnings = |name: &str| -> Vec<String> {
        h.ctx
            .notifications
            .for_user(name, false)
            .unwrap()
            .into_iter()
            .map(|n| n.message)
            .filter(|m| m.starts_with(EXPIRY_WARNING_PREFIX))
            .collect()
    };
    set("alice", T0 + 3 * DAY);
    set("bob", T0 + 2 * DAY);
    ExpireDatasets::sweep(&h.ctx);

    set("alice", T0 + 5 * DAY);
    assert_eq!(ExpireDatasets::sweep(&h.ctx).users_warned, 1);
    let current = warnings("alice");
    assert_eq!(current.len(), 1);
    assert!(current[0].contains("2023-11-19"), "{}", current[0]);
    assert_eq!(
        h.ctx.notifications.for_user("alice", false).unwrap()[0].expires_at,
        Some(T0 + 5 * DAY)
    );

    set("alice", T0 + 60 * DAY);
    assert_eq!(ExpireDatasets::sweep(&h.ctx).users_warned, 0);
    assert!(warnings("alice").is_empty());
    assert_eq!(warnings("bob").len(), 1);
}

#[test]
fn accounts_far_from_expiry_get_no_warning() {
    let h = harness();
    h.ctx.users.create("alice", false).unwrap();
    h.ctx
        .users
        .set_value("alice", "delete-after", json!(T0 + 30 * DAY))
        .unwrap();

    let report = ExpireDatasets::sweep(&h.ctx);
    assert_eq!(report.users_warned, 0);
    assert!(h.ctx.notifications.for_user("alice", false).unwrap().is_empty());
}

#[test]
fn expired_user_is_deleted_with_their_data() {
    let h = harness();
    h.ctx.users.create("alice", false).unwrap();
    h.ctx.users.create("bob", false).unwrap();
    h.ctx.users.set_value("alice", "delete-after", json!("2023-11-01")).unwrap();
    let parent = finished_parent(&h.ctx, &posts());
    let child = h
        .ctx
        .create_dataset_and_queue(NewDataset::new("perspective", "alice").parent(&parent.key))
        .unwrap();
    h.ctx
        .notifications
        .add_notification(&Recipient::user("alice"), "hello", true, None)
        .unwrap();

    let report = ExpireDatasets::sweep(&h.ctx);
    assert_eq!(report.users_deleted, 1);
    assert!(h.ctx.users.get("alice").unwrap().is_none());
    assert!(h.ctx.users.get("bob").unwrap().is_some());
    assert!(h.ctx.datasets.get(&parent.key).unwrap().is_none());
    assert!(h.ctx.datasets.get(&child.key).unwrap().is_none());
    assert_eq!(h.ctx.queue.count(None).unwrap(), 0);
    assert!(h.ctx.notifications.for_recipient(&Recipient::user("alice")).unwrap().is_empty());
}

#[test]
fn malformed_user_expiry_is_skipped() {
    let h = harness();
    h.ctx.users.create("alice", false).unwrap();
    h.ctx.users.create("bob", false).unwrap();
    h.ctx.users.set_value("alice", "delete-after", json!("not-a-date")).unwrap();
    h.ctx.users.set_value("bob", "delete-after", json!(T0 - 10)).unwrap();

    let (report, warnings) = warnings_during(|| ExpireDatasets::sweep(&h.ctx));
    assert_eq!(report.users_deleted, 1);
    assert_eq!(warnings, vec!["user has invalid expiration date, skipping"]);
    assert!(h.ctx.users.get("alice").unwrap().is_some());
    assert!(h.ctx.users.get("bob").unwrap().is_none());
}

#[test]
fn expired_notifications_are_removed() {
    let h = harness();
    let alice = Recipient::user("alice");
    h.ctx.notifications.add_notification(&alice, "soon gone", true, Some(T0 + 10)).unwrap();
    h.ctx.notifications.add_notification(&alice, "stays", true, None).unwrap();

    assert_eq!(ExpireDatasets::sweep(&h.ctx).notifications, 0);
    h.clock.advance(10);
    assert_eq!(ExpireDatasets::sweep(&h.ctx).notifications, 1);
    assert_eq!(h.ctx.notifications.for_recipient(&alice).unwrap().len(), 1);
}

#[test]
fn expiration_worker_declares_its_recurring_job() {
    let h = harness_with(|c| c.expiration.interval_secs = 120);
    let worker = ExpireDatasets::from_context(&h.ctx);
    assert_eq!(worker.job_type(), "expire-datasets");
    assert_eq!(worker.max_workers(), 1);
    let ensure = worker.ensure_job().unwrap();
    assert_eq!(ensure.remote_id, "localhost");
    assert_eq!(ensure.interval, 120);

    let registry = WorkerRegistry::builtin(&h.ctx);
    let jobs = registry.ensure_jobs();
    assert_eq!(jobs.len(), 1, "no update checks without a repository url");
    assert_eq!(jobs[0].0, "expire-datasets");
}
