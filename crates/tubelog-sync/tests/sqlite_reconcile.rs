use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tubelog_adapters::{FixtureCommentSource, FixtureMetadataSource, ReplayFeed};
use tubelog_core::{CommentKey, FieldSet, ReconcileOutcome};
use tubelog_storage::{BackoffPolicy, ReconcileStore, SqliteStore};
use tubelog_sync::{CollectorConfig, Reconciler, Shutdown, SyncPipeline};

const VIDEO_ID: &str = "sQ3kLx9pT0a";

async fn sqlite() -> Arc<SqliteStore> {
    let store = SqliteStore::connect("sqlite::memory:")
        .await
        .expect("connect in-memory sqlite");
    store.migrate().await.expect("migrate");
    Arc::new(store)
}

fn video(title: &str) -> FieldSet {
    FieldSet::new()
        .with("title", title)
        .with("channel", "Seoul Walker")
        .with("status", "vod")
        .with("url", "https://www.youtube.com/watch?v=sQ3kLx9pT0a")
}

fn comment(text: &str, author: &str, time: &str) -> FieldSet {
    FieldSet::new()
        .with("comment", text)
        .with("author_name", author)
        .with("comment_time_kst", time)
}

/// Comments reference their video, so the parent row goes in first.
async fn seeded() -> (Arc<SqliteStore>, Reconciler) {
    let store = sqlite().await;
    let reconciler = Reconciler::new(store.clone());
    reconciler
        .reconcile_video(VIDEO_ID, &video("Morning walk"), "{}")
        .await
        .expect("seed video");
    (store, reconciler)
}

#[tokio::test]
async fn video_insert_unchanged_then_updated_on_sqlite() {
    let store = sqlite().await;
    let reconciler = Reconciler::new(store.clone());

    let first = reconciler
        .reconcile_video(VIDEO_ID, &video("Morning walk"), r#"{"v":1}"#)
        .await
        .expect("insert");
    let second = reconciler
        .reconcile_video(VIDEO_ID, &video("Morning walk"), r#"{"v":2}"#)
        .await
        .expect("unchanged");
    let third = reconciler
        .reconcile_video(VIDEO_ID, &video("Morning walk (4K)"), r#"{"v":3}"#)
        .await
        .expect("update");

    assert_eq!(first, ReconcileOutcome::Inserted);
    assert_eq!(second, ReconcileOutcome::Unchanged);
    assert_eq!(
        third,
        ReconcileOutcome::Updated {
            round: 1,
            changes: vec!["(title: Morning walk → Morning walk (4K))".to_string()],
        }
    );

    let stored = store.get_video(VIDEO_ID).await.expect("get").expect("video");
    assert_eq!(stored.revisions.rounds, 1);
    assert_eq!(
        stored.revisions.text,
        "1. (title: Morning walk → Morning walk (4K))"
    );
    let snapshot = store.get_snapshot(VIDEO_ID).await.expect("get").expect("snapshot");
    assert_eq!(snapshot.revised_count, 1);
    assert_eq!(snapshot.raw_json, r#"{"v":3}"#);
    assert_eq!(store.list_videos().await.expect("list").len(), 1);
}

#[tokio::test]
async fn comment_insert_update_unchanged_on_sqlite() {
    let (store, reconciler) = seeded().await;
    let key = CommentKey::new(VIDEO_ID, Some("UCamy"), Some("2026-01-01T09:00:00+0900"));

    let inserted = reconciler
        .reconcile_comment(&key, &comment("first", "@amy", "2026-01-01T09:00:00+0900"))
        .await
        .expect("insert");
    let updated = reconciler
        .reconcile_comment(&key, &comment("first (edited)", "@amy", "2026-01-01T09:00:00+0900"))
        .await
        .expect("update");
    let unchanged = reconciler
        .reconcile_comment(&key, &comment("first (edited)", "@amy", "2026-01-01T09:00:00+0900"))
        .await
        .expect("unchanged");

    assert_eq!(inserted, ReconcileOutcome::Inserted);
    assert_eq!(
        updated,
        ReconcileOutcome::Updated {
            round: 1,
            changes: vec!["(comment: first → first (edited))".to_string()],
        }
    );
    assert_eq!(unchanged, ReconcileOutcome::Unchanged);

    let rows = store.list_comments(VIDEO_ID).await.expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, key);
    assert_eq!(rows[0].revisions.text, "1. (comment: first → first (edited))");
    assert_eq!(rows[0].revisions.rounds, 1);
}

#[tokio::test]
async fn anonymous_comment_with_padded_time_stays_one_row_on_sqlite() {
    let (store, reconciler) = seeded().await;
    // The key trims its timestamp; the raw field keeps the padding.
    let key = CommentKey::new(VIDEO_ID, None, Some(" 2026-01-02T10:30:00+0900 "));
    let padded = " 2026-01-02T10:30:00+0900 ";

    let inserted = reconciler
        .reconcile_comment(&key, &comment("hello", "", padded))
        .await
        .expect("insert");
    let updated = reconciler
        .reconcile_comment(&key, &comment("hello!", "", ""))
        .await
        .expect("update");
    let unchanged = reconciler
        .reconcile_comment(&key, &comment("hello!", "", padded))
        .await
        .expect("unchanged");

    assert_eq!(inserted, ReconcileOutcome::Inserted);
    assert_eq!(
        updated,
        ReconcileOutcome::Updated {
            round: 1,
            changes: vec!["(comment: hello → hello!)".to_string()],
        }
    );
    assert_eq!(unchanged, ReconcileOutcome::Unchanged);

    let rows = store.list_comments(VIDEO_ID).await.expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.author_channel_id, "");
    assert_eq!(rows[0].key.comment_time_kst, "2026-01-02T10:30:00+0900");
    assert_eq!(rows[0].fields.get("comment_time_kst"), "2026-01-02T10:30:00+0900");
    assert!(store.get_comment(&key).await.expect("get").is_some());
}

#[tokio::test]
async fn one_batch_sharing_an_identity_ends_as_one_row_on_sqlite() {
    let (store, reconciler) = seeded().await;
    let time = "2026-01-03T08:00:00+0900";
    let batch = [
        (CommentKey::new(VIDEO_ID, None, Some(time)), comment("one", "", time)),
        (CommentKey::new(VIDEO_ID, None, Some(time)), comment("two", "", time)),
    ];

    let mut outcomes = Vec::new();
    for (key, fields) in &batch {
        outcomes.push(reconciler.reconcile_comment(key, fields).await.expect("reconcile"));
    }

    assert_eq!(outcomes[0], ReconcileOutcome::Inserted);
    assert!(matches!(outcomes[1], ReconcileOutcome::Updated { round: 1, .. }));
    let rows = store.list_comments(VIDEO_ID).await.expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fields.get("comment"), "two");
    assert_eq!(rows[0].revisions.text, "1. (comment: one → two)");
}

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .canonicalize()
        .expect("fixtures dir")
}

#[tokio::test]
async fn repeated_fixture_sync_on_sqlite_keeps_one_row_per_comment() {
    let store = sqlite().await;
    let pipeline = SyncPipeline::new(
        store.clone(),
        Arc::new(FixtureMetadataSource::new(fixtures().join("metadata"))),
        Some(Arc::new(FixtureCommentSource::new(fixtures().join("comments")))),
    )
    .with_backoff(BackoffPolicy::none())
    .with_collector(CollectorConfig {
        max_rounds: 20,
        stability_threshold: 3,
        settle_delay: Duration::ZERO,
        deadline: None,
    });

    let mut runs = Vec::new();
    for _ in 0..2 {
        let feed = ReplayFeed::from_dir(fixtures().join("feed")).expect("feed");
        runs.push(
            pipeline
                .run_once("seoul walk", &feed, &feed, &Shutdown::never())
                .await
                .expect("run"),
        );
    }

    assert_eq!(runs[0].comments.inserted, 4);
    assert_eq!(runs[1].comments.unchanged, 4);
    assert_eq!(runs[1].comments.inserted, 0);
    assert_eq!(runs[1].videos.unchanged, 3);
    assert_eq!(store.list_comments(VIDEO_ID).await.expect("list").len(), 3);
    assert_eq!(store.list_comments("Lp0zYd5nH8u").await.expect("list").len(), 1);
}
