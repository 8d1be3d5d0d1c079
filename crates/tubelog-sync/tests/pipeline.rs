use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tubelog_adapters::{FixtureCommentSource, FixtureMetadataSource, ReplayFeed};
use tubelog_core::ReconcileOutcome;
use tubelog_storage::{BackoffPolicy, MemoryStore, ReconcileStore};
use tubelog_sync::{CollectOutcome, CollectorConfig, Shutdown, SyncPipeline};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .canonicalize()
        .expect("fixtures dir")
}

fn quick_collector() -> CollectorConfig {
    CollectorConfig {
        max_rounds: 20,
        stability_threshold: 3,
        settle_delay: Duration::ZERO,
        deadline: None,
    }
}

fn pipeline(store: Arc<MemoryStore>, metadata_dir: &Path) -> SyncPipeline {
    SyncPipeline::new(
        store,
        Arc::new(FixtureMetadataSource::new(metadata_dir)),
        Some(Arc::new(FixtureCommentSource::new(fixtures().join("comments")))),
    )
    .with_backoff(BackoffPolicy::none())
    .with_collector(quick_collector())
}

#[tokio::test]
async fn first_run_inserts_and_second_run_is_a_noop() {
    let store = Arc::new(MemoryStore::new());
    let reports = tempfile::tempdir().expect("tempdir");
    let pipeline =
        pipeline(store.clone(), &fixtures().join("metadata")).with_reports_dir(reports.path());

    let feed = ReplayFeed::from_dir(fixtures().join("feed")).expect("feed");
    let first = pipeline
        .run_once("seoul walk", &feed, &feed, &Shutdown::never())
        .await
        .expect("first run");

    assert_eq!(first.collect_outcome, Some(CollectOutcome::Converged));
    assert_eq!(first.collect_rounds, 6);
    assert_eq!(first.collected_ids, 3);
    assert_eq!(first.videos.inserted, 3);
    assert_eq!(first.comments.inserted, 4);
    assert!(first.failed_ids.is_empty());

    let summary_path = reports
        .path()
        .join(first.run_id.to_string())
        .join("sync_summary.json");
    let written: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&summary_path).expect("summary file"))
            .expect("summary json");
    assert_eq!(written["collect_outcome"], "converged");
    assert_eq!(written["videos"]["inserted"], 3);

    let feed = ReplayFeed::from_dir(fixtures().join("feed")).expect("feed");
    let second = pipeline
        .run_once("seoul walk", &feed, &feed, &Shutdown::never())
        .await
        .expect("second run");
    assert_eq!(second.videos.unchanged, 3);
    assert_eq!(second.comments.unchanged, 4);
    assert_eq!(second.comments.inserted, 0);

    assert_eq!(store.list_comments("sQ3kLx9pT0a").await.expect("list").len(), 3);
    let stats = store.stats().await;
    assert_eq!(stats.video_writes, 6);
    assert_eq!(stats.comment_inserts, 4);
    assert_eq!(stats.comment_updates, 0);
}

#[tokio::test]
async fn metadata_failure_skips_only_that_video() {
    let metadata = tempfile::tempdir().expect("tempdir");
    for id in ["sQ3kLx9pT0a", "Lp0zYd5nH8u"] {
        std::fs::copy(
            fixtures().join("metadata").join(format!("{id}.json")),
            metadata.path().join(format!("{id}.json")),
        )
        .expect("copy fixture");
    }

    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(store.clone(), metadata.path());
    let mut summary = run_fixture_sync(&pipeline).await;

    assert_eq!(summary.failed_ids, vec!["Vb7mRw2Kc1e".to_string()]);
    assert_eq!(summary.videos.inserted, 2);
    assert_eq!(summary.videos.failed, 1);
    assert!(store.get_video("Vb7mRw2Kc1e").await.expect("get").is_none());
    assert!(store.get_video("Lp0zYd5nH8u").await.expect("get").is_some());

    // The title changes upstream; the next run records one revision round.
    let path = metadata.path().join("sQ3kLx9pT0a.json");
    let mut info: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
    info["title"] = "Morning walk through Namsan (4K)".into();
    std::fs::write(&path, serde_json::to_vec(&info).expect("encode")).expect("write");

    summary = run_fixture_sync(&pipeline).await;
    assert_eq!(summary.videos.updated, 1);
    assert_eq!(summary.videos.unchanged, 1);

    let stored = store
        .get_video("sQ3kLx9pT0a")
        .await
        .expect("get")
        .expect("video");
    assert_eq!(
        stored.revisions.text,
        "1. (title: Morning walk through Namsan → Morning walk through Namsan (4K))"
    );
    let snapshot = store
        .get_snapshot("sQ3kLx9pT0a")
        .await
        .expect("get")
        .expect("snapshot");
    assert_eq!(snapshot.revised_count, 1);
    assert!(snapshot.raw_json.contains("(4K)"));
}

#[tokio::test]
async fn reconciler_reports_updates_through_the_pipeline_handle() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(store, &fixtures().join("metadata"));
    let reconciler = pipeline.reconciler();

    let fields = tubelog_core::FieldSet::new().with("title", "a");
    reconciler
        .reconcile_video("x", &fields, "{}")
        .await
        .expect("insert");
    let outcome = reconciler
        .reconcile_video("x", &fields.clone().with("title", "b"), "{}")
        .await
        .expect("update");
    assert_eq!(
        outcome,
        ReconcileOutcome::Updated {
            round: 1,
            changes: vec!["(title: a → b)".to_string()],
        }
    );
}

async fn run_fixture_sync(pipeline: &SyncPipeline) -> tubelog_sync::SyncRunSummary {
    let feed = ReplayFeed::from_dir(fixtures().join("feed")).expect("feed");
    pipeline
        .run_once("seoul walk", &feed, &feed, &Shutdown::never())
        .await
        .expect("run")
}
