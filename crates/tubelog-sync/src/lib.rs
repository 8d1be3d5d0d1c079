//! Reconciliation engine, convergence collector and the sync run that ties them
//! to the metadata, comment and listing sources.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use tubelog_adapters::{
    search_url, AdapterError, CommentSource, FetchError, FixtureCommentSource,
    FixtureMetadataSource, IdentifierExtractor, MetadataSource, ReplayFeed, ViewScroller,
    YoutubeCommentSource, YtDlpMetadataSource, DEFAULT_SEARCH_FILTER,
};
use tubelog_core::{
    diff_fields, CommentKey, CommentRecord, FieldSet, RawSnapshot, ReconcileOutcome, RevisionLog,
    VideoRecord, COMMENT_FIELDS, VIDEO_FIELDS,
};
use tubelog_storage::{
    BackoffPolicy, CommentWrite, HttpClientConfig, HttpFetcher, ReconcileStore, SqliteStore,
    StoreError,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tubelog-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub query: String,
    pub search_filter: String,
    pub youtube_api_key: Option<String>,
    pub scroll_pause: Duration,
    pub max_scroll_rounds: usize,
    pub stability_threshold: usize,
    pub collect_deadline: Option<Duration>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub yt_dlp_binary: PathBuf,
    pub fixtures_dir: Option<PathBuf>,
    pub feed_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://tubelog.db".to_string()),
            query: std::env::var("TUBELOG_QUERY").unwrap_or_else(|_| "seoul".to_string()),
            search_filter: std::env::var("TUBELOG_SEARCH_FILTER")
                .unwrap_or_else(|_| DEFAULT_SEARCH_FILTER.to_string()),
            youtube_api_key: std::env::var("YOUTUBE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            scroll_pause: Duration::from_millis(
                env_parsed("TUBELOG_SCROLL_PAUSE_MS").unwrap_or(2000),
            ),
            max_scroll_rounds: env_parsed("TUBELOG_MAX_SCROLL_ROUNDS").unwrap_or(100),
            stability_threshold: env_parsed("TUBELOG_STABILITY_THRESHOLD").unwrap_or(3),
            collect_deadline: env_parsed("TUBELOG_COLLECT_DEADLINE_SECS").map(Duration::from_secs),
            http_timeout_secs: env_parsed("TUBELOG_HTTP_TIMEOUT_SECS").unwrap_or(20),
            user_agent: std::env::var("TUBELOG_USER_AGENT")
                .unwrap_or_else(|_| "tubelog/0.1".to_string()),
            yt_dlp_binary: std::env::var("TUBELOG_YTDLP")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("yt-dlp")),
            fixtures_dir: std::env::var("TUBELOG_FIXTURES_DIR").ok().map(PathBuf::from),
            feed_dir: std::env::var("TUBELOG_FEED_DIR").ok().map(PathBuf::from),
            reports_dir: std::env::var("TUBELOG_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
        }
    }

    pub fn collector(&self) -> CollectorConfig {
        CollectorConfig {
            max_rounds: self.max_scroll_rounds,
            stability_threshold: self.stability_threshold,
            settle_delay: self.scroll_pause,
            deadline: self.collect_deadline,
        }
    }

    /// Recorded listing to replay: `TUBELOG_FEED_DIR`, else `<fixtures>/feed`.
    pub fn listing_dir(&self) -> Option<PathBuf> {
        self.feed_dir
            .clone()
            .or_else(|| self.fixtures_dir.as_ref().map(|dir| dir.join("feed")))
    }
}

fn warn_if_malformed(revisions: &RevisionLog, entity: &'static str, id: &str) {
    if let Err(err) = revisions.recorded_rounds() {
        warn!(entity, id, error = %err, "revision log is malformed; numbering restarts at round 1");
    }
}

/// Diff-and-append reconciliation of incoming observations against the store.
///
/// Calls are expected to run one at a time; each one reads the current row and
/// writes back through a single atomic store operation.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ReconcileStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ReconcileStore>) -> Self {
        Self { store }
    }

    /// Upsert a video, extending its revision log when tracked fields changed.
    ///
    /// The video row and its raw snapshot are written together on every call,
    /// including `Unchanged`, where the row is rewritten with identical values.
    pub async fn reconcile_video(
        &self,
        video_id: &str,
        incoming: &FieldSet,
        raw_json: &str,
    ) -> Result<ReconcileOutcome, StoreError> {
        let fields = incoming.project(&VIDEO_FIELDS);
        let existing = self.store.get_video(video_id).await?;

        let (outcome, revisions) = match existing {
            None => (ReconcileOutcome::Inserted, RevisionLog::empty()),
            Some(prev) => {
                warn_if_malformed(&prev.revisions, "video", video_id);
                let diff = diff_fields(&VIDEO_FIELDS, &prev.fields, &fields);
                if diff.changed {
                    let revisions = prev.revisions.with_round(&diff.descriptions);
                    let outcome = ReconcileOutcome::Updated {
                        round: revisions.rounds,
                        changes: diff.descriptions,
                    };
                    (outcome, revisions)
                } else {
                    (ReconcileOutcome::Unchanged, prev.revisions)
                }
            }
        };

        let previous_snapshot = self.store.get_snapshot(video_id).await?;
        let snapshot =
            RawSnapshot::observe(previous_snapshot, video_id, raw_json, outcome.changed());
        let record = VideoRecord {
            id: video_id.to_string(),
            fields,
            revisions,
        };
        self.store.put_video(&record, &snapshot).await?;

        debug!(video_id, ?outcome, revised_count = snapshot.revised_count, "video reconciled");
        Ok(outcome)
    }

    /// Store `raw_json` as the latest payload, bumping the counter only when `changed`.
    pub async fn record_snapshot(
        &self,
        video_id: &str,
        raw_json: &str,
        changed: bool,
    ) -> Result<RawSnapshot, StoreError> {
        let existing = self.store.get_snapshot(video_id).await?;
        let snapshot = RawSnapshot::observe(existing, video_id, raw_json, changed);
        self.store.put_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Upsert a comment located by its identity key. Unchanged comments are not rewritten.
    ///
    /// The incoming `comment_time_kst` is replaced by the key's timestamp before
    /// diffing, so a row is always found again under the key it was written with.
    pub async fn reconcile_comment(
        &self,
        key: &CommentKey,
        incoming: &FieldSet,
    ) -> Result<ReconcileOutcome, StoreError> {
        let observed = CommentRecord::new(key.clone(), incoming, RevisionLog::empty());
        let existing = self.store.get_comment(key).await?;

        let (outcome, record, mode) = match existing {
            None => (ReconcileOutcome::Inserted, observed, CommentWrite::Insert),
            Some(prev) => {
                warn_if_malformed(&prev.revisions, "comment", &key.video_id);
                let diff = diff_fields(&COMMENT_FIELDS, &prev.fields, &observed.fields);
                if !diff.changed {
                    return Ok(ReconcileOutcome::Unchanged);
                }
                let revisions = prev.revisions.with_round(&diff.descriptions);
                let outcome = ReconcileOutcome::Updated {
                    round: revisions.rounds,
                    changes: diff.descriptions,
                };
                let record = CommentRecord {
                    revisions,
                    ..observed
                };
                (outcome, record, CommentWrite::Update)
            }
        };

        let missing = key.missing_components();
        if !missing.is_empty() {
            warn!(
                video_id = %key.video_id,
                ?missing,
                "comment identity is incomplete; records sharing it are merged"
            );
        }

        self.store.put_comment(&record, mode).await?;
        Ok(outcome)
    }
}

/// Cooperative stop signal shared by the collector and the sync loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    /// A handle that is never triggered.
    pub fn never() -> Self {
        let (_trigger, shutdown) = Self::channel();
        shutdown
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    async fn triggered(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Trigger dropped without firing.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `delay`; `false` when shutdown fired first.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.triggered() => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub max_rounds: usize,
    pub stability_threshold: usize,
    pub settle_delay: Duration,
    pub deadline: Option<Duration>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 100,
            stability_threshold: 3,
            settle_delay: Duration::from_secs(2),
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectOutcome {
    Converged,
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub ids: HashSet<String>,
    pub outcome: CollectOutcome,
    /// Extraction rounds performed.
    pub rounds: usize,
}

/// Drives an incrementally loading listing until it stops changing.
///
/// A baseline `(0, measure())` is taken before the first round. Every round
/// extracts and unions identifiers, advances the view, waits the settle delay,
/// then compares `(collected, measure())` with the previous measurement. Equal
/// measurements bump the stability counter, any difference resets it.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceCollector {
    config: CollectorConfig,
}

impl ConvergenceCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub async fn collect<E, S>(
        &self,
        extractor: &E,
        scroller: &S,
        shutdown: &Shutdown,
    ) -> Result<Collection, AdapterError>
    where
        E: IdentifierExtractor + ?Sized,
        S: ViewScroller + ?Sized,
    {
        let threshold = self.config.stability_threshold.max(1);
        let deadline = self.config.deadline.map(|d| Instant::now() + d);
        let mut ids = HashSet::new();
        let mut previous = (0usize, scroller.measure().await?);
        let mut stable = 0usize;

        let finish = |ids: HashSet<String>, outcome: CollectOutcome, rounds: usize| Collection {
            ids,
            outcome,
            rounds,
        };

        for round in 1..=self.config.max_rounds {
            if shutdown.is_triggered() {
                return Ok(finish(ids, CollectOutcome::Cancelled, round - 1));
            }

            ids.extend(extractor.extract().await?);
            scroller.advance().await?;

            let mut settle = self.config.settle_delay;
            if let Some(at) = deadline {
                settle = settle.min(at.saturating_duration_since(Instant::now()));
            }
            let settled = shutdown.sleep(settle).await;
            let expired = deadline.is_some_and(|at| Instant::now() >= at);
            if !settled || expired {
                info!(round, collected = ids.len(), expired, "collection cancelled");
                return Ok(finish(ids, CollectOutcome::Cancelled, round));
            }

            let current = (ids.len(), scroller.measure().await?);
            if current == previous {
                stable += 1;
            } else {
                stable = 0;
            }
            debug!(round, collected = ids.len(), stable, "collection round");

            if stable >= threshold {
                info!(round, collected = ids.len(), "listing converged");
                return Ok(finish(ids, CollectOutcome::Converged, round));
            }
            previous = current;
        }

        info!(rounds = self.config.max_rounds, collected = ids.len(), "round limit reached");
        Ok(finish(ids, CollectOutcome::Exhausted, self.config.max_rounds))
    }
}

/// Run `op` until it succeeds, fails permanently, or `policy.max_retries` retries are spent.
pub async fn with_retry<T, F, Fut>(policy: &BackoffPolicy, label: &str, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(label, attempt = attempt + 1, ?delay, error = %err, "retrying fetch");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeTally {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl OutcomeTally {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Inserted => self.inserted += 1,
            ReconcileOutcome::Updated { .. } => self.updated += 1,
            ReconcileOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub query: String,
    pub collect_outcome: Option<CollectOutcome>,
    pub collect_rounds: usize,
    pub collected_ids: usize,
    pub videos: OutcomeTally,
    pub comments: OutcomeTally,
    pub comment_fetch_failures: usize,
    pub failed_ids: Vec<String>,
}

impl SyncRunSummary {
    fn begin(query: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            query: query.to_string(),
            collect_outcome: None,
            collect_rounds: 0,
            collected_ids: 0,
            videos: OutcomeTally::default(),
            comments: OutcomeTally::default(),
            comment_fetch_failures: 0,
            failed_ids: Vec::new(),
        }
    }
}

pub struct SyncPipeline {
    reconciler: Reconciler,
    metadata: Arc<dyn MetadataSource>,
    comments: Option<Arc<dyn CommentSource>>,
    backoff: BackoffPolicy,
    collector: ConvergenceCollector,
    reports_dir: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        metadata: Arc<dyn MetadataSource>,
        comments: Option<Arc<dyn CommentSource>>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store),
            metadata,
            comments,
            backoff: BackoffPolicy::default(),
            collector: ConvergenceCollector::default(),
            reports_dir: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_collector(mut self, config: CollectorConfig) -> Self {
        self.collector = ConvergenceCollector::new(config);
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    /// Open and migrate the configured database and wire sources: fixture
    /// directories when `fixtures_dir` is set, yt-dlp and the Data API otherwise.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        store.migrate().await.context("migrating database schema")?;

        let metadata: Arc<dyn MetadataSource>;
        let comments: Option<Arc<dyn CommentSource>>;
        match &config.fixtures_dir {
            Some(dir) => {
                metadata = Arc::new(FixtureMetadataSource::new(dir.join("metadata")));
                comments = Some(Arc::new(FixtureCommentSource::new(dir.join("comments"))));
            }
            None => {
                metadata = Arc::new(YtDlpMetadataSource::new(config.yt_dlp_binary.clone()));
                comments = match &config.youtube_api_key {
                    Some(key) => {
                        let http = HttpFetcher::new(&HttpClientConfig {
                            timeout: Duration::from_secs(config.http_timeout_secs),
                            user_agent: Some(config.user_agent.clone()),
                        })?;
                        Some(Arc::new(YoutubeCommentSource::new(http, key.clone())))
                    }
                    None => {
                        warn!("YOUTUBE_API_KEY is not set; comments will not be synced");
                        None
                    }
                };
            }
        }

        Ok(Self::new(Arc::new(store), metadata, comments)
            .with_collector(config.collector())
            .with_reports_dir(config.reports_dir.clone()))
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn collect_ids<E, S>(
        &self,
        extractor: &E,
        scroller: &S,
        shutdown: &Shutdown,
    ) -> Result<Collection>
    where
        E: IdentifierExtractor + ?Sized,
        S: ViewScroller + ?Sized,
    {
        self.collector
            .collect(extractor, scroller, shutdown)
            .await
            .context("collecting identifiers from listing")
    }

    /// Reconcile each id in sorted order, one at a time. Per-id failures are
    /// recorded in `summary` and never stop the remaining ids.
    pub async fn process_ids<I>(&self, ids: I, summary: &mut SyncRunSummary, shutdown: &Shutdown)
    where
        I: IntoIterator<Item = String>,
    {
        let ordered: BTreeSet<String> = ids.into_iter().collect();
        for video_id in ordered {
            if shutdown.is_triggered() {
                warn!(video_id, "shutdown requested; leaving remaining ids for the next run");
                break;
            }
            self.process_one(&video_id, summary).await;
        }
    }

    async fn process_one(&self, video_id: &str, summary: &mut SyncRunSummary) {
        let fetched = match with_retry(&self.backoff, "metadata", || self.metadata.fetch(video_id)).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(video_id, source = self.metadata.name(), error = %err, "metadata fetch failed; skipping");
                summary.videos.failed += 1;
                summary.failed_ids.push(video_id.to_string());
                return;
            }
        };

        match self
            .reconciler
            .reconcile_video(video_id, &fetched.fields, &fetched.raw_json)
            .await
        {
            Ok(outcome) => {
                if let ReconcileOutcome::Updated { round, changes } = &outcome {
                    info!(video_id, round, changes = changes.len(), "video revised");
                }
                summary.videos.record(&outcome);
            }
            Err(err) => {
                warn!(video_id, error = %err, "video reconciliation failed");
                summary.videos.failed += 1;
                summary.failed_ids.push(video_id.to_string());
                return;
            }
        }

        if let Some(source) = &self.comments {
            self.sync_comments(source.as_ref(), video_id, summary).await;
        }
    }

    async fn sync_comments(&self, source: &dyn CommentSource, video_id: &str, summary: &mut SyncRunSummary) {
        let mut token: Option<String> = None;
        loop {
            let page = match with_retry(&self.backoff, "comments", || {
                source.fetch_page(video_id, token.as_deref())
            })
            .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(video_id, source = source.name(), error = %err, "comment fetch failed");
                    summary.comment_fetch_failures += 1;
                    return;
                }
            };

            for comment in &page.comments {
                match self.reconciler.reconcile_comment(&comment.key, &comment.fields).await {
                    Ok(outcome) => summary.comments.record(&outcome),
                    Err(err) => {
                        warn!(video_id, error = %err, "comment reconciliation failed");
                        summary.comments.failed += 1;
                    }
                }
            }

            match page.next_page_token {
                Some(next) => token = Some(next),
                None => return,
            }
        }
    }

    /// One full pass: collect ids from the listing, reconcile each, and write the
    /// run summary when a reports directory is configured.
    pub async fn run_once<E, S>(
        &self,
        query: &str,
        extractor: &E,
        scroller: &S,
        shutdown: &Shutdown,
    ) -> Result<SyncRunSummary>
    where
        E: IdentifierExtractor + ?Sized,
        S: ViewScroller + ?Sized,
    {
        let mut summary = SyncRunSummary::begin(query);
        let span = info_span!("sync_run", run_id = %summary.run_id, query);

        async move {
            let collection = self.collect_ids(extractor, scroller, shutdown).await?;
            summary.collect_outcome = Some(collection.outcome);
            summary.collect_rounds = collection.rounds;
            summary.collected_ids = collection.ids.len();
            info!(
                outcome = ?collection.outcome,
                rounds = collection.rounds,
                collected = collection.ids.len(),
                "listing collected"
            );

            self.process_ids(collection.ids, &mut summary, shutdown).await;
            summary.finished_at = Utc::now();
            info!(
                videos = ?summary.videos,
                comments = ?summary.comments,
                failed = summary.failed_ids.len(),
                "sync run finished"
            );

            if let Some(path) = self.write_summary(&summary).await? {
                info!(path = %path.display(), "run summary written");
            }
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    pub async fn write_summary(&self, summary: &SyncRunSummary) -> Result<Option<PathBuf>> {
        let Some(reports_dir) = &self.reports_dir else {
            return Ok(None);
        };
        let run_dir = reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let path = run_dir.join("sync_summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(Some(path))
    }
}

/// Run one sync pass over the recorded listing configured in `config`.
pub async fn run_sync_once(config: &SyncConfig, shutdown: &Shutdown) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(config).await?;
    let feed = open_listing(config)?;
    info!(
        url = %search_url(&config.query, &config.search_filter),
        increments = feed.len(),
        "replaying recorded search listing"
    );
    pipeline.run_once(&config.query, &feed, &feed, shutdown).await
}

pub fn open_listing(config: &SyncConfig) -> Result<ReplayFeed> {
    let listing_dir = config
        .listing_dir()
        .context("no listing source: set TUBELOG_FEED_DIR or TUBELOG_FIXTURES_DIR")?;
    ReplayFeed::from_dir(&listing_dir)
}
