//! Reconciliation stores (SQLite + in-memory) and HTTP fetch utilities for tubelog.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use tubelog_core::{
    CommentKey, CommentRecord, FieldSet, RawSnapshot, RevisionLog, VideoRecord, COMMENT_FIELDS,
    VIDEO_FIELDS,
};

pub const CRATE_NAME: &str = "tubelog-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no comment row matches {0:?}")]
    MissingComment(CommentKey),
    #[error("write rejected for {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentWrite {
    Insert,
    Update,
}

/// Storage seam used by the reconcilers.
///
/// Each method is one read or one atomic write; `put_video` commits the video
/// row and its raw snapshot together or not at all.
#[async_trait]
pub trait ReconcileStore: Send + Sync {
    async fn get_video(&self, video_id: &str) -> Result<Option<VideoRecord>, StoreError>;

    async fn get_snapshot(&self, video_id: &str) -> Result<Option<RawSnapshot>, StoreError>;

    async fn put_video(&self, video: &VideoRecord, snapshot: &RawSnapshot)
        -> Result<(), StoreError>;

    async fn put_snapshot(&self, snapshot: &RawSnapshot) -> Result<(), StoreError>;

    async fn get_comment(&self, key: &CommentKey) -> Result<Option<CommentRecord>, StoreError>;

    async fn put_comment(&self, comment: &CommentRecord, mode: CommentWrite)
        -> Result<(), StoreError>;

    async fn list_videos(&self) -> Result<Vec<VideoRecord>, StoreError>;

    async fn list_comments(&self, video_id: &str) -> Result<Vec<CommentRecord>, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub video_writes: usize,
    pub snapshot_writes: usize,
    pub comment_inserts: usize,
    pub comment_updates: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    videos: BTreeMap<String, VideoRecord>,
    snapshots: BTreeMap<String, RawSnapshot>,
    comments: Vec<CommentRecord>,
    rejected: HashSet<String>,
    stats: MemoryStats,
}

impl MemoryState {
    fn check(&self, video_id: &str) -> Result<(), StoreError> {
        if self.rejected.contains(video_id) {
            return Err(StoreError::Rejected(video_id.to_string()));
        }
        Ok(())
    }
}

/// Process-local store; comment rows are kept as a list so duplicates would show.
///
/// Rows are normalized the way `SqliteStore` stores them: the comment timestamp
/// field and the key's timestamp share one column, and updates never move a row's key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write touching `video_id` fail with [`StoreError::Rejected`].
    pub async fn reject_writes_for(&self, video_id: &str) {
        self.state.lock().await.rejected.insert(video_id.to_string());
    }

    pub async fn stats(&self) -> MemoryStats {
        self.state.lock().await.stats
    }
}

#[async_trait]
impl ReconcileStore for MemoryStore {
    async fn get_video(&self, video_id: &str) -> Result<Option<VideoRecord>, StoreError> {
        Ok(self.state.lock().await.videos.get(video_id).cloned())
    }

    async fn get_snapshot(&self, video_id: &str) -> Result<Option<RawSnapshot>, StoreError> {
        Ok(self.state.lock().await.snapshots.get(video_id).cloned())
    }

    async fn put_video(
        &self,
        video: &VideoRecord,
        snapshot: &RawSnapshot,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check(&video.id)?;
        state.videos.insert(video.id.clone(), video.clone());
        state
            .snapshots
            .insert(snapshot.video_id.clone(), snapshot.clone());
        state.stats.video_writes += 1;
        state.stats.snapshot_writes += 1;
        Ok(())
    }

    async fn put_snapshot(&self, snapshot: &RawSnapshot) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check(&snapshot.video_id)?;
        state
            .snapshots
            .insert(snapshot.video_id.clone(), snapshot.clone());
        state.stats.snapshot_writes += 1;
        Ok(())
    }

    async fn get_comment(&self, key: &CommentKey) -> Result<Option<CommentRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.comments.iter().find(|c| &c.key == key).cloned())
    }

    async fn put_comment(
        &self,
        comment: &CommentRecord,
        mode: CommentWrite,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check(&comment.key.video_id)?;
        match mode {
            CommentWrite::Insert => {
                let row = CommentRecord::new(
                    comment.key.clone(),
                    &comment.fields,
                    comment.revisions.clone(),
                );
                state.comments.push(row);
                state.stats.comment_inserts += 1;
            }
            CommentWrite::Update => {
                let row = state
                    .comments
                    .iter_mut()
                    .find(|c| c.key == comment.key)
                    .ok_or_else(|| StoreError::MissingComment(comment.key.clone()))?;
                *row = CommentRecord::new(row.key.clone(), &comment.fields, comment.revisions.clone());
                state.stats.comment_updates += 1;
            }
        }
        Ok(())
    }

    async fn list_videos(&self) -> Result<Vec<VideoRecord>, StoreError> {
        Ok(self.state.lock().await.videos.values().cloned().collect())
    }

    async fn list_comments(&self, video_id: &str) -> Result<Vec<CommentRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .comments
            .iter()
            .filter(|c| c.key.video_id == video_id)
            .cloned()
            .collect())
    }
}

const BASE_TABLES: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS videos (
        id TEXT PRIMARY KEY,
        title TEXT,
        channel TEXT,
        publish_time TEXT,
        description TEXT,
        duration TEXT,
        status TEXT,
        url TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comments (
        video_id TEXT,
        comment TEXT,
        author_name TEXT,
        author_channel_id TEXT,
        author_channel_url TEXT,
        comment_time_kst TEXT,
        FOREIGN KEY(video_id) REFERENCES videos(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS video_raw (
        id TEXT PRIMARY KEY,
        raw_json TEXT,
        FOREIGN KEY(id) REFERENCES videos(id)
    )
    "#,
];

/// Revision columns, added after the fact so databases created without them upgrade in place.
const REVISION_COLUMNS: [(&str, &str); 5] = [
    ("videos", "revised_contents TEXT"),
    ("videos", "revision_round INTEGER NOT NULL DEFAULT 0"),
    ("video_raw", "revised_count INTEGER DEFAULT 0"),
    ("comments", "revised_contents TEXT"),
    ("comments", "revision_round INTEGER NOT NULL DEFAULT 0"),
];

const COMMENT_IDENTITY_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS comments_identity
        ON comments (video_id, author_channel_id, comment_time_kst)
"#;

const UPSERT_VIDEO: &str = r#"
    INSERT INTO videos (id, title, channel, publish_time, description, duration, status, url,
                        revised_contents, revision_round)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    ON CONFLICT(id) DO UPDATE SET
        title = excluded.title,
        channel = excluded.channel,
        publish_time = excluded.publish_time,
        description = excluded.description,
        duration = excluded.duration,
        status = excluded.status,
        url = excluded.url,
        revised_contents = excluded.revised_contents,
        revision_round = excluded.revision_round
"#;

const UPSERT_SNAPSHOT: &str = r#"
    INSERT INTO video_raw (id, raw_json, revised_count)
    VALUES (?1, ?2, ?3)
    ON CONFLICT(id) DO UPDATE SET
        raw_json = excluded.raw_json,
        revised_count = excluded.revised_count
"#;

const SELECT_VIDEO: &str = r#"
    SELECT id, title, channel, publish_time, description, duration, status, url,
           revised_contents, revision_round
      FROM videos
"#;

const SELECT_COMMENT: &str = r#"
    SELECT video_id, comment, author_name, author_channel_id, author_channel_url,
           comment_time_kst, revised_contents, revision_round
      FROM comments
"#;

const INSERT_COMMENT: &str = r#"
    INSERT INTO comments (video_id, comment, author_name, author_channel_id, author_channel_url,
                          comment_time_kst, revised_contents, revision_round)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
"#;

/// Identity columns (`video_id`, `author_channel_id`, `comment_time_kst`) are
/// only matched, never rewritten.
const UPDATE_COMMENT: &str = r#"
    UPDATE comments
       SET comment = ?1,
           author_name = ?2,
           author_channel_url = ?3,
           revised_contents = ?4,
           revision_round = ?5
     WHERE video_id = ?6
       AND COALESCE(author_channel_id, '') = ?7
       AND COALESCE(comment_time_kst, '') = ?8
"#;

/// SQLite-backed store. Every write runs in its own transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);
        // An in-memory database lives and dies with its single connection.
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 4 });
        if in_memory {
            pool_options = pool_options
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create missing tables, then add any revision columns an older database lacks.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for ddl in BASE_TABLES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        for (table, column_def) in REVISION_COLUMNS {
            self.add_column_if_missing(table, column_def).await?;
        }
        sqlx::query(COMMENT_IDENTITY_INDEX)
            .execute(&self.pool)
            .await?;
        info!("sqlite schema ready");
        Ok(())
    }

    async fn add_column_if_missing(&self, table: &str, column_def: &str) -> Result<(), StoreError> {
        let column = column_def.split_whitespace().next().unwrap_or(column_def);
        let existing: Vec<String> = sqlx::query("SELECT name FROM pragma_table_info(?1)")
            .bind(table)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.try_get("name"))
            .collect::<Result<_, _>>()?;
        if existing.iter().any(|name| name == column) {
            return Ok(());
        }
        debug!(table, column, "adding revision column");
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column_def}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn revisions_from_row(row: &SqliteRow) -> Result<RevisionLog, sqlx::Error> {
    let text: Option<String> = row.try_get("revised_contents")?;
    let rounds: Option<i64> = row.try_get("revision_round")?;
    Ok(RevisionLog {
        text: text.unwrap_or_default(),
        rounds: rounds.and_then(|r| u32::try_from(r).ok()).unwrap_or(0),
    })
}

fn fields_from_row(row: &SqliteRow, tracked: &[&str]) -> Result<FieldSet, sqlx::Error> {
    let mut fields = FieldSet::new();
    for name in tracked {
        let value: Option<String> = row.try_get(*name)?;
        fields.set(*name, value.unwrap_or_default());
    }
    Ok(fields)
}

fn video_from_row(row: &SqliteRow) -> Result<VideoRecord, sqlx::Error> {
    Ok(VideoRecord {
        id: row.try_get("id")?,
        fields: fields_from_row(row, &VIDEO_FIELDS)?,
        revisions: revisions_from_row(row)?,
    })
}

fn comment_from_row(row: &SqliteRow) -> Result<CommentRecord, sqlx::Error> {
    let video_id: String = row.try_get("video_id")?;
    let author: Option<String> = row.try_get("author_channel_id")?;
    let time: Option<String> = row.try_get("comment_time_kst")?;
    Ok(CommentRecord {
        key: CommentKey::new(video_id, author.as_deref(), time.as_deref()),
        fields: fields_from_row(row, &COMMENT_FIELDS)?,
        revisions: revisions_from_row(row)?,
    })
}

#[async_trait]
impl ReconcileStore for SqliteStore {
    async fn get_video(&self, video_id: &str) -> Result<Option<VideoRecord>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_VIDEO} WHERE id = ?1"))
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(video_from_row).transpose()?)
    }

    async fn get_snapshot(&self, video_id: &str) -> Result<Option<RawSnapshot>, StoreError> {
        let row = sqlx::query("SELECT id, raw_json, revised_count FROM video_raw WHERE id = ?1")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw_json: Option<String> = row.try_get("raw_json")?;
        let revised_count: Option<i64> = row.try_get("revised_count")?;
        Ok(Some(RawSnapshot {
            video_id: row.try_get("id")?,
            raw_json: raw_json.unwrap_or_default(),
            revised_count: revised_count
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or(0),
        }))
    }

    async fn put_video(
        &self,
        video: &VideoRecord,
        snapshot: &RawSnapshot,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut upsert = sqlx::query(UPSERT_VIDEO).bind(&video.id);
        for name in VIDEO_FIELDS {
            upsert = upsert.bind(video.fields.get(name));
        }
        upsert
            .bind(&video.revisions.text)
            .bind(i64::from(video.revisions.rounds))
            .execute(&mut *tx)
            .await?;

        sqlx::query(UPSERT_SNAPSHOT)
            .bind(&snapshot.video_id)
            .bind(&snapshot.raw_json)
            .bind(i64::from(snapshot.revised_count))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn put_snapshot(&self, snapshot: &RawSnapshot) -> Result<(), StoreError> {
        sqlx::query(UPSERT_SNAPSHOT)
            .bind(&snapshot.video_id)
            .bind(&snapshot.raw_json)
            .bind(i64::from(snapshot.revised_count))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_comment(&self, key: &CommentKey) -> Result<Option<CommentRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "{SELECT_COMMENT} WHERE video_id = ?1 \
               AND COALESCE(author_channel_id, '') = ?2 \
               AND COALESCE(comment_time_kst, '') = ?3 \
             ORDER BY rowid LIMIT 1"
        ))
        .bind(&key.video_id)
        .bind(&key.author_channel_id)
        .bind(&key.comment_time_kst)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(comment_from_row).transpose()?)
    }

    async fn put_comment(
        &self,
        comment: &CommentRecord,
        mode: CommentWrite,
    ) -> Result<(), StoreError> {
        let fields = &comment.fields;
        let key = &comment.key;
        let mut tx = self.pool.begin().await?;
        match mode {
            CommentWrite::Insert => {
                sqlx::query(INSERT_COMMENT)
                    .bind(&key.video_id)
                    .bind(fields.get("comment"))
                    .bind(fields.get("author_name"))
                    .bind(&key.author_channel_id)
                    .bind(fields.get("author_channel_url"))
                    .bind(&key.comment_time_kst)
                    .bind(&comment.revisions.text)
                    .bind(i64::from(comment.revisions.rounds))
                    .execute(&mut *tx)
                    .await?;
            }
            CommentWrite::Update => {
                let result = sqlx::query(UPDATE_COMMENT)
                    .bind(fields.get("comment"))
                    .bind(fields.get("author_name"))
                    .bind(fields.get("author_channel_url"))
                    .bind(&comment.revisions.text)
                    .bind(i64::from(comment.revisions.rounds))
                    .bind(&key.video_id)
                    .bind(&key.author_channel_id)
                    .bind(&key.comment_time_kst)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::MissingComment(key.clone()));
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_videos(&self) -> Result<Vec<VideoRecord>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_VIDEO} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(video_from_row)
            .collect::<Result<_, _>>()?)
    }

    async fn list_comments(&self, video_id: &str) -> Result<Vec<CommentRecord>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COMMENT} WHERE video_id = ?1 ORDER BY rowid"))
            .bind(video_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(comment_from_row)
            .collect::<Result<_, _>>()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff applied around external fetches.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

impl HttpError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Single-shot JSON GETs. Retrying is left to the caller.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value, HttpError> {
        debug!(url, "http fetch");
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let final_url = resp.url().to_string();
            let body: String = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            return Err(HttpError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body,
            });
        }
        Ok(resp.json().await?)
    }
}
