//! Deal persistence (Postgres + in-memory) and HTTP fetch utilities.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealfeed_core::{DataOrigin, DealMessage, RunRecord, Watermark};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealfeed-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Insert-only sink for deal messages plus the append-only run log.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn load_watermark(&self) -> Result<Watermark, StoreError>;

    /// Insert one record; an existing id yields `Duplicate`, never an overwrite.
    async fn insert_message(&self, message: &DealMessage) -> Result<InsertOutcome, StoreError>;

    async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    async fn recent_messages(&self, limit: usize) -> Result<Vec<DealMessage>, StoreError>;

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;

    async fn count_messages(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgDealStore {
    pool: PgPool,
}

impl PgDealStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DealStore for PgDealStore {
    async fn load_watermark(&self) -> Result<Watermark, StoreError> {
        let row = sqlx::query("SELECT MAX(id) AS max_id FROM deal_messages")
            .fetch_one(&self.pool)
            .await?;
        let max_id: Option<i64> = row.try_get("max_id")?;
        Ok(Watermark(max_id))
    }

    async fn insert_message(&self, message: &DealMessage) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO deal_messages (id, title, body, photo_url, store, category, tags, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(&message.title)
        .bind(&message.body)
        .bind(&message.photo_url)
        .bind(&message.store)
        .bind(&message.category)
        .bind(&message.tags)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO poll_runs (run_id, ran_at, origin, messages_found, messages_processed, success_rate, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.run_id)
        .bind(run.ran_at)
        .bind(run.origin.map(|o| o.as_str()))
        .bind(i32::try_from(run.messages_found).unwrap_or(i32::MAX))
        .bind(i32::try_from(run.messages_processed).unwrap_or(i32::MAX))
        .bind(run.success_rate)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<DealMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, body, photo_url, store, category, tags, created_at
              FROM deal_messages
             ORDER BY id DESC
             LIMIT $1
            "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DealMessage {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                body: row.try_get("body")?,
                photo_url: row.try_get("photo_url")?,
                created_at: row.try_get("created_at")?,
                store: row.try_get("store")?,
                category: row.try_get("category")?,
                tags: row.try_get("tags")?,
            });
        }
        Ok(out)
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, ran_at, origin, messages_found, messages_processed, success_rate, error
              FROM poll_runs
             ORDER BY ran_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let found: i32 = row.try_get("messages_found")?;
            let processed: i32 = row.try_get("messages_processed")?;
            let origin: Option<String> = row.try_get("origin")?;
            out.push(RunRecord {
                run_id: row.try_get::<Uuid, _>("run_id")?,
                ran_at: row.try_get::<DateTime<Utc>, _>("ran_at")?,
                origin: origin.as_deref().and_then(DataOrigin::parse),
                messages_found: u32::try_from(found).unwrap_or_default(),
                messages_processed: u32::try_from(processed).unwrap_or_default(),
                success_rate: row.try_get("success_rate")?,
                error: row.try_get("error")?,
            });
        }
        Ok(out)
    }

    async fn count_messages(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM deal_messages")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or_default())
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit.max(1)).unwrap_or(i64::MAX)
}

/// Process-local store used in development mode and tests.
#[derive(Debug, Default)]
pub struct MemoryDealStore {
    messages: Mutex<BTreeMap<i64, DealMessage>>,
    runs: Mutex<Vec<RunRecord>>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_runs(&self) -> Vec<RunRecord> {
        self.runs.lock().await.clone()
    }

    pub async fn all_ids(&self) -> Vec<i64> {
        self.messages.lock().await.keys().copied().collect()
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn load_watermark(&self) -> Result<Watermark, StoreError> {
        let messages = self.messages.lock().await;
        Ok(Watermark(messages.keys().next_back().copied()))
    }

    async fn insert_message(&self, message: &DealMessage) -> Result<InsertOutcome, StoreError> {
        let mut messages = self.messages.lock().await;
        if messages.contains_key(&message.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        messages.insert(message.id, message.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.runs.lock().await.push(run.clone());
        Ok(())
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<DealMessage>, StoreError> {
        let messages = self.messages.lock().await;
        Ok(messages.values().rev().take(limit).cloned().collect())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let runs = self.runs.lock().await;
        Ok(runs.iter().rev().take(limit).cloned().collect())
    }

    async fn count_messages(&self) -> Result<u64, StoreError> {
        Ok(self.messages.lock().await.len() as u64)
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

/// Exponential delay: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// Errors name the call by `target` only; request URLs may embed credentials.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{target}: request failed: {source}")]
    Request {
        target: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{target}: http status {status}")]
    HttpStatus {
        status: u16,
        target: String,
        body: String,
    },
    #[error("{target}: malformed payload: {source}")]
    Decode {
        target: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    fn request(target: &str, err: reqwest::Error) -> Self {
        FetchError::Request {
            target: target.to_string(),
            source: err.without_url(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying throttling/server errors and transport failures.
    ///
    /// Non-2xx responses that are not retryable come back as
    /// `FetchError::HttpStatus` carrying a truncated body.
    pub async fn fetch_bytes(&self, target: &str, url: Url) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", call = target);
        self.fetch_bytes_inner(target, url).instrument(span).await
    }

    async fn fetch_bytes_inner(&self, target: &str, url: Url) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");

        let mut attempt = 0usize;
        loop {
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|e| FetchError::request(target, e))?
                            .to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "http fetch ok");
                        return Ok(FetchedResponse { status, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        target: target.to_string(),
                        body: truncate(&body, 300),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::request(target, err));
                }
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, target: &str, url: Url) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(target, url).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            target: target.to_string(),
            source,
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn deal(id: i64) -> DealMessage {
        DealMessage {
            id,
            title: format!("deal {id}"),
            body: format!("deal {id} body"),
            photo_url: None,
            created_at: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).single().unwrap(),
            store: None,
            category: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_ids() {
        let store = MemoryDealStore::new();
        assert_eq!(store.insert_message(&deal(7)).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_message(&deal(7)).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.count_messages().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_store_watermark_tracks_highest_id() {
        let store = MemoryDealStore::new();
        assert_eq!(store.load_watermark().await.unwrap(), Watermark::NONE);
        for id in [3, 11, 5] {
            store.insert_message(&deal(id)).await.unwrap();
        }
        assert_eq!(store.load_watermark().await.unwrap(), Watermark::at(11));

        let recent = store.recent_messages(2).await.unwrap();
        assert_eq!(recent.iter().map(|m| m.id).collect::<Vec<_>>(), vec![11, 5]);
    }

    #[tokio::test]
    async fn memory_store_keeps_runs_append_only() {
        let store = MemoryDealStore::new();
        let now = Utc::now();
        store
            .insert_run(&RunRecord::success(now, DataOrigin::Live, 2, 2))
            .await
            .unwrap();
        store.insert_run(&RunRecord::failure(now, "upstream down")).await.unwrap();

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].error.as_deref(), Some("upstream down"));
        assert!(runs[1].error.is_none());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }
}
