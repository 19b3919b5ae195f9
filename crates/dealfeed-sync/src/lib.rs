//! Poll cycle orchestration: watermark, fetch, normalize, media, persist, run log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dealfeed_adapters::{
    normalize_batch, DealSource, FallbackSource, MediaRef, NormalizedMessage, SourceError, TagRules,
    TelegramConfig, TelegramSource, MAX_FETCH_LIMIT,
};
use dealfeed_core::{DataOrigin, DealMessage, RunRecord, Watermark};
use dealfeed_storage::{
    BackoffPolicy, DealStore, HttpClientConfig, HttpFetcher, InsertOutcome, MemoryDealStore, PgDealStore,
    StoreError,
};
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "dealfeed-sync";

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_channel: String,
    pub database_url: Option<String>,
    pub telegram_api_base: String,
    pub telegram_web_base: String,
    pub fetch_limit: usize,
    pub batch_size: usize,
    pub max_attempts: usize,
    pub retry_base_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub tag_rules_path: PathBuf,
    pub scheduler_enabled: bool,
    pub poll_cron: String,
    pub web_port: u16,
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            non_empty(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            telegram_bot_token: non_empty("TELEGRAM_BOT_TOKEN"),
            telegram_channel: non_empty("TELEGRAM_CHANNEL").unwrap_or_else(|| "@dealsdrop".to_string()),
            database_url: non_empty("DATABASE_URL"),
            telegram_api_base: non_empty("TELEGRAM_API_BASE")
                .unwrap_or_else(|| "https://api.telegram.org".to_string()),
            telegram_web_base: non_empty("TELEGRAM_WEB_BASE").unwrap_or_else(|| "https://t.me".to_string()),
            fetch_limit: (number("DEALFEED_FETCH_LIMIT", 100) as usize).clamp(1, MAX_FETCH_LIMIT),
            batch_size: (number("DEALFEED_BATCH_SIZE", 5) as usize).max(1),
            max_attempts: (number("DEALFEED_MAX_ATTEMPTS", 3) as usize).max(1),
            retry_base_secs: number("DEALFEED_RETRY_BASE_SECS", 1),
            http_timeout_secs: number("DEALFEED_HTTP_TIMEOUT_SECS", 15).max(1),
            user_agent: non_empty("DEALFEED_USER_AGENT").unwrap_or_else(|| "dealfeed-bot/0.1".to_string()),
            tag_rules_path: non_empty("DEALFEED_TAG_RULES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules/tags.yaml")),
            scheduler_enabled: non_empty("DEALFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            poll_cron: non_empty("DEALFEED_POLL_CRON").unwrap_or_else(|| "0 */5 * * * *".to_string()),
            web_port: non_empty("DEALFEED_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }

    /// Missing credentials switch the whole flow to fixed fallback data.
    pub fn dev_mode(&self) -> bool {
        self.telegram_bot_token.is_none() || self.database_url.is_none()
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            fetch_limit: self.fetch_limit,
            batch_size: self.batch_size,
            retry: BackoffPolicy {
                max_retries: self.max_attempts.saturating_sub(1),
                base_delay: Duration::from_secs(self.retry_base_secs),
                max_delay: Duration::from_secs(60),
            },
        }
    }
}

/// `retry.max_retries + 1` attempts in total; failure `n` sleeps
/// `retry.delay_for_attempt(n)` before the next attempt.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub fetch_limit: usize,
    pub batch_size: usize,
    pub retry: BackoffPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            fetch_limit: MAX_FETCH_LIMIT,
            batch_size: 5,
            retry: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollSummary {
    pub processed: usize,
    pub total: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub timestamp: DateTime<Utc>,
    pub dev_mode: bool,
    pub origin: DataOrigin,
    pub attempts: usize,
    pub groups: Vec<usize>,
    #[serde(skip)]
    pub messages: Vec<DealMessage>,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("poll failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: usize, last_error: String },
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("upstream: {0}")]
    Source(#[from] SourceError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

enum RunState {
    Attempting,
    Success(PollSummary),
    Exhausted(String),
}

#[derive(Debug, Default)]
struct PersistTally {
    inserted: usize,
    duplicates: usize,
    failed: usize,
    groups: Vec<usize>,
    records: Vec<DealMessage>,
}

enum ItemOutcome {
    Inserted(DealMessage),
    Duplicate(DealMessage),
    Failed(DealMessage),
}

pub struct PollPipeline {
    source: Arc<dyn DealSource>,
    store: Arc<dyn DealStore>,
    fallback: FallbackSource,
    rules: TagRules,
    settings: PollSettings,
    dev_mode: bool,
}

impl PollPipeline {
    pub fn new(source: Arc<dyn DealSource>, store: Arc<dyn DealStore>, rules: TagRules) -> Self {
        Self {
            source,
            store,
            fallback: FallbackSource::new("@dealsdrop"),
            rules,
            settings: PollSettings::default(),
            dev_mode: false,
        }
    }

    pub fn with_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackSource) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    pub fn store(&self) -> Arc<dyn DealStore> {
        Arc::clone(&self.store)
    }

    /// The placeholder feed, normalized the same way live posts are.
    pub fn fallback_records(&self) -> Vec<DealMessage> {
        normalize_batch(&self.fallback.messages(), Watermark::NONE, &self.rules)
            .into_iter()
            .rev()
            .map(|item| {
                let mut record = item.record;
                if let MediaRef::Direct(url) = item.media {
                    record.photo_url = Some(url);
                }
                record
            })
            .collect()
    }

    /// Run one poll cycle with bounded retries and a run record either way.
    pub async fn run_once(&self) -> Result<PollSummary, PollError> {
        let mut failures = 0usize;
        let mut state = RunState::Attempting;
        loop {
            state = match state {
                RunState::Attempting => match self.attempt().await {
                    Ok(mut summary) => {
                        summary.attempts = failures + 1;
                        RunState::Success(summary)
                    }
                    Err(err) => {
                        failures += 1;
                        if failures > self.settings.retry.max_retries {
                            RunState::Exhausted(err.to_string())
                        } else {
                            let delay = self.settings.retry.delay_for_attempt(failures);
                            warn!(
                                attempt = failures,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "poll attempt failed; retrying"
                            );
                            tokio::time::sleep(delay).await;
                            RunState::Attempting
                        }
                    }
                },
                RunState::Success(summary) => {
                    info!(
                        processed = summary.processed,
                        total = summary.total,
                        duplicates = summary.duplicates,
                        failed = summary.failed,
                        origin = ?summary.origin,
                        attempts = summary.attempts,
                        "poll cycle complete"
                    );
                    return Ok(summary);
                }
                RunState::Exhausted(last_error) => {
                    error!(attempts = failures, error = %last_error, "poll cycle exhausted retries");
                    self.log_run(&RunRecord::failure(Utc::now(), last_error.clone())).await;
                    return Err(PollError::Exhausted {
                        attempts: failures,
                        last_error,
                    });
                }
            };
        }
    }

    async fn attempt(&self) -> Result<PollSummary, AttemptError> {
        let watermark = self.store.load_watermark().await?;
        let batch = self.source.fetch_batch(self.settings.fetch_limit).await?;

        let summary = match batch.origin {
            DataOrigin::Fallback => {
                let items = normalize_batch(&batch.messages, Watermark::NONE, &self.rules);
                let mut records = Vec::with_capacity(items.len());
                for item in items {
                    records.push(self.resolve_record(item).await);
                }
                let total = records.len();
                warn!(source = self.source.name(), posts = total, "serving fallback posts; not persisted");
                let tally = PersistTally {
                    records,
                    ..Default::default()
                };
                self.summary(DataOrigin::Fallback, total, tally)
            }
            DataOrigin::Live => {
                let items = normalize_batch(&batch.messages, watermark, &self.rules);
                info!(
                    source = self.source.name(),
                    fetched = batch.messages.len(),
                    new = items.len(),
                    watermark = ?watermark.0,
                    "filtered channel posts"
                );
                let total = items.len();
                let tally = self.persist(items).await;
                self.summary(DataOrigin::Live, total, tally)
            }
        };

        self.log_run(&RunRecord::success(
            summary.timestamp,
            summary.origin,
            summary.total,
            summary.processed,
        ))
        .await;
        Ok(summary)
    }

    fn summary(&self, origin: DataOrigin, total: usize, tally: PersistTally) -> PollSummary {
        PollSummary {
            processed: tally.inserted,
            total,
            duplicates: tally.duplicates,
            failed: tally.failed,
            timestamp: Utc::now(),
            dev_mode: self.dev_mode,
            origin,
            attempts: 1,
            groups: tally.groups,
            messages: tally.records,
        }
    }

    /// Sequential groups of `batch_size`; each group runs concurrently.
    async fn persist(&self, items: Vec<NormalizedMessage>) -> PersistTally {
        let mut tally = PersistTally::default();
        for group in items.chunks(self.settings.batch_size.max(1)) {
            let outcomes = join_all(group.iter().cloned().map(|item| self.process(item))).await;
            tally.groups.push(group.len());
            for outcome in outcomes {
                match outcome {
                    ItemOutcome::Inserted(record) => {
                        tally.inserted += 1;
                        tally.records.push(record);
                    }
                    ItemOutcome::Duplicate(record) => {
                        tally.duplicates += 1;
                        tally.records.push(record);
                    }
                    ItemOutcome::Failed(record) => {
                        tally.failed += 1;
                        tally.records.push(record);
                    }
                }
            }
        }
        tally
    }

    async fn process(&self, item: NormalizedMessage) -> ItemOutcome {
        let record = self.resolve_record(item).await;
        match self.store.insert_message(&record).await {
            Ok(InsertOutcome::Inserted) => ItemOutcome::Inserted(record),
            Ok(InsertOutcome::Duplicate) => ItemOutcome::Duplicate(record),
            Err(err) => {
                warn!(message_id = record.id, error = %err, "insert failed");
                ItemOutcome::Failed(record)
            }
        }
    }

    async fn resolve_record(&self, item: NormalizedMessage) -> DealMessage {
        let mut record = item.record;
        match self.source.resolve_media(&item.media).await {
            Ok(url) => record.photo_url = url,
            Err(err) => {
                warn!(message_id = record.id, error = %err, "media resolution failed; storing without photo");
                record.photo_url = None;
            }
        }
        record
    }

    async fn log_run(&self, run: &RunRecord) {
        if let Err(err) = self.store.insert_run(run).await {
            warn!(run_id = %run.run_id, error = %err, "failed to write run record");
        }
    }
}

/// Live source and Postgres store, or fallback source and in-memory store in dev mode.
pub async fn pipeline_from_config(config: &FeedConfig) -> Result<PollPipeline> {
    let rules = TagRules::load_or_bundled(&config.tag_rules_path)?;
    let fallback = FallbackSource::new(config.telegram_channel.clone());

    let source: Arc<dyn DealSource>;
    let store: Arc<dyn DealStore>;
    match (&config.telegram_bot_token, &config.database_url) {
        (Some(token), Some(database_url)) => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            let mut telegram = TelegramConfig::new(token.clone(), config.telegram_channel.clone());
            telegram.api_base = config.telegram_api_base.clone();
            telegram.web_base = config.telegram_web_base.clone();

            let pg = PgDealStore::connect(database_url).await?;
            pg.migrate().await.context("applying migrations")?;
            source = Arc::new(TelegramSource::new(http, telegram));
            store = Arc::new(pg);
        }
        _ => {
            warn!("TELEGRAM_BOT_TOKEN or DATABASE_URL missing; running in dev mode with fallback data");
            source = Arc::new(fallback.clone());
            store = Arc::new(MemoryDealStore::new());
        }
    }

    Ok(PollPipeline::new(source, store, rules)
        .with_fallback(fallback)
        .with_settings(config.poll_settings())
        .with_dev_mode(config.dev_mode()))
}

pub async fn run_poll_once_from_env() -> Result<PollSummary> {
    let config = FeedConfig::from_env();
    let pipeline = pipeline_from_config(&config).await?;
    Ok(pipeline.run_once().await?)
}

/// In-process cron trigger; each tick runs one poll cycle.
pub async fn build_scheduler(pipeline: Arc<PollPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            if let Err(err) = pipeline.run_once().await {
                error!(error = %err, "scheduled poll failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(config: &FeedConfig, pipeline: Arc<PollPipeline>) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline, &config.poll_cron).await.map(Some)
}
