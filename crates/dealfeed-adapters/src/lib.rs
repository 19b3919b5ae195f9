//! Deal source contracts, the Telegram channel source, and message normalization.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use dealfeed_core::{ChannelMessage, ChatRef, DealMessage, FetchedBatch, Watermark};
use dealfeed_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dealfeed-adapters";

/// Bot API caps `getUpdates` at 100 entries.
pub const MAX_FETCH_LIMIT: usize = 100;

const TITLE_MAX_CHARS: usize = 120;
const UNTITLED: &str = "Untitled deal";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("telegram {method} rejected the call: {description}")]
    Api { method: String, description: String },
    #[error("{0} returned no channel posts")]
    Empty(&'static str),
    #[error("{0}")]
    Message(String),
}

/// Where a normalized message's photo comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    None,
    Direct(String),
    Attachment(String),
}

#[async_trait]
pub trait DealSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Newest channel posts, ascending by id, at most `limit` of them.
    async fn fetch_batch(&self, limit: usize) -> Result<FetchedBatch, SourceError>;

    async fn resolve_media(&self, media: &MediaRef) -> Result<Option<String>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub web_base: String,
    pub bot_token: String,
    pub channel: String,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            web_base: "https://t.me".to_string(),
            bot_token: bot_token.into(),
            channel: channel.into(),
        }
    }
}

/// Resolved form of the configured channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Id(i64),
    Handle(String),
}

impl ChatTarget {
    fn matches(&self, chat: &ChatRef, handle: Option<&str>) -> bool {
        let by_handle = |h: &str| {
            chat.username
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(h))
        };
        match self {
            ChatTarget::Id(id) => chat.id == *id || handle.is_some_and(by_handle),
            ChatTarget::Handle(h) => by_handle(h.as_str()),
        }
    }
}

/// Strips `@`, `https://t.me/` and `t.me/` prefixes. Numeric ids have no handle.
pub fn channel_handle(channel: &str) -> Option<String> {
    let trimmed = channel.trim();
    if trimmed.parse::<i64>().is_ok() {
        return None;
    }
    let handle = trimmed
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("t.me/s/")
        .trim_start_matches("t.me/")
        .trim_start_matches('@')
        .trim_end_matches('/');
    if handle.is_empty() {
        None
    } else {
        Some(handle.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    #[allow(dead_code)]
    update_id: i64,
    #[serde(default)]
    channel_post: Option<ChannelMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatInfo {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    #[serde(default)]
    file_path: Option<String>,
}

/// Live source: Bot API `getUpdates`, then the public web preview, then the
/// fixed placeholder set.
pub struct TelegramSource {
    http: HttpFetcher,
    config: TelegramConfig,
    fallback: FallbackSource,
}

impl TelegramSource {
    pub fn new(http: HttpFetcher, config: TelegramConfig) -> Self {
        let fallback = FallbackSource::new(config.channel.clone());
        Self {
            http,
            config,
            fallback,
        }
    }

    fn method_url(&self, method: &str, params: &[(&str, &str)]) -> Result<Url, SourceError> {
        let base = format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        );
        Url::parse_with_params(&base, params)
            .map_err(|e| SourceError::Message(format!("invalid {method} url: {e}")))
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: &[(&str, &str)]) -> Result<T, SourceError> {
        let url = self.method_url(method, params)?;
        let resp: ApiResponse<T> = self
            .http
            .fetch_json(method, url)
            .instrument(info_span!("telegram_call", method))
            .await
            .map_err(|err| api_error(method, err))?;
        match (resp.ok, resp.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(SourceError::Api {
                method: method.to_string(),
                description: resp.description.unwrap_or_else(|| "no result".to_string()),
            }),
        }
    }

    /// Numeric chat id for the configured channel; the handle itself on failure.
    pub async fn resolve_channel(&self) -> ChatTarget {
        if let Ok(id) = self.config.channel.trim().parse::<i64>() {
            return ChatTarget::Id(id);
        }
        let handle = channel_handle(&self.config.channel).unwrap_or_else(|| self.config.channel.clone());
        let chat_id = format!("@{handle}");
        match self.call::<ChatInfo>("getChat", &[("chat_id", chat_id.as_str())]).await {
            Ok(chat) => {
                debug!(chat_id = chat.id, handle = %handle, "resolved channel");
                ChatTarget::Id(chat.id)
            }
            Err(err) => {
                warn!(handle = %handle, error = %err, "channel resolution failed; using handle");
                ChatTarget::Handle(handle)
            }
        }
    }

    pub async fn fetch_updates(&self, target: &ChatTarget, limit: usize) -> Result<Vec<ChannelMessage>, SourceError> {
        let limit = limit.clamp(1, MAX_FETCH_LIMIT);
        let limit_param = MAX_FETCH_LIMIT.to_string();
        // Negative offset reads the tail of the queue; nothing is ever confirmed.
        let offset_param = format!("-{MAX_FETCH_LIMIT}");
        let updates: Vec<Update> = self
            .call(
                "getUpdates",
                &[
                    ("offset", offset_param.as_str()),
                    ("limit", limit_param.as_str()),
                    ("timeout", "0"),
                    ("allowed_updates", r#"["channel_post"]"#),
                ],
            )
            .await?;

        let handle = channel_handle(&self.config.channel);
        let mut posts = updates
            .into_iter()
            .filter_map(|u| u.channel_post)
            .filter(|m| target.matches(&m.chat, handle.as_deref()))
            .collect::<Vec<_>>();
        Ok(newest_ascending(&mut posts, limit))
    }

    pub async fn fetch_web_preview(&self, target: &ChatTarget, limit: usize) -> Result<Vec<ChannelMessage>, SourceError> {
        let handle = channel_handle(&self.config.channel).ok_or_else(|| {
            SourceError::Message("web preview needs a public channel handle".to_string())
        })?;
        let url = Url::parse(&format!(
            "{}/s/{}",
            self.config.web_base.trim_end_matches('/'),
            handle
        ))
        .map_err(|e| SourceError::Message(format!("invalid web preview url: {e}")))?;
        let resp = self.http.fetch_bytes("web_preview", url).await?;
        let html = String::from_utf8_lossy(&resp.body);
        let chat_id = match target {
            ChatTarget::Id(id) => *id,
            ChatTarget::Handle(_) => 0,
        };
        let mut posts = parse_web_preview(&html, &handle, chat_id)?;
        Ok(newest_ascending(&mut posts, limit.clamp(1, MAX_FETCH_LIMIT)))
    }

    pub async fn resolve_file_url(&self, file_id: &str) -> Result<String, SourceError> {
        let file: FileInfo = self.call("getFile", &[("file_id", file_id)]).await?;
        let file_path = file
            .file_path
            .ok_or_else(|| SourceError::Message(format!("getFile returned no path for {file_id}")))?;
        Ok(format!(
            "{}/file/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            file_path
        ))
    }
}

#[async_trait]
impl DealSource for TelegramSource {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn fetch_batch(&self, limit: usize) -> Result<FetchedBatch, SourceError> {
        let target = self.resolve_channel().await;

        let primary_err = match self.fetch_updates(&target, limit).await {
            Ok(posts) if !posts.is_empty() => {
                info!(posts = posts.len(), "fetched channel posts via getUpdates");
                return Ok(FetchedBatch::live(posts));
            }
            Ok(_) => SourceError::Empty("getUpdates"),
            Err(err) => err,
        };
        warn!(error = %primary_err, "getUpdates gave nothing; trying web preview");

        let alternative_err = match self.fetch_web_preview(&target, limit).await {
            Ok(posts) if !posts.is_empty() => {
                info!(posts = posts.len(), "fetched channel posts via web preview");
                return Ok(FetchedBatch::live(posts));
            }
            Ok(_) => SourceError::Empty("web preview"),
            Err(err) => err,
        };
        warn!(
            primary = %primary_err,
            alternative = %alternative_err,
            "all retrieval paths failed; serving fallback posts"
        );
        self.fallback.fetch_batch(limit).await
    }

    async fn resolve_media(&self, media: &MediaRef) -> Result<Option<String>, SourceError> {
        match media {
            MediaRef::None => Ok(None),
            MediaRef::Direct(url) => Ok(Some(url.clone())),
            MediaRef::Attachment(file_id) => self.resolve_file_url(file_id).await.map(Some),
        }
    }
}

/// Telegram answers rejected calls with a non-2xx status and a JSON description.
fn api_error(method: &str, err: FetchError) -> SourceError {
    if let FetchError::HttpStatus { body, .. } = &err {
        if let Some(description) = api_description(body) {
            return SourceError::Api {
                method: method.to_string(),
                description,
            };
        }
    }
    err.into()
}

fn api_description(body: &str) -> Option<String> {
    serde_json::from_str::<ApiResponse<serde_json::Value>>(body)
        .ok()
        .and_then(|r| r.description)
}

fn newest_ascending(posts: &mut Vec<ChannelMessage>, limit: usize) -> Vec<ChannelMessage> {
    posts.sort_by_key(|m| m.message_id);
    posts.dedup_by_key(|m| m.message_id);
    let skip = posts.len().saturating_sub(limit);
    posts.drain(..).skip(skip).collect()
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Message(e.to_string()))
}

/// Parse `t.me/s/<handle>` markup into channel posts.
pub fn parse_web_preview(html: &str, handle: &str, chat_id: i64) -> Result<Vec<ChannelMessage>, SourceError> {
    let document = Html::parse_document(html);
    let message_sel = selector(".tgme_widget_message[data-post]")?;
    let text_sel = selector(".tgme_widget_message_text")?;
    let time_sel = selector(".tgme_widget_message_date time[datetime]")?;
    let photo_sel = selector(".tgme_widget_message_photo_wrap[style]")?;

    let mut out = Vec::new();
    for node in document.select(&message_sel) {
        let Some(message_id) = node
            .value()
            .attr("data-post")
            .and_then(|post| post.rsplit('/').next())
            .and_then(|id| id.parse::<i64>().ok())
        else {
            continue;
        };

        let text = node
            .select(&text_sel)
            .next()
            .map(text_with_breaks)
            .filter(|t| !t.trim().is_empty());
        let date = node
            .select(&time_sel)
            .next()
            .and_then(|t| t.value().attr("datetime"))
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.timestamp())
            .unwrap_or_default();
        let photo_url = node
            .select(&photo_sel)
            .next()
            .and_then(|p| p.value().attr("style"))
            .and_then(css_background_url);

        out.push(ChannelMessage {
            message_id,
            text,
            caption: None,
            chat: ChatRef {
                id: chat_id,
                username: Some(handle.to_string()),
                title: None,
            },
            date,
            photo: Vec::new(),
            photo_url,
        });
    }
    Ok(out)
}

fn text_with_breaks(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in element.descendants() {
        match node.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) if el.name() == "br" => out.push('\n'),
            _ => {}
        }
    }
    out.trim().to_string()
}

fn css_background_url(style: &str) -> Option<String> {
    let start = style.find("url(")? + "url(".len();
    let rest = &style[start..];
    let end = rest.find(')')?;
    let url = rest[..end].trim().trim_matches(|c| c == '\'' || c == '"');
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

/// Fixed placeholder posts served when no live data can be obtained.
#[derive(Debug, Clone)]
pub struct FallbackSource {
    channel: String,
}

impl FallbackSource {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    pub fn messages(&self) -> Vec<ChannelMessage> {
        let chat = ChatRef {
            id: 0,
            username: channel_handle(&self.channel),
            title: Some("Deals".to_string()),
        };
        let placeholder = |message_id: i64, date: i64, text: &str, image: &str| ChannelMessage {
            message_id,
            text: Some(text.to_string()),
            caption: None,
            chat: chat.clone(),
            date,
            photo: Vec::new(),
            photo_url: Some(format!("https://placehold.co/800x600?text={image}")),
        };
        vec![
            placeholder(
                1,
                1_760_000_000,
                "Wireless headphones -45% at Amazon\nNoise cancelling, 30h battery. Limited time deal.",
                "Headphones",
            ),
            placeholder(
                2,
                1_760_003_600,
                "Air fryer 5L for $49 at Walmart\nFree shipping on orders over $35.",
                "Air+Fryer",
            ),
            placeholder(
                3,
                1_760_007_200,
                "Running sneakers 2 for 1 on AliExpress\nUse code RUN2X at checkout.",
                "Sneakers",
            ),
        ]
    }
}

#[async_trait]
impl DealSource for FallbackSource {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn fetch_batch(&self, limit: usize) -> Result<FetchedBatch, SourceError> {
        let mut messages = self.messages();
        messages.truncate(limit.max(1));
        Ok(FetchedBatch::fallback(messages))
    }

    async fn resolve_media(&self, media: &MediaRef) -> Result<Option<String>, SourceError> {
        match media {
            MediaRef::Direct(url) => Ok(Some(url.clone())),
            MediaRef::None | MediaRef::Attachment(_) => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagRule {
    pub tag: String,
    pub contains_any: Vec<String>,
}

/// Keyword rules used to tag deals with a store and a category.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagRules {
    #[serde(default)]
    pub stores: Vec<TagRule>,
    #[serde(default)]
    pub categories: Vec<TagRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tagging {
    pub store: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

const BUNDLED_TAG_RULES: &str = include_str!("../../../rules/tags.yaml");

impl TagRules {
    pub fn bundled() -> Result<Self> {
        serde_yaml::from_str(BUNDLED_TAG_RULES).context("parsing bundled tag rules")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Rules from `path` when it exists, the bundled set otherwise.
    pub fn load_or_bundled(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_path(path)
        } else {
            Self::bundled()
        }
    }

    pub fn classify(&self, text: &str) -> Tagging {
        let haystack = text.to_lowercase();
        let hits = |rule: &TagRule| {
            rule.contains_any
                .iter()
                .any(|needle| haystack.contains(&needle.to_lowercase()))
        };

        let mut tagging = Tagging::default();
        for rule in self.stores.iter().filter(|r| hits(r)) {
            tagging.store.get_or_insert_with(|| rule.tag.clone());
            push_unique(&mut tagging.tags, &rule.tag);
        }
        for rule in self.categories.iter().filter(|r| hits(r)) {
            tagging.category.get_or_insert_with(|| rule.tag.clone());
            push_unique(&mut tagging.tags, &rule.tag);
        }
        tagging
    }
}

fn push_unique(tags: &mut Vec<String>, tag: &str) {
    if !tags.iter().any(|t| t == tag) {
        tags.push(tag.to_string());
    }
}

/// A deal record awaiting media resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub record: DealMessage,
    pub media: MediaRef,
}

pub fn derive_title(body: &str) -> String {
    let Some(line) = body.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return UNTITLED.to_string();
    };
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let mut title = line.chars().take(TITLE_MAX_CHARS - 1).collect::<String>();
    title.push('…');
    title
}

pub fn normalize(message: &ChannelMessage, rules: &TagRules) -> NormalizedMessage {
    let body = message.body().unwrap_or_default().to_string();
    let title = derive_title(&body);
    let tagging = rules.classify(&body);
    let media = match (&message.photo_url, message.largest_photo()) {
        (Some(url), _) => MediaRef::Direct(url.clone()),
        (None, Some(photo)) => MediaRef::Attachment(photo.file_id.clone()),
        (None, None) => MediaRef::None,
    };

    NormalizedMessage {
        record: DealMessage {
            id: message.message_id,
            title,
            body,
            photo_url: None,
            created_at: message.posted_at(),
            store: tagging.store,
            category: tagging.category,
            tags: tagging.tags,
        },
        media,
    }
}

/// Drops everything at or below `watermark`; output is ascending by id.
pub fn normalize_batch(messages: &[ChannelMessage], watermark: Watermark, rules: &TagRules) -> Vec<NormalizedMessage> {
    let mut out = messages
        .iter()
        .filter(|m| watermark.admits(m.message_id))
        .map(|m| normalize(m, rules))
        .collect::<Vec<_>>();
    out.sort_by_key(|n| n.record.id);
    out.dedup_by_key(|n| n.record.id);
    out
}
