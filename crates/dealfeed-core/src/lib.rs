//! Core domain model for the deal channel feed.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealfeed-core";

/// Chat reference carried on every channel post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChatRef {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// One resolution variant of a photo attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: Option<String>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub file_size: Option<u64>,
}

impl PhotoSize {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Channel post as produced by the upstream messaging API.
///
/// `photo_url` is only set by sources that already know a direct link
/// (the public web preview); Bot API posts carry `photo` variants instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    pub chat: ChatRef,
    pub date: i64,
    #[serde(default)]
    pub photo: Vec<PhotoSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl ChannelMessage {
    /// Body text: `text` for plain posts, `caption` for media posts.
    pub fn body(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn largest_photo(&self) -> Option<&PhotoSize> {
        self.photo.iter().max_by_key(|p| p.area())
    }

    pub fn posted_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.date, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Persisted deal record. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealMessage {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub store: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Audit row written once per poll invocation.
///
/// `origin` is `None` only for exhausted runs, where no batch was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub ran_at: DateTime<Utc>,
    pub origin: Option<DataOrigin>,
    pub messages_found: u32,
    pub messages_processed: u32,
    pub success_rate: f64,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn success(ran_at: DateTime<Utc>, origin: DataOrigin, found: usize, processed: usize) -> Self {
        let success_rate = if found == 0 {
            1.0
        } else {
            processed as f64 / found as f64
        };
        Self {
            run_id: Uuid::new_v4(),
            ran_at,
            origin: Some(origin),
            messages_found: saturating_u32(found),
            messages_processed: saturating_u32(processed),
            success_rate,
            error: None,
        }
    }

    pub fn failure(ran_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            ran_at,
            origin: None,
            messages_found: 0,
            messages_processed: 0,
            success_rate: 0.0,
            error: Some(error.into()),
        }
    }
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Highest external id already persisted; `None` for an empty store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Watermark(pub Option<i64>);

impl Watermark {
    pub const NONE: Watermark = Watermark(None);

    pub fn at(id: i64) -> Self {
        Self(Some(id))
    }

    pub fn admits(&self, id: i64) -> bool {
        match self.0 {
            Some(mark) => id > mark,
            None => true,
        }
    }
}

/// Whether a batch came from the upstream service or the fixed placeholder set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataOrigin {
    Live,
    Fallback,
}

impl DataOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataOrigin::Live => "live",
            DataOrigin::Fallback => "fallback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "live" => Some(DataOrigin::Live),
            "fallback" => Some(DataOrigin::Fallback),
            _ => None,
        }
    }
}

/// Handoff contract from a deal source into the poll pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedBatch {
    pub origin: DataOrigin,
    pub messages: Vec<ChannelMessage>,
}

impl FetchedBatch {
    pub fn live(messages: Vec<ChannelMessage>) -> Self {
        Self {
            origin: DataOrigin::Live,
            messages,
        }
    }

    pub fn fallback(messages: Vec<ChannelMessage>) -> Self {
        Self {
            origin: DataOrigin::Fallback,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_admits_only_newer_ids() {
        assert!(Watermark::NONE.admits(1));
        assert!(Watermark::at(10).admits(11));
        assert!(!Watermark::at(10).admits(10));
        assert!(!Watermark::at(10).admits(3));
    }

    #[test]
    fn bot_api_channel_post_deserializes() {
        let raw = r#"{
            "message_id": 42,
            "chat": {"id": -1001234567890, "title": "Deals", "username": "dealsdrop", "type": "channel"},
            "date": 1760000000,
            "caption": "  -40% on headphones at Amazon  ",
            "photo": [
                {"file_id": "small", "file_unique_id": "a", "width": 90, "height": 60},
                {"file_id": "large", "file_unique_id": "b", "width": 1280, "height": 853, "file_size": 90211}
            ]
        }"#;
        let msg: ChannelMessage = serde_json::from_str(raw).expect("parse");
        assert_eq!(msg.message_id, 42);
        assert_eq!(msg.body(), Some("-40% on headphones at Amazon"));
        assert_eq!(msg.largest_photo().map(|p| p.file_id.as_str()), Some("large"));
        assert_eq!(msg.posted_at().timestamp(), 1_760_000_000);
    }

    #[test]
    fn success_rate_handles_empty_runs() {
        let now = Utc::now();
        assert_eq!(RunRecord::success(now, DataOrigin::Live, 0, 0).success_rate, 1.0);
        assert_eq!(RunRecord::success(now, DataOrigin::Live, 4, 3).success_rate, 0.75);
        let failed = RunRecord::failure(now, "boom");
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(failed.origin, None);
        assert_eq!(failed.success_rate, 0.0);
    }

    #[test]
    fn origin_text_matches_its_json_form() {
        for origin in [DataOrigin::Live, DataOrigin::Fallback] {
            let json = serde_json::to_string(&origin).unwrap();
            assert_eq!(json, format!("\"{}\"", origin.as_str()));
            assert_eq!(DataOrigin::parse(origin.as_str()), Some(origin));
        }
        assert_eq!(DataOrigin::parse("LIVE"), None);
    }
}
