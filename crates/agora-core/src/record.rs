//! Raw platform payloads and the normalized Universal Content Record.
//!
//! A [`RawRecord`] is whatever a platform adapter decoded off the wire,
//! kept as an opaque JSON map. Adapters surface identifying and content
//! fields under conventional keys (`id`, `url`, `title`, `text`,
//! `language`, `country`, `published_at`, `author_id`, `author_name`,
//! `media_urls`, engagement counts) so the normalizer can lift them into a
//! [`ContentRecord`] without knowing the wire format. Everything else in
//! the payload is preserved verbatim in `raw_metadata`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform-native payload as produced by an arena adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Platform tag (e.g. `"gdelt"`, `"twitch"`).
    pub platform: String,
    /// Decoded payload; shape is platform-specific.
    pub payload: serde_json::Value,
}

impl RawRecord {
    #[must_use]
    pub fn new(platform: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            platform: platform.into(),
            payload,
        }
    }

    /// Returns the string value at `key` in the payload, if present and
    /// non-empty.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Returns the integer value at `key` in the payload, if present.
    #[must_use]
    pub fn i64_field(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(serde_json::Value::as_i64)
    }
}

/// Broad content families the arenas collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// News/article metadata (batch arenas).
    Article,
    /// Search-suggestion snapshot entries.
    Suggestion,
    /// Live chat messages (streaming arenas).
    ChatMessage,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentKind::Article => write!(f, "article"),
            ContentKind::Suggestion => write!(f, "suggestion"),
            ContentKind::ChatMessage => write!(f, "chat_message"),
        }
    }
}

/// Nullable engagement counters carried when the platform exposes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub likes: Option<i64>,
    pub shares: Option<i64>,
    pub comments: Option<i64>,
    pub views: Option<i64>,
}

impl Engagement {
    /// `true` when no counter is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.likes.is_none() && self.shares.is_none() && self.comments.is_none()
            && self.views.is_none()
    }
}

/// Universal Content Record: the normalized output schema shared across
/// all arenas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRecord {
    pub platform: String,
    pub arena: String,
    pub platform_id: String,
    pub content_type: ContentKind,
    pub title: Option<String>,
    pub text_content: Option<String>,
    pub url: Option<String>,
    /// ISO 639-1 code after mapping; unmapped values pass through as-is.
    pub language: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
    pub engagement: Option<Engagement>,
    pub media_urls: Vec<String>,
    /// Full original payload, untouched.
    pub raw_metadata: serde_json::Value,
    /// SHA-256 over the identity key; see [`ContentRecord::identity_key`].
    pub content_hash: String,
}

impl ContentRecord {
    /// The stable identity of the logical content, independent of when it
    /// was collected: the URL when one exists, otherwise a
    /// platform-scoped composite of the platform id.
    ///
    /// `content_hash` is computed over exactly this string, so two
    /// collections of the same article or message always hash identically.
    #[must_use]
    pub fn identity_key(&self) -> String {
        match &self.url {
            Some(url) => format!("{}|{url}", self.platform),
            None => format!("{}|{}|{}", self.platform, self.content_type, self.platform_id),
        }
    }
}
