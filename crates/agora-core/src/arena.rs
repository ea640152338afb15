//! Arena configuration: tiers, pagination, streaming, field mappings.
//!
//! Arenas are declared in a YAML file supplied at startup and treated as
//! static for the lifetime of a job or session. [`load_arenas`] parses and
//! validates the whole file up front so a malformed arena fails fast
//! instead of mid-collection.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::record::ContentKind;
use crate::ConfigError;

/// How an arena's collector is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMode {
    Batch,
    Stream,
}

/// Pricing shape of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostModel {
    Free,
    PerRequest,
    PerUnit,
}

/// Request budget for a tier: `requests` tokens refilled over
/// `per_seconds` seconds. Capacity equals `requests`, so both
/// requests/second and requests/minute tiers are expressed directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSpec {
    pub requests: u32,
    pub per_seconds: u64,
}

impl RateSpec {
    /// Refill rate in tokens per second.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn tokens_per_second(&self) -> f64 {
        f64::from(self.requests) / self.per_seconds as f64
    }
}

/// One priced access mode for a platform, in arena priority order
/// (cheapest first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSpec {
    pub name: String,
    /// Upstream service this tier talks to (e.g. `"gdelt-doc"`,
    /// `"gdelt-bigquery"`).
    pub service: String,
    pub cost: CostModel,
    /// Credential platform tag required by this tier; `None` for
    /// unauthenticated endpoints.
    pub credential_platform: Option<String>,
    pub rate: RateSpec,
    /// Quota units consumed per successful request; >1 for per-unit
    /// priced services.
    #[serde(default = "default_request_weight")]
    pub request_weight: u32,
}

fn default_request_weight() -> u32 {
    1
}

/// Provider pagination constraints for batch arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaginationPolicy {
    /// The upstream hands out an opaque next-page cursor.
    Cursor { max_pages: usize },
    /// No cursor — the time window is halved and each half polled
    /// separately, down to `max_splits` subdivisions.
    WindowSplit { max_splits: u32 },
}

/// Streaming arena settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Channels/topics to subscribe.
    pub channels: Vec<String>,
    /// Transport's per-connection subscription ceiling; larger channel
    /// sets are partitioned across sessions.
    pub max_subscriptions_per_session: usize,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Whether the upstream can resume from a checkpoint cursor after a
    /// reconnect. When false, the disconnect-to-reconnect gap is lost and
    /// counted.
    #[serde(default)]
    pub supports_resume: bool,
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

/// Whether duplicate detection is scoped to one arena or spans all of
/// them. Per-arena is the default: two arenas can legitimately emit the
/// same URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    #[default]
    PerArena,
    Global,
}

/// Arena-declared normalization tables. Lookup is fail-open: unknown
/// codes pass through unmapped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMappings {
    /// Language name or platform code → ISO 639-1 code.
    #[serde(default)]
    pub languages: HashMap<String, String>,
    /// Country code → language dialect (e.g. `"DK"` → `"da-DK"`).
    #[serde(default)]
    pub countries: HashMap<String, String>,
    /// `chrono` format strings tried in order when `published_at` is not
    /// RFC 3339.
    #[serde(default)]
    pub timestamp_formats: Vec<String>,
}

/// One platform's collection logic and configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    pub id: String,
    pub platform: String,
    pub mode: CollectionMode,
    pub content_kind: ContentKind,
    /// Tiers in priority order, cheapest/free first.
    pub tiers: Vec<TierSpec>,
    #[serde(default)]
    pub pagination: Option<PaginationPolicy>,
    #[serde(default)]
    pub stream: Option<StreamSettings>,
    #[serde(default)]
    pub dedup_scope: DedupScope,
    #[serde(default)]
    pub mappings: FieldMappings,
}

#[derive(Debug, Deserialize)]
pub struct ArenasFile {
    pub arenas: Vec<ArenaConfig>,
}

/// Load and validate the arenas configuration from a YAML file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or fails
/// validation.
pub fn load_arenas(path: &Path) -> Result<ArenasFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ArenasFileIo {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_arenas(&content)
}

/// Parse and validate arenas configuration from a YAML string.
///
/// # Errors
///
/// Returns `ConfigError` on parse or validation failure.
pub fn parse_arenas(content: &str) -> Result<ArenasFile, ConfigError> {
    let file: ArenasFile = serde_yaml::from_str(content)?;
    validate_arenas(&file)?;
    Ok(file)
}

fn validate_arenas(file: &ArenasFile) -> Result<(), ConfigError> {
    let mut seen_ids = HashSet::new();

    for arena in &file.arenas {
        if arena.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "arena id must be non-empty".to_string(),
            ));
        }
        if !seen_ids.insert(arena.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate arena id '{}'",
                arena.id
            )));
        }
        if arena.tiers.is_empty() {
            return Err(ConfigError::Validation(format!(
                "arena '{}' declares no tiers",
                arena.id
            )));
        }

        let mut tier_names = HashSet::new();
        for tier in &arena.tiers {
            if !tier_names.insert(tier.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "arena '{}' has duplicate tier '{}'",
                    arena.id, tier.name
                )));
            }
            if tier.rate.requests == 0 || tier.rate.per_seconds == 0 {
                return Err(ConfigError::Validation(format!(
                    "arena '{}' tier '{}' has a zero rate",
                    arena.id, tier.name
                )));
            }
            if tier.request_weight == 0 {
                return Err(ConfigError::Validation(format!(
                    "arena '{}' tier '{}' has zero request weight",
                    arena.id, tier.name
                )));
            }
        }

        match arena.mode {
            CollectionMode::Batch => {
                if arena.pagination.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "batch arena '{}' must declare a pagination policy",
                        arena.id
                    )));
                }
            }
            CollectionMode::Stream => {
                let Some(stream) = &arena.stream else {
                    return Err(ConfigError::Validation(format!(
                        "stream arena '{}' must declare stream settings",
                        arena.id
                    )));
                };
                if stream.channels.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "stream arena '{}' declares no channels",
                        arena.id
                    )));
                }
                if stream.max_subscriptions_per_session == 0 {
                    return Err(ConfigError::Validation(format!(
                        "stream arena '{}' has a zero subscription ceiling",
                        arena.id
                    )));
                }
                if stream.buffer_capacity == 0 {
                    return Err(ConfigError::Validation(format!(
                        "stream arena '{}' has a zero buffer capacity",
                        arena.id
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r"
arenas:
  - id: news
    platform: gdelt
    mode: batch
    content_kind: article
    pagination:
      kind: cursor
      max_pages: 50
    tiers:
      - name: free
        service: gdelt-doc
        cost: free
        credential_platform: null
        rate: { requests: 60, per_seconds: 60 }
      - name: premium
        service: gdelt-bigquery
        cost: per_unit
        credential_platform: gcp
        rate: { requests: 10, per_seconds: 1 }
        request_weight: 5
  - id: chat
    platform: twitch
    mode: stream
    content_kind: chat_message
    dedup_scope: global
    stream:
      channels: [dr_nyheder, tv2news]
      max_subscriptions_per_session: 50
      supports_resume: false
    tiers:
      - name: helix
        service: twitch-eventsub
        cost: free
        credential_platform: twitch
        rate: { requests: 800, per_seconds: 60 }
";

    #[test]
    fn parses_valid_file() {
        let file = parse_arenas(VALID_YAML).expect("valid YAML should parse");
        assert_eq!(file.arenas.len(), 2);
        let news = &file.arenas[0];
        assert_eq!(news.mode, CollectionMode::Batch);
        assert_eq!(news.dedup_scope, DedupScope::PerArena);
        assert_eq!(news.tiers[1].request_weight, 5);
        assert!(matches!(
            news.pagination,
            Some(PaginationPolicy::Cursor { max_pages: 50 })
        ));
        let chat = &file.arenas[1];
        assert_eq!(chat.dedup_scope, DedupScope::Global);
        let stream = chat.stream.as_ref().expect("stream settings");
        assert_eq!(stream.buffer_capacity, 1000);
        assert_eq!(stream.max_reconnect_attempts, 5);
    }

    #[test]
    fn rejects_duplicate_arena_ids() {
        let yaml = VALID_YAML.replace("id: chat", "id: news");
        let err = parse_arenas(&yaml).unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation(ref m) if m.contains("duplicate arena id")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_empty_tier_list() {
        let yaml = r"
arenas:
  - id: news
    platform: gdelt
    mode: batch
    content_kind: article
    pagination: { kind: cursor, max_pages: 10 }
    tiers: []
";
        let err = parse_arenas(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref m) if m.contains("no tiers")));
    }

    #[test]
    fn rejects_zero_rate() {
        let yaml = VALID_YAML.replace("requests: 60", "requests: 0");
        let err = parse_arenas(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref m) if m.contains("zero rate")));
    }

    #[test]
    fn rejects_batch_arena_without_pagination() {
        let yaml = r"
arenas:
  - id: news
    platform: gdelt
    mode: batch
    content_kind: article
    tiers:
      - name: free
        service: gdelt-doc
        cost: free
        rate: { requests: 1, per_seconds: 1 }
";
        let err = parse_arenas(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref m) if m.contains("pagination")));
    }

    #[test]
    fn rejects_stream_arena_without_channels() {
        let yaml = VALID_YAML.replace("channels: [dr_nyheder, tv2news]", "channels: []");
        let err = parse_arenas(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref m) if m.contains("no channels")));
    }

    #[test]
    fn rate_spec_tokens_per_second() {
        let per_minute = RateSpec {
            requests: 60,
            per_seconds: 60,
        };
        assert!((per_minute.tokens_per_second() - 1.0).abs() < f64::EPSILON);
        let per_second = RateSpec {
            requests: 10,
            per_seconds: 1,
        };
        assert!((per_second.tokens_per_second() - 10.0).abs() < f64::EPSILON);
    }
}
