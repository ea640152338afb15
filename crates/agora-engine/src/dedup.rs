//! Normalization from raw platform payloads to [`ContentRecord`] and
//! duplicate rejection.
//!
//! Field mappings (language names, country dialects, timestamp formats)
//! come from arena configuration; the mechanism here is lookup-with-
//! default — an unknown code passes through unmapped with a logged
//! warning rather than failing the record. Only a record with no usable
//! identity (neither platform id nor URL) is rejected as malformed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};

use agora_core::{ArenaConfig, ContentRecord, DedupScope, Engagement, RawRecord};

use crate::error::CollectError;

/// SHA-256 of the identity key, hex-encoded. Pure function of the
/// identifying fields: identical logical content always hashes
/// identically, regardless of collection time.
#[must_use]
pub fn content_hash(identity_key: &str) -> String {
    format!("{:x}", Sha256::digest(identity_key.as_bytes()))
}

/// Converts a raw platform payload into a UCR entry, applying the
/// arena's field mappings.
///
/// # Errors
///
/// Returns [`CollectError::MalformedPayload`] when the payload carries
/// neither a platform id nor a URL — without an identity the record can
/// never be deduplicated.
pub fn normalize(raw: &RawRecord, arena: &ArenaConfig) -> Result<ContentRecord, CollectError> {
    let url = raw.str_field("url").map(str::to_owned);
    let platform_id = raw
        .str_field("id")
        .map(str::to_owned)
        .or_else(|| url.clone());

    let Some(platform_id) = platform_id else {
        return Err(CollectError::MalformedPayload {
            context: format!("{} record for arena {}", raw.platform, arena.id),
            reason: "payload has neither 'id' nor 'url'".to_owned(),
        });
    };

    let language = map_language(raw, arena);
    let published_at = parse_published_at(raw, arena);

    let engagement = Engagement {
        likes: raw.i64_field("likes"),
        shares: raw.i64_field("shares"),
        comments: raw.i64_field("comments"),
        views: raw.i64_field("views"),
    };
    let engagement = if engagement.is_empty() {
        None
    } else {
        Some(engagement)
    };

    let media_urls = raw
        .payload
        .get("media_urls")
        .and_then(serde_json::Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let mut record = ContentRecord {
        platform: raw.platform.clone(),
        arena: arena.id.clone(),
        platform_id,
        content_type: arena.content_kind,
        title: raw.str_field("title").map(str::to_owned),
        text_content: raw.str_field("text").map(str::to_owned),
        url,
        language,
        published_at,
        collected_at: Utc::now(),
        author_id: raw.str_field("author_id").map(str::to_owned),
        author_name: raw.str_field("author_name").map(str::to_owned),
        engagement,
        media_urls,
        raw_metadata: raw.payload.clone(),
        content_hash: String::new(),
    };
    record.content_hash = content_hash(&record.identity_key());
    Ok(record)
}

/// Language from the payload mapped to an ISO code; falls back to the
/// country-dialect table when no language field exists. Unknown values
/// pass through unmapped.
fn map_language(raw: &RawRecord, arena: &ArenaConfig) -> Option<String> {
    if let Some(lang) = raw.str_field("language") {
        return Some(lookup_or_passthrough(
            &arena.mappings.languages,
            lang,
            &arena.id,
            "language",
        ));
    }
    raw.str_field("country").map(|country| {
        lookup_or_passthrough(&arena.mappings.countries, country, &arena.id, "country")
    })
}

fn lookup_or_passthrough(
    table: &HashMap<String, String>,
    value: &str,
    arena: &str,
    kind: &str,
) -> String {
    match table.get(value) {
        Some(mapped) => mapped.clone(),
        None => {
            if !table.is_empty() {
                tracing::warn!(arena, kind, value, "unmapped code — passing through");
            }
            value.to_owned()
        }
    }
}

/// `published_at` parsed as RFC 3339 first, then each arena-declared
/// format in order. Unparseable timestamps log and yield `None`; the
/// record itself survives.
fn parse_published_at(raw: &RawRecord, arena: &ArenaConfig) -> Option<DateTime<Utc>> {
    let value = raw.str_field("published_at")?;

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in &arena.mappings.timestamp_formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    tracing::warn!(
        arena = %arena.id,
        value,
        "unparseable published_at — leaving unset"
    );
    None
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Duplicate,
}

/// Append-only index of content hashes already emitted. Check-and-insert
/// is atomic: two concurrent callers can never both observe "absent" for
/// the same hash.
#[derive(Default)]
pub struct Deduplicator {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Deduplicator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a record unless its hash has been seen within the arena's
    /// dedup scope. Inserts on first sight.
    pub fn admit(&self, record: &ContentRecord, scope: DedupScope) -> Admission {
        let key = match scope {
            DedupScope::Global => record.content_hash.clone(),
            DedupScope::PerArena => format!("{}|{}", record.arena, record.content_hash),
        };
        let mut guard = self.lock();
        if guard.contains_key(&key) {
            return Admission::Duplicate;
        }
        guard.insert(key, Utc::now());
        Admission::Admitted
    }

    /// When a record's hash was first admitted, if ever.
    #[must_use]
    pub fn first_seen(&self, record: &ContentRecord, scope: DedupScope) -> Option<DateTime<Utc>> {
        let key = match scope {
            DedupScope::Global => record.content_hash.clone(),
            DedupScope::PerArena => format!("{}|{}", record.arena, record.content_hash),
        };
        self.lock().get(&key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
