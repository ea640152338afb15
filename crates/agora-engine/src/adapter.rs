//! Contracts between the engine and its external collaborators: platform
//! adapters, the storage sink, and the scheduler's status callbacks.
//!
//! The engine never sees a platform's wire format. A batch adapter turns
//! one poll into decoded [`RawRecord`]s plus an optional cursor; a stream
//! adapter hands back a connection the supervisor drives. Exactly two
//! shapes exist, closed over by [`ArenaAdapter`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use agora_core::{RawRecord, TierSpec};
use agora_quota::CredentialGrant;

use crate::error::CollectError;

/// One page/window worth of a batch poll.
#[derive(Debug)]
pub struct PollRequest<'a> {
    pub terms: &'a [String],
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Cursor from the previous page, for cursor-paginated providers.
    pub cursor: Option<&'a str>,
    pub tier: &'a TierSpec,
    pub credential: Option<&'a CredentialGrant>,
}

/// Result of one batch poll.
#[derive(Debug, Default)]
pub struct PollPage {
    pub records: Vec<RawRecord>,
    /// Present when the provider has more pages.
    pub next_cursor: Option<String>,
    /// Set when a cursorless provider capped the response; the collector
    /// narrows the time window and re-polls.
    pub truncated: bool,
}

/// Batch-poll contract implemented per arena, outside the core.
#[async_trait]
pub trait BatchAdapter: Send + Sync {
    fn platform(&self) -> &str;

    /// Fetches one page of raw records for the given window and terms.
    async fn poll(&self, request: PollRequest<'_>) -> Result<PollPage, CollectError>;

    /// Cheap upstream liveness probe, consulted on tier re-selection.
    async fn health_check(&self) -> Result<(), CollectError>;
}

/// One inbound event on a live stream.
#[derive(Debug)]
pub struct StreamEvent {
    pub record: RawRecord,
    /// Cursor to checkpoint once this event has been processed.
    pub cursor: Option<String>,
}

/// A live transport session owned exclusively by one `StreamSession`.
#[async_trait]
pub trait StreamConnection: Send {
    /// Issues subscribe requests for `channels`. The supervisor never
    /// passes more channels than the arena's per-connection ceiling.
    async fn subscribe(&mut self, channels: &[String]) -> Result<(), CollectError>;

    /// Next inbound event. `Ok(None)` means the server closed cleanly;
    /// an `Err` is a transport failure and drives the reconnect path.
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, CollectError>;

    /// Best-effort unsubscribe before shutdown; errors are ignored by
    /// the caller.
    async fn unsubscribe(&mut self) -> Result<(), CollectError>;
}

/// Streaming contract implemented per arena, outside the core.
#[async_trait]
pub trait StreamAdapter: Send + Sync {
    fn platform(&self) -> &str;

    /// Opens a transport session. `checkpoint` is the last processed
    /// cursor, passed when the upstream supports resumption.
    async fn connect(
        &self,
        tier: &TierSpec,
        credential: Option<&CredentialGrant>,
        checkpoint: Option<&str>,
    ) -> Result<Box<dyn StreamConnection>, CollectError>;

    async fn health_check(&self) -> Result<(), CollectError>;
}

/// The two collector shapes the core ever needs.
#[derive(Clone)]
pub enum ArenaAdapter {
    Batch(Arc<dyn BatchAdapter>),
    Stream(Arc<dyn StreamAdapter>),
}

impl ArenaAdapter {
    #[must_use]
    pub fn platform(&self) -> &str {
        match self {
            ArenaAdapter::Batch(a) => a.platform(),
            ArenaAdapter::Stream(a) => a.platform(),
        }
    }
}

/// Downstream persistence for admitted records. Writes are append-style
/// and idempotent on `content_hash`; the engine assumes nothing else.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn store(&self, record: agora_core::ContentRecord) -> Result<(), CollectError>;
}

/// Status callbacks consumed by the external scheduler.
pub trait StatusCallback: Send + Sync {
    /// A stream session exceeded its reconnect cap and needs operator
    /// intervention. Reported exactly once per session.
    fn session_failed(&self, arena: &str, session_id: Uuid, reason: &str);

    /// A stream session reached terminal `Disconnected` after a
    /// requested shutdown.
    fn session_stopped(&self, arena: &str, session_id: Uuid);
}

/// Callback that only logs; the default when the scheduler does not
/// register one.
pub struct LogStatusCallback;

impl StatusCallback for LogStatusCallback {
    fn session_failed(&self, arena: &str, session_id: Uuid, reason: &str) {
        tracing::error!(arena, session = %session_id, reason, "stream session failed");
    }

    fn session_stopped(&self, arena: &str, session_id: Uuid) {
        tracing::info!(arena, session = %session_id, "stream session stopped");
    }
}
