//! One stream session: the connect/subscribe/receive/reconnect state
//! machine plus the normalization consumer that drains the session
//! buffer.
//!
//! Two tasks per session. The reader owns the transport connection and
//! only ever pushes into the bounded buffer; the processor normalizes,
//! admits, stores, and advances the checkpoint. Events are processed in
//! arrival order and the checkpoint advances monotonically — including
//! past duplicates, which were processed even though nothing was emitted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agora_core::{ArenaConfig, StreamSettings};
use agora_quota::{CredentialPool, TierSelector};

use crate::adapter::{RecordSink, StatusCallback, StreamAdapter, StreamConnection};
use crate::dedup::{normalize, Admission, Deduplicator};
use crate::error::CollectError;
use crate::metrics::ArenaMetrics;
use crate::stream::buffer::SessionBuffer;

/// Lifecycle of a stream session. `Disconnected` is terminal after a
/// requested shutdown; `Failed` is terminal after the reconnect cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
    Reconnecting,
    Failed,
}

/// Everything a session task needs; assembled by the supervisor.
pub(crate) struct SessionContext {
    pub id: Uuid,
    pub arena: ArenaConfig,
    pub settings: StreamSettings,
    pub channels: Vec<String>,
    pub adapter: Arc<dyn StreamAdapter>,
    pub pool: Arc<CredentialPool>,
    pub tiers: Arc<TierSelector>,
    pub dedup: Arc<Deduplicator>,
    pub sink: Arc<dyn RecordSink>,
    pub metrics: Arc<ArenaMetrics>,
    pub callback: Arc<dyn StatusCallback>,
    pub shutdown: CancellationToken,
    pub state_tx: watch::Sender<SessionState>,
    pub backoff_base_ms: u64,
}

enum SessionOutcome {
    Stopped,
    Failed(String),
}

enum ReadExit {
    Shutdown,
    Dropped(String),
}

pub(crate) async fn run_session(ctx: SessionContext) {
    let buffer = Arc::new(SessionBuffer::new(
        ctx.settings.buffer_capacity,
        Arc::clone(&ctx.metrics),
    ));
    let notify = Arc::new(Notify::new());
    let drained = CancellationToken::new();
    let (checkpoint_tx, checkpoint_rx) = watch::channel(None::<String>);

    let processor = tokio::spawn(process_events(
        ctx.arena.clone(),
        Arc::clone(&buffer),
        Arc::clone(&notify),
        drained.clone(),
        Arc::clone(&ctx.dedup),
        Arc::clone(&ctx.sink),
        Arc::clone(&ctx.metrics),
        checkpoint_tx,
    ));

    let outcome = drive_connection(&ctx, &buffer, &notify, &checkpoint_rx).await;

    // Let the processor flush whatever is buffered, then stop it.
    drained.cancel();
    notify.notify_waiters();
    if let Err(e) = processor.await {
        tracing::error!(session = %ctx.id, error = %e, "stream processor panicked");
    }

    match outcome {
        SessionOutcome::Stopped => {
            let _ = ctx.state_tx.send(SessionState::Disconnected);
            ctx.callback.session_stopped(&ctx.arena.id, ctx.id);
        }
        SessionOutcome::Failed(reason) => {
            let _ = ctx.state_tx.send(SessionState::Failed);
            ctx.metrics
                .sessions_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            // Reported exactly once per session: this is the only exit
            // path that reaches the callback with a failure.
            ctx.callback.session_failed(&ctx.arena.id, ctx.id, &reason);
        }
    }
}

/// The reconnect loop. Returns only on shutdown or when the retry cap
/// is exceeded.
async fn drive_connection(
    ctx: &SessionContext,
    buffer: &Arc<SessionBuffer>,
    notify: &Arc<Notify>,
    checkpoint_rx: &watch::Receiver<Option<String>>,
) -> SessionOutcome {
    let mut attempts: u32 = 0;
    let mut connected_before = false;

    loop {
        if ctx.shutdown.is_cancelled() {
            return SessionOutcome::Stopped;
        }

        let _ = ctx.state_tx.send(SessionState::Connecting);
        let failure = match open_and_subscribe(ctx, checkpoint_rx).await {
            Ok(mut conn) => {
                attempts = 0;
                connected_before = true;
                let _ = ctx.state_tx.send(SessionState::Receiving);
                match read_until_drop(ctx, conn.as_mut(), buffer, notify).await {
                    ReadExit::Shutdown => {
                        let _ = conn.unsubscribe().await;
                        return SessionOutcome::Stopped;
                    }
                    ReadExit::Dropped(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        attempts += 1;
        if attempts > ctx.settings.max_reconnect_attempts {
            return SessionOutcome::Failed(format!(
                "reconnect cap ({}) exceeded: {failure}",
                ctx.settings.max_reconnect_attempts
            ));
        }

        let _ = ctx.state_tx.send(SessionState::Reconnecting);
        ctx.metrics
            .reconnects
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if connected_before && !ctx.settings.supports_resume {
            // Everything between the drop and the reconnect is gone;
            // surface it instead of swallowing it.
            ctx.metrics
                .resume_gaps
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        tracing::warn!(
            session = %ctx.id,
            arena = %ctx.arena.id,
            attempts,
            reason = %failure,
            "stream dropped — reconnecting"
        );

        let delay = reconnect_delay(ctx.backoff_base_ms, attempts);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = ctx.shutdown.cancelled() => return SessionOutcome::Stopped,
        }
    }
}

/// Opens the transport with a tier-selected credential and subscribes
/// this session's channel slice.
async fn open_and_subscribe(
    ctx: &SessionContext,
    checkpoint_rx: &watch::Receiver<Option<String>>,
) -> Result<Box<dyn StreamConnection>, CollectError> {
    let tier = ctx
        .tiers
        .select(&ctx.arena, &std::collections::HashSet::new())?
        .clone();

    let grant = match &tier.credential_platform {
        Some(platform) => Some(ctx.pool.acquire(platform, &[])?),
        None => None,
    };

    let checkpoint = if ctx.settings.supports_resume {
        checkpoint_rx.borrow().clone()
    } else {
        None
    };

    let mut conn = ctx
        .adapter
        .connect(&tier, grant.as_ref(), checkpoint.as_deref())
        .await?;

    if let Some(g) = &grant {
        if let Err(e) = ctx
            .pool
            .report_usage(&g.credential_id, u64::from(tier.request_weight))
        {
            tracing::warn!(credential = %g.credential_id, error = %e, "usage report failed");
        }
    }

    let _ = ctx.state_tx.send(SessionState::Subscribed);
    conn.subscribe(&ctx.channels).await?;
    Ok(conn)
}

/// Pumps inbound events into the buffer until shutdown or a transport
/// drop. Never does per-event work beyond the push — the processor owns
/// that.
async fn read_until_drop(
    ctx: &SessionContext,
    conn: &mut dyn StreamConnection,
    buffer: &Arc<SessionBuffer>,
    notify: &Arc<Notify>,
) -> ReadExit {
    loop {
        tokio::select! {
            () = ctx.shutdown.cancelled() => return ReadExit::Shutdown,
            event = conn.next_event() => match event {
                Ok(Some(ev)) => {
                    buffer.push(ev);
                    notify.notify_one();
                }
                Ok(None) => return ReadExit::Dropped("server closed the stream".to_owned()),
                Err(e) => return ReadExit::Dropped(e.to_string()),
            },
        }
    }
}

/// Drains the session buffer: normalize, admit, store, checkpoint. Runs
/// until the reader signals `drained` and the buffer is empty, so a
/// shutdown flushes instead of discarding.
#[allow(clippy::too_many_arguments)]
async fn process_events(
    arena: ArenaConfig,
    buffer: Arc<SessionBuffer>,
    notify: Arc<Notify>,
    drained: CancellationToken,
    dedup: Arc<Deduplicator>,
    sink: Arc<dyn RecordSink>,
    metrics: Arc<ArenaMetrics>,
    checkpoint_tx: watch::Sender<Option<String>>,
) {
    use std::sync::atomic::Ordering;

    loop {
        // Arm the wakeup before checking the buffer so a push between
        // the check and the await is never missed.
        let notified = notify.notified();

        if let Some(event) = buffer.pop() {
            match normalize(&event.record, &arena) {
                Ok(record) => match dedup.admit(&record, arena.dedup_scope) {
                    Admission::Admitted => {
                        if let Err(e) = sink.store(record).await {
                            tracing::error!(arena = %arena.id, error = %e, "sink write failed");
                        } else {
                            metrics.records_admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Admission::Duplicate => {
                        metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                    }
                },
                Err(e) => {
                    metrics.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(arena = %arena.id, error = %e, "dropping malformed event");
                }
            }
            // The event was processed either way; a restart must not
            // replay it.
            if let Some(cursor) = event.cursor {
                let _ = checkpoint_tx.send(Some(cursor));
            }
            continue;
        }

        if drained.is_cancelled() && buffer.is_empty() {
            return;
        }
        notified.await;
    }
}

fn reconnect_delay(base_ms: u64, attempt: u32) -> Duration {
    const MAX_DELAY_MS: u64 = 60_000;
    let computed = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let capped = computed.min(MAX_DELAY_MS);
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let jittered = (capped as f64 * (rand::random::<f64>() * 0.5 + 0.75)) as u64;
    Duration::from_millis(jittered)
}
