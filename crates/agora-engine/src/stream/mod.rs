//! Lifecycle management for long-lived streaming collectors.
//!
//! The supervisor partitions an arena's channel set across sessions when
//! it exceeds the transport's per-connection subscription ceiling, spawns
//! one state-machine task per session, and exposes stop/state handles to
//! the external scheduler. Connection loss is never fatal to the
//! supervisor — only a session exceeding its reconnect cap is, and that
//! failure is scoped to the one session.

mod buffer;
mod session;

pub use session::SessionState;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agora_core::{AppConfig, ArenaConfig, CollectionMode};
use agora_quota::{CredentialPool, RateLimiter, TierSelector};

use crate::adapter::{RecordSink, StatusCallback, StreamAdapter};
use crate::dedup::Deduplicator;
use crate::error::CollectError;
use crate::metrics::ArenaMetrics;

use session::{run_session, SessionContext};

struct SessionHandle {
    arena: String,
    channels: Vec<String>,
    shutdown: CancellationToken,
    state_rx: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

/// Supervises every active stream session across arenas.
pub struct StreamingSupervisor {
    pool: Arc<CredentialPool>,
    tiers: Arc<TierSelector>,
    dedup: Arc<Deduplicator>,
    sink: Arc<dyn RecordSink>,
    metrics: Arc<ArenaMetrics>,
    callback: Arc<dyn StatusCallback>,
    backoff_base_ms: u64,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl StreamingSupervisor {
    #[must_use]
    pub fn new(
        pool: Arc<CredentialPool>,
        limiter: Arc<RateLimiter>,
        dedup: Arc<Deduplicator>,
        sink: Arc<dyn RecordSink>,
        metrics: Arc<ArenaMetrics>,
        callback: Arc<dyn StatusCallback>,
        config: &AppConfig,
    ) -> Self {
        let tiers = Arc::new(TierSelector::new(Arc::clone(&pool), limiter));
        Self {
            pool,
            tiers,
            dedup,
            sink,
            metrics,
            callback,
            backoff_base_ms: config.retry_backoff_base_ms,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts streaming collection for an arena, partitioning its channel
    /// set across as many sessions as the subscription ceiling requires.
    /// Returns the session ids, for later [`StreamingSupervisor::stop`]
    /// calls.
    ///
    /// # Errors
    ///
    /// Returns [`CollectError::Config`] when the arena is not a validated
    /// stream arena.
    pub fn start(
        &self,
        arena: &ArenaConfig,
        adapter: Arc<dyn StreamAdapter>,
    ) -> Result<Vec<Uuid>, CollectError> {
        if arena.mode != CollectionMode::Stream {
            return Err(CollectError::Config(format!(
                "arena '{}' is not a stream arena",
                arena.id
            )));
        }
        let Some(settings) = arena.stream.clone() else {
            return Err(CollectError::Config(format!(
                "stream arena '{}' has no stream settings",
                arena.id
            )));
        };

        let mut ids = Vec::new();
        let mut guard = self.lock();
        for chunk in settings.channels.chunks(settings.max_subscriptions_per_session) {
            let id = Uuid::new_v4();
            let shutdown = CancellationToken::new();
            let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

            let ctx = SessionContext {
                id,
                arena: arena.clone(),
                settings: settings.clone(),
                channels: chunk.to_vec(),
                adapter: Arc::clone(&adapter),
                pool: Arc::clone(&self.pool),
                tiers: Arc::clone(&self.tiers),
                dedup: Arc::clone(&self.dedup),
                sink: Arc::clone(&self.sink),
                metrics: Arc::clone(&self.metrics),
                callback: Arc::clone(&self.callback),
                shutdown: shutdown.clone(),
                state_tx,
                backoff_base_ms: self.backoff_base_ms,
            };

            tracing::info!(
                session = %id,
                arena = %arena.id,
                channels = chunk.len(),
                "starting stream session"
            );
            let task = tokio::spawn(run_session(ctx));
            guard.insert(
                id,
                SessionHandle {
                    arena: arena.id.clone(),
                    channels: chunk.to_vec(),
                    shutdown,
                    state_rx,
                    task,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    /// Requests shutdown of one session and waits for it to unsubscribe,
    /// flush its buffer, and reach a terminal state. Returns `false` for
    /// an unknown id.
    pub async fn stop(&self, session_id: Uuid) -> bool {
        let handle = self.lock().remove(&session_id);
        let Some(handle) = handle else {
            return false;
        };
        handle.shutdown.cancel();
        if let Err(e) = handle.task.await {
            tracing::error!(session = %session_id, error = %e, "session task join failed");
        }
        true
    }

    /// Stops every session the supervisor still tracks.
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.lock().keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }

    /// Current state of a session, if the supervisor still tracks it.
    #[must_use]
    pub fn session_state(&self, session_id: Uuid) -> Option<SessionState> {
        self.lock()
            .get(&session_id)
            .map(|h| *h.state_rx.borrow())
    }

    /// Channel slice a session is responsible for.
    #[must_use]
    pub fn session_channels(&self, session_id: Uuid) -> Option<Vec<String>> {
        self.lock().get(&session_id).map(|h| h.channels.clone())
    }

    /// Ids of all tracked sessions, with their arena.
    #[must_use]
    pub fn session_ids(&self) -> Vec<(Uuid, String)> {
        self.lock()
            .iter()
            .map(|(id, h)| (*id, h.arena.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use agora_core::{
        ContentKind, ContentRecord, CostModel, DedupScope, FieldMappings, RateSpec, RawRecord,
        StreamSettings, TierSpec,
    };

    use crate::adapter::{StreamConnection, StreamEvent};
    use crate::error::CollectError;

    // -------------------------------------------------------------------
    // Test doubles
    // -------------------------------------------------------------------

    struct VecSink(StdMutex<Vec<ContentRecord>>);

    impl VecSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Vec::new())))
        }

        fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RecordSink for VecSink {
        async fn store(&self, record: ContentRecord) -> Result<(), CollectError> {
            self.0.lock().unwrap().push(record);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingCallback {
        failed: AtomicU32,
        stopped: AtomicU32,
        last_reason: StdMutex<Option<String>>,
    }

    impl StatusCallback for CountingCallback {
        fn session_failed(&self, _arena: &str, _session_id: Uuid, reason: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            *self.last_reason.lock().unwrap() = Some(reason.to_owned());
        }

        fn session_stopped(&self, _arena: &str, _session_id: Uuid) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    enum AfterEvents {
        Pending,
        Error,
    }

    struct ScriptedConn {
        events: VecDeque<StreamEvent>,
        after: AfterEvents,
        subscribed: Arc<StdMutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl StreamConnection for ScriptedConn {
        async fn subscribe(&mut self, channels: &[String]) -> Result<(), CollectError> {
            self.subscribed.lock().unwrap().push(channels.to_vec());
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Option<StreamEvent>, CollectError> {
            if let Some(ev) = self.events.pop_front() {
                return Ok(Some(ev));
            }
            match self.after {
                AfterEvents::Pending => std::future::pending().await,
                AfterEvents::Error => {
                    Err(CollectError::Transport("heartbeat timeout".to_owned()))
                }
            }
        }

        async fn unsubscribe(&mut self) -> Result<(), CollectError> {
            Ok(())
        }
    }

    /// First connect yields `first_events` then `after`; later connects
    /// idle forever (or are refused when `fail_all_connects`).
    struct ScriptedStreamAdapter {
        connects: AtomicU32,
        first_events: StdMutex<Vec<StreamEvent>>,
        after: AfterEvents,
        fail_all_connects: bool,
        subscribed: Arc<StdMutex<Vec<Vec<String>>>>,
        checkpoints: StdMutex<Vec<Option<String>>>,
    }

    impl ScriptedStreamAdapter {
        fn new(first_events: Vec<StreamEvent>, after: AfterEvents) -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicU32::new(0),
                first_events: StdMutex::new(first_events),
                after,
                fail_all_connects: false,
                subscribed: Arc::new(StdMutex::new(Vec::new())),
                checkpoints: StdMutex::new(Vec::new()),
            })
        }

        fn refusing_all_connects() -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicU32::new(0),
                first_events: StdMutex::new(Vec::new()),
                after: AfterEvents::Pending,
                fail_all_connects: true,
                subscribed: Arc::new(StdMutex::new(Vec::new())),
                checkpoints: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamAdapter for ScriptedStreamAdapter {
        fn platform(&self) -> &str {
            "mock"
        }

        async fn connect(
            &self,
            _tier: &TierSpec,
            _credential: Option<&agora_quota::CredentialGrant>,
            checkpoint: Option<&str>,
        ) -> Result<Box<dyn StreamConnection>, CollectError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            self.checkpoints
                .lock()
                .unwrap()
                .push(checkpoint.map(str::to_owned));
            if self.fail_all_connects {
                return Err(CollectError::Transport("connect refused".to_owned()));
            }
            let events = if n == 0 {
                std::mem::take(&mut *self.first_events.lock().unwrap())
            } else {
                Vec::new()
            };
            let after = if n == 0 {
                match self.after {
                    AfterEvents::Pending => AfterEvents::Pending,
                    AfterEvents::Error => AfterEvents::Error,
                }
            } else {
                AfterEvents::Pending
            };
            Ok(Box::new(ScriptedConn {
                events: events.into(),
                after,
                subscribed: Arc::clone(&self.subscribed),
            }))
        }

        async fn health_check(&self) -> Result<(), CollectError> {
            Ok(())
        }
    }

    // -------------------------------------------------------------------
    // Fixtures
    // -------------------------------------------------------------------

    fn chat_event(id: &str) -> StreamEvent {
        StreamEvent {
            record: RawRecord::new("mock", json!({"id": id, "text": "hej med dig"})),
            cursor: Some(id.to_owned()),
        }
    }

    fn stream_arena(
        channels: &[&str],
        ceiling: usize,
        max_reconnects: u32,
        supports_resume: bool,
    ) -> ArenaConfig {
        ArenaConfig {
            id: "chat".to_owned(),
            platform: "mock".to_owned(),
            mode: CollectionMode::Stream,
            content_kind: ContentKind::ChatMessage,
            tiers: vec![TierSpec {
                name: "free".to_owned(),
                service: "svc-chat".to_owned(),
                cost: CostModel::Free,
                credential_platform: None,
                rate: RateSpec {
                    requests: 1000,
                    per_seconds: 1,
                },
                request_weight: 1,
            }],
            pagination: None,
            stream: Some(StreamSettings {
                channels: channels.iter().map(|c| (*c).to_owned()).collect(),
                max_subscriptions_per_session: ceiling,
                buffer_capacity: 1000,
                max_reconnect_attempts: max_reconnects,
                supports_resume,
            }),
            dedup_scope: DedupScope::default(),
            mappings: FieldMappings::default(),
        }
    }

    struct Harness {
        supervisor: StreamingSupervisor,
        sink: Arc<VecSink>,
        metrics: Arc<ArenaMetrics>,
        callback: Arc<CountingCallback>,
    }

    fn harness(backoff_base_ms: u64) -> Harness {
        let sink = VecSink::new();
        let metrics = Arc::new(ArenaMetrics::new());
        let callback = Arc::new(CountingCallback::default());
        let config = AppConfig {
            env: agora_core::Environment::Test,
            log_level: "info".to_owned(),
            arenas_path: "./config/arenas.yaml".into(),
            request_timeout_secs: 5,
            max_retries: 1,
            retry_backoff_base_ms: backoff_base_ms,
            rate_acquire_timeout_secs: 5,
            max_concurrent_jobs: 1,
        };
        let supervisor = StreamingSupervisor::new(
            Arc::new(CredentialPool::new(vec![])),
            Arc::new(RateLimiter::new()),
            Arc::new(Deduplicator::new()),
            Arc::clone(&sink) as Arc<dyn RecordSink>,
            Arc::clone(&metrics),
            Arc::clone(&callback) as Arc<dyn StatusCallback>,
            &config,
        );
        Harness {
            supervisor,
            sink,
            metrics,
            callback,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    // -------------------------------------------------------------------
    // Tests
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn channel_set_is_partitioned_across_sessions() {
        let h = harness(0);
        let adapter = ScriptedStreamAdapter::new(vec![], AfterEvents::Pending);
        let arena = stream_arena(&["c1", "c2", "c3", "c4", "c5"], 2, 5, false);

        let ids = h.supervisor.start(&arena, adapter.clone()).unwrap();
        assert_eq!(ids.len(), 3, "5 channels at ceiling 2 need 3 sessions");

        let subscribed = Arc::clone(&adapter.subscribed);
        wait_until(|| subscribed.lock().unwrap().len() == 3).await;

        let mut slices = subscribed.lock().unwrap().clone();
        slices.sort();
        assert_eq!(
            slices,
            vec![
                vec!["c1".to_owned(), "c2".to_owned()],
                vec!["c3".to_owned(), "c4".to_owned()],
                vec!["c5".to_owned()],
            ]
        );

        h.supervisor.stop_all().await;
        assert_eq!(h.callback.stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn events_are_normalized_deduplicated_and_stored() {
        let h = harness(0);
        let adapter = ScriptedStreamAdapter::new(
            vec![
                chat_event("m1"),
                chat_event("m2"),
                chat_event("m2"), // duplicate message id
                chat_event("m3"),
            ],
            AfterEvents::Pending,
        );
        let arena = stream_arena(&["dr_nyheder"], 10, 5, false);

        let ids = h.supervisor.start(&arena, adapter).unwrap();
        assert_eq!(ids.len(), 1);

        let sink = Arc::clone(&h.sink);
        wait_until(|| sink.len() == 3).await;
        let metrics = Arc::clone(&h.metrics);
        wait_until(move || metrics.snapshot().duplicates == 1).await;

        assert!(h.supervisor.stop(ids[0]).await);
        assert_eq!(
            h.supervisor.session_state(ids[0]),
            None,
            "stopped sessions are no longer tracked"
        );
        assert_eq!(h.callback.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(h.callback.failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transport_drop_moves_session_to_reconnecting() {
        // Long backoff keeps the session parked in Reconnecting where the
        // test can observe it.
        let h = harness(60_000);
        let adapter =
            ScriptedStreamAdapter::new(vec![chat_event("m1")], AfterEvents::Error);
        let arena = stream_arena(&["dr_nyheder"], 10, 5, false);

        let ids = h.supervisor.start(&arena, adapter).unwrap();
        let id = ids[0];

        let supervisor = &h.supervisor;
        wait_until(|| supervisor.session_state(id) == Some(SessionState::Reconnecting)).await;

        let snap = h.metrics.snapshot();
        assert_eq!(snap.reconnects, 1);
        assert_eq!(
            snap.resume_gaps, 1,
            "a drop on a non-resumable upstream is a surfaced gap"
        );

        // Shutdown during back-off still lands in terminal Disconnected.
        assert!(h.supervisor.stop(id).await);
        assert_eq!(h.callback.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(h.callback.failed.load(Ordering::SeqCst), 0);
        // The one event received before the drop was flushed, not lost.
        assert_eq!(h.sink.len(), 1);
    }

    #[tokio::test]
    async fn reconnect_cap_exceeded_reports_failure_exactly_once() {
        let h = harness(0);
        let adapter = ScriptedStreamAdapter::refusing_all_connects();
        let arena = stream_arena(&["dr_nyheder"], 10, 2, false);

        let ids = h.supervisor.start(&arena, adapter.clone()).unwrap();
        let id = ids[0];

        let supervisor = &h.supervisor;
        wait_until(|| supervisor.session_state(id) == Some(SessionState::Failed)).await;

        assert_eq!(h.callback.failed.load(Ordering::SeqCst), 1);
        assert_eq!(h.callback.stopped.load(Ordering::SeqCst), 0);
        assert_eq!(h.metrics.snapshot().sessions_failed, 1);
        // cap 2: three connect attempts, two counted reconnects.
        assert_eq!(adapter.connects.load(Ordering::SeqCst), 3);
        assert_eq!(h.metrics.snapshot().reconnects, 2);
        let reason = h.callback.last_reason.lock().unwrap().clone().unwrap();
        assert!(reason.contains("reconnect cap"), "reason: {reason}");
    }

    #[tokio::test]
    async fn checkpoint_resumes_after_reconnect_when_supported() {
        let h = harness(300);
        let adapter = ScriptedStreamAdapter::new(
            vec![chat_event("m1"), chat_event("m2")],
            AfterEvents::Error,
        );
        let arena = stream_arena(&["dr_nyheder"], 10, 5, true);

        let ids = h.supervisor.start(&arena, adapter.clone()).unwrap();

        let connects = &adapter.connects;
        wait_until(|| connects.load(Ordering::SeqCst) >= 2).await;

        let checkpoints = adapter.checkpoints.lock().unwrap().clone();
        assert_eq!(checkpoints[0], None, "first connect has no checkpoint");
        assert_eq!(
            checkpoints[1].as_deref(),
            Some("m2"),
            "reconnect must resume from the last processed cursor"
        );
        assert_eq!(
            h.metrics.snapshot().resume_gaps,
            0,
            "resumable upstreams lose nothing"
        );

        h.supervisor.stop(ids[0]).await;
    }

    #[tokio::test]
    async fn start_rejects_batch_arenas() {
        let h = harness(0);
        let adapter = ScriptedStreamAdapter::new(vec![], AfterEvents::Pending);
        let mut arena = stream_arena(&["c"], 1, 1, false);
        arena.mode = CollectionMode::Batch;
        let err = h.supervisor.start(&arena, adapter).unwrap_err();
        assert!(matches!(err, CollectError::Config(_)));
    }

    #[tokio::test]
    async fn stop_unknown_session_returns_false() {
        let h = harness(0);
        assert!(!h.supervisor.stop(Uuid::new_v4()).await);
    }
}
