//! One entry point for the external scheduler.
//!
//! The engine owns the deduplication index and metrics shared by every
//! collector, and dispatches on the closed [`ArenaAdapter`] shape — a
//! batch arena cannot be started as a stream or vice versa.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agora_core::{AppConfig, ArenaConfig};
use agora_quota::{CredentialPool, RateLimiter};

use crate::adapter::{ArenaAdapter, LogStatusCallback, RecordSink, StatusCallback};
use crate::batch::{BatchCollector, CollectionJob, JobReport};
use crate::dedup::Deduplicator;
use crate::error::CollectError;
use crate::metrics::{ArenaMetrics, MetricsSnapshot};
use crate::stream::{SessionState, StreamingSupervisor};

pub struct Engine {
    batch: BatchCollector,
    streams: StreamingSupervisor,
    metrics: Arc<ArenaMetrics>,
    /// Bounds concurrently running batch jobs; stream sessions are
    /// bounded by their channel partitioning instead.
    jobs: Semaphore,
}

impl Engine {
    /// Builds an engine that reports stream lifecycle events through
    /// [`LogStatusCallback`].
    #[must_use]
    pub fn new(
        pool: Arc<CredentialPool>,
        limiter: Arc<RateLimiter>,
        sink: Arc<dyn RecordSink>,
        config: &AppConfig,
    ) -> Self {
        Self::with_callback(pool, limiter, sink, Arc::new(LogStatusCallback), config)
    }

    #[must_use]
    pub fn with_callback(
        pool: Arc<CredentialPool>,
        limiter: Arc<RateLimiter>,
        sink: Arc<dyn RecordSink>,
        callback: Arc<dyn StatusCallback>,
        config: &AppConfig,
    ) -> Self {
        let dedup = Arc::new(Deduplicator::new());
        let metrics = Arc::new(ArenaMetrics::new());
        let batch = BatchCollector::new(
            Arc::clone(&pool),
            Arc::clone(&limiter),
            Arc::clone(&dedup),
            Arc::clone(&sink),
            Arc::clone(&metrics),
            config,
        );
        let streams = StreamingSupervisor::new(
            pool,
            limiter,
            dedup,
            sink,
            Arc::clone(&metrics),
            callback,
            config,
        );
        Self {
            batch,
            streams,
            metrics,
            jobs: Semaphore::new(config.max_concurrent_jobs),
        }
    }

    /// Runs a batch job for a batch arena.
    ///
    /// # Errors
    ///
    /// Returns [`CollectError::Config`] when the adapter is a stream
    /// adapter. Collection failures are reported in the [`JobReport`],
    /// not as errors.
    pub async fn run_job(
        &self,
        arena: &ArenaConfig,
        adapter: &ArenaAdapter,
        job: CollectionJob,
        cancel: CancellationToken,
    ) -> Result<JobReport, CollectError> {
        match adapter {
            ArenaAdapter::Batch(a) => {
                let _permit = self
                    .jobs
                    .acquire()
                    .await
                    .map_err(|_| CollectError::Config("engine is shut down".to_owned()))?;
                Ok(self.batch.run(arena, Arc::clone(a), job, cancel).await)
            }
            ArenaAdapter::Stream(_) => Err(CollectError::Config(format!(
                "arena '{}' was invoked as batch with a stream adapter",
                arena.id
            ))),
        }
    }

    /// Starts streaming collection for a stream arena. Returns session
    /// ids for later [`Engine::stop_stream`] calls.
    ///
    /// # Errors
    ///
    /// Returns [`CollectError::Config`] when the adapter is a batch
    /// adapter or the arena carries no stream settings.
    pub fn start_stream(
        &self,
        arena: &ArenaConfig,
        adapter: &ArenaAdapter,
    ) -> Result<Vec<Uuid>, CollectError> {
        match adapter {
            ArenaAdapter::Stream(a) => self.streams.start(arena, Arc::clone(a)),
            ArenaAdapter::Batch(_) => Err(CollectError::Config(format!(
                "arena '{}' was invoked as stream with a batch adapter",
                arena.id
            ))),
        }
    }

    /// Stops one stream session; `false` for an unknown id.
    pub async fn stop_stream(&self, session_id: Uuid) -> bool {
        self.streams.stop(session_id).await
    }

    /// Stops every active stream session.
    pub async fn shutdown(&self) {
        self.streams.stop_all().await;
    }

    #[must_use]
    pub fn session_state(&self, session_id: Uuid) -> Option<SessionState> {
        self.streams.session_state(session_id)
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
