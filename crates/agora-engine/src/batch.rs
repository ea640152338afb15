//! Batch collection: one job = one arena, one time window, one term set.
//!
//! Every page re-runs tier selection and credential acquisition, so
//! quota exhaustion or an upstream failure mid-job falls back to the
//! next tier without restarting the job. Records flow through the
//! normalizer and deduplicator to the sink as pages arrive; a cancelled
//! or failed job keeps everything already admitted.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agora_core::{AppConfig, ArenaConfig, PaginationPolicy, TierSpec};
use agora_quota::{CredentialGrant, CredentialPool, RateLimiter, TierSelector};

use crate::adapter::{BatchAdapter, PollPage, PollRequest, RecordSink};
use crate::dedup::{normalize, Admission, Deduplicator};
use crate::error::CollectError;
use crate::metrics::ArenaMetrics;
use crate::retry::retry_with_backoff;

/// A scheduler-created unit of batch work. Owned by the collector for
/// the duration of the run and discarded after the report is returned.
#[derive(Debug, Clone)]
pub struct CollectionJob {
    pub id: Uuid,
    pub arena: String,
    pub terms: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl CollectionJob {
    #[must_use]
    pub fn new(
        arena: impl Into<String>,
        terms: Vec<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            arena: arena.into(),
            terms,
            window_start,
            window_end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    /// Cancelled or stopped early; records admitted so far are kept.
    Partial,
    Failed,
}

/// Outcome returned to the scheduler. The job record itself is not
/// persisted by the engine.
#[derive(Debug)]
pub struct JobReport {
    pub job_id: Uuid,
    pub arena: String,
    pub status: JobStatus,
    /// Tier that served the final page.
    pub tier_used: Option<String>,
    pub pages_fetched: u32,
    pub records_seen: u64,
    pub records_admitted: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub error: Option<String>,
}

/// Per-arena batch collector wired to the shared credential pool, rate
/// limiter, deduplicator, and sink.
pub struct BatchCollector {
    pool: Arc<CredentialPool>,
    limiter: Arc<RateLimiter>,
    tiers: TierSelector,
    dedup: Arc<Deduplicator>,
    sink: Arc<dyn RecordSink>,
    metrics: Arc<ArenaMetrics>,
    max_retries: u32,
    backoff_base_ms: u64,
    rate_acquire_timeout: Duration,
}

impl BatchCollector {
    #[must_use]
    pub fn new(
        pool: Arc<CredentialPool>,
        limiter: Arc<RateLimiter>,
        dedup: Arc<Deduplicator>,
        sink: Arc<dyn RecordSink>,
        metrics: Arc<ArenaMetrics>,
        config: &AppConfig,
    ) -> Self {
        let tiers = TierSelector::new(Arc::clone(&pool), Arc::clone(&limiter));
        Self {
            pool,
            limiter,
            tiers,
            dedup,
            sink,
            metrics,
            max_retries: config.max_retries,
            backoff_base_ms: config.retry_backoff_base_ms,
            rate_acquire_timeout: Duration::from_secs(config.rate_acquire_timeout_secs),
        }
    }

    /// Runs one batch job to completion, cancellation, or failure.
    ///
    /// Cancellation is honoured between pagination steps and at retry
    /// boundaries; an early stop yields `JobStatus::Partial`, never an
    /// error.
    pub async fn run(
        &self,
        arena: &ArenaConfig,
        adapter: Arc<dyn BatchAdapter>,
        job: CollectionJob,
        cancel: CancellationToken,
    ) -> JobReport {
        let mut report = JobReport {
            job_id: job.id,
            arena: job.arena.clone(),
            status: JobStatus::Succeeded,
            tier_used: None,
            pages_fetched: 0,
            records_seen: 0,
            records_admitted: 0,
            duplicates: 0,
            malformed: 0,
            error: None,
        };

        let Some(policy) = arena.pagination else {
            report.status = JobStatus::Failed;
            report.error = Some(format!("arena '{}' has no pagination policy", arena.id));
            self.metrics
                .jobs_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return report;
        };

        tracing::info!(
            job = %job.id,
            arena = %arena.id,
            window_start = %job.window_start,
            window_end = %job.window_end,
            terms = job.terms.len(),
            "starting batch job"
        );

        self.drive(arena, &adapter, &job, policy, &cancel, &mut report)
            .await;

        match report.status {
            JobStatus::Succeeded => {}
            JobStatus::Partial => {
                self.metrics
                    .jobs_partial
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            JobStatus::Failed => {
                self.metrics
                    .jobs_failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }

        tracing::info!(
            job = %job.id,
            arena = %arena.id,
            status = ?report.status,
            pages = report.pages_fetched,
            admitted = report.records_admitted,
            duplicates = report.duplicates,
            "batch job finished"
        );
        report
    }

    #[allow(clippy::too_many_lines)]
    async fn drive(
        &self,
        arena: &ArenaConfig,
        adapter: &Arc<dyn BatchAdapter>,
        job: &CollectionJob,
        policy: PaginationPolicy,
        cancel: &CancellationToken,
        report: &mut JobReport,
    ) {
        let mut excluded: HashSet<String> = HashSet::new();
        // Cursor pagination state.
        let mut cursor: Option<String> = None;
        // Window-split pagination state.
        let mut windows: VecDeque<(DateTime<Utc>, DateTime<Utc>)> =
            VecDeque::from([(job.window_start, job.window_end)]);
        let mut splits_used = 0u32;
        let mut current_tier: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                report.status = JobStatus::Partial;
                return;
            }

            // Per-policy termination and the window for this poll.
            let (window_start, window_end) = match policy {
                PaginationPolicy::Cursor { max_pages } => {
                    if usize::try_from(report.pages_fetched).is_ok_and(|p| p >= max_pages) {
                        // Cycling cursor guard; everything admitted so
                        // far is already downstream.
                        report.status = JobStatus::Partial;
                        report.error =
                            Some(format!("pagination limit reached: {max_pages} pages"));
                        return;
                    }
                    (job.window_start, job.window_end)
                }
                PaginationPolicy::WindowSplit { .. } => match windows.front() {
                    Some(&w) => w,
                    None => return,
                },
            };

            let tier = match self.tiers.select(arena, &excluded) {
                Ok(t) => t.clone(),
                Err(e) => {
                    report.status = JobStatus::Failed;
                    report.error = Some(e.to_string());
                    return;
                }
            };

            if current_tier.as_deref() != Some(tier.name.as_str()) {
                if current_tier.is_some() {
                    // Cursor belongs to the failed tier's service; restart
                    // and let the deduplicator absorb the overlap.
                    cursor = None;
                    self.metrics
                        .tier_fallbacks
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tracing::warn!(
                        job = %job.id,
                        arena = %arena.id,
                        tier = %tier.name,
                        "falling back to tier"
                    );
                }
                current_tier = Some(tier.name.clone());
                report.tier_used = Some(tier.name.clone());
            }

            let grant = match &tier.credential_platform {
                Some(platform) => match self.pool.acquire(platform, &[]) {
                    Ok(g) => Some(g),
                    Err(e) => {
                        // Lost a race for the last credential since the
                        // selector's probe; drop this tier for the job.
                        tracing::debug!(
                            job = %job.id,
                            tier = %tier.name,
                            error = %e,
                            "credential acquisition failed after probe"
                        );
                        excluded.insert(tier.name.clone());
                        continue;
                    }
                },
                None => None,
            };

            let outcome = self
                .poll_with_retries(adapter, job, &tier, grant.as_ref(), cursor.as_deref(), window_start, window_end, cancel)
                .await;

            match outcome {
                Ok(page) => {
                    if let Some(g) = &grant {
                        if let Err(e) = self
                            .pool
                            .report_usage(&g.credential_id, u64::from(tier.request_weight))
                        {
                            tracing::warn!(credential = %g.credential_id, error = %e, "usage report failed");
                        }
                    }
                    report.pages_fetched += 1;

                    match policy {
                        PaginationPolicy::Cursor { .. } => {
                            self.process_page(arena, page.records, report).await;
                            cursor = page.next_cursor;
                            if cursor.is_none() {
                                return;
                            }
                        }
                        PaginationPolicy::WindowSplit { max_splits } => {
                            windows.pop_front();
                            let halvable =
                                (window_end - window_start) > chrono::Duration::seconds(2);
                            if page.truncated && splits_used < max_splits && halvable {
                                // Provider capped the response; re-poll
                                // both halves instead of processing a
                                // truncated page.
                                let mid = window_start + (window_end - window_start) / 2;
                                windows.push_front((mid, window_end));
                                windows.push_front((window_start, mid));
                                splits_used += 1;
                                tracing::debug!(
                                    job = %job.id,
                                    arena = %arena.id,
                                    splits_used,
                                    "truncated window — splitting"
                                );
                            } else {
                                self.process_page(arena, page.records, report).await;
                            }
                            if windows.is_empty() {
                                return;
                            }
                        }
                    }
                }
                Err(e) if e.is_auth() => {
                    match &grant {
                        Some(g) => {
                            if let Err(err) =
                                self.pool.invalidate(&g.credential_id, &e.to_string())
                            {
                                tracing::warn!(error = %err, "invalidate failed");
                            }
                        }
                        // Auth failure without a credential cannot be
                        // fixed by rotation; drop the tier.
                        None => {
                            excluded.insert(tier.name.clone());
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    // In-place retries are exhausted. If the upstream is
                    // down entirely, stop burning the remaining tiers.
                    if let Err(health) = adapter.health_check().await {
                        report.status = JobStatus::Failed;
                        report.error = Some(format!(
                            "upstream unhealthy after {e}: {health}"
                        ));
                        return;
                    }
                    excluded.insert(tier.name.clone());
                }
                Err(e) => {
                    report.status = JobStatus::Failed;
                    report.error = Some(e.to_string());
                    return;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn poll_with_retries(
        &self,
        adapter: &Arc<dyn BatchAdapter>,
        job: &CollectionJob,
        tier: &TierSpec,
        grant: Option<&CredentialGrant>,
        cursor: Option<&str>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<PollPage, CollectError> {
        retry_with_backoff(self.max_retries, self.backoff_base_ms, cancel, || async move {
            self.limiter
                .acquire_blocking(
                    &tier.service,
                    grant.map(|g| g.credential_id.as_str()),
                    &tier.rate,
                    tier.request_weight,
                    self.rate_acquire_timeout,
                )
                .await?;
            adapter
                .poll(PollRequest {
                    terms: &job.terms,
                    window_start,
                    window_end,
                    cursor,
                    tier,
                    credential: grant,
                })
                .await
        })
        .await
    }

    async fn process_page(
        &self,
        arena: &ArenaConfig,
        records: Vec<agora_core::RawRecord>,
        report: &mut JobReport,
    ) {
        use std::sync::atomic::Ordering;

        for raw in records {
            report.records_seen += 1;
            match normalize(&raw, arena) {
                Ok(record) => match self.dedup.admit(&record, arena.dedup_scope) {
                    Admission::Admitted => {
                        if let Err(e) = self.sink.store(record).await {
                            tracing::error!(arena = %arena.id, error = %e, "sink write failed");
                            continue;
                        }
                        report.records_admitted += 1;
                        self.metrics.records_admitted.fetch_add(1, Ordering::Relaxed);
                    }
                    Admission::Duplicate => {
                        report.duplicates += 1;
                        self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                    }
                },
                Err(e) => {
                    // One bad record never fails the batch.
                    report.malformed += 1;
                    self.metrics.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(arena = %arena.id, error = %e, "dropping malformed record");
                }
            }
        }
    }
}
