//! Runtime counters for collection health.
//!
//! Lock-free atomics, cheap to bump from any task. One instance is
//! shared per engine (behind `Arc`), not process-global, so tests and
//! multi-engine embeddings stay isolated.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ArenaMetrics {
    pub records_admitted: AtomicU64,
    pub duplicates: AtomicU64,
    pub malformed_dropped: AtomicU64,
    /// Events discarded by the backpressure buffer (drop-oldest).
    pub events_dropped: AtomicU64,
    pub reconnects: AtomicU64,
    /// Reconnects on upstreams without resume support: the
    /// disconnect-to-reconnect gap is irrecoverably lost.
    pub resume_gaps: AtomicU64,
    pub tier_fallbacks: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_partial: AtomicU64,
    pub sessions_failed: AtomicU64,
}

impl ArenaMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_admitted: self.records_admitted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            resume_gaps: self.resume_gaps.load(Ordering::Relaxed),
            tier_fallbacks: self.tier_fallbacks.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_partial: self.jobs_partial.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_admitted: u64,
    pub duplicates: u64,
    pub malformed_dropped: u64,
    pub events_dropped: u64,
    pub reconnects: u64,
    pub resume_gaps: u64,
    pub tier_fallbacks: u64,
    pub jobs_failed: u64,
    pub jobs_partial: u64,
    pub sessions_failed: u64,
}
