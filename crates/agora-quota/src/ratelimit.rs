//! Token-bucket rate limiting per (service, credential) pair.
//!
//! Buckets are created lazily from tier metadata ([`RateSpec`]) on first
//! use and live only for the process lifetime. Tokens refill continuously
//! at the configured rate up to capacity; a call consumes one token, or a
//! caller-specified weight for per-unit priced services.
//!
//! [`RateLimiter::acquire_blocking`] suspends on `tokio::time::sleep`, so
//! waiting for a token never blocks unrelated work, and tests drive it
//! deterministically under a paused clock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use agora_core::RateSpec;

use crate::error::QuotaError;

// Absorbs float error from refill timing: a caller that slept exactly
// 1/rate must see a full token.
const TOKEN_EPSILON: f64 = 1e-9;

/// Bucket key for calls that carry no credential.
const ANONYMOUS: &str = "-";

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(spec: &RateSpec, now: Instant) -> Self {
        Self {
            capacity: f64::from(spec.requests),
            refill_per_sec: spec.tokens_per_second(),
            tokens: f64::from(spec.requests),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, weight: f64) -> bool {
        if self.tokens + TOKEN_EPSILON >= weight {
            self.tokens = (self.tokens - weight).max(0.0);
            true
        } else {
            false
        }
    }

    /// How long until `weight` tokens will have refilled, assuming no
    /// other consumer takes them first.
    fn time_until(&self, weight: f64) -> Duration {
        let missing = (weight - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.refill_per_sec)
    }
}

/// Enforces a request budget per (service, credential) pair. Shared
/// across arenas; all state lives behind one interior mutex.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<(String, String), TokenBucket>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), TokenBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_bucket<T>(
        &self,
        service: &str,
        credential: Option<&str>,
        spec: &RateSpec,
        f: impl FnOnce(&mut TokenBucket) -> T,
    ) -> T {
        let key = (
            service.to_owned(),
            credential.unwrap_or(ANONYMOUS).to_owned(),
        );
        let now = Instant::now();
        let mut guard = self.lock();
        let bucket = guard
            .entry(key)
            .or_insert_with(|| TokenBucket::new(spec, now));
        bucket.refill(now);
        f(bucket)
    }

    /// `true` when a weight-1 call would currently be admitted. Does not
    /// consume a token — tier selection probes with this before any
    /// tokens are actually spent.
    #[must_use]
    pub fn allow(&self, service: &str, credential: Option<&str>, spec: &RateSpec) -> bool {
        self.with_bucket(service, credential, spec, |b| {
            b.tokens + TOKEN_EPSILON >= 1.0
        })
    }

    /// Consumes `weight` tokens if available right now.
    #[must_use]
    pub fn try_acquire(
        &self,
        service: &str,
        credential: Option<&str>,
        spec: &RateSpec,
        weight: u32,
    ) -> bool {
        self.with_bucket(service, credential, spec, |b| {
            b.try_consume(f64::from(weight))
        })
    }

    /// Suspends until `weight` tokens are available or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::AcquireTimeout`] when the deadline passes
    /// without a successful acquisition.
    pub async fn acquire_blocking(
        &self,
        service: &str,
        credential: Option<&str>,
        spec: &RateSpec,
        weight: u32,
        timeout: Duration,
    ) -> Result<(), QuotaError> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = self.with_bucket(service, credential, spec, |b| {
                if b.try_consume(f64::from(weight)) {
                    None
                } else {
                    Some(b.time_until(f64::from(weight)))
                }
            });

            let Some(wait) = wait else {
                return Ok(());
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(QuotaError::AcquireTimeout {
                    service: service.to_owned(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            let remaining = deadline.saturating_duration_since(now);
            tokio::time::sleep(wait.min(remaining)).await;
        }
    }
}
