//! Quota-tracked credential pool shared across arenas.
//!
//! The pool is the sole owner of credential state: callers receive a
//! [`CredentialGrant`] (a snapshot of the secret fields for one upstream
//! call) and report consumption back through [`CredentialPool::report_usage`].
//! Acquisition and the usage increment are deliberately separate calls —
//! they bracket a network request — so the increment itself is atomic with
//! respect to concurrent reporters, and the §8 property "used never
//! exceeds quota when usage is reported correctly" holds per increment.
//!
//! Quota counters reset on boundaries supplied by an external clock
//! collaborator via [`CredentialPool::reset_daily`] /
//! [`CredentialPool::reset_monthly`]; the pool holds no timer of its own.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::QuotaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Active,
    /// A quota counter crossed its limit; cleared by the next reset
    /// boundary with headroom.
    Exhausted,
    /// Upstream rejected the credential (auth failure); cleared only by
    /// [`CredentialPool::restore`].
    Invalid,
}

/// One reusable set of secrets for a platform, subject to quota.
#[derive(Clone)]
pub struct Credential {
    pub id: String,
    pub platform: String,
    pub scopes: Vec<String>,
    /// Opaque secret material (API key, OAuth tokens).
    pub fields: HashMap<String, String>,
    /// `None` means unlimited.
    pub daily_quota: Option<u64>,
    pub monthly_quota: Option<u64>,
    pub used_today: u64,
    pub used_this_month: u64,
    pub last_daily_reset: Option<DateTime<Utc>>,
    pub last_monthly_reset: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
}

impl Credential {
    #[must_use]
    pub fn new(id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
            scopes: Vec::new(),
            fields: HashMap::new(),
            daily_quota: None,
            monthly_quota: None,
            used_today: 0,
            used_this_month: 0,
            last_daily_reset: None,
            last_monthly_reset: None,
            status: CredentialStatus::Active,
        }
    }

    #[must_use]
    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_daily_quota(mut self, quota: u64) -> Self {
        self.daily_quota = Some(quota);
        self
    }

    #[must_use]
    pub fn with_monthly_quota(mut self, quota: u64) -> Self {
        self.monthly_quota = Some(quota);
        self
    }

    fn satisfies_scopes(&self, required: &[&str]) -> bool {
        required
            .iter()
            .all(|r| self.scopes.iter().any(|s| s.as_str() == *r))
    }

    fn has_headroom(&self) -> bool {
        let daily_ok = self.daily_quota.is_none_or(|q| self.used_today < q);
        let monthly_ok = self.monthly_quota.is_none_or(|q| self.used_this_month < q);
        daily_ok && monthly_ok
    }

    /// Worst-case fraction of either quota already consumed; used to
    /// balance load across accounts.
    #[allow(clippy::cast_precision_loss)]
    fn consumption_fraction(&self) -> f64 {
        let frac = |used: u64, quota: Option<u64>| match quota {
            Some(q) if q > 0 => used as f64 / q as f64,
            _ => 0.0,
        };
        frac(self.used_today, self.daily_quota).max(frac(self.used_this_month, self.monthly_quota))
    }
}

// Secret fields are never printed.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("scopes", &self.scopes)
            .field("fields", &"[redacted]")
            .field("daily_quota", &self.daily_quota)
            .field("monthly_quota", &self.monthly_quota)
            .field("used_today", &self.used_today)
            .field("used_this_month", &self.used_this_month)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Snapshot handed to a collector for the duration of one upstream call.
#[derive(Clone)]
pub struct CredentialGrant {
    pub credential_id: String,
    pub platform: String,
    pub fields: HashMap<String, String>,
}

impl std::fmt::Debug for CredentialGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGrant")
            .field("credential_id", &self.credential_id)
            .field("platform", &self.platform)
            .field("fields", &"[redacted]")
            .finish()
    }
}

/// Named credential sets with per-credential quota tracking, shared by
/// every arena that targets the same upstream platform.
pub struct CredentialPool {
    inner: Mutex<HashMap<String, Credential>>,
}

impl CredentialPool {
    #[must_use]
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let map = credentials
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        Self {
            inner: Mutex::new(map),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Credential>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Selects a usable credential for `platform` satisfying
    /// `required_scopes`, preferring the least-consumed one.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::NoCredentialAvailable`] when no active
    /// credential with quota headroom matches.
    pub fn acquire(
        &self,
        platform: &str,
        required_scopes: &[&str],
    ) -> Result<CredentialGrant, QuotaError> {
        let guard = self.lock();
        let best = guard
            .values()
            .filter(|c| {
                c.platform == platform
                    && c.status == CredentialStatus::Active
                    && c.has_headroom()
                    && c.satisfies_scopes(required_scopes)
            })
            .min_by(|a, b| {
                a.consumption_fraction()
                    .total_cmp(&b.consumption_fraction())
            });

        match best {
            Some(c) => Ok(CredentialGrant {
                credential_id: c.id.clone(),
                platform: c.platform.clone(),
                fields: c.fields.clone(),
            }),
            None => Err(QuotaError::NoCredentialAvailable {
                platform: platform.to_owned(),
            }),
        }
    }

    /// `true` when [`CredentialPool::acquire`] would currently succeed.
    #[must_use]
    pub fn has_available(&self, platform: &str) -> bool {
        self.peek_available(platform).is_some()
    }

    /// Id of the credential [`CredentialPool::acquire`] would currently
    /// select, without acquiring it. Used by tier selection to probe the
    /// right rate bucket.
    #[must_use]
    pub fn peek_available(&self, platform: &str) -> Option<String> {
        let guard = self.lock();
        guard
            .values()
            .filter(|c| {
                c.platform == platform
                    && c.status == CredentialStatus::Active
                    && c.has_headroom()
            })
            .min_by(|a, b| {
                a.consumption_fraction()
                    .total_cmp(&b.consumption_fraction())
            })
            .map(|c| c.id.clone())
    }

    /// Records `units` of quota consumption after a successful upstream
    /// call. Crossing a quota marks the credential `Exhausted` until the
    /// next reset boundary.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::UnknownCredential`] for an id the pool does
    /// not own.
    pub fn report_usage(&self, credential_id: &str, units: u64) -> Result<(), QuotaError> {
        let mut guard = self.lock();
        let cred = guard
            .get_mut(credential_id)
            .ok_or_else(|| QuotaError::UnknownCredential(credential_id.to_owned()))?;

        cred.used_today = cred.used_today.saturating_add(units);
        cred.used_this_month = cred.used_this_month.saturating_add(units);

        let daily_hit = cred.daily_quota.is_some_and(|q| cred.used_today >= q);
        let monthly_hit = cred
            .monthly_quota
            .is_some_and(|q| cred.used_this_month >= q);

        if (daily_hit || monthly_hit) && cred.status == CredentialStatus::Active {
            cred.status = CredentialStatus::Exhausted;
            tracing::warn!(
                credential = %cred.id,
                platform = %cred.platform,
                used_today = cred.used_today,
                used_this_month = cred.used_this_month,
                "credential quota reached — marking exhausted"
            );
        }
        Ok(())
    }

    /// Marks a credential `Invalid` (e.g. after an upstream auth
    /// failure). Excluded from `acquire` until [`CredentialPool::restore`].
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::UnknownCredential`] for an id the pool does
    /// not own.
    pub fn invalidate(&self, credential_id: &str, reason: &str) -> Result<(), QuotaError> {
        let mut guard = self.lock();
        let cred = guard
            .get_mut(credential_id)
            .ok_or_else(|| QuotaError::UnknownCredential(credential_id.to_owned()))?;
        cred.status = CredentialStatus::Invalid;
        tracing::error!(
            credential = %cred.id,
            platform = %cred.platform,
            reason,
            "credential invalidated"
        );
        Ok(())
    }

    /// Manually returns an `Invalid` credential to service.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::UnknownCredential`] for an id the pool does
    /// not own.
    pub fn restore(&self, credential_id: &str) -> Result<(), QuotaError> {
        let mut guard = self.lock();
        let cred = guard
            .get_mut(credential_id)
            .ok_or_else(|| QuotaError::UnknownCredential(credential_id.to_owned()))?;
        cred.status = if cred.has_headroom() {
            CredentialStatus::Active
        } else {
            CredentialStatus::Exhausted
        };
        tracing::info!(credential = %cred.id, status = ?cred.status, "credential restored");
        Ok(())
    }

    /// Daily reset boundary, driven by an external clock collaborator.
    /// Zeroes `used_today` on every credential and reactivates exhausted
    /// ones that regained headroom.
    pub fn reset_daily(&self, now: DateTime<Utc>) {
        let mut guard = self.lock();
        for cred in guard.values_mut() {
            cred.used_today = 0;
            cred.last_daily_reset = Some(now);
            if cred.status == CredentialStatus::Exhausted && cred.has_headroom() {
                cred.status = CredentialStatus::Active;
            }
        }
    }

    /// Monthly reset boundary; also zeroes daily counters (a month
    /// boundary is a day boundary).
    pub fn reset_monthly(&self, now: DateTime<Utc>) {
        let mut guard = self.lock();
        for cred in guard.values_mut() {
            cred.used_today = 0;
            cred.used_this_month = 0;
            cred.last_daily_reset = Some(now);
            cred.last_monthly_reset = Some(now);
            if cred.status == CredentialStatus::Exhausted {
                cred.status = CredentialStatus::Active;
            }
        }
    }

    /// Status snapshot for one credential, for operator reporting.
    #[must_use]
    pub fn status_of(&self, credential_id: &str) -> Option<CredentialStatus> {
        self.lock().get(credential_id).map(|c| c.status)
    }

    /// (`used_today`, `used_this_month`) for one credential.
    #[must_use]
    pub fn usage_of(&self, credential_id: &str) -> Option<(u64, u64)> {
        self.lock()
            .get(credential_id)
            .map(|c| (c.used_today, c.used_this_month))
    }
}
