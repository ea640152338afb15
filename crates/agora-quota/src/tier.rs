//! Tier selection: cheapest usable access mode first, falling back down
//! the arena's configured order.

use std::collections::HashSet;
use std::sync::Arc;

use agora_core::{ArenaConfig, TierSpec};

use crate::credentials::CredentialPool;
use crate::error::QuotaError;
use crate::ratelimit::RateLimiter;

/// Orders an arena's tiers and returns the best currently-usable one.
///
/// A tier is usable when its credential platform (if any) has an
/// available credential in the pool and the rate limiter would admit a
/// call right now. Callers that hit an upstream failure re-select with
/// the failed tier in `exclude` for the remainder of that job.
pub struct TierSelector {
    pool: Arc<CredentialPool>,
    limiter: Arc<RateLimiter>,
}

impl TierSelector {
    #[must_use]
    pub fn new(pool: Arc<CredentialPool>, limiter: Arc<RateLimiter>) -> Self {
        Self { pool, limiter }
    }

    /// Picks the first tier in configured priority order that has a
    /// credential (when required) and passes the rate-limit probe.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::AllTiersUnavailable`] when every tier is
    /// excluded, credential-starved, or rate-limited.
    pub fn select<'a>(
        &self,
        arena: &'a ArenaConfig,
        exclude: &HashSet<String>,
    ) -> Result<&'a TierSpec, QuotaError> {
        for tier in &arena.tiers {
            if exclude.contains(&tier.name) {
                continue;
            }

            let credential = match &tier.credential_platform {
                Some(platform) => match self.pool.peek_available(platform) {
                    Some(id) => Some(id),
                    None => {
                        tracing::debug!(
                            arena = %arena.id,
                            tier = %tier.name,
                            platform = %platform,
                            "tier skipped: no credential available"
                        );
                        continue;
                    }
                },
                None => None,
            };

            if self
                .limiter
                .allow(&tier.service, credential.as_deref(), &tier.rate)
            {
                return Ok(tier);
            }
            tracing::debug!(
                arena = %arena.id,
                tier = %tier.name,
                service = %tier.service,
                "tier skipped: rate limited"
            );
        }

        Err(QuotaError::AllTiersUnavailable {
            arena: arena.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agora_core::{
        CollectionMode, ContentKind, CostModel, PaginationPolicy, RateSpec,
    };

    use crate::credentials::Credential;

    fn tier(name: &str, credential_platform: Option<&str>) -> TierSpec {
        TierSpec {
            name: name.to_owned(),
            service: format!("svc-{name}"),
            cost: CostModel::Free,
            credential_platform: credential_platform.map(str::to_owned),
            rate: RateSpec {
                requests: 10,
                per_seconds: 1,
            },
            request_weight: 1,
        }
    }

    fn arena(tiers: Vec<TierSpec>) -> ArenaConfig {
        ArenaConfig {
            id: "news".to_owned(),
            platform: "gdelt".to_owned(),
            mode: CollectionMode::Batch,
            content_kind: ContentKind::Article,
            tiers,
            pagination: Some(PaginationPolicy::Cursor { max_pages: 10 }),
            stream: None,
            dedup_scope: agora_core::DedupScope::default(),
            mappings: agora_core::FieldMappings::default(),
        }
    }

    fn selector(creds: Vec<Credential>) -> TierSelector {
        TierSelector::new(
            Arc::new(CredentialPool::new(creds)),
            Arc::new(RateLimiter::new()),
        )
    }

    #[tokio::test]
    async fn selects_first_tier_when_usable() {
        let sel = selector(vec![]);
        let a = arena(vec![tier("free", None), tier("premium", Some("gcp"))]);
        let chosen = sel.select(&a, &HashSet::new()).unwrap();
        assert_eq!(chosen.name, "free");
    }

    #[tokio::test]
    async fn falls_back_when_first_tier_has_no_credential() {
        // free tier requires a credential platform with no credentials
        // loaded; medium is unauthenticated and must win.
        let sel = selector(vec![]);
        let a = arena(vec![tier("free", Some("gcp")), tier("medium", None)]);
        let chosen = sel.select(&a, &HashSet::new()).unwrap();
        assert_eq!(chosen.name, "medium");
    }

    #[tokio::test]
    async fn all_tiers_unavailable_when_credentials_missing() {
        let sel = selector(vec![]);
        let a = arena(vec![tier("free", Some("gcp")), tier("premium", Some("gcp"))]);
        let err = sel.select(&a, &HashSet::new()).unwrap_err();
        assert!(matches!(err, QuotaError::AllTiersUnavailable { ref arena } if arena == "news"));
    }

    #[tokio::test]
    async fn excluded_tiers_are_skipped_for_the_rest_of_the_job() {
        let sel = selector(vec![Credential::new("k", "gcp")]);
        let a = arena(vec![tier("free", None), tier("premium", Some("gcp"))]);
        let mut exclude = HashSet::new();
        exclude.insert("free".to_owned());
        let chosen = sel.select(&a, &exclude).unwrap();
        assert_eq!(chosen.name, "premium");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_tier_is_skipped() {
        let sel = selector(vec![]);
        let mut first = tier("free", None);
        first.rate = RateSpec {
            requests: 1,
            per_seconds: 3600,
        };
        let a = arena(vec![first.clone(), tier("medium", None)]);
        // Drain the free tier's single token.
        assert!(sel
            .limiter
            .try_acquire(&first.service, None, &first.rate, 1));
        let chosen = sel.select(&a, &HashSet::new()).unwrap();
        assert_eq!(chosen.name, "medium");
    }
}
