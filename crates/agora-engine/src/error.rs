use agora_quota::QuotaError;
use thiserror::Error;

/// Errors surfaced by collectors and the streaming supervisor.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Credential/tier/rate-limit layer failure; carries the quota
    /// taxonomy (`NoCredentialAvailable`, `AcquireTimeout`,
    /// `AllTiersUnavailable`).
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Network or TLS failure from an adapter built on `reqwest`.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 5xx or an error page where content was expected. Triggers tier
    /// fallback once in-place retries are exhausted.
    #[error("upstream unavailable: status {status} from {service}")]
    UpstreamUnavailable { service: String, status: u16 },

    /// HTTP 429 from the upstream itself.
    #[error("rate limited by {service} (retry after {retry_after_secs}s)")]
    RateLimited {
        service: String,
        retry_after_secs: u64,
    },

    /// 4xx auth failure. The credential is invalidated and never retried.
    #[error("auth failure: status {status} from {service}")]
    Auth { service: String, status: u16 },

    /// A single record the normalizer cannot parse. The record is
    /// dropped and logged; the batch or stream continues.
    #[error("malformed payload from {context}: {reason}")]
    MalformedPayload { context: String, reason: String },

    /// Streaming transport failure (connection drop, heartbeat timeout).
    /// Never fatal to the supervisor; drives the reconnect path.
    #[error("stream transport error: {0}")]
    Transport(String),

    /// An arena was handed to a collector it is not configured for.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CollectError {
    /// `true` for errors worth retrying in place after a back-off delay.
    ///
    /// **Retriable:** upstream 429/5xx, network-level failures
    /// (timeout, connection reset), transport drops, and local
    /// rate-limiter timeouts.
    ///
    /// **Not retriable:** auth failures (credential must be replaced),
    /// malformed payloads (retrying returns the same bytes), and
    /// credential/tier exhaustion (hard stops).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            CollectError::RateLimited { .. }
            | CollectError::UpstreamUnavailable { .. }
            | CollectError::Transport(_) => true,
            CollectError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            CollectError::Quota(QuotaError::AcquireTimeout { .. }) => true,
            CollectError::Quota(_)
            | CollectError::Auth { .. }
            | CollectError::MalformedPayload { .. }
            | CollectError::Config(_) => false,
        }
    }

    /// `true` when the failing credential should be invalidated and the
    /// tier re-selected with a fresh one.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        match self {
            CollectError::Auth { .. } => true,
            CollectError::Http(e) => e.status().is_some_and(|s| {
                s == reqwest::StatusCode::UNAUTHORIZED || s == reqwest::StatusCode::FORBIDDEN
            }),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_unavailable_is_transient() {
        let err = CollectError::UpstreamUnavailable {
            service: "gdelt-doc".to_owned(),
            status: 503,
        };
        assert!(err.is_transient());
        assert!(!err.is_auth());
    }

    #[test]
    fn auth_is_neither_transient_nor_retriable() {
        let err = CollectError::Auth {
            service: "gdelt-doc".to_owned(),
            status: 401,
        };
        assert!(!err.is_transient());
        assert!(err.is_auth());
    }

    #[test]
    fn malformed_payload_is_permanent() {
        let err = CollectError::MalformedPayload {
            context: "gdelt article".to_owned(),
            reason: "missing id and url".to_owned(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn quota_exhaustion_is_a_hard_stop() {
        let err = CollectError::Quota(QuotaError::NoCredentialAvailable {
            platform: "gcp".to_owned(),
        });
        assert!(!err.is_transient());
    }

    #[test]
    fn rate_acquire_timeout_is_transient() {
        let err = CollectError::Quota(QuotaError::AcquireTimeout {
            service: "gdelt-doc".to_owned(),
            timeout_ms: 60_000,
        });
        assert!(err.is_transient());
    }
}
