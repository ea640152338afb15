use thiserror::Error;

/// Errors surfaced by the shared credential/rate-limit layer.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// Every credential for the platform is exhausted or invalid.
    #[error("no credential available for platform '{platform}'")]
    NoCredentialAvailable { platform: String },

    /// A credential id was passed that the pool does not own.
    #[error("unknown credential '{0}'")]
    UnknownCredential(String),

    /// `acquire_blocking` waited past its deadline for a token.
    #[error("rate limiter timed out after {timeout_ms}ms waiting on {service}")]
    AcquireTimeout { service: String, timeout_ms: u64 },

    /// No tier in the arena's configured order is currently usable.
    #[error("all tiers unavailable for arena '{arena}'")]
    AllTiersUnavailable { arena: String },
}
