use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Engine-wide settings loaded from the environment. Per-arena settings
/// (tiers, rates, mappings) live in the arenas YAML file instead.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: Environment,
    pub log_level: String,
    pub arenas_path: PathBuf,
    /// Per-request timeout adapters should honour.
    pub request_timeout_secs: u64,
    /// Retries after the first failure for transient errors.
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// How long a batch page waits on the rate limiter before giving up.
    pub rate_acquire_timeout_secs: u64,
    /// Upper bound on concurrently running batch jobs.
    pub max_concurrent_jobs: usize,
}
