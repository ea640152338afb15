pub mod app_config;
pub mod arena;
pub mod config;
pub mod record;

pub use app_config::{AppConfig, Environment};
pub use arena::{
    load_arenas, parse_arenas, ArenaConfig, ArenasFile, CollectionMode, CostModel, DedupScope,
    FieldMappings, PaginationPolicy, RateSpec, StreamSettings, TierSpec,
};
pub use config::{load_app_config, load_app_config_from_env};
pub use record::{ContentKind, ContentRecord, Engagement, RawRecord};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },

    #[error("failed to read arenas file {path}: {source}")]
    ArenasFileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse arenas file: {0}")]
    ArenasFileParse(#[from] serde_yaml::Error),

    #[error("invalid arena configuration: {0}")]
    Validation(String),
}
