pub mod credentials;
pub mod error;
pub mod ratelimit;
pub mod tier;

pub use credentials::{Credential, CredentialGrant, CredentialPool, CredentialStatus};
pub use error::QuotaError;
pub use ratelimit::RateLimiter;
pub use tier::TierSelector;
