//! Retry with exponential back-off and jitter.
//!
//! [`retry_with_backoff`] wraps a fallible async operation and retries on
//! transient errors only ([`CollectError::is_transient`]). Auth failures,
//! malformed payloads, and quota exhaustion are returned immediately —
//! the batch loop handles those with credential invalidation or tier
//! fallback instead of blind repetition. Cancellation is honoured at
//! every retry boundary.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CollectError;

const MAX_DELAY_MS: u64 = 60_000;

/// Runs `operation` with up to `max_retries` additional attempts on
/// transient errors.
///
/// Back-off schedule with `backoff_base_ms = 1_000`:
///
/// | Attempt | Sleep before next attempt    |
/// |---------|------------------------------|
/// | 1       | 1 000 ms × 2⁰ ± 25 % jitter |
/// | 2       | 1 000 ms × 2¹ ± 25 % jitter |
/// | 3       | 1 000 ms × 2² ± 25 % jitter |
///
/// Delay is capped at 60 s. Non-transient errors are returned
/// immediately. A cancellation during a back-off sleep returns the last
/// error without further attempts.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    max_retries: u32,
    backoff_base_ms: u64,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, CollectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollectError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_transient() || attempt >= max_retries || cancel.is_cancelled() {
                    return Err(err);
                }
                attempt += 1;
                let computed = backoff_base_ms.saturating_mul(1u64 << (attempt - 1).min(10));
                let capped = computed.min(MAX_DELAY_MS);
                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    clippy::cast_precision_loss
                )]
                let delay_ms = (capped as f64 * (rand::random::<f64>() * 0.5 + 0.75)) as u64;
                tracing::warn!(
                    attempt,
                    max_retries,
                    delay_ms,
                    error = %err,
                    "transient collection error — retrying after back-off"
                );
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    () = cancel.cancelled() => return Err(err),
                }
            }
        }
    }
}
