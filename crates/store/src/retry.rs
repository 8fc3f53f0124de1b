//! Retry policy for transient failures
//!
//! Only `Network` errors retry; everything else — including digest
//! mismatches, which are integrity events — surfaces immediately. Backoff
//! doubles per attempt with jitter so a fleet of workers does not hammer a
//! recovering registry in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use mobundle_core::Result;

/// Retry attempts after the initial call
const MAX_RETRIES: u32 = 3;

/// Base backoff; doubles each attempt (200ms, 400ms, 800ms) plus jitter
const BASE_DELAY_MS: u64 = 200;

/// Run `f`, retrying transient network errors with exponential backoff.
///
/// The closure is called up to `MAX_RETRIES + 1` times.
///
/// # Errors
/// The last network error once retries are exhausted, or the first
/// non-retryable error.
pub async fn with_retry<T, F, Fut>(what: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 0..MAX_RETRIES {
        match f().await {
            Err(e) if e.is_retryable() => {
                let jitter = rand::rng().random_range(0..BASE_DELAY_MS / 2);
                let delay = Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt) + jitter);
                warn!(
                    attempt = attempt + 1,
                    max = MAX_RETRIES,
                    "{what} failed transiently, retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
    f().await
}
