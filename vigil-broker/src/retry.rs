//! Bounded exponential backoff for adapter calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::{AdapterError, AdapterResult};

/// Default attempt cap for retryable adapter errors.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(8);

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt cap is reached. Waits `250ms * 2^n` plus jitter between attempts;
/// a `RateLimited` error with a venue-provided `retry_after` overrides the
/// computed delay.
pub async fn with_backoff<T, F, Fut>(label: &str, max_attempts: u32, mut op: F) -> AdapterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AdapterResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = match &err {
                    AdapterError::RateLimited {
                        retry_after: Some(after),
                    } => *after,
                    _ => backoff_delay(attempt),
                };
                warn!(
                    call = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "adapter call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1u32 << (attempt - 1).min(8));
    let capped = exp.min(MAX_DELAY);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", 5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AdapterError::TransientNetwork("flap".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: AdapterResult<()> = with_backoff("test", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::InsufficientFunds("margin".into())) }
        })
        .await;
        assert!(matches!(result, Err(AdapterError::InsufficientFunds(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_is_honored() {
        let calls = AtomicU32::new(0);
        let result: AdapterResult<()> = with_backoff("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::VenueDown("maintenance".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
