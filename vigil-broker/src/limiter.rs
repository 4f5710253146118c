//! Token-bucket request throttling shared by all REST connectors.

use std::num::NonZeroU32;

use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota,
};

/// Thin wrapper over a direct `governor` limiter so connectors do not repeat
/// the three-parameter type.
pub struct RateLimiter {
    inner: governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl RateLimiter {
    /// Build a limiter from an explicit quota.
    #[must_use]
    pub fn direct(quota: Quota) -> Self {
        Self {
            inner: governor::RateLimiter::direct(quota),
        }
    }

    /// Convenience constructor for the common requests-per-second shape.
    /// Falls back to 1 req/s when `per_second` is zero.
    #[must_use]
    pub fn per_second(per_second: u32) -> Self {
        let cells = NonZeroU32::new(per_second.max(1)).expect("non-zero after max");
        Self::direct(Quota::per_second(cells))
    }

    /// Wait until one request slot is available.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_spaces_requests() {
        let limiter = RateLimiter::per_second(1000);
        for _ in 0..5 {
            limiter.acquire().await;
        }
    }
}
