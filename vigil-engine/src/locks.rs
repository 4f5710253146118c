//! Per-symbol mutual exclusion.
//!
//! Every placement, cancellation and protective replacement for one
//! `(profile, symbol)` is serialized through the same async mutex; the
//! Reconciler takes the identical lock before mutating a position. Distinct
//! symbols proceed concurrently.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use vigil_core::ProfileId;

type Key = (ProfileId, String);

/// Lazily populated map of symbol guards.
#[derive(Default)]
pub struct SymbolLocks {
    inner: Mutex<HashMap<Key, Arc<AsyncMutex<()>>>>,
}

impl SymbolLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The guard for `(profile, symbol)`, creating it on first use.
    #[must_use]
    pub fn guard(&self, profile_id: ProfileId, symbol: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().expect("symbol lock map poisoned");
        map.entry((profile_id, symbol.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_symbol_shares_one_mutex() {
        let locks = SymbolLocks::new();
        let a = locks.guard(1, "BTCUSDT");
        let b = locks.guard(1, "BTCUSDT");
        assert!(Arc::ptr_eq(&a, &b));

        let other_profile = locks.guard(2, "BTCUSDT");
        assert!(!Arc::ptr_eq(&a, &other_profile));
        let other_symbol = locks.guard(1, "ETHUSDT");
        assert!(!Arc::ptr_eq(&a, &other_symbol));
    }

    #[tokio::test]
    async fn guard_serializes_critical_sections() {
        let locks = Arc::new(SymbolLocks::new());
        let guard = locks.guard(1, "BTCUSDT");
        let held = guard.lock().await;
        let contender = locks.guard(1, "BTCUSDT");
        assert!(contender.try_lock().is_err());
        drop(held);
        assert!(contender.try_lock().is_ok());
    }
}
