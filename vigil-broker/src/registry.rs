//! Adapter plug-in registry keyed by exchange name.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use vigil_core::Profile;

use crate::{AdapterResult, ExchangeAdapter};

/// Builds adapters for one venue from a profile and venue-specific config.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Registry key, matched case-insensitively against `Profile::exchange`.
    fn name(&self) -> &str;

    /// Construct a ready adapter. `params` carries venue extras from the
    /// config file (rest_url override, category, recv_window, ...).
    async fn build(&self, profile: &Profile, params: &Value)
        -> AdapterResult<Arc<dyn ExchangeAdapter>>;
}

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn AdapterFactory>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn AdapterFactory>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a factory. Later registrations for the same name win, which lets
/// tests shadow a real connector with a double.
pub fn register_adapter_factory(factory: Arc<dyn AdapterFactory>) {
    let name = factory.name().to_lowercase();
    registry()
        .write()
        .expect("adapter registry poisoned")
        .insert(name, factory);
}

/// Look up a factory by exchange name.
#[must_use]
pub fn get_adapter_factory(name: &str) -> Option<Arc<dyn AdapterFactory>> {
    registry()
        .read()
        .expect("adapter registry poisoned")
        .get(&name.to_lowercase())
        .cloned()
}

/// Names currently registered, for startup diagnostics.
#[must_use]
pub fn registered_adapters() -> Vec<String> {
    let mut names: Vec<String> = registry()
        .read()
        .expect("adapter registry poisoned")
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}
