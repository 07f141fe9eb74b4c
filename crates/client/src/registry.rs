//! Name to adapter map.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use dataio_core::Error;

use crate::adapter::Adapter;

/// Adapters available to sessions, keyed by source name.
///
/// Constructed explicitly and passed to sessions. The lock is never held
/// across an await point.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<BTreeMap<String, Arc<dyn Adapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under `name`. Names are unique.
    pub fn register(&self, name: impl Into<String>, adapter: Arc<dyn Adapter>) -> Result<(), Error> {
        let name = name.into();
        let mut adapters = self.adapters.write().unwrap_or_else(PoisonError::into_inner);
        if adapters.contains_key(&name) {
            return Err(Error::AdapterAlreadyRegistered(name));
        }
        tracing::debug!(adapter = %name, capabilities = %adapter.capabilities(), "registered adapter");
        adapters.insert(name, adapter);
        Ok(())
    }

    /// Register `adapter` under its own [`Adapter::source`].
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) -> Result<(), Error> {
        let name = adapter.source().to_string();
        self.register(name, adapter)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Adapter>, Error> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::AdapterNotFound(name.to_string()))
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Adapter>, Error> {
        self.adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| Error::AdapterNotFound(name.to_string()))
    }

    pub fn clear(&self) {
        self.adapters.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Registered names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Human-readable listing, one adapter per line.
    pub fn describe(&self) -> String {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        if adapters.is_empty() {
            return "(no adapters registered)".to_string();
        }
        adapters
            .iter()
            .map(|(name, adapter)| format!("{name}: {} [{}]", adapter.describe(), adapter.capabilities()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").field("adapters", &self.list()).finish()
    }
}
