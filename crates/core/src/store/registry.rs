//! One shared [`Store`] per database file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::Store;
use crate::Error;
use crate::config::DataIoConfig;

/// Explicit map from absolute database path to its store.
///
/// The lock is held across construction, so concurrent first access for a
/// path builds exactly one instance.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: Mutex<HashMap<PathBuf, Arc<Store>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the store for `config`, opening it on first use.
    pub async fn get_or_create(&self, config: &DataIoConfig) -> Result<Arc<Store>, Error> {
        let db_path = absolute(&config.paths.db_path())?;
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&db_path) {
            return Ok(Arc::clone(store));
        }

        debug!(db = %db_path.display(), "creating store");
        let store = Arc::new(Store::open_at(&db_path, config.paths.responses_dir()).await?);
        stores.insert(db_path, Arc::clone(&store));
        Ok(store)
    }

    pub async fn len(&self) -> usize {
        self.stores.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.stores.lock().await.is_empty()
    }

    /// Forget every cached store. Handles already given out stay usable.
    pub async fn clear(&self) {
        self.stores.lock().await.clear();
    }
}

fn absolute(path: &Path) -> Result<PathBuf, Error> {
    Ok(std::path::absolute(path)?)
}
