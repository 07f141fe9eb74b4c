//! Short-circuit cache stores.
//!
//! A cache store sits in front of the metadata store: a fresh entry for a
//! request hash is served without touching the database or the adapter.
//! Entries are disposable; the metadata store stays the record of what was
//! fetched.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use dataio_core::Error;

/// Ephemeral key-value cache keyed by request hash.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Bytes stored under `key` if present and no older than `ttl`.
    ///
    /// `None` for `ttl` leaves freshness to the implementation.
    async fn get(&self, key: &str, ttl: Option<Duration>) -> Result<Option<Bytes>, Error>;

    /// Store `data` under `key` and return where it lives.
    async fn put(&self, key: &str, data: &[u8]) -> Result<PathBuf, Error>;
}

fn validate_key(key: &str) -> Result<(), Error> {
    let safe = !key.is_empty()
        && !key.starts_with('.')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if safe { Ok(()) } else { Err(Error::InvalidInput(format!("unsafe cache key: {key:?}"))) }
}

/// File-backed cache at `<dir>/<key>.bin`, aged by file mtime.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
    default_ttl: Option<Duration>,
}

impl FileCacheStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, default_ttl: None })
    }

    /// TTL applied when a lookup does not pass one.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, Error> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.bin")))
    }
}

#[async_trait::async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str, ttl: Option<Duration>) -> Result<Option<Bytes>, Error> {
        let path = self.path_for(key)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Some(ttl) = ttl.or(self.default_ttl) {
            let age = SystemTime::now()
                .duration_since(meta.modified()?)
                .unwrap_or(Duration::ZERO);
            if age > ttl {
                debug!(key, age_ms = age.as_millis() as u64, "file cache entry expired");
                return Ok(None);
            }
        }

        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            // evicted between stat and read
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<PathBuf, Error> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, data).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                warn!(path = %tmp.display(), error = %cleanup, "failed to remove temp file");
            }
            return Err(e.into());
        }
        Ok(path)
    }
}

struct MemoryEntry {
    data: Bytes,
    stored_at: Instant,
}

impl MemoryEntry {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.stored_at.elapsed() > ttl)
    }
}

/// In-process cache. Paths it hands out are synthetic `memory://<key>` names.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    default_ttl: Option<Duration>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop entries older than the default TTL.
    pub async fn cleanup_expired(&self) {
        let ttl = self.default_ttl;
        self.entries.write().await.retain(|_, entry| !entry.is_expired(ttl));
    }
}

impl fmt::Debug for MemoryCacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCacheStore")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str, ttl: Option<Duration>) -> Result<Option<Bytes>, Error> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(ttl.or(self.default_ttl)))
            .map(|entry| entry.data.clone()))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<PathBuf, Error> {
        validate_key(key)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), MemoryEntry { data: Bytes::copy_from_slice(data), stored_at: Instant::now() });
        Ok(PathBuf::from(format!("memory://{key}")))
    }
}
