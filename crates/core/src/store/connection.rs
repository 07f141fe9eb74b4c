//! Database connection management with pragma configuration.
//!
//! This module handles opening the SQLite database, applying required pragmas
//! for durability and concurrency (WAL mode), running migrations, and
//! attaching the payload directory that belongs to the same store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_rusqlite::{Connection, rusqlite};
use tracing::info;

use super::migrations;
use crate::Error;
use crate::config::DataIoConfig;
use crate::payload::PayloadStore;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle over the metadata database and its payload directory.
///
/// Wraps a tokio-rusqlite Connection that runs database operations on a
/// background thread. Cloning is cheap and clones share the connection.
#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) conn: Connection,
    db_path: Option<PathBuf>,
    payloads: PayloadStore,
}

impl Store {
    /// Open the store described by `config`.
    pub async fn open(config: &DataIoConfig) -> Result<Self, Error> {
        Self::open_at(config.paths.db_path(), config.paths.responses_dir()).await
    }

    /// Open a database at `db_path` with payloads under `responses_dir`.
    ///
    /// Creates missing files and directories, applies pragmas, and runs any
    /// pending migrations.
    pub async fn open_at(db_path: impl AsRef<Path>, responses_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(db_path.clone())
            .await
            .map_err(|e| Error::Database(e.into()))?;

        let store = Self::init(conn, Some(db_path), responses_dir.as_ref()).await?;
        info!(
            db = %store.db_path.as_deref().unwrap_or(Path::new(":memory:")).display(),
            responses = %store.payloads.dir().display(),
            "opened store"
        );
        Ok(store)
    }

    /// Open an in-memory database for testing.
    ///
    /// Payloads still need a real directory.
    pub async fn open_in_memory(responses_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Database(e.into()))?;

        Self::init(conn, None, responses_dir.as_ref()).await
    }

    async fn init(conn: Connection, db_path: Option<PathBuf>, responses_dir: &Path) -> Result<Self, Error> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(())
        })
        .await
        .map_err(Error::Database)?;

        migrations::run(&conn).await?;

        let payloads = PayloadStore::open(responses_dir).await?;
        Ok(Self { conn, db_path, payloads })
    }

    /// Database file, or `None` for in-memory stores.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn responses_dir(&self) -> &Path {
        self.payloads.dir()
    }

    pub fn payloads(&self) -> &PayloadStore {
        &self.payloads
    }

    /// Run `f` inside a single transaction.
    ///
    /// `Ok` commits. `Err` drops the transaction, which rolls back every
    /// write made inside `f`, and the error is returned unchanged.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| -> Result<T, Error> {
                let tx = conn.transaction()?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn write_payload(&self, data: &[u8]) -> Result<PathBuf, Error> {
        self.payloads.write(data).await
    }

    pub async fn read_payload(&self, checksum: &str) -> Result<Vec<u8>, Error> {
        self.payloads.read(checksum).await
    }

    pub async fn write_metadata(&self, checksum: &str, meta: &Map<String, Value>) -> Result<PathBuf, Error> {
        self.payloads.write_metadata(checksum, meta).await
    }

    pub async fn read_metadata(&self, checksum: &str) -> Result<Map<String, Value>, Error> {
        self.payloads.read_metadata(checksum).await
    }
}
