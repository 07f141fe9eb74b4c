//! Content-addressed payload storage.
//!
//! Payloads live at `<dir>/<checksum>.bin`, optional sidecar metadata at
//! `<dir>/<checksum>.meta.json`. Both are written to a uniquely named temp
//! file in the same directory first and then published, so readers never
//! observe a partial file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::Error;
use crate::hash::{canonical_json_bytes, checksum, is_checksum};

const PAYLOAD_EXT: &str = "bin";
const METADATA_SUFFIX: &str = ".meta.json";

/// Write-once blob store keyed by SHA-256 of the content.
#[derive(Debug, Clone)]
pub struct PayloadStore {
    dir: PathBuf,
}

impl PayloadStore {
    /// Open a payload store rooted at `dir`, creating it if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        info!(path = %dir.display(), "initialized payload store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the payload for `checksum`, whether or not it exists.
    pub fn path_for(&self, checksum: &str) -> PathBuf {
        self.dir.join(format!("{checksum}.{PAYLOAD_EXT}"))
    }

    /// Location of the sidecar for `checksum`, whether or not it exists.
    pub fn metadata_path_for(&self, checksum: &str) -> PathBuf {
        self.dir.join(format!("{checksum}{METADATA_SUFFIX}"))
    }

    pub async fn exists(&self, checksum: &str) -> Result<bool, Error> {
        validate(checksum)?;
        Ok(fs::try_exists(self.path_for(checksum)).await?)
    }

    /// Store `data`, returning its location. Existing content is not rewritten.
    pub async fn write(&self, data: &[u8]) -> Result<PathBuf, Error> {
        let sum = checksum(data);
        let path = self.path_for(&sum);

        if fs::try_exists(&path).await? {
            debug!(checksum = %sum, "payload already stored");
            return Ok(path);
        }

        let tmp = self.temp_path(&sum);
        fs::write(&tmp, data).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            remove_quietly(&tmp).await;
            return Err(e.into());
        }

        debug!(checksum = %sum, size = data.len(), "stored payload");
        Ok(path)
    }

    /// Read the payload for `checksum`, verifying the bytes on disk.
    pub async fn read(&self, checksum_hex: &str) -> Result<Vec<u8>, Error> {
        validate(checksum_hex)?;
        let data = match fs::read(self.path_for(checksum_hex)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::PayloadNotFound(checksum_hex.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = checksum(&data);
        if actual != checksum_hex {
            warn!(expected = %checksum_hex, actual = %actual, "payload checksum mismatch");
            return Err(Error::ChecksumMismatch { expected: checksum_hex.to_string(), actual });
        }
        Ok(data)
    }

    /// Write sidecar metadata for `checksum`. The first sidecar written wins.
    pub async fn write_metadata(&self, checksum_hex: &str, meta: &Map<String, Value>) -> Result<PathBuf, Error> {
        validate(checksum_hex)?;
        let path = self.metadata_path_for(checksum_hex);
        if fs::try_exists(&path).await? {
            debug!(checksum = %checksum_hex, "sidecar already present");
            return Ok(path);
        }

        let bytes = canonical_json_bytes(&Value::Object(meta.clone()))?;
        let tmp = self.temp_path(checksum_hex);
        fs::write(&tmp, &bytes).await?;

        // hard_link refuses to replace an existing file, which gives first-writer-wins under races.
        let linked = fs::hard_link(&tmp, &path).await;
        remove_quietly(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(checksum = %checksum_hex, "stored sidecar");
                Ok(path)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(path),
            Err(e) => Err(e.into()),
        }
    }

    /// Read sidecar metadata for `checksum`.
    pub async fn read_metadata(&self, checksum_hex: &str) -> Result<Map<String, Value>, Error> {
        validate(checksum_hex)?;
        let text = match fs::read(self.metadata_path_for(checksum_hex)).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::MetadataNotFound(checksum_hex.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&text)?)
    }

    fn temp_path(&self, checksum: &str) -> PathBuf {
        self.dir.join(format!(".{checksum}.{}.tmp", uuid::Uuid::new_v4().simple()))
    }
}

fn validate(checksum: &str) -> Result<(), Error> {
    if is_checksum(checksum) { Ok(()) } else { Err(Error::InvalidChecksum(checksum.to_string())) }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove temp file");
    }
}
