//! Store configuration with layered loading.
//!
//! Uses figment to layer configuration sources:
//!
//! 1. Environment variables (DATAIO_*, `__` separates nested keys)
//! 2. TOML config file (if DATAIO_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::policy::{CacheMode, CachePolicy};

mod validation;

pub use validation::ConfigError;

const ENV_PREFIX: &str = "DATAIO_";
const CONFIG_FILE_VAR: &str = "DATAIO_CONFIG_FILE";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataIoConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub cache: CacheDefaults,
}

/// Where the database and payloads live.
///
/// `db_path` and `responses_dir` default to locations under `root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Set via DATAIO_PATHS__ROOT.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Set via DATAIO_PATHS__DB_PATH.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Set via DATAIO_PATHS__RESPONSES_DIR.
    #[serde(default)]
    pub responses_dir: Option<PathBuf>,
}

/// Cache policy applied when a session does not choose one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheDefaults {
    /// Set via DATAIO_CACHE__MODE.
    #[serde(default)]
    pub mode: CacheMode,

    /// Freshness window in seconds; unset means no expiry.
    ///
    /// Set via DATAIO_CACHE__TTL_SECONDS.
    #[serde(default)]
    pub ttl_seconds: Option<f64>,
}

fn default_root() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self { root: default_root(), db_path: None, responses_dir: None }
    }
}

impl PathsConfig {
    /// Paths with every location derived from `root`.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf(), db_path: None, responses_dir: None }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| self.root.join("dataio.sqlite"))
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.responses_dir.clone().unwrap_or_else(|| self.root.join("responses"))
    }
}

impl CacheDefaults {
    /// TTL as a `Duration`; `None` when unset or not representable.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_seconds.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn policy(&self) -> CachePolicy {
        CachePolicy::new(self.mode, self.ttl())
    }
}

impl DataIoConfig {
    /// Configuration with all paths under `root` and default cache settings.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        Self { paths: PathsConfig::rooted_at(root), ..Default::default() }
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `DATAIO_`
    /// 2. TOML file from `DATAIO_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file or environment cannot be parsed, or
    /// validation fails after loading.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// The layered sources, before extraction.
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var(CONFIG_FILE_VAR) {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment.merge(
            Env::prefixed(ENV_PREFIX)
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        )
    }

    /// Extract and validate from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
