//! Configuration validation rules.

use std::time::Duration;

use crate::config::DataIoConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

impl DataIoConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `paths.root` is empty
    /// - `cache.ttl_seconds` is negative, not finite, or too large for a `Duration`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid { field: "paths.root".into(), reason: "must not be empty".into() });
        }

        if let Some(ttl) = self.cache.ttl_seconds
            && Duration::try_from_secs_f64(ttl).is_err()
        {
            return Err(ConfigError::Invalid {
                field: "cache.ttl_seconds".into(),
                reason: "must be a non-negative number of seconds that fits a duration".into(),
            });
        }

        if self.cache.ttl_seconds.is_some() && self.cache.mode == crate::policy::CacheMode::OnlyIfCached {
            tracing::warn!("cache.ttl_seconds is ignored when cache.mode is only_if_cached");
        }

        Ok(())
    }
}
