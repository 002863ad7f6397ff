//! Device sync configuration.

use crate::platform;
use crate::sync::{BackoffPolicy, SyncSettings};
use crate::{FieldSignError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSignConfig {
    pub server_url: String,
    pub queue_path: PathBuf,
    pub enrollment_path: PathBuf,
    pub batch_max_count: usize,
    pub batch_max_bytes: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter_ms: u64,
    pub max_attempts: u32,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Quota on stored ciphertext; unset means only the disk limits it
    pub max_queue_bytes: Option<u64>,
}

impl Default for FieldSignConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            queue_path: platform::get_default_queue_path(),
            enrollment_path: platform::get_default_enrollment_path(),
            batch_max_count: 25,
            batch_max_bytes: 512 * 1024,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 15 * 60 * 1_000,
            backoff_jitter_ms: 1_000,
            max_attempts: 20,
            poll_interval_secs: 30,
            request_timeout_secs: 30,
            max_queue_bytes: None,
        }
    }
}

impl FieldSignConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| FieldSignError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(FieldSignError::Config("server_url is empty".to_string()));
        }
        if self.batch_max_count == 0 || self.batch_max_bytes == 0 {
            return Err(FieldSignError::Config(
                "batch limits must be positive".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            return Err(FieldSignError::Config(
                "backoff_base_ms must be positive and not above backoff_cap_ms".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(FieldSignError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(FieldSignError::Config(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            max_jitter: Duration::from_millis(self.backoff_jitter_ms),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            batch_max_count: self.batch_max_count,
            batch_max_bytes: self.batch_max_bytes,
            backoff: self.backoff_policy(),
            max_attempts: self.max_attempts,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        assert!(FieldSignConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = FieldSignConfig::from_toml(
            r#"
            server_url = "https://sign.example.cl"
            batch_max_count = 5
            max_queue_bytes = 1048576
            "#,
        )
        .unwrap();

        assert_eq!(config.server_url, "https://sign.example.cl");
        assert_eq!(config.batch_max_count, 5);
        assert_eq!(config.max_queue_bytes, Some(1_048_576));
        assert_eq!(config.max_attempts, 20);

        let settings = config.sync_settings();
        assert_eq!(settings.batch_max_count, 5);
        assert_eq!(settings.backoff.base, Duration::from_secs(2));
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(FieldSignConfig::from_toml("batch_max_count = 0").is_err());
        assert!(FieldSignConfig::from_toml("backoff_base_ms = 5000\nbackoff_cap_ms = 10").is_err());
        assert!(FieldSignConfig::from_toml("max_attempts = \"many\"").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_secs = 5").unwrap();

        let config = FieldSignConfig::load(file.path()).unwrap();
        assert_eq!(config.poll_interval_secs, 5);

        let missing = file.path().with_extension("missing");
        assert_eq!(
            FieldSignConfig::load_or_default(&missing).unwrap().poll_interval_secs,
            30
        );
    }
}
