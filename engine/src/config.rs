//! Engine configuration, loaded from TOML.
//!
//! Every field has a default so an empty file (or no file) is a valid
//! configuration. The loaded config is shared immutably with every worker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;
use crate::error::ConfigError;
use crate::model::StorageProviderType;
use crate::source::ScanFrequencies;

/// Main configuration for the backup engines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the JSON database snapshot
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Per-priority scan thresholds
    #[serde(default)]
    pub scan_frequencies: ScanFrequencies,

    /// Size of one transfer block
    #[serde(default = "default_block_size")]
    pub transfer_block_size_bytes: u64,

    /// Pause between scan passes
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Pause when the dispatcher has no work
    #[serde(default = "default_backup_idle_sleep")]
    pub backup_idle_sleep_secs: u64,

    #[serde(default = "default_connection_check_interval")]
    pub connection_check_interval_secs: u64,

    /// Claims older than this may be taken over by another backup engine
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_secs: u64,

    /// Pause after a recoverable error before the next loop iteration
    #[serde(default = "default_error_pause")]
    pub error_pause_secs: u64,

    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: ChecksumAlgorithm,

    /// Number of concurrently running backup engines
    #[serde(default = "default_backup_engine_instances")]
    pub backup_engine_instances: u32,

    #[serde(default)]
    pub failure_classification: FailureClassification,

    /// Storage providers to register with the host
    #[serde(default)]
    pub storage_providers: Vec<StorageProviderConfig>,
}

/// Outcome class for a provider error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Retriable,
    Terminal,
}

/// Mapping of provider error codes to outcome classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureClassification {
    pub retriable_codes: Vec<String>,
    pub terminal_codes: Vec<String>,
    /// Class used for codes in neither list
    pub default: FailureClass,
}

impl Default for FailureClassification {
    fn default() -> Self {
        FailureClassification {
            retriable_codes: ["timed_out", "connection", "throttled", "io"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            terminal_codes: ["permission_denied", "not_found", "quota_exceeded"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default: FailureClass::Retriable,
        }
    }
}

/// One configured storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProviderConfig {
    pub provider_type: StorageProviderType,
    pub name: String,
    /// Target directory for `local_directory` providers
    #[serde(default)]
    pub root: Option<PathBuf>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("driftvault-db.json")
}

fn default_block_size() -> u64 {
    2 * 1024 * 1024
}

fn default_scan_interval() -> u64 {
    60
}

fn default_backup_idle_sleep() -> u64 {
    5
}

fn default_connection_check_interval() -> u64 {
    60
}

fn default_claim_timeout() -> u64 {
    3600
}

fn default_error_pause() -> u64 {
    10
}

fn default_hash_algorithm() -> ChecksumAlgorithm {
    ChecksumAlgorithm::Sha256
}

fn default_backup_engine_instances() -> u32 {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scan_frequencies: ScanFrequencies::default(),
            transfer_block_size_bytes: default_block_size(),
            scan_interval_secs: default_scan_interval(),
            backup_idle_sleep_secs: default_backup_idle_sleep(),
            connection_check_interval_secs: default_connection_check_interval(),
            claim_timeout_secs: default_claim_timeout(),
            error_pause_secs: default_error_pause(),
            hash_algorithm: default_hash_algorithm(),
            backup_engine_instances: default_backup_engine_instances(),
            failure_classification: FailureClassification::default(),
            storage_providers: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_block_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "transfer_block_size_bytes must be greater than zero".to_string(),
            ));
        }
        if self.backup_engine_instances == 0 {
            return Err(ConfigError::Invalid(
                "backup_engine_instances must be at least 1".to_string(),
            ));
        }
        for provider in &self.storage_providers {
            if provider.provider_type == StorageProviderType::LocalDirectory
                && provider.root.is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "storage provider '{}' needs a root directory",
                    provider.name
                )));
            }
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn backup_idle_sleep(&self) -> Duration {
        Duration::from_secs(self.backup_idle_sleep_secs)
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_secs(self.connection_check_interval_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn error_pause(&self) -> Duration {
        Duration::from_secs(self.error_pause_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.transfer_block_size_bytes, 2 * 1024 * 1024);
        assert_eq!(config.hash_algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(config.backup_engine_instances, 2);
        assert_eq!(config.failure_classification.default, FailureClass::Retriable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml("").expect("empty config should parse");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml(
            r#"
            transfer_block_size_bytes = 4096
            hash_algorithm = "blake3"

            [scan_frequencies]
            high_priority_scan_frequency_in_hours = 2

            [failure_classification]
            terminal_codes = ["denied"]
            default = "terminal"

            [[storage_providers]]
            provider_type = "local_directory"
            name = "nas"
            root = "/mnt/nas/backup"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.transfer_block_size_bytes, 4096);
        assert_eq!(config.hash_algorithm, ChecksumAlgorithm::Blake3);
        assert_eq!(config.scan_frequencies.high_priority_scan_frequency_in_hours, 2);
        assert_eq!(config.scan_frequencies.low_priority_scan_frequency_in_hours, 48);
        assert_eq!(config.failure_classification.terminal_codes, vec!["denied"]);
        assert!(!config.failure_classification.retriable_codes.is_empty());
        assert_eq!(config.failure_classification.default, FailureClass::Terminal);
        assert_eq!(config.storage_providers.len(), 1);
        assert_eq!(config.scan_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_toml("transfer_block_size_bytes = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml(
                r#"
                [[storage_providers]]
                provider_type = "local_directory"
                name = "missing-root"
                "#
            ),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("backup_engine_instances = \"two\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = EngineConfig::load(&temp_dir.path().join("driftvault.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
