//! Storage and messaging providers.
//!
//! Vendor clients sit behind `StorageProvider`; the engine only needs block
//! uploads and a connectivity probe. `LocalDirectoryProvider` is the one
//! built-in target (a local disk or mounted NAS).

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::config::{FailureClass, FailureClassification, StorageProviderConfig};
use crate::error::{ConfigError, ProviderError};
use crate::model::StorageProviderType;

/// A backup destination.
pub trait StorageProvider: Send + Sync {
    fn provider_type(&self) -> StorageProviderType;

    /// Store one block of a file. Blocks arrive in index order.
    fn upload_block(&self, file_id: Uuid, block_index: i64, data: &[u8])
        -> Result<(), ProviderError>;

    fn check_connectivity(&self) -> Result<(), ProviderError>;
}

/// Outbound notifications (email, chat, ...).
pub trait MessagingProvider: Send + Sync {
    fn send_message(&self, subject: &str, body: &str) -> Result<(), ProviderError>;
}

/// Result of one block upload after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    /// Try again later; progress is left as is
    Retriable(ProviderError),
    /// Give up on this provider for this file
    Terminal(ProviderError),
}

/// Maps provider error codes to retriable or terminal outcomes.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    retriable: HashSet<String>,
    terminal: HashSet<String>,
    default: FailureClass,
}

impl FailureClassifier {
    pub fn from_config(config: &FailureClassification) -> Self {
        FailureClassifier {
            retriable: config.retriable_codes.iter().cloned().collect(),
            terminal: config.terminal_codes.iter().cloned().collect(),
            default: config.default,
        }
    }

    /// Terminal codes win when a code appears in both lists.
    pub fn classify(&self, error: &ProviderError) -> FailureClass {
        if self.terminal.contains(&error.code) {
            FailureClass::Terminal
        } else if self.retriable.contains(&error.code) {
            FailureClass::Retriable
        } else {
            self.default
        }
    }

    pub fn outcome(&self, result: Result<(), ProviderError>) -> UploadOutcome {
        match result {
            Ok(()) => UploadOutcome::Success,
            Err(e) => match self.classify(&e) {
                FailureClass::Retriable => UploadOutcome::Retriable(e),
                FailureClass::Terminal => UploadOutcome::Terminal(e),
            },
        }
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        FailureClassifier::from_config(&FailureClassification::default())
    }
}

/// Writes blocks to `<root>/<file_id>/<index>.blk`.
#[derive(Debug, Clone)]
pub struct LocalDirectoryProvider {
    root: PathBuf,
}

impl LocalDirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDirectoryProvider { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_path(&self, file_id: Uuid, block_index: i64) -> PathBuf {
        self.root
            .join(file_id.to_string())
            .join(format!("{}.blk", block_index))
    }
}

impl StorageProvider for LocalDirectoryProvider {
    fn provider_type(&self) -> StorageProviderType {
        StorageProviderType::LocalDirectory
    }

    fn upload_block(
        &self,
        file_id: Uuid,
        block_index: i64,
        data: &[u8],
    ) -> Result<(), ProviderError> {
        let target = self.block_path(file_id, block_index);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| ProviderError::from_io(&e))?;
        }

        // Partial writes only ever exist under the .tmp name
        let tmp = target.with_extension("blk.tmp");
        fs::write(&tmp, data).map_err(|e| ProviderError::from_io(&e))?;
        fs::rename(&tmp, &target).map_err(|e| ProviderError::from_io(&e))?;
        Ok(())
    }

    fn check_connectivity(&self) -> Result<(), ProviderError> {
        fs::read_dir(&self.root)
            .map(|_| ())
            .map_err(|e| ProviderError::from_io(&e))
    }
}

/// Messaging provider that writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LogMessagingProvider;

impl MessagingProvider for LogMessagingProvider {
    fn send_message(&self, subject: &str, body: &str) -> Result<(), ProviderError> {
        warn!(subject, body, "notification");
        Ok(())
    }
}

/// Registered storage providers, keyed by type.
#[derive(Clone, Default)]
pub struct StorageProviderConnections {
    providers: BTreeMap<StorageProviderType, Arc<dyn StorageProvider>>,
}

impl StorageProviderConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build connections for configured providers.
    ///
    /// Only `local_directory` has a built-in client; other types must be
    /// registered with `insert`.
    pub fn from_config(configs: &[StorageProviderConfig]) -> Result<Self, ConfigError> {
        let mut connections = StorageProviderConnections::new();
        for config in configs {
            match (config.provider_type, &config.root) {
                (StorageProviderType::LocalDirectory, Some(root)) => {
                    connections.insert(Arc::new(LocalDirectoryProvider::new(root.clone())));
                }
                (StorageProviderType::LocalDirectory, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "storage provider '{}' needs a root directory",
                        config.name
                    )));
                }
                (other, _) => {
                    return Err(ConfigError::Invalid(format!(
                        "no built-in client for provider type '{}' ('{}')",
                        other, config.name
                    )));
                }
            }
        }
        Ok(connections)
    }

    /// Register a provider, replacing any existing one of the same type.
    pub fn insert(&mut self, provider: Arc<dyn StorageProvider>) {
        self.providers.insert(provider.provider_type(), provider);
    }

    pub fn get(&self, provider_type: StorageProviderType) -> Option<&Arc<dyn StorageProvider>> {
        self.providers.get(&provider_type)
    }

    pub fn types(&self) -> Vec<StorageProviderType> {
        self.providers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StorageProviderType, &Arc<dyn StorageProvider>)> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
