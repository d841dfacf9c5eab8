//! Core data model for backup state.
//!
//! This module defines the persisted records shared by every worker:
//! - BackupFile: one tracked source file and its per-provider copy state
//! - CopyState: transfer progress of one file to one storage provider
//! - Priority, SyncStatus, HydrationStatus, StorageProviderType: enums
//! - BackupProgress, ProviderRecord: aggregate and configuration records
//!
//! Transition rules for `CopyState` live in `state`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::ChecksumValue;
use crate::fs_ops::DiscoveredFile;
use crate::lifecycle::EngineInstance;

/// Backup priority of a source location, inherited by its files.
///
/// Ordering follows dispatch order: `High < Medium < Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" | "med" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!(
                "Invalid priority '{}'. Must be 'high', 'medium', or 'low'",
                other
            )),
        }
    }
}

/// The kind of storage provider a copy is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageProviderType {
    Azure,
    AmazonS3,
    LocalDirectory,
}

impl fmt::Display for StorageProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageProviderType::Azure => write!(f, "azure"),
            StorageProviderType::AmazonS3 => write!(f, "amazon_s3"),
            StorageProviderType::LocalDirectory => write!(f, "local_directory"),
        }
    }
}

impl FromStr for StorageProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "azure" => Ok(StorageProviderType::Azure),
            "amazon_s3" | "s3" => Ok(StorageProviderType::AmazonS3),
            "local_directory" | "local" => Ok(StorageProviderType::LocalDirectory),
            other => Err(format!("Unknown storage provider type '{}'", other)),
        }
    }
}

/// Sync status of one copy, also used for a file's overall state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing sent yet (or reset after a content change)
    Unsynced,
    /// Claimed by a backup engine and partially sent
    InProgress,
    /// Every block acknowledged by the provider
    Synced,
    /// Terminal provider failure; see `CopyState::failure_message`
    Failed,
}

impl SyncStatus {
    /// Returns true if no further transfer work is expected for this copy.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Synced | SyncStatus::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Unsynced => write!(f, "Unsynced"),
            SyncStatus::InProgress => write!(f, "InProgress"),
            SyncStatus::Synced => write!(f, "Synced"),
            SyncStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Retrieval state for providers with cold/archive tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationStatus {
    None,
    Hydrating,
    Hydrated,
}

/// Transfer progress of one backup file to one storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyState {
    pub sync_status: SyncStatus,

    pub hydration_status: HydrationStatus,

    /// Index of the last block the provider acknowledged; -1 when nothing was sent
    pub last_completed_file_block_index: i64,

    /// Diagnostic message recorded with a Failed status
    pub failure_message: Option<String>,
}

impl Default for CopyState {
    fn default() -> Self {
        CopyState {
            sync_status: SyncStatus::Unsynced,
            hydration_status: HydrationStatus::None,
            last_completed_file_block_index: -1,
            failure_message: None,
        }
    }
}

/// One retained historical revision of a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRevision {
    pub revision: u32,
    pub file_size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// A dispatcher claim on a backup file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub instance: EngineInstance,
    pub claimed_at: DateTime<Utc>,
}

/// A single source file tracked by the backup subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    /// Stable identifier, generated once when the file is first seen
    pub file_id: Uuid,

    /// File name without directory
    pub filename: String,

    /// Directory containing the file
    pub directory: PathBuf,

    /// Full source path
    pub full_source_path: PathBuf,

    /// Id of the source location the file was discovered under
    pub source_id: i64,

    pub file_size_bytes: u64,

    pub last_modified: DateTime<Utc>,

    /// Content hash; computed lazily by the backup engine, not during scans
    pub content_hash: Option<ChecksumValue>,

    /// ceil(file_size_bytes / block_size_bytes)
    pub total_file_blocks: i64,

    /// Block size the file is split with. Fixed until the content changes,
    /// so resume positions stay valid when the configured size does not.
    pub block_size_bytes: u64,

    pub priority: Priority,

    pub file_revision_number: u32,

    /// Retained revision history, newest last
    pub revisions: Vec<FileRevision>,

    /// When the scan engine last saw this file
    pub last_checked: DateTime<Utc>,

    /// When the record's content or copy state last changed
    pub last_updated: DateTime<Utc>,

    /// Derived from `copy_state`, persisted for fast querying
    pub overall_state: SyncStatus,

    /// Per-provider transfer progress
    pub copy_state: BTreeMap<StorageProviderType, CopyState>,

    /// Current dispatcher claim, if a backup engine is working on the file
    pub claim: Option<Claim>,
}

impl BackupFile {
    /// Create a record for a newly discovered file, with an unsynced copy
    /// state for every enabled provider.
    pub fn new(
        discovered: &DiscoveredFile,
        source_id: i64,
        priority: Priority,
        block_size: u64,
        providers: &[StorageProviderType],
        now: DateTime<Utc>,
    ) -> Self {
        let path = discovered.path.as_path();
        let file_size_bytes = discovered.file_size_bytes;
        let last_modified = discovered.last_modified;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut file = BackupFile {
            file_id: Uuid::new_v4(),
            filename,
            directory,
            full_source_path: path.to_path_buf(),
            source_id,
            file_size_bytes,
            last_modified,
            content_hash: None,
            total_file_blocks: total_blocks_for(file_size_bytes, block_size),
            block_size_bytes: block_size,
            priority,
            file_revision_number: 1,
            revisions: vec![FileRevision {
                revision: 1,
                file_size_bytes,
                last_modified,
                recorded_at: now,
            }],
            last_checked: now,
            last_updated: now,
            overall_state: SyncStatus::Unsynced,
            copy_state: providers
                .iter()
                .map(|p| (*p, CopyState::default()))
                .collect(),
            claim: None,
        };
        file.recompute_overall_state();
        file
    }

    /// Providers whose copy still needs data.
    pub fn pending_providers(&self) -> Vec<StorageProviderType> {
        self.copy_state
            .iter()
            .filter(|(_, state)| !state.sync_status.is_terminal())
            .map(|(provider, _)| *provider)
            .collect()
    }
}

/// Number of fixed-size blocks needed for a file: ceil(size / block size).
pub fn total_blocks_for(file_size_bytes: u64, block_size: u64) -> i64 {
    if block_size == 0 {
        return 0;
    }
    file_size_bytes.div_ceil(block_size) as i64
}

/// A storage provider enabled for backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub provider_type: StorageProviderType,
    pub name: String,
}

/// Aggregate backup progress across every tracked file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
    pub total_file_count: u64,
    pub total_file_size_bytes: u64,
    pub backed_up_file_count: u64,
    pub backed_up_file_size_bytes: u64,
    pub remaining_file_count: u64,
    pub remaining_file_size_bytes: u64,
    pub failed_file_count: u64,
    pub failed_file_size_bytes: u64,
}

impl BackupProgress {
    /// Backed-up share of all tracked bytes, 0.0 to 100.0.
    pub fn overall_percentage(&self) -> f64 {
        if self.total_file_size_bytes == 0 {
            0.0
        } else {
            self.backed_up_file_size_bytes as f64 / self.total_file_size_bytes as f64 * 100.0
        }
    }
}
