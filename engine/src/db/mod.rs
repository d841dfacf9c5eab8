//! Persistence port.
//!
//! Engines only talk to storage through `ClientDatabase`. Every call is
//! serializable on its own; `find_next_file_to_backup` selects and claims in
//! one step so concurrent backup engines never receive the same file.

mod local;

pub use local::LocalDatabase;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::checksums::ChecksumValue;
use crate::error::DatabaseError;
use crate::fs_ops::DiscoveredFile;
use crate::lifecycle::EngineInstance;
use crate::model::{BackupFile, BackupProgress, ProviderRecord, StorageProviderType, SyncStatus};
use crate::source::{SourceLocation, SourceLocations};

pub trait ClientDatabase: Send + Sync {
    fn get_source_locations(&self) -> Result<SourceLocations, DatabaseError>;

    /// Insert or replace a source location. Only `location` itself is
    /// validated; ids across the collection must stay unique.
    fn set_source_location(&self, location: SourceLocation) -> Result<(), DatabaseError>;

    fn remove_source_location(&self, id: i64) -> Result<(), DatabaseError>;

    fn set_source_last_completed_scan(
        &self,
        id: i64,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Record a connectivity probe result for a network source.
    fn set_network_source_state(
        &self,
        id: i64,
        is_connected: bool,
        is_failed: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    fn get_providers(&self) -> Result<Vec<ProviderRecord>, DatabaseError>;

    /// Enable a provider. Re-adding a known provider type replaces its record.
    fn add_provider(&self, provider: ProviderRecord) -> Result<(), DatabaseError>;

    /// Disable a provider. Existing copy states are kept.
    fn remove_provider(&self, provider_type: StorageProviderType) -> Result<(), DatabaseError>;

    fn find_backup_file_by_path(&self, path: &Path) -> Result<Option<BackupFile>, DatabaseError>;

    fn get_backup_file(&self, file_id: Uuid) -> Result<BackupFile, DatabaseError>;

    /// Track a newly discovered file with an unsynced copy for every enabled provider.
    fn add_backup_file(
        &self,
        discovered: &DiscoveredFile,
        source: &SourceLocation,
        block_size: u64,
    ) -> Result<BackupFile, DatabaseError>;

    /// Record changed content: new revision, cleared hash, every copy reset.
    fn reset_backup_file_state(
        &self,
        file_id: Uuid,
        discovered: &DiscoveredFile,
        block_size: u64,
        revision_count: i32,
    ) -> Result<BackupFile, DatabaseError>;

    fn set_backup_file_last_checked(
        &self,
        file_id: Uuid,
        checked_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    fn set_backup_file_hash(&self, file_id: Uuid, hash: ChecksumValue) -> Result<(), DatabaseError>;

    /// Record an acknowledged block. Returns the copy's resulting status.
    /// Record an acknowledged block for `instance`, which must hold the
    /// file's claim. The claim is renewed, so a transfer that keeps making
    /// progress is never taken over.
    fn record_block_completed(
        &self,
        file_id: Uuid,
        instance: EngineInstance,
        provider: StorageProviderType,
        block_index: i64,
    ) -> Result<SyncStatus, DatabaseError>;

    fn set_copy_state_failed(
        &self,
        file_id: Uuid,
        provider: StorageProviderType,
        message: &str,
    ) -> Result<(), DatabaseError>;

    /// Reset every failed copy of a file. Returns how many were reset.
    fn retry_failed_file(&self, file_id: Uuid) -> Result<usize, DatabaseError>;

    /// Select and claim the next file for `instance`. Claims older than
    /// `claim_timeout` no longer protect their file.
    fn find_next_file_to_backup(
        &self,
        instance: EngineInstance,
        claim_timeout: Duration,
    ) -> Result<Option<BackupFile>, DatabaseError>;

    fn release_claim(&self, file_id: Uuid, instance: EngineInstance) -> Result<(), DatabaseError>;

    fn get_backup_progress(&self) -> Result<BackupProgress, DatabaseError>;
}
