//! Mutex-guarded local database with an optional JSON snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::ClientDatabase;
use crate::checksums::ChecksumValue;
use crate::dispatch;
use crate::error::{DatabaseError, SourceLocationError, StateError};
use crate::fs_ops::DiscoveredFile;
use crate::lifecycle::EngineInstance;
use crate::model::{BackupFile, BackupProgress, ProviderRecord, StorageProviderType, SyncStatus};
use crate::source::{SourceLocation, SourceLocations};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DatabaseState {
    sources: SourceLocations,
    providers: Vec<ProviderRecord>,
    files: BTreeMap<Uuid, BackupFile>,
    #[serde(skip)]
    path_index: HashMap<PathBuf, Uuid>,
}

impl DatabaseState {
    fn rebuild_path_index(&mut self) {
        self.path_index = self
            .files
            .values()
            .map(|f| (f.full_source_path.clone(), f.file_id))
            .collect();
    }

    fn file_mut(&mut self, file_id: Uuid) -> Result<&mut BackupFile, DatabaseError> {
        self.files
            .get_mut(&file_id)
            .ok_or(DatabaseError::BackupFileNotFound { file_id })
    }

    fn source_mut(&mut self, id: i64) -> Result<&mut SourceLocation, DatabaseError> {
        self.sources
            .get_mut(id)
            .ok_or(DatabaseError::SourceLocationNotFound { id })
    }
}

/// `ClientDatabase` backed by in-memory state behind one lock.
///
/// When opened on a path, the full state is written to a compact JSON
/// snapshot after every mutation (temp file, then rename) while the lock is
/// still held. Each mutation therefore costs a clone and a serialization of
/// the whole index, including every acknowledged block; this suits a single
/// client's index, not a large shared catalog.
///
/// The snapshot stays authoritative: a mutation whose snapshot write fails
/// is not applied in memory either.
pub struct LocalDatabase {
    state: Mutex<DatabaseState>,
    snapshot_path: Option<PathBuf>,
}

impl LocalDatabase {
    /// A database that lives only as long as this value.
    pub fn in_memory() -> Self {
        LocalDatabase {
            state: Mutex::new(DatabaseState::default()),
            snapshot_path: None,
        }
    }

    /// Open a snapshot-backed database, loading `path` if it exists.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let mut state = if path.exists() {
            let bytes = fs::read(path).map_err(|e| DatabaseError::SnapshotRead {
                path: path.to_path_buf(),
                source: e,
            })?;
            serde_json::from_slice::<DatabaseState>(&bytes).map_err(|e| {
                DatabaseError::SnapshotCorrupt {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?
        } else {
            DatabaseState::default()
        };
        state.rebuild_path_index();

        info!(
            path = %path.display(),
            sources = state.sources.len(),
            files = state.files.len(),
            "opened database"
        );

        Ok(LocalDatabase {
            state: Mutex::new(state),
            snapshot_path: Some(path.to_path_buf()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, DatabaseState>, DatabaseError> {
        self.state.lock().map_err(|_| DatabaseError::Poisoned)
    }

    fn read<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&DatabaseState) -> Result<T, DatabaseError>,
    {
        let guard = self.lock()?;
        f(&guard)
    }

    /// Run `f` under the lock. With a snapshot, `f` works on a copy that
    /// replaces the live state only once it is on disk. Without one, `f`
    /// must leave the state untouched when it fails.
    fn write<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&mut DatabaseState) -> Result<T, DatabaseError>,
    {
        let mut guard = self.lock()?;
        let Some(path) = &self.snapshot_path else {
            return f(&mut guard);
        };

        let mut staged = guard.clone();
        let result = f(&mut staged)?;
        Self::persist(path, &staged)?;
        *guard = staged;
        Ok(result)
    }

    fn persist(path: &Path, state: &DatabaseState) -> Result<(), DatabaseError> {
        let write_error = |source| DatabaseError::SnapshotWrite {
            path: path.to_path_buf(),
            source,
        };

        let bytes = serde_json::to_vec(state).map_err(|e| write_error(io::Error::from(e)))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(write_error)?;
        fs::rename(&tmp, path).map_err(write_error)?;
        debug!(path = %path.display(), "database snapshot written");
        Ok(())
    }
}

fn state_error(file_id: Uuid, provider: StorageProviderType, source: StateError) -> DatabaseError {
    match source {
        StateError::MissingCopyState { provider } => {
            DatabaseError::CopyStateNotFound { file_id, provider }
        }
        source => DatabaseError::State {
            file_id,
            provider,
            source,
        },
    }
}

fn chrono_timeout(timeout: Duration) -> chrono::Duration {
    chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

impl ClientDatabase for LocalDatabase {
    fn get_source_locations(&self) -> Result<SourceLocations, DatabaseError> {
        self.read(|state| Ok(state.sources.clone()))
    }

    fn set_source_location(&self, location: SourceLocation) -> Result<(), DatabaseError> {
        // Stored members are not re-validated; a folder that went away must
        // not block edits to other locations
        location.validate()?;
        self.write(|state| {
            let mut sources = state.sources.clone();
            sources.upsert(location);
            sources.check_unique_ids()?;
            state.sources = sources;
            Ok(())
        })
    }

    fn remove_source_location(&self, id: i64) -> Result<(), DatabaseError> {
        self.write(|state| {
            state
                .sources
                .remove(id)
                .map(|_| ())
                .ok_or(DatabaseError::SourceLocationNotFound { id })
        })
    }

    fn set_source_last_completed_scan(
        &self,
        id: i64,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.write(|state| {
            state.source_mut(id)?.last_completed_scan = Some(completed_at);
            Ok(())
        })
    }

    fn set_network_source_state(
        &self,
        id: i64,
        is_connected: bool,
        is_failed: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.write(|state| {
            let source = state.source_mut(id)?;
            let path = source.path.clone();
            let network = source.network_state_mut().ok_or(DatabaseError::Validation(
                SourceLocationError::InvalidFolderPath { path },
            ))?;
            network.is_connected = is_connected;
            network.is_failed = is_failed;
            network.last_connection_check = Some(checked_at);
            Ok(())
        })
    }

    fn get_providers(&self) -> Result<Vec<ProviderRecord>, DatabaseError> {
        self.read(|state| Ok(state.providers.clone()))
    }

    fn add_provider(&self, provider: ProviderRecord) -> Result<(), DatabaseError> {
        self.write(|state| {
            state
                .providers
                .retain(|p| p.provider_type != provider.provider_type);
            state.providers.push(provider);
            Ok(())
        })
    }

    fn remove_provider(&self, provider_type: StorageProviderType) -> Result<(), DatabaseError> {
        self.write(|state| {
            state.providers.retain(|p| p.provider_type != provider_type);
            Ok(())
        })
    }

    fn find_backup_file_by_path(&self, path: &Path) -> Result<Option<BackupFile>, DatabaseError> {
        self.read(|state| {
            Ok(state
                .path_index
                .get(path)
                .and_then(|id| state.files.get(id))
                .cloned())
        })
    }

    fn get_backup_file(&self, file_id: Uuid) -> Result<BackupFile, DatabaseError> {
        self.read(|state| {
            state
                .files
                .get(&file_id)
                .cloned()
                .ok_or(DatabaseError::BackupFileNotFound { file_id })
        })
    }

    fn add_backup_file(
        &self,
        discovered: &DiscoveredFile,
        source: &SourceLocation,
        block_size: u64,
    ) -> Result<BackupFile, DatabaseError> {
        self.write(|state| {
            if state.path_index.contains_key(&discovered.path) {
                return Err(DatabaseError::DuplicateBackupFile {
                    path: discovered.path.clone(),
                });
            }

            let providers: Vec<StorageProviderType> =
                state.providers.iter().map(|p| p.provider_type).collect();
            let file = BackupFile::new(
                discovered,
                source.id,
                source.priority,
                block_size,
                &providers,
                Utc::now(),
            );

            state
                .path_index
                .insert(file.full_source_path.clone(), file.file_id);
            state.files.insert(file.file_id, file.clone());
            Ok(file)
        })
    }

    fn reset_backup_file_state(
        &self,
        file_id: Uuid,
        discovered: &DiscoveredFile,
        block_size: u64,
        revision_count: i32,
    ) -> Result<BackupFile, DatabaseError> {
        self.write(|state| {
            let file = state.file_mut(file_id)?;
            file.apply_content_change(discovered, block_size, revision_count, Utc::now());
            Ok(file.clone())
        })
    }

    fn set_backup_file_last_checked(
        &self,
        file_id: Uuid,
        checked_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.write(|state| {
            state.file_mut(file_id)?.last_checked = checked_at;
            Ok(())
        })
    }

    fn set_backup_file_hash(&self, file_id: Uuid, hash: ChecksumValue) -> Result<(), DatabaseError> {
        self.write(|state| {
            state.file_mut(file_id)?.content_hash = Some(hash);
            Ok(())
        })
    }

    fn record_block_completed(
        &self,
        file_id: Uuid,
        instance: EngineInstance,
        provider: StorageProviderType,
        block_index: i64,
    ) -> Result<SyncStatus, DatabaseError> {
        let now = Utc::now();
        self.write(|state| {
            let file = state.file_mut(file_id)?;
            if !dispatch::holds_claim(file, instance) {
                return Err(DatabaseError::ClaimNotHeld { file_id, instance });
            }
            let status = file
                .record_block_completed(provider, block_index, now)
                .map_err(|e| state_error(file_id, provider, e))?;
            dispatch::renew(file, instance, now);
            Ok(status)
        })
    }

    fn set_copy_state_failed(
        &self,
        file_id: Uuid,
        provider: StorageProviderType,
        message: &str,
    ) -> Result<(), DatabaseError> {
        self.write(|state| {
            state
                .file_mut(file_id)?
                .mark_copy_failed(provider, message, Utc::now())
                .map_err(|e| state_error(file_id, provider, e))
        })
    }

    fn retry_failed_file(&self, file_id: Uuid) -> Result<usize, DatabaseError> {
        self.write(|state| Ok(state.file_mut(file_id)?.retry_failed(Utc::now())))
    }

    fn find_next_file_to_backup(
        &self,
        instance: EngineInstance,
        claim_timeout: Duration,
    ) -> Result<Option<BackupFile>, DatabaseError> {
        let now = Utc::now();
        let timeout = chrono_timeout(claim_timeout);

        self.write(|state| {
            let Some(file_id) = dispatch::select_next(state.files.values(), instance, now, timeout)
            else {
                return Ok(None);
            };

            let file = state.file_mut(file_id)?;
            dispatch::claim(file, instance, now);
            Ok(Some(file.clone()))
        })
    }

    fn release_claim(&self, file_id: Uuid, instance: EngineInstance) -> Result<(), DatabaseError> {
        self.write(|state| {
            dispatch::release(state.file_mut(file_id)?, instance);
            Ok(())
        })
    }

    fn get_backup_progress(&self) -> Result<BackupProgress, DatabaseError> {
        self.read(|state| {
            let mut progress = BackupProgress::default();
            for file in state.files.values() {
                progress.total_file_count += 1;
                progress.total_file_size_bytes += file.file_size_bytes;
                match file.overall_state {
                    SyncStatus::Synced => {
                        progress.backed_up_file_count += 1;
                        progress.backed_up_file_size_bytes += file.file_size_bytes;
                    }
                    SyncStatus::Failed => {
                        progress.failed_file_count += 1;
                        progress.failed_file_size_bytes += file.file_size_bytes;
                    }
                    SyncStatus::Unsynced | SyncStatus::InProgress => {
                        progress.remaining_file_count += 1;
                        progress.remaining_file_size_bytes += file.file_size_bytes;
                    }
                }
            }
            Ok(progress)
        })
    }
}
