//! Copy-state machine.
//!
//! Each (file, provider) copy moves `Unsynced -> InProgress -> Synced | Failed`.
//! Synced and Failed stay put until the copy is reset, either because the
//! file's content changed or because an operator retried a failed file.
//!
//! Every mutation through `BackupFile` recomputes the file's overall state
//! and bumps `last_updated`.

use chrono::{DateTime, Utc};

use crate::error::StateError;
use crate::fs_ops::DiscoveredFile;
use crate::model::{
    total_blocks_for, BackupFile, CopyState, FileRevision, StorageProviderType, SyncStatus,
};

impl CopyState {
    /// Move an unsynced copy to InProgress. Already in-progress copies are
    /// left alone so an interrupted transfer can be resumed.
    pub fn begin_transfer(&mut self) -> Result<(), StateError> {
        match self.sync_status {
            SyncStatus::Unsynced => {
                self.sync_status = SyncStatus::InProgress;
                Ok(())
            }
            SyncStatus::InProgress => Ok(()),
            from => Err(StateError::InvalidTransition {
                from,
                to: SyncStatus::InProgress,
            }),
        }
    }

    /// Record that the provider acknowledged block `index` of `total_blocks`.
    ///
    /// Blocks must arrive in order. Recording the final block marks the copy
    /// Synced in the same update. Returns the resulting status.
    pub fn record_block(&mut self, index: i64, total_blocks: i64) -> Result<SyncStatus, StateError> {
        if self.sync_status != SyncStatus::InProgress {
            return Err(StateError::InvalidTransition {
                from: self.sync_status,
                to: SyncStatus::InProgress,
            });
        }
        if index < 0 || index >= total_blocks {
            return Err(StateError::BlockOutOfRange {
                index,
                total: total_blocks,
            });
        }
        let expected = self.last_completed_file_block_index + 1;
        if index != expected {
            return Err(StateError::OutOfOrderBlock { index, expected });
        }

        self.last_completed_file_block_index = index;
        if index == total_blocks - 1 {
            self.complete(total_blocks)?;
        }
        Ok(self.sync_status)
    }

    /// Mark an in-progress copy Synced. Every block must have been recorded.
    pub fn complete(&mut self, total_blocks: i64) -> Result<(), StateError> {
        if self.sync_status != SyncStatus::InProgress {
            return Err(StateError::InvalidTransition {
                from: self.sync_status,
                to: SyncStatus::Synced,
            });
        }
        if self.last_completed_file_block_index != total_blocks - 1 {
            return Err(StateError::IncompleteTransfer {
                last: self.last_completed_file_block_index,
                total: total_blocks,
            });
        }
        self.sync_status = SyncStatus::Synced;
        Ok(())
    }

    /// Mark the copy Failed with a diagnostic message.
    pub fn mark_failed(&mut self, message: &str) -> Result<(), StateError> {
        if message.trim().is_empty() {
            return Err(StateError::MissingFailureMessage);
        }
        if self.sync_status.is_terminal() {
            return Err(StateError::InvalidTransition {
                from: self.sync_status,
                to: SyncStatus::Failed,
            });
        }
        self.sync_status = SyncStatus::Failed;
        self.failure_message = Some(message.to_string());
        Ok(())
    }

    /// Back to Unsynced with nothing sent.
    pub fn reset(&mut self) {
        *self = CopyState::default();
    }
}

/// Overall state of a file from its copy states.
///
/// Synced when every copy is Synced. Failed when at least one copy failed
/// and nothing is still pending. Otherwise InProgress if any copy is in
/// progress, else Unsynced. No copies at all counts as Unsynced.
pub fn derive_overall_state<'a, I>(states: I) -> SyncStatus
where
    I: IntoIterator<Item = &'a CopyState>,
{
    let mut any = false;
    let mut all_synced = true;
    let mut any_failed = false;
    let mut any_in_progress = false;
    let mut any_unsynced = false;

    for state in states {
        any = true;
        match state.sync_status {
            SyncStatus::Synced => {}
            SyncStatus::Failed => {
                all_synced = false;
                any_failed = true;
            }
            SyncStatus::InProgress => {
                all_synced = false;
                any_in_progress = true;
            }
            SyncStatus::Unsynced => {
                all_synced = false;
                any_unsynced = true;
            }
        }
    }

    if !any {
        SyncStatus::Unsynced
    } else if all_synced {
        SyncStatus::Synced
    } else if any_failed && !any_in_progress && !any_unsynced {
        SyncStatus::Failed
    } else if any_in_progress {
        SyncStatus::InProgress
    } else {
        SyncStatus::Unsynced
    }
}

impl BackupFile {
    pub fn recompute_overall_state(&mut self) -> SyncStatus {
        self.overall_state = derive_overall_state(self.copy_state.values());
        self.overall_state
    }

    /// Apply `f` to one provider's copy state, then refresh derived fields.
    pub fn update_copy_state<T, F>(
        &mut self,
        provider: StorageProviderType,
        now: DateTime<Utc>,
        f: F,
    ) -> Result<T, StateError>
    where
        F: FnOnce(&mut CopyState, i64) -> Result<T, StateError>,
    {
        let total_blocks = self.total_file_blocks;
        let state = self
            .copy_state
            .get_mut(&provider)
            .ok_or(StateError::MissingCopyState { provider })?;
        let result = f(state, total_blocks)?;
        self.last_updated = now;
        self.recompute_overall_state();
        Ok(result)
    }

    pub fn record_block_completed(
        &mut self,
        provider: StorageProviderType,
        index: i64,
        now: DateTime<Utc>,
    ) -> Result<SyncStatus, StateError> {
        self.update_copy_state(provider, now, |state, total| state.record_block(index, total))
    }

    pub fn mark_copy_failed(
        &mut self,
        provider: StorageProviderType,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        self.update_copy_state(provider, now, |state, _| state.mark_failed(message))
    }

    /// Move every unsynced copy to InProgress.
    pub fn begin_transfer(&mut self, now: DateTime<Utc>) {
        let mut changed = false;
        for state in self.copy_state.values_mut() {
            if state.sync_status == SyncStatus::Unsynced {
                changed |= state.begin_transfer().is_ok();
            }
        }
        if changed {
            self.last_updated = now;
        }
        self.recompute_overall_state();
    }

    /// Reset every copy to Unsynced.
    pub fn reset_copy_states(&mut self, now: DateTime<Utc>) {
        self.copy_state.values_mut().for_each(CopyState::reset);
        self.last_updated = now;
        self.recompute_overall_state();
    }

    /// Reset only the failed copies. Returns how many were reset.
    pub fn retry_failed(&mut self, now: DateTime<Utc>) -> usize {
        let mut count = 0;
        for state in self.copy_state.values_mut() {
            if state.sync_status == SyncStatus::Failed {
                state.reset();
                count += 1;
            }
        }
        if count > 0 {
            self.last_updated = now;
            self.recompute_overall_state();
        }
        count
    }

    /// Record new content for the file.
    ///
    /// Bumps the revision number, keeps at most `revision_count` revisions,
    /// clears the content hash and resets every copy.
    pub fn apply_content_change(
        &mut self,
        discovered: &DiscoveredFile,
        block_size: u64,
        revision_count: i32,
        now: DateTime<Utc>,
    ) {
        self.file_size_bytes = discovered.file_size_bytes;
        self.last_modified = discovered.last_modified;
        self.total_file_blocks = total_blocks_for(discovered.file_size_bytes, block_size);
        self.block_size_bytes = block_size;
        self.content_hash = None;
        self.file_revision_number += 1;
        self.revisions.push(FileRevision {
            revision: self.file_revision_number,
            file_size_bytes: discovered.file_size_bytes,
            last_modified: discovered.last_modified,
            recorded_at: now,
        });

        let keep = usize::try_from(revision_count.max(1)).unwrap_or(1);
        if self.revisions.len() > keep {
            let excess = self.revisions.len() - keep;
            self.revisions.drain(..excess);
        }

        self.last_checked = now;
        self.reset_copy_states(now);
    }
}
