//! Work selection for backup engines.
//!
//! Pure functions over the file index; the database calls them while holding
//! its write lock so selection and claim form one atomic step.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::lifecycle::EngineInstance;
use crate::model::{BackupFile, Claim};

/// Whether `claim` still protects its file at `now`.
pub fn is_claim_live(claim: &Claim, now: DateTime<Utc>, claim_timeout: Duration) -> bool {
    now - claim.claimed_at < claim_timeout
}

/// A file is eligible for `instance` when a copy still needs data and no
/// other instance holds a live claim on it.
pub fn is_eligible(
    file: &BackupFile,
    instance: EngineInstance,
    now: DateTime<Utc>,
    claim_timeout: Duration,
) -> bool {
    if file.copy_state.values().all(|s| s.sync_status.is_terminal()) {
        return false;
    }
    match &file.claim {
        None => true,
        Some(claim) if claim.instance == instance => true,
        Some(claim) => !is_claim_live(claim, now, claim_timeout),
    }
}

/// Dispatch order: priority, then longest waiting, then file id.
pub fn dispatch_order(a: &BackupFile, b: &BackupFile) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.last_updated.cmp(&b.last_updated))
        .then(a.file_id.cmp(&b.file_id))
}

/// Pick the next file for `instance`, if any.
pub fn select_next<'a, I>(
    files: I,
    instance: EngineInstance,
    now: DateTime<Utc>,
    claim_timeout: Duration,
) -> Option<Uuid>
where
    I: IntoIterator<Item = &'a BackupFile>,
{
    files
        .into_iter()
        .filter(|f| is_eligible(f, instance, now, claim_timeout))
        .min_by(|a, b| dispatch_order(a, b))
        .map(|f| f.file_id)
}

/// Claim `file` for `instance` and move its unsynced copies to InProgress.
///
/// Claiming counts as an update, so a file that keeps coming back
/// unfinished goes to the back of its priority tier.
pub fn claim(file: &mut BackupFile, instance: EngineInstance, now: DateTime<Utc>) {
    file.claim = Some(Claim {
        instance,
        claimed_at: now,
    });
    file.begin_transfer(now);
    file.last_updated = now;
}

/// Whether `instance` currently holds the claim on `file`.
pub fn holds_claim(file: &BackupFile, instance: EngineInstance) -> bool {
    file.claim.as_ref().is_some_and(|c| c.instance == instance)
}

/// Extend `instance`'s claim on `file` to `now`. Returns false if the claim
/// belongs to someone else (or there is none).
pub fn renew(file: &mut BackupFile, instance: EngineInstance, now: DateTime<Utc>) -> bool {
    match &mut file.claim {
        Some(claim) if claim.instance == instance => {
            claim.claimed_at = now;
            true
        }
        _ => false,
    }
}

/// Drop `instance`'s claim on `file`. Returns false if the claim belongs to
/// someone else (or there is none).
pub fn release(file: &mut BackupFile, instance: EngineInstance) -> bool {
    match &file.claim {
        Some(claim) if claim.instance == instance => {
            file.claim = None;
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops::DiscoveredFile;
    use crate::model::{Priority, StorageProviderType, SyncStatus};
    use std::path::PathBuf;

    fn file(name: &str, priority: Priority, updated: DateTime<Utc>) -> BackupFile {
        let discovered = DiscoveredFile {
            path: PathBuf::from("/data").join(name),
            file_size_bytes: 10,
            last_modified: updated,
        };
        BackupFile::new(
            &discovered,
            1,
            priority,
            4,
            &[StorageProviderType::Azure],
            updated,
        )
    }

    fn timeout() -> Duration {
        Duration::hours(1)
    }

    #[test]
    fn test_priority_beats_age() {
        let now = Utc::now();
        let old_low = file("old.txt", Priority::Low, now - Duration::days(3));
        let new_high = file("new.txt", Priority::High, now);

        let files = vec![old_low, new_high.clone()];
        assert_eq!(
            select_next(&files, EngineInstance(1), now, timeout()),
            Some(new_high.file_id)
        );
    }

    #[test]
    fn test_oldest_first_within_priority() {
        let now = Utc::now();
        let newer = file("newer.txt", Priority::Medium, now - Duration::minutes(5));
        let older = file("older.txt", Priority::Medium, now - Duration::minutes(50));

        let files = vec![newer, older.clone()];
        assert_eq!(
            select_next(&files, EngineInstance(1), now, timeout()),
            Some(older.file_id)
        );
    }

    #[test]
    fn test_fully_terminal_files_are_skipped() {
        let now = Utc::now();
        let mut done = file("done.txt", Priority::High, now);
        done.copy_state
            .values_mut()
            .for_each(|s| s.sync_status = SyncStatus::Synced);

        assert_eq!(select_next(&[done], EngineInstance(1), now, timeout()), None);
    }

    #[test]
    fn test_live_claim_excludes_other_instances() {
        let now = Utc::now();
        let mut f = file("claimed.txt", Priority::High, now);
        claim(&mut f, EngineInstance(1), now);

        let files = vec![f.clone()];
        assert_eq!(select_next(&files, EngineInstance(2), now, timeout()), None);
        assert_eq!(
            select_next(&files, EngineInstance(1), now, timeout()),
            Some(f.file_id)
        );
    }

    #[test]
    fn test_stale_claim_can_be_taken_over() {
        let now = Utc::now();
        let mut f = file("stale.txt", Priority::High, now);
        claim(&mut f, EngineInstance(1), now - Duration::hours(2));

        assert_eq!(
            select_next(&[f.clone()], EngineInstance(2), now, timeout()),
            Some(f.file_id)
        );
    }

    #[test]
    fn test_claim_moves_unsynced_copies_in_progress() {
        let now = Utc::now();
        let mut f = file("a.txt", Priority::High, now);
        claim(&mut f, EngineInstance(3), now);

        assert_eq!(f.overall_state, SyncStatus::InProgress);
        assert_eq!(f.claim.map(|c| c.instance), Some(EngineInstance(3)));
    }

    #[test]
    fn test_renewed_claim_stays_live() {
        let now = Utc::now();
        let mut f = file("a.txt", Priority::High, now);
        claim(&mut f, EngineInstance(1), now - Duration::hours(2));

        assert!(!renew(&mut f, EngineInstance(2), now));
        assert!(renew(&mut f, EngineInstance(1), now));
        assert!(holds_claim(&f, EngineInstance(1)));
        assert_eq!(select_next(&[f], EngineInstance(2), now, timeout()), None);
    }

    #[test]
    fn test_release_only_by_owner() {
        let now = Utc::now();
        let mut f = file("a.txt", Priority::High, now);
        claim(&mut f, EngineInstance(1), now);

        assert!(!release(&mut f, EngineInstance(2)));
        assert!(f.claim.is_some());
        assert!(release(&mut f, EngineInstance(1)));
        assert!(f.claim.is_none());
    }
}
