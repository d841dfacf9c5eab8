//! Scan engine: change detection over source locations.
//!
//! Each pass walks every source location that is due for a scan, compares
//! what it finds against the file index and records new files, content
//! changes and unchanged sightings.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::ClientDatabase;
use crate::error::{DatabaseError, EngineError};
use crate::fs_ops::{enumerate_source, DiscoveredFile};
use crate::lifecycle::{
    run_worker_loop, Engine, EngineInstance, EngineRuntime, EngineStopped, WorkerContext,
};
use crate::model::BackupFile;
use crate::source::SourceLocation;

/// How a discovered file relates to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    New,
    Updated,
    Unchanged,
}

/// Classify a discovered file by path, size and modification time.
pub fn classify(existing: Option<&BackupFile>, discovered: &DiscoveredFile) -> FileChange {
    match existing {
        None => FileChange::New,
        Some(file)
            if file.file_size_bytes != discovered.file_size_bytes
                || file.last_modified != discovered.last_modified =>
        {
            FileChange::Updated
        }
        Some(_) => FileChange::Unchanged,
    }
}

/// Counters for one source location's scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub new_files: usize,
    pub updated_files: usize,
    pub unchanged_files: usize,
    pub skipped_files: usize,
    pub errors: usize,
    /// A stop request cut the walk short
    pub interrupted: bool,
}

/// Scan one source location.
///
/// Per-file problems are logged and counted; only a failure to read the
/// source root is returned as an error.
pub fn scan_source(
    db: &dyn ClientDatabase,
    source: &SourceLocation,
    ctx: &WorkerContext,
) -> Result<ScanSummary, EngineError> {
    let matcher = source
        .file_matcher()
        .map_err(|e| EngineError::Database(DatabaseError::Validation(e)))?;
    let root = Path::new(&source.path);
    if !root.is_dir() {
        return Err(EngineError::SourceNotFound {
            path: root.to_path_buf(),
        });
    }

    let enumeration = enumerate_source(root, &matcher)?;
    let mut summary = ScanSummary {
        errors: enumeration.errors.len(),
        ..ScanSummary::default()
    };
    for e in &enumeration.errors {
        warn!(source_id = source.id, error = %e, "error walking source location");
    }

    for discovered in &enumeration.files {
        if ctx.is_stop_requested() {
            summary.interrupted = true;
            break;
        }

        // Empty files are never tracked
        if discovered.file_size_bytes == 0 {
            summary.skipped_files += 1;
            continue;
        }

        match record_file(db, source, discovered, &ctx.config) {
            Ok(FileChange::New) => summary.new_files += 1,
            Ok(FileChange::Updated) => summary.updated_files += 1,
            Ok(FileChange::Unchanged) => summary.unchanged_files += 1,
            Err(e) => {
                summary.errors += 1;
                warn!(
                    source_id = source.id,
                    path = %discovered.path.display(),
                    error = %e,
                    "failed to record scanned file"
                );
            }
        }
    }

    Ok(summary)
}

fn record_file(
    db: &dyn ClientDatabase,
    source: &SourceLocation,
    discovered: &DiscoveredFile,
    config: &EngineConfig,
) -> Result<FileChange, DatabaseError> {
    let existing = db.find_backup_file_by_path(&discovered.path)?;
    let change = classify(existing.as_ref(), discovered);

    match (change, existing) {
        (FileChange::New, _) => {
            let file = db.add_backup_file(discovered, source, config.transfer_block_size_bytes)?;
            debug!(file_id = %file.file_id, path = %discovered.path.display(), "new file");
        }
        (FileChange::Updated, Some(file)) => {
            let file = db.reset_backup_file_state(
                file.file_id,
                discovered,
                config.transfer_block_size_bytes,
                source.revision_count,
            )?;
            debug!(
                file_id = %file.file_id,
                revision = file.file_revision_number,
                "file content changed"
            );
        }
        (FileChange::Unchanged, Some(file)) => {
            db.set_backup_file_last_checked(file.file_id, Utc::now())?;
        }
        (_, None) => {}
    }

    Ok(change)
}

/// Scan every source location that is due. Returns the number scanned.
pub fn scan_pass(db: &dyn ClientDatabase, ctx: &WorkerContext) -> Result<usize, EngineError> {
    let sources = db.get_source_locations()?;
    let policy = &ctx.config.scan_frequencies;
    let mut scanned = 0;

    for source in &sources {
        if ctx.is_stop_requested() {
            break;
        }
        if source.is_unreachable() {
            debug!(source_id = source.id, "skipping unreachable network source");
            continue;
        }
        match source.should_scan(Some(policy)) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(source_id = source.id, error = %e, "cannot evaluate scan policy");
                continue;
            }
        }

        let summary = match scan_source(db, source, ctx) {
            Ok(summary) => summary,
            Err(e) if e.is_recoverable() => return Err(e),
            Err(e) => {
                warn!(source_id = source.id, path = %source.path, error = %e, "scan failed");
                continue;
            }
        };

        info!(
            source_id = source.id,
            new = summary.new_files,
            updated = summary.updated_files,
            unchanged = summary.unchanged_files,
            skipped = summary.skipped_files,
            errors = summary.errors,
            "scanned source location"
        );

        if !summary.interrupted {
            db.set_source_last_completed_scan(source.id, Utc::now())?;
            scanned += 1;
        }
    }

    Ok(scanned)
}

/// Background worker running `scan_pass` every `scan_interval`.
pub struct ScanEngine {
    runtime: EngineRuntime,
    db: Arc<dyn ClientDatabase>,
}

impl ScanEngine {
    pub fn new(
        db: Arc<dyn ClientDatabase>,
        config: Arc<EngineConfig>,
        instance: EngineInstance,
    ) -> Self {
        ScanEngine {
            runtime: EngineRuntime::new("scan", instance, config),
            db,
        }
    }
}

impl Engine for ScanEngine {
    fn begin_start(&mut self) -> Result<(), EngineError> {
        let db = Arc::clone(&self.db);
        self.runtime.begin_start(move |ctx| {
            run_worker_loop(ctx, ctx.config.error_pause(), |ctx| {
                scan_pass(db.as_ref(), ctx)?;
                Ok(ctx.config.scan_interval())
            })
        })
    }

    fn begin_stop(&mut self) {
        self.runtime.begin_stop();
    }

    fn instance_id(&self) -> EngineInstance {
        self.runtime.instance()
    }

    fn stopped(&self) -> Receiver<EngineStopped> {
        self.runtime.stopped()
    }
}
