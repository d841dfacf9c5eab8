//! Backup engine: chunked, resumable transfer of claimed files.
//!
//! A file is sent to each provider as fixed-size blocks numbered from 0.
//! Progress is persisted after every acknowledged block, so a restarted
//! engine resumes each copy at `last_completed_file_block_index + 1`.

use std::fs::File;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::checksums::compute_file_checksum;
use crate::config::EngineConfig;
use crate::db::ClientDatabase;
use crate::error::EngineError;
use crate::fs_ops::read_block;
use crate::lifecycle::{
    run_worker_loop, Engine, EngineInstance, EngineRuntime, EngineStopped, WorkerContext,
};
use crate::model::{BackupFile, StorageProviderType, SyncStatus};
use crate::providers::{FailureClassifier, StorageProvider, StorageProviderConnections, UploadOutcome};

/// What one dispatch iteration achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub blocks_uploaded: u64,
    pub synced: Vec<StorageProviderType>,
    pub failed: Vec<StorageProviderType>,
}

/// Shared collaborators of a transfer.
pub struct Transfer<'a> {
    pub db: &'a dyn ClientDatabase,
    pub providers: &'a StorageProviderConnections,
    pub classifier: &'a FailureClassifier,
}

impl Transfer<'_> {
    /// Claim the next file, send its pending copies and release the claim.
    ///
    /// Returns `None` when the dispatcher had nothing to do.
    pub fn backup_next_file(&self, ctx: &WorkerContext) -> Result<Option<TransferReport>, EngineError> {
        let Some(file) = self
            .db
            .find_next_file_to_backup(ctx.instance, ctx.config.claim_timeout())?
        else {
            return Ok(None);
        };

        debug!(instance = %ctx.instance, file_id = %file.file_id, "claimed file");
        let result = self.transfer_file(ctx, &file);
        let released = self.db.release_claim(file.file_id, ctx.instance);

        let report = result?;
        released?;
        Ok(Some(report))
    }

    fn transfer_file(&self, ctx: &WorkerContext, file: &BackupFile) -> Result<TransferReport, EngineError> {
        let mut report = TransferReport::default();
        let pending = file.pending_providers();
        let path = &file.full_source_path;

        let mut source = match File::open(path) {
            Ok(source) => source,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let message = format!("source file not found: {}", path.display());
                for provider in pending {
                    self.db.set_copy_state_failed(file.file_id, provider, &message)?;
                    report.failed.push(provider);
                }
                warn!(instance = %ctx.instance, file_id = %file.file_id, path = %path.display(), "source file missing");
                return Ok(report);
            }
            Err(e) => {
                warn!(file_id = %file.file_id, error = %e, "cannot open source file, will retry");
                return Ok(report);
            }
        };

        // The scan has not caught up with a content change yet
        match source.metadata() {
            Ok(meta) if meta.len() == file.file_size_bytes => {}
            Ok(meta) => {
                debug!(file_id = %file.file_id, recorded = file.file_size_bytes, actual = meta.len(), "source size changed, waiting for rescan");
                return Ok(report);
            }
            Err(e) => {
                warn!(file_id = %file.file_id, error = %e, "cannot stat source file, will retry");
                return Ok(report);
            }
        }

        if file.content_hash.is_none() {
            match compute_file_checksum(path, ctx.config.hash_algorithm) {
                Ok(hash) => {
                    debug!(file_id = %file.file_id, hash = %hash.to_string_with_algo(), "content hashed");
                    self.db.set_backup_file_hash(file.file_id, hash)?;
                }
                Err(e) => {
                    warn!(file_id = %file.file_id, error = %e, "cannot hash source file, will retry");
                    return Ok(report);
                }
            }
        }

        for provider_type in pending {
            if ctx.is_stop_requested() {
                break;
            }
            let Some(provider) = self.providers.get(provider_type) else {
                debug!(file_id = %file.file_id, provider = %provider_type, "provider not registered, skipping copy");
                continue;
            };
            let Some(state) = file.copy_state.get(&provider_type) else {
                continue;
            };

            let resume_at = state.last_completed_file_block_index + 1;
            match self.transfer_copy(ctx, file, provider.as_ref(), resume_at, &mut source, &mut report)? {
                SyncStatus::Synced => report.synced.push(provider_type),
                SyncStatus::Failed => report.failed.push(provider_type),
                _ => {}
            }
        }

        Ok(report)
    }

    /// Send blocks `resume_at..total` to one provider. Returns the copy's
    /// status when the loop ended.
    fn transfer_copy(
        &self,
        ctx: &WorkerContext,
        file: &BackupFile,
        provider: &dyn StorageProvider,
        resume_at: i64,
        source: &mut File,
        report: &mut TransferReport,
    ) -> Result<SyncStatus, EngineError> {
        let provider_type = provider.provider_type();
        let block_size = file.block_size_bytes;
        let mut status = SyncStatus::InProgress;

        if resume_at > 0 {
            info!(file_id = %file.file_id, provider = %provider_type, block = resume_at, total = file.total_file_blocks, "resuming transfer");
        }

        for index in resume_at..file.total_file_blocks {
            if ctx.is_stop_requested() {
                break;
            }

            let data = match read_block(source, index, block_size) {
                Ok(data) if !data.is_empty() => data,
                Ok(_) => {
                    warn!(file_id = %file.file_id, block = index, "source ended early, will retry");
                    break;
                }
                Err(e) => {
                    warn!(file_id = %file.file_id, block = index, error = %e, "block read failed, will retry");
                    break;
                }
            };

            match self
                .classifier
                .outcome(provider.upload_block(file.file_id, index, &data))
            {
                UploadOutcome::Success => {
                    status = self
                        .db
                        .record_block_completed(file.file_id, ctx.instance, provider_type, index)?;
                    report.blocks_uploaded += 1;
                }
                UploadOutcome::Retriable(e) => {
                    warn!(file_id = %file.file_id, provider = %provider_type, block = index, error = %e, "upload failed, will retry");
                    break;
                }
                UploadOutcome::Terminal(e) => {
                    warn!(file_id = %file.file_id, provider = %provider_type, block = index, error = %e, "upload failed permanently");
                    self.db
                        .set_copy_state_failed(file.file_id, provider_type, &e.to_string())?;
                    status = SyncStatus::Failed;
                    break;
                }
            }
        }

        if status == SyncStatus::Synced {
            info!(file_id = %file.file_id, provider = %provider_type, blocks = file.total_file_blocks, "copy synced");
        }
        Ok(status)
    }
}

/// Background worker that keeps claiming and transferring files.
pub struct BackupEngine {
    runtime: EngineRuntime,
    db: Arc<dyn ClientDatabase>,
    providers: StorageProviderConnections,
    classifier: FailureClassifier,
}

impl BackupEngine {
    /// # Errors
    /// `EngineError::NoStorageProviders` if `providers` is empty.
    pub fn new(
        db: Arc<dyn ClientDatabase>,
        providers: StorageProviderConnections,
        config: Arc<EngineConfig>,
        instance: EngineInstance,
    ) -> Result<Self, EngineError> {
        if providers.is_empty() {
            return Err(EngineError::NoStorageProviders);
        }
        let classifier = FailureClassifier::from_config(&config.failure_classification);
        Ok(BackupEngine {
            runtime: EngineRuntime::new("backup", instance, config),
            db,
            providers,
            classifier,
        })
    }
}

impl Engine for BackupEngine {
    fn begin_start(&mut self) -> Result<(), EngineError> {
        let db = Arc::clone(&self.db);
        let providers = self.providers.clone();
        let classifier = self.classifier.clone();

        self.runtime.begin_start(move |ctx| {
            let transfer = Transfer {
                db: db.as_ref(),
                providers: &providers,
                classifier: &classifier,
            };
            run_worker_loop(ctx, ctx.config.error_pause(), |ctx| {
                match transfer.backup_next_file(ctx)? {
                    // Keep going while blocks are flowing
                    Some(report) if report.blocks_uploaded > 0 => Ok(Duration::ZERO),
                    _ => Ok(ctx.config.backup_idle_sleep()),
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::ChecksumAlgorithm;
    use crate::db::LocalDatabase;
    use crate::error::ProviderError;
    use crate::fs_ops::DiscoveredFile;
    use crate::lifecycle::{CancellationToken, EngineStoppedReason};
    use crate::model::{Priority, ProviderRecord};
    use crate::providers::LocalDirectoryProvider;
    use crate::source::SourceLocation;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    const BLOCK: u64 = 4;
    const CONTENT: &[u8] = b"aaaabbbbccccddddeeee";

    /// Provider that records uploads and fails on a chosen block.
    struct ScriptedProvider {
        provider_type: StorageProviderType,
        uploads: Mutex<Vec<(i64, Vec<u8>)>>,
        fail_at: Mutex<Option<(i64, ProviderError)>>,
        fail_once: bool,
    }

    impl ScriptedProvider {
        fn new(provider_type: StorageProviderType) -> Arc<Self> {
            Arc::new(ScriptedProvider {
                provider_type,
                uploads: Mutex::new(Vec::new()),
                fail_at: Mutex::new(None),
                fail_once: false,
            })
        }

        fn failing(provider_type: StorageProviderType, block: i64, code: &str, once: bool) -> Arc<Self> {
            Arc::new(ScriptedProvider {
                provider_type,
                uploads: Mutex::new(Vec::new()),
                fail_at: Mutex::new(Some((block, ProviderError::new(code, "scripted failure")))),
                fail_once: once,
            })
        }

        fn uploaded_indexes(&self) -> Vec<i64> {
            self.uploads.lock().unwrap().iter().map(|(i, _)| *i).collect()
        }
    }

    impl StorageProvider for ScriptedProvider {
        fn provider_type(&self) -> StorageProviderType {
            self.provider_type
        }

        fn upload_block(&self, _file_id: Uuid, block_index: i64, data: &[u8]) -> Result<(), ProviderError> {
            let mut fail_at = self.fail_at.lock().unwrap();
            if let Some((block, err)) = fail_at.clone() {
                if block == block_index {
                    if self.fail_once {
                        *fail_at = None;
                    }
                    return Err(err);
                }
            }
            self.uploads.lock().unwrap().push((block_index, data.to_vec()));
            Ok(())
        }

        fn check_connectivity(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct Fixture {
        temp_dir: tempfile::TempDir,
        db: LocalDatabase,
        file: BackupFile,
        ctx: WorkerContext,
    }

    fn fixture(providers: &[StorageProviderType]) -> Fixture {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("song.mp3");
        std::fs::write(&path, CONTENT).expect("Failed to write source");

        let db = LocalDatabase::in_memory();
        for p in providers {
            db.add_provider(ProviderRecord {
                provider_type: *p,
                name: p.to_string(),
            })
            .expect("add provider");
        }
        let source = SourceLocation::local(1, temp_dir.path().to_string_lossy(), "", Priority::High, 1);
        let discovered = DiscoveredFile {
            path,
            file_size_bytes: CONTENT.len() as u64,
            last_modified: Utc::now(),
        };
        let file = db.add_backup_file(&discovered, &source, BLOCK).expect("add file");
        assert_eq!(file.total_file_blocks, 5);

        let ctx = WorkerContext {
            instance: EngineInstance(1),
            token: CancellationToken::new(),
            config: Arc::new(EngineConfig {
                transfer_block_size_bytes: BLOCK,
                hash_algorithm: ChecksumAlgorithm::Blake3,
                ..EngineConfig::default()
            }),
        };

        Fixture {
            temp_dir,
            db,
            file,
            ctx,
        }
    }

    fn as_dyn(provider: &Arc<ScriptedProvider>) -> Arc<dyn StorageProvider> {
        provider.clone()
    }

    fn connections(providers: Vec<Arc<dyn StorageProvider>>) -> StorageProviderConnections {
        let mut connections = StorageProviderConnections::new();
        for p in providers {
            connections.insert(p);
        }
        connections
    }

    fn run_once(f: &Fixture, providers: &StorageProviderConnections) -> Option<TransferReport> {
        let classifier = FailureClassifier::default();
        let transfer = Transfer {
            db: &f.db,
            providers,
            classifier: &classifier,
        };
        transfer.backup_next_file(&f.ctx).expect("transfer")
    }

    #[test]
    fn test_full_transfer_syncs_and_hashes() {
        let f = fixture(&[StorageProviderType::Azure]);
        let azure = ScriptedProvider::new(StorageProviderType::Azure);
        let conns = connections(vec![as_dyn(&azure)]);

        let report = run_once(&f, &conns).expect("file dispatched");
        assert_eq!(report.blocks_uploaded, 5);
        assert_eq!(report.synced, vec![StorageProviderType::Azure]);
        assert_eq!(azure.uploaded_indexes(), vec![0, 1, 2, 3, 4]);

        let uploaded: Vec<u8> = azure
            .uploads
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, d)| d.clone())
            .collect();
        assert_eq!(uploaded, CONTENT);

        let file = f.db.get_backup_file(f.file.file_id).expect("file");
        assert_eq!(file.overall_state, SyncStatus::Synced);
        assert!(file.claim.is_none());
        let hash = file.content_hash.expect("hash computed before transfer");
        assert_eq!(hash.algorithm(), ChecksumAlgorithm::Blake3);
        assert_eq!(hash.hex(), blake3::hash(CONTENT).to_hex().as_str());

        assert!(run_once(&f, &conns).is_none(), "nothing left to do");
    }

    #[test]
    fn test_resume_uploads_only_remaining_blocks() {
        let f = fixture(&[StorageProviderType::Azure]);

        // Simulate a crash after block 2 was acknowledged
        f.db.find_next_file_to_backup(EngineInstance(1), Duration::from_secs(3600))
            .expect("dispatch");
        for index in 0..=2 {
            f.db.record_block_completed(f.file.file_id, EngineInstance(1), StorageProviderType::Azure, index)
                .expect("record block");
        }
        f.db.release_claim(f.file.file_id, EngineInstance(1)).expect("release");

        let azure = ScriptedProvider::new(StorageProviderType::Azure);
        let report = run_once(&f, &connections(vec![as_dyn(&azure)])).expect("file dispatched");

        assert_eq!(azure.uploaded_indexes(), vec![3, 4]);
        assert_eq!(report.blocks_uploaded, 2);
        let uploads = azure.uploads.lock().unwrap();
        assert_eq!(uploads[0].1, b"dddd");
        assert_eq!(uploads[1].1, b"eeee");

        let file = f.db.get_backup_file(f.file.file_id).expect("file");
        assert_eq!(file.copy_state[&StorageProviderType::Azure].sync_status, SyncStatus::Synced);
        assert_eq!(file.copy_state[&StorageProviderType::Azure].last_completed_file_block_index, 4);
    }

    #[test]
    fn test_recorded_block_size_survives_config_change() {
        for configured in [2u64, 8] {
            let mut f = fixture(&[StorageProviderType::Azure]);
            f.ctx.config = Arc::new(EngineConfig {
                transfer_block_size_bytes: configured,
                ..(*f.ctx.config).clone()
            });
            let azure = ScriptedProvider::new(StorageProviderType::Azure);

            let report = run_once(&f, &connections(vec![as_dyn(&azure)])).expect("file dispatched");
            assert_eq!(report.blocks_uploaded, 5, "block size {}", configured);
            assert_eq!(report.synced, vec![StorageProviderType::Azure]);

            let uploaded: Vec<u8> = azure
                .uploads
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, d)| d.clone())
                .collect();
            assert_eq!(uploaded, CONTENT, "block size {}", configured);
        }
    }

    #[test]
    fn test_terminal_failure_only_affects_its_provider() {
        let f = fixture(&[StorageProviderType::Azure, StorageProviderType::LocalDirectory]);
        let azure = ScriptedProvider::failing(StorageProviderType::Azure, 1, "permission_denied", false);
        let target = f.temp_dir.path().join("target");
        std::fs::create_dir(&target).expect("mkdir target");
        let local: Arc<dyn StorageProvider> = Arc::new(LocalDirectoryProvider::new(&target));

        let report = run_once(&f, &connections(vec![as_dyn(&azure), local])).expect("file dispatched");
        assert_eq!(report.failed, vec![StorageProviderType::Azure]);
        assert_eq!(report.synced, vec![StorageProviderType::LocalDirectory]);

        let file = f.db.get_backup_file(f.file.file_id).expect("file");
        let azure_state = &file.copy_state[&StorageProviderType::Azure];
        assert_eq!(azure_state.sync_status, SyncStatus::Failed);
        assert_eq!(azure_state.last_completed_file_block_index, 0);
        assert!(azure_state
            .failure_message
            .as_deref()
            .unwrap_or_default()
            .contains("permission_denied"));
        assert_eq!(file.copy_state[&StorageProviderType::LocalDirectory].sync_status, SyncStatus::Synced);
        assert_eq!(file.overall_state, SyncStatus::Failed);

        let restored: Vec<u8> = (0..5)
            .flat_map(|i| std::fs::read(target.join(f.file.file_id.to_string()).join(format!("{}.blk", i))).expect("block"))
            .collect();
        assert_eq!(restored, CONTENT);
    }

    #[test]
    fn test_retriable_failure_leaves_state_for_next_attempt() {
        let f = fixture(&[StorageProviderType::Azure]);
        let azure = ScriptedProvider::failing(StorageProviderType::Azure, 2, "timed_out", true);
        let conns = connections(vec![as_dyn(&azure)]);

        let report = run_once(&f, &conns).expect("file dispatched");
        assert_eq!(report.blocks_uploaded, 2);
        assert!(report.failed.is_empty());

        let file = f.db.get_backup_file(f.file.file_id).expect("file");
        let state = &file.copy_state[&StorageProviderType::Azure];
        assert_eq!(state.sync_status, SyncStatus::InProgress);
        assert_eq!(state.last_completed_file_block_index, 1);
        assert!(state.failure_message.is_none());

        run_once(&f, &conns).expect("file dispatched again");
        assert_eq!(azure.uploaded_indexes(), vec![0, 1, 2, 3, 4]);
        let file = f.db.get_backup_file(f.file.file_id).expect("file");
        assert_eq!(file.overall_state, SyncStatus::Synced);
    }

    #[test]
    fn test_missing_source_fails_every_pending_copy() {
        let f = fixture(&[StorageProviderType::Azure, StorageProviderType::AmazonS3]);
        std::fs::remove_file(&f.file.full_source_path).expect("remove source");
        let conns = connections(vec![
            as_dyn(&ScriptedProvider::new(StorageProviderType::Azure)),
            as_dyn(&ScriptedProvider::new(StorageProviderType::AmazonS3)),
        ]);

        let report = run_once(&f, &conns).expect("file dispatched");
        assert_eq!(report.failed.len(), 2);

        let file = f.db.get_backup_file(f.file.file_id).expect("file");
        assert_eq!(file.overall_state, SyncStatus::Failed);
        for state in file.copy_state.values() {
            assert!(state
                .failure_message
                .as_deref()
                .unwrap_or_default()
                .contains("not found"));
        }
    }

    #[test]
    fn test_changed_size_waits_for_rescan() {
        let f = fixture(&[StorageProviderType::Azure]);
        std::fs::write(&f.file.full_source_path, b"short").expect("rewrite");
        let azure = ScriptedProvider::new(StorageProviderType::Azure);

        let report = run_once(&f, &connections(vec![as_dyn(&azure)])).expect("file dispatched");
        assert_eq!(report.blocks_uploaded, 0);
        assert!(azure.uploaded_indexes().is_empty());
        assert!(f.db.get_backup_file(f.file.file_id).expect("file").content_hash.is_none());
    }

    #[test]
    fn test_backup_engine_requires_providers() {
        let db: Arc<dyn ClientDatabase> = Arc::new(LocalDatabase::in_memory());
        let result = BackupEngine::new(
            db,
            StorageProviderConnections::new(),
            Arc::new(EngineConfig::default()),
            EngineInstance(1),
        );
        assert!(matches!(result, Err(EngineError::NoStorageProviders)));
    }

    #[test]
    fn test_backup_engine_transfers_and_stops() {
        let Fixture { temp_dir, db, file, ctx } = fixture(&[StorageProviderType::Azure]);
        let db: Arc<dyn ClientDatabase> = Arc::new(db);
        let azure = ScriptedProvider::new(StorageProviderType::Azure);

        let mut engine = BackupEngine::new(
            Arc::clone(&db),
            connections(vec![as_dyn(&azure)]),
            Arc::clone(&ctx.config),
            EngineInstance(1),
        )
        .expect("engine");
        let stopped = engine.stopped();
        engine.begin_start().expect("start");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while db.get_backup_file(file.file_id).expect("file").overall_state != SyncStatus::Synced {
            assert!(std::time::Instant::now() < deadline, "file never synced");
            std::thread::sleep(Duration::from_millis(20));
        }

        engine.begin_stop();
        let event = stopped.recv_timeout(Duration::from_secs(5)).expect("stop notification");
        assert!(matches!(event.reason, EngineStoppedReason::StopRequested));
        drop(temp_dir);
    }
}
