//! # Driftvault Engine - Client-Side Backup Library
//!
//! A headless backup agent core in Rust: it watches configured source
//! locations, tracks every file's backup state per storage provider, and
//! sends files to providers in resumable fixed-size blocks.
//!
//! ## Overview
//!
//! Three kinds of background engine share one lifecycle (`lifecycle`):
//! - **ScanEngine**: change detection over due source locations
//! - **BackupEngine**: claims files from the dispatcher and transfers them
//! - **ConnectionEngine**: probes network sources and storage providers
//!
//! All state goes through the `ClientDatabase` port; `LocalDatabase` is the
//! shipped implementation.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use driftvault_engine::{
//!     BackupEngine, ClientDatabase, Engine, EngineConfig, EngineInstance, LocalDatabase,
//!     ScanEngine, StorageProviderConnections,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(EngineConfig::load("driftvault.toml".as_ref())?);
//! let db: Arc<dyn ClientDatabase> = Arc::new(LocalDatabase::open(&config.database_path)?);
//! let providers = StorageProviderConnections::from_config(&config.storage_providers)?;
//!
//! let mut scan = ScanEngine::new(Arc::clone(&db), Arc::clone(&config), EngineInstance(1));
//! let mut backup = BackupEngine::new(db, providers, config, EngineInstance(1))?;
//! scan.begin_start()?;
//! backup.begin_start()?;
//!
//! // ... later
//! scan.begin_stop();
//! backup.begin_stop();
//! let stopped = backup.stopped().recv()?;
//! println!("backup engine {} stopped: {:?}", stopped.instance, stopped.reason);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core records (BackupFile, CopyState, enums)
//! - **source**: Source locations, validation and scan policy
//! - **state**: Copy-state transitions and overall state
//! - **dispatch**: Work selection and claims
//! - **db**: Persistence port and the local implementation
//! - **scan**, **transfer**, **connection**: The background engines
//! - **lifecycle**: Start/stop, cancellation and stop notifications
//! - **providers**: Storage and messaging providers, failure classification
//! - **config**: TOML configuration
//! - **error**: Error types
//! - **fs_ops**: Low-level filesystem operations
//! - **checksums**: Content hashing

pub mod checksums;
pub mod config;
pub mod connection;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod fs_ops;
pub mod lifecycle;
pub mod model;
pub mod providers;
pub mod scan;
pub mod source;
pub mod state;
pub mod transfer;

// Re-export main types
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use config::{EngineConfig, FailureClass, FailureClassification, StorageProviderConfig};
pub use connection::ConnectionEngine;
pub use db::{ClientDatabase, LocalDatabase};
pub use error::{
    ConfigError, DatabaseError, EngineError, ProviderError, SourceLocationError, StateError,
};
pub use lifecycle::{
    CancellationToken, Engine, EngineInstance, EngineStopped, EngineStoppedReason, WorkerContext,
};
pub use model::{
    BackupFile, BackupProgress, CopyState, HydrationStatus, Priority, ProviderRecord,
    StorageProviderType, SyncStatus,
};
pub use providers::{
    FailureClassifier, LocalDirectoryProvider, LogMessagingProvider, MessagingProvider,
    StorageProvider, StorageProviderConnections, UploadOutcome,
};
pub use scan::ScanEngine;
pub use source::{FileMatcher, ScanFrequencies, SourceKind, SourceLocation, SourceLocations};
pub use transfer::BackupEngine;
