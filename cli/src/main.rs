//! Driftvault - service host and configuration commands for the backup engine.
//!
//! `driftvault run` starts the scan, connection and backup engines and waits
//! for them to stop. The other subcommands are thin wrappers over the
//! client database for managing source locations and checking progress.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, Select};
use driftvault_engine::{
    BackupEngine, ClientDatabase, ConnectionEngine, Engine, EngineConfig, EngineInstance,
    EngineStopped, EngineStoppedReason, LocalDatabase, LogMessagingProvider, MessagingProvider,
    Priority, ProviderRecord, ScanEngine, SourceKind, SourceLocation, StorageProviderConnections,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

const DEFAULT_LOG_FILTER: &str = "driftvault_engine=info,driftvault=info";

/// Driftvault - client-side backup agent
#[derive(Parser, Debug)]
#[command(name = "driftvault")]
#[command(version)]
#[command(about = "Back up local and network folders to pluggable storage providers")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Database snapshot path (overrides the configuration file)
    #[arg(long, value_name = "PATH", global = true)]
    database: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the backup service until interrupted
    Run,

    /// Manage source locations
    Sources {
        #[command(subcommand)]
        action: SourcesCommand,
    },

    /// Show storage providers
    Providers {
        #[command(subcommand)]
        action: ProvidersCommand,
    },

    /// Show overall backup progress
    Progress,

    /// Operate on tracked files
    Files {
        #[command(subcommand)]
        action: FilesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SourcesCommand {
    /// List configured source locations
    List,

    /// Add or replace a local folder
    AddLocal {
        #[arg(long)]
        id: i64,
        #[arg(long, value_name = "PATH")]
        path: String,
        /// File match filter, e.g. "*.docx" (empty or "*" for all files)
        #[arg(long, default_value = "")]
        filter: String,
        /// high, medium or low
        #[arg(long, default_value = "medium")]
        priority: Priority,
        /// Number of content revisions to keep
        #[arg(long, default_value_t = 1)]
        revisions: i32,
    },

    /// Add or replace a network share
    AddNetwork {
        #[arg(long)]
        id: i64,
        #[arg(long, value_name = "PATH")]
        path: String,
        #[arg(long, default_value = "")]
        filter: String,
        #[arg(long, default_value = "medium")]
        priority: Priority,
        #[arg(long, default_value_t = 1)]
        revisions: i32,
        /// Name of the stored credential used for the share
        #[arg(long)]
        credential: String,
    },

    /// Remove a source location
    Remove {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ProvidersCommand {
    /// List enabled storage providers
    List,
}

#[derive(Subcommand, Debug)]
enum FilesCommand {
    /// Reset the failed copies of a file so they are sent again
    Retry {
        #[arg(value_name = "FILE_ID")]
        file_id: Uuid,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Error: {:#}", e);
        std::process::exit(2);
    }

    let exit_code = match run_cli(&cli) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Initialize tracing to stderr. `RUST_LOG` overrides the default filter.
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("driftvault_engine=debug,driftvault=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init()
        .context("Failed to initialize logging")
}

/// Main CLI logic - separated for testability. Returns false when the
/// service ended because of an engine fault.
fn run_cli(cli: &Cli) -> Result<bool> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    let config = Arc::new(config);

    let db: Arc<dyn ClientDatabase> = Arc::new(
        LocalDatabase::open(&config.database_path).with_context(|| {
            format!("Failed to open database {}", config.database_path.display())
        })?,
    );

    match &cli.command {
        Command::Run => run_service(config, db),
        Command::Sources { action } => sources_command(db.as_ref(), action).map(|_| true),
        Command::Providers { action } => match action {
            ProvidersCommand::List => list_providers(db.as_ref(), &config).map(|_| true),
        },
        Command::Progress => show_progress(db.as_ref()).map(|_| true),
        Command::Files { action } => match action {
            FilesCommand::Retry { file_id } => {
                let reset = db.retry_failed_file(*file_id)?;
                println!("Reset {} failed copies of {}", reset, file_id);
                Ok(true)
            }
        },
    }
}

/// Build and start every engine, then wait for them to stop.
fn run_service(config: Arc<EngineConfig>, db: Arc<dyn ClientDatabase>) -> Result<bool> {
    let providers = StorageProviderConnections::from_config(&config.storage_providers)
        .context("Invalid storage provider configuration")?;
    if providers.is_empty() {
        bail!("No storage providers configured; add [[storage_providers]] to the config file");
    }

    // Copy states fan out to the providers recorded in the database
    for provider in &config.storage_providers {
        db.add_provider(ProviderRecord {
            provider_type: provider.provider_type,
            name: provider.name.clone(),
        })?;
    }

    let messaging: Vec<Arc<dyn MessagingProvider>> = vec![Arc::new(LogMessagingProvider)];

    let mut engines: Vec<Box<dyn Engine>> = vec![
        Box::new(ScanEngine::new(Arc::clone(&db), Arc::clone(&config), EngineInstance(1))),
        Box::new(ConnectionEngine::new(
            Arc::clone(&db),
            providers.clone(),
            messaging,
            Arc::clone(&config),
            EngineInstance(1),
        )?),
    ];
    for n in 1..=config.backup_engine_instances {
        engines.push(Box::new(BackupEngine::new(
            Arc::clone(&db),
            providers.clone(),
            Arc::clone(&config),
            EngineInstance(n),
        )?));
    }

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    info!(
        backup_engines = config.backup_engine_instances,
        providers = providers.len(),
        "starting backup service"
    );
    run_engines(engines, &shutdown_rx)
}

/// Start `engines` and block until all of them have stopped.
///
/// A message on `shutdown` stops every engine. The first fault also stops
/// the rest and makes the result false.
fn run_engines(mut engines: Vec<Box<dyn Engine>>, shutdown: &Receiver<()>) -> Result<bool> {
    let stopped: Vec<Receiver<EngineStopped>> = engines.iter().map(|e| e.stopped()).collect();

    for index in 0..engines.len() {
        if let Err(e) = engines[index].begin_start() {
            for engine in engines[..index].iter_mut() {
                engine.begin_stop();
            }
            return Err(e).context("Failed to start engine");
        }
    }

    let mut pending: Vec<usize> = (0..stopped.len()).collect();
    let mut stopping = false;
    let mut healthy = true;

    while !pending.is_empty() {
        let mut select = Select::new();
        for &engine_index in &pending {
            select.recv(&stopped[engine_index]);
        }
        // Once stopping, only stop notifications matter
        let shutdown_index = (!stopping).then(|| select.recv(shutdown));

        let operation = select.select();
        let index = operation.index();

        if Some(index) == shutdown_index {
            let _ = operation.recv(shutdown);
            info!("shutdown requested, stopping engines");
            stop_all(&mut engines, &mut stopping);
            continue;
        }

        let engine_index = pending.remove(index);
        match operation.recv(&stopped[engine_index]) {
            Ok(EngineStopped {
                reason: EngineStoppedReason::Fault(e),
                instance,
            }) => {
                error!(instance = %instance, error = %e, "engine faulted, stopping service");
                healthy = false;
                stop_all(&mut engines, &mut stopping);
            }
            Ok(event) => {
                info!(instance = %event.instance, reason = ?event.reason, "engine stopped");
                stop_all(&mut engines, &mut stopping);
            }
            // Sender dropped without a notification; count it as stopped
            Err(_) => stop_all(&mut engines, &mut stopping),
        }
    }

    Ok(healthy)
}

fn stop_all(engines: &mut [Box<dyn Engine>], stopping: &mut bool) {
    if *stopping {
        return;
    }
    *stopping = true;
    for engine in engines.iter_mut() {
        engine.begin_stop();
    }
}

fn sources_command(db: &dyn ClientDatabase, action: &SourcesCommand) -> Result<()> {
    match action {
        SourcesCommand::List => {
            let sources = db.get_source_locations()?;
            if sources.is_empty() {
                println!("No source locations configured");
            }
            for source in &sources {
                println!("{}", describe_source(source));
            }
        }
        SourcesCommand::AddLocal {
            id,
            path,
            filter,
            priority,
            revisions,
        } => {
            db.set_source_location(SourceLocation::local(
                *id,
                path.clone(),
                filter.clone(),
                *priority,
                *revisions,
            ))?;
            println!("Saved local source location {}", id);
        }
        SourcesCommand::AddNetwork {
            id,
            path,
            filter,
            priority,
            revisions,
            credential,
        } => {
            db.set_source_location(SourceLocation::network(
                *id,
                path.clone(),
                filter.clone(),
                *priority,
                *revisions,
                credential.clone(),
            ))?;
            println!("Saved network source location {}", id);
        }
        SourcesCommand::Remove { id } => {
            db.remove_source_location(*id)?;
            println!("Removed source location {}", id);
        }
    }
    Ok(())
}

fn describe_source(source: &SourceLocation) -> String {
    let last_scan = source
        .last_completed_scan
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    let kind = match &source.kind {
        SourceKind::Local => "local".to_string(),
        SourceKind::Network(state) => format!(
            "network ({}, {})",
            state.credential_name,
            if state.is_failed {
                "unreachable"
            } else if state.is_connected {
                "connected"
            } else {
                "unchecked"
            }
        ),
    };
    let filter = if source.file_match_filter.is_empty() {
        "*"
    } else {
        source.file_match_filter.as_str()
    };
    format!(
        "[{}] {} {} filter={} priority={} revisions={} last_scan={}",
        source.id, kind, source.path, filter, source.priority, source.revision_count, last_scan
    )
}

fn list_providers(db: &dyn ClientDatabase, config: &EngineConfig) -> Result<()> {
    let enabled = db.get_providers()?;
    if enabled.is_empty() {
        println!("No storage providers enabled");
    }
    for provider in &enabled {
        let configured = config
            .storage_providers
            .iter()
            .any(|c| c.provider_type == provider.provider_type);
        println!(
            "{} ({}){}",
            provider.name,
            provider.provider_type,
            if configured { "" } else { " [not in config]" }
        );
    }
    Ok(())
}

fn show_progress(db: &dyn ClientDatabase) -> Result<()> {
    let progress = db.get_backup_progress()?;
    println!(
        "Backed up: {} of {} files ({} of {}) {}",
        progress.backed_up_file_count,
        progress.total_file_count,
        format_bytes(progress.backed_up_file_size_bytes),
        format_bytes(progress.total_file_size_bytes),
        progress_bar(progress.overall_percentage() as u32)
    );
    println!(
        "Remaining: {} files ({})",
        progress.remaining_file_count,
        format_bytes(progress.remaining_file_size_bytes)
    );
    println!(
        "Failed:    {} files ({})",
        progress.failed_file_count,
        format_bytes(progress.failed_file_size_bytes)
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

fn progress_bar(percent: u32) -> String {
    let filled = (percent.min(100) / 5) as usize;
    let empty = 20 - filled;
    format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftvault_engine::lifecycle::EngineRuntime;
    use driftvault_engine::EngineError;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cli(dir: &TempDir, command: Command) -> Cli {
        Cli {
            config: None,
            database: Some(dir.path().join("db.json")),
            verbose: false,
            command,
        }
    }

    /// Engine whose worker fails as soon as it starts.
    struct FaultingEngine {
        runtime: EngineRuntime,
    }

    impl FaultingEngine {
        fn new() -> Self {
            FaultingEngine {
                runtime: EngineRuntime::new(
                    "faulting",
                    EngineInstance(9),
                    Arc::new(EngineConfig::default()),
                ),
            }
        }
    }

    impl Engine for FaultingEngine {
        fn begin_start(&mut self) -> Result<(), EngineError> {
            self.runtime.begin_start(|ctx| {
                ctx.sleep_with_stop_check(Duration::from_millis(50));
                Err(EngineError::NoStorageProviders)
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

    fn scan_engine() -> Box<dyn Engine> {
        let db: Arc<dyn ClientDatabase> = Arc::new(LocalDatabase::in_memory());
        Box::new(ScanEngine::new(
            db,
            Arc::new(EngineConfig::default()),
            EngineInstance(1),
        ))
    }

    #[test]
    fn test_source_commands_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let data = dir.path().join("data");
        std::fs::create_dir(&data).expect("Failed to create data dir");

        let add = cli(
            &dir,
            Command::Sources {
                action: SourcesCommand::AddLocal {
                    id: 1,
                    path: data.to_string_lossy().into_owned(),
                    filter: "*.docx".to_string(),
                    priority: Priority::High,
                    revisions: 3,
                },
            },
        );
        assert!(run_cli(&add).expect("add source"));

        let db = LocalDatabase::open(&dir.path().join("db.json")).expect("open db");
        let sources = db.get_source_locations().expect("sources");
        let source = sources.get(1).expect("source saved");
        assert_eq!(source.priority, Priority::High);
        assert_eq!(source.revision_count, 3);
        assert!(describe_source(source).contains("filter=*.docx"));
        drop(db);

        let remove = cli(
            &dir,
            Command::Sources {
                action: SourcesCommand::Remove { id: 1 },
            },
        );
        assert!(run_cli(&remove).expect("remove source"));
    }

    #[test]
    fn test_add_invalid_source_fails() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let add = cli(
            &dir,
            Command::Sources {
                action: SourcesCommand::AddLocal {
                    id: 1,
                    path: dir.path().join("missing").to_string_lossy().into_owned(),
                    filter: String::new(),
                    priority: Priority::Medium,
                    revisions: 1,
                },
            },
        );
        assert!(run_cli(&add).is_err(), "missing folder should be rejected");
    }

    #[test]
    fn test_retry_unknown_file_fails() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let retry = cli(
            &dir,
            Command::Files {
                action: FilesCommand::Retry {
                    file_id: Uuid::new_v4(),
                },
            },
        );
        assert!(run_cli(&retry).is_err());
    }

    #[test]
    fn test_progress_on_empty_database() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        assert!(run_cli(&cli(&dir, Command::Progress)).expect("progress"));
    }

    #[test]
    fn test_run_without_providers_fails() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        assert!(run_cli(&cli(&dir, Command::Run)).is_err());
    }

    #[test]
    fn test_shutdown_stops_all_engines() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(()).expect("send shutdown");
        let healthy = run_engines(vec![scan_engine(), scan_engine()], &rx).expect("run");
        assert!(healthy);
    }

    #[test]
    fn test_fault_stops_service_with_failure() {
        let (_tx, rx) = crossbeam_channel::bounded::<()>(1);
        let engines: Vec<Box<dyn Engine>> = vec![scan_engine(), Box::new(FaultingEngine::new())];
        let healthy = run_engines(engines, &rx).expect("run");
        assert!(!healthy);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0), "[                    ] 0%");
        assert_eq!(progress_bar(50), "[==========          ] 50%");
        assert_eq!(progress_bar(100), "[====================] 100%");
    }
}
