//! Connection engine: periodic reachability checks.
//!
//! Network source locations are probed by listing their folder; storage
//! providers are probed through `check_connectivity`. A network source that
//! becomes unreachable is flagged so the scan engine skips it, and every
//! messaging provider is told about it once.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::ClientDatabase;
use crate::error::EngineError;
use crate::lifecycle::{
    run_worker_loop, Engine, EngineInstance, EngineRuntime, EngineStopped, WorkerContext,
};
use crate::providers::{MessagingProvider, StorageProviderConnections};
use crate::source::{SourceLocation, SourceLocations};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionReport {
    pub sources_checked: usize,
    pub sources_failed: usize,
    pub providers_failed: usize,
}

/// Collaborators of a connectivity check.
pub struct ConnectionCheck<'a> {
    pub db: &'a dyn ClientDatabase,
    pub providers: &'a StorageProviderConnections,
    pub messaging: &'a [Arc<dyn MessagingProvider>],
}

impl ConnectionCheck<'_> {
    /// Probe every network source and storage provider once.
    pub fn run(&self, ctx: &WorkerContext) -> Result<ConnectionReport, EngineError> {
        let mut report = ConnectionReport::default();

        let sources = self.db.get_source_locations()?;
        self.check_sources(ctx, &sources, &mut report);

        for (provider_type, provider) in self.providers.iter() {
            if ctx.is_stop_requested() {
                break;
            }
            if let Err(e) = provider.check_connectivity() {
                report.providers_failed += 1;
                let err = EngineError::Connectivity {
                    target: provider_type.to_string(),
                    message: e.to_string(),
                };
                warn!(provider = %provider_type, error = %err, "storage provider unreachable");
            }
        }

        debug!(
            sources = report.sources_checked,
            sources_failed = report.sources_failed,
            providers_failed = report.providers_failed,
            "connection check finished"
        );
        Ok(report)
    }

    /// Probe each network source in `sources`. A source whose result cannot
    /// be recorded is logged and skipped.
    fn check_sources(&self, ctx: &WorkerContext, sources: &SourceLocations, report: &mut ConnectionReport) {
        for source in sources.iter().filter(|s| s.is_network()) {
            if ctx.is_stop_requested() {
                return;
            }
            report.sources_checked += 1;
            match self.check_source(source) {
                Ok(true) => {}
                Ok(false) => report.sources_failed += 1,
                Err(e) => {
                    report.sources_failed += 1;
                    warn!(source_id = source.id, error = %e, "cannot record network source state");
                }
            }
        }
    }

    /// Probe one network source and record the result. Returns whether it
    /// is reachable.
    fn check_source(&self, source: &SourceLocation) -> Result<bool, EngineError> {
        let was_failed = source.is_unreachable();
        let probe = fs::read_dir(Path::new(&source.path));
        let reachable = probe.is_ok();

        self.db
            .set_network_source_state(source.id, reachable, !reachable, Utc::now())?;

        match probe {
            Ok(_) if was_failed => {
                info!(source_id = source.id, path = %source.path, "network source reachable again");
            }
            Ok(_) => {}
            Err(e) => {
                let err = EngineError::Connectivity {
                    target: source.path.clone(),
                    message: e.to_string(),
                };
                warn!(source_id = source.id, error = %err, "network source unreachable");
                if !was_failed {
                    self.notify_source_failed(source, &err);
                }
            }
        }

        Ok(reachable)
    }

    fn notify_source_failed(&self, source: &SourceLocation, err: &EngineError) {
        let subject = format!("Backup source location {} is unreachable", source.id);
        let body = format!(
            "The network source location '{}' could not be reached and will not be scanned until it recovers.\n\n{}",
            source.path, err
        );
        for messenger in self.messaging {
            if let Err(e) = messenger.send_message(&subject, &body) {
                warn!(source_id = source.id, error = %e, "failed to send notification");
            }
        }
    }
}

/// Background worker running `ConnectionCheck` every `connection_check_interval`.
pub struct ConnectionEngine {
    runtime: EngineRuntime,
    db: Arc<dyn ClientDatabase>,
    providers: StorageProviderConnections,
    messaging: Vec<Arc<dyn MessagingProvider>>,
}

impl ConnectionEngine {
    /// # Errors
    /// `EngineError::NoStorageProviders` if `providers` is empty. Messaging
    /// providers are optional.
    pub fn new(
        db: Arc<dyn ClientDatabase>,
        providers: StorageProviderConnections,
        messaging: Vec<Arc<dyn MessagingProvider>>,
        config: Arc<EngineConfig>,
        instance: EngineInstance,
    ) -> Result<Self, EngineError> {
        if providers.is_empty() {
            return Err(EngineError::NoStorageProviders);
        }
        Ok(ConnectionEngine {
            runtime: EngineRuntime::new("connection", instance, config),
            db,
            providers,
            messaging,
        })
    }
}

impl Engine for ConnectionEngine {
    fn begin_start(&mut self) -> Result<(), EngineError> {
        let db = Arc::clone(&self.db);
        let providers = self.providers.clone();
        let messaging = self.messaging.clone();

        self.runtime.begin_start(move |ctx| {
            let check = ConnectionCheck {
                db: db.as_ref(),
                providers: &providers,
                messaging: &messaging,
            };
            run_worker_loop(ctx, ctx.config.error_pause(), |ctx| {
                check.run(ctx)?;
                Ok(ctx.config.connection_check_interval())
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
