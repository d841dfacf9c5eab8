//! Shared lifecycle for background engines.
//!
//! Every engine (scan, backup, connection) runs its work on a dedicated
//! thread owned by an `EngineRuntime`. Starting returns immediately, stopping
//! only requests cancellation, and the worker reports why it ended through
//! an `EngineStopped` notification on a crossbeam channel.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Longest a worker sleeps before re-checking for a stop request.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Distinguishes concurrently running workers of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EngineInstance(pub u32);

impl fmt::Display for EngineInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token for cooperative cancellation of a worker.
///
/// Uses an AtomicBool internally. Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Why a worker ended.
#[derive(Debug, Clone)]
pub enum EngineStoppedReason {
    /// `begin_stop` was honored
    StopRequested,
    /// The worker finished its work on its own
    Completed,
    /// Unhandled error or panic
    Fault(Arc<EngineError>),
}

/// Notification emitted exactly once per worker run.
#[derive(Debug, Clone)]
pub struct EngineStopped {
    pub reason: EngineStoppedReason,
    pub instance: EngineInstance,
}

/// Everything a worker body needs, passed explicitly.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub instance: EngineInstance,
    pub token: CancellationToken,
    pub config: Arc<EngineConfig>,
}

impl WorkerContext {
    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sleep for `duration`, waking every `STOP_POLL_INTERVAL` to check for a
    /// stop request. Returns true if a stop was requested.
    pub fn sleep_with_stop_check(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stop_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }
}

/// Common interface of every background engine.
pub trait Engine: Send {
    /// Spawn the worker and return immediately.
    ///
    /// # Errors
    /// `EngineError::AlreadyStarted` if the worker is still running.
    fn begin_start(&mut self) -> Result<(), EngineError>;

    /// Request cooperative cancellation and return immediately. No-op if the
    /// engine is not running.
    fn begin_stop(&mut self);

    fn instance_id(&self) -> EngineInstance;

    /// Receiver for this engine's stop notifications.
    fn stopped(&self) -> Receiver<EngineStopped>;
}

/// Thread ownership, cancellation and stop notification shared by all engines.
pub struct EngineRuntime {
    name: &'static str,
    instance: EngineInstance,
    config: Arc<EngineConfig>,
    token: Option<CancellationToken>,
    running: Arc<AtomicBool>,
    stopped_tx: Sender<EngineStopped>,
    stopped_rx: Receiver<EngineStopped>,
}

impl EngineRuntime {
    pub fn new(name: &'static str, instance: EngineInstance, config: Arc<EngineConfig>) -> Self {
        let (stopped_tx, stopped_rx) = crossbeam_channel::unbounded();
        EngineRuntime {
            name,
            instance,
            config,
            token: None,
            running: Arc::new(AtomicBool::new(false)),
            stopped_tx,
            stopped_rx,
        }
    }

    pub fn instance(&self) -> EngineInstance {
        self.instance
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> Receiver<EngineStopped> {
        self.stopped_rx.clone()
    }

    /// Spawn `body` on a new worker thread.
    ///
    /// The body's result decides the stop reason: `Ok` after a stop request
    /// is `StopRequested`, `Ok` otherwise is `Completed`, and an error or a
    /// panic is `Fault`.
    pub fn begin_start<F>(&mut self, body: F) -> Result<(), EngineError>
    where
        F: FnOnce(&WorkerContext) -> Result<(), EngineError> + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted {
                instance: self.instance,
            });
        }

        let token = CancellationToken::new();
        let ctx = WorkerContext {
            instance: self.instance,
            token: token.clone(),
            config: Arc::clone(&self.config),
        };
        let name = self.name;
        let running = Arc::clone(&self.running);
        let stopped_tx = self.stopped_tx.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", name, self.instance))
            .spawn(move || {
                info!(engine = name, instance = %ctx.instance, "engine started");

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)));
                let reason = match outcome {
                    Ok(Ok(())) if ctx.is_stop_requested() => EngineStoppedReason::StopRequested,
                    Ok(Ok(())) => EngineStoppedReason::Completed,
                    Ok(Err(e)) => EngineStoppedReason::Fault(Arc::new(e)),
                    Err(payload) => EngineStoppedReason::Fault(Arc::new(EngineError::Panicked {
                        message: panic_message(payload.as_ref()),
                    })),
                };

                match &reason {
                    EngineStoppedReason::Fault(e) => {
                        error!(engine = name, instance = %ctx.instance, error = %e, "engine faulted")
                    }
                    other => {
                        info!(engine = name, instance = %ctx.instance, reason = ?other, "engine stopped")
                    }
                }

                running.store(false, Ordering::SeqCst);
                // Nobody listening is fine
                let _ = stopped_tx.send(EngineStopped {
                    reason,
                    instance: ctx.instance,
                });
            });

        match spawned {
            Ok(_) => {
                self.token = Some(token);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(EngineError::Spawn(e))
            }
        }
    }

    pub fn begin_stop(&mut self) {
        if let Some(token) = &self.token {
            if self.is_running() {
                info!(engine = self.name, instance = %self.instance, "stop requested");
            }
            token.cancel();
        }
    }
}

/// Repeat `iteration` until a stop is requested.
///
/// The iteration returns how long to pause before the next pass.
/// Recoverable errors are logged and followed by `error_pause`; any other
/// error ends the loop and becomes the worker's fault.
pub fn run_worker_loop<F>(
    ctx: &WorkerContext,
    error_pause: Duration,
    mut iteration: F,
) -> Result<(), EngineError>
where
    F: FnMut(&WorkerContext) -> Result<Duration, EngineError>,
{
    while !ctx.is_stop_requested() {
        let pause = match iteration(ctx) {
            Ok(pause) => pause,
            Err(e) if e.is_recoverable() => {
                warn!(instance = %ctx.instance, error = %e, "recoverable engine error");
                error_pause
            }
            Err(e) => return Err(e),
        };

        if ctx.sleep_with_stop_check(pause) {
            break;
        }
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
