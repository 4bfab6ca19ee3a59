//! Supervision of the engine process.
//!
//! An [`EngineProcess`] owns the spawned engine, its captured output and a
//! background task that waits for the process to exit. That task records
//! the outcome exactly once; `shutdown()` and every unexpected-exit
//! subscriber read the same record.
//!
//! Whether an exit was unexpected is decided by the exit task at the moment
//! it observes the exit, from the shutdown-requested flag. A subscriber
//! registered after the exit therefore sees the same verdict as one that
//! was registered before.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{ExitError, ExitOutcome, ShutdownError, StartupError, UnexpectedExitError};
use super::health::SqlcmdHealthCheck;
use super::output::OutputCapture;
use super::process::{CommandLauncher, ExitWait, Launcher, ProcessControl};
use super::readiness::{HealthCheck, ReadinessPoller};
use crate::config::{EngineProcessConfig, Settings};

/// Lifecycle of a started engine.
///
/// `Starting` and failed startups are never observable on an
/// [`EngineProcess`]: `start` either returns a ready engine or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    ShuttingDown,
    Exited,
}

#[derive(Debug, Clone)]
struct ExitRecord {
    outcome: ExitOutcome,
    /// Exit observed before any shutdown was requested.
    unexpected: bool,
}

/// One-shot exit completion that any number of tasks can await.
#[derive(Clone)]
struct ExitSignal {
    record: watch::Receiver<Option<ExitRecord>>,
    /// Cancelled once the record is set; used to stop the readiness poll.
    token: CancellationToken,
}

impl ExitSignal {
    fn peek(&self) -> Option<ExitRecord> {
        self.record.borrow().clone()
    }

    async fn wait(&self) -> ExitRecord {
        let mut record = self.record.clone();
        let seen = record
            .wait_for(Option::is_some)
            .await
            .map(|guard| guard.clone());
        match seen {
            Ok(Some(record)) => record,
            _ => Self::lost(),
        }
    }

    fn lost() -> ExitRecord {
        ExitRecord {
            outcome: Err(ExitError::MonitorLost),
            unexpected: false,
        }
    }
}

struct Shared {
    name: String,
    control: Arc<dyn ProcessControl>,
    output: OutputCapture,
    exit: ExitSignal,
    shutdown_requested: AtomicBool,
    /// Held while deciding whether to signal and while signalling.
    signal_lock: Mutex<()>,
}

impl Shared {
    fn unexpected_exit_error(&self, record: ExitRecord) -> Option<UnexpectedExitError> {
        record.unexpected.then(|| UnexpectedExitError {
            name: self.name.clone(),
            output: self.output.annotated(),
            exit: record.outcome,
        })
    }
}

/// A running engine that passed its readiness check.
pub struct EngineProcess {
    shared: Arc<Shared>,
}

impl EngineProcess {
    /// Start the engine described by `settings` and wait until `sqlcmd` can
    /// reach it.
    pub async fn start(
        config: &EngineProcessConfig,
        settings: &Settings,
    ) -> Result<Self, StartupError> {
        let launcher = CommandLauncher::from(&settings.engine);
        let check = SqlcmdHealthCheck::new(&settings.sqlcmd, config.password());
        let poller = ReadinessPoller::from(&settings.readiness);
        Self::start_with(
            &launcher,
            &check,
            &poller,
            &config.env(),
            settings.engine.output_capacity,
        )
        .await
    }

    /// Start a process through `launcher` and poll `check` until it is ready.
    ///
    /// If the process exits while polling, that exit is reported as the cause.
    /// If it stays up but never becomes ready, it is shut down first and both
    /// outcomes are reported.
    pub async fn start_with<L, H>(
        launcher: &L,
        check: &H,
        poller: &ReadinessPoller,
        env: &[(String, String)],
        output_capacity: usize,
    ) -> Result<Self, StartupError>
    where
        L: Launcher,
        H: HealthCheck + Sync,
    {
        let name = launcher.name().to_string();
        let output = OutputCapture::new(output_capacity);
        let started = Instant::now();

        log::info!(target: "sqlbuild::engine", "Starting {}...", name);
        let launched = launcher
            .launch(env, &output)
            .map_err(|source| StartupError::Spawn {
                name: name.clone(),
                source,
            })?;
        let engine = Self::supervise(name, launched.control, launched.exit, output);

        let poll = match poller.poll(check, &engine.shared.exit.token).await {
            Ok(()) => {
                log::info!(
                    target: "sqlbuild::engine",
                    "{} is ready after {:?}",
                    engine.shared.name,
                    started.elapsed()
                );
                return Ok(engine);
            }
            Err(poll) => poll,
        };
        let elapsed = started.elapsed();

        if let Some(record) = engine.shared.exit.peek() {
            return Err(StartupError::Exited {
                name: engine.shared.name.clone(),
                output: engine.shared.output.annotated(),
                elapsed,
                exit: record.outcome,
            });
        }

        log::warn!(
            target: "sqlbuild::engine",
            "{} did not become ready within {:?}, shutting it down",
            engine.shared.name,
            poller.deadline()
        );
        let shutdown = engine.shutdown().await;
        Err(StartupError::Unreachable {
            name: engine.shared.name.clone(),
            output: engine.shared.output.annotated(),
            elapsed,
            shutdown,
            poll,
        })
    }

    fn supervise(
        name: String,
        control: Arc<dyn ProcessControl>,
        exit: ExitWait,
        output: OutputCapture,
    ) -> Self {
        let (record_tx, record_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            name,
            control,
            output,
            exit: ExitSignal {
                record: record_rx,
                token: CancellationToken::new(),
            },
            shutdown_requested: AtomicBool::new(false),
            signal_lock: Mutex::new(()),
        });

        let monitor_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let outcome = exit.await;
            let unexpected = !monitor_shared.shutdown_requested.load(Ordering::SeqCst);
            if unexpected {
                log::warn!(
                    target: "sqlbuild::engine",
                    "{} exited without a shutdown request",
                    monitor_shared.name
                );
            } else {
                log::debug!(
                    target: "sqlbuild::engine",
                    "{} exited after shutdown request",
                    monitor_shared.name
                );
            }
            record_tx.send_replace(Some(ExitRecord {
                outcome,
                unexpected,
            }));
            monitor_shared.exit.token.cancel();
        });

        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.control.pid()
    }

    /// Captured stdout/stderr so far.
    pub fn output(&self) -> String {
        self.shared.output.annotated()
    }

    /// Whether the exit has been recorded.
    pub fn exited(&self) -> bool {
        self.shared.exit.peek().is_some()
    }

    pub fn state(&self) -> EngineState {
        if self.exited() {
            EngineState::Exited
        } else if self.shared.shutdown_requested.load(Ordering::SeqCst) {
            EngineState::ShuttingDown
        } else {
            EngineState::Running
        }
    }

    /// Wait for the process to exit, without asking it to.
    pub async fn await_exit(&self) -> ExitOutcome {
        self.shared.exit.wait().await.outcome
    }

    /// Ask the engine to terminate and wait for it to do so.
    ///
    /// Idempotent: once SIGTERM has been delivered it is not sent again, and
    /// every call returns the same recorded exit outcome. A failed delivery
    /// is returned to the caller that attempted it; the next caller tries
    /// again.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        {
            let _signalling = self.shared.signal_lock.lock().await;

            if let Some(record) = self.shared.exit.peek() {
                return record.outcome.map_err(ShutdownError::from);
            }

            if !self.shared.shutdown_requested.swap(true, Ordering::SeqCst) {
                log::info!(target: "sqlbuild::engine", "Sending SIGTERM to {}", self.shared.name);
                if let Err(source) = self.shared.control.send_terminate() {
                    if self.shared.control.is_alive() {
                        self.shared.shutdown_requested.store(false, Ordering::SeqCst);
                        return Err(ShutdownError::Signal {
                            name: self.shared.name.clone(),
                            source,
                        });
                    }
                    log::debug!(
                        target: "sqlbuild::engine",
                        "{} was already gone when signalled: {}",
                        self.shared.name,
                        source
                    );
                }
            }
        }

        self.await_exit().await.map_err(ShutdownError::from)
    }

    /// Subscribe to an unexpected exit.
    ///
    /// The returned handle resolves to `Some` only if the engine exited
    /// before a shutdown was requested.
    pub fn subscribe_unexpected_exit(&self) -> UnexpectedExit {
        UnexpectedExit {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run `callback` on its own task if the engine exits unexpectedly.
    pub fn on_unexpected_exit<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(UnexpectedExitError) + Send + 'static,
    {
        let subscription = self.subscribe_unexpected_exit();
        tokio::spawn(async move {
            if let Some(err) = subscription.wait().await {
                callback(err);
            }
        })
    }

    /// Terminate the whole program with status 1 if the engine dies on its own.
    pub fn exit_on_unexpected_exit(&self) -> JoinHandle<()> {
        self.on_unexpected_exit(|err| {
            log::error!(target: "sqlbuild::engine", "{}", err);
            std::process::exit(1);
        })
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if !self.exited() && !self.shared.shutdown_requested.load(Ordering::SeqCst) {
            log::warn!(
                target: "sqlbuild::engine",
                "{} handle dropped while the process is still running",
                self.shared.name
            );
        }
    }
}

/// Pending unexpected-exit notification.
pub struct UnexpectedExit {
    shared: Arc<Shared>,
}

impl UnexpectedExit {
    /// Resolve once the engine has exited: `Some` if it was unexpected.
    pub async fn wait(self) -> Option<UnexpectedExitError> {
        let record = self.shared.exit.wait().await;
        self.shared.unexpected_exit_error(record)
    }
}
