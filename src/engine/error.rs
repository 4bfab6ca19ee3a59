//! Error types for engine supervision.
//!
//! Startup and unexpected-exit errors embed the engine's captured output
//! between banner lines so that a failing CI log carries everything needed
//! to diagnose the problem.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// How the engine process ended.
pub type ExitOutcome = Result<(), ExitError>;

/// Non-success exit of a supervised process.
///
/// Cloneable so the same recorded outcome can be handed to every caller of
/// `shutdown()` and every unexpected-exit subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExitError {
    /// The process exited with a non-zero status or was killed by a signal.
    #[error("{0}")]
    Status(ExitStatus),

    /// Waiting on the process failed.
    #[error("failed to wait for process: {0}")]
    Wait(String),

    /// The exit monitor went away without recording an outcome.
    #[error("exit monitor stopped before the process exit was recorded")]
    MonitorLost,
}

impl ExitError {
    /// Map a wait result to an outcome: zero status is success.
    pub fn from_wait(result: io::Result<ExitStatus>) -> ExitOutcome {
        match result {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(ExitError::Status(status)),
            Err(e) => Err(ExitError::Wait(e.to_string())),
        }
    }
}

/// Render an exit outcome the way diagnostics print it.
pub fn describe_exit(outcome: &ExitOutcome) -> String {
    match outcome {
        Ok(()) => "<nil>".to_string(),
        Err(e) => e.to_string(),
    }
}

/// Frames `output` under a title built from the uppercased process name,
/// e.g. `---------- SQLSERVR OUTPUT ----------` for `sqlservr`.
fn banner(name: &str, output: &str) -> String {
    let title = format!("---------- {} OUTPUT ----------", name.to_uppercase());
    let rule = "-".repeat(title.len());
    format!("{}\n{}\n{}", title, output, rule)
}

/// Why a single health-check attempt failed.
#[derive(Debug, Error)]
pub enum HealthCheckFailure {
    #[error("failed to spawn: {0}")]
    Spawn(#[source] io::Error),

    #[error("{0}")]
    Status(ExitStatus),

    #[error("failed to wait: {0}")]
    Wait(#[source] io::Error),

    #[error("attempt cancelled")]
    Cancelled,
}

/// A failed readiness probe together with the probe's own output.
#[derive(Debug, Error)]
#[error(
    "{probe} ping failed with error: {failure}\n{}",
    banner(.probe, .output)
)]
pub struct HealthCheckError {
    pub probe: String,
    #[source]
    pub failure: HealthCheckFailure,
    pub output: String,
}

impl HealthCheckError {
    pub fn new(probe: impl Into<String>, failure: HealthCheckFailure, output: String) -> Self {
        Self {
            probe: probe.into(),
            failure,
            output,
        }
    }
}

/// Outcome of a readiness poll that never saw the engine come online.
#[derive(Debug, Error)]
pub enum PollError {
    /// Cancellation was observed between attempts.
    #[error("readiness poll cancelled")]
    Cancelled,

    /// The deadline passed; carries the most recent failure.
    #[error(transparent)]
    Unhealthy(#[from] HealthCheckError),
}

/// The termination signal could not be delivered, or the process exited
/// with a failure.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Sending SIGTERM to {name} failed unexpectedly: {source}")]
    Signal {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Exit(#[from] ExitError),
}

/// Render a shutdown result the way diagnostics print it.
pub fn describe_shutdown(result: &Result<(), ShutdownError>) -> String {
    match result {
        Ok(()) => "<nil>".to_string(),
        Err(e) => e.to_string(),
    }
}

/// The engine could not be brought online.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The process died while we were waiting for it; its exit is causal.
    #[error(
        "{}\nFailed to start {name}: process exited after {elapsed:?}.\n\
         Process stdout/stderr printed above.\n\
         ExitError: {}",
        banner(.name, .output),
        describe_exit(.exit)
    )]
    Exited {
        name: String,
        output: String,
        elapsed: Duration,
        exit: ExitOutcome,
    },

    /// The process stayed up but never answered the readiness probe.
    #[error(
        "{}\nFailed to start {name}: connection failed after {elapsed:?}.\n\
         Process stdout/stderr printed above.\n\
         ShutdownError: {}\n\
         ConnectError: {poll}",
        banner(.name, .output),
        describe_shutdown(.shutdown)
    )]
    Unreachable {
        name: String,
        output: String,
        elapsed: Duration,
        shutdown: Result<(), ShutdownError>,
        #[source]
        poll: PollError,
    },
}

/// The engine exited before anyone asked it to.
#[derive(Debug, Clone)]
pub struct UnexpectedExitError {
    pub name: String,
    pub output: String,
    pub exit: ExitOutcome,
}

impl fmt::Display for UnexpectedExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n{} process exited unexpectedly!!!\nError: {}",
            banner(&self.name, &self.output),
            self.name,
            describe_exit(&self.exit)
        )
    }
}

impl std::error::Error for UnexpectedExitError {}
