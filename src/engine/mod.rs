//! Engine lifecycle: spawn, readiness, supervision and shutdown.

pub mod error;
pub mod health;
pub mod output;
pub mod process;
pub mod readiness;
pub mod supervisor;

pub use error::{
    ExitError, ExitOutcome, HealthCheckError, HealthCheckFailure, PollError, ShutdownError,
    StartupError, UnexpectedExitError,
};
pub use health::SqlcmdHealthCheck;
pub use output::{BoundedOutputBuffer, OutputCapture};
pub use process::{CommandLauncher, LaunchedProcess, Launcher, ProcessControl};
pub use readiness::{HealthCheck, ReadinessPoller};
pub use supervisor::{EngineProcess, EngineState, UnexpectedExit};
