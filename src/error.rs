//! Error handling types for sqlbuild
//!
//! Each layer has its own error type; [`SqlbuildError`] is what a full
//! `exec` run returns.

use std::sync::PoisonError;
use thiserror::Error;

use crate::config::{ConfigError, SettingsError};
use crate::engine::{ShutdownError, StartupError};
use crate::script::{ExecutionError, LoadError};
use crate::sqlcmd::SqlcmdError;

/// Failure of an `exec` run.
#[derive(Debug, Error)]
pub enum SqlbuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Nothing to execute")]
    NoScripts,

    #[error("Error starting sql server:\n{0}")]
    Startup(#[from] StartupError),

    #[error("Error creating connection to server instance: {0}")]
    Connect(#[source] SqlcmdError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Error shutting down sql server: {0}")]
    Shutdown(#[from] ShutdownError),
}

pub type SqlbuildResult<T> = Result<T, SqlbuildError>;

/// Recover the guard from a poisoned lock.
pub trait LockResultExt<T> {
    /// Take the guard even if another thread panicked while holding it.
    ///
    /// The context parameter identifies which lock was recovered.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "sqlbuild::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
