//! Engine process configuration derived from the environment.

use std::fmt;

use thiserror::Error;

/// Environment variable that must be `Y` for the engine to run
/// non-interactively.
pub const ACCEPT_EULA_VAR: &str = "ACCEPT_EULA";
/// Environment variable carrying the administrator password.
pub const PASSWORD_VAR: &str = "SA_PASSWORD";
/// Optional environment variable selecting the product edition.
pub const PRODUCT_ID_VAR: &str = "MSSQL_PID";

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;

/// Configuration problems detected before any process is started.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Environment variable ACCEPT_EULA must be Y.")]
    EulaNotAccepted,

    #[error("Required environment variable SA_PASSWORD was not set.")]
    MissingPassword,

    #[error("Password in SA_PASSWORD was invalid: Password too short")]
    PasswordTooShort,

    #[error("Password in SA_PASSWORD was invalid: Password too long")]
    PasswordTooLong,
}

/// Check password length against the engine's accepted range.
///
/// The engine enforces more rules than this (character classes and so on),
/// but those surface anyway once the readiness probe fails to log in.
pub fn validate_password(password: &str) -> Result<(), ConfigError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(ConfigError::PasswordTooShort);
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ConfigError::PasswordTooLong);
    }
    Ok(())
}

/// Validated settings the engine process is spawned with.
#[derive(Clone, PartialEq, Eq)]
pub struct EngineProcessConfig {
    password: String,
    product_id: Option<String>,
}

impl EngineProcessConfig {
    /// Build a config, validating the password.
    pub fn new(
        password: impl Into<String>,
        product_id: Option<String>,
    ) -> Result<Self, ConfigError> {
        let password = password.into();
        validate_password(&password)?;
        Ok(Self {
            password,
            product_id: product_id.filter(|pid| !pid.is_empty()),
        })
    }

    /// Read the config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the config through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup(ACCEPT_EULA_VAR).as_deref() != Some("Y") {
            return Err(ConfigError::EulaNotAccepted);
        }
        let password = lookup(PASSWORD_VAR)
            .filter(|pw| !pw.is_empty())
            .ok_or(ConfigError::MissingPassword)?;
        Self::new(password, lookup(PRODUCT_ID_VAR))
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Environment the engine process is started with.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (ACCEPT_EULA_VAR.to_string(), "Y".to_string()),
            (PASSWORD_VAR.to_string(), self.password.clone()),
        ];
        if let Some(pid) = &self.product_id {
            env.push((PRODUCT_ID_VAR.to_string(), pid.clone()));
        }
        env
    }
}

impl fmt::Debug for EngineProcessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineProcessConfig")
            .field("password", &"<redacted>")
            .field("product_id", &self.product_id)
            .finish()
    }
}
