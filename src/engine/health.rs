//! `sqlcmd`-based readiness probe.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::error::{HealthCheckError, HealthCheckFailure};
use super::output::OutputCapture;
use super::readiness::HealthCheck;
use crate::config::SqlcmdSettings;

const PROBE_NAME: &str = "sqlcmd";
const PROBE_QUERY: &str = "SET NOCOUNT ON; \
    SELECT CASE WHEN DATABASEPROPERTYEX(N'master', 'Collation') IS NULL \
    THEN 'FALSE' ELSE 'TRUE' END;";
/// Probe output is short; this is plenty for an error message.
const PROBE_OUTPUT_CAPACITY: usize = 4 << 10;

/// Asks `sqlcmd` whether `master` is online.
#[derive(Clone)]
pub struct SqlcmdHealthCheck {
    executable: PathBuf,
    args: Vec<String>,
}

impl SqlcmdHealthCheck {
    pub fn new(settings: &SqlcmdSettings, password: &str) -> Self {
        let args = vec![
            "-S".to_string(),
            settings.host.clone(),
            "-U".to_string(),
            settings.user.clone(),
            "-P".to_string(),
            password.to_string(),
            "-l".to_string(),
            settings.login_timeout_secs.to_string(),
            "-t".to_string(),
            settings.query_timeout_secs.to_string(),
            "-h".to_string(),
            "-1".to_string(),
            "-Q".to_string(),
            PROBE_QUERY.to_string(),
        ];
        Self {
            executable: settings.executable.clone(),
            args,
        }
    }

    /// Probe with an arbitrary command, for tests and non-default tooling.
    pub fn with_command(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }

    async fn run(
        &self,
        token: &CancellationToken,
        output: &OutputCapture,
    ) -> Result<(), HealthCheckFailure> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(HealthCheckFailure::Spawn)?;

        let pumps: Vec<_> = [
            child.stdout.take().map(|stdout| output.pump(stdout)),
            child.stderr.take().map(|stderr| output.pump(stderr)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let status = tokio::select! {
            status = child.wait() => status.map_err(HealthCheckFailure::Wait)?,
            _ = token.cancelled() => {
                if let Err(e) = child.start_kill() {
                    log::debug!(
                        target: "sqlbuild::readiness",
                        "Failed to kill sqlcmd probe: {}",
                        e
                    );
                }
                let _ = child.wait().await;
                for pump in pumps {
                    let _ = pump.await;
                }
                return Err(HealthCheckFailure::Cancelled);
            }
        };

        for pump in pumps {
            let _ = pump.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(HealthCheckFailure::Status(status))
        }
    }
}

impl std::fmt::Debug for SqlcmdHealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Arguments carry the password.
        f.debug_struct("SqlcmdHealthCheck")
            .field("executable", &self.executable)
            .finish_non_exhaustive()
    }
}

impl HealthCheck for SqlcmdHealthCheck {
    async fn check(&self, token: CancellationToken) -> Result<(), HealthCheckError> {
        let output = OutputCapture::new(PROBE_OUTPUT_CAPACITY);
        self.run(&token, &output)
            .await
            .map_err(|failure| HealthCheckError::new(PROBE_NAME, failure, output.annotated()))
    }
}
