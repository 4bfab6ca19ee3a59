//! The `exec` command: start the engine, run scripts, shut it down.

use std::path::{Path, PathBuf};

use crate::config::{EngineProcessConfig, Settings, load_settings};
use crate::engine::EngineProcess;
use crate::error::{SqlbuildError, SqlbuildResult};
use crate::script::{Connection, RunReport, ScriptRunner, collect_script_paths};
use crate::sqlcmd::SqlcmdConnection;

/// Run `paths` against a freshly started engine, configured from the
/// environment and the settings file.
pub async fn run(paths: &[PathBuf], settings_path: Option<&Path>) -> SqlbuildResult<RunReport> {
    let settings = load_settings(settings_path)?;
    let config = EngineProcessConfig::from_env()?;
    execute(&config, &settings, paths).await
}

/// Like [`run`], with configuration already resolved.
///
/// The engine is shut down whether or not the scripts succeed. A script
/// failure takes precedence over a shutdown failure in the returned error.
pub async fn execute(
    config: &EngineProcessConfig,
    settings: &Settings,
    paths: &[PathBuf],
) -> SqlbuildResult<RunReport> {
    let scripts = collect_script_paths(paths)?;
    if scripts.is_empty() {
        return Err(SqlbuildError::NoScripts);
    }
    log::info!(target: "sqlbuild::exec", "Executing {} scripts:", scripts.len());
    for script in &scripts {
        log::info!(target: "sqlbuild::exec", "  {}", script.display());
    }

    let engine = EngineProcess::start(config, settings).await?;
    let watchdog = engine.exit_on_unexpected_exit();

    let result = run_scripts(config, settings, &scripts).await;

    log::info!(target: "sqlbuild::exec", "Shutting down sql server...");
    let shutdown = engine.shutdown().await;
    watchdog.abort();

    match (result, shutdown) {
        (Ok(report), Ok(())) => Ok(report),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), shutdown) => {
            if let Err(shutdown) = shutdown {
                log::error!(
                    target: "sqlbuild::exec",
                    "Error shutting down sql server: {}",
                    shutdown
                );
            }
            Err(e)
        }
    }
}

async fn run_scripts(
    config: &EngineProcessConfig,
    settings: &Settings,
    scripts: &[PathBuf],
) -> SqlbuildResult<RunReport> {
    log::info!(target: "sqlbuild::exec", "Connecting to sql server...");
    let mut conn = SqlcmdConnection::connect(&settings.sqlcmd, config.password())
        .await
        .map_err(SqlbuildError::Connect)?;

    let result = ScriptRunner::new(settings.scripts.separator.clone())
        .run(scripts, &mut conn)
        .await;

    if let Err(e) = conn.close().await {
        log::warn!(target: "sqlbuild::exec", "Closing connection failed unexpectedly: {}", e);
    }

    let report = result?;
    log::info!(
        target: "sqlbuild::exec",
        "All scripts executed successfully! ({} batches in {:?})",
        report.total_batches(),
        report.elapsed()
    );
    Ok(report)
}
