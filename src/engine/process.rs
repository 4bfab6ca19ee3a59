//! Process seam for the supervisor.
//!
//! The supervisor only needs four things from a process: start it, ask
//! whether it is alive, send it a termination signal, and wait for it to
//! exit. [`Launcher`] and [`ProcessControl`] capture exactly that so the
//! supervisor logic can run against a fake process in tests.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::Command;

use super::error::{ExitError, ExitOutcome};
use super::output::OutputCapture;
use crate::config::EngineSettings;

/// Future resolving once the process has exited.
pub type ExitWait = Pin<Box<dyn Future<Output = ExitOutcome> + Send + 'static>>;

/// Control half of a running process.
pub trait ProcessControl: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    /// Ask the process to terminate gracefully (SIGTERM on Unix).
    fn send_terminate(&self) -> io::Result<()>;
}

/// A freshly started process, split into its control half and its exit wait.
pub struct LaunchedProcess {
    pub control: Arc<dyn ProcessControl>,
    pub exit: ExitWait,
}

/// Starts engine processes.
pub trait Launcher {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Start the process with exactly `env` as its environment, sending
    /// both stdout and stderr into `output`.
    fn launch(
        &self,
        env: &[(String, String)],
        output: &OutputCapture,
    ) -> io::Result<LaunchedProcess>;
}

/// [`Launcher`] backed by `tokio::process::Command`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    name: String,
    executable: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let executable = executable.into();
        let name = executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.display().to_string());
        Self {
            name,
            executable,
            args,
        }
    }
}

impl From<&EngineSettings> for CommandLauncher {
    fn from(settings: &EngineSettings) -> Self {
        Self::new(settings.executable.clone(), settings.args.clone())
    }
}

impl Launcher for CommandLauncher {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(
        &self,
        env: &[(String, String)],
        output: &OutputCapture,
    ) -> io::Result<LaunchedProcess> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pumps: Vec<_> = [
            child.stdout.take().map(|stdout| output.pump(stdout)),
            child.stderr.take().map(|stderr| output.pump(stderr)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let control = Arc::new(ChildControl {
            pid: child.id(),
            exited: AtomicBool::new(false),
        });

        log::debug!(
            target: "sqlbuild::engine",
            "Spawned {} (pid {:?})",
            self.name,
            control.pid
        );

        let exit_control = Arc::clone(&control);
        let exit = Box::pin(async move {
            let result = child.wait().await;
            exit_control.exited.store(true, Ordering::SeqCst);
            // Collect the last of stdout/stderr before the exit is reported.
            for pump in pumps {
                let _ = pump.await;
            }
            ExitError::from_wait(result)
        });

        Ok(LaunchedProcess { control, exit })
    }
}

/// Signals a child by pid. Once the exit has been reaped the pid may be
/// reused, so no signal is sent after that.
struct ChildControl {
    pid: Option<u32>,
    exited: AtomicBool,
}

impl ProcessControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst) && self.pid.is_some()
    }

    fn send_terminate(&self) -> io::Result<()> {
        if !self.is_alive() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "process has already exited",
            ));
        }
        let pid = self
            .pid
            .ok_or_else(|| io::Error::other("process has no pid"))?;
        terminate(pid)
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(io::Error::other)?;
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination requires a Unix platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandLauncher {
        CommandLauncher::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn launch_captures_stdout_and_stderr() {
        let output = OutputCapture::new(1024);
        let launched = sh("echo out; echo err 1>&2").launch(&[], &output).unwrap();

        assert_eq!(launched.exit.await, Ok(()));
        let captured = output.snapshot();
        assert!(captured.contains("out"), "{}", captured);
        assert!(captured.contains("err"), "{}", captured);
    }

    #[tokio::test]
    async fn launch_passes_only_the_given_environment() {
        let output = OutputCapture::new(1024);
        let env = vec![("ACCEPT_EULA".to_string(), "Y".to_string())];
        let launched = sh("echo \"eula=$ACCEPT_EULA home=$HOME\"")
            .launch(&env, &output)
            .unwrap();

        launched.exit.await.unwrap();
        assert_eq!(output.snapshot(), "eula=Y home=");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let output = OutputCapture::new(1024);
        let launched = sh("exit 3").launch(&[], &output).unwrap();

        match launched.exit.await {
            Err(ExitError::Status(status)) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected exit status 3, got {:?}", other),
        }
        assert!(!launched.control.is_alive());
    }

    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let output = OutputCapture::new(1024);
        let path = std::env::var("PATH").unwrap_or_default();
        let launched = sh("trap 'exit 0' TERM; while true; do sleep 0.05; done")
            .launch(&[("PATH".to_string(), path)], &output)
            .unwrap();
        // Give the shell a moment to install its trap.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert!(launched.control.is_alive());
        launched.control.send_terminate().unwrap();
        assert_eq!(launched.exit.await, Ok(()));
        assert!(launched.control.send_terminate().is_err());
    }

    #[tokio::test]
    async fn missing_executable_fails_to_launch() {
        let output = OutputCapture::new(1024);
        let result = CommandLauncher::new("/nonexistent/sqlservr-xyz123", Vec::new())
            .launch(&[], &output);
        assert!(result.is_err());
    }
}
