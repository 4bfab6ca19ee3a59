//! [`Connection`] backed by a persistent `sqlcmd` session.
//!
//! Batches are written to sqlcmd's stdin, each followed by `GO` and a
//! `PRINT` of a fresh marker. Reading stdout up to the marker line means the
//! batch completed. sqlcmd runs with `-b`, so an error makes it exit and
//! stdout reaches EOF before the marker is seen.

use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use ulid::Ulid;

use crate::config::SqlcmdSettings;
use crate::engine::error::describe_exit;
use crate::engine::{BoundedOutputBuffer, ExitError, OutputCapture};
use crate::script::Connection;

/// Bytes of batch output kept on each side for error messages.
const OUTPUT_CAPACITY: usize = 16 << 10;

#[derive(Debug, Error)]
pub enum SqlcmdError {
    #[error("Failed to start {}: {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlcmd session I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlcmd exited with {status}:\n{output}")]
    Aborted { status: String, output: String },

    #[error("sqlcmd session is not open")]
    Closed,

    #[error("sqlcmd exited uncleanly: {0}")]
    Exit(#[from] ExitError),

    #[error("Line {line} of the batch is a sqlcmd command and would not reach the server: {text}")]
    CommandLine { line: usize, text: String },
}

/// Words sqlcmd acts on when they start a line, whatever follows them.
const COMMAND_WORDS: &[&str] = &["GO", "EXIT", "QUIT", "RESET", "ED"];

/// Find the first line of `batch` that sqlcmd would treat as a command
/// rather than pass to the server. Lines are numbered from 1.
pub fn find_command_line(batch: &str) -> Option<(usize, &str)> {
    batch
        .lines()
        .enumerate()
        .find(|(_, line)| is_command_line(line))
        .map(|(index, line)| (index + 1, line))
}

fn is_command_line(line: &str) -> bool {
    let line = line.trim();
    if line.starts_with(':') || line.starts_with("!!") {
        return true;
    }
    let word = line
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .next()
        .unwrap_or_default();
    COMMAND_WORDS.iter().any(|w| word.eq_ignore_ascii_case(w))
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: OutputCapture,
}

impl Session {
    /// Run `batch` and wait for its marker.
    async fn run(&mut self, batch: &str) -> Result<(), SqlcmdError> {
        let marker = Ulid::new().to_string();
        let mut input = String::with_capacity(batch.len() + marker.len() + 24);
        // Starts a fresh batch even if the input does not end in a newline.
        if !batch.is_empty() {
            input.push_str(batch);
            if !batch.ends_with('\n') {
                input.push('\n');
            }
            input.push_str("GO\n");
        }
        input.push_str(&format!("PRINT '{}'\nGO\n", marker));

        if let Err(e) = self.write(&input).await {
            // Broken pipe: sqlcmd already quit. Its output is still drained below.
            log::debug!(target: "sqlbuild::sqlcmd", "Writing batch failed: {}", e);
        }

        let mut output = BoundedOutputBuffer::new(OUTPUT_CAPACITY);
        loop {
            match self.stdout.next_line().await? {
                Some(line) if line.trim() == marker => return Ok(()),
                Some(line) => {
                    log::debug!(target: "sqlbuild::sqlcmd", "{}", line);
                    output.push(line.as_bytes());
                    output.push(b"\n");
                }
                None => return Err(self.aborted(output).await),
            }
        }
    }

    async fn write(&mut self, input: &str) -> std::io::Result<()> {
        self.stdin.write_all(input.as_bytes()).await?;
        self.stdin.flush().await
    }

    async fn aborted(&mut self, output: BoundedOutputBuffer) -> SqlcmdError {
        let status = describe_exit(&ExitError::from_wait(self.child.wait().await));
        let mut output = output.annotated();
        let stderr = self.stderr.annotated();
        if !stderr.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&stderr);
        }
        SqlcmdError::Aborted { status, output }
    }

    /// Close stdin and wait for sqlcmd to exit.
    async fn finish(self) -> Result<(), SqlcmdError> {
        let Session {
            mut child, stdin, ..
        } = self;
        drop(stdin);
        ExitError::from_wait(child.wait().await)?;
        Ok(())
    }
}

/// A `sqlcmd` process kept open across batches.
///
/// Batches go to sqlcmd's command interpreter, not straight to the server.
/// A line sqlcmd would act on itself (`GO 2`, `GO -- note`, `:r file`,
/// `!! cmd`, `EXIT`, `QUIT`, `RESET`, `ED`) is refused by [`exec`] with
/// [`SqlcmdError::CommandLine`] before anything is written, and the session
/// stays open.
///
/// [`exec`]: Connection::exec
pub struct SqlcmdConnection {
    executable: PathBuf,
    args: Vec<String>,
    session: Option<Session>,
}

impl SqlcmdConnection {
    pub async fn connect(settings: &SqlcmdSettings, password: &str) -> Result<Self, SqlcmdError> {
        let args = vec![
            "-S".to_string(),
            settings.host.clone(),
            "-U".to_string(),
            settings.user.clone(),
            "-P".to_string(),
            password.to_string(),
            "-l".to_string(),
            settings.login_timeout_secs.to_string(),
            // Exit on the first error.
            "-b".to_string(),
            // Scripts are sent verbatim, without $(var) substitution.
            "-x".to_string(),
        ];
        Self::connect_with(settings.executable.clone(), args).await
    }

    /// Open a session with an arbitrary sqlcmd-compatible command.
    pub async fn connect_with(
        executable: impl Into<PathBuf>,
        args: Vec<String>,
    ) -> Result<Self, SqlcmdError> {
        let mut conn = Self {
            executable: executable.into(),
            args,
            session: None,
        };
        conn.open().await?;
        Ok(conn)
    }

    /// Start a session and make sure it answers.
    async fn open(&mut self) -> Result<(), SqlcmdError> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SqlcmdError::Spawn {
                executable: self.executable.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SqlcmdError::Closed);
        };
        let stderr = OutputCapture::new(OUTPUT_CAPACITY);
        if let Some(pipe) = child.stderr.take() {
            stderr.pump(pipe);
        }

        let mut session = Session {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr,
        };
        session.run("").await?;
        log::debug!(
            target: "sqlbuild::sqlcmd",
            "sqlcmd session started (pid {:?})",
            session.child.id()
        );
        self.session = Some(session);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }
}

impl Connection for SqlcmdConnection {
    type Error = SqlcmdError;

    async fn exec(&mut self, batch: &str) -> Result<(), SqlcmdError> {
        let session = self.session.as_mut().ok_or(SqlcmdError::Closed)?;
        if let Some((line, text)) = find_command_line(batch) {
            return Err(SqlcmdError::CommandLine {
                line,
                text: text.trim().to_string(),
            });
        }
        let result = session.run(batch).await;
        if result.is_err() {
            // sqlcmd has exited or the pipe is broken; the session is unusable.
            self.session = None;
        }
        result
    }

    /// sqlcmd cannot reset a session in place, so a fresh one is started.
    async fn reset_session(&mut self) -> Result<(), SqlcmdError> {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.finish().await {
                log::warn!(
                    target: "sqlbuild::sqlcmd",
                    "Previous sqlcmd session ended badly: {}",
                    e
                );
            }
        }
        self.open().await
    }

    async fn close(mut self) -> Result<(), SqlcmdError> {
        match self.session.take() {
            Some(session) => session.finish().await,
            None => Ok(()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use rstest::rstest;

    /// Answers PRINT markers like sqlcmd and fails on any line with FAIL.
    const FAKE_SQLCMD: &str = r#"
echo "session $$" >&2
while IFS= read -r line; do
  case "$line" in
    "PRINT '"*) m=${line#"PRINT '"}; echo "${m%"'"}" ;;
    *FAIL*) echo "Msg 102, Level 15, State 1: Incorrect syntax near 'FAIL'."; exit 1 ;;
    GO) ;;
    *) echo "ran: $line" ;;
  esac
done
"#;

    async fn connect() -> SqlcmdConnection {
        SqlcmdConnection::connect_with("/bin/sh", vec!["-c".to_string(), FAKE_SQLCMD.to_string()])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn executes_batches_in_one_session() {
        let mut conn = connect().await;
        conn.exec("CREATE TABLE t (id int)\n").await.unwrap();
        conn.exec("INSERT INTO t VALUES (1)").await.unwrap();
        assert!(conn.is_open());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn failing_batch_reports_output_and_closes_session() {
        let mut conn = connect().await;
        conn.exec("SELECT 1\n").await.unwrap();

        match conn.exec("SELECT FAIL\n").await {
            Err(SqlcmdError::Aborted { status, output }) => {
                assert!(status.contains('1'), "{}", status);
                assert!(output.contains("Incorrect syntax near 'FAIL'."), "{}", output);
                assert!(!output.contains("ran: SELECT 1"), "{}", output);
            }
            other => panic!("expected Aborted, got {:?}", other),
        }
        assert!(!conn.is_open());
        assert!(matches!(conn.exec("SELECT 2\n").await, Err(SqlcmdError::Closed)));
    }

    #[rstest]
    #[case("GO 2")]
    #[case("go -- note")]
    #[case("  GO")]
    #[case(":r other.sql")]
    #[case(":setvar name value")]
    #[case("!! ls")]
    #[case("EXIT")]
    #[case("exit(SELECT 1)")]
    #[case("QUIT")]
    #[case("reset")]
    #[case("ED")]
    fn sqlcmd_commands_are_found(#[case] line: &str) {
        let batch = format!("SELECT 1\n{}\nSELECT 2", line);
        assert_eq!(find_command_line(&batch), Some((2, line)));
    }

    #[rstest]
    #[case("GOTO label")]
    #[case("SELECT ':r'")]
    #[case("PRINT 'GO'")]
    #[case("EXITS")]
    #[case("ED_notes")]
    #[case("-- :r in a comment")]
    #[case("SELECT 1 -- !! not first")]
    #[case("")]
    fn plain_sql_is_not_a_command(#[case] line: &str) {
        assert_eq!(find_command_line(line), None);
    }

    #[tokio::test]
    async fn batch_with_sqlcmd_command_is_refused_and_session_kept() {
        let mut conn = connect().await;

        match conn.exec("SELECT 1\nGO 2\n").await {
            Err(SqlcmdError::CommandLine { line, text }) => {
                assert_eq!(line, 2);
                assert_eq!(text, "GO 2");
            }
            other => panic!("expected CommandLine, got {:?}", other),
        }
        assert!(conn.is_open());
        conn.exec("SELECT 2\n").await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn reset_starts_a_fresh_session() {
        let mut conn = connect().await;
        assert!(conn.exec("SELECT FAIL\n").await.is_err());

        conn.reset_session().await.unwrap();
        conn.exec("SELECT 1\n").await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn login_failure_fails_connect() {
        let result = SqlcmdConnection::connect_with(
            "/bin/sh",
            vec!["-c".to_string(), "echo 'Login failed for user SA.'; exit 1".to_string()],
        )
        .await;
        match result {
            Err(SqlcmdError::Aborted { output, .. }) => {
                assert!(output.contains("Login failed"), "{}", output)
            }
            Err(other) => panic!("expected Aborted, got {:?}", other),
            Ok(_) => panic!("connect should fail"),
        }
    }
}
