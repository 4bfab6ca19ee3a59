//! Sequential execution of scripts against a [`Connection`].
//!
//! Batches run strictly in order. The first failing batch ends the whole
//! run: nothing after it is attempted, and the error keeps the batch text
//! and its position so the partially applied database can be inspected.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use super::loader::{LoadError, Script, script_name};

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A database session that executes batches.
pub trait Connection {
    type Error: StdError + Send + Sync + 'static;

    /// Execute one batch as a single unit of work.
    fn exec(&mut self, batch: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Clear session-local state (temporary objects, SET options, ...).
    fn reset_session(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn close(self) -> impl Future<Output = Result<(), Self::Error>> + Send
    where
        Self: Sized;
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("[{name}]: Error loading batches: {source}")]
    Load {
        name: String,
        #[source]
        source: LoadError,
    },

    #[error("Error resetting session between scripts: {source}")]
    ResetSession {
        #[source]
        source: BoxError,
    },

    #[error(
        "--------------- QUERY ---------------\n\
         {batch}\n\
         -------------------------------------\n\
         Error executing query in {path:?}, batch #{index}/{count}:\n\
         {source}"
    )]
    Batch {
        script: String,
        path: PathBuf,
        index: usize,
        count: usize,
        batch: String,
        #[source]
        source: BoxError,
    },
}

/// Timing of one completed script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptReport {
    pub name: String,
    pub path: PathBuf,
    pub batches: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub scripts: Vec<ScriptReport>,
}

impl RunReport {
    pub fn total_batches(&self) -> usize {
        self.scripts.iter().map(|s| s.batches).sum()
    }

    pub fn elapsed(&self) -> Duration {
        self.scripts.iter().map(|s| s.elapsed).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    separator: String,
}

impl ScriptRunner {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    /// Run `paths` in order on `conn`, resetting the session between
    /// scripts. The connection is left open.
    pub async fn run<C>(&self, paths: &[PathBuf], conn: &mut C) -> Result<RunReport, ExecutionError>
    where
        C: Connection,
    {
        let mut report = RunReport::default();
        for (n, path) in paths.iter().enumerate() {
            if n > 0 {
                conn.reset_session()
                    .await
                    .map_err(|e| ExecutionError::ResetSession {
                        source: Box::new(e),
                    })?;
            }
            report.scripts.push(self.run_script(path, conn).await?);
        }
        Ok(report)
    }

    async fn run_script<C>(&self, path: &Path, conn: &mut C) -> Result<ScriptReport, ExecutionError>
    where
        C: Connection,
    {
        let name = script_name(path);
        let script = Script::load(path, &self.separator).map_err(|source| ExecutionError::Load {
            name: name.clone(),
            source,
        })?;

        log::info!(target: "sqlbuild::runner", "[{}]: {} batches", name, script.batches.len());

        let start = Instant::now();
        for batch in &script.batches {
            let complete = 100 * (batch.index - 1) / batch.count;
            log::info!(
                target: "sqlbuild::runner",
                "[{}]: {:5}/{:<5} {:3}%",
                name,
                batch.index,
                batch.count,
                complete
            );
            if batch.is_empty() {
                log::debug!(
                    target: "sqlbuild::runner",
                    "[{}]: batch {} is empty, skipping",
                    name,
                    batch.index
                );
                continue;
            }
            if let Err(e) = conn.exec(&batch.text).await {
                return Err(ExecutionError::Batch {
                    script: name,
                    path: script.path.clone(),
                    index: batch.index,
                    count: batch.count,
                    batch: batch.text.clone(),
                    source: Box::new(e),
                });
            }
        }

        let elapsed = start.elapsed();
        log::info!(target: "sqlbuild::runner", "[{}]: completed in {:?}", name, elapsed);
        Ok(ScriptReport {
            name,
            path: script.path,
            batches: script.batches.len(),
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct FakeError(String);

    /// Records every call; fails any batch containing `FAIL`.
    #[derive(Default)]
    struct FakeConnection {
        calls: Vec<String>,
        fail_reset: bool,
    }

    impl Connection for FakeConnection {
        type Error = FakeError;

        async fn exec(&mut self, batch: &str) -> Result<(), FakeError> {
            self.calls.push(batch.trim().to_string());
            if batch.contains("FAIL") {
                Err(FakeError("Incorrect syntax near 'FAIL'.".to_string()))
            } else {
                Ok(())
            }
        }

        async fn reset_session(&mut self) -> Result<(), FakeError> {
            self.calls.push("<reset>".to_string());
            if self.fail_reset {
                Err(FakeError("connection lost".to_string()))
            } else {
                Ok(())
            }
        }

        async fn close(self) -> Result<(), FakeError> {
            Ok(())
        }
    }

    fn script(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[tokio::test]
    async fn stops_at_first_failing_batch() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            script(dir.path(), "A.sql", "A1\nGO\nA2\nGO\nA3\n"),
            script(dir.path(), "B.sql", "B1\nGO\nB2 FAIL\n"),
            script(dir.path(), "C.sql", "C1\n"),
        ];
        let mut conn = FakeConnection::default();

        let err = ScriptRunner::new("GO").run(&paths, &mut conn).await.unwrap_err();

        assert_eq!(conn.calls, vec!["A1", "A2", "A3", "<reset>", "B1", "B2 FAIL"]);
        match &err {
            ExecutionError::Batch {
                script,
                index,
                count,
                batch,
                ..
            } => {
                assert_eq!(script, "B");
                assert_eq!((*index, *count), (2, 2));
                assert_eq!(batch, "B2 FAIL\n");
            }
            other => panic!("expected batch failure, got {:?}", other),
        }
        let text = err.to_string();
        assert!(text.starts_with("--------------- QUERY ---------------\nB2 FAIL\n"), "{}", text);
        assert!(text.contains("batch #2/2:\nIncorrect syntax near 'FAIL'."), "{}", text);
    }

    #[tokio::test]
    async fn reports_each_completed_script() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            script(dir.path(), "schema.sql", "S1\nGO\nS2\nGO\n"),
            script(dir.path(), "data.sql", "D1\n"),
        ];
        let mut conn = FakeConnection::default();

        let report = ScriptRunner::new("GO").run(&paths, &mut conn).await.unwrap();

        let names: Vec<_> = report.scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["schema", "data"]);
        assert_eq!(report.total_batches(), 3);
        assert_eq!(conn.calls.iter().filter(|c| *c == "<reset>").count(), 1);
    }

    #[tokio::test]
    async fn empty_batches_are_skipped_without_renumbering() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![script(dir.path(), "a.sql", "X1\nGO\nGO\nX3 FAIL\n")];
        let mut conn = FakeConnection::default();

        let err = ScriptRunner::new("GO").run(&paths, &mut conn).await.unwrap_err();

        assert_eq!(conn.calls, vec!["X1", "X3 FAIL"]);
        assert!(matches!(err, ExecutionError::Batch { index: 3, count: 3, .. }));
    }

    #[tokio::test]
    async fn reset_failure_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            script(dir.path(), "a.sql", "A1\n"),
            script(dir.path(), "b.sql", "B1\n"),
        ];
        let mut conn = FakeConnection {
            fail_reset: true,
            ..Default::default()
        };

        let err = ScriptRunner::new("GO").run(&paths, &mut conn).await.unwrap_err();

        assert!(matches!(err, ExecutionError::ResetSession { .. }));
        assert_eq!(conn.calls, vec!["A1", "<reset>"]);
    }

    #[tokio::test]
    async fn unreadable_script_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().join("vanished.sql")];
        let mut conn = FakeConnection::default();

        let err = ScriptRunner::new("GO").run(&paths, &mut conn).await.unwrap_err();

        assert!(matches!(err, ExecutionError::Load { ref name, .. } if name == "vanished"));
        assert!(conn.calls.is_empty());
    }
}
