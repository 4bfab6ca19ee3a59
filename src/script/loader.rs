//! Script discovery and loading.

use std::path::{Path, PathBuf};

use path_clean::PathClean;
use thiserror::Error;

use super::batch::Batch;

const SCRIPT_EXTENSION: &str = "sql";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Cannot access {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot list directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read script {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Expand command-line arguments into the ordered list of scripts to run.
///
/// Files are taken as given. A directory contributes the `.sql` files
/// directly inside it, sorted by path; subdirectories are not descended.
pub fn collect_script_paths<P: AsRef<Path>>(args: &[P]) -> Result<Vec<PathBuf>, LoadError> {
    let mut paths = Vec::new();
    for arg in args {
        let path = arg.as_ref().clean();
        let metadata = std::fs::metadata(&path).map_err(|source| LoadError::Stat {
            path: path.clone(),
            source,
        })?;
        if metadata.is_dir() {
            paths.extend(scripts_in_dir(&path)?);
        } else {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn scripts_in_dir(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let read_dir_err = |source| LoadError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_dir_err)? {
        let entry = entry.map_err(read_dir_err)?;
        let is_dir = entry.file_type().map_err(read_dir_err)?.is_dir();
        let path = entry.path();
        if !is_dir && is_script(&path) {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}

fn is_script(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(SCRIPT_EXTENSION))
}

/// A script split into batches.
#[derive(Debug, Clone)]
pub struct Script {
    pub path: PathBuf,
    /// File name without directories or extension.
    pub name: String,
    pub batches: Vec<Batch>,
}

impl Script {
    pub fn load(path: &Path, separator: &str) -> Result<Script, LoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Script {
            path: path.to_path_buf(),
            name: script_name(path),
            batches: Batch::from_script_text(&text, separator),
        })
    }
}

pub fn script_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
