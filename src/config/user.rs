//! Settings file discovery and loading.
//!
//! Default location: $XDG_CONFIG_HOME/sqlbuild/sqlbuild.toml
//! Fallback: the platform config directory (`~/.config` on Linux)

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Settings;

const APP_DIR: &str = "sqlbuild";
const FILE_NAME: &str = "sqlbuild.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Returns the path to the user settings file.
///
/// The path is determined by:
/// 1. If $XDG_CONFIG_HOME is set (and non-empty): $XDG_CONFIG_HOME/sqlbuild/sqlbuild.toml
/// 2. Otherwise: `dirs::config_dir()`/sqlbuild/sqlbuild.toml
///
/// Returns None if no config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_path_from(std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from))
}

fn user_config_path_from(xdg_config_home: Option<PathBuf>) -> Option<PathBuf> {
    xdg_config_home
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(dirs::config_dir)
        .map(|dir| dir.join(APP_DIR).join(FILE_NAME))
}

/// Parse a settings file.
pub fn load_settings_file(path: &Path) -> Result<Settings, SettingsError> {
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load settings from `explicit` if given, otherwise from the user config
/// path if that file exists, otherwise defaults.
///
/// An explicit path that cannot be read is an error; a missing default
/// file is not.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, SettingsError> {
    if let Some(path) = explicit {
        return load_settings_file(path);
    }
    match user_config_path() {
        Some(path) if path.is_file() => {
            log::debug!(
                target: "sqlbuild::config",
                "Loading settings from {}",
                path.display()
            );
            load_settings_file(&path)
        }
        _ => Ok(Settings::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn user_config_path_uses_xdg_config_home_when_set() {
        let path = user_config_path_from(Some(PathBuf::from("/custom/config")));
        assert_eq!(
            path,
            Some(PathBuf::from("/custom/config/sqlbuild/sqlbuild.toml")),
            "should use XDG_CONFIG_HOME/sqlbuild/sqlbuild.toml"
        );
    }

    #[test]
    fn user_config_path_ignores_empty_xdg_config_home() {
        let path = user_config_path_from(Some(PathBuf::new()));
        assert_eq!(path, dirs::config_dir().map(|d| d.join("sqlbuild/sqlbuild.toml")));
    }

    #[test]
    fn explicit_settings_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scripts]\nseparator = \"go\"").unwrap();

        let settings = load_settings(Some(file.path())).unwrap();
        assert_eq!(settings.scripts.separator, "go");
    }

    #[test]
    fn missing_explicit_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_settings(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(SettingsError::Read { .. })));
    }

    #[test]
    fn malformed_settings_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\n").unwrap();

        let err = load_settings(Some(file.path())).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
