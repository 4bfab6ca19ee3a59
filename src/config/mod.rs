pub mod engine;
pub mod settings;
pub mod user;

pub use engine::{ConfigError, EngineProcessConfig, validate_password};
pub use settings::{EngineSettings, ReadinessSettings, ScriptSettings, Settings, SqlcmdSettings};
pub use user::{SettingsError, load_settings, load_settings_file, user_config_path};
