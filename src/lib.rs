pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod script;
pub mod sqlcmd;

pub use config::{EngineProcessConfig, Settings};
pub use engine::{EngineProcess, EngineState};
pub use error::{SqlbuildError, SqlbuildResult};
pub use script::{Connection, ScriptRunner};
pub use sqlcmd::SqlcmdConnection;
