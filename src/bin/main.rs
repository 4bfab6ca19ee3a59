use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Start a local SQL Server, run scripts against it, and shut it down
#[derive(Parser)]
#[command(name = "sqlbuild")]
#[command(version)]
#[command(about = "Start a local SQL Server, run scripts against it, and shut it down")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute .sql files (or directories of them) against a fresh server
    ///
    /// Requires ACCEPT_EULA=Y and SA_PASSWORD in the environment; MSSQL_PID
    /// is passed through when set.
    Exec {
        /// Settings file (default: ~/.config/sqlbuild/sqlbuild.toml if present)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Script files or directories, executed in order
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print the version
    Version,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Exec { config, paths } => {
            if let Err(e) = sqlbuild::exec::run(&paths, config.as_deref()).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Version => {
            println!("sqlbuild {}", env!("CARGO_PKG_VERSION"));
        }
    }
}
