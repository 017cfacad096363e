use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bulk_imports::commands;
use bulk_imports::config::Config;
use bulk_imports::error::ImportError;
use bulk_imports::logging;
use bulk_imports::state::AppState;
use bulk_imports::storage::Database;

#[derive(Parser)]
#[command(name = "bulk-imports")]
#[command(about = "Migrate groups and projects from a remote source instance")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long, short = 'c', default_value = "bulk-imports.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Import the configured entities, or resume an existing import
    Run {
        /// Resume this import instead of starting a new one
        #[arg(long)]
        import_id: Option<String>,
    },
    /// Show the progress of one import, or list all imports
    Status {
        import_id: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Time out stale trackers
    Sweep {
        /// Only sweep this import
        import_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("{e}");
    }

    match execute(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e.sanitized_message());
            eprintln!("{}", e.sanitized_message());
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands, config: Config) -> Result<ExitCode, ImportError> {
    match command {
        Commands::Run { import_id } => {
            let state = AppState::new(config).await?;
            let import_id = match import_id {
                Some(id) => id,
                None => commands::start_import(&state, &state.config.entities).await?.id,
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("[ORCHESTRATOR] Interrupt received, stopping workers");
                    on_signal.cancel();
                }
            });

            let status = commands::run_import(&state, &import_id, cancel).await?;
            let report = commands::import_status(&state.db, &import_id).await?;
            print!("{}", commands::render_report(&report));

            Ok(if status.is_terminal() && !report.incomplete {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Status { import_id, json } => {
            // Reports only need the database
            let db = Database::init(config.database.path.clone()).await?;
            match import_id {
                Some(id) => {
                    let report = commands::import_status(&db, &id).await?;
                    if json {
                        println!("{}", to_json(&report)?);
                    } else {
                        print!("{}", commands::render_report(&report));
                    }
                }
                None => {
                    let list = commands::list_import_status(&db).await?;
                    if json {
                        println!("{}", to_json(&list)?);
                    } else {
                        print!("{}", commands::render_import_list(&list));
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sweep { import_id } => {
            let state = AppState::new(config).await?;
            let swept = commands::sweep(&state, import_id.as_deref()).await?;
            println!("Timed out {swept} stale trackers");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ImportError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ImportError::Internal(format!("Failed to serialize report: {e}")))
}
