// ABOUTME: Command-line entry point for odata-sync
// ABOUTME: Parses arguments, initializes logging and dispatches to the command modules

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use odata_sync::logging;

#[derive(Parser)]
#[command(
    name = "odata-sync",
    version,
    about = "Incremental OData <-> PostgreSQL synchronization"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (database, remote and cursor settings)
    #[arg(long, global = true, default_value = "odata-sync.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pull or push job once
    Run {
        /// Path to the job file (.toml or .json)
        job: PathBuf,
        /// PostgreSQL connection string, overrides settings and DATABASE_URL
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        /// SQLite file holding job cursors
        #[arg(long)]
        cursor_db: Option<PathBuf>,
    },
    /// Print the filter window a job would use if it ran now
    Filter {
        /// Path to the job file (.toml or .json)
        job: PathBuf,
        /// SQLite file holding job cursors
        #[arg(long)]
        cursor_db: Option<PathBuf>,
    },
    /// Inspect or reset a job's last-success cursor
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
        /// SQLite file holding job cursors
        #[arg(long, global = true)]
        cursor_db: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CursorAction {
    /// Show the stored cursor
    Show { job_id: String },
    /// Forget the cursor so the next run starts from the lookback window
    Reset { job_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            job,
            database_url,
            cursor_db,
        } => commands::run::execute(&job, &cli.config, database_url, cursor_db).await,
        Commands::Filter { job, cursor_db } => {
            commands::filter::execute(&job, &cli.config, cursor_db)
        }
        Commands::Cursor { action, cursor_db } => match action {
            CursorAction::Show { job_id } => {
                commands::cursor::show(&job_id, &cli.config, cursor_db)
            }
            CursorAction::Reset { job_id } => {
                commands::cursor::reset(&job_id, &cli.config, cursor_db)
            }
        },
    }
}
