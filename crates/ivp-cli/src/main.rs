//! ivp-cli entry point: thin clap dispatch over the library's command
//! handlers: `poll-once`, `replay`, `db status`,
//! `db migrate`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use ivp_cli::commands;
use ivp_config::Settings;

#[derive(Parser)]
#[command(name = "ivp")]
#[command(about = "document ingestion pipeline CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single inbox poll cycle end to end.
    PollOnce,

    /// Re-enqueue dead-lettered entries matching a status.
    Replay {
        /// FAILED | REVIEW_REQUIRED
        #[arg(long)]
        status: String,
    },

    /// Claim-store maintenance commands.
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let settings = Settings::from_env()?;
    let cli = Cli::parse();

    match cli.cmd {
        Commands::PollOnce => {
            let snapshot = commands::poll::run(&settings).await?;
            println!("processed={}", snapshot.processed);
            println!("stored={}", snapshot.stored);
            println!("review_required={}", snapshot.review_required);
            println!("failed={}", snapshot.failed);
            println!("duplicate_skipped={}", snapshot.duplicate_skipped);
        }

        Commands::Replay { status } => {
            let summary = commands::replay::run(&settings, &status).await?;
            println!("queued={}", summary.queued);
            println!("skipped_processed={}", summary.skipped_processed);
            println!("skipped_invalid={}", summary.skipped_invalid);
        }

        Commands::Db { cmd } => match cmd {
            DbCmd::Status => {
                let status = commands::db::status(&settings).await?;
                println!("claim_db_path={}", status.claim_db_path);
                for (status_name, count) in status.claims_by_status {
                    println!("{status_name}={count}");
                }
            }
            DbCmd::Migrate => {
                commands::db::migrate(&settings).await?;
                println!("migrations_applied=true");
            }
        },
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
