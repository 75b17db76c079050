use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leetoffer-cli")]
#[command(about = "LeetOffer compensation ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental ingestion pass.
    Ingest,
    /// Run ingestion on the configured cron schedule until ctrl-c.
    Watch,
    /// Serve the read-only offers API.
    Serve,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = leetoffer_ingest::run_ingest_once_from_env().await?;
            println!(
                "ingest complete: run_id={} mode={:?} stop={:?} processed={} successful={} new_offers={} total_offers={} output={}",
                summary.run_id,
                summary.mode,
                summary.stop_reason,
                summary.processed,
                summary.successful,
                summary.new_offers,
                summary.total_offers,
                summary.output_path
            );
        }
        Commands::Watch => leetoffer_ingest::watch_from_env().await?,
        Commands::Serve => leetoffer_web::serve_from_env().await?,
    }

    Ok(())
}
