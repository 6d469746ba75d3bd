use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gripe-cli")]
#[command(about = "Harvest product complaints into dated JSON snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every manifest topic, sweep expired snapshots, persist the index.
    Harvest {
        /// Limit the run to these sources (repeatable). Defaults to every enabled source.
        #[arg(long = "source", value_name = "ID")]
        sources: Vec<String>,
    },
    /// Sweep expired snapshots and persist the index without harvesting.
    Prune,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,gripe=info")),
        )
        .init();

    if let Err(err) = run(Cli::parse()).await {
        error!(error = %format!("{err:#}"), "run failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Commands::Harvest {
        sources: Vec::new(),
    }) {
        Commands::Harvest { sources } => {
            let summary = gripe_sync::run_harvest_from_env(&sources).await?;
            for source in &summary.sources {
                println!(
                    "harvest {}: run_id={} filter={} topics={} failed={} items={}",
                    source.source_id,
                    summary.run_id,
                    source.filter,
                    source.topics.len(),
                    source.failed_topics.len(),
                    source.items_written()
                );
            }
            println!(
                "index: files={} pruned={}",
                summary.index_files,
                summary.pruned.len()
            );
        }
        Commands::Prune => {
            let summary = gripe_sync::run_prune_from_env().await?;
            println!(
                "prune complete: pruned={} delete_failures={} files={}",
                summary.pruned.len(),
                summary.delete_failures.len(),
                summary.index_files
            );
        }
    }

    Ok(())
}
