//! # Whitelist Refresh Service
//!
//! Operator entry point for the dynamic pool whitelist.
//!
//! ```bash
//! whitelist init-db                    # create schema and tables
//! whitelist refresh --chain ethereum   # one cycle for one chain
//! whitelist refresh                    # one cycle for every configured chain
//! whitelist refresh --loop             # keep refreshing on the configured interval
//! ```
//!
//! Press Ctrl+C to stop the loop gracefully.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dex_whitelist::database;
use dex_whitelist::publisher::{NatsPublisher, NoopPublisher, SnapshotPublisher};
use dex_whitelist::refresh::RefreshOrchestrator;
use dex_whitelist::settings::Settings;
use tokio::signal;
use tokio::time::{interval, Duration};

#[derive(Parser)]
#[command(name = "whitelist", about = "Dynamic DEX pool whitelist refresher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema (idempotent).
    InitDb,
    /// Run refresh cycles.
    Refresh {
        /// Restrict to one configured chain.
        #[arg(long)]
        chain: Option<String>,
        /// Keep running on the configured interval instead of one cycle.
        #[arg(long = "loop")]
        run_forever: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let settings = Settings::new().context("loading Config.toml")?;
    let chains: Vec<String> = settings.chains.keys().cloned().collect();

    let db = database::connect().await?;

    match cli.command {
        Command::InitDb => {
            database::initialize_database(&db, &chains).await?;
            println!("✅ Schema ready for {} chains", chains.len());
        }
        Command::Refresh { chain, run_forever } => {
            database::initialize_database(&db, &chains).await?;

            let publisher: Arc<dyn SnapshotPublisher> = if settings.publisher.enabled {
                Arc::new(NatsPublisher::connect(&settings.publisher).await?)
            } else {
                log::warn!("Publisher disabled; snapshots will be recorded but not broadcast");
                Arc::new(NoopPublisher)
            };

            let settings = Arc::new(settings);
            let orchestrator = Arc::new(RefreshOrchestrator::new(
                settings.clone(),
                db,
                publisher,
            )?);

            if let Some(chain) = &chain {
                if !settings.chains.contains_key(chain) {
                    bail!("chain '{chain}' is not configured in Config.toml");
                }
            }

            if run_forever {
                let mut ticker =
                    interval(Duration::from_secs(settings.refresh.interval_seconds));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            run_once(&orchestrator, chain.as_deref()).await;
                        }
                        _ = signal::ctrl_c() => {
                            println!("\n👋 Shutting down");
                            break;
                        }
                    }
                }
            } else {
                run_once(&orchestrator, chain.as_deref()).await;
            }
        }
    }

    Ok(())
}

async fn run_once(orchestrator: &Arc<RefreshOrchestrator>, chain: Option<&str>) {
    let results = match chain {
        Some(chain) => vec![(chain.to_string(), orchestrator.run_cycle(chain).await)],
        None => orchestrator.run_all().await,
    };

    for (chain, result) in results {
        match result {
            Ok(report) => {
                let status = if report.success { "✓" } else { "partial" };
                println!(
                    "[{chain}] {status}: {} known, {} scraped, {} passing ({} batches, {} errors)",
                    report.pools_known,
                    report.pools_scraped,
                    report.pools_passing,
                    report.batch_reports.len(),
                    report.errors.len()
                );
                if let Some(snapshot) = report.snapshot {
                    println!(
                        "[{chain}]   snapshot {} {} total={} added={} removed={} ref_block={}",
                        snapshot.snapshot_id,
                        snapshot.kind.as_str(),
                        snapshot.total_pools,
                        snapshot.added,
                        snapshot.removed,
                        snapshot.reference_block
                    );
                }
                for error in report.errors {
                    eprintln!("[{chain}]   error: {error}");
                }
            }
            Err(e) => eprintln!("[{chain}] cycle failed: {e}"),
        }
    }
}
