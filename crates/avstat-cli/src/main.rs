use std::collections::BTreeMap;

use anyhow::Result;
use avstat_sync::{ApiConfig, SyncConfig};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "avstat")]
#[command(about = "Reconcile marketplace listing stats into a spreadsheet, one day at a time")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replace the sheet rows for each selected date (default command).
    Sync(SyncArgs),
    /// Print the account's listing ids. Needs only the AVITO_* credentials.
    Listings,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Single day, YYYY-MM-DD.
    #[arg(long, conflicts_with_all = ["start", "end"])]
    date: Option<String>,
    /// First day of an inclusive backfill range.
    #[arg(long)]
    start: Option<String>,
    /// Last day of an inclusive backfill range.
    #[arg(long)]
    end: Option<String>,
    /// Comma-separated listing ids; skips the listing directory.
    #[arg(long)]
    items: Option<String>,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl SyncArgs {
    fn overrides(&self) -> BTreeMap<String, String> {
        [
            ("DATE", &self.date),
            ("START_DATE", &self.start),
            ("END_DATE", &self.end),
            ("ITEM_IDS_CSV", &self.items),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.clone().map(|v| (key.to_string(), v)))
        .collect()
    }
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let dotenv_loaded = dotenv::dotenv().is_ok();
    init_tracing("info")?;
    debug!(dotenv_loaded, "environment loaded");

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let config = SyncConfig::from_env_with(&args.overrides())?;
            let summary = avstat_sync::run_sync(config).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} dates={}..{} listings={} rows={} detail_lookups={}",
                    summary.run_id,
                    summary.start_date,
                    summary.end_date,
                    summary.listings,
                    summary.rows_written(),
                    summary.detail_lookups
                );
                for day in &summary.days {
                    println!(
                        "  {} tier={} active={} deleted={} appended={}{}",
                        day.date,
                        day.tier,
                        day.active,
                        day.deleted,
                        day.appended,
                        if day.skipped { " (skipped)" } else { "" }
                    );
                }
            }
        }
        Commands::Listings => {
            let config = ApiConfig::from_env()?;
            let catalog = avstat_sync::list_listings(&config).await?;
            for id in &catalog.ids {
                println!("{id}");
            }
            eprintln!("{} listings", catalog.len());
        }
    }

    Ok(())
}
