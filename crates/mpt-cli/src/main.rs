use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mpt_ingest::PipelineConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mpt-cli")]
#[command(about = "Menu price tracker: scrape delivery pages and extract item price history")]
struct Cli {
    /// SQLite database file (overrides MPT_DB_PATH).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Schema file applied at startup (overrides MPT_SCHEMA_PATH).
    #[arg(long, global = true)]
    schema_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract prices for one item from pages that do not have it yet.
    Extract {
        #[arg(long)]
        item: Option<String>,
    },
    /// Fetch the listing page and every linked menu page into the content store.
    Scrape {
        #[arg(long)]
        link_limit: Option<usize>,
    },
    /// Create the database and apply the schema.
    InitDb,
    /// Per-day average price for an item, one JSON object per line.
    History {
        #[arg(long)]
        item: Option<String>,
    },
    /// Latest average price per item across vendors, one JSON object per line.
    Latest,
}

const DEFAULT_LOG_FILTER: &str = "mpt_ingest=info,mpt_storage=info,mpt_extract=info";

/// `RUST_LOG` wins as a whole when it parses; otherwise the pipeline crates log at info.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[tokio::main]
async fn main() -> Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(directives.as_deref()))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    if let Some(schema_path) = cli.schema_path {
        config.schema_path = schema_path;
    }

    match cli.command.unwrap_or(Commands::Extract { item: None }) {
        Commands::Extract { item } => {
            if let Some(item) = item {
                config.item_name = item;
            }
            tracing::info!(
                item_name = config.item_name.as_str(),
                "extracting prices for unprocessed pages"
            );
            let summary = mpt_ingest::run_extraction(&config).await?;
            println!(
                "extraction complete: item={} candidates={} processed={} inserted={} \
                 not_found={} failed={}",
                summary.item_name,
                summary.candidates,
                summary.processed,
                summary.inserted,
                summary.not_found,
                summary.failed
            );
        }
        Commands::Scrape { link_limit } => {
            if link_limit.is_some() {
                config.link_limit = link_limit;
            }
            let summary = mpt_ingest::run_scrape(&config).await?;
            println!(
                "scrape complete: run_id={} links={} visited={} stored={} failures={} status={}",
                summary.run_id,
                summary.links_found,
                summary.links_visited,
                summary.pages_stored,
                summary.failures,
                summary.status
            );
        }
        Commands::InitDb => {
            let db = mpt_ingest::open_database(&config).await?;
            println!("database ready: {}", db.path().display());
            db.close().await;
        }
        Commands::History { item } => {
            let item_name = item.unwrap_or_else(|| config.item_name.clone());
            let db = mpt_ingest::open_database(&config).await?;
            for day in db.price_history(&item_name).await? {
                let mut value = serde_json::to_value(&day)?;
                value["average"] =
                    day.average_price().format_european(&config.currency_symbol).into();
                println!("{value}");
            }
            db.close().await;
        }
        Commands::Latest => {
            let db = mpt_ingest::open_database(&config).await?;
            for latest in db.latest_prices().await? {
                let mut value = serde_json::to_value(&latest)?;
                value["average"] =
                    latest.average_price().format_european(&config.currency_symbol).into();
                println!("{value}");
            }
            db.close().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn rust_log_can_raise_pipeline_verbosity() {
        let filter = log_filter(Some("mpt_ingest=debug"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn pipeline_crates_log_at_info_by_default() {
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
        let unparsable = log_filter(Some("mpt_ingest=loud"));
        assert_eq!(unparsable.max_level_hint(), Some(LevelFilter::INFO));
    }
}
