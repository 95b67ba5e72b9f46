//! Pipeline orchestration: the scrape loop that fills the content store and the
//! incremental extraction pass that turns stored pages into price history.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use mpt_core::{DEFAULT_CURRENCY, DEFAULT_CURRENCY_SYMBOL};
use mpt_extract::{ExtractorConfig, PriceExtractor, DEFAULT_SECTION_ID};
use mpt_storage::{
    Database, DatabaseOptions, DedupPolicy, FetchPolicy, HttpFetcher, DEFAULT_SCHEMA,
};

mod driver;
mod scrape;

pub use driver::{ExtractionSummary, IngestionDriver};
pub use scrape::{discover_links, ScrapeConfig, ScrapeLoop, ScrapeSummary};

pub const CRATE_NAME: &str = "mpt-ingest";

pub const DEFAULT_ITEM_NAME: &str = "Γύρος χοιρινός";
pub const DEFAULT_LISTING_URL: &str =
    "https://www.e-food.gr/delivery/athina?categories=souvlakia";
pub const DEFAULT_BASE_URL: &str = "https://www.e-food.gr";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub schema_path: PathBuf,
    pub item_name: String,
    pub currency: String,
    pub currency_symbol: String,
    pub section_id: String,
    pub dedup_policy: DedupPolicy,
    pub listing_url: String,
    pub base_url: String,
    pub link_prefix: String,
    pub link_limit: Option<usize>,
    /// Page pacing and retry behaviour shared by the scrape loop and the HTTP fetcher.
    pub fetch: FetchPolicy,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let dedup_policy = match lookup("MPT_DEDUP_POLICY") {
            Some(raw) => raw.parse::<DedupPolicy>().context("parsing MPT_DEDUP_POLICY")?,
            None => DedupPolicy::default(),
        };
        let defaults = FetchPolicy::default();
        let fetch = FetchPolicy {
            timeout: parse_var::<u64>(&lookup, "MPT_HTTP_TIMEOUT_SECS")?
                .map_or(defaults.timeout, Duration::from_secs),
            user_agent: lookup("MPT_USER_AGENT").unwrap_or(defaults.user_agent),
            attempts: parse_var(&lookup, "MPT_FETCH_ATTEMPTS")?.unwrap_or(defaults.attempts),
            page_delay: parse_var::<u64>(&lookup, "MPT_PAGE_DELAY_MS")?
                .map_or(defaults.page_delay, Duration::from_millis),
        };

        Ok(Self {
            database_path: lookup("MPT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("db/data.db")),
            schema_path: lookup("MPT_SCHEMA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("db/schema.sql")),
            item_name: lookup("MPT_ITEM").unwrap_or_else(|| DEFAULT_ITEM_NAME.to_string()),
            currency: lookup("MPT_CURRENCY").unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            currency_symbol: lookup("MPT_CURRENCY_SYMBOL")
                .unwrap_or_else(|| DEFAULT_CURRENCY_SYMBOL.to_string()),
            section_id: lookup("MPT_SECTION_ID")
                .unwrap_or_else(|| DEFAULT_SECTION_ID.to_string()),
            dedup_policy,
            listing_url: lookup("MPT_LISTING_URL")
                .unwrap_or_else(|| DEFAULT_LISTING_URL.to_string()),
            base_url: lookup("MPT_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            link_prefix: lookup("MPT_LINK_PREFIX").unwrap_or_else(|| "/delivery/".to_string()),
            link_limit: parse_var(&lookup, "MPT_LINK_LIMIT")?,
            fetch,
        })
    }

    pub fn extractor(&self) -> Result<PriceExtractor> {
        PriceExtractor::new(ExtractorConfig {
            section_id: self.section_id.clone(),
            currency_symbol: self.currency_symbol.clone(),
        })
        .context("building price extractor")
    }

    pub fn scrape_config(&self) -> ScrapeConfig {
        ScrapeConfig {
            listing_url: self.listing_url.clone(),
            base_url: self.base_url.clone(),
            link_prefix: self.link_prefix.clone(),
            link_limit: self.link_limit,
            page_delay: self.fetch.page_delay,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("parsing {key}={raw:?}"))
        })
        .transpose()
}

/// Opens the database and applies the schema. A missing schema file falls back to the
/// schema compiled into the binary.
pub async fn open_database(config: &PipelineConfig) -> Result<Database> {
    let db = Database::open_with(
        &config.database_path,
        DatabaseOptions {
            dedup: config.dedup_policy,
            ..DatabaseOptions::default()
        },
    )
    .await
    .with_context(|| format!("opening database {}", config.database_path.display()))?;

    if schema_exists(&config.schema_path).await {
        db.init_schema_from_path(&config.schema_path).await?;
    } else {
        tracing::warn!(
            schema = %config.schema_path.display(),
            "schema file not found, applying built-in schema"
        );
        db.init_schema(DEFAULT_SCHEMA).await.context("applying built-in schema")?;
    }
    Ok(db)
}

async fn schema_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

pub async fn run_extraction(config: &PipelineConfig) -> Result<ExtractionSummary> {
    let db = open_database(config).await?;
    let driver = IngestionDriver::new(db.clone(), config.extractor()?, config.currency.clone());
    let summary = driver.run_incremental_extraction(&config.item_name).await;
    db.close().await;
    summary
}

pub async fn run_scrape(config: &PipelineConfig) -> Result<ScrapeSummary> {
    let db = open_database(config).await?;
    let fetcher = HttpFetcher::new(config.fetch.clone())?;
    let summary = ScrapeLoop::new(&db, &fetcher, config.scrape_config()).run().await;
    db.close().await;
    summary
}
