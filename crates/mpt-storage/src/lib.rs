//! SQLite persistence for scrape runs, raw page snapshots, the menu catalog and price
//! history, plus the HTTP fetch collaborator used by the scrape loop.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;

mod catalog;
pub mod fetch;
mod pages;
pub mod reports;
mod runs;

pub use catalog::CandidatePage;
pub use fetch::{FetchError, FetchPolicy, FetchedPage, HttpFetcher, PageFetcher};
pub use pages::{sha256_hex, StoredPage};
pub use reports::{DailyAverage, ItemSummary, LatestItemPrice};

pub const CRATE_NAME: &str = "mpt-storage";

/// Schema shipped with the workspace, embedded for tests and as a fallback when no schema
/// file is configured.
pub const DEFAULT_SCHEMA: &str = include_str!("../../../db/schema.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("page_id {0} not found")]
    PageNotFound(i64),
    #[error("scrape run {0} not found")]
    RunNotFound(i64),
    #[error("scrape run {0} is already finished")]
    RunAlreadyFinished(i64),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("invalid stored value {value:?} in {column}")]
    InvalidValue { column: &'static str, value: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How `store_page` treats a fetch whose bytes match the previous snapshot of the same URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupPolicy {
    /// Every fetch is a history point; only `(source_url, fetched_at)` is unique.
    #[default]
    PerFetch,
    /// Reuse the latest page for the URL when its fingerprint is identical.
    Fingerprint,
}

impl FromStr for DedupPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-fetch" | "per_fetch" | "time" => Ok(DedupPolicy::PerFetch),
            "fingerprint" | "sha256" | "content" => Ok(DedupPolicy::Fingerprint),
            other => {
                anyhow::bail!("unknown dedup policy {other:?} (expected per-fetch or fingerprint)")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub dedup: DedupPolicy,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            dedup: DedupPolicy::default(),
        }
    }
}

/// Handle over the tracker database. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
    dedup: DedupPolicy,
}

impl Database {
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with(path, DatabaseOptions::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, options: DatabaseOptions) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect)
            .await?;

        tracing::debug!(path = %path.display(), dedup = ?options.dedup, "opened tracker database");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
            dedup: options.dedup,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        self.dedup
    }

    /// Executes a schema script. Statements are expected to be idempotent.
    pub async fn init_schema(&self, schema_sql: &str) -> StoreResult<()> {
        sqlx::raw_sql(schema_sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn init_schema_from_path(&self, schema_path: impl AsRef<Path>) -> anyhow::Result<()> {
        let schema_path = schema_path.as_ref();
        let sql = tokio::fs::read_to_string(schema_path)
            .await
            .with_context(|| format!("reading schema {}", schema_path.display()))?;
        self.init_schema(&sql)
            .await
            .with_context(|| format!("applying schema {}", schema_path.display()))?;
        tracing::info!(schema = %schema_path.display(), "schema initialised");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_timestamp(
    column: &'static str,
    value: &str,
) -> StoreResult<chrono::DateTime<chrono::Utc>> {
    mpt_core::parse_iso_utc(value).map_err(|_| StoreError::InvalidValue {
        column,
        value: value.to_string(),
    })
}
