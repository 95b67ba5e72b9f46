use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use mpt_core::RunStatus;
use mpt_storage::{Database, PageFetcher};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub listing_url: String,
    pub base_url: String,
    pub link_prefix: String,
    pub link_limit: Option<usize>,
    /// Politeness delay between consecutive page loads.
    pub page_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeSummary {
    pub run_id: i64,
    pub links_found: usize,
    pub links_visited: usize,
    pub pages_stored: usize,
    pub failures: usize,
    pub status: RunStatus,
}

/// Collects unique absolute URLs of anchors whose href starts with `prefix`, in page order.
pub fn discover_links(html: &str, base: &Url, prefix: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for href in document.select(&selector).filter_map(|a| a.value().attr("href")) {
        if !href.starts_with(prefix) {
            continue;
        }
        let Ok(url) = base.join(href) else {
            tracing::debug!(href, "skipping unjoinable link");
            continue;
        };
        let url = url.to_string();
        if seen.insert(url.clone()) {
            links.push(url);
        }
    }
    Ok(links)
}

/// One pass of the fetch loop: listing page, then each discovered menu page.
pub struct ScrapeLoop<'a> {
    db: &'a Database,
    fetcher: &'a dyn PageFetcher,
    config: ScrapeConfig,
}

impl<'a> ScrapeLoop<'a> {
    pub fn new(db: &'a Database, fetcher: &'a dyn PageFetcher, config: ScrapeConfig) -> Self {
        Self { db, fetcher, config }
    }

    pub async fn run(&self) -> Result<ScrapeSummary> {
        let base = Url::parse(&self.config.base_url)
            .with_context(|| format!("parsing base url {}", self.config.base_url))?;
        let run_id = self.db.start_run().await.context("starting scrape run")?;

        let mut summary = ScrapeSummary {
            run_id,
            links_found: 0,
            links_visited: 0,
            pages_stored: 0,
            failures: 0,
            status: RunStatus::Ok,
        };

        let links = match self.listing_links(&base).await {
            Ok(links) => links,
            Err(err) => {
                tracing::error!(
                    run_id,
                    listing_url = self.config.listing_url.as_str(),
                    error = %format!("{err:#}"),
                    "listing fetch failed"
                );
                summary.status = RunStatus::Failed;
                self.db.finish_run(run_id, summary.status).await?;
                return Ok(summary);
            }
        };
        summary.links_found = links.len();
        tracing::info!(run_id, links = links.len(), "found delivery links");

        let to_visit = match self.config.link_limit {
            Some(limit) => {
                tracing::info!(limit, "link limit set, visiting only the first links");
                &links[..links.len().min(limit)]
            }
            None => &links[..],
        };

        for (i, url) in to_visit.iter().enumerate() {
            if i > 0 && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
            tracing::info!(run_id, "visiting ({}/{}): {}", i + 1, to_visit.len(), url);
            summary.links_visited += 1;
            if self.visit(run_id, url).await {
                summary.pages_stored += 1;
            } else {
                summary.failures += 1;
            }
        }

        summary.status = match (summary.failures, summary.links_visited) {
            (0, _) => RunStatus::Ok,
            (failed, visited) if failed < visited => RunStatus::Partial,
            _ => RunStatus::Failed,
        };
        self.db.finish_run(run_id, summary.status).await?;
        tracing::info!(
            run_id,
            stored = summary.pages_stored,
            failures = summary.failures,
            status = %summary.status,
            "scrape complete"
        );
        Ok(summary)
    }

    async fn listing_links(&self, base: &Url) -> Result<Vec<String>> {
        let listing = self.fetcher.fetch_one(&self.config.listing_url).await?;
        if !listing.is_success() {
            anyhow::bail!("listing returned http status {}", listing.status);
        }
        let html = String::from_utf8_lossy(&listing.body);
        discover_links(&html, base, &self.config.link_prefix)
    }

    /// Fetches and stores one page; failures are logged and reported as `false`.
    async fn visit(&self, run_id: i64, url: &str) -> bool {
        let page = match self.fetcher.fetch_one(url).await {
            Ok(page) if page.is_success() => page,
            Ok(page) => {
                tracing::warn!(url, status = page.status, "skipping non-success response");
                return false;
            }
            Err(err) => {
                tracing::warn!(url, error = %err, "failed to load page");
                return false;
            }
        };

        match self.db.store_page(run_id, url, &page.body, page.status, None).await {
            Ok(stored) => {
                tracing::info!(
                    url,
                    page_id = stored.page_id,
                    deduplicated = stored.deduplicated,
                    "saved page"
                );
                true
            }
            Err(err) => {
                tracing::error!(url, error = %err, "page insert failed");
                false
            }
        }
    }
}
