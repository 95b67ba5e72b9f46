use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use mpt_core::{derive_vendor, Price};
use mpt_extract::{NotFound, PriceExtractor};
use mpt_storage::{CandidatePage, Database, StoreError};
use serde::Serialize;
use thiserror::Error;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionSummary {
    pub item_name: String,
    pub candidates: usize,
    pub processed: usize,
    pub inserted: usize,
    pub not_found: usize,
    pub failed: usize,
}

#[derive(Debug)]
enum PageOutcome {
    Inserted { vendor: String, price: Price },
    NotFound(NotFound),
}

#[derive(Debug, Error)]
enum PageError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("page content is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
}

impl PageError {
    /// Integrity violations indicate a bug in the store, not a bad page.
    fn is_structural(&self) -> bool {
        matches!(self, PageError::Store(StoreError::Integrity(_)))
    }
}

/// Extracts one item's price from every stored page that does not have it yet.
pub struct IngestionDriver {
    db: Database,
    extractor: PriceExtractor,
    currency: String,
    clock: Clock,
}

impl IngestionDriver {
    pub fn new(db: Database, extractor: PriceExtractor, currency: impl Into<String>) -> Self {
        Self {
            db,
            extractor,
            currency: currency.into(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replaces the source of `observed_at` timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Processes candidate pages in ascending id order. Per-page failures are logged and
    /// skipped; every successful observation is committed as it is written.
    pub async fn run_incremental_extraction(&self, item_name: &str) -> Result<ExtractionSummary> {
        let candidates = self.db.pages_missing_price(item_name).await?;
        tracing::info!(item_name, candidates = candidates.len(), "found unprocessed pages");

        let mut summary = ExtractionSummary {
            item_name: item_name.to_string(),
            candidates: candidates.len(),
            ..ExtractionSummary::default()
        };

        for candidate in &candidates {
            match self.process_page(candidate, item_name).await {
                Ok(PageOutcome::Inserted { vendor, price }) => {
                    summary.processed += 1;
                    summary.inserted += 1;
                    tracing::info!(
                        page_id = candidate.page_id,
                        item_name,
                        vendor = vendor.as_str(),
                        price = %price,
                        price_minor_units = price.minor_units(),
                        "inserted price"
                    );
                }
                Ok(PageOutcome::NotFound(reason)) => {
                    summary.processed += 1;
                    summary.not_found += 1;
                    tracing::debug!(
                        page_id = candidate.page_id,
                        source_url = candidate.source_url.as_str(),
                        item_name,
                        %reason,
                        "no price found"
                    );
                }
                Err(err) if err.is_structural() => return Err(err.into()),
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(
                        page_id = candidate.page_id,
                        source_url = candidate.source_url.as_str(),
                        error = %err,
                        "page failed, continuing"
                    );
                }
            }
        }

        tracing::info!(
            item_name,
            candidates = summary.candidates,
            processed = summary.processed,
            inserted = summary.inserted,
            not_found = summary.not_found,
            failed = summary.failed,
            "extraction complete"
        );
        Ok(summary)
    }

    async fn process_page(
        &self,
        candidate: &CandidatePage,
        item_name: &str,
    ) -> Result<PageOutcome, PageError> {
        tracing::debug!(
            page_id = candidate.page_id,
            source_url = candidate.source_url.as_str(),
            "processing page"
        );
        let content = self.db.get_page_content(candidate.page_id).await?;
        let html = std::str::from_utf8(&content)?;

        let price = match self.extractor.extract_price(html, item_name) {
            Ok(price) => price,
            Err(reason) => return Ok(PageOutcome::NotFound(reason)),
        };

        let vendor = derive_vendor(&candidate.source_url);
        let menu_item_id = self.db.ensure_menu_item(&vendor, item_name).await?;
        self.db
            .record_price(menu_item_id, candidate.page_id, price, &self.currency, (self.clock)())
            .await?;
        Ok(PageOutcome::Inserted { vendor, price })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpt_extract::ExtractorConfig;
    use mpt_storage::DEFAULT_SCHEMA;

    const MENU_PAGE: &str = include_str!("../../../fixtures/pages/to-kalamaki-tou-kosta.html");
    const CLOSED_PAGE: &str = include_str!("../../../fixtures/pages/gyros-house-no-menu.html");
    const MENU_URL: &str = "https://www.e-food.gr/delivery/athina/to-kalamaki-tou-kosta";
    const CLOSED_URL: &str = "https://www.e-food.gr/delivery/athina/gyros-house";
    const GYROS: &str = "Γύρος χοιρινός";

    async fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("data.db")).await.expect("open");
        db.init_schema(DEFAULT_SCHEMA).await.expect("schema");
        (dir, db)
    }

    fn driver(db: &Database) -> IngestionDriver {
        let extractor = PriceExtractor::new(ExtractorConfig::default()).expect("extractor");
        IngestionDriver::new(db.clone(), extractor, "EUR")
    }

    #[tokio::test]
    async fn inserts_prices_and_skips_pages_without_the_item() {
        let (_dir, db) = temp_db().await;
        let run_id = db.start_run().await.expect("run");
        db.store_page(run_id, MENU_URL, MENU_PAGE.as_bytes(), 200, None)
            .await
            .expect("menu page");
        db.store_page(run_id, CLOSED_URL, CLOSED_PAGE.as_bytes(), 200, None)
            .await
            .expect("closed page");

        let summary = driver(&db)
            .run_incremental_extraction("Γύρος χοιρινός")
            .await
            .expect("extraction");
        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.failed, 0);

        let item = db
            .find_menu_item("to kalamaki tou kosta", "Γύρος χοιρινός")
            .await
            .expect("find")
            .expect("catalog entry");
        let observations = db.observations_for_item(item.id).await.expect("observations");
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].price, Price::from_minor_units(350));
        assert_eq!(observations[0].currency, "EUR");
    }

    #[tokio::test]
    async fn second_run_without_new_pages_inserts_nothing() {
        let (_dir, db) = temp_db().await;
        let run_id = db.start_run().await.expect("run");
        db.store_page(run_id, MENU_URL, MENU_PAGE.as_bytes(), 200, None)
            .await
            .expect("page");

        let driver = driver(&db);
        let first = driver.run_incremental_extraction(GYROS).await.expect("first");
        let second = driver.run_incremental_extraction(GYROS).await.expect("second");

        assert_eq!(first.inserted, 1);
        assert_eq!(second.candidates, 0);
        assert_eq!(second.inserted, 0);
        assert_eq!(db.count_prices().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn unextractable_pages_are_retried_on_every_run() {
        let (_dir, db) = temp_db().await;
        let run_id = db.start_run().await.expect("run");
        db.store_page(run_id, CLOSED_URL, CLOSED_PAGE.as_bytes(), 200, None)
            .await
            .expect("page");

        let driver = driver(&db);
        for _ in 0..2 {
            let summary = driver.run_incremental_extraction(GYROS).await.expect("run");
            assert_eq!(summary.candidates, 1);
            assert_eq!(summary.not_found, 1);
        }
    }

    #[tokio::test]
    async fn undecodable_page_does_not_abort_the_batch() {
        let (_dir, db) = temp_db().await;
        let run_id = db.start_run().await.expect("run");
        let broken = "https://www.e-food.gr/delivery/athina/broken";
        db.store_page(run_id, broken, &[0xff, 0xfe, 0x00], 200, None)
            .await
            .expect("broken page");
        db.store_page(run_id, MENU_URL, MENU_PAGE.as_bytes(), 200, None)
            .await
            .expect("menu page");

        let summary = driver(&db)
            .run_incremental_extraction("Γύρος χοιρινός")
            .await
            .expect("extraction");
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.inserted, 1);
    }

    #[tokio::test]
    async fn vendor_falls_back_to_unknown_and_clock_stamps_observations() {
        let (_dir, db) = temp_db().await;
        let run_id = db.start_run().await.expect("run");
        db.store_page(run_id, "https://www.e-food.gr/", MENU_PAGE.as_bytes(), 200, None)
            .await
            .expect("page");
        let fixed = mpt_core::parse_iso_utc("2026-03-01T10:00:00Z").expect("ts");

        driver(&db)
            .with_clock(move || fixed)
            .run_incremental_extraction("Καλαμάκι κοτόπουλο")
            .await
            .expect("extraction");

        let item = db
            .find_menu_item("unknown", "Καλαμάκι κοτόπουλο")
            .await
            .expect("find")
            .expect("catalog entry");
        let observations = db.observations_for_item(item.id).await.expect("observations");
        assert_eq!(observations[0].observed_at, fixed);
        assert_eq!(observations[0].price, Price::from_minor_units(380));
    }
}
