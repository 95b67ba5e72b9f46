use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mpt_core::{parse_iso_utc, Price, RunStatus};
use mpt_extract::{ExtractorConfig, PriceExtractor};
use mpt_ingest::{IngestionDriver, ScrapeConfig, ScrapeLoop};
use mpt_storage::{Database, FetchError, FetchedPage, PageFetcher, DEFAULT_SCHEMA};

const ITEM: &str = "Gyros Pork";
const VENDOR_URL: &str = "https://www.e-food.gr/delivery/athina/gyros-house";

fn menu_page(price: &str) -> String {
    format!(
        r#"<html><body><h1>Gyros House</h1>
        <div id="tylihta"><ul>
          <li><span class="name">Gyros   Pork</span><span class="price">{price}</span></li>
          <li><span class="name">Pita</span><span class="price">0,60 €</span></li>
        </ul></div></body></html>"#
    )
}

async fn temp_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(dir.path().join("data.db")).await.expect("open");
    db.init_schema(DEFAULT_SCHEMA).await.expect("schema");
    (dir, db)
}

fn driver(db: &Database, observed_at: &str) -> IngestionDriver {
    let at = parse_iso_utc(observed_at).expect("ts");
    IngestionDriver::new(
        db.clone(),
        PriceExtractor::new(ExtractorConfig::default()).expect("extractor"),
        "EUR",
    )
    .with_clock(move || at)
}

#[tokio::test]
async fn refetched_page_builds_daily_history() {
    let (_dir, db) = temp_db().await;
    let run_id = db.start_run().await.expect("run");

    let fetched_at = parse_iso_utc("2026-02-24T09:00:00Z").unwrap();
    db.store_page(run_id, VENDOR_URL, menu_page("3,50 €").as_bytes(), 200, Some(fetched_at))
        .await
        .expect("first fetch");
    let first = driver(&db, "2026-02-24T10:00:00Z")
        .run_incremental_extraction(ITEM)
        .await
        .expect("first extraction");
    assert_eq!(first.inserted, 1);

    let fetched_at = parse_iso_utc("2026-02-25T09:00:00Z").unwrap();
    db.store_page(run_id, VENDOR_URL, menu_page("4.00€").as_bytes(), 200, Some(fetched_at))
        .await
        .expect("second fetch");
    let second = driver(&db, "2026-02-25T10:00:00Z")
        .run_incremental_extraction(ITEM)
        .await
        .expect("second extraction");
    assert_eq!(second.candidates, 1);
    assert_eq!(second.inserted, 1);
    db.finish_run(run_id, RunStatus::Ok).await.expect("finish");

    let item = db.find_menu_item("gyros house", ITEM).await.expect("find").expect("item");
    let observations = db.observations_for_item(item.id).await.expect("observations");
    assert_eq!(observations.len(), 2);
    assert_ne!(observations[0].observed_at, observations[1].observed_at);
    assert_ne!(observations[0].page_id, observations[1].page_id);

    let history = db.price_history(ITEM).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].day, NaiveDate::from_ymd_opt(2026, 2, 24).unwrap());
    assert_eq!(history[0].average_price(), Price::from_minor_units(350));
    assert_eq!(history[1].day, NaiveDate::from_ymd_opt(2026, 2, 25).unwrap());
    assert_eq!(history[1].average_price(), Price::from_minor_units(400));
}

#[tokio::test]
async fn extraction_is_idempotent_per_item() {
    let (_dir, db) = temp_db().await;
    let run_id = db.start_run().await.expect("run");
    db.store_page(run_id, VENDOR_URL, menu_page("3,50 €").as_bytes(), 200, None)
        .await
        .expect("page");

    let driver = driver(&db, "2026-02-24T10:00:00Z");
    assert_eq!(driver.run_incremental_extraction(ITEM).await.expect("gyros").inserted, 1);
    assert_eq!(driver.run_incremental_extraction(ITEM).await.expect("gyros again").inserted, 0);

    // A different item still sees the page as unprocessed.
    let pita = driver.run_incremental_extraction("Pita").await.expect("pita");
    assert_eq!(pita.candidates, 1);
    assert_eq!(pita.inserted, 1);
    assert_eq!(db.count_prices().await.expect("count"), 2);
}

struct StaticFetcher(HashMap<&'static str, String>);

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch_one(&self, url: &str) -> Result<FetchedPage, FetchError> {
        match self.0.get(url) {
            Some(body) => Ok(FetchedPage {
                status: 200,
                final_url: url.to_string(),
                body: body.clone().into_bytes(),
            }),
            None => Ok(FetchedPage {
                status: 404,
                final_url: url.to_string(),
                body: Vec::new(),
            }),
        }
    }
}

#[tokio::test]
async fn scraped_pages_flow_into_price_history() {
    let (_dir, db) = temp_db().await;
    let listing_url = "https://www.e-food.gr/delivery/athina?categories=souvlakia";
    let fetcher = StaticFetcher(HashMap::from([
        (
            listing_url,
            concat!(
                r#"<a href="/delivery/athina/gyros-house">a</a>"#,
                r#"<a href="/delivery/athina/souvlaki-bar">b</a>"#,
            )
            .to_string(),
        ),
        (VENDOR_URL, menu_page("3,50 €")),
        ("https://www.e-food.gr/delivery/athina/souvlaki-bar", menu_page("€ 4,10")),
    ]));
    let config = ScrapeConfig {
        listing_url: listing_url.to_string(),
        base_url: "https://www.e-food.gr".to_string(),
        link_prefix: "/delivery/".to_string(),
        link_limit: None,
        page_delay: Duration::ZERO,
    };

    let scrape = ScrapeLoop::new(&db, &fetcher, config).run().await.expect("scrape");
    assert_eq!(scrape.pages_stored, 2);
    assert_eq!(scrape.status, RunStatus::Ok);

    let summary = driver(&db, "2026-02-24T10:00:00Z")
        .run_incremental_extraction(ITEM)
        .await
        .expect("extraction");
    assert_eq!(summary.inserted, 2);

    let latest = db.latest_prices().await.expect("latest");
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].vendor_count, 2);
    assert_eq!(latest[0].average_price(), Price::from_minor_units(380));
    assert!(db.find_menu_item("souvlaki bar", ITEM).await.expect("find").is_some());
}
