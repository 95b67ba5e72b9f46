//! Read-only aggregate queries consumed by the reporting layer.

use chrono::{DateTime, NaiveDate, Utc};
use mpt_core::Price;
use serde::Serialize;
use sqlx::Row;

use crate::{decode_timestamp, Database, StoreError, StoreResult};

/// Average of each vendor's most recent price for one item name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestItemPrice {
    pub item_name: String,
    pub avg_price_cents: f64,
    pub currency: String,
    pub vendor_count: i64,
    pub latest_observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyAverage {
    pub day: NaiveDate,
    pub avg_price_cents: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSummary {
    pub vendor_count: i64,
    pub avg_price_cents: Option<f64>,
}

fn rounded_price(avg_price_cents: f64) -> Price {
    Price::from_minor_units(avg_price_cents.round() as i64)
}

impl LatestItemPrice {
    pub fn average_price(&self) -> Price {
        rounded_price(self.avg_price_cents)
    }
}

impl DailyAverage {
    pub fn average_price(&self) -> Price {
        rounded_price(self.avg_price_cents)
    }
}

impl ItemSummary {
    pub fn average_price(&self) -> Option<Price> {
        self.avg_price_cents.map(rounded_price)
    }
}

impl Database {
    pub async fn latest_prices(&self) -> StoreResult<Vec<LatestItemPrice>> {
        let rows = sqlx::query(
            r#"
            WITH latest_prices AS (
                SELECT m.item_name, p.price_cents, p.currency, p.observed_at
                  FROM menu_items m
                  JOIN prices p ON p.menu_item_id = m.id
                 WHERE p.observed_at = (
                       SELECT MAX(p2.observed_at)
                         FROM prices p2
                        WHERE p2.menu_item_id = m.id
                 )
            )
            SELECT item_name,
                   AVG(price_cents) AS avg_price_cents,
                   currency,
                   COUNT(*) AS vendor_count,
                   MAX(observed_at) AS latest_observed_at
              FROM latest_prices
             GROUP BY item_name, currency
             ORDER BY item_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let latest: String = row.try_get("latest_observed_at")?;
            out.push(LatestItemPrice {
                item_name: row.try_get("item_name")?,
                avg_price_cents: row.try_get("avg_price_cents")?,
                currency: row.try_get("currency")?,
                vendor_count: row.try_get("vendor_count")?,
                latest_observed_at: decode_timestamp("prices.observed_at", &latest)?,
            });
        }
        Ok(out)
    }

    /// Per-day average across all vendors for one item name, oldest day first.
    pub async fn price_history(&self, item_name: &str) -> StoreResult<Vec<DailyAverage>> {
        let rows = sqlx::query(
            r#"
            SELECT DATE(p.observed_at) AS day,
                   AVG(p.price_cents) AS avg_price_cents,
                   p.currency
              FROM prices p
              JOIN menu_items m ON m.id = p.menu_item_id
             WHERE m.item_name = ?
             GROUP BY day, p.currency
             ORDER BY day ASC
            "#,
        )
        .bind(item_name)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let day: String = row.try_get("day")?;
            let day = NaiveDate::parse_from_str(&day, "%Y-%m-%d").map_err(|_| {
                StoreError::InvalidValue {
                    column: "prices.observed_at",
                    value: day.clone(),
                }
            })?;
            out.push(DailyAverage {
                day,
                avg_price_cents: row.try_get("avg_price_cents")?,
                currency: row.try_get("currency")?,
            });
        }
        Ok(out)
    }

    pub async fn item_names(&self) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT DISTINCT item_name FROM menu_items ORDER BY item_name")
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn item_summary(&self, item_name: &str) -> StoreResult<ItemSummary> {
        let row = sqlx::query(
            r#"
            WITH latest_prices AS (
                SELECT p.price_cents
                  FROM menu_items m
                  JOIN prices p ON p.menu_item_id = m.id
                 WHERE m.item_name = ?
                   AND p.observed_at = (
                       SELECT MAX(p2.observed_at)
                         FROM prices p2
                        WHERE p2.menu_item_id = m.id
                   )
            )
            SELECT COUNT(*) AS vendor_count, AVG(price_cents) AS avg_price_cents
              FROM latest_prices
            "#,
        )
        .bind(item_name)
        .fetch_one(self.pool())
        .await?;

        Ok(ItemSummary {
            vendor_count: row.try_get("vendor_count")?,
            avg_price_cents: row.try_get("avg_price_cents")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_temp_db;

    fn ts(value: &str) -> DateTime<Utc> {
        mpt_core::parse_iso_utc(value).expect("ts")
    }

    async fn seed(db: &Database, vendor: &str, cents: i64, observed_at: &str) {
        let run_id = db.start_run().await.expect("run");
        let url = format!("https://example.test/{}", vendor.replace(' ', "-"));
        let page = db
            .store_page(run_id, &url, observed_at.as_bytes(), 200, Some(ts(observed_at)))
            .await
            .expect("page");
        let item = db.ensure_menu_item(vendor, "Gyros Pork").await.expect("item");
        db.record_price(item, page.page_id, Price::from_minor_units(cents), "EUR", ts(observed_at))
            .await
            .expect("price");
    }

    #[tokio::test]
    async fn history_averages_each_day() {
        let (_dir, db) = open_temp_db().await;
        seed(&db, "a place", 300, "2026-02-24T09:00:00Z").await;
        seed(&db, "b place", 400, "2026-02-24T18:00:00Z").await;
        seed(&db, "a place", 350, "2026-02-25T09:00:00Z").await;

        let history = db.price_history("Gyros Pork").await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].day, NaiveDate::from_ymd_opt(2026, 2, 24).unwrap());
        assert_eq!(history[0].average_price(), Price::from_minor_units(350));
        assert_eq!(history[1].day, NaiveDate::from_ymd_opt(2026, 2, 25).unwrap());
        assert_eq!(history[1].avg_price_cents, 350.0);
        assert!(db.price_history("Pita").await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn latest_prices_use_each_vendors_newest_observation() {
        let (_dir, db) = open_temp_db().await;
        seed(&db, "a place", 300, "2026-02-24T09:00:00Z").await;
        seed(&db, "a place", 500, "2026-02-25T09:00:00Z").await;
        seed(&db, "b place", 400, "2026-02-24T18:00:00Z").await;

        let latest = db.latest_prices().await.expect("latest");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].item_name, "Gyros Pork");
        assert_eq!(latest[0].vendor_count, 2);
        assert_eq!(latest[0].average_price(), Price::from_minor_units(450));
        assert_eq!(latest[0].latest_observed_at, ts("2026-02-25T09:00:00Z"));

        let summary = db.item_summary("Gyros Pork").await.expect("summary");
        assert_eq!(summary.vendor_count, 2);
        assert_eq!(summary.average_price(), Some(Price::from_minor_units(450)));
        assert_eq!(db.item_names().await.expect("names"), vec!["Gyros Pork".to_string()]);
    }

    #[tokio::test]
    async fn summary_of_unknown_item_is_empty() {
        let (_dir, db) = open_temp_db().await;
        let summary = db.item_summary("Pita").await.expect("summary");
        assert_eq!(summary.vendor_count, 0);
        assert_eq!(summary.average_price(), None);
    }
}
