use chrono::{DateTime, Utc};
use mpt_core::{iso_utc, MenuItem, Price, PriceObservation};
use sqlx::Row;

use crate::{decode_timestamp, Database, StoreResult};

/// A page that has no recorded price for the requested item name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePage {
    pub page_id: i64,
    pub source_url: String,
}

impl Database {
    /// Looks up or creates the catalog entry for `(vendor, item_name)` in one statement.
    ///
    /// The upsert is backed by the `UNIQUE (vendor, item_name)` constraint, so concurrent
    /// callers always converge on a single row.
    pub async fn ensure_menu_item(&self, vendor: &str, item_name: &str) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO menu_items (vendor, item_name)
            VALUES (?, ?)
            ON CONFLICT (vendor, item_name) DO UPDATE SET vendor = excluded.vendor
            RETURNING id
            "#,
        )
        .bind(vendor)
        .bind(item_name)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn find_menu_item(
        &self,
        vendor: &str,
        item_name: &str,
    ) -> StoreResult<Option<MenuItem>> {
        let row = sqlx::query(
            "SELECT id, vendor, item_name FROM menu_items WHERE vendor = ? AND item_name = ?",
        )
        .bind(vendor)
        .bind(item_name)
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| -> StoreResult<MenuItem> {
            Ok(MenuItem {
                id: row.try_get("id")?,
                vendor: row.try_get("vendor")?,
                item_name: row.try_get("item_name")?,
            })
        })
        .transpose()
    }

    /// Appends one observation. A single INSERT, so it is either fully written or absent.
    pub async fn record_price(
        &self,
        menu_item_id: i64,
        page_id: i64,
        price: Price,
        currency: &str,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO prices (menu_item_id, page_id, price_cents, currency, observed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(menu_item_id)
        .bind(page_id)
        .bind(price.minor_units())
        .bind(currency)
        .bind(iso_utc(observed_at))
        .execute(self.pool())
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn observations_for_item(
        &self,
        menu_item_id: i64,
    ) -> StoreResult<Vec<PriceObservation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, menu_item_id, page_id, price_cents, currency, observed_at
              FROM prices
             WHERE menu_item_id = ?
             ORDER BY observed_at, id
            "#,
        )
        .bind(menu_item_id)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let observed_at: String = row.try_get("observed_at")?;
            out.push(PriceObservation {
                id: row.try_get("id")?,
                menu_item_id: row.try_get("menu_item_id")?,
                page_id: row.try_get("page_id")?,
                price: Price::from_minor_units(row.try_get("price_cents")?),
                currency: row.try_get("currency")?,
                observed_at: decode_timestamp("prices.observed_at", &observed_at)?,
            });
        }
        Ok(out)
    }

    pub async fn count_prices(&self) -> StoreResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM prices")
            .fetch_one(self.pool())
            .await?)
    }

    /// Anti-join: pages with no observation linked to a menu item named `item_name`,
    /// in ascending page id order.
    pub async fn pages_missing_price(&self, item_name: &str) -> StoreResult<Vec<CandidatePage>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.source_url
              FROM pages p
             WHERE NOT EXISTS (
                   SELECT 1
                     FROM prices r
                     JOIN menu_items m ON m.id = r.menu_item_id
                    WHERE r.page_id = p.id
                      AND m.item_name = ?
             )
             ORDER BY p.id
            "#,
        )
        .bind(item_name)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<CandidatePage> {
                Ok(CandidatePage {
                    page_id: row.try_get("id")?,
                    source_url: row.try_get("source_url")?,
                })
            })
            .collect()
    }
}
