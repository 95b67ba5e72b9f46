use chrono::{DateTime, Utc};
use mpt_core::{iso_utc, Page};
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::{decode_timestamp, Database, DedupPolicy, StoreError, StoreResult};

/// Outcome of a `store_page` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub page_id: i64,
    pub content_sha256: String,
    pub fetched_at: DateTime<Utc>,
    pub byte_size: usize,
    /// True when no row was inserted and an existing page id was returned.
    pub deduplicated: bool,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl Database {
    /// Stores one fetched document.
    ///
    /// Replaying the same `(source_url, fetched_at)` with the same bytes is a no-op returning
    /// the existing id. The same key with different bytes is an integrity error. `fetched_at`
    /// defaults to the current UTC time and is kept at full precision.
    pub async fn store_page(
        &self,
        run_id: i64,
        source_url: &str,
        raw_bytes: &[u8],
        http_status: u16,
        fetched_at: Option<DateTime<Utc>>,
    ) -> StoreResult<StoredPage> {
        let fetched_at = fetched_at.unwrap_or_else(Utc::now);
        let fetched_at_text = iso_utc(fetched_at);
        let content_sha256 = sha256_hex(raw_bytes);

        if self.dedup_policy() == DedupPolicy::Fingerprint {
            if let Some(page_id) = self.latest_page_with_hash(source_url, &content_sha256).await? {
                tracing::debug!(page_id, source_url, "unchanged content, reusing latest page");
                return Ok(StoredPage {
                    page_id,
                    content_sha256,
                    fetched_at,
                    byte_size: raw_bytes.len(),
                    deduplicated: true,
                });
            }
        }

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO pages
                (run_id, source_url, fetched_at, content_blob, http_status, content_sha256)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (source_url, fetched_at) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(source_url)
        .bind(&fetched_at_text)
        .bind(raw_bytes)
        .bind(i64::from(http_status))
        .bind(&content_sha256)
        .fetch_optional(self.pool())
        .await?;

        if let Some(page_id) = inserted {
            tracing::debug!(page_id, run_id, source_url, bytes = raw_bytes.len(), "stored page");
            return Ok(StoredPage {
                page_id,
                content_sha256,
                fetched_at,
                byte_size: raw_bytes.len(),
                deduplicated: false,
            });
        }

        let existing = sqlx::query(
            "SELECT id, content_sha256 FROM pages WHERE source_url = ? AND fetched_at = ?",
        )
        .bind(source_url)
        .bind(&fetched_at_text)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| {
            StoreError::Integrity(format!(
                "insert for {source_url} at {fetched_at_text} was ignored but no page exists"
            ))
        })?;
        let page_id: i64 = existing.try_get("id")?;
        let stored_sha256: String = existing.try_get("content_sha256")?;
        if stored_sha256 != content_sha256 {
            return Err(StoreError::Integrity(format!(
                "page {page_id} for {source_url} at {fetched_at_text} holds different content"
            )));
        }

        tracing::debug!(page_id, source_url, "page already stored for this fetch time");
        Ok(StoredPage {
            page_id,
            content_sha256: stored_sha256,
            fetched_at,
            byte_size: raw_bytes.len(),
            deduplicated: true,
        })
    }

    async fn latest_page_with_hash(
        &self,
        source_url: &str,
        content_sha256: &str,
    ) -> StoreResult<Option<i64>> {
        let latest = sqlx::query(
            "SELECT id, content_sha256 FROM pages WHERE source_url = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(source_url)
        .fetch_optional(self.pool())
        .await?;
        match latest {
            Some(row) => {
                let hash: String = row.try_get("content_sha256")?;
                if hash != content_sha256 {
                    return Ok(None);
                }
                let page_id: i64 = row.try_get("id")?;
                Ok(Some(page_id))
            }
            None => Ok(None),
        }
    }

    pub async fn get_page_content(&self, page_id: i64) -> StoreResult<Vec<u8>> {
        let content: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT content_blob FROM pages WHERE id = ?")
                .bind(page_id)
                .fetch_optional(self.pool())
                .await?;
        content.ok_or(StoreError::PageNotFound(page_id))
    }

    pub async fn get_page(&self, page_id: i64) -> StoreResult<Page> {
        let row = sqlx::query(
            r#"
            SELECT id, run_id, source_url, fetched_at, content_blob, http_status, content_sha256
              FROM pages
             WHERE id = ?
            "#,
        )
        .bind(page_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::PageNotFound(page_id))?;

        let fetched_at: String = row.try_get("fetched_at")?;
        let http_status: i64 = row.try_get("http_status")?;
        Ok(Page {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            source_url: row.try_get("source_url")?,
            fetched_at: decode_timestamp("pages.fetched_at", &fetched_at)?,
            raw_content: row.try_get("content_blob")?,
            http_status: u16::try_from(http_status).map_err(|_| StoreError::InvalidValue {
                column: "pages.http_status",
                value: http_status.to_string(),
            })?,
            content_sha256: row.try_get("content_sha256")?,
        })
    }

    pub async fn count_pages(&self) -> StoreResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM pages")
            .fetch_one(self.pool())
            .await?)
    }
}
