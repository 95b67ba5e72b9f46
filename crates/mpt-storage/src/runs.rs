use chrono::Utc;
use mpt_core::{iso_utc, RunStatus, ScrapeRun};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::{decode_timestamp, Database, StoreError, StoreResult};

impl Database {
    /// Opens a run with status `ok` and no finish time.
    pub async fn start_run(&self) -> StoreResult<i64> {
        let run_id = sqlx::query("INSERT INTO scrape_runs (started_at, status) VALUES (?, ?)")
            .bind(iso_utc(Utc::now()))
            .bind(RunStatus::Ok.as_str())
            .execute(self.pool())
            .await?
            .last_insert_rowid();
        tracing::info!(run_id, "scrape run started");
        Ok(run_id)
    }

    /// Closes a run exactly once; a finished run is never updated again.
    pub async fn finish_run(&self, run_id: i64, status: RunStatus) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET finished_at = ?, status = ?
             WHERE id = ? AND finished_at IS NULL
            "#,
        )
        .bind(iso_utc(Utc::now()))
        .bind(status.as_str())
        .bind(run_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_run(run_id).await? {
                Some(_) => Err(StoreError::RunAlreadyFinished(run_id)),
                None => Err(StoreError::RunNotFound(run_id)),
            };
        }
        tracing::info!(run_id, %status, "scrape run finished");
        Ok(())
    }

    pub async fn get_run(&self, run_id: i64) -> StoreResult<Option<ScrapeRun>> {
        let row =
            sqlx::query("SELECT id, started_at, finished_at, status FROM scrape_runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(self.pool())
                .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Runs that never recorded a finish time, typically after a crash.
    pub async fn unfinished_runs(&self) -> StoreResult<Vec<ScrapeRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, started_at, finished_at, status
              FROM scrape_runs
             WHERE finished_at IS NULL
             ORDER BY id
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}

fn run_from_row(row: &SqliteRow) -> StoreResult<ScrapeRun> {
    let started_at: String = row.try_get("started_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    let status: String = row.try_get("status")?;
    Ok(ScrapeRun {
        id: row.try_get("id")?,
        started_at: decode_timestamp("scrape_runs.started_at", &started_at)?,
        finished_at: finished_at
            .as_deref()
            .map(|v| decode_timestamp("scrape_runs.finished_at", v))
            .transpose()?,
        status: status.parse().map_err(|_| StoreError::InvalidValue {
            column: "scrape_runs.status",
            value: status.clone(),
        })?,
    })
}
