//! Per-bucket rollup maintenance.
//!
//! Concurrent workers updating the same bucket serialise on
//! `SELECT ... FOR NO KEY UPDATE`; the insert race for a new bucket is
//! resolved with `ON CONFLICT DO NOTHING` plus a retry of the locking
//! read, all inside one read-committed transaction.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Event, EventSummary, TimeRange};

const SUMMARY_COLUMNS: &str =
    "bucket_start, bucket_end, total_count, by_severity, by_type, sample_events";

impl super::Db {
    /// Fold one newly persisted event into its bucket's rollup row,
    /// creating the row if this is the bucket's first event.
    pub async fn update_summary(&self, event: &Event, width: chrono::Duration) -> Result<()> {
        let bucket_start = event.bucket_start(width);
        let mut tx = self.pool().begin().await?;

        loop {
            let row: Option<SummaryRow> = sqlx::query_as(&format!(
                "SELECT {SUMMARY_COLUMNS} FROM event_summaries
                 WHERE bucket_start = $1 FOR NO KEY UPDATE"
            ))
            .bind(bucket_start)
            .fetch_optional(&mut *tx)
            .await?;

            match row {
                Some(row) => {
                    let mut summary = row.into_summary()?;
                    summary.absorb(event);
                    sqlx::query(
                        "UPDATE event_summaries
                         SET total_count = $2, by_severity = $3, by_type = $4, sample_events = $5
                         WHERE bucket_start = $1",
                    )
                    .bind(bucket_start)
                    .bind(summary.total_count as i32)
                    .bind(serde_json::to_value(&summary.by_severity)?)
                    .bind(serde_json::to_value(&summary.by_type)?)
                    .bind(serde_json::to_value(&summary.sample_events)?)
                    .execute(&mut *tx)
                    .await?;
                    break;
                }
                None => {
                    let summary = EventSummary::seed(event, bucket_start, width);
                    let inserted = sqlx::query(
                        "INSERT INTO event_summaries
                         (bucket_start, bucket_end, total_count, by_severity, by_type, sample_events)
                         VALUES ($1, $2, $3, $4, $5, $6)
                         ON CONFLICT (bucket_start) DO NOTHING",
                    )
                    .bind(summary.bucket_start)
                    .bind(summary.bucket_end)
                    .bind(summary.total_count as i32)
                    .bind(serde_json::to_value(&summary.by_severity)?)
                    .bind(serde_json::to_value(&summary.by_type)?)
                    .bind(serde_json::to_value(&summary.sample_events)?)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

                    if inserted == 1 {
                        break;
                    }
                    // A concurrent worker created the row between our read
                    // and insert; the locking SELECT will see it now.
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch summaries ordered by bucket_start ascending, optionally
    /// bounded to buckets starting within the range.
    pub async fn fetch_summaries(
        &self,
        range: Option<&TimeRange>,
        limit: i64,
    ) -> Result<Vec<EventSummary>> {
        let rows: Vec<SummaryRow> = match range {
            Some(range) => {
                sqlx::query_as(&format!(
                    "SELECT {SUMMARY_COLUMNS} FROM event_summaries
                     WHERE bucket_start >= $1 AND bucket_start <= $2
                     ORDER BY bucket_start ASC LIMIT $3"
                ))
                .bind(range.start)
                .bind(range.end)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {SUMMARY_COLUMNS} FROM event_summaries
                     ORDER BY bucket_start ASC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.into_iter().map(SummaryRow::into_summary).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct SummaryRow {
    bucket_start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
    total_count: i32,
    by_severity: serde_json::Value,
    by_type: serde_json::Value,
    sample_events: serde_json::Value,
}

impl SummaryRow {
    fn into_summary(self) -> Result<EventSummary> {
        Ok(EventSummary {
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
            total_count: i64::from(self.total_count),
            by_severity: serde_json::from_value(self.by_severity)?,
            by_type: serde_json::from_value(self.by_type)?,
            sample_events: serde_json::from_value(self.sample_events)?,
        })
    }
}
