//! Event store operations: idempotent inserts and range queries.
//!
//! All inserts go through `ON CONFLICT (id) DO NOTHING`, so redelivered
//! messages are harmless and offset commits can trail the writes.

use std::collections::HashSet;

use sqlx::{Postgres, QueryBuilder, Row};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{Event, Severity, TimeRange};

const EVENT_COLUMNS: &str = "id, timestamp, source, severity, event_type, payload";

impl super::Db {
    /// Insert a single event. Returns true when the row is new; a conflict
    /// on the primary key is a successful no-op returning false.
    pub async fn insert_event(&self, event: &Event) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO events (id, timestamp, source, severity, event_type, payload)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(event.severity as i16)
        .bind(&event.kind)
        .bind(serde_json::Value::Object(event.payload.clone()))
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert a batch in a single multi-row statement. Returns the ids of
    /// rows that were actually inserted (duplicates are absent from the
    /// result), which is what gates the summary updates.
    pub async fn insert_events_batch(&self, events: &[Event]) -> Result<Vec<String>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO events (id, timestamp, source, severity, event_type, payload) ",
        );
        builder.push_values(events, |mut row, event| {
            row.push_bind(&event.id)
                .push_bind(event.timestamp)
                .push_bind(&event.source)
                .push_bind(event.severity as i16)
                .push_bind(&event.kind)
                .push_bind(serde_json::Value::Object(event.payload.clone()));
        });
        builder.push(" ON CONFLICT (id) DO NOTHING RETURNING id");

        let rows = builder.build().fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    /// Persist a batch and roll up summaries for every newly inserted row.
    ///
    /// If the multi-row insert fails, falls back to per-row inserts so one
    /// poison record cannot stall the rest; per-row errors are logged and
    /// skipped. Returns an error only when every row of the fallback fails
    /// too, which the caller treats as "do not commit, let redelivery
    /// happen". Summary failures are logged and swallowed: the event write
    /// is authoritative and rollups are eventually consistent.
    pub async fn persist_batch(
        &self,
        events: &[Event],
        bucket_width: chrono::Duration,
    ) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        match self.insert_events_batch(events).await {
            Ok(new_ids) => {
                let new: HashSet<&str> = new_ids.iter().map(String::as_str).collect();
                for event in events.iter().filter(|e| new.contains(e.id.as_str())) {
                    self.update_summary_best_effort(event, bucket_width).await;
                }
                Ok(new_ids.len())
            }
            Err(batch_err) => {
                warn!(
                    error = %batch_err,
                    count = events.len(),
                    "batch insert failed, falling back to per-row inserts"
                );

                let mut inserted = 0usize;
                let mut failed = 0usize;
                let mut last_err = None;
                for event in events {
                    match self.insert_event(event).await {
                        Ok(true) => {
                            inserted += 1;
                            self.update_summary_best_effort(event, bucket_width).await;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(error = %e, event_id = %event.id, "failed to insert event");
                            failed += 1;
                            last_err = Some(e);
                        }
                    }
                }

                if failed == events.len() {
                    Err(last_err.unwrap_or(Error::Internal("batch insert failed".to_string())))
                } else {
                    Ok(inserted)
                }
            }
        }
    }

    async fn update_summary_best_effort(&self, event: &Event, bucket_width: chrono::Duration) {
        if let Err(e) = self.update_summary(event, bucket_width).await {
            warn!(error = %e, event_id = %event.id, "failed to update bucket summary");
        }
    }

    /// Fetch events ordered by timestamp descending, optionally bounded to
    /// a time range.
    pub async fn fetch_events(
        &self,
        range: Option<&TimeRange>,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = match range {
            Some(range) => {
                sqlx::query_as(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE timestamp >= $1 AND timestamp <= $2
                     ORDER BY timestamp DESC LIMIT $3"
                ))
                .bind(range.start)
                .bind(range.end)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events ORDER BY timestamp DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.into_iter().map(EventRow::try_into_event).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    source: String,
    severity: i16,
    event_type: String,
    payload: serde_json::Value,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event> {
        let severity = u8::try_from(self.severity)
            .ok()
            .and_then(|v| Severity::try_from(v).ok())
            .ok_or_else(|| {
                Error::Internal(format!(
                    "event {} has invalid stored severity {}",
                    self.id, self.severity
                ))
            })?;
        let payload = match self.payload {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Ok(Event {
            id: self.id,
            timestamp: self.timestamp,
            source: self.source,
            severity,
            kind: self.event_type,
            payload,
        })
    }
}
