//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive. Archiving is the commit step: a read message reappears
//! after its visibility timeout unless archived, which is what gives the
//! processor at-least-once delivery.

use opentelemetry::KeyValue;

use crate::error::Result;
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new("operation", "create"),
            ],
        );
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(queue_name)
            .bind(payload)
            .fetch_one(self.pool())
            .await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new("operation", "send"),
            ],
        );
        Ok(row.0)
    }

    /// Read up to `qty` messages (visibility timeout in seconds).
    /// Returns an empty vec when the queue has nothing ready.
    pub async fn read_batch(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        qty: i32,
    ) -> Result<Vec<QueueMessage>> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3)")
        .bind(queue_name)
        .bind(vt_seconds)
        .bind(qty)
        .fetch_all(self.pool())
        .await?;

        let msgs: Vec<QueueMessage> = rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, vt, message)| QueueMessage {
                msg_id,
                read_ct,
                enqueued_at,
                vt,
                message,
            })
            .collect();

        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new(
                    "operation",
                    if msgs.is_empty() { "read_empty" } else { "read" },
                ),
            ],
        );

        Ok(msgs)
    }

    /// Archive a batch of messages (moves to the archive table, preserves
    /// for audit). This is the offset-commit equivalent.
    pub async fn archive_messages(&self, queue_name: &str, msg_ids: &[i64]) -> Result<()> {
        if msg_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("SELECT pgmq.archive($1, $2::bigint[])")
            .bind(queue_name)
            .bind(msg_ids)
            .execute(self.pool())
            .await?;
        metrics::queue_operations().add(
            msg_ids.len() as u64,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new("operation", "archive"),
            ],
        );
        Ok(())
    }
}
