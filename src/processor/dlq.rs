//! Dead-letter routing for messages the processor cannot process.
//!
//! The envelope carries the original message base64-encoded so that even a
//! payload that failed to decode survives intact for later inspection.
//! Publishing is fire-and-forget: a DLQ failure is logged but never blocks
//! committing the original message.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::queue::QueueMessage;
use crate::db::Db;
use crate::telemetry::metrics;

pub const REASON_UNMARSHAL_FAILED: &str = "unmarshal_failed";
pub const REASON_VALIDATION_FAILED: &str = "validation_failed";

/// Envelope written to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_queue: String,
    pub original_msg_id: i64,
    /// Base64 of the original message text.
    pub original_value_b64: String,
    pub read_ct: i32,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl DeadLetter {
    pub fn from_message(queue: &str, msg: &QueueMessage, reason: &str, error: String) -> Self {
        let raw = msg.message.to_string();
        Self {
            original_queue: queue.to_string(),
            original_msg_id: msg.msg_id,
            original_value_b64: BASE64.encode(raw.as_bytes()),
            read_ct: msg.read_ct,
            failed_at: Utc::now(),
            reason: reason.to_string(),
            error,
        }
    }
}

/// Publish asynchronously; the caller moves on immediately.
pub(crate) fn publish(db: Arc<Db>, dlq_queue: String, letter: DeadLetter) {
    tokio::spawn(async move {
        let payload = match serde_json::to_value(&letter) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    error = %e,
                    original_msg_id = letter.original_msg_id,
                    "failed to serialize dead letter"
                );
                return;
            }
        };

        match db.send_to_queue(&dlq_queue, &payload).await {
            Ok(dlq_msg_id) => {
                metrics::dlq_messages().add(1, &[KeyValue::new("reason", letter.reason.clone())]);
                debug!(
                    reason = %letter.reason,
                    original_msg_id = letter.original_msg_id,
                    dlq_msg_id,
                    "message sent to DLQ"
                );
            }
            Err(e) => {
                warn!(
                    error = %e,
                    original_msg_id = letter.original_msg_id,
                    reason = %letter.reason,
                    "failed to produce to DLQ"
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_preserves_undecodable_payload() {
        let msg = QueueMessage {
            msg_id: 7,
            read_ct: 2,
            enqueued_at: Utc::now(),
            vt: Utc::now(),
            message: serde_json::Value::String("not-json".to_string()),
        };
        let letter = DeadLetter::from_message("events", &msg, REASON_UNMARSHAL_FAILED, "bad".into());

        assert_eq!(letter.original_queue, "events");
        assert_eq!(letter.original_msg_id, 7);
        assert_eq!(letter.read_ct, 2);
        assert_eq!(letter.reason, REASON_UNMARSHAL_FAILED);
        let decoded = BASE64.decode(&letter.original_value_b64).unwrap();
        assert_eq!(decoded, b"\"not-json\"");
    }

    #[test]
    fn envelope_omits_empty_error_on_the_wire() {
        let msg = QueueMessage {
            msg_id: 1,
            read_ct: 1,
            enqueued_at: Utc::now(),
            vt: Utc::now(),
            message: serde_json::json!({}),
        };
        let letter = DeadLetter::from_message("events", &msg, REASON_VALIDATION_FAILED, String::new());
        let raw = serde_json::to_value(&letter).unwrap();
        assert!(raw.get("error").is_none());
        assert_eq!(raw["reason"], REASON_VALIDATION_FAILED);
    }
}
