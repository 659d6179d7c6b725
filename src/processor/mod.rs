//! Stream consumer: poll the durable queue, decode events, route poison
//! messages to the DLQ, persist in batches, then archive (commit).
//!
//! Two tasks share a bounded channel: the consume loop reads and decodes
//! messages, the batch loop accumulates them and flushes on size or time.
//! Messages are archived only after the store write returns, so delivery
//! is at-least-once and the store's `ON CONFLICT (id) DO NOTHING` makes
//! redelivery harmless. A message that fails to decode is still forwarded
//! (without an event) so its archive happens with the batch; the DLQ is
//! authoritative for that record.

pub mod dlq;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::queue::QueueMessage;
use crate::db::Db;
use crate::error::Result;
use crate::model::Event;
use crate::telemetry::metrics;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub events_queue: String,
    pub dlq_queue: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub visibility_timeout_secs: i32,
    pub bucket_width: chrono::Duration,
    /// How long to idle when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            events_queue: "events".to_string(),
            dlq_queue: "events_dlq".to_string(),
            batch_size: 100,
            flush_interval: Duration::from_millis(500),
            visibility_timeout_secs: 30,
            bucket_width: chrono::Duration::minutes(5),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// One decoded message heading for the batcher. `event` is None when the
/// message was routed to the DLQ; the msg_id still rides along so the
/// batch archive advances past it.
struct BatchItem {
    msg_id: i64,
    event: Option<Event>,
}

pub struct Processor {
    db: Arc<Db>,
    cfg: ProcessorConfig,
    ready: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Clone for Processor {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            cfg: self.cfg.clone(),
            ready: Arc::clone(&self.ready),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Processor {
    pub fn new(db: Arc<Db>, cfg: ProcessorConfig) -> Self {
        Self {
            db,
            cfg,
            ready: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Readiness flag, true while the queue is reachable.
    pub fn readiness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Signal the processor to stop. The consume loop exits, the batch
    /// loop drains whatever is buffered, flushes, and returns.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.db.create_queue(&self.cfg.events_queue).await?;
        self.db.create_queue(&self.cfg.dlq_queue).await?;

        let (batch_tx, batch_rx) = mpsc::channel(self.cfg.batch_size * 2);

        let consumer = {
            let p = self.clone();
            tokio::spawn(async move { p.consume(batch_tx).await })
        };
        let batcher = {
            let p = self.clone();
            tokio::spawn(async move { p.process_batches(batch_rx).await })
        };
        let watcher = {
            let p = self.clone();
            tokio::spawn(async move { p.watch_liveness().await })
        };

        info!(queue = %self.cfg.events_queue, "processor started");

        // The consumer exits on shutdown and drops its channel end; the
        // batcher then drains, flushes, and finishes on its own.
        let _ = consumer.await;
        let _ = batcher.await;
        watcher.abort();

        self.ready.store(false, Ordering::SeqCst);
        info!("processor stopped");
        Ok(())
    }

    async fn consume(&self, batch_tx: mpsc::Sender<BatchItem>) {
        loop {
            let read = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("consume loop shutting down");
                    return;
                }
                read = self.db.read_batch(
                    &self.cfg.events_queue,
                    self.cfg.visibility_timeout_secs,
                    self.cfg.batch_size as i32,
                ) => read,
            };

            let msgs = match read {
                Ok(msgs) => msgs,
                Err(e) => {
                    warn!(error = %e, queue = %self.cfg.events_queue, "queue read error");
                    if self.idle().await {
                        return;
                    }
                    continue;
                }
            };

            if msgs.is_empty() {
                if self.idle().await {
                    return;
                }
                continue;
            }

            for msg in msgs {
                let item = self.decode(msg);
                if batch_tx.send(item).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Sleep one poll interval; returns true when shutdown fired instead.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.notified() => true,
            _ = tokio::time::sleep(self.cfg.poll_interval) => false,
        }
    }

    /// Decode and validate one message, routing failures to the DLQ. The
    /// message is forwarded either way so its archive is not held up.
    fn decode(&self, msg: QueueMessage) -> BatchItem {
        let event = match serde_json::from_value::<Event>(msg.message.clone()) {
            Ok(mut event) => {
                event.enrich();
                match event.validate() {
                    Ok(()) => Some(event),
                    Err(e) => {
                        warn!(
                            error = %e,
                            event_id = %event.id,
                            msg_id = msg.msg_id,
                            "invalid event"
                        );
                        self.route_to_dlq(&msg, dlq::REASON_VALIDATION_FAILED, e.to_string());
                        None
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, msg_id = msg.msg_id, "failed to decode event");
                self.route_to_dlq(&msg, dlq::REASON_UNMARSHAL_FAILED, e.to_string());
                None
            }
        };

        BatchItem {
            msg_id: msg.msg_id,
            event,
        }
    }

    fn route_to_dlq(&self, msg: &QueueMessage, reason: &str, error: String) {
        let letter = dlq::DeadLetter::from_message(&self.cfg.events_queue, msg, reason, error);
        dlq::publish(Arc::clone(&self.db), self.cfg.dlq_queue.clone(), letter);
    }

    async fn process_batches(&self, mut batch_rx: mpsc::Receiver<BatchItem>) {
        let mut batch: Vec<BatchItem> = Vec::with_capacity(self.cfg.batch_size);
        let mut ticker = tokio::time::interval(self.cfg.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = batch_rx.recv() => match item {
                    Some(item) => {
                        batch.push(item);
                        if batch.len() >= self.cfg.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    // Channel closed and drained: final flush, then done.
                    None => {
                        self.flush(&mut batch).await;
                        info!("batch loop shutting down");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<BatchItem>) {
        if batch.is_empty() {
            return;
        }

        let start = std::time::Instant::now();
        let events: Vec<Event> = batch.iter().filter_map(|i| i.event.clone()).collect();

        let inserted = match self.db.persist_batch(&events, self.cfg.bucket_width).await {
            Ok(inserted) => inserted,
            Err(e) => {
                // Keep the batch; the next tick retries, and if the
                // visibility timeout lapses first, redelivered copies are
                // deduplicated by the store.
                error!(error = %e, count = events.len(), "failed to write event batch");
                return;
            }
        };

        metrics::events_persisted().add(inserted as u64, &[KeyValue::new("result", "inserted")]);
        let duplicates = events.len().saturating_sub(inserted);
        if duplicates > 0 {
            metrics::events_persisted()
                .add(duplicates as u64, &[KeyValue::new("result", "duplicate")]);
        }

        let msg_ids: Vec<i64> = batch.iter().map(|i| i.msg_id).collect();
        if let Err(e) = self
            .db
            .archive_messages(&self.cfg.events_queue, &msg_ids)
            .await
        {
            error!(error = %e, count = msg_ids.len(), "failed to archive batch");
            // Drop the in-memory batch rather than re-process it; on
            // redelivery the store's ON CONFLICT keeps writes idempotent.
            batch.clear();
            return;
        }

        for item in batch.iter() {
            if let Some(event) = &item.event {
                debug!(
                    event_id = %event.id,
                    source = %event.source,
                    severity = %event.severity,
                    kind = %event.kind,
                    msg_id = item.msg_id,
                    "processed event"
                );
            }
        }

        metrics::operation_duration_ms().record(
            start.elapsed().as_millis() as f64,
            &[KeyValue::new("operation", "processor.flush")],
        );
        batch.clear();
    }

    /// Flip the readiness flag with the queue's reachability.
    async fn watch_liveness(&self) {
        let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
        loop {
            ticker.tick().await;
            let healthy = tokio::time::timeout(LIVENESS_TIMEOUT, self.db.health_check())
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);

            if healthy {
                if self
                    .ready
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    info!("queue connection established");
                }
            } else if self
                .ready
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                warn!("queue not reachable");
            }
        }
    }
}
