use crate::breaker::{BreakerError, CircuitBreaker};
use crate::metrics::Metrics;
use crate::processor::DataProcessor;
use crate::queue::DurableQueue;
use crate::validator;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub accepted: AtomicU64,
    pub dropped_decode: AtomicU64,
    pub dropped_validation: AtomicU64,
    pub duplicates: AtomicU64,
    pub enqueue_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_decode: self.dropped_decode.load(Ordering::Relaxed),
            dropped_validation: self.dropped_validation.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub dropped_decode: u64,
    pub dropped_validation: u64,
    pub duplicates: u64,
    pub enqueue_failures: u64,
    pub reconnects: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

/// Validator -> processor -> durable queue, with the circuit breaker
/// guarding the queue backend. One instance shared by the transport
/// listener and the HTTP surface.
#[derive(Clone)]
pub struct IngestPipeline {
    processor: Arc<DataProcessor>,
    queue: Arc<DurableQueue>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    stats: Arc<IngestStats>,
}

impl IngestPipeline {
    pub fn new(
        processor: Arc<DataProcessor>,
        queue: Arc<DurableQueue>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            processor,
            queue,
            breaker,
            metrics,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn processor(&self) -> &DataProcessor {
        &self.processor
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Runs one transport message through the full pipeline. Errors local to
    /// the message end here: a log line plus a metric increment, never a
    /// propagated failure.
    pub async fn handle_payload(&self, topic: &str, payload: &[u8]) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        // Malformed transport envelopes are not retryable; drop.
        let raw: Value = match serde_json::from_slice(payload) {
            Ok(raw) => raw,
            Err(err) => {
                self.stats.dropped_decode.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_error("decode", "unknown");
                tracing::warn!(topic, error = %err, "failed to decode payload");
                return;
            }
        };

        // A schema violation will not fix itself on retry; drop.
        let reading = match validator::validate(&raw) {
            Ok(reading) => reading,
            Err(err) => {
                self.stats.dropped_validation.fetch_add(1, Ordering::Relaxed);
                let device_id = raw
                    .get("device_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                self.metrics.record_error("validation", device_id);
                tracing::warn!(topic, device = device_id, error = %err, "rejected reading");
                return;
            }
        };
        self.metrics
            .observe_latency("validate", started.elapsed().as_secs_f64());

        let device_id = reading.device_id.clone();
        let process_started = Instant::now();
        let Some(enriched) = self.processor.process(reading) else {
            // Expected and routine; not an error.
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(device = %device_id, "dropped duplicate reading");
            return;
        };
        self.metrics
            .observe_latency("process", process_started.elapsed().as_secs_f64());

        let enqueue_started = Instant::now();
        let result = self
            .breaker
            .call(|| async { self.queue.enqueue(&enriched).await })
            .await;
        match result {
            Ok(message_id) => {
                self.metrics
                    .observe_latency("enqueue", enqueue_started.elapsed().as_secs_f64());
                for kind in enriched.reading.sensors.kinds() {
                    self.metrics
                        .ingested_total
                        .with_label_values(&[device_id.as_str(), kind])
                        .inc();
                }
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(device = %device_id, message_id = %message_id, "reading enqueued");
            }
            Err(BreakerError::Open) => {
                self.stats.enqueue_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_error("circuit_open", &device_id);
                self.stats.record_error("circuit open");
                tracing::warn!(device = %device_id, "enqueue rejected; circuit open");
            }
            Err(BreakerError::Service(err)) => {
                self.stats.enqueue_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_error("backend", &device_id);
                self.stats.record_error(err.to_string());
                tracing::warn!(device = %device_id, error = %err, "enqueue failed");
            }
        }
    }
}
