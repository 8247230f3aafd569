use crate::backend::{BackendError, QueueBackend};
use crate::metrics::Metrics;
use crate::reading::{EnrichedReading, QueueMessage};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const BACKEND_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Event pushed to live subscribers on successful enqueue.
pub type LiveEvent = Arc<EnrichedReading>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    DeadLettered,
}

/// FIFO work queue over the shared list backend, with retry counting and a
/// dead-letter list for poison messages. A separate persistence worker
/// drains it; this process only feeds it.
pub struct DurableQueue {
    backend: Arc<dyn QueueBackend>,
    queue_name: String,
    dlq_name: String,
    max_retry_attempts: u32,
    retry_delay: Duration,
    live_tx: broadcast::Sender<LiveEvent>,
    metrics: Arc<Metrics>,
}

impl DurableQueue {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        queue_name: impl Into<String>,
        max_retry_attempts: u32,
        retry_delay: Duration,
        live_tx: broadcast::Sender<LiveEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let queue_name = queue_name.into();
        let dlq_name = format!("{queue_name}:dlq");
        Self {
            backend,
            queue_name,
            dlq_name,
            max_retry_attempts,
            retry_delay,
            live_tx,
            metrics,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn dlq_name(&self) -> &str {
        &self.dlq_name
    }

    /// Wraps the reading in a fresh envelope and pushes it to the head of
    /// the main list. On success a best-effort live event goes out to the
    /// fan-out channel; nobody listening is fine.
    pub async fn enqueue(&self, data: &EnrichedReading) -> Result<Uuid, BackendError> {
        let message = QueueMessage::new(data.clone());
        let payload = encode(&message)?;
        with_timeout(self.backend.push_head(&self.queue_name, payload)).await?;
        self.refresh_depth_gauges().await;

        let _ = self.live_tx.send(Arc::new(data.clone()));
        tracing::trace!(message_id = %message.id, device = %data.reading.device_id, "enqueued reading");
        Ok(message.id)
    }

    /// Pops the oldest message, or `None` when the queue is empty. Never
    /// blocks; callers poll. A payload that no longer deserializes is moved
    /// raw to the DLQ instead of being handed out.
    pub async fn dequeue(&self) -> Result<Option<QueueMessage>, BackendError> {
        let Some(payload) = with_timeout(self.backend.pop_tail(&self.queue_name)).await? else {
            return Ok(None);
        };
        self.refresh_depth_gauges().await;
        match serde_json::from_str::<QueueMessage>(&payload) {
            Ok(message) => Ok(Some(message)),
            Err(err) => {
                tracing::warn!(error = %err, "undecodable queue payload; moving to DLQ");
                with_timeout(self.backend.push_head(&self.dlq_name, payload)).await?;
                self.refresh_depth_gauges().await;
                Ok(None)
            }
        }
    }

    /// Records a failed processing cycle. The message goes back to the head
    /// after a fixed delay, or to the DLQ once `max_retry_attempts` is
    /// reached.
    pub async fn requeue_with_retry(
        &self,
        mut message: QueueMessage,
        error: &str,
    ) -> Result<RequeueOutcome, BackendError> {
        message.attempts += 1;
        message.last_attempt_at = Some(Utc::now());
        message.error = Some(error.to_string());

        if message.attempts >= self.max_retry_attempts {
            tracing::warn!(
                message_id = %message.id,
                attempts = message.attempts,
                error,
                "retries exhausted; dead-lettering message"
            );
            self.metrics
                .record_error("retry_exhausted", &message.data.reading.device_id);
            self.move_to_dlq(&message).await?;
            return Ok(RequeueOutcome::DeadLettered);
        }

        // Fixed backoff, deliberately not exponential.
        tokio::time::sleep(self.retry_delay).await;
        let payload = encode(&message)?;
        with_timeout(self.backend.push_head(&self.queue_name, payload)).await?;
        self.refresh_depth_gauges().await;
        tracing::debug!(message_id = %message.id, attempts = message.attempts, "requeued message");
        Ok(RequeueOutcome::Requeued)
    }

    /// Parks the message on the dead-letter list. DLQ entries are never
    /// auto-replayed; replay is an operator action.
    pub async fn move_to_dlq(&self, message: &QueueMessage) -> Result<(), BackendError> {
        let payload = encode(message)?;
        with_timeout(self.backend.push_head(&self.dlq_name, payload)).await?;
        self.refresh_depth_gauges().await;
        Ok(())
    }

    pub async fn depth(&self) -> Result<u64, BackendError> {
        with_timeout(self.backend.len(&self.queue_name)).await
    }

    pub async fn dlq_depth(&self) -> Result<u64, BackendError> {
        with_timeout(self.backend.len(&self.dlq_name)).await
    }

    async fn refresh_depth_gauges(&self) {
        match self.depth().await {
            Ok(depth) => self.metrics.set_queue_depth(&self.queue_name, depth),
            Err(err) => tracing::debug!(error = %err, "failed to read queue depth"),
        }
        match self.dlq_depth().await {
            Ok(depth) => self.metrics.set_queue_depth(&self.dlq_name, depth),
            Err(err) => tracing::debug!(error = %err, "failed to read DLQ depth"),
        }
    }
}

fn encode(message: &QueueMessage) -> Result<String, BackendError> {
    Ok(serde_json::to_string(message)?)
}

// A hung backend call must not stall the listener.
async fn with_timeout<T>(
    op: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(BACKEND_CALL_TIMEOUT, op).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Unavailable(format!(
            "backend call timed out after {}s",
            BACKEND_CALL_TIMEOUT.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::reading::{PirReading, ProcessingStatus, SensorReading, SensorSet};

    fn enriched(device_id: &str, timestamp: &str) -> EnrichedReading {
        EnrichedReading {
            reading: SensorReading {
                device_id: device_id.to_string(),
                timestamp: timestamp.to_string(),
                sensors: SensorSet {
                    pir: Some(PirReading {
                        motion_detected: true,
                    }),
                    ..Default::default()
                },
            },
            received_at: Utc::now(),
            processing_status: ProcessingStatus::Pending,
            device_metadata: None,
        }
    }

    fn queue_over(backend: Arc<MemoryBackend>) -> (DurableQueue, broadcast::Receiver<LiveEvent>) {
        let (live_tx, live_rx) = broadcast::channel(16);
        let metrics = Arc::new(Metrics::new().unwrap());
        let queue = DurableQueue::new(
            backend,
            "readings",
            3,
            Duration::from_millis(1),
            live_tx,
            metrics,
        );
        (queue, live_rx)
    }

    #[tokio::test]
    async fn enqueue_wraps_and_dequeue_unwraps_fifo() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, _live_rx) = queue_over(backend);

        let first = queue.enqueue(&enriched("esp32-1", "t1")).await.unwrap();
        let second = queue.enqueue(&enriched("esp32-1", "t2")).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(queue.depth().await.unwrap(), 2);

        let message = queue.dequeue().await.unwrap().expect("first out");
        assert_eq!(message.id, first);
        assert_eq!(message.attempts, 0);
        assert_eq!(message.data.reading.timestamp, "t1");

        let message = queue.dequeue().await.unwrap().expect("second out");
        assert_eq!(message.id, second);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_publishes_one_live_event() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, mut live_rx) = queue_over(backend);

        queue.enqueue(&enriched("esp32-1", "t1")).await.unwrap();
        let event = live_rx.try_recv().expect("live event");
        assert_eq!(event.reading.device_id, "esp32-1");
        assert!(live_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn requeue_moves_to_dlq_only_after_max_attempts() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, _live_rx) = queue_over(backend.clone());

        queue.enqueue(&enriched("esp32-1", "t1")).await.unwrap();

        for attempt in 1..3 {
            let message = queue.dequeue().await.unwrap().expect("message");
            let outcome = queue
                .requeue_with_retry(message, "sink unavailable")
                .await
                .unwrap();
            assert_eq!(outcome, RequeueOutcome::Requeued, "attempt {attempt}");
            assert_eq!(queue.depth().await.unwrap(), 1);
            assert_eq!(queue.dlq_depth().await.unwrap(), 0);
        }

        let message = queue.dequeue().await.unwrap().expect("message");
        assert_eq!(message.attempts, 2);
        assert_eq!(message.error.as_deref(), Some("sink unavailable"));
        let outcome = queue
            .requeue_with_retry(message, "sink unavailable")
            .await
            .unwrap();
        assert_eq!(outcome, RequeueOutcome::DeadLettered);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.dlq_depth().await.unwrap(), 1);

        let dlq = backend.snapshot("readings:dlq");
        let parked: QueueMessage = serde_json::from_str(&dlq[0]).unwrap();
        assert_eq!(parked.attempts, 3);
        assert!(parked.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn undecodable_payload_is_parked_in_dlq() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, _live_rx) = queue_over(backend.clone());

        backend
            .push_head("readings", "not json".to_string())
            .await
            .unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(backend.snapshot("readings:dlq"), vec!["not json".to_string()]);
    }

    #[tokio::test]
    async fn enqueue_surfaces_backend_failure() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, _live_rx) = queue_over(backend.clone());
        backend.set_available(false);
        assert!(queue.enqueue(&enriched("esp32-1", "t1")).await.is_err());
    }
}
