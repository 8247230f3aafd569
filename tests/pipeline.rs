use sensor_ingest::backend::MemoryBackend;
use sensor_ingest::breaker::CircuitBreaker;
use sensor_ingest::ingest::IngestPipeline;
use sensor_ingest::metrics::Metrics;
use sensor_ingest::processor::DataProcessor;
use sensor_ingest::queue::{DurableQueue, LiveEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn build_pipeline(
    backend: Arc<MemoryBackend>,
    threshold: u32,
) -> (IngestPipeline, broadcast::Receiver<LiveEvent>) {
    let metrics = Arc::new(Metrics::new().unwrap());
    let (live_tx, live_rx) = broadcast::channel(64);
    let queue = Arc::new(DurableQueue::new(
        backend,
        "sensor-readings",
        3,
        Duration::from_millis(1),
        live_tx,
        metrics.clone(),
    ));
    let breaker = Arc::new(CircuitBreaker::new(threshold, Duration::from_secs(60)));
    let processor = Arc::new(DataProcessor::new(100, 50));
    (
        IngestPipeline::new(processor, queue, breaker, metrics),
        live_rx,
    )
}

const PIR_PAYLOAD: &str =
    r#"{"device_id":"esp32-1","timestamp":"2025-01-01T00:00:00Z","sensors":{"pir":{"motion_detected":true}}}"#;

#[tokio::test]
async fn accepted_reading_is_enqueued_broadcast_and_counted_once() {
    let backend = Arc::new(MemoryBackend::new());
    let (pipeline, mut live_rx) = build_pipeline(backend, 5);

    pipeline
        .handle_payload("sensors/esp32-1/pir", PIR_PAYLOAD.as_bytes())
        .await;

    assert_eq!(pipeline.queue().depth().await.unwrap(), 1);
    let event = live_rx.try_recv().expect("one live event");
    assert_eq!(event.reading.device_id, "esp32-1");
    assert!(live_rx.try_recv().is_err());
    assert_eq!(
        pipeline
            .metrics()
            .ingested_total
            .with_label_values(&["esp32-1", "pir"])
            .get(),
        1
    );

    let message = pipeline.queue().dequeue().await.unwrap().expect("queued");
    assert_eq!(message.data.reading.device_id, "esp32-1");
    assert_eq!(message.attempts, 0);

    // A republish of the same payload is a duplicate: silently dropped, no
    // enqueue, no live event, no error counted.
    pipeline
        .handle_payload("sensors/esp32-1/pir", PIR_PAYLOAD.as_bytes())
        .await;
    assert_eq!(pipeline.queue().depth().await.unwrap(), 0);
    assert!(live_rx.try_recv().is_err());
    assert_eq!(
        pipeline
            .metrics()
            .ingested_total
            .with_label_values(&["esp32-1", "pir"])
            .get(),
        1
    );
    assert_eq!(pipeline.stats().snapshot().duplicates, 1);
}

#[tokio::test]
async fn malformed_and_invalid_payloads_are_dropped_and_counted() {
    let backend = Arc::new(MemoryBackend::new());
    let (pipeline, mut live_rx) = build_pipeline(backend, 5);

    pipeline
        .handle_payload("sensors/esp32-1/data", b"{not json")
        .await;
    pipeline
        .handle_payload(
            "sensors/esp32-1/data",
            br#"{"device_id":"esp32-1","timestamp":"2025-01-01T00:00:00Z","sensors":{}}"#,
        )
        .await;

    assert_eq!(pipeline.queue().depth().await.unwrap(), 0);
    assert!(live_rx.try_recv().is_err());
    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.dropped_decode, 1);
    assert_eq!(stats.dropped_validation, 1);
    assert_eq!(
        pipeline
            .metrics()
            .errors_total
            .with_label_values(&["validation", "esp32-1"])
            .get(),
        1
    );
}

#[tokio::test]
async fn backend_outage_trips_the_breaker_and_sheds_load() {
    let backend = Arc::new(MemoryBackend::new());
    let (pipeline, _live_rx) = build_pipeline(backend.clone(), 2);
    backend.set_available(false);

    // Distinct timestamps so dedup never interferes.
    for i in 0..4 {
        let payload = format!(
            r#"{{"device_id":"esp32-1","timestamp":"2025-01-01T00:00:0{i}Z","sensors":{{"pir":{{"motion_detected":true}}}}}}"#
        );
        pipeline
            .handle_payload("sensors/esp32-1/pir", payload.as_bytes())
            .await;
    }

    assert_eq!(pipeline.breaker().snapshot().state, "open");
    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.enqueue_failures, 4);
    // First two failures hit the backend; the rest were shed by the breaker.
    assert_eq!(
        pipeline
            .metrics()
            .errors_total
            .with_label_values(&["backend", "esp32-1"])
            .get(),
        2
    );
    assert_eq!(
        pipeline
            .metrics()
            .errors_total
            .with_label_values(&["circuit_open", "esp32-1"])
            .get(),
        2
    );

    // Readings dropped while the backend was down were still recorded in the
    // dedup window, so a replay after recovery is treated as a duplicate.
    backend.set_available(true);
    pipeline
        .handle_payload("sensors/esp32-1/pir", PIR_PAYLOAD.as_bytes())
        .await;
    assert_eq!(pipeline.queue().depth().await.unwrap(), 0);
}
