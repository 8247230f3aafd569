use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Process-wide metric families. Built once at startup on its own registry
/// and handed to every component; nothing registers against the crate's
/// default registry.
pub struct Metrics {
    registry: Registry,
    pub ingested_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub processing_latency_seconds: HistogramVec,
    pub active_connections: IntGaugeVec,
    pub queue_size: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let ingested_total = IntCounterVec::new(
            Opts::new("ingested_total", "Readings accepted and durably enqueued"),
            &["device_id", "sensor_type"],
        )?;
        registry.register(Box::new(ingested_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Pipeline errors by type"),
            &["error_type", "device_id"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let processing_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "processing_latency_seconds",
                "Latency of pipeline operations",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(processing_latency_seconds.clone()))?;

        let active_connections = IntGaugeVec::new(
            Opts::new("active_connections", "Currently open connections"),
            &["type"],
        )?;
        registry.register(Box::new(active_connections.clone()))?;

        let queue_size = IntGaugeVec::new(
            Opts::new("queue_size", "Depth of the durable queue lists"),
            &["queue_name"],
        )?;
        registry.register(Box::new(queue_size.clone()))?;

        Ok(Self {
            registry,
            ingested_total,
            errors_total,
            processing_latency_seconds,
            active_connections,
            queue_size,
        })
    }

    pub fn record_error(&self, error_type: &str, device_id: &str) {
        self.errors_total
            .with_label_values(&[error_type, device_id])
            .inc();
    }

    pub fn observe_latency(&self, operation: &str, seconds: f64) {
        self.processing_latency_seconds
            .with_label_values(&[operation])
            .observe(seconds);
    }

    pub fn set_queue_depth(&self, queue_name: &str, depth: u64) {
        self.queue_size
            .with_label_values(&[queue_name])
            .set(depth as i64);
    }

    /// Pull-based text exposition for the `/metrics` endpoint.
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_registered_families() {
        let metrics = Metrics::new().unwrap();
        metrics
            .ingested_total
            .with_label_values(&["esp32-1", "pir"])
            .inc();
        metrics.record_error("validation", "esp32-1");
        metrics.observe_latency("process", 0.002);
        metrics.set_queue_depth("sensor-readings", 3);
        metrics.active_connections.with_label_values(&["websocket"]).inc();

        let exported = metrics.export().unwrap();
        assert!(exported.contains("ingested_total"));
        assert!(exported.contains("errors_total"));
        assert!(exported.contains("processing_latency_seconds"));
        assert!(exported.contains("active_connections"));
        assert!(exported.contains("queue_size{queue_name=\"sensor-readings\"} 3"));
    }

    #[test]
    fn registries_are_isolated_per_instance() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.ingested_total.with_label_values(&["esp32-1", "pir"]).inc();
        assert!(!b.export().unwrap().contains("esp32-1"));
    }
}
