use crate::config::Config;
use crate::ingest::{IngestPipeline, IngestStats};
use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to MQTT broker")]
    NotConnected,
    #[error("publish failed: {0}")]
    Transport(#[from] rumqttc::ClientError),
}

pub fn connect(config: &Config) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    AsyncClient::new(options, 64)
}

/// Outbound publish path for external collaborators. Publishing while the
/// listener is not connected fails fast instead of silently queueing.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    stats: Arc<IngestStats>,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, stats: Arc<IngestStats>) -> Self {
        Self { client, stats }
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.stats.mqtt_connected.load(Ordering::Relaxed) {
            return Err(PublishError::NotConnected);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

fn topic_filters(prefix: &str) -> Vec<String> {
    ["data", "ld2410", "pir", "mq134"]
        .iter()
        .map(|suffix| format!("{prefix}/+/{suffix}"))
        .collect()
}

/// Device id segment of `<prefix>/<device>/<kind>` topics.
pub fn device_id_from_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let device = parts.next()?;
    // Exactly one trailing segment (the sensor kind or "data").
    match (parts.next(), parts.next()) {
        (Some(_), None) if !device.is_empty() => Some(device),
        _ => None,
    }
}

/// Polls the broker event loop for the life of the process. rumqttc handles
/// the reconnect backoff; this loop re-subscribes on every ConnAck, keeps
/// the connected flag honest and counts reconnect attempts.
pub async fn run_listener(
    config: Config,
    pipeline: IngestPipeline,
    client: AsyncClient,
    mut eventloop: EventLoop,
) -> Result<()> {
    let filters = topic_filters(&config.mqtt_topic_prefix);
    let stats = pipeline.stats();
    let metrics = pipeline.metrics().clone();
    let mut reconnect_attempts: u64 = 0;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                reconnect_attempts = 0;
                let mut subscribed = true;
                for filter in &filters {
                    if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                        tracing::warn!(topic = %filter, error = %err, "failed to subscribe");
                        subscribed = false;
                        break;
                    }
                }
                stats.set_mqtt_connected(subscribed);
                metrics
                    .active_connections
                    .with_label_values(&["mqtt"])
                    .set(subscribed as i64);
                if subscribed {
                    tracing::info!(filters = ?filters, "subscribed to sensor topics");
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                tracing::trace!(
                    topic = %publish.topic,
                    device = ?device_id_from_topic(&config.mqtt_topic_prefix, &publish.topic),
                    bytes = publish.payload.len(),
                    "message received"
                );
                pipeline.handle_payload(&publish.topic, &publish.payload).await;
            }
            Ok(_) => {}
            Err(err) => {
                stats.set_mqtt_connected(false);
                metrics
                    .active_connections
                    .with_label_values(&["mqtt"])
                    .set(0);
                reconnect_attempts += 1;
                stats.reconnects.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    attempt = reconnect_attempts,
                    "MQTT connection dropped; reconnecting"
                );
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
