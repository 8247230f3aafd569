use anyhow::Result;
use sensor_ingest::backend::RedisBackend;
use sensor_ingest::breaker::CircuitBreaker;
use sensor_ingest::config::Config;
use sensor_ingest::fanout::FanoutState;
use sensor_ingest::http::{self, AppState};
use sensor_ingest::ingest::IngestPipeline;
use sensor_ingest::metrics::Metrics;
use sensor_ingest::mqtt::{self, MqttPublisher};
use sensor_ingest::processor::DataProcessor;
use sensor_ingest::queue::{DurableQueue, LiveEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_ingest=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let metrics = Arc::new(Metrics::new()?);
    let backend = Arc::new(RedisBackend::connect(&config.redis_url).await?);
    let (live_tx, _) = broadcast::channel::<LiveEvent>(config.live_channel_capacity);

    let queue = Arc::new(DurableQueue::new(
        backend,
        config.queue_name.clone(),
        config.max_retry_attempts,
        config.retry_delay(),
        live_tx.clone(),
        metrics.clone(),
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker_failure_threshold,
        config.breaker_cooldown(),
    ));
    let processor = Arc::new(DataProcessor::new(
        config.dedup_high_water,
        config.dedup_retain,
    ));
    let pipeline = IngestPipeline::new(processor, queue, breaker, metrics.clone());

    let (client, eventloop) = mqtt::connect(&config);
    let publisher = MqttPublisher::new(client.clone(), pipeline.stats());

    let mqtt_handle = {
        let config = config.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if let Err(err) = mqtt::run_listener(config, pipeline, client, eventloop).await {
                tracing::error!(error = %err, "mqtt listener exited");
            }
        })
    };

    let app = http::router(
        AppState {
            pipeline,
            publisher,
        },
        FanoutState::new(live_tx, metrics, config.ws_heartbeat()),
    );
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "sensor-ingest HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = mqtt_handle => {}
    }

    // Let open websocket/HTTP connections drain before the process exits.
    let _ = http_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
