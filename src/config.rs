use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,

    pub redis_url: String,
    pub queue_name: String,
    pub max_retry_attempts: u32,
    pub retry_delay_ms: u64,

    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,

    pub dedup_high_water: usize,
    pub dedup_retain: usize,

    pub http_bind: String,
    pub heartbeat_secs: u64,
    pub live_channel_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mqtt_host = env_string("INGEST_MQTT_HOST", Some("127.0.0.1".to_string()))?;
        let mqtt_port = env_u64("INGEST_MQTT_PORT", Some(1883))? as u16;
        let mqtt_username = env_optional("INGEST_MQTT_USERNAME");
        let mqtt_password = env_optional("INGEST_MQTT_PASSWORD");
        let mqtt_topic_prefix =
            env_string("INGEST_MQTT_TOPIC_PREFIX", Some("sensors".to_string()))?;
        let mqtt_client_id = env_string(
            "INGEST_MQTT_CLIENT_ID",
            Some(format!("sensor-ingest-{}", std::process::id())),
        )?;
        let mqtt_keepalive_secs = env_u64("INGEST_MQTT_KEEPALIVE_SECS", Some(30))?;

        let redis_url = env_string(
            "INGEST_REDIS_URL",
            Some("redis://127.0.0.1:6379".to_string()),
        )?;
        let queue_name = env_string("INGEST_QUEUE_NAME", Some("sensor-readings".to_string()))?;
        let max_retry_attempts = env_u64("INGEST_MAX_RETRY_ATTEMPTS", Some(3))? as u32;
        let retry_delay_ms = env_u64("INGEST_RETRY_DELAY_MS", Some(1000))?;

        let breaker_failure_threshold = env_u64("INGEST_BREAKER_THRESHOLD", Some(5))? as u32;
        let breaker_cooldown_secs = env_u64("INGEST_BREAKER_COOLDOWN_SECS", Some(60))?;

        let dedup_high_water = env_u64("INGEST_DEDUP_HIGH_WATER", Some(10_000))? as usize;
        let dedup_retain = env_u64("INGEST_DEDUP_RETAIN", Some(5_000))? as usize;
        if dedup_retain >= dedup_high_water {
            return Err(anyhow!(
                "INGEST_DEDUP_RETAIN must be below INGEST_DEDUP_HIGH_WATER"
            ));
        }

        let http_bind = env_string("INGEST_HTTP_BIND", Some("0.0.0.0:8080".to_string()))?;
        let heartbeat_secs = env_u64("INGEST_WS_HEARTBEAT_SECS", Some(30))?;
        let live_channel_capacity = env_u64("INGEST_LIVE_CHANNEL_CAPACITY", Some(1024))? as usize;

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_client_id,
            mqtt_keepalive_secs,
            redis_url,
            queue_name,
            max_retry_attempts,
            retry_delay_ms,
            breaker_failure_threshold,
            breaker_cooldown_secs,
            dedup_high_water,
            dedup_retain,
            http_bind,
            heartbeat_secs,
            live_channel_capacity,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    pub fn ws_heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
