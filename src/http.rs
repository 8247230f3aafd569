use crate::breaker::BreakerSnapshot;
use crate::fanout::{self, FanoutState};
use crate::ingest::{IngestPipeline, StatsSnapshot};
use crate::mqtt::{MqttPublisher, PublishError};
use crate::reading::DeviceMetadata;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: IngestPipeline,
    pub publisher: MqttPublisher,
}

pub fn router(state: AppState, fanout_state: FanoutState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(export_metrics))
        .route("/v1/status", get(get_status))
        .route("/v1/devices/{device_id}/metadata", post(put_device_metadata))
        .route("/v1/publish", post(publish_message))
        .with_state(state)
        .merge(fanout::router(fanout_state))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn export_metrics(State(state): State<AppState>) -> Result<String, (StatusCode, String)> {
    state
        .pipeline
        .metrics()
        .export()
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    listener: StatsSnapshot,
    queue_depth: Option<u64>,
    dlq_depth: Option<u64>,
    breaker: BreakerSnapshot,
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let queue = state.pipeline.queue();
    // Depths come from the backend; a down backend leaves them null rather
    // than failing the status endpoint.
    let queue_depth = queue.depth().await.ok();
    let dlq_depth = queue.dlq_depth().await.ok();
    Json(StatusResponse {
        listener: state.pipeline.stats().snapshot(),
        queue_depth,
        dlq_depth,
        breaker: state.pipeline.breaker().snapshot(),
    })
}

async fn put_device_metadata(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(metadata): Json<DeviceMetadata>,
) -> StatusCode {
    state
        .pipeline
        .processor()
        .update_device_metadata(&device_id, metadata);
    tracing::debug!(device = %device_id, "device metadata updated");
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    topic: String,
    payload: serde_json::Value,
}

async fn publish_message(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let payload = serde_json::to_vec(&request.payload)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    match state.publisher.publish(&request.topic, payload).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(err @ PublishError::NotConnected) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, err.to_string()))
        }
        Err(err) => Err((StatusCode::BAD_GATEWAY, err.to_string())),
    }
}
