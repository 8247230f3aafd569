use crate::metrics::Metrics;
use crate::queue::LiveEvent;
use crate::reading::EnrichedReading;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
const MAX_MISSED_PINGS: u8 = 2;

/// Per-subscriber interest filter; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
}

impl SubscriberFilter {
    pub fn matches(&self, event: &EnrichedReading) -> bool {
        if let Some(device_id) = &self.device_id {
            if *device_id != event.reading.device_id {
                return false;
            }
        }
        if let Some(sensor_type) = &self.sensor_type {
            if !event.reading.sensors.contains_kind(sensor_type) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    Subscribe {
        #[serde(default)]
        filters: SubscriberFilter,
    },
    Unsubscribe,
    Ping,
}

#[derive(Clone)]
pub struct FanoutState {
    live_tx: broadcast::Sender<LiveEvent>,
    metrics: Arc<Metrics>,
    heartbeat: Duration,
}

impl FanoutState {
    pub fn new(
        live_tx: broadcast::Sender<LiveEvent>,
        metrics: Arc<Metrics>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            live_tx,
            metrics,
            heartbeat,
        }
    }
}

pub fn router(state: FanoutState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<FanoutState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task per subscriber. The task owns the socket and its broadcast
/// receiver, so teardown removes the subscriber atomically with respect to
/// the broadcast loop; a failed send can only take down this connection.
async fn handle_socket(mut socket: WebSocket, state: FanoutState) {
    let client_id = Uuid::new_v4();
    let mut live_rx = state.live_tx.subscribe();
    let connections = state.metrics.active_connections.with_label_values(&["websocket"]);
    connections.inc();
    tracing::info!(%client_id, "websocket subscriber connected");

    let mut filter = SubscriberFilter::default();
    let mut subscribed = true;
    let mut missed_pings: u8 = 0;

    let hello = json!({"type": "connected", "client_id": client_id});
    if send_json(&mut socket, &hello).await.is_err() {
        connections.dec();
        return;
    }

    let mut heartbeat = tokio::time::interval(state.heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            event = live_rx.recv() => {
                match event {
                    Ok(event) => {
                        if subscribed && filter.matches(&event) {
                            let frame = json!({"type": "sensor-data", "data": &*event});
                            if send_json(&mut socket, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Best-effort delivery; slow subscribers skip ahead.
                        tracing::warn!(%client_id, skipped, "subscriber lagging; events skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                missed_pings = 0;
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Subscribe { filters }) => {
                                filter = filters;
                                subscribed = true;
                                let ack = json!({"type": "subscribed", "filters": filter});
                                if send_json(&mut socket, &ack).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Unsubscribe) => {
                                subscribed = false;
                                filter = SubscriberFilter::default();
                                let ack = json!({"type": "unsubscribed"});
                                if send_json(&mut socket, &ack).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Ping) => {
                                if send_json(&mut socket, &json!({"type": "pong"})).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%client_id, error = %err, "unrecognized subscriber message");
                            }
                        }
                    }
                    Message::Close(_) => break,
                    // Pong and anything else already counted as liveness.
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if missed_pings >= MAX_MISSED_PINGS {
                    tracing::warn!(%client_id, "subscriber unresponsive; disconnecting");
                    break;
                }
                missed_pings += 1;
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    connections.dec();
    tracing::info!(%client_id, "websocket subscriber disconnected");
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{
        PirReading, ProcessingStatus, SensorReading, SensorSet,
    };
    use chrono::Utc;

    fn event(device_id: &str) -> EnrichedReading {
        EnrichedReading {
            reading: SensorReading {
                device_id: device_id.to_string(),
                timestamp: "2025-01-01T00:00:00+00:00".to_string(),
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

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SubscriberFilter::default();
        assert!(filter.matches(&event("esp32-1")));
        assert!(filter.matches(&event("esp32-2")));
    }

    #[test]
    fn device_filter_only_matches_that_device() {
        let filter = SubscriberFilter {
            device_id: Some("esp32-1".to_string()),
            sensor_type: None,
        };
        assert!(filter.matches(&event("esp32-1")));
        assert!(!filter.matches(&event("esp32-2")));
    }

    #[test]
    fn sensor_type_filter_requires_that_kind() {
        let filter = SubscriberFilter {
            device_id: None,
            sensor_type: Some("pir".to_string()),
        };
        assert!(filter.matches(&event("esp32-1")));

        let filter = SubscriberFilter {
            device_id: None,
            sensor_type: Some("mq134".to_string()),
        };
        assert!(!filter.matches(&event("esp32-1")));
    }

    #[test]
    fn both_filter_fields_must_match() {
        let filter = SubscriberFilter {
            device_id: Some("esp32-1".to_string()),
            sensor_type: Some("pir".to_string()),
        };
        assert!(filter.matches(&event("esp32-1")));
        assert!(!filter.matches(&event("esp32-2")));
    }

    #[test]
    fn client_messages_deserialize_by_tag() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","filters":{"device_id":"esp32-1"}}"#)
                .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Subscribe { filters } if filters.device_id.as_deref() == Some("esp32-1")
        ));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Subscribe { filters } if filters == SubscriberFilter::default()
        ));

        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"unsubscribe"}"#).unwrap(),
            ClientMessage::Unsubscribe
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        ));
    }
}
