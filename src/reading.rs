use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A raw reading as published by a device. Immutable once received;
/// `timestamp` stays the device-reported string until the processor
/// normalizes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub timestamp: String,
    pub sensors: SensorSet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ld2410: Option<Ld2410Reading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pir: Option<PirReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mq134: Option<Mq134Reading>,
}

impl SensorSet {
    pub fn is_empty(&self) -> bool {
        self.ld2410.is_none() && self.pir.is_none() && self.mq134.is_none()
    }

    /// Names of the sensor kinds present in this reading.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        if self.ld2410.is_some() {
            kinds.push("ld2410");
        }
        if self.pir.is_some() {
            kinds.push("pir");
        }
        if self.mq134.is_some() {
            kinds.push("mq134");
        }
        kinds
    }

    pub fn contains_kind(&self, kind: &str) -> bool {
        match kind {
            "ld2410" => self.ld2410.is_some(),
            "pir" => self.pir.is_some(),
            "mq134" => self.mq134.is_some(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ld2410Reading {
    pub presence: bool,
    pub distance: f64,
    pub energy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PirReading {
    pub motion_detected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mq134Reading {
    pub gas_concentration: f64,
    pub unit: GasUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasUnit {
    Ppm,
    Ppb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Failed,
}

/// Device metadata looked up from the registry; the pipeline caches it but
/// never owns the source of truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedReading {
    #[serde(flatten)]
    pub reading: SensorReading,
    pub received_at: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_metadata: Option<DeviceMetadata>,
}

/// Envelope owned by the durable queue while a reading is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub data: EnrichedReading,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueMessage {
    pub fn new(data: EnrichedReading) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            attempts: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_set_kinds_reflect_presence() {
        let set = SensorSet {
            pir: Some(PirReading {
                motion_detected: true,
            }),
            ..Default::default()
        };
        assert_eq!(set.kinds(), vec!["pir"]);
        assert!(set.contains_kind("pir"));
        assert!(!set.contains_kind("ld2410"));
        assert!(!set.is_empty());
    }

    #[test]
    fn enriched_reading_flattens_wire_fields() {
        let enriched = EnrichedReading {
            reading: SensorReading {
                device_id: "esp32-1".to_string(),
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
        };
        let value = serde_json::to_value(&enriched).unwrap();
        assert_eq!(value["device_id"], "esp32-1");
        assert_eq!(value["processing_status"], "pending");
        assert!(value.get("device_metadata").is_none());
    }

    #[test]
    fn gas_unit_round_trips_lowercase() {
        let raw = serde_json::json!({"gas_concentration": 4.2, "unit": "ppb"});
        let parsed: Mq134Reading = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.unit, GasUnit::Ppb);
        assert_eq!(serde_json::to_value(GasUnit::Ppm).unwrap(), "ppm");
    }
}
