use crate::reading::{
    GasUnit, Ld2410Reading, Mq134Reading, PirReading, SensorReading, SensorSet,
};
use chrono::DateTime;
use serde_json::Value;
use thiserror::Error;

/// Every violated field of a payload, reported together so one bad message
/// yields a single diagnostic event.
#[derive(Debug, Error)]
#[error("invalid sensor reading: {}", violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

/// Schema-check a decoded payload against the per-sensor-kind rules.
///
/// Unknown top-level fields and unknown sensor kinds are stripped, not
/// rejected. Side-effect free.
pub fn validate(raw: &Value) -> Result<SensorReading, ValidationError> {
    let mut violations = Vec::new();

    let obj = match raw.as_object() {
        Some(obj) => obj,
        None => {
            return Err(ValidationError {
                violations: vec!["payload: must be a JSON object".to_string()],
            })
        }
    };

    let device_id = match obj.get("device_id") {
        Some(Value::String(id)) if is_valid_device_id(id) => id.clone(),
        Some(Value::String(_)) => {
            violations
                .push("device_id: must match [A-Za-z0-9_-]+".to_string());
            String::new()
        }
        Some(_) => {
            violations.push("device_id: must be a string".to_string());
            String::new()
        }
        None => {
            violations.push("device_id: required".to_string());
            String::new()
        }
    };

    let timestamp = match obj.get("timestamp") {
        Some(Value::String(ts)) => {
            if DateTime::parse_from_rfc3339(ts).is_err() {
                violations.push(format!(
                    "timestamp: not a parseable ISO-8601 instant: {ts:?}"
                ));
            }
            ts.clone()
        }
        Some(_) => {
            violations.push("timestamp: must be a string".to_string());
            String::new()
        }
        None => {
            violations.push("timestamp: required".to_string());
            String::new()
        }
    };

    let sensors = match obj.get("sensors") {
        Some(Value::Object(map)) => {
            let set = SensorSet {
                ld2410: map
                    .get("ld2410")
                    .and_then(|v| validate_ld2410(v, &mut violations)),
                pir: map.get("pir").and_then(|v| validate_pir(v, &mut violations)),
                mq134: map
                    .get("mq134")
                    .and_then(|v| validate_mq134(v, &mut violations)),
            };
            if set.is_empty()
                && !map.contains_key("ld2410")
                && !map.contains_key("pir")
                && !map.contains_key("mq134")
            {
                violations.push(
                    "sensors: at least one of ld2410, pir, mq134 is required"
                        .to_string(),
                );
            }
            set
        }
        Some(_) => {
            violations.push("sensors: must be an object".to_string());
            SensorSet::default()
        }
        None => {
            violations.push("sensors: required".to_string());
            SensorSet::default()
        }
    };

    if violations.is_empty() {
        Ok(SensorReading {
            device_id,
            timestamp,
            sensors,
        })
    } else {
        Err(ValidationError { violations })
    }
}

fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_ld2410(value: &Value, violations: &mut Vec<String>) -> Option<Ld2410Reading> {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => {
            violations.push("sensors.ld2410: must be an object".to_string());
            return None;
        }
    };
    let presence = require_bool(obj.get("presence"), "sensors.ld2410.presence", violations);
    let distance = require_range(
        obj.get("distance"),
        "sensors.ld2410.distance",
        0.0,
        600.0,
        violations,
    );
    let energy = require_range(
        obj.get("energy"),
        "sensors.ld2410.energy",
        0.0,
        100.0,
        violations,
    );
    Some(Ld2410Reading {
        presence: presence?,
        distance: distance?,
        energy: energy?,
    })
}

fn validate_pir(value: &Value, violations: &mut Vec<String>) -> Option<PirReading> {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => {
            violations.push("sensors.pir: must be an object".to_string());
            return None;
        }
    };
    let motion_detected = require_bool(
        obj.get("motion_detected"),
        "sensors.pir.motion_detected",
        violations,
    );
    Some(PirReading {
        motion_detected: motion_detected?,
    })
}

fn validate_mq134(value: &Value, violations: &mut Vec<String>) -> Option<Mq134Reading> {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => {
            violations.push("sensors.mq134: must be an object".to_string());
            return None;
        }
    };
    let gas_concentration = match obj.get("gas_concentration").and_then(Value::as_f64) {
        Some(v) if v >= 0.0 => Some(v),
        Some(v) => {
            violations.push(format!(
                "sensors.mq134.gas_concentration: must be >= 0, got {v}"
            ));
            None
        }
        None => {
            violations
                .push("sensors.mq134.gas_concentration: must be a number".to_string());
            None
        }
    };
    let unit = match obj.get("unit").and_then(Value::as_str) {
        Some("ppm") => Some(GasUnit::Ppm),
        Some("ppb") => Some(GasUnit::Ppb),
        Some(other) => {
            violations.push(format!(
                "sensors.mq134.unit: must be \"ppm\" or \"ppb\", got {other:?}"
            ));
            None
        }
        None => {
            violations.push("sensors.mq134.unit: must be a string".to_string());
            None
        }
    };
    Some(Mq134Reading {
        gas_concentration: gas_concentration?,
        unit: unit?,
    })
}

fn require_bool(
    value: Option<&Value>,
    field: &str,
    violations: &mut Vec<String>,
) -> Option<bool> {
    match value.and_then(Value::as_bool) {
        Some(v) => Some(v),
        None => {
            violations.push(format!("{field}: must be a boolean"));
            None
        }
    }
}

fn require_range(
    value: Option<&Value>,
    field: &str,
    min: f64,
    max: f64,
    violations: &mut Vec<String>,
) -> Option<f64> {
    match value.and_then(Value::as_f64) {
        Some(v) if v >= min && v <= max => Some(v),
        Some(v) => {
            violations.push(format!("{field}: must be within [{min}, {max}], got {v}"));
            None
        }
        None => {
            violations.push(format!("{field}: must be a number"));
            None
        }
    }
}
