use crate::reading::{DeviceMetadata, EnrichedReading, ProcessingStatus, SensorReading};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

pub const DEDUP_HIGH_WATER: usize = 10_000;
pub const DEDUP_RETAIN: usize = 5_000;

/// Deduplicates readings, normalizes timestamps and attaches cached device
/// metadata. All state is process-local; a multi-instance deployment gets
/// per-instance dedup windows.
pub struct DataProcessor {
    window: Mutex<DedupWindow>,
    metadata: Mutex<HashMap<String, DeviceMetadata>>,
}

/// Sliding window of recently seen dedup keys. Once `high_water` is hit the
/// window is compacted down to the most recent `retain` keys, so duplicates
/// older than the window can slip through; genuinely new readings are never
/// rejected.
struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    high_water: usize,
    retain: usize,
}

impl DedupWindow {
    fn new(high_water: usize, retain: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(high_water),
            order: VecDeque::with_capacity(high_water),
            high_water,
            retain,
        }
    }

    fn check_and_record(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return true;
        }
        self.seen.insert(key.to_string());
        self.order.push_back(key.to_string());
        if self.order.len() > self.high_water {
            while self.order.len() > self.retain {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
            tracing::debug!(retained = self.order.len(), "compacted dedup window");
        }
        false
    }
}

impl DataProcessor {
    pub fn new(high_water: usize, retain: usize) -> Self {
        Self {
            window: Mutex::new(DedupWindow::new(high_water, retain)),
            metadata: Mutex::new(HashMap::new()),
        }
    }

    /// Checks the `device_id|timestamp` key against the dedup window and
    /// records it. Call with the timestamp already normalized.
    pub fn is_duplicate(&self, reading: &SensorReading) -> bool {
        let key = format!("{}|{}", reading.device_id, reading.timestamp);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.check_and_record(&key)
    }

    /// Parses a device-reported timestamp into UTC RFC 3339. An unparseable
    /// timestamp is replaced by the current wall-clock time with a warning
    /// instead of rejecting the reading.
    pub fn normalize_timestamp(&self, raw: &str) -> String {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => ts.with_timezone(&Utc).to_rfc3339(),
            Err(err) => {
                tracing::warn!(timestamp = %raw, error = %err, "unparseable timestamp; substituting receive time");
                Utc::now().to_rfc3339()
            }
        }
    }

    /// Attaches cached device metadata if the registry has pushed any for
    /// this device. Absence of metadata is not an error.
    pub fn enrich_with_metadata(&self, reading: SensorReading) -> EnrichedReading {
        let device_metadata = {
            let cache = self.metadata.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(&reading.device_id).cloned()
        };
        EnrichedReading {
            reading,
            received_at: Utc::now(),
            processing_status: ProcessingStatus::Pending,
            device_metadata,
        }
    }

    /// The composed pipeline: normalize, drop duplicates, enrich. `None`
    /// means duplicate; callers drop the reading silently.
    pub fn process(&self, mut reading: SensorReading) -> Option<EnrichedReading> {
        reading.timestamp = self.normalize_timestamp(&reading.timestamp);
        if self.is_duplicate(&reading) {
            return None;
        }
        Some(self.enrich_with_metadata(reading))
    }

    /// Inbound push from the device registry; last write wins.
    pub fn update_device_metadata(&self, device_id: &str, metadata: DeviceMetadata) {
        let mut cache = self.metadata.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(device_id.to_string(), metadata);
    }
}

impl Default for DataProcessor {
    fn default() -> Self {
        Self::new(DEDUP_HIGH_WATER, DEDUP_RETAIN)
    }
}
