//! Periodic aircraft JSON snapshot
//!
//! Serializes the aircraft list to a JSON document, written atomically to a
//! configured path on an interval and served by the HTTP endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::aircraft::AircraftStore;

#[derive(Serialize)]
struct AircraftView {
    hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    flight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    squawk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    altitude: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    track: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vert_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    on_ground: Option<bool>,
    messages: u64,
    /// Seconds since the last message from this aircraft.
    seen: f64,
    /// Mean recent signal level, 0.2 dB units.
    rssi: u8,
}

#[derive(Serialize)]
struct Snapshot {
    now: f64,
    aircraft: Vec<AircraftView>,
}

fn build(store: &AircraftStore) -> Snapshot {
    let now = std::time::Instant::now();
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let mut aircraft: Vec<AircraftView> = store
        .all()
        .map(|ac| AircraftView {
            hex: format!("{:06x}", ac.addr),
            flight: ac.callsign.as_ref().map(|c| c.trim().to_string()),
            squawk: ac.squawk.map(|s| format!("{s:04}")),
            lat: ac.position.map(|p| p.latitude),
            lon: ac.position.map(|p| p.longitude),
            altitude: ac.altitude,
            track: ac.heading.map(|h| h.round() as i32),
            speed: ac.ground_speed,
            vert_rate: ac.vert_rate,
            on_ground: ac.on_ground,
            messages: ac.messages,
            seen: now.duration_since(ac.seen).as_secs_f64(),
            rssi: ac.signal_level(),
        })
        .collect();
    aircraft.sort_by(|a, b| a.hex.cmp(&b.hex));

    Snapshot {
        now: epoch,
        aircraft,
    }
}

pub fn to_json(store: &AircraftStore) -> String {
    serde_json::to_string(&build(store)).unwrap_or_else(|_| "{}".to_string())
}

/// Write the snapshot through a temporary file so readers never observe a
/// partial document.
fn write_atomic(path: &Path, json: &str) -> std::io::Result<()> {
    let tmp: PathBuf = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

pub async fn run_writer(
    path: PathBuf,
    interval_secs: u64,
    store: Arc<RwLock<AircraftStore>>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;
        let json = to_json(&store.read());
        match write_atomic(&path, &json) {
            Ok(()) => debug!("snapshot written to {}", path.display()),
            Err(e) => warn!("snapshot write failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Engine;
    use hexlit::hex;

    #[test]
    fn test_snapshot_json_shape() {
        let mut engine = Engine::new(1, false);
        let mut store = AircraftStore::new(300, None);
        let pm = engine
            .decode(&hex!("8D4840D6202CC371C32CE0576098"), 0, 50)
            .unwrap();
        store.update(&pm);

        let json = to_json(&store);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let aircraft = value["aircraft"].as_array().unwrap();
        assert_eq!(aircraft.len(), 1);
        assert_eq!(aircraft[0]["hex"], "4840d6");
        assert_eq!(aircraft[0]["flight"], "KLM1023");
        assert_eq!(aircraft[0]["messages"], 1);
        // No position decoded yet: lat/lon omitted entirely
        assert!(aircraft[0].get("lat").is_none());
    }

    #[test]
    fn test_snapshot_empty_store() {
        let store = AircraftStore::new(300, None);
        let value: serde_json::Value = serde_json::from_str(&to_json(&store)).unwrap();
        assert_eq!(value["aircraft"].as_array().unwrap().len(), 0);
        assert!(value["now"].as_f64().is_some());
    }
}
