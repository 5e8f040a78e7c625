use crate::fake_call::FakeCallState;
use crate::recording::RecordingState;
use crate::types::GeoPoint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snapshot of the whole monitor, written to disk and served by the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub authenticated: bool,
    // Location
    pub tracking: bool,
    pub waiting_for_location: bool,
    pub position: Option<GeoPoint>,
    pub location_fixes: u64,
    // Geofence
    pub in_danger_zone: bool,
    pub current_zone: Option<String>,
    pub zone_count: usize,
    // Shake / SOS
    pub shake_armed: bool,
    pub sos_in_flight: bool,
    pub sos_sent: u64,
    pub shakes_detected: u64,
    // Fake call
    pub fake_call_state: FakeCallState,
    pub fake_call_remaining_seconds: u32,
    // Recording
    pub recording_state: RecordingState,
    pub recording_elapsed_seconds: u64,
    pub recording_artifact: Option<String>,
}

impl SafetyStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            authenticated: false,
            tracking: false,
            waiting_for_location: true,
            position: None,
            location_fixes: 0,
            in_danger_zone: false,
            current_zone: None,
            zone_count: 0,
            shake_armed: false,
            sos_in_flight: false,
            sos_sent: 0,
            shakes_detected: 0,
            fake_call_state: FakeCallState::Idle,
            fake_call_remaining_seconds: 0,
            recording_state: RecordingState::Idle,
            recording_elapsed_seconds: 0,
            recording_artifact: None,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// One-line summary for the console
    pub fn summary(&self) -> String {
        let position = match self.position {
            Some(p) => format!("{:.5},{:.5}", p.latitude, p.longitude),
            None => "waiting for location".to_string(),
        };
        let zone = match &self.current_zone {
            Some(id) => format!("IN DANGER ZONE {}", id),
            None => "clear".to_string(),
        };
        format!(
            "pos={} fixes={} zones={} [{}] sos_sent={} call={:?} rec={:?}({}s)",
            position,
            self.location_fixes,
            self.zone_count,
            zone,
            self.sos_sent,
            self.fake_call_state,
            self.recording_state,
            self.recording_elapsed_seconds
        )
    }
}

impl Default for SafetyStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_writes_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let mut status = SafetyStatus::new();
        // binary-exact floats so the round trip compares equal
        status.timestamp = 1_700_000_000.5;
        status.position = Some(GeoPoint::new(28.5, 77.25));
        status.waiting_for_location = false;
        status.current_zone = Some("z1".into());
        status.in_danger_zone = true;
        status.recording_state = RecordingState::Recording;
        status.save(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"timestamp\""));
        assert!(raw.contains("\"recording_state\": \"recording\""));
        let back: SafetyStatus = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_summary() {
        let status = SafetyStatus::new();
        assert!(status.summary().contains("waiting for location"));
        assert!(status.summary().contains("[clear]"));
    }
}
