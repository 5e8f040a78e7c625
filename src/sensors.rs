//! Termux:API backed capabilities, with mock fallbacks for desktop runs.
//!
//! Every device tool is invoked as a short-lived process. Without Termux:API
//! the capabilities produce synthetic data so the monitor stays usable on a
//! laptop. With it, a failed read skips that tick; live streams never carry
//! made-up readings.

use crate::error::{Result, SafetyError};
use crate::platform::{
    Accelerometer, AudioRecorder, Dialer, LocationProvider, PermissionStatus, Platform,
    PushNotification, PushService, RingtonePlayer, WatchOptions,
};
use crate::types::{LocationSample, ShakeSample};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::interval;

const STANDARD_GRAVITY: f64 = 9.80665;

/// Is `tool` somewhere on PATH?
pub fn tool_available(tool: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false)
}

/// Build the platform bundle. `force_mock` skips tool detection entirely.
pub fn termux_platform(output_dir: &Path, ringtone: Option<PathBuf>, force_mock: bool) -> Platform {
    let termux = !force_mock && tool_available("termux-location");
    if termux {
        eprintln!("[sensors] Termux:API detected");
    } else {
        eprintln!("[sensors] Termux:API not found, using mock sensors");
    }

    Platform {
        location: Arc::new(TermuxLocation { live: termux }),
        accelerometer: Arc::new(TermuxAccelerometer {
            live: termux && tool_available("termux-sensor"),
        }),
        recorder: Arc::new(TermuxRecorder {
            live: termux && tool_available("termux-microphone-record"),
            output_dir: output_dir.to_path_buf(),
            current: Mutex::new(None),
        }),
        ringtone: Arc::new(TermuxRingtone {
            live: termux && tool_available("termux-media-player"),
            file: ringtone,
        }),
        dialer: Arc::new(TermuxDialer {
            live: termux && tool_available("termux-telephony-call"),
        }),
        push: Arc::new(ConsolePush {
            listeners: Mutex::new(Vec::new()),
        }),
    }
}

async fn run_tool(tool: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|e| SafetyError::Platform(format!("{}: {}", tool, e)))?;
    if !output.status.success() {
        return Err(SafetyError::Platform(format!(
            "{} exited with {}",
            tool, output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ---------------------------------------------------------------------------
// Location

#[derive(Deserialize)]
struct TermuxFix {
    latitude: f64,
    longitude: f64,
}

/// `termux-location` prints a single JSON object
pub fn parse_location_output(output: &str) -> Option<(f64, f64)> {
    let fix: TermuxFix = serde_json::from_str(output.trim()).ok()?;
    if !fix.latitude.is_finite() || !fix.longitude.is_finite() {
        return None;
    }
    Some((fix.latitude, fix.longitude))
}

struct TermuxLocation {
    live: bool,
}

async fn read_fix() -> Option<(f64, f64)> {
    match run_tool("termux-location", &["-p", "gps", "-r", "once"]).await {
        Ok(text) => parse_location_output(&text),
        Err(e) => {
            log::debug!("[gps] {}", e);
            None
        }
    }
}

/// Slow walk north-east from Connaught Place, ~20 m per fix
fn mock_fix(seq: u64) -> (f64, f64) {
    let seq = seq as f64;
    (28.6315 + seq * 0.00015, 77.2167 + seq * 0.00012)
}

#[async_trait]
impl LocationProvider for TermuxLocation {
    async fn request_foreground_permission(&self) -> PermissionStatus {
        // Termux:API asks for the Android permission on first use
        PermissionStatus::Granted
    }

    async fn request_background_permission(&self) -> PermissionStatus {
        if self.live {
            PermissionStatus::Undetermined
        } else {
            PermissionStatus::Granted
        }
    }

    async fn watch_position(&self, options: WatchOptions) -> Result<mpsc::Receiver<LocationSample>> {
        let (tx, rx) = mpsc::channel(16);
        let live = self.live;
        let period = options.min_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            let mut fixes = 0u64;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    eprintln!("[gps] Watch released after {} fixes", fixes);
                    break;
                }
                let (lat, lng) = if live {
                    match read_fix().await {
                        Some(fix) => fix,
                        None => continue,
                    }
                } else {
                    mock_fix(fixes)
                };
                if tx.send(LocationSample::new(lat, lng, Utc::now())).await.is_err() {
                    eprintln!("[gps] Watch released after {} fixes", fixes);
                    break;
                }
                fixes += 1;
            }
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Accelerometer

/// Parse one `termux-sensor -n 1` reading into (x, y, z) in m/s².
///
/// Newer Termux:API prints JSON (`{"<sensor>": {"values": [x, y, z]}}`),
/// older builds print `x=.., y=.., z=..`.
pub fn parse_accel_output(output: &str) -> Option<(f64, f64, f64)> {
    if let Ok(serde_json::Value::Object(sensors)) =
        serde_json::from_str::<serde_json::Value>(output.trim())
    {
        let values = sensors.values().find_map(|s| s.get("values")?.as_array().cloned())?;
        let axis = |i: usize| values.get(i).and_then(|v| v.as_f64());
        return Some((axis(0)?, axis(1)?, axis(2)?));
    }

    let (mut x, mut y, mut z) = (None, None, None);
    for part in output.split(',') {
        let part = part.trim();
        let part = part.rsplit(": ").next().unwrap_or(part);
        if let Some(v) = part.strip_prefix("x=") {
            x = v.trim().parse().ok();
        } else if let Some(v) = part.strip_prefix("y=") {
            y = v.trim().parse().ok();
        } else if let Some(v) = part.strip_prefix("z=") {
            z = v.trim().parse().ok();
        }
    }
    Some((x?, y?, z?))
}

struct TermuxAccelerometer {
    live: bool,
}

async fn read_accelerometer() -> Option<(f64, f64, f64)> {
    match run_tool("termux-sensor", &["-n", "1", "-s", "accelerometer"]).await {
        Ok(text) => parse_accel_output(&text),
        Err(e) => {
            log::debug!("[accel] {}", e);
            None
        }
    }
}

/// Device at rest with a little hand tremor, in g
fn mock_accel(t: f64) -> (f64, f64, f64) {
    use std::f64::consts::PI;
    (
        (t * 2.0 * PI).sin() * 0.05,
        (t * 2.0 * PI).cos() * 0.03,
        1.0 + (t * PI).sin() * 0.01,
    )
}

#[async_trait]
impl Accelerometer for TermuxAccelerometer {
    async fn subscribe(&self, period: Duration) -> Result<mpsc::Receiver<ShakeSample>> {
        let (tx, rx) = mpsc::channel(64);
        let live = self.live;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            let mut sample_count = 0u64;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    eprintln!("[accel] Channel closed after {} samples", sample_count);
                    break;
                }
                let (x, y, z) = if live {
                    match read_accelerometer().await {
                        // shake thresholds are in g; Termux reports m/s²
                        Some((x, y, z)) => (x / STANDARD_GRAVITY, y / STANDARD_GRAVITY, z / STANDARD_GRAVITY),
                        None => continue,
                    }
                } else {
                    mock_accel(sample_count as f64 * period.as_secs_f64())
                };

                match tx.try_send(ShakeSample::new(x, y, z, Utc::now())) {
                    Ok(()) => sample_count += 1,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        eprintln!("[accel] Channel closed after {} samples", sample_count);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // consumer behind; drop this sample
                    }
                }
            }
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Microphone

struct TermuxRecorder {
    live: bool,
    output_dir: PathBuf,
    current: Mutex<Option<PathBuf>>,
}

#[async_trait]
impl AudioRecorder for TermuxRecorder {
    async fn request_permission(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn start(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| SafetyError::Platform(format!("{}: {}", self.output_dir.display(), e)))?;
        let file = self
            .output_dir
            .join(format!("evidence_{}.m4a", Utc::now().format("%Y%m%d_%H%M%S")));

        if self.live {
            let path = file.to_string_lossy().into_owned();
            run_tool("termux-microphone-record", &["-f", &path, "-l", "0"]).await?;
        } else {
            eprintln!("[mic] (mock) recording to {}", file.display());
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some(file);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<String> {
        let file = self
            .current
            .lock()
            .ok()
            .and_then(|mut c| c.take())
            .ok_or_else(|| SafetyError::Platform("recorder not started".into()))?;

        if self.live {
            run_tool("termux-microphone-record", &["-q"]).await?;
        } else {
            // leave a placeholder so the artifact path exists
            std::fs::write(&file, b"")
                .map_err(|e| SafetyError::Platform(format!("{}: {}", file.display(), e)))?;
        }
        Ok(format!("file://{}", file.display()))
    }
}

// ---------------------------------------------------------------------------
// Ringtone

struct TermuxRingtone {
    live: bool,
    file: Option<PathBuf>,
}

#[async_trait]
impl RingtonePlayer for TermuxRingtone {
    async fn load(&self) -> Result<()> {
        if let Some(file) = &self.file {
            if !file.is_file() {
                return Err(SafetyError::Platform(format!(
                    "ringtone not found: {}",
                    file.display()
                )));
            }
        }
        Ok(())
    }

    async fn play_looping(&self) -> Result<()> {
        match (&self.file, self.live) {
            (Some(file), true) => {
                let path = file.to_string_lossy().into_owned();
                run_tool("termux-media-player", &["play", &path]).await?;
            }
            _ => println!("\x07[call] *ring ring*"),
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.live && self.file.is_some() {
            run_tool("termux-media-player", &["stop"]).await?;
        }
        Ok(())
    }

    async fn rewind(&self) -> Result<()> {
        // termux-media-player restarts from the top on every play
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dialer

struct TermuxDialer {
    live: bool,
}

#[async_trait]
impl Dialer for TermuxDialer {
    async fn can_open(&self, uri: &str) -> bool {
        uri.starts_with("tel:")
    }

    async fn open(&self, uri: &str) -> Result<()> {
        let number = uri
            .strip_prefix("tel:")
            .ok_or_else(|| SafetyError::Platform(format!("not a phone uri: {}", uri)))?;
        if self.live {
            run_tool("termux-telephony-call", &[number]).await?;
        } else {
            println!("[call] (mock) dialing {}", number);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Push

/// No push transport on a terminal: registration is refused and the
/// foreground stream stays silent until dropped.
struct ConsolePush {
    listeners: Mutex<Vec<mpsc::Sender<PushNotification>>>,
}

#[async_trait]
impl PushService for ConsolePush {
    async fn permission_status(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn request_permission(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn device_token(&self) -> Result<String> {
        Err(SafetyError::Platform(
            "push notifications are not available on this device".into(),
        ))
    }

    async fn foreground_notifications(&self) -> Result<mpsc::Receiver<PushNotification>> {
        let (tx, rx) = mpsc::channel(8);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|l| !l.is_closed());
            listeners.push(tx);
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_location_json() {
        let out = r#"{
  "latitude": 28.6315,
  "longitude": 77.2167,
  "altitude": 216.0,
  "accuracy": 12.0,
  "provider": "gps"
}"#;
        let (lat, lng) = parse_location_output(out).unwrap();
        assert_relative_eq!(lat, 28.6315);
        assert_relative_eq!(lng, 77.2167);
        assert!(parse_location_output("").is_none());
        assert!(parse_location_output("{\"error\": \"timeout\"}").is_none());
    }

    #[test]
    fn test_parse_accel_json() {
        let out = r#"{"LSM6DSO Accelerometer": {"values": [0.12, -0.34, 9.81]}}"#;
        let (x, y, z) = parse_accel_output(out).unwrap();
        assert_relative_eq!(x, 0.12);
        assert_relative_eq!(y, -0.34);
        assert_relative_eq!(z, 9.81);
    }

    #[test]
    fn test_parse_accel_legacy_format() {
        let out = "Accelerometer event: x=0.5, y=0.3, z=9.8, accuracy=0, timestamp=1234567890";
        let (x, y, z) = parse_accel_output(out).unwrap();
        assert_relative_eq!(x, 0.5);
        assert_relative_eq!(y, 0.3);
        assert_relative_eq!(z, 9.8);
        assert!(parse_accel_output("no reading").is_none());
    }

    #[test]
    fn test_mock_accel_stays_below_shake_threshold() {
        for i in 0..200 {
            let (x, y, z) = mock_accel(i as f64 * 0.1);
            assert!((x * x + y * y + z * z).sqrt() < 1.1);
        }
    }

    #[tokio::test]
    async fn test_mock_location_watch_moves_and_releases() {
        let location = TermuxLocation { live: false };
        let mut rx = location
            .watch_position(WatchOptions {
                min_interval: Duration::from_secs(1),
                min_distance_m: 10.0,
            })
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_relative_eq!(first.coords.latitude, 28.6315);
        drop(rx);
    }

    #[tokio::test]
    async fn test_live_read_failure_yields_no_fix() {
        if tool_available("termux-location") {
            return;
        }
        let location = TermuxLocation { live: true };
        let mut rx = location
            .watch_position(WatchOptions {
                min_interval: Duration::from_secs(1),
                min_distance_m: 10.0,
            })
            .await
            .unwrap();
        // several ticks with a failing tool and nothing is delivered
        let waited = tokio::time::timeout(Duration::from_millis(2500), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_live_accel_failure_yields_no_sample() {
        if tool_available("termux-sensor") {
            return;
        }
        let accel = TermuxAccelerometer { live: true };
        let mut rx = accel.subscribe(Duration::from_millis(100)).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(800), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_mock_dialer() {
        let dialer = TermuxDialer { live: false };
        assert!(dialer.can_open("tel:100").await);
        assert!(!dialer.can_open("https://example.com").await);
        assert!(dialer.open("tel:100").await.is_ok());
        assert!(dialer.open("mailto:x").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_recorder_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TermuxRecorder {
            live: false,
            output_dir: dir.path().to_path_buf(),
            current: Mutex::new(None),
        };
        assert!(recorder.stop().await.is_err());
        recorder.start().await.unwrap();
        let uri = recorder.stop().await.unwrap();
        let path = uri.strip_prefix("file://").unwrap();
        assert!(Path::new(path).is_file());
    }
}
