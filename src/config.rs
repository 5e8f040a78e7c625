use crate::error::{Result, SafetyError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "https://raksha-backend-und2.onrender.com";

/// Runtime configuration. Every field has a default so a partial JSON file
/// only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub backend: BackendConfig,
    pub location: LocationConfig,
    pub shake: ShakeConfig,
    pub geofence: GeofenceConfig,
    /// Number dialled by the police-call shortcut
    pub emergency_number: String,
    /// Where the driver writes status snapshots
    pub output_dir: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            location: LocationConfig::default(),
            shake: ShakeConfig::default(),
            geofence: GeofenceConfig::default(),
            emergency_number: "100".to_string(),
            output_dir: "safety_monitor_sessions".to_string(),
        }
    }
}

impl SafetyConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SafetyConfig =
            serde_json::from_str(json).map_err(|e| SafetyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SafetyError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.base_url.trim().is_empty() {
            return Err(SafetyError::Config("backend.base_url is empty".into()));
        }
        if self.shake.sample_interval_ms == 0 {
            return Err(SafetyError::Config(
                "shake.sample_interval_ms must be > 0".into(),
            ));
        }
        if self.shake.threshold.is_nan() || self.shake.threshold <= 0.0 {
            return Err(SafetyError::Config("shake.threshold must be > 0".into()));
        }
        if self.location.min_distance_m < 0.0 {
            return Err(SafetyError::Config(
                "location.min_distance_m must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Value sent as `x-auth-token`; gated calls fail with
    /// `NotAuthenticated` while this is unset.
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BACKEND_URL.to_string(),
            auth_token: None,
            timeout_secs: 30,
        }
    }
}

/// Location stream throttling. A sample is delivered only once both the
/// temporal and the spatial threshold are met.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub min_interval_ms: u64,
    pub min_distance_m: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 5000,
            min_distance_m: 10.0,
        }
    }
}

impl LocationConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShakeConfig {
    /// Magnitude (g-units) that must be exceeded
    pub threshold: f64,
    pub cooldown_ms: u64,
    pub sample_interval_ms: u64,
}

impl Default for ShakeConfig {
    fn default() -> Self {
        Self {
            threshold: 2.0,
            cooldown_ms: 3000,
            sample_interval_ms: 100,
        }
    }
}

impl ShakeConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMode {
    /// Alert once when entering a zone
    #[default]
    EdgeTriggered,
    /// Alert on every position evaluated inside a zone
    EverySample,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    pub alert_mode: AlertMode,
}
