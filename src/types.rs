use chrono::{DateTime, Utc};
use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// WGS84 position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in meters
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        // geo works in (x=lon, y=lat)
        let a = Point::new(self.longitude, self.latitude);
        let b = Point::new(other.longitude, other.latitude);
        a.haversine_distance(&b)
    }
}

/// Position fix delivered by the platform location stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub coords: GeoPoint,
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            coords: GeoPoint::new(latitude, longitude),
            captured_at,
        }
    }
}

/// Raw accelerometer reading in g-units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShakeSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub captured_at: DateTime<Utc>,
}

impl ShakeSample {
    pub fn new(x: f64, y: f64, z: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            x,
            y,
            z,
            captured_at,
        }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Lenient parse of the backend's severity string
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

/// Danger-zone polygon. The ring is implicitly closed (last vertex connects
/// to the first) and always has at least three vertices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DangerZone {
    pub id: String,
    pub polygon: Vec<GeoPoint>,
    pub severity: Severity,
}

impl DangerZone {
    /// Returns `None` for degenerate rings (fewer than three vertices).
    pub fn new(id: impl Into<String>, polygon: Vec<GeoPoint>, severity: Severity) -> Option<Self> {
        if polygon.len() < 3 {
            return None;
        }
        Some(Self {
            id: id.into(),
            polygon,
            severity,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SosTrigger {
    Manual,
    Shake,
}

impl Display for SosTrigger {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SosTrigger::Manual => write!(f, "manual"),
            SosTrigger::Shake => write!(f, "shake"),
        }
    }
}

/// A dispatched SOS alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosEvent {
    pub triggered_by: SosTrigger,
    pub dispatched_at: DateTime<Utc>,
}

/// Contact record as stored by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedContact {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_shake_magnitude() {
        let sample = ShakeSample::new(3.0, 4.0, 0.0, Utc::now());
        assert_eq!(sample.magnitude(), 5.0);
    }

    #[test]
    fn test_distance_one_millidegree_latitude() {
        let a = GeoPoint::new(28.6139, 77.2090);
        let b = GeoPoint::new(28.6149, 77.2090);
        // ~111 m per degree of latitude / 1000
        assert_relative_eq!(a.distance_m(&b), 111.2, epsilon = 0.5);
    }

    #[test]
    fn test_degenerate_zone_rejected() {
        let ring = vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 1.0)];
        assert!(DangerZone::new("z", ring, Severity::High).is_none());
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("HIGH"), Some(Severity::High));
        assert_eq!(Severity::parse(" low "), Some(Severity::Low));
        assert_eq!(Severity::parse("extreme"), None);
    }

    #[test]
    fn test_contact_wire_format() {
        let json = r#"{"_id":"c1","name":"Asha","phone":"+911234"}"#;
        let contact: TrustedContact = serde_json::from_str(json).unwrap();
        assert_eq!(contact.id, "c1");
        assert_eq!(contact.email, None);
    }
}
