//! Danger-zone containment and zone-entry alerts.

use crate::config::AlertMode;
use crate::error::Result;
use crate::events::{emit, EventSender, SafetyEvent};
use crate::gateway::BackendGateway;
use crate::types::{DangerZone, GeoPoint, Severity};
use chrono::{DateTime, Utc};
use geo::{BoundingRect, Coord, LineString};
use rstar::{RTree, RTreeObject, AABB};
use std::sync::{Arc, Mutex, RwLock};

/// Even-odd ray casting against an implicitly closed ring.
///
/// Casts a ray from `point` toward +∞ longitude and counts edge crossings,
/// walking edges `(V[i-1], V[i])` with `V[-1] = V[n-1]`. Points lying exactly
/// on an edge may land on either side.
pub fn contains(ring: &[GeoPoint], point: GeoPoint) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }

    let (lat, lng) = (point.latitude, point.longitude);
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (ring[j], ring[i]);
        // edge straddles the ray's latitude (half-open, so shared vertices count once)
        if (a.latitude > lat) != (b.latitude > lat) {
            let cross_lng = a.longitude
                + (lat - a.latitude) * (b.longitude - a.longitude) / (b.latitude - a.latitude);
            if lng < cross_lng {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Result of testing one point against a zone set
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneEvaluation {
    pub in_zone: bool,
    /// First zone (in snapshot order) containing the point
    pub matched_zone: Option<DangerZone>,
}

impl ZoneEvaluation {
    fn outside() -> Self {
        Self {
            in_zone: false,
            matched_zone: None,
        }
    }
}

/// Union-of-zones test, first match wins
pub fn evaluate(point: GeoPoint, zones: &[DangerZone]) -> ZoneEvaluation {
    zones
        .iter()
        .find(|zone| contains(&zone.polygon, point))
        .map(|zone| ZoneEvaluation {
            in_zone: true,
            matched_zone: Some(zone.clone()),
        })
        .unwrap_or_else(ZoneEvaluation::outside)
}

/// Zone bounding box in the R-tree, remembering its position in the snapshot
#[derive(Clone, Debug)]
struct IndexedZone {
    ordinal: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedZone {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn compute_envelope(zone: &DangerZone) -> AABB<[f64; 2]> {
    let ring: LineString<f64> = zone
        .polygon
        .iter()
        .map(|p| Coord {
            x: p.longitude,
            y: p.latitude,
        })
        .collect();
    match ring.bounding_rect() {
        Some(rect) => AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
        None => AABB::from_corners([0.0, 0.0], [0.0, 0.0]),
    }
}

/// Immutable set of danger zones as of one successful fetch.
///
/// Zones are indexed by bounding box so a position only ray-casts against
/// zones whose box contains it. Evaluation order still follows the backend's
/// order, so "first match" is stable across index layouts.
pub struct ZoneSnapshot {
    zones: Vec<DangerZone>,
    index: RTree<IndexedZone>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl ZoneSnapshot {
    pub fn empty() -> Self {
        Self {
            zones: Vec::new(),
            index: RTree::new(),
            fetched_at: None,
        }
    }

    pub fn new(zones: Vec<DangerZone>) -> Self {
        let indexed: Vec<IndexedZone> = zones
            .iter()
            .enumerate()
            .map(|(ordinal, zone)| IndexedZone {
                ordinal,
                envelope: compute_envelope(zone),
            })
            .collect();

        Self {
            index: RTree::bulk_load(indexed),
            zones,
            fetched_at: Some(Utc::now()),
        }
    }

    pub fn zones(&self) -> &[DangerZone] {
        &self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn evaluate(&self, point: GeoPoint) -> ZoneEvaluation {
        let query = AABB::from_point([point.longitude, point.latitude]);
        let mut candidates: Vec<usize> = self
            .index
            .locate_in_envelope_intersecting(&query)
            .map(|z| z.ordinal)
            .collect();
        candidates.sort_unstable();

        candidates
            .into_iter()
            .map(|ordinal| &self.zones[ordinal])
            .find(|zone| contains(&zone.polygon, point))
            .map(|zone| ZoneEvaluation {
                in_zone: true,
                matched_zone: Some(zone.clone()),
            })
            .unwrap_or_else(ZoneEvaluation::outside)
    }
}

/// Alert raised by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneAlert {
    pub zone_id: String,
    pub severity: Severity,
}

/// Result of a backend zone refresh
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRefresh {
    pub count: usize,
    /// Set when the last known position falls inside a zone of the new set
    pub alert: Option<ZoneAlert>,
}

#[derive(Default)]
struct FenceState {
    last_point: Option<GeoPoint>,
    current_zone: Option<String>,
}

/// Tracks the user's position against the latest zone snapshot
pub struct GeofenceEngine {
    mode: AlertMode,
    snapshot: RwLock<Arc<ZoneSnapshot>>,
    state: Mutex<FenceState>,
    events: EventSender,
}

impl GeofenceEngine {
    pub fn new(mode: AlertMode, events: EventSender) -> Self {
        Self {
            mode,
            snapshot: RwLock::new(Arc::new(ZoneSnapshot::empty())),
            state: Mutex::new(FenceState::default()),
            events,
        }
    }

    pub fn alert_mode(&self) -> AlertMode {
        self.mode
    }

    /// Current snapshot; readers never see a half-applied refresh
    pub fn snapshot(&self) -> Arc<ZoneSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn current_zone(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.current_zone.clone())
    }

    pub fn is_in_danger(&self) -> bool {
        self.current_zone().is_some()
    }

    /// Swap in a new zone set and re-evaluate the last known position
    pub fn replace_zones(&self, zones: Vec<DangerZone>) -> Option<ZoneAlert> {
        let fresh = Arc::new(ZoneSnapshot::new(zones));
        let count = fresh.len();
        match self.snapshot.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        emit(&self.events, SafetyEvent::ZonesRefreshed { count });

        let last = self.state.lock().ok().and_then(|s| s.last_point);
        last.and_then(|point| self.on_position(point))
    }

    /// Evaluate a new position and apply the alert policy
    pub fn on_position(&self, point: GeoPoint) -> Option<ZoneAlert> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        // read the snapshot under the state lock so evaluations are serialized
        // against the latest zones
        let evaluation = self.snapshot().evaluate(point);
        state.last_point = Some(point);

        let previous = state.current_zone.take();
        let matched = evaluation.matched_zone;
        state.current_zone = matched.as_ref().map(|z| z.id.clone());

        if let Some(prev) = previous.as_ref() {
            if matched.is_none() {
                log::info!("Left danger zone {}", prev);
                emit(
                    &self.events,
                    SafetyEvent::ZoneExited {
                        zone_id: prev.clone(),
                    },
                );
            }
        }

        let zone = matched?;
        let entered = previous.as_deref() != Some(zone.id.as_str());
        let fire = match self.mode {
            AlertMode::EdgeTriggered => entered,
            AlertMode::EverySample => true,
        };
        if !fire {
            return None;
        }

        log::warn!("Inside danger zone {} (severity {})", zone.id, zone.severity);
        emit(
            &self.events,
            SafetyEvent::ZoneEntered {
                zone_id: zone.id.clone(),
                severity: zone.severity,
            },
        );
        Some(ZoneAlert {
            zone_id: zone.id,
            severity: zone.severity,
        })
    }

    /// Fetch zones from the backend and swap them in. On failure the
    /// previous snapshot stays in effect.
    pub async fn refresh(&self, gateway: &BackendGateway) -> Result<ZoneRefresh> {
        let zones = gateway.fetch_danger_zones().await?;
        let count = zones.len();
        log::info!("Fetched {} danger zone(s)", count);
        let alert = self.replace_zones(zones);
        Ok(ZoneRefresh { count, alert })
    }
}
