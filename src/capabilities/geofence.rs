//! Point-in-group membership against persisted circles and bounding boxes.
//!
//! Lookups are fail-closed: an unknown group, an empty group, or a store
//! failure all answer "outside". Group shapes are cached for a bounded time
//! and re-fetched on miss; the store is never called with a lock held.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value, json};

use crate::capabilities::{Capability, SnapshotData, SnapshotProvider};
use crate::store::{GeofenceShape, GeofenceStore, ShapeKind};

/// Mean earth radius used by the haversine distance.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
#[must_use]
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

impl GeofenceShape {
    /// Whether the coordinate lies inside this shape (boundary inclusive).
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        match self.kind {
            ShapeKind::Circle {
                center_lat,
                center_lon,
                radius_m,
            } => haversine_m(center_lat, center_lon, lat, lon) <= radius_m,
            ShapeKind::BoundingBox {
                min_lat,
                max_lat,
                min_lon,
                max_lon,
            } => (min_lat..=max_lat).contains(&lat) && (min_lon..=max_lon).contains(&lon),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastPosition {
    at: Option<DateTime<Utc>>,
    lat: f64,
    lon: f64,
}

struct CachedGroup {
    shapes: Arc<Vec<GeofenceShape>>,
    fetched_at: Instant,
}

/// Geofence membership tests plus the last known position per device.
pub struct GeofenceCapability {
    store: Arc<dyn GeofenceStore>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedGroup>>,
    last_positions: RwLock<HashMap<String, LastPosition>>,
    snapshot_groups: Vec<String>,
}

impl GeofenceCapability {
    pub fn new(store: Arc<dyn GeofenceStore>, ttl: Duration, snapshot_groups: Vec<String>) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(HashMap::new()),
            last_positions: RwLock::new(HashMap::new()),
            snapshot_groups,
        }
    }

    pub fn is_inside_group(&self, group: &str, lat: f64, lon: f64) -> bool {
        self.shapes_for(group)
            .is_some_and(|shapes| shapes.iter().any(|shape| shape.contains(lat, lon)))
    }

    /// Whether the coordinate is outside every listed group.
    pub fn is_outside_all(&self, groups: &[String], lat: f64, lon: f64) -> bool {
        !groups.iter().any(|group| self.is_inside_group(group, lat, lon))
    }

    pub fn update_last_packet(&self, imei: &str, lat: f64, lon: f64) {
        self.last_positions
            .write()
            .insert(imei.to_string(), LastPosition { at: None, lat, lon });
    }

    /// Like [`Self::update_last_packet`], but a fix older than the stored one
    /// is ignored. Returns whether the position moved.
    pub fn update_last_packet_at(&self, imei: &str, at: DateTime<Utc>, lat: f64, lon: f64) -> bool {
        let mut positions = self.last_positions.write();
        if positions
            .get(imei)
            .and_then(|p| p.at)
            .is_some_and(|stored| at < stored)
        {
            return false;
        }
        positions.insert(imei.to_string(), LastPosition { at: Some(at), lat, lon });
        true
    }

    pub fn last_packet(&self, imei: &str) -> Option<(f64, f64)> {
        self.last_positions.read().get(imei).map(|p| (p.lat, p.lon))
    }

    /// Drop cached groups older than the TTL. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, cached| cached.fetched_at.elapsed() < self.ttl);
        before - cache.len()
    }

    /// Forget one group, or every group when `group` is `None`.
    pub fn invalidate(&self, group: Option<&str>) {
        let mut cache = self.cache.write();
        match group {
            Some(name) => {
                cache.remove(name);
            }
            None => cache.clear(),
        }
    }

    fn shapes_for(&self, group: &str) -> Option<Arc<Vec<GeofenceShape>>> {
        if let Some(cached) = self.cache.read().get(group) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Some(Arc::clone(&cached.shapes));
            }
        }

        match self.store.geofences_by_group(group) {
            Ok(shapes) => {
                let shapes = Arc::new(shapes);
                self.cache.write().insert(
                    group.to_string(),
                    CachedGroup {
                        shapes: Arc::clone(&shapes),
                        fetched_at: Instant::now(),
                    },
                );
                Some(shapes)
            }
            Err(error) => {
                tracing::warn!(group, %error, "geofence lookup failed, treating point as outside");
                None
            }
        }
    }
}

/// Snapshot key for a group: lowercase first path segment, e.g.
/// `Resguardo/Cedis/Puerto` becomes `inside_resguardo`.
fn group_key(group: &str) -> String {
    let head = group.split('/').next().unwrap_or(group);
    let slug: String = head
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("inside_{slug}")
}

impl Capability for GeofenceCapability {
    fn name(&self) -> &'static str {
        "geofence"
    }

    fn snapshot_provider(&self) -> Option<&dyn SnapshotProvider> {
        Some(self)
    }
}

impl SnapshotProvider for GeofenceCapability {
    fn snapshot_data(&self, imei: &str) -> SnapshotData {
        let position = self.last_packet(imei);
        let mut checks = Map::new();
        for group in &self.snapshot_groups {
            let inside = position.is_some_and(|(lat, lon)| self.is_inside_group(group, lat, lon));
            checks.insert(group_key(group), Value::Bool(inside));
        }
        checks.insert("evaluated".to_string(), Value::Bool(position.is_some()));
        checks.insert(
            "last_position".to_string(),
            position.map_or(Value::Null, |(lat, lon)| json!({ "latitude": lat, "longitude": lon })),
        );

        let mut data = SnapshotData::new();
        data.insert("geofence_checks".to_string(), Value::Object(checks));
        data
    }
}
