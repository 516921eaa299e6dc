//! Persistence contracts consumed by the capabilities and the rule loader.
//!
//! Every trait is object-safe and `Send + Sync` so a single store instance can
//! be shared across worker threads behind an `Arc`. Implementations must never
//! be called while an in-memory lock is held by the caller.

#![allow(missing_docs)]

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Generic per-device scalar state.
pub trait StateStore: Send + Sync {
    fn get_string(&self, imei: &str, key: &str) -> Result<Option<String>>;
    fn set_string(&self, imei: &str, key: &str, value: &str) -> Result<()>;
    fn get_i64(&self, imei: &str, key: &str) -> Result<Option<i64>>;
    fn set_i64(&self, imei: &str, key: &str, value: i64) -> Result<()>;
    fn get_time(&self, imei: &str, key: &str) -> Result<Option<DateTime<Utc>>>;
    fn set_time(&self, imei: &str, key: &str, value: DateTime<Utc>) -> Result<()>;
}

/// Read-only geofence reference data.
pub trait GeofenceStore: Send + Sync {
    fn geofences_by_group(&self, group: &str) -> Result<Vec<GeofenceShape>>;
}

/// Durable at-most-once guard keyed by (device, rule).
pub trait AlertGuardStore: Send + Sync {
    fn is_alert_sent(&self, imei: &str, rule: &str) -> Result<bool>;
    /// Insert-if-absent. `Ok(true)` only for the caller that created the mark.
    fn try_mark_alert_sent(&self, imei: &str, rule: &str) -> Result<bool>;
}

/// Source of rule definitions.
pub trait RuleSource: Send + Sync {
    /// Active rules, highest priority first.
    fn load_active_rules(&self) -> Result<Vec<RuleDefinition>>;
    /// Every rule regardless of its active flag.
    fn list_rules(&self) -> Result<Vec<RuleDefinition>>;
}

// ──────────────────── reference data ────────────────────

/// Geometry of one persisted geofence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShapeKind {
    Circle {
        center_lat: f64,
        center_lon: f64,
        radius_m: f64,
    },
    BoundingBox {
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    },
}

impl ShapeKind {
    /// Storage label for the shape type.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Circle { .. } => "circle",
            Self::BoundingBox { .. } => "polygon",
        }
    }
}

/// A named geofence shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceShape {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub kind: ShapeKind,
}

/// A stored rule: script body plus optional YAML audit manifest fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub script: String,
    pub audit_manifest: Option<String>,
    pub active: bool,
    pub priority: i64,
}

impl RuleDefinition {
    /// Convenience constructor for an active rule with the default priority.
    #[must_use]
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            script: script.into(),
            audit_manifest: None,
            active: true,
            priority: DEFAULT_RULE_PRIORITY,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_manifest(mut self, manifest: impl Into<String>) -> Self {
        self.audit_manifest = Some(manifest.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Priority assigned to rules that do not set one.
pub const DEFAULT_RULE_PRIORITY: i64 = 100;
