//! Per-device capabilities exposed to rules, and the registry that owns them.
//!
//! Each capability registers once when the engine is assembled. Capabilities
//! that contribute to audit snapshots advertise a [`SnapshotProvider`]; the
//! snapshot extractor walks the registry and never needs to know the concrete
//! types.

#![allow(missing_docs)]

pub mod alerts;
pub mod buffer;
pub mod geofence;
pub mod metrics;
pub mod timing;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::errors::{FreError, Result};

pub use alerts::AlertsCapability;
pub use buffer::{AddOutcome, BufferEntry, BufferManager, DeviceBuffer, FixedCircularBuffer};
pub use geofence::GeofenceCapability;
pub use metrics::MetricsCapability;
pub use timing::{TimingCapability, TimingState};

/// Named sub-objects contributed to a snapshot.
pub type SnapshotData = Map<String, Value>;

/// A component registered with the engine.
pub trait Capability: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    /// `Some` when this capability contributes to audit snapshots.
    fn snapshot_provider(&self) -> Option<&dyn SnapshotProvider> {
        None
    }
}

/// Self-reported state for one device, merged into audit snapshots.
pub trait SnapshotProvider: Send + Sync {
    fn snapshot_data(&self, imei: &str) -> SnapshotData;
}

/// Explicit registry of the capabilities wired into one engine.
pub struct CapabilityRegistry {
    buffers: Arc<BufferManager>,
    metrics: Arc<MetricsCapability>,
    geofence: Arc<GeofenceCapability>,
    timing: Arc<TimingCapability>,
    alerts: Arc<AlertsCapability>,
    registered: Vec<Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Register the five core capabilities.
    pub fn new(
        buffers: Arc<BufferManager>,
        metrics: Arc<MetricsCapability>,
        geofence: Arc<GeofenceCapability>,
        timing: Arc<TimingCapability>,
        alerts: Arc<AlertsCapability>,
    ) -> Result<Self> {
        let mut registry = Self {
            buffers: Arc::clone(&buffers),
            metrics: Arc::clone(&metrics),
            geofence: Arc::clone(&geofence),
            timing: Arc::clone(&timing),
            alerts: Arc::clone(&alerts),
            registered: Vec::new(),
        };
        registry.register(buffers)?;
        registry.register(metrics)?;
        registry.register(geofence)?;
        registry.register(timing)?;
        registry.register(alerts)?;
        Ok(registry)
    }

    /// Add a capability. Names must be unique.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        let name = capability.name();
        if self.registered.iter().any(|c| c.name() == name) {
            return Err(FreError::Registry {
                details: format!("capability {name} already registered"),
            });
        }
        tracing::debug!(capability = name, version = capability.version(), "capability registered");
        self.registered.push(capability);
        Ok(())
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.registered.iter().map(|c| c.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.registered.iter().find(|c| c.name() == name)
    }

    /// Merge every provider's contribution for `imei`, in registration order.
    pub fn collect_snapshots(&self, imei: &str) -> SnapshotData {
        let mut merged = SnapshotData::new();
        for capability in &self.registered {
            if let Some(provider) = capability.snapshot_provider() {
                merged.extend(provider.snapshot_data(imei));
            }
        }
        merged
    }

    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    pub fn metrics(&self) -> &Arc<MetricsCapability> {
        &self.metrics
    }

    pub fn geofence(&self) -> &Arc<GeofenceCapability> {
        &self.geofence
    }

    pub fn timing(&self) -> &Arc<TimingCapability> {
        &self.timing
    }

    pub fn alerts(&self) -> &Arc<AlertsCapability> {
        &self.alerts
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::test_support::registry_with_store;
    use super::*;
    use crate::store::MemoryStore;

    struct OdometerCapability;

    impl Capability for OdometerCapability {
        fn name(&self) -> &'static str {
            "odometer"
        }

        fn snapshot_provider(&self) -> Option<&dyn SnapshotProvider> {
            Some(self)
        }
    }

    impl SnapshotProvider for OdometerCapability {
        fn snapshot_data(&self, imei: &str) -> SnapshotData {
            let mut data = SnapshotData::new();
            data.insert("odometer".to_string(), json!({ "imei": imei, "km": 1200 }));
            data
        }
    }

    #[test]
    fn core_capabilities_registered_in_order() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with_store(&store);
        assert_eq!(
            registry.names(),
            vec!["buffer", "metrics", "geofence", "timing", "alerts"]
        );
    }

    #[test]
    fn duplicate_names_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = registry_with_store(&store);
        registry.register(Arc::new(OdometerCapability)).unwrap();
        let err = registry
            .register(Arc::new(OdometerCapability))
            .expect_err("duplicate should fail");
        assert_eq!(err.code(), "FRE-2004");
    }

    #[test]
    fn new_providers_join_snapshots_without_extractor_changes() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = registry_with_store(&store);
        registry.register(Arc::new(OdometerCapability)).unwrap();

        let merged = registry.collect_snapshots("123456789012345");
        assert!(merged.contains_key("buffer_circular"));
        assert!(merged.contains_key("jammer_metrics"));
        assert!(merged.contains_key("geofence_checks"));
        assert!(merged.contains_key("timing_state"));
        assert_eq!(merged["odometer"]["km"], json!(1200));
    }
}
