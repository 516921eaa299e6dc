//! Last-seen and last-valid-fix tracking per device.
//!
//! State lives in memory and is written through to the device state store so
//! offline detection survives a restart. Store failures only cost durability.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use parking_lot::RwLock;
use serde_json::{Value, json};

use crate::capabilities::buffer::is_valid_status;
use crate::capabilities::{Capability, SnapshotData, SnapshotProvider};
use crate::store::StateStore;

const KEY_LAST_VALID: &str = "timing.last_valid_position";
const KEY_CURRENT: &str = "timing.current_packet_time";

/// Timing facts for one device. `None` fields mean "never seen".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingState {
    pub last_valid_position: Option<DateTime<Utc>>,
    pub current_packet_time: Option<DateTime<Utc>>,
    pub last_status: String,
}

impl TimingState {
    /// Time between the newest packet and the newest valid fix.
    #[must_use]
    pub fn offline_duration(&self) -> Option<TimeDelta> {
        match (self.current_packet_time, self.last_valid_position) {
            (Some(current), Some(valid)) => Some(current.signed_duration_since(valid)),
            _ => None,
        }
    }
}

pub struct TimingCapability {
    states: RwLock<HashMap<String, TimingState>>,
    store: Option<Arc<dyn StateStore>>,
}

impl TimingCapability {
    pub fn new(store: Option<Arc<dyn StateStore>>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Record a packet time; the valid-fix time only moves on a valid status.
    ///
    /// Times never move backwards: a packet older than the newest one on
    /// record is ignored and `false` is returned.
    pub fn update_state(&self, imei: &str, datetime: DateTime<Utc>, positioning_status: &str) -> bool {
        let valid = is_valid_status(positioning_status);
        let hydrated = if self.states.read().contains_key(imei) {
            None
        } else {
            Some(self.hydrate(imei))
        };

        {
            let mut states = self.states.write();
            let state = states
                .entry(imei.to_string())
                .or_insert_with(|| hydrated.unwrap_or_default());
            if state.current_packet_time.is_some_and(|current| datetime < current) {
                tracing::debug!(imei, %datetime, "out-of-order timing update ignored");
                return false;
            }
            state.current_packet_time = Some(datetime);
            state.last_status = positioning_status.to_string();
            if valid {
                state.last_valid_position = Some(datetime);
            }
        }

        if let Some(store) = &self.store {
            let mut result = store.set_time(imei, KEY_CURRENT, datetime);
            if valid && result.is_ok() {
                result = store.set_time(imei, KEY_LAST_VALID, datetime);
            }
            if let Err(error) = result {
                tracing::warn!(imei, %error, "timing state write-through failed");
            }
        }
        true
    }

    /// True once the newest packet is at least `minutes` past the last valid fix.
    /// A device with no valid fix on record is never reported offline.
    pub fn is_offline_for(&self, imei: &str, minutes: i64) -> bool {
        self.state(imei)
            .offline_duration()
            .is_some_and(|elapsed| elapsed >= TimeDelta::minutes(minutes))
    }

    /// Current state, hydrated from the store when not yet in memory.
    pub fn state(&self, imei: &str) -> TimingState {
        if let Some(state) = self.states.read().get(imei) {
            return state.clone();
        }
        let hydrated = self.hydrate(imei);
        if hydrated == TimingState::default() {
            return hydrated;
        }
        self.states
            .write()
            .entry(imei.to_string())
            .or_insert(hydrated)
            .clone()
    }

    fn hydrate(&self, imei: &str) -> TimingState {
        let Some(store) = &self.store else {
            return TimingState::default();
        };
        let read = |key: &str| match store.get_time(imei, key) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(imei, key, %error, "timing state hydrate failed");
                None
            }
        };
        TimingState {
            last_valid_position: read(KEY_LAST_VALID),
            current_packet_time: read(KEY_CURRENT),
            last_status: String::new(),
        }
    }
}

fn rfc3339_or_null(ts: Option<DateTime<Utc>>) -> Value {
    ts.map_or(Value::Null, |t| {
        Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true))
    })
}

impl Capability for TimingCapability {
    fn name(&self) -> &'static str {
        "timing"
    }

    fn snapshot_provider(&self) -> Option<&dyn SnapshotProvider> {
        Some(self)
    }
}

impl SnapshotProvider for TimingCapability {
    fn snapshot_data(&self, imei: &str) -> SnapshotData {
        let state = self.state(imei);
        let mut data = SnapshotData::new();
        data.insert(
            "timing_state".to_string(),
            json!({
                "last_valid_position": rfc3339_or_null(state.last_valid_position),
                "current_packet_time": rfc3339_or_null(state.current_packet_time),
                "offline_minutes": state.offline_duration().map_or(0, |d| d.num_minutes()),
                "last_status": state.last_status,
            }),
        );
        data
    }
}
