//! Rolling averages derived from a device's buffer. Read-only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::capabilities::{BufferManager, Capability, SnapshotData, SnapshotProvider};

/// Samples used by the signal-strength average.
pub const GSM_SAMPLE_COUNT: usize = 5;

/// Average speed and signal strength per device.
pub struct MetricsCapability {
    buffers: Arc<BufferManager>,
}

impl MetricsCapability {
    /// Metrics over buffers owned by `buffers`.
    #[must_use]
    pub fn new(buffers: Arc<BufferManager>) -> Self {
        Self { buffers }
    }

    /// Integer mean speed over the 90-minute window. 0 means "not enough data".
    pub fn average_speed_90min(&self, imei: &str) -> i64 {
        self.average_speed_at(imei, Utc::now())
    }

    /// [`Self::average_speed_90min`] against an explicit clock.
    pub fn average_speed_at(&self, imei: &str, now: DateTime<Utc>) -> i64 {
        let Some(buffer) = self.buffers.get_buffer(imei) else {
            return 0;
        };
        let window = buffer.entries_in_window_at(now);
        integer_mean(window.iter().map(|e| e.speed))
    }

    /// Integer mean of the most recent signal readings the buffer holds.
    pub fn average_gsm_last5(&self, imei: &str) -> i64 {
        self.buffers
            .get_buffer(imei)
            .map_or(0, |buffer| integer_mean(buffer.recent_gsm(GSM_SAMPLE_COUNT).into_iter()))
    }
}

fn integer_mean(values: impl Iterator<Item = i64>) -> i64 {
    let (sum, count) = values.fold((0_i64, 0_i64), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { 0 } else { sum / count }
}

impl Capability for MetricsCapability {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn snapshot_provider(&self) -> Option<&dyn SnapshotProvider> {
        Some(self)
    }
}

impl SnapshotProvider for MetricsCapability {
    fn snapshot_data(&self, imei: &str) -> SnapshotData {
        let mut data = SnapshotData::new();
        data.insert(
            "jammer_metrics".to_string(),
            json!({
                "avg_speed_90min": self.average_speed_90min(imei),
                "avg_gsm_last5": self.average_gsm_last5(imei),
            }),
        );
        data
    }
}
