//! Fixed 10-slot telemetry ring per device, and the manager that owns them.
//!
//! Samples are accepted only in strictly increasing timestamp order. The
//! 90-minute window is gated on a full buffer so derived metrics are never
//! computed from partial history.

#![allow(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::capabilities::{Capability, SnapshotData, SnapshotProvider};

/// Slots per device.
pub const BUFFER_CAPACITY: usize = 10;
/// Age bound for the metrics window.
pub const WINDOW_MINUTES: i64 = 90;

/// Positioning status tokens that mean "valid fix".
#[must_use]
pub fn is_valid_status(status: &str) -> bool {
    matches!(status, "A" | "true")
}

// ──────────────────── entry ────────────────────

/// One telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferEntry {
    pub imei: String,
    pub datetime: DateTime<Utc>,
    pub speed: i64,
    pub gsm_signal: i64,
    pub positioning_status: String,
    pub is_valid: bool,
    pub latitude: f64,
    pub longitude: f64,
}

impl BufferEntry {
    #[must_use]
    pub fn new(
        imei: impl Into<String>,
        datetime: DateTime<Utc>,
        speed: i64,
        gsm_signal: i64,
        positioning_status: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        let positioning_status = positioning_status.into();
        Self {
            imei: imei.into(),
            datetime,
            speed,
            gsm_signal,
            is_valid: is_valid_status(&positioning_status),
            positioning_status,
            latitude,
            longitude,
        }
    }

    fn to_snapshot_value(&self) -> Value {
        json!({
            "imei": self.imei,
            "datetime": self.datetime.to_rfc3339_opts(SecondsFormat::Secs, true),
            "speed": self.speed,
            "gsm_signal": self.gsm_signal,
            "positioning_status": self.positioning_status,
            "latitude": self.latitude,
            "longitude": self.longitude,
            "is_valid": self.is_valid,
        })
    }
}

/// Result of [`FixedCircularBuffer::add_entry`].
///
/// Both variants carry the "buffer is now full" flag so callers that only need
/// the boolean contract can use [`AddOutcome::is_full`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted { full: bool },
    /// Timestamp not after the newest stored sample; state untouched.
    Stale { full: bool },
}

impl AddOutcome {
    #[must_use]
    pub const fn is_full(self) -> bool {
        match self {
            Self::Accepted { full } | Self::Stale { full } => full,
        }
    }

    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

// ──────────────────── ring ────────────────────

/// Chronologically ordered ring of at most [`BUFFER_CAPACITY`] samples.
#[derive(Debug, Default)]
pub struct FixedCircularBuffer {
    entries: VecDeque<BufferEntry>,
}

impl FixedCircularBuffer {
    fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(BUFFER_CAPACITY),
        }
    }

    pub fn add_entry(&mut self, entry: BufferEntry) -> AddOutcome {
        if let Some(last) = self.entries.back() {
            if entry.datetime <= last.datetime {
                tracing::debug!(
                    imei = %entry.imei,
                    sample = %entry.datetime,
                    newest = %last.datetime,
                    "stale sample rejected"
                );
                return AddOutcome::Stale {
                    full: self.is_full(),
                };
            }
        }
        if self.entries.len() == BUFFER_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        AddOutcome::Accepted {
            full: self.is_full(),
        }
    }

    /// Entries younger than 90 minutes relative to `now`; empty unless full.
    #[must_use]
    pub fn entries_in_window_at(&self, now: DateTime<Utc>) -> Vec<BufferEntry> {
        if !self.is_full() {
            return Vec::new();
        }
        let window = TimeDelta::minutes(WINDOW_MINUTES);
        self.entries
            .iter()
            .filter(|entry| now.signed_duration_since(entry.datetime) < window)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() == BUFFER_CAPACITY
    }

    #[must_use]
    pub fn latest(&self) -> Option<&BufferEntry> {
        self.entries.back()
    }

    /// Up to `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &BufferEntry> {
        self.entries.iter().rev().take(n)
    }

    /// All entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &BufferEntry> {
        self.entries.iter()
    }
}

// ──────────────────── per-device handle ────────────────────

/// Lock-guarded ring plus its idle timestamp.
#[derive(Debug)]
pub struct DeviceBuffer {
    ring: RwLock<FixedCircularBuffer>,
    last_touched: Mutex<Instant>,
}

impl DeviceBuffer {
    fn new() -> Self {
        Self {
            ring: RwLock::new(FixedCircularBuffer::new()),
            last_touched: Mutex::new(Instant::now()),
        }
    }

    pub fn add_entry(&self, entry: BufferEntry) -> AddOutcome {
        self.ring.write().add_entry(entry)
    }

    pub fn entries_in_time_window_90min(&self) -> Vec<BufferEntry> {
        self.entries_in_window_at(Utc::now())
    }

    pub fn entries_in_window_at(&self, now: DateTime<Utc>) -> Vec<BufferEntry> {
        self.ring.read().entries_in_window_at(now)
    }

    /// Copy of every stored entry, oldest first.
    pub fn entries(&self) -> Vec<BufferEntry> {
        self.ring.read().iter().cloned().collect()
    }

    /// Signal strengths of the `n` most recent samples, newest first.
    pub fn recent_gsm(&self, n: usize) -> Vec<i64> {
        self.ring.read().recent(n).map(|e| e.gsm_signal).collect()
    }

    pub fn latest(&self) -> Option<BufferEntry> {
        self.ring.read().latest().cloned()
    }

    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.read().is_full()
    }

    fn touch(&self) {
        *self.last_touched.lock() = Instant::now();
    }

    fn idle_since(&self) -> Instant {
        *self.last_touched.lock()
    }
}

// ──────────────────── manager ────────────────────

/// Owns one [`DeviceBuffer`] per device id.
pub struct BufferManager {
    buffers: RwLock<HashMap<String, Arc<DeviceBuffer>>>,
    retention: Duration,
}

impl BufferManager {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// The only construction path for device buffers. Refreshes the idle clock.
    pub fn get_or_create_buffer(&self, imei: &str) -> Arc<DeviceBuffer> {
        if let Some(existing) = self.buffers.read().get(imei) {
            existing.touch();
            return Arc::clone(existing);
        }
        let mut buffers = self.buffers.write();
        let buffer = buffers
            .entry(imei.to_string())
            .or_insert_with(|| Arc::new(DeviceBuffer::new()));
        buffer.touch();
        Arc::clone(buffer)
    }

    /// Existing buffer without creating one or refreshing its idle clock.
    pub fn get_buffer(&self, imei: &str) -> Option<Arc<DeviceBuffer>> {
        self.buffers.read().get(imei).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Evict buffers idle for longer than the retention period.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let mut buffers = self.buffers.write();
        let before = buffers.len();
        buffers.retain(|_, buffer| now.saturating_duration_since(buffer.idle_since()) <= self.retention);
        let evicted = before - buffers.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = buffers.len(), "idle device buffers evicted");
        }
        evicted
    }
}

impl Capability for BufferManager {
    fn name(&self) -> &'static str {
        "buffer"
    }

    fn snapshot_provider(&self) -> Option<&dyn SnapshotProvider> {
        Some(self)
    }
}

impl SnapshotProvider for BufferManager {
    fn snapshot_data(&self, imei: &str) -> SnapshotData {
        let entries: Vec<Value> = self
            .get_buffer(imei)
            .map(|buffer| buffer.entries())
            .unwrap_or_default()
            .iter()
            .map(BufferEntry::to_snapshot_value)
            .collect();
        let mut data = SnapshotData::new();
        data.insert("buffer_circular".to_string(), Value::Array(entries));
        data
    }
}
