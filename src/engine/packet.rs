//! Tracker payload decoding.
//!
//! A payload carries one device id and a batch of packets, either as an
//! object keyed by sequence number or as a plain array:
//!
//! ```json
//! {"IMEI": "860000000000001",
//!  "ListPackets": {"0": {"Speed": 12, "Datetime": "2026-05-01T08:00:00Z", ...}}}
//! ```

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::errors::{FreError, Result};

/// One decoded position report. Read-only to rules.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingPacket {
    pub imei: String,
    /// Speed in km/h.
    pub speed: i64,
    pub gsm_signal_strength: i64,
    pub datetime: DateTime<Utc>,
    pub positioning_status: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Fields the core does not interpret (altitude, event code, mileage...).
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extras: Map<String, Value>,
}

impl IncomingPacket {
    pub fn new(imei: impl Into<String>, datetime: DateTime<Utc>) -> Self {
        Self {
            imei: imei.into(),
            speed: 0,
            gsm_signal_strength: 0,
            datetime,
            positioning_status: "A".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            extras: Map::new(),
        }
    }

    #[must_use]
    pub fn with_speed(mut self, speed: i64) -> Self {
        self.speed = speed;
        self
    }

    #[must_use]
    pub fn with_gsm(mut self, gsm: i64) -> Self {
        self.gsm_signal_strength = gsm;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.positioning_status = status.into();
        self
    }

    #[must_use]
    pub fn with_position(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = latitude;
        self.longitude = longitude;
        self
    }
}

/// Per-packet facts rules may set while they run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PacketFlags {
    pub buffer_updated: bool,
    pub buffer_has_10: bool,
    pub is_offline_for_5min: bool,
    pub position_invalid_detected: bool,
    pub metrics_ready: bool,
    pub moving_with_weak_signal: bool,
    pub outside_all_safe_zones: bool,
}

/// Turns a raw transport payload into packets.
pub trait TrackerAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decode a payload. Individual malformed packets are skipped; a payload
    /// that yields nothing at all is an error.
    fn parse(&self, payload: &str) -> Result<Vec<IncomingPacket>>;
}

// ──────────────────── JSON tracker format ────────────────────

const MPS_TO_KMH: f64 = 3.6;

#[derive(Debug, Deserialize)]
struct RawPayload {
    #[serde(rename = "IMEI", default)]
    imei: String,
    #[serde(rename = "ListPackets", default)]
    list_packets: Option<RawPacketList>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPacketList {
    Keyed(BTreeMap<String, RawPacket>),
    Sequence(Vec<RawPacket>),
}

impl RawPacketList {
    fn into_packets(self) -> Vec<RawPacket> {
        match self {
            Self::Keyed(map) => map.into_values().collect(),
            Self::Sequence(list) => list,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPacket {
    #[serde(rename = "IMEI", default)]
    imei: Option<String>,
    #[serde(rename = "Speed", default)]
    speed: f64,
    #[serde(rename = "GSMSignalStrength", default)]
    gsm_signal_strength: Option<i64>,
    #[serde(rename = "Datetime", default)]
    datetime: Option<String>,
    #[serde(rename = "PositioningStatus", default)]
    positioning_status: String,
    #[serde(rename = "Latitude", default)]
    latitude: f64,
    #[serde(rename = "Longitude", default)]
    longitude: f64,
    #[serde(flatten)]
    extras: Map<String, Value>,
}

/// Adapter for the JSON payloads emitted by the tracker gateway.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTrackerAdapter;

impl JsonTrackerAdapter {
    fn convert(payload_imei: &str, raw: RawPacket) -> Option<IncomingPacket> {
        let imei = raw
            .imei
            .filter(|imei| !imei.is_empty())
            .unwrap_or_else(|| payload_imei.to_string());
        let datetime = match raw.datetime.as_deref().map(parse_datetime) {
            Some(Some(datetime)) => datetime,
            _ => {
                tracing::warn!(imei = %imei, raw = ?raw.datetime, "skipping packet without a usable datetime");
                return None;
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let speed = (raw.speed * MPS_TO_KMH).trunc() as i64;
        Some(IncomingPacket {
            imei,
            speed,
            gsm_signal_strength: raw.gsm_signal_strength.unwrap_or(0),
            datetime,
            positioning_status: raw.positioning_status,
            latitude: raw.latitude,
            longitude: raw.longitude,
            extras: raw.extras,
        })
    }
}

/// RFC 3339 timestamp; the zero time and the epoch count as missing.
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with("0001-01-01") {
        return None;
    }
    let parsed = DateTime::parse_from_rfc3339(trimmed)
        .ok()?
        .with_timezone(&Utc);
    (parsed.timestamp() > 0).then_some(parsed)
}

impl TrackerAdapter for JsonTrackerAdapter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn parse(&self, payload: &str) -> Result<Vec<IncomingPacket>> {
        let raw: RawPayload = serde_json::from_str(payload).map_err(|e| FreError::PayloadParse {
            details: e.to_string(),
        })?;
        let mut packets: Vec<IncomingPacket> = raw
            .list_packets
            .map(RawPacketList::into_packets)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|packet| Self::convert(&raw.imei, packet))
            .collect();
        if packets.is_empty() {
            return Err(FreError::PayloadParse {
                details: "no packets in payload".to_string(),
            });
        }
        // Buffers reject out-of-order samples, so feed them oldest first.
        packets.sort_by_key(|packet| packet.datetime);
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn keyed_payload_decodes_and_converts_speed() {
        let payload = json!({
            "IMEI": "860000000000001",
            "ListPackets": {
                "0": {
                    "IMEI": "860000000000001",
                    "Speed": 10,
                    "Latitude": 19.4326,
                    "Longitude": -99.1332,
                    "Datetime": "2026-05-01T08:00:00Z",
                    "PositioningStatus": "A",
                    "GSMSignalStrength": 7,
                    "Altitude": 2240,
                    "EventCode": {"Code": 35, "Name": "Track By Time Interval"}
                }
            }
        });
        let packets = JsonTrackerAdapter.parse(&payload.to_string()).unwrap();
        assert_eq!(packets.len(), 1);
        let p = &packets[0];
        assert_eq!(p.imei, "860000000000001");
        assert_eq!(p.speed, 36);
        assert_eq!(p.gsm_signal_strength, 7);
        assert_eq!(p.datetime, ts("2026-05-01T08:00:00Z"));
        assert_eq!(p.extras["Altitude"], json!(2240));
        assert_eq!(p.extras["EventCode"]["Code"], json!(35));
    }

    #[test]
    fn array_payload_is_sorted_oldest_first() {
        let payload = json!({
            "IMEI": "1",
            "ListPackets": [
                {"Speed": 1, "Datetime": "2026-05-01T08:02:00Z", "PositioningStatus": "A"},
                {"Speed": 1, "Datetime": "2026-05-01T08:01:00Z", "PositioningStatus": "V"}
            ]
        });
        let packets = JsonTrackerAdapter.parse(&payload.to_string()).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].positioning_status, "V");
        assert_eq!(packets[0].imei, "1");
        assert!(packets[0].datetime < packets[1].datetime);
    }

    #[test]
    fn missing_gsm_defaults_to_zero() {
        let payload = json!({
            "IMEI": "1",
            "ListPackets": {"0": {"Speed": 0, "Datetime": "2026-05-01T08:00:00Z"}}
        });
        let packets = JsonTrackerAdapter.parse(&payload.to_string()).unwrap();
        assert_eq!(packets[0].gsm_signal_strength, 0);
    }

    #[test]
    fn zero_datetime_is_skipped() {
        let payload = json!({
            "IMEI": "1",
            "ListPackets": {
                "0": {"Speed": 5, "Datetime": "0001-01-01T00:00:00Z"},
                "1": {"Speed": 5},
                "2": {"Speed": 5, "Datetime": "2026-05-01T08:00:00Z"}
            }
        });
        let packets = JsonTrackerAdapter.parse(&payload.to_string()).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].speed, 18);
    }

    #[test]
    fn empty_payload_is_an_error() {
        let err = JsonTrackerAdapter
            .parse(r#"{"IMEI": "1", "ListPackets": {}}"#)
            .unwrap_err();
        assert_eq!(err.code(), "FRE-2001");
        assert!(err.to_string().contains("no packets in payload"));

        let err = JsonTrackerAdapter.parse(r#"{"IMEI": "1"}"#).unwrap_err();
        assert_eq!(err.code(), "FRE-2001");
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = JsonTrackerAdapter.parse("not json").unwrap_err();
        assert!(matches!(err, FreError::PayloadParse { .. }));
    }

    #[test]
    fn flags_default_false() {
        let flags = PacketFlags::default();
        assert!(!flags.buffer_updated);
        assert!(!flags.outside_all_safe_zones);
    }
}
