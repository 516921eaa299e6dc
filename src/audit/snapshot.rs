//! Snapshot extraction for audit rows.
//!
//! A snapshot is a JSON object: `packet_current` (the packet plus the flags
//! rules have set), `alert_states` (the context's local alert cache) and one
//! section per registered snapshot provider.

use serde_json::{Map, Value};

use crate::capabilities::SnapshotData;
use crate::engine::context::EvaluationContext;
use crate::engine::packet::IncomingPacket;

/// Section holding the packet and its flags.
pub const PACKET_SECTION: &str = "packet_current";
/// Section holding the per-context alert cache.
pub const ALERT_STATES_SECTION: &str = "alert_states";

/// Capture everything the context knows about `imei`.
///
/// `packet_override` replaces the context's packet in `packet_current`; flags
/// always come from the context.
pub fn extract_snapshot(
    ctx: &EvaluationContext,
    imei: &str,
    packet_override: Option<&IncomingPacket>,
) -> SnapshotData {
    let mut snapshot = SnapshotData::new();
    let packet = packet_override.unwrap_or_else(|| ctx.packet());

    let mut packet_section = to_object(packet);
    packet_section.extend(to_object(ctx.flags()));
    snapshot.insert(PACKET_SECTION.to_string(), Value::Object(packet_section));

    let alert_states: Map<String, Value> = ctx
        .state()
        .alert_states()
        .into_iter()
        .map(|(rule, sent)| (rule, Value::Bool(sent)))
        .collect();
    snapshot.insert(ALERT_STATES_SECTION.to_string(), Value::Object(alert_states));

    snapshot.extend(ctx.registry().collect_snapshots(imei));
    snapshot
}

fn to_object<T: serde::Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(error) => {
            tracing::warn!(%error, "snapshot section failed to serialize");
            Map::new()
        }
    }
}

/// Keep only the requested sections. An empty list keeps everything.
///
/// `packet` selects `packet_current`, `state` selects every other section,
/// and any other name selects the section with that exact key.
pub fn filter_snapshot(full: SnapshotData, fields: &[String]) -> SnapshotData {
    if fields.is_empty() {
        return full;
    }
    full.into_iter()
        .filter(|(key, _)| {
            fields.iter().any(|field| match field.as_str() {
                "packet" => key == PACKET_SECTION,
                "state" => key != PACKET_SECTION,
                other => key == other,
            })
        })
        .collect()
}
