//! Per-packet evaluation environment handed to rules.
//!
//! One [`EvaluationContext`] is built per packet and dropped when the packet's
//! rule pass ends. Rules see the packet read-only, set [`PacketFlags`], and
//! reach the capabilities only through the two facades. The alert cache in
//! [`StateFacade`] is private to the context; the durable guard behind it is
//! shared by every worker.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;

use crate::capabilities::{AddOutcome, BufferEntry, CapabilityRegistry};
use crate::engine::packet::{IncomingPacket, PacketFlags};

/// Assembles contexts over one capability registry.
#[derive(Clone)]
pub struct ContextBuilder {
    registry: Arc<CapabilityRegistry>,
}

impl ContextBuilder {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Fresh context for one packet with no deadline.
    pub fn build(&self, packet: IncomingPacket) -> EvaluationContext {
        let trace = Arc::new(Mutex::new(ExecutionTrace::default()));
        let state = StateFacade {
            imei: packet.imei.clone(),
            registry: Arc::clone(&self.registry),
            alert_states: Mutex::new(HashMap::new()),
            trace: Arc::clone(&trace),
        };
        let actions = ActionsFacade {
            imei: packet.imei.clone(),
            registry: Arc::clone(&self.registry),
            current_rule: String::new(),
            trace: Arc::clone(&trace),
        };
        EvaluationContext {
            packet,
            flags: PacketFlags::default(),
            state,
            actions,
            trace,
            deadline: None,
        }
    }
}

// ──────────────────── per-rule trace ────────────────────

/// What one rule did, drained by the worker after the rule returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionTrace {
    /// Facade operations invoked, in call order.
    pub components: Vec<String>,
    /// Rules whose durable alert mark this context created.
    pub alerts_won: Vec<String>,
    pub stage: Option<String>,
    pub stop_reason: Option<String>,
    /// `inside:<group>`, `outside:<group>` or `outside_all` for the last test.
    pub geofence_eval: Option<String>,
}

impl ExecutionTrace {
    fn record(&mut self, component: &str) {
        if !self.components.iter().any(|c| c == component) {
            self.components.push(component.to_string());
        }
    }
}

// ──────────────────── context ────────────────────

pub struct EvaluationContext {
    packet: IncomingPacket,
    flags: PacketFlags,
    state: StateFacade,
    actions: ActionsFacade,
    trace: Arc<Mutex<ExecutionTrace>>,
    deadline: Option<Instant>,
}

impl EvaluationContext {
    pub fn packet(&self) -> &IncomingPacket {
        &self.packet
    }

    pub fn imei(&self) -> &str {
        &self.packet.imei
    }

    pub fn flags(&self) -> &PacketFlags {
        &self.flags
    }

    pub fn flags_mut(&mut self) -> &mut PacketFlags {
        &mut self.flags
    }

    pub fn state(&self) -> &StateFacade {
        &self.state
    }

    pub fn actions(&self) -> &ActionsFacade {
        &self.actions
    }

    /// Annotate how far the current rule got, for the audit row.
    pub fn set_stage(&self, stage: impl Into<String>, stop_reason: Option<&str>) {
        let mut trace = self.trace.lock();
        trace.stage = Some(stage.into());
        trace.stop_reason = stop_reason.map(str::to_string);
    }

    /// Feed the packet into buffer, timing and last-position state.
    pub fn update_buffer_from_packet(&self) -> AddOutcome {
        self.state.update_memory_buffer_outcome(&self.packet)
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Start a rule: clear the previous rule's trace.
    pub(crate) fn begin_rule(&mut self, rule: &str) {
        rule.clone_into(&mut self.actions.current_rule);
        *self.trace.lock() = ExecutionTrace::default();
    }

    /// Take everything recorded since [`Self::begin_rule`].
    pub(crate) fn finish_rule(&mut self) -> ExecutionTrace {
        std::mem::take(&mut *self.trace.lock())
    }

    /// Peek at the running rule's trace without draining it.
    pub fn current_trace(&self) -> ExecutionTrace {
        self.trace.lock().clone()
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.state.registry
    }
}

// ──────────────────── state facade ────────────────────

/// Capability reads and writes scoped to the packet's device.
pub struct StateFacade {
    imei: String,
    registry: Arc<CapabilityRegistry>,
    alert_states: Mutex<HashMap<String, bool>>,
    trace: Arc<Mutex<ExecutionTrace>>,
}

impl StateFacade {
    pub fn imei(&self) -> &str {
        &self.imei
    }

    /// Add a sample to the device buffer; returns whether the buffer is full.
    pub fn update_memory_buffer(
        &self,
        speed: i64,
        gsm: i64,
        datetime: chrono::DateTime<chrono::Utc>,
        positioning_status: &str,
        latitude: f64,
        longitude: f64,
    ) -> bool {
        self.add_sample(BufferEntry::new(
            &self.imei,
            datetime,
            speed,
            gsm,
            positioning_status,
            latitude,
            longitude,
        ))
        .is_full()
    }

    pub(crate) fn update_memory_buffer_outcome(&self, packet: &IncomingPacket) -> AddOutcome {
        self.add_sample(BufferEntry::new(
            &self.imei,
            packet.datetime,
            packet.speed,
            packet.gsm_signal_strength,
            &packet.positioning_status,
            packet.latitude,
            packet.longitude,
        ))
    }

    /// Buffer first; timing and last position only move on an accepted sample.
    /// Both reject times older than what they hold, so concurrent packets for
    /// one device cannot rewind them after the buffer lock is released.
    fn add_sample(&self, entry: BufferEntry) -> AddOutcome {
        self.trace.lock().record("update_memory_buffer");
        let (datetime, lat, lon) = (entry.datetime, entry.latitude, entry.longitude);
        let status = entry.positioning_status.clone();
        let outcome = self
            .registry
            .buffers()
            .get_or_create_buffer(&self.imei)
            .add_entry(entry);
        if outcome.is_accepted() {
            self.registry.timing().update_state(&self.imei, datetime, &status);
            self.registry
                .geofence()
                .update_last_packet_at(&self.imei, datetime, lat, lon);
        }
        outcome
    }

    pub fn buffer_len(&self) -> usize {
        self.registry
            .buffers()
            .get_buffer(&self.imei)
            .map_or(0, |buffer| buffer.len())
    }

    pub fn has_full_buffer(&self) -> bool {
        self.registry
            .buffers()
            .get_buffer(&self.imei)
            .is_some_and(|buffer| buffer.is_full())
    }

    pub fn average_speed_90min(&self) -> i64 {
        self.trace.lock().record("metrics");
        self.registry.metrics().average_speed_90min(&self.imei)
    }

    pub fn average_gsm_last5(&self) -> i64 {
        self.trace.lock().record("metrics");
        self.registry.metrics().average_gsm_last5(&self.imei)
    }

    pub fn is_offline_for(&self, minutes: i64) -> bool {
        self.trace.lock().record("timing");
        self.registry.timing().is_offline_for(&self.imei, minutes)
    }

    pub fn is_inside_group(&self, group: &str, lat: f64, lon: f64) -> bool {
        let inside = self.registry.geofence().is_inside_group(group, lat, lon);
        let mut trace = self.trace.lock();
        trace.record("geofence");
        let verdict = if inside { "inside" } else { "outside" };
        trace.geofence_eval = Some(format!("{verdict}:{group}"));
        inside
    }

    pub fn is_outside_all(&self, groups: &[String], lat: f64, lon: f64) -> bool {
        for group in groups {
            if self.is_inside_group(group, lat, lon) {
                return false;
            }
        }
        let mut trace = self.trace.lock();
        trace.record("geofence");
        trace.geofence_eval = Some("outside_all".to_string());
        true
    }

    /// Local cache first, then the durable guard. Only `true` is cached so a
    /// mark made by another worker is still seen later in this pass.
    pub fn is_alert_sent_for_rule(&self, rule: &str) -> bool {
        if self.alert_states.lock().get(rule).copied().unwrap_or(false) {
            return true;
        }
        let sent = self.registry.alerts().is_alert_sent(&self.imei, rule);
        if sent {
            self.alert_states.lock().insert(rule.to_string(), true);
        }
        sent
    }

    /// Durable check-and-set; `true` only when this call created the mark.
    pub fn mark_alert_sent_for_rule(&self, rule: &str) -> bool {
        let won = self.registry.alerts().mark_alert_sent(&self.imei, rule);
        self.alert_states.lock().insert(rule.to_string(), true);
        let mut trace = self.trace.lock();
        trace.record("mark_alert_sent");
        if won {
            trace.alerts_won.push(rule.to_string());
        }
        won
    }

    /// Copy of the per-context alert cache.
    pub fn alert_states(&self) -> HashMap<String, bool> {
        self.alert_states.lock().clone()
    }
}

// ──────────────────── actions facade ────────────────────

/// Side effects a rule may request. Best-effort; failures are logged.
pub struct ActionsFacade {
    imei: String,
    registry: Arc<CapabilityRegistry>,
    current_rule: String,
    trace: Arc<Mutex<ExecutionTrace>>,
}

impl ActionsFacade {
    pub fn send_telegram(&self, message: &str) {
        self.trace.lock().record("send_telegram");
        self.registry
            .alerts()
            .send_telegram(&self.imei, &self.current_rule, message);
    }

    pub fn log(&self, message: &str) {
        self.trace.lock().record("log");
        self.registry
            .alerts()
            .log(&self.imei, &self.current_rule, message);
    }

    pub fn current_rule(&self) -> &str {
        &self.current_rule
    }

    /// Render any JSON value as message text: strings unquoted, null empty.
    #[must_use]
    pub fn cast_string(value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        }
    }
}
