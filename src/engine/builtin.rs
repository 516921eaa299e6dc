//! Built-in rule programs selected by script body.
//!
//! A stored rule whose script reads `native:<program> key=value ...` runs the
//! matching program below. Options override the configured jammer
//! thresholds per rule, e.g.
//! `native:jammer_detection offline_minutes=10 safe_groups=Taller,CLIENTES`.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::capabilities::buffer::is_valid_status;
use crate::core::config::JammerConfig;
use crate::core::errors::{FreError, Result};
use crate::engine::context::EvaluationContext;
use crate::engine::rules::{RuleCompiler, RuleProgram};
use crate::store::RuleDefinition;

pub const NATIVE_PREFIX: &str = "native:";

/// Programs this compiler knows, for listings and validation messages.
pub const NATIVE_PROGRAMS: [&str; 4] = [
    "buffer_update",
    "jammer_detection",
    "offline_alert",
    "invalid_position",
];

/// Default threshold for `offline_alert`.
pub const DEFAULT_OFFLINE_ALERT_MINUTES: i64 = 30;

/// Compiles `native:` scripts.
#[derive(Debug, Clone, Default)]
pub struct NativeRuleCompiler {
    jammer: JammerConfig,
}

impl NativeRuleCompiler {
    pub fn new(jammer: JammerConfig) -> Self {
        Self { jammer }
    }
}

/// Script split into program name and options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeScript {
    pub program: String,
    pub options: BTreeMap<String, String>,
}

impl NativeScript {
    pub fn parse(rule: &str, script: &str) -> Result<Self> {
        let compile_error = |details: String| FreError::RuleCompile {
            rule: rule.to_string(),
            details,
        };
        let body = script
            .trim()
            .strip_prefix(NATIVE_PREFIX)
            .ok_or_else(|| compile_error(format!("unsupported script; expected {NATIVE_PREFIX}<program>")))?;
        let mut tokens = body.split_whitespace();
        let program = tokens
            .next()
            .ok_or_else(|| compile_error("missing program name".to_string()))?
            .to_string();
        let mut options = BTreeMap::new();
        for token in tokens {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| compile_error(format!("option {token:?} is not key=value")))?;
            options.insert(key.to_string(), value.to_string());
        }
        Ok(Self { program, options })
    }

    fn take<T: FromStr>(&mut self, rule: &str, key: &str, default: T) -> Result<T> {
        match self.options.remove(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| FreError::RuleCompile {
                rule: rule.to_string(),
                details: format!("option {key}={raw} is not valid"),
            }),
        }
    }

    fn take_list(&mut self, key: &str, default: &[String]) -> Vec<String> {
        self.options.remove(key).map_or_else(
            || default.to_vec(),
            |raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            },
        )
    }

    fn finish(self, rule: &str) -> Result<()> {
        match self.options.keys().next() {
            None => Ok(()),
            Some(key) => Err(FreError::RuleCompile {
                rule: rule.to_string(),
                details: format!("unknown option {key} for {}", self.program),
            }),
        }
    }
}

impl RuleCompiler for NativeRuleCompiler {
    fn compile(&self, rule: &RuleDefinition) -> Result<Arc<dyn RuleProgram>> {
        let name = rule.name.as_str();
        let mut script = NativeScript::parse(name, &rule.script)?;
        let program: Arc<dyn RuleProgram> = match script.program.as_str() {
            "buffer_update" => Arc::new(BufferUpdate),
            "invalid_position" => Arc::new(InvalidPosition),
            "offline_alert" => Arc::new(OfflineAlert {
                guard: name.to_string(),
                minutes: script.take(name, "minutes", DEFAULT_OFFLINE_ALERT_MINUTES)?,
            }),
            "jammer_detection" => Arc::new(JammerDetection {
                guard: name.to_string(),
                offline_minutes: script.take(name, "offline_minutes", self.jammer.offline_minutes)?,
                min_avg_speed_kmh: script.take(name, "min_avg_speed", self.jammer.min_avg_speed_kmh)?,
                max_avg_gsm: script.take(name, "max_avg_gsm", self.jammer.max_avg_gsm)?,
                safe_groups: script.take_list("safe_groups", &self.jammer.safe_groups),
            }),
            other => {
                return Err(FreError::RuleCompile {
                    rule: name.to_string(),
                    details: format!(
                        "unknown native program {other}; available: {}",
                        NATIVE_PROGRAMS.join(", ")
                    ),
                });
            }
        };
        script.finish(name)?;
        Ok(program)
    }
}

// ──────────────────── programs ────────────────────

/// Feeds the packet into buffer and timing state.
struct BufferUpdate;

impl RuleProgram for BufferUpdate {
    fn execute(&self, ctx: &mut EvaluationContext) -> Result<()> {
        let outcome = ctx.update_buffer_from_packet();
        let full = ctx.state().has_full_buffer();
        let flags = ctx.flags_mut();
        flags.buffer_updated = outcome.is_accepted();
        flags.buffer_has_10 = full;
        if outcome.is_accepted() {
            ctx.set_stage("buffer_updated", None);
        } else {
            ctx.set_stage("buffer_update", Some("stale_sample"));
        }
        Ok(())
    }
}

/// Flags packets without a valid fix.
struct InvalidPosition;

impl RuleProgram for InvalidPosition {
    fn execute(&self, ctx: &mut EvaluationContext) -> Result<()> {
        let invalid = !is_valid_status(&ctx.packet().positioning_status);
        ctx.flags_mut().position_invalid_detected = invalid;
        if invalid {
            ctx.set_stage("position_invalid", None);
        } else {
            ctx.set_stage("position_check", Some("position_valid"));
        }
        Ok(())
    }
}

/// Wins the guard, then notifies. Returns whether the alert went out.
fn fire_once(ctx: &EvaluationContext, guard: &str, message: &str) -> bool {
    let state = ctx.state();
    if state.is_alert_sent_for_rule(guard) {
        ctx.set_stage("alert_guard", Some("alert_already_sent"));
        return false;
    }
    if !state.mark_alert_sent_for_rule(guard) {
        ctx.set_stage("alert_guard", Some("alert_race_lost"));
        return false;
    }
    ctx.actions().send_telegram(message);
    ctx.actions().log(message);
    ctx.set_stage("alert_sent", None);
    true
}

/// Alerts once when the device has had no valid fix for `minutes`.
struct OfflineAlert {
    guard: String,
    minutes: i64,
}

impl RuleProgram for OfflineAlert {
    fn execute(&self, ctx: &mut EvaluationContext) -> Result<()> {
        let offline = ctx.state().is_offline_for(self.minutes);
        if self.minutes <= 5 {
            ctx.flags_mut().is_offline_for_5min = offline;
        }
        if !offline {
            ctx.set_stage("offline_check", Some("not_offline"));
            return Ok(());
        }
        let packet = ctx.packet();
        let message = format!(
            "Device {} without valid position for at least {} min (last report {:.6},{:.6})",
            packet.imei, self.minutes, packet.latitude, packet.longitude
        );
        fire_once(ctx, &self.guard, &message);
        Ok(())
    }
}

/// Offline while moving with a weak signal outside every safe zone.
struct JammerDetection {
    guard: String,
    offline_minutes: i64,
    min_avg_speed_kmh: i64,
    max_avg_gsm: i64,
    safe_groups: Vec<String>,
}

impl RuleProgram for JammerDetection {
    fn execute(&self, ctx: &mut EvaluationContext) -> Result<()> {
        let full = ctx.state().has_full_buffer();
        ctx.flags_mut().buffer_has_10 = full;
        if !full {
            ctx.set_stage("buffer_check", Some("buffer_not_full"));
            return Ok(());
        }

        let offline = ctx.state().is_offline_for(self.offline_minutes);
        ctx.flags_mut().is_offline_for_5min = offline;
        if !offline {
            ctx.set_stage("offline_check", Some("not_offline"));
            return Ok(());
        }

        let avg_speed = ctx.state().average_speed_90min();
        let avg_gsm = ctx.state().average_gsm_last5();
        let weak = avg_speed >= self.min_avg_speed_kmh && avg_gsm <= self.max_avg_gsm;
        let flags = ctx.flags_mut();
        flags.metrics_ready = true;
        flags.moving_with_weak_signal = weak;
        if !weak {
            ctx.set_stage("metrics_check", Some("signal_pattern_not_matched"));
            return Ok(());
        }

        let (lat, lon) = (ctx.packet().latitude, ctx.packet().longitude);
        let outside = ctx.state().is_outside_all(&self.safe_groups, lat, lon);
        ctx.flags_mut().outside_all_safe_zones = outside;
        if !outside {
            ctx.set_stage("geofence_check", Some("inside_safe_zone"));
            return Ok(());
        }

        let message = format!(
            "Possible jammer on device {}: no valid fix for {} min, avg speed {} km/h, avg GSM {}, last position {:.6},{:.6}",
            ctx.imei(),
            self.offline_minutes,
            avg_speed,
            avg_gsm,
            lat,
            lon
        );
        fire_once(ctx, &self.guard, &message);
        Ok(())
    }
}
