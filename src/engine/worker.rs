//! Payload processing: parse, build a context per packet, run every rule.
//!
//! The rule set is taken once per payload, so a reload that lands mid-payload
//! takes effect on the next one. Listener hooks bracket each rule; audit is
//! one such listener.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::RuleMeta;
use crate::core::errors::{FreError, Result};
use crate::engine::context::{ContextBuilder, EvaluationContext, ExecutionTrace};
use crate::engine::packet::TrackerAdapter;
use crate::engine::rules::RuleSetHandle;
use crate::store::RuleDefinition;

/// Rule about to run, or that just ran.
pub struct RuleInvocation<'a> {
    pub rule: &'a RuleDefinition,
    pub meta: Option<&'a RuleMeta>,
    /// 1-based position within the packet's pass.
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Completed,
    Failed(String),
}

/// Hooks called around each rule execution.
pub trait ExecutionListener: Send + Sync {
    fn before_rule(&self, _invocation: &RuleInvocation<'_>, _ctx: &EvaluationContext) {}

    fn after_rule(
        &self,
        invocation: &RuleInvocation<'_>,
        ctx: &EvaluationContext,
        trace: &ExecutionTrace,
        outcome: &RuleOutcome,
    );
}

/// Counters for one processed payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessReport {
    pub packets: usize,
    pub rules_run: usize,
    pub rule_errors: usize,
    /// Packets whose pass hit the per-packet deadline.
    pub aborted_packets: usize,
    pub alerts_won: usize,
}

impl ProcessReport {
    pub fn merge(&mut self, other: &Self) {
        self.packets += other.packets;
        self.rules_run += other.rules_run;
        self.rule_errors += other.rule_errors;
        self.aborted_packets += other.aborted_packets;
        self.alerts_won += other.alerts_won;
    }
}

pub struct Worker {
    builder: ContextBuilder,
    adapter: Arc<dyn TrackerAdapter>,
    rules: Arc<RuleSetHandle>,
    listeners: Vec<Arc<dyn ExecutionListener>>,
    packet_timeout: Option<Duration>,
}

impl Worker {
    pub fn new(
        builder: ContextBuilder,
        adapter: Arc<dyn TrackerAdapter>,
        rules: Arc<RuleSetHandle>,
    ) -> Self {
        Self {
            builder,
            adapter,
            rules,
            listeners: Vec::new(),
            packet_timeout: None,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Upper bound per packet. `Duration::ZERO` disables the bound.
    #[must_use]
    pub fn with_packet_timeout(mut self, timeout: Duration) -> Self {
        self.packet_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Process one payload. Only a payload that cannot be parsed at all is an
    /// error; rule failures are logged and counted.
    pub fn process(&self, payload: &str) -> Result<ProcessReport> {
        let packets = self.adapter.parse(payload).inspect_err(|error| {
            tracing::warn!(adapter = self.adapter.name(), %error, "payload dropped");
        })?;
        let rule_set = self.rules.load();
        let mut report = ProcessReport::default();

        for packet in packets {
            report.packets += 1;
            let imei = packet.imei.clone();
            let mut ctx = self.builder.build(packet);
            ctx.set_deadline(self.packet_timeout.map(|t| Instant::now() + t));
            tracing::debug!(imei = %imei, rules = rule_set.len(), "running rules");

            for (index, loaded) in rule_set.rules().iter().enumerate() {
                if ctx.is_expired() {
                    let remaining = rule_set.len() - index;
                    tracing::warn!(imei = %imei, remaining, "packet deadline exceeded, remaining rules aborted");
                    report.aborted_packets += 1;
                    break;
                }

                let invocation = RuleInvocation {
                    rule: &loaded.definition,
                    meta: rule_set.manifest().rule_meta(&loaded.definition.name),
                    position: index + 1,
                };
                ctx.begin_rule(&loaded.definition.name);
                for listener in &self.listeners {
                    listener.before_rule(&invocation, &ctx);
                }

                let outcome = match loaded.program.execute(&mut ctx) {
                    Ok(()) => RuleOutcome::Completed,
                    Err(error) => {
                        let error = match error {
                            FreError::RuleExecution { .. } => error,
                            other => FreError::rule(&loaded.definition.name, other.to_string()),
                        };
                        tracing::error!(imei = %imei, rule = %loaded.definition.name, %error, "rule failed");
                        report.rule_errors += 1;
                        RuleOutcome::Failed(error.to_string())
                    }
                };
                report.rules_run += 1;

                let trace = ctx.finish_rule();
                report.alerts_won += trace.alerts_won.len();
                for listener in &self.listeners {
                    listener.after_rule(&invocation, &ctx, &trace, &outcome);
                }
            }
        }
        Ok(report)
    }

    pub fn rules(&self) -> &Arc<RuleSetHandle> {
        &self.rules
    }
}
