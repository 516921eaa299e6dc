//! Compiled rule sets and their hot-swappable handle.

#![allow(missing_docs)]

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::audit::AuditManifest;
use crate::core::errors::Result;
use crate::engine::context::EvaluationContext;
use crate::store::RuleDefinition;

/// One executable rule.
pub trait RuleProgram: Send + Sync {
    fn execute(&self, ctx: &mut EvaluationContext) -> Result<()>;
}

/// Turns a stored script body into a program.
pub trait RuleCompiler: Send + Sync {
    fn compile(&self, rule: &RuleDefinition) -> Result<Arc<dyn RuleProgram>>;
}

pub struct LoadedRule {
    pub definition: RuleDefinition,
    pub program: Arc<dyn RuleProgram>,
}

/// Immutable set of compiled rules plus the manifest built from them.
pub struct RuleSet {
    rules: Vec<LoadedRule>,
    manifest: AuditManifest,
    digest: String,
    loaded_at: DateTime<Utc>,
    skipped: Vec<String>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            manifest: AuditManifest::new(),
            digest: digest_of(&[]),
            loaded_at: Utc::now(),
            skipped: Vec::new(),
        }
    }

    /// Compile every definition. Rules that fail to compile are skipped with
    /// a warning and listed in [`Self::skipped`].
    pub fn build(definitions: Vec<RuleDefinition>, compiler: &dyn RuleCompiler) -> Self {
        let manifest = AuditManifest::from_rules(&definitions);
        let digest = digest_of(&definitions);
        let mut rules = Vec::with_capacity(definitions.len());
        let mut skipped = Vec::new();
        for definition in definitions {
            match compiler.compile(&definition) {
                Ok(program) => rules.push(LoadedRule {
                    definition,
                    program,
                }),
                Err(error) => {
                    tracing::warn!(rule = %definition.name, %error, "rule skipped");
                    skipped.push(definition.name);
                }
            }
        }
        rules.sort_by(|a, b| execution_order(&manifest, &a.definition, &b.definition));
        Self {
            rules,
            manifest,
            digest,
            loaded_at: Utc::now(),
            skipped,
        }
    }

    pub fn rules(&self) -> &[LoadedRule] {
        &self.rules
    }

    pub fn manifest(&self) -> &AuditManifest {
        &self.manifest
    }

    /// SHA-256 over every source (name, script, manifest) in load order.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Priority descending, then manifest order, then name.
fn execution_order(manifest: &AuditManifest, a: &RuleDefinition, b: &RuleDefinition) -> Ordering {
    let order = |rule: &RuleDefinition| {
        manifest
            .rule_meta(&rule.name)
            .map_or(i64::MAX, |meta| meta.order)
    };
    b.priority
        .cmp(&a.priority)
        .then_with(|| order(a).cmp(&order(b)))
        .then_with(|| a.name.cmp(&b.name))
}

fn digest_of(definitions: &[RuleDefinition]) -> String {
    let mut hasher = Sha256::new();
    for rule in definitions {
        hasher.update(rule.name.as_bytes());
        hasher.update([0]);
        hasher.update(rule.script.as_bytes());
        hasher.update([0]);
        hasher.update(rule.audit_manifest.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0]);
        hasher.update(rule.priority.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Publishes the current [`RuleSet`]. Readers take an `Arc` once per payload
/// and keep it for the whole pass; a reload never mutates a published set.
pub struct RuleSetHandle {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleSetHandle {
    pub fn new(set: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    pub fn load(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read())
    }

    /// Replace the published set; returns the previous one.
    pub fn swap(&self, set: RuleSet) -> Arc<RuleSet> {
        std::mem::replace(&mut *self.current.write(), Arc::new(set))
    }
}

impl Default for RuleSetHandle {
    fn default() -> Self {
        Self::new(RuleSet::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::FreError;

    struct Noop;

    impl RuleProgram for Noop {
        fn execute(&self, _ctx: &mut EvaluationContext) -> Result<()> {
            Ok(())
        }
    }

    struct AcceptAllBut(&'static str);

    impl RuleCompiler for AcceptAllBut {
        fn compile(&self, rule: &RuleDefinition) -> Result<Arc<dyn RuleProgram>> {
            if rule.script == self.0 {
                Err(FreError::RuleCompile {
                    rule: rule.name.clone(),
                    details: "unsupported".to_string(),
                })
            } else {
                Ok(Arc::new(Noop))
            }
        }
    }

    fn names(set: &RuleSet) -> Vec<&str> {
        set.rules().iter().map(|r| r.definition.name.as_str()).collect()
    }

    #[test]
    fn orders_by_priority_then_manifest_then_name() {
        let manifest = "stages:\n  - rule: beta\n    order: 1\n  - rule: gamma\n    order: 2\n";
        let defs = vec![
            RuleDefinition::new("gamma", "x").with_manifest(manifest),
            RuleDefinition::new("alpha", "x"),
            RuleDefinition::new("beta", "x"),
            RuleDefinition::new("urgent", "x").with_priority(500),
            RuleDefinition::new("zeta", "x"),
        ];
        let set = RuleSet::build(defs, &AcceptAllBut("never"));
        assert_eq!(names(&set), vec!["urgent", "beta", "gamma", "alpha", "zeta"]);
    }

    #[test]
    fn compile_failures_are_skipped() {
        let defs = vec![
            RuleDefinition::new("ok", "good"),
            RuleDefinition::new("broken", "bad"),
        ];
        let set = RuleSet::build(defs, &AcceptAllBut("bad"));
        assert_eq!(names(&set), vec!["ok"]);
        assert_eq!(set.skipped(), ["broken".to_string()]);
    }

    #[test]
    fn digest_tracks_sources() {
        let a = RuleSet::build(vec![RuleDefinition::new("r", "s1")], &AcceptAllBut(""));
        let b = RuleSet::build(vec![RuleDefinition::new("r", "s1")], &AcceptAllBut(""));
        let c = RuleSet::build(vec![RuleDefinition::new("r", "s2")], &AcceptAllBut(""));
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn swap_keeps_old_readers_valid() {
        let handle = RuleSetHandle::default();
        let before = handle.load();
        assert!(before.is_empty());

        let next = RuleSet::build(vec![RuleDefinition::new("r", "s")], &AcceptAllBut(""));
        let previous = handle.swap(next);
        assert!(Arc::ptr_eq(&before, &previous));
        assert!(before.is_empty());
        assert_eq!(handle.load().len(), 1);
    }
}
