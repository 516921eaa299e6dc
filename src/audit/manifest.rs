//! Per-rule audit configuration declared in YAML next to each rule.
//!
//! ```yaml
//! stages:
//!   - rule: jammer_detection
//!     order: 3
//!     audit:
//!       description: jammer pattern evaluated
//!       level: critical
//!       is_alert: true
//!       snapshot: [packet, jammer_metrics]
//! ```

#![allow(missing_docs)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::errors::{FreError, Result};
use crate::store::RuleDefinition;

/// Audit settings for one rule name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMeta {
    /// `false` skips auditing this rule.
    pub enabled: bool,
    pub description: String,
    pub level: String,
    pub is_alert: bool,
    pub order: i64,
    /// Snapshot sections to keep. Empty keeps everything.
    pub snapshot: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    #[serde(default)]
    stages: Vec<StageDoc>,
}

#[derive(Debug, Deserialize)]
struct StageDoc {
    rule: String,
    #[serde(default)]
    order: i64,
    #[serde(default)]
    audit: AuditDoc,
}

#[derive(Debug, Default, Deserialize)]
struct AuditDoc {
    enabled: Option<bool>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    is_alert: bool,
    #[serde(default)]
    snapshot: Vec<String>,
}

/// Rule name to [`RuleMeta`], merged from every rule's fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditManifest {
    rules: HashMap<String, RuleMeta>,
}

impl AuditManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one YAML fragment. `source` names the owning rule in errors.
    /// Later stages for the same rule name replace earlier ones.
    pub fn parse_yaml(&mut self, source: &str, yaml: &str) -> Result<usize> {
        let doc: ManifestDoc = serde_yaml::from_str(yaml).map_err(|e| FreError::ManifestParse {
            rule: source.to_string(),
            details: e.to_string(),
        })?;
        let count = doc.stages.len();
        for stage in doc.stages {
            let level = if stage.audit.level.trim().is_empty() {
                "info".to_string()
            } else {
                stage.audit.level
            };
            self.rules.insert(
                stage.rule,
                RuleMeta {
                    enabled: stage.audit.enabled.unwrap_or(true),
                    description: stage.audit.description,
                    level,
                    is_alert: stage.audit.is_alert,
                    order: stage.order,
                    snapshot: stage.audit.snapshot,
                },
            );
        }
        Ok(count)
    }

    /// Build from rule records. Missing or invalid fragments are skipped
    /// with a log line; they never fail a load.
    pub fn from_rules(rules: &[RuleDefinition]) -> Self {
        let mut manifest = Self::new();
        for rule in rules {
            let Some(yaml) = rule.audit_manifest.as_deref().filter(|y| !y.trim().is_empty())
            else {
                tracing::debug!(rule = %rule.name, "rule has no audit manifest");
                continue;
            };
            match manifest.parse_yaml(&rule.name, yaml) {
                Ok(stages) => tracing::debug!(rule = %rule.name, stages, "audit manifest loaded"),
                Err(error) => {
                    tracing::warn!(rule = %rule.name, %error, "invalid audit manifest skipped");
                }
            }
        }
        manifest
    }

    pub fn rule_meta(&self, rule: &str) -> Option<&RuleMeta> {
        self.rules.get(rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
