//! In-process store implementing every persistence contract.
//!
//! Used by tests and by `fre ingest --ephemeral`; nothing survives the process.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::core::errors::Result;
use crate::store::{
    AlertGuardStore, GeofenceShape, GeofenceStore, RuleDefinition, RuleSource, StateStore,
};

#[derive(Debug, Clone)]
enum StateValue {
    Text(String),
    Int(i64),
    Time(DateTime<Utc>),
}

/// Mutex-guarded maps standing in for the relational store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<HashMap<(String, String), StateValue>>,
    groups: Mutex<HashMap<String, Vec<GeofenceShape>>>,
    guards: Mutex<HashSet<(String, String)>>,
    rules: Mutex<Vec<RuleDefinition>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a shape to a group, assigning an id when the shape has none.
    pub fn add_geofence(&self, group: &str, mut shape: GeofenceShape) {
        let mut groups = self.groups.lock();
        if shape.id == 0 {
            let next = groups.values().map(Vec::len).sum::<usize>() + 1;
            shape.id = i64::try_from(next).unwrap_or(i64::MAX);
        }
        groups.entry(group.to_string()).or_default().push(shape);
    }

    /// Insert or replace a rule by name.
    pub fn upsert_rule(&self, mut rule: RuleDefinition) {
        let mut rules = self.rules.lock();
        if let Some(existing) = rules.iter_mut().find(|r| r.name == rule.name) {
            rule.id = existing.id;
            *existing = rule;
            return;
        }
        rule.id = i64::try_from(rules.len() + 1).unwrap_or(i64::MAX);
        rules.push(rule);
    }

    fn put(&self, imei: &str, key: &str, value: StateValue) {
        self.state
            .lock()
            .insert((imei.to_string(), key.to_string()), value);
    }

    fn get(&self, imei: &str, key: &str) -> Option<StateValue> {
        self.state
            .lock()
            .get(&(imei.to_string(), key.to_string()))
            .cloned()
    }
}

impl StateStore for MemoryStore {
    fn get_string(&self, imei: &str, key: &str) -> Result<Option<String>> {
        Ok(match self.get(imei, key) {
            Some(StateValue::Text(value)) => Some(value),
            _ => None,
        })
    }

    fn set_string(&self, imei: &str, key: &str, value: &str) -> Result<()> {
        self.put(imei, key, StateValue::Text(value.to_string()));
        Ok(())
    }

    fn get_i64(&self, imei: &str, key: &str) -> Result<Option<i64>> {
        Ok(match self.get(imei, key) {
            Some(StateValue::Int(value)) => Some(value),
            _ => None,
        })
    }

    fn set_i64(&self, imei: &str, key: &str, value: i64) -> Result<()> {
        self.put(imei, key, StateValue::Int(value));
        Ok(())
    }

    fn get_time(&self, imei: &str, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(match self.get(imei, key) {
            Some(StateValue::Time(value)) => Some(value),
            _ => None,
        })
    }

    fn set_time(&self, imei: &str, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.put(imei, key, StateValue::Time(value));
        Ok(())
    }
}

impl GeofenceStore for MemoryStore {
    fn geofences_by_group(&self, group: &str) -> Result<Vec<GeofenceShape>> {
        Ok(self.groups.lock().get(group).cloned().unwrap_or_default())
    }
}

impl AlertGuardStore for MemoryStore {
    fn is_alert_sent(&self, imei: &str, rule: &str) -> Result<bool> {
        Ok(self
            .guards
            .lock()
            .contains(&(imei.to_string(), rule.to_string())))
    }

    fn try_mark_alert_sent(&self, imei: &str, rule: &str) -> Result<bool> {
        Ok(self
            .guards
            .lock()
            .insert((imei.to_string(), rule.to_string())))
    }
}

impl RuleSource for MemoryStore {
    fn load_active_rules(&self) -> Result<Vec<RuleDefinition>> {
        let mut active: Vec<RuleDefinition> =
            self.rules.lock().iter().filter(|r| r.active).cloned().collect();
        active.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(active)
    }

    fn list_rules(&self) -> Result<Vec<RuleDefinition>> {
        Ok(self.rules.lock().clone())
    }
}
