//! Engine assembly: one [`Engine`] owns the capability registry, the published
//! rule set, the audit recorder and the worker that ties them together.
//!
//! Nothing here is global. Front ends (CLI, HTTP, worker pool) hold an
//! `Arc<Engine>` and call into it.

#![allow(missing_docs)]

pub mod builtin;
pub mod context;
pub mod maintenance;
pub mod packet;
pub mod pool;
pub mod rules;
pub mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::audit::{AuditListener, AuditRecorder, AuditSink};
use crate::capabilities::{
    AlertsCapability, BufferManager, CapabilityRegistry, GeofenceCapability, MetricsCapability,
    TimingCapability,
};
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::notify::{NotificationEvent, NotificationManager};
use crate::store::{AlertGuardStore, GeofenceStore, RuleDefinition, RuleSource, StateStore};

pub use builtin::NativeRuleCompiler;
pub use context::{ContextBuilder, EvaluationContext, ExecutionTrace};
pub use maintenance::{Maintenance, MaintenanceHandle, SweepReport};
pub use packet::{IncomingPacket, JsonTrackerAdapter, PacketFlags, TrackerAdapter};
pub use pool::{PoolStats, WorkerPool};
pub use rules::{LoadedRule, RuleCompiler, RuleProgram, RuleSet, RuleSetHandle};
pub use worker::{ExecutionListener, ProcessReport, RuleInvocation, RuleOutcome, Worker};

/// A backing store able to serve every persistence contract the engine needs.
pub trait EngineStore: StateStore + GeofenceStore + AlertGuardStore + RuleSource {}

impl<T> EngineStore for T where T: StateStore + GeofenceStore + AlertGuardStore + RuleSource {}

/// Result of a rule reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub rules_loaded: usize,
    pub skipped: Vec<String>,
    pub digest: String,
    pub changed: bool,
}

pub struct Engine {
    config: Config,
    registry: Arc<CapabilityRegistry>,
    rules: Arc<RuleSetHandle>,
    rule_source: Arc<dyn RuleSource>,
    compiler: Arc<dyn RuleCompiler>,
    recorder: Arc<AuditRecorder>,
    worker: Arc<Worker>,
    notifier: Arc<NotificationManager>,
    started_at: Instant,
}

impl Engine {
    /// Wire an engine over `store` and `audit`, then load the active rules.
    pub fn with_stores<S>(config: Config, store: Arc<S>, audit: Arc<dyn AuditSink>) -> Result<Self>
    where
        S: EngineStore + 'static,
    {
        let compiler = Arc::new(NativeRuleCompiler::new(config.jammer.clone()));
        Self::with_compiler(config, store, audit, compiler)
    }

    /// Like [`Self::with_stores`] with a caller-supplied rule compiler.
    pub fn with_compiler<S>(
        config: Config,
        store: Arc<S>,
        audit: Arc<dyn AuditSink>,
        compiler: Arc<dyn RuleCompiler>,
    ) -> Result<Self>
    where
        S: EngineStore + 'static,
    {
        config.validate()?;
        let notifier = Arc::new(NotificationManager::from_config(&config.notifications));
        let registry = Arc::new(build_registry(&config, &store, &notifier)?);

        let recorder = Arc::new(AuditRecorder::new(audit, config.audit.progress_enabled));
        let rules = Arc::new(RuleSetHandle::default());
        let worker = Worker::new(
            ContextBuilder::new(Arc::clone(&registry)),
            Arc::new(JsonTrackerAdapter),
            Arc::clone(&rules),
        )
        .with_listener(Arc::new(AuditListener::new(Arc::clone(&recorder))))
        .with_packet_timeout(Duration::from_millis(config.engine.packet_timeout_ms));

        let engine = Self {
            config,
            registry,
            rules,
            rule_source: store,
            compiler,
            recorder,
            worker: Arc::new(worker),
            notifier,
            started_at: Instant::now(),
        };
        let summary = engine.load_rules()?;
        tracing::info!(
            rules = summary.rules_loaded,
            skipped = summary.skipped.len(),
            capabilities = ?engine.registry.names(),
            "engine assembled"
        );
        Ok(engine)
    }

    /// Open the SQLite database named by `config.paths.sqlite_db` and wire an
    /// engine over it. The audit store is returned for read-side queries.
    #[cfg(feature = "sqlite")]
    pub fn open(config: Config) -> Result<(Self, Arc<crate::audit::SqliteAuditStore>)> {
        let path = config.paths.sqlite_db.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| crate::core::errors::FreError::io(parent, e))?;
        }
        let store = Arc::new(crate::store::SqliteStore::open(&path)?);
        let audit = Arc::new(crate::audit::SqliteAuditStore::open(&path)?);
        let engine = Self::with_stores(config, store, audit.clone())?;
        Ok((engine, audit))
    }

    /// Recompile the active rules and publish them. In-flight payloads keep
    /// the set they started with.
    pub fn reload_rules(&self) -> Result<ReloadSummary> {
        let summary = self.load_rules()?;
        self.notifier.notify(&NotificationEvent::RulesReloaded {
            rules_loaded: summary.rules_loaded,
            digest: summary.digest.clone(),
        });
        Ok(summary)
    }

    fn load_rules(&self) -> Result<ReloadSummary> {
        let definitions = self.rule_source.load_active_rules()?;
        let set = RuleSet::build(definitions, self.compiler.as_ref());
        let summary = ReloadSummary {
            rules_loaded: set.len(),
            skipped: set.skipped().to_vec(),
            digest: set.digest().to_string(),
            changed: false,
        };
        let previous = self.rules.swap(set);
        let summary = ReloadSummary {
            changed: previous.digest() != summary.digest,
            ..summary
        };
        tracing::info!(
            rules = summary.rules_loaded,
            digest = %summary.digest,
            changed = summary.changed,
            "rule set published"
        );
        Ok(summary)
    }

    /// Process one payload on the calling thread.
    pub fn process(&self, payload: &str) -> Result<ProcessReport> {
        self.worker.process(payload)
    }

    /// Start the worker pool sized from `[engine]`.
    pub fn start_pool(&self) -> Result<WorkerPool> {
        WorkerPool::spawn(
            Arc::clone(&self.worker),
            self.config.engine.workers,
            self.config.engine.queue_capacity,
        )
    }

    /// Housekeeping over this engine's buffers, geofence cache and audit sink.
    pub fn maintenance(&self) -> Maintenance {
        Maintenance::new(
            Arc::clone(self.registry.buffers()),
            Arc::clone(self.registry.geofence()),
        )
        .with_audit_retention(Arc::clone(self.recorder.sink()), self.config.audit.retention_days)
    }

    /// Every stored rule, active or not.
    pub fn list_rules(&self) -> Result<Vec<RuleDefinition>> {
        self.rule_source.list_rules()
    }

    pub fn rule_set(&self) -> Arc<RuleSet> {
        self.rules.load()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<AuditRecorder> {
        &self.recorder
    }

    pub fn notifier(&self) -> &Arc<NotificationManager> {
        &self.notifier
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

fn build_registry<S>(
    config: &Config,
    store: &Arc<S>,
    notifier: &Arc<NotificationManager>,
) -> Result<CapabilityRegistry>
where
    S: EngineStore + 'static,
{
    let buffers = Arc::new(BufferManager::new(Duration::from_secs(
        config.engine.buffer_retention_hours.saturating_mul(3600),
    )));
    let metrics = Arc::new(MetricsCapability::new(Arc::clone(&buffers)));
    let geofence = Arc::new(GeofenceCapability::new(
        store.clone(),
        Duration::from_secs(config.geofence.cache_ttl_secs),
        config.geofence.snapshot_groups.clone(),
    ));
    let timing = Arc::new(TimingCapability::new(Some(store.clone())));
    let alerts = Arc::new(AlertsCapability::new(store.clone(), Arc::clone(notifier)));
    CapabilityRegistry::new(buffers, metrics, geofence, timing, alerts)
}
