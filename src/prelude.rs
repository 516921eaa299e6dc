//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use fleet_rule_engine::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{FreError, Result};

// Capabilities
pub use crate::capabilities::{
    AddOutcome, BufferEntry, BufferManager, CapabilityRegistry, GeofenceCapability,
    MetricsCapability, TimingCapability,
};

// Engine
pub use crate::engine::{
    Engine, EvaluationContext, IncomingPacket, JsonTrackerAdapter, NativeRuleCompiler,
    ProcessReport, RuleCompiler, RuleProgram, RuleSet, TrackerAdapter, Worker, WorkerPool,
};

// Audit
pub use crate::audit::{AuditEntry, AuditManifest, AuditRecorder, AuditSink, MemoryAuditSink};
#[cfg(feature = "sqlite")]
pub use crate::audit::SqliteAuditStore;

// Stores
pub use crate::store::{MemoryStore, RuleDefinition};
#[cfg(feature = "sqlite")]
pub use crate::store::SqliteStore;
