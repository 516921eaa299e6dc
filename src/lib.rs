#![forbid(unsafe_code)]

//! Fleet Rule Engine (fre): per-device rule execution for GPS telemetry.
//!
//! Incoming tracker payloads are decoded into packets, each packet gets an
//! [`engine::EvaluationContext`], and every active rule runs against it in a
//! fixed order. Rules read per-device state through capabilities:
//! 1. **Buffers**: the last ten accepted samples per device
//! 2. **Metrics, timing, geofence**: derived readings over that state
//! 3. **Alerts**: an at-most-once guard per (device, rule)
//!
//! Rule executions can be audited as pre/post snapshots and queried over HTTP.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use fleet_rule_engine::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use fleet_rule_engine::core::config::Config;
//! use fleet_rule_engine::engine::{Engine, JsonTrackerAdapter};
//! ```

pub mod prelude;

#[cfg(feature = "http")]
pub mod api;
pub mod audit;
pub mod capabilities;
pub mod core;
pub mod engine;
pub mod notify;
pub mod store;
