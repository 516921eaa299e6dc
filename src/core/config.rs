//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{FreError, Result};
use crate::notify::NotificationConfig;

/// Full engine configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub geofence: GeofenceConfig,
    pub audit: AuditConfig,
    pub api: ApiConfig,
    pub jammer: JammerConfig,
    pub paths: PathsConfig,
    pub notifications: NotificationConfig,
}

/// Worker pool, per-packet bound and buffer retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads consuming payloads.
    pub workers: usize,
    /// Bounded queue capacity in front of the workers.
    pub queue_capacity: usize,
    /// Upper bound on rule execution for a single packet.
    pub packet_timeout_ms: u64,
    /// Device buffers untouched for longer than this are evicted.
    pub buffer_retention_hours: u64,
    /// How often the maintenance thread runs its sweeps.
    pub sweep_interval_secs: u64,
}

/// Geofence lookups and the groups reported in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeofenceConfig {
    /// Staleness bound for cached group shapes.
    pub cache_ttl_secs: u64,
    /// Groups evaluated against the last known position when building snapshots.
    pub snapshot_groups: Vec<String>,
}

/// Audit capture defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Initial state of the progress-audit toggle.
    pub progress_enabled: bool,
    /// Progress rows older than this are pruned by the maintenance sweep. 0 keeps everything.
    pub retention_days: u64,
}

/// HTTP audit API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    /// Route prefix, e.g. `/grule/api`.
    pub base_path: String,
}

/// Thresholds for the built-in jammer rule pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JammerConfig {
    pub offline_minutes: i64,
    pub min_avg_speed_kmh: i64,
    pub max_avg_gsm: i64,
    pub safe_groups: Vec<String>,
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub sqlite_db: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1_024,
            packet_timeout_ms: 2_000,
            buffer_retention_hours: 24,
            sweep_interval_secs: 300,
        }
    }
}

/// Group names evaluated by default, matching the fleet's safe-zone groups.
pub const DEFAULT_SAFE_GROUPS: [&str; 3] = ["Taller", "CLIENTES", "Resguardo/Cedis/Puerto"];

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            snapshot_groups: DEFAULT_SAFE_GROUPS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            progress_enabled: false,
            retention_days: 30,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8081".to_string(),
            base_path: "/grule/api".to_string(),
        }
    }
}

impl Default for JammerConfig {
    fn default() -> Self {
        Self {
            offline_minutes: 5,
            min_avg_speed_kmh: 10,
            max_avg_gsm: 9,
            safe_groups: DEFAULT_SAFE_GROUPS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                tracing::warn!("HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        Self {
            config_file: home_dir.join(".config").join("fre").join("config.toml"),
            sqlite_db: home_dir
                .join(".local")
                .join("share")
                .join("fre")
                .join("fre.sqlite3"),
        }
    }
}

impl Config {
    /// Default config file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| FreError::Io {
                path: path_buf.clone(),
                source,
            })?;
            toml::from_str::<Self>(&raw)?
        } else if is_explicit_path {
            return Err(FreError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides()?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(env_var)
    }

    /// Apply `FRE_*` overrides using `lookup` as the variable source.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|raw| !raw.trim().is_empty());

        // engine
        set_parsed(&get, "FRE_ENGINE_WORKERS", &mut self.engine.workers)?;
        set_parsed(
            &get,
            "FRE_ENGINE_QUEUE_CAPACITY",
            &mut self.engine.queue_capacity,
        )?;
        set_parsed(
            &get,
            "FRE_ENGINE_PACKET_TIMEOUT_MS",
            &mut self.engine.packet_timeout_ms,
        )?;
        set_parsed(
            &get,
            "FRE_ENGINE_BUFFER_RETENTION_HOURS",
            &mut self.engine.buffer_retention_hours,
        )?;
        set_parsed(
            &get,
            "FRE_ENGINE_SWEEP_INTERVAL_SECS",
            &mut self.engine.sweep_interval_secs,
        )?;

        // geofence
        set_parsed(
            &get,
            "FRE_GEOFENCE_CACHE_TTL_SECS",
            &mut self.geofence.cache_ttl_secs,
        )?;

        // audit
        set_parsed(
            &get,
            "FRE_AUDIT_PROGRESS_ENABLED",
            &mut self.audit.progress_enabled,
        )?;
        set_parsed(
            &get,
            "FRE_AUDIT_RETENTION_DAYS",
            &mut self.audit.retention_days,
        )?;

        // api
        set_parsed(&get, "FRE_API_ENABLED", &mut self.api.enabled)?;
        if let Some(bind) = get("FRE_API_BIND") {
            self.api.bind = bind;
        }
        if let Some(base) = get("FRE_API_BASE_PATH") {
            self.api.base_path = base;
        }

        // paths
        if let Some(db) = get("FRE_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(db);
        }

        // telegram credentials are usually injected through the environment
        if let Some(token) = get("FRE_TELEGRAM_BOT_TOKEN") {
            self.notifications.telegram.bot_token = token;
        }
        if let Some(chats) = get("FRE_TELEGRAM_CHAT_IDS") {
            self.notifications.telegram.chat_ids = chats
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        Ok(())
    }

    /// Canonicalize the API base path: leading slash, no trailing slash.
    pub fn normalize(&mut self) {
        let trimmed = self.api.base_path.trim().trim_end_matches('/');
        self.api.base_path = if trimmed.is_empty() {
            String::new()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
    }

    /// Validate internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.engine.workers == 0 {
            return Err(FreError::InvalidConfig {
                details: "engine.workers must be >= 1".to_string(),
            });
        }
        if self.engine.queue_capacity == 0 {
            return Err(FreError::InvalidConfig {
                details: "engine.queue_capacity must be >= 1".to_string(),
            });
        }
        if self.engine.packet_timeout_ms == 0 {
            return Err(FreError::InvalidConfig {
                details: "engine.packet_timeout_ms must be > 0".to_string(),
            });
        }
        if self.engine.buffer_retention_hours == 0 {
            return Err(FreError::InvalidConfig {
                details: "engine.buffer_retention_hours must be > 0".to_string(),
            });
        }
        if self.engine.sweep_interval_secs == 0 {
            return Err(FreError::InvalidConfig {
                details: "engine.sweep_interval_secs must be > 0".to_string(),
            });
        }
        if self.jammer.offline_minutes <= 0 {
            return Err(FreError::InvalidConfig {
                details: format!(
                    "jammer.offline_minutes must be > 0, got {}",
                    self.jammer.offline_minutes
                ),
            });
        }
        if self.jammer.min_avg_speed_kmh < 0 || self.jammer.max_avg_gsm < 0 {
            return Err(FreError::InvalidConfig {
                details: "jammer thresholds must be non-negative".to_string(),
            });
        }
        if self.api.enabled && self.api.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(FreError::InvalidConfig {
                details: format!("api.bind is not a socket address: {:?}", self.api.bind),
            });
        }
        if self.notifications.telegram.enabled
            && (self.notifications.telegram.bot_token.is_empty()
                || self.notifications.telegram.chat_ids.is_empty())
        {
            return Err(FreError::InvalidConfig {
                details: "notifications.telegram requires bot_token and chat_ids when enabled"
                    .to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn set_parsed<G, T>(get: &G, name: &str, slot: &mut T) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = get(name) {
        *slot = raw
            .trim()
            .parse::<T>()
            .map_err(|error| FreError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Config, FreError};
    use std::collections::HashMap;
    use std::path::Path;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut cfg = Config::default();
        cfg.engine.workers = 0;
        let err = cfg.validate().expect_err("expected workers error");
        assert!(err.to_string().contains("engine.workers"));
    }

    #[test]
    fn zero_packet_timeout_rejected() {
        let mut cfg = Config::default();
        cfg.engine.packet_timeout_ms = 0;
        let err = cfg.validate().expect_err("expected timeout error");
        assert!(err.to_string().contains("packet_timeout_ms"));
    }

    #[test]
    fn bad_bind_address_rejected_only_when_api_enabled() {
        let mut cfg = Config::default();
        cfg.api.bind = "not-an-address".to_string();
        assert!(cfg.validate().is_err());
        cfg.api.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn telegram_enabled_requires_credentials() {
        let mut cfg = Config::default();
        cfg.notifications.telegram.enabled = true;
        let err = cfg.validate().expect_err("expected telegram error");
        assert!(err.to_string().contains("telegram"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        let overrides = vars(&[
            ("FRE_ENGINE_WORKERS", "8"),
            ("FRE_AUDIT_PROGRESS_ENABLED", "true"),
            ("FRE_API_BASE_PATH", "portal/api/"),
            ("FRE_TELEGRAM_CHAT_IDS", "111, 222,,333"),
        ]);
        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("overrides should parse");
        cfg.normalize();

        assert_eq!(cfg.engine.workers, 8);
        assert!(cfg.audit.progress_enabled);
        assert_eq!(cfg.api.base_path, "/portal/api");
        assert_eq!(
            cfg.notifications.telegram.chat_ids,
            vec!["111".to_string(), "222".to_string(), "333".to_string()]
        );
    }

    #[test]
    fn env_invalid_number_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("FRE_ENGINE_QUEUE_CAPACITY", "lots")]);
        let err = cfg
            .apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect_err("invalid number should fail");
        match err {
            FreError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("FRE_ENGINE_QUEUE_CAPACITY"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn toml_sections_parse_with_defaults_for_missing_keys() {
        let raw = r#"
            [engine]
            workers = 2

            [jammer]
            offline_minutes = 10
            safe_groups = ["Taller"]
        "#;
        let cfg: Config = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.engine.workers, 2);
        assert_eq!(cfg.engine.queue_capacity, 1_024);
        assert_eq!(cfg.jammer.offline_minutes, 10);
        assert_eq!(cfg.jammer.max_avg_gsm, 9);
        assert_eq!(cfg.jammer.safe_groups, vec!["Taller".to_string()]);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/fre/config.toml")));
        assert!(matches!(result, Err(FreError::MissingConfig { .. })));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[geofence]\ncache_ttl_secs = 60\n").unwrap();
        let cfg = Config::load(Some(&path)).expect("load");
        assert_eq!(cfg.geofence.cache_ttl_secs, 60);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = Config::default();
        let before = cfg.stable_hash().expect("hash should compute");
        let mut modified = Config::default();
        modified.engine.workers += 1;
        let after = modified.stable_hash().expect("hash should compute");
        assert_ne!(before, after);
        assert_eq!(before, cfg.stable_hash().expect("hash"));
    }
}
