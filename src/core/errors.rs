//! FRE-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, FreError>;

/// Top-level error type for the fleet rule engine.
#[derive(Debug, Error)]
pub enum FreError {
    #[error("[FRE-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[FRE-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[FRE-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[FRE-1101] audit manifest parse failure for rule {rule}: {details}")]
    ManifestParse { rule: String, details: String },

    #[error("[FRE-2001] payload rejected: {details}")]
    PayloadParse { details: String },

    #[error("[FRE-2002] rule {rule} failed to compile: {details}")]
    RuleCompile { rule: String, details: String },

    #[error("[FRE-2003] rule {rule} failed during execution: {details}")]
    RuleExecution { rule: String, details: String },

    #[error("[FRE-2004] capability registry conflict: {details}")]
    Registry { details: String },

    #[error("[FRE-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[FRE-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[FRE-2103] {entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("[FRE-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[FRE-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[FRE-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl FreError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "FRE-1001",
            Self::MissingConfig { .. } => "FRE-1002",
            Self::ConfigParse { .. } => "FRE-1003",
            Self::ManifestParse { .. } => "FRE-1101",
            Self::PayloadParse { .. } => "FRE-2001",
            Self::RuleCompile { .. } => "FRE-2002",
            Self::RuleExecution { .. } => "FRE-2003",
            Self::Registry { .. } => "FRE-2004",
            Self::Serialization { .. } => "FRE-2101",
            Self::Sql { .. } => "FRE-2102",
            Self::NotFound { .. } => "FRE-2103",
            Self::Io { .. } => "FRE-3002",
            Self::ChannelClosed { .. } => "FRE-3003",
            Self::Runtime { .. } => "FRE-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::ChannelClosed { .. } | Self::Sql { .. } | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for rule execution failures.
    #[must_use]
    pub fn rule(rule: impl Into<String>, details: impl Into<String>) -> Self {
        Self::RuleExecution {
            rule: rule.into(),
            details: details.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for FreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for FreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for FreError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for FreError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Serialization {
            context: "serde_yaml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_error() -> FreError {
        FreError::RuleCompile {
            rule: "jammer".to_string(),
            details: "unknown native program teleport".to_string(),
        }
    }

    #[test]
    fn display_leads_with_code() {
        let cases = [
            (compile_error(), "FRE-2002"),
            (FreError::rule("offline", "deadline exceeded"), "FRE-2003"),
            (
                FreError::NotFound {
                    entity: "snapshot",
                    key: "42".to_string(),
                },
                "FRE-2103",
            ),
            (FreError::ChannelClosed { component: "worker pool" }, "FRE-3003"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
            assert!(err.to_string().starts_with(&format!("[{code}]")), "{err}");
        }
        assert!(compile_error().to_string().contains("rule jammer"));
    }

    #[test]
    fn storage_and_runtime_failures_are_retryable() {
        assert!(FreError::io("/var/lib/fre/fre.sqlite3", std::io::Error::other("busy")).is_retryable());
        assert!(
            FreError::Sql {
                context: "alert guard",
                details: "database is locked".to_string(),
            }
            .is_retryable()
        );
        assert!(!compile_error().is_retryable());
        assert!(
            !FreError::PayloadParse {
                details: "ListPackets is empty".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn parser_errors_convert() {
        let yaml: FreError = serde_yaml::from_str::<Vec<u32>>("{not: [valid").unwrap_err().into();
        assert_eq!(yaml.code(), "FRE-2101");
        let toml: FreError = toml::from_str::<toml::Value>("= nope").unwrap_err().into();
        assert_eq!(toml.code(), "FRE-1003");
        let json: FreError = serde_json::from_str::<u8>("[").unwrap_err().into();
        assert!(json.to_string().contains("serde_json"));
    }
}
