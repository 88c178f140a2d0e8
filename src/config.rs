//! Planner configuration.
//!
//! Configuration is a plain value passed into the builder and the prepared
//! cache. It can be constructed in code, from one of the presets, or loaded
//! from the `[planner]` table of a TOML file.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PlanError;

/// Default namespace used when a keyspace term omits one.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Default capacity of the prepared-plan cache.
pub const DEFAULT_PREPARED_CACHE_LIMIT: usize = 16_384;

/// Knobs consulted while building and caching plans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Namespace applied to keyspace terms without an explicit one.
    pub default_namespace: String,
    /// Upper bound copied into every emitted `Parallel`; `None` defers to the host.
    pub max_parallelism: Option<u32>,
    /// Reject sub-query keyspace terms lacking `USE KEYS`.
    pub require_subquery_keys: bool,
    /// Capacity of the prepared-plan cache.
    pub prepared_cache_limit: usize,
    /// Honour `USE HASH` join hints.
    pub hash_join_hints: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            max_parallelism: None,
            require_subquery_keys: true,
            prepared_cache_limit: DEFAULT_PREPARED_CACHE_LIMIT,
            hash_join_hints: true,
        }
    }
}

impl PlannerConfig {
    /// Preset for statements embedded in a host that allows keyless sub-queries.
    pub fn embedded() -> Self {
        Self {
            require_subquery_keys: false,
            ..Self::default()
        }
    }

    /// Preset that pins every parallel stage to a single lane.
    pub fn serial() -> Self {
        Self {
            max_parallelism: Some(1),
            ..Self::default()
        }
    }

    /// Parses the `[planner]` table of a TOML document.
    ///
    /// A document without the table yields the defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse { path: None, source })?;
        raw.planner.validate()
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        raw.planner.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.default_namespace.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "default_namespace",
                reason: "must not be empty".into(),
            });
        }
        if self.max_parallelism == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_parallelism",
                reason: "must be at least 1".into(),
            });
        }
        if self.prepared_cache_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "prepared_cache_limit",
                reason: "must be at least 1".into(),
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    planner: PlannerConfig,
}

/// Errors raised while loading a [`PlannerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// TOML was malformed.
    #[error("failed to parse {}: {source}", display_path(.path))]
    Parse {
        /// Path that failed, if any.
        path: Option<PathBuf>,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// A field held an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "<inline>".to_string(),
    }
}

impl From<ConfigError> for PlanError {
    fn from(err: ConfigError) -> Self {
        PlanError::Config {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_table_yields_defaults() {
        let cfg = PlannerConfig::from_toml_str("").expect("empty config");
        assert_eq!(cfg, PlannerConfig::default());
    }

    #[test]
    fn partial_table_overrides_selected_fields() {
        let cfg = PlannerConfig::from_toml_str(
            r#"
            [planner]
            max_parallelism = 4
            require_subquery_keys = false
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.max_parallelism, Some(4));
        assert!(!cfg.require_subquery_keys);
        assert_eq!(cfg.default_namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let err = PlannerConfig::from_toml_str("[planner]\nmax_parallelism = 0\n")
            .expect_err("zero lanes");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_parallelism",
                ..
            }
        ));
        let plan_err: PlanError = err.into();
        assert_eq!(plan_err.code(), "Config");
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[planner]\ndefault_namespace = \"analytics\"").expect("write");
        let cfg = PlannerConfig::load(file.path()).expect("load");
        assert_eq!(cfg.default_namespace, "analytics");
    }

    #[test]
    fn presets_differ_from_default() {
        assert!(!PlannerConfig::embedded().require_subquery_keys);
        assert_eq!(PlannerConfig::serial().max_parallelism, Some(1));
    }
}
