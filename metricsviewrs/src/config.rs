//! Configuration for the metrics runtime.
//!
//! Supports TOML-based configuration with global defaults and per-datasource overrides.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};
use crate::query_builder::BuildOptions;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Global defaults applied to all datasources unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-datasource configuration overrides (keyed by datasource name).
    #[serde(default)]
    pub datasources: HashMap<String, DatasourceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub query: QueryConfig,
    pub pivot: PivotConfig,
    pub comparison: ComparisonConfig,
}

/// Query execution configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Statement timeout in milliseconds (0 = none).
    pub timeout_ms: u64,
    /// Row limit used when a request asks for zero rows.
    pub default_limit: u64,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PivotConfig {
    /// Maximum `rows * (dimensions + measures)` before pivoting.
    pub cell_limit: u64,
    /// Rows per appender batch in the side-channel engine.
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// When false, comparisons always use the exact full outer join.
    pub allow_approximate: bool,
    pub druid_discovery_limit: u64,
}

/// Per-datasource configuration (can override globals).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasourceConfig {
    pub query: Option<QueryConfig>,
    pub pivot: Option<PivotConfig>,
    pub comparison: Option<ComparisonConfig>,

    /// DuckDB-specific options.
    pub duckdb: Option<DuckDbConfig>,
}

/// DuckDB-specific configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DuckDbConfig {
    /// Maximum concurrent queries (default: 16).
    pub max_concurrency: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            default_limit: 100,
            priority: 0,
        }
    }
}

impl Default for PivotConfig {
    fn default() -> Self {
        Self {
            cell_limit: 2_000_000,
            batch_size: 1024,
        }
    }
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            allow_approximate: true,
            druid_discovery_limit: 10_000,
        }
    }
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
        }
    }
}

impl MetricsConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MetricsError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| MetricsError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `METRICSVIEW_CONFIG` environment variable
    /// 2. `./metricsview.toml` (current directory)
    /// 3. `~/.config/metricsview/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("METRICSVIEW_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from METRICSVIEW_CONFIG");
                    return cfg;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring METRICSVIEW_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("metricsview.toml") {
            tracing::info!("loaded config from ./metricsview.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("metricsview").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Get resolved config for a specific datasource (merges global defaults).
    pub fn for_datasource(&self, name: &str) -> ResolvedDatasourceConfig {
        ResolvedDatasourceConfig::merge(&self.defaults, self.datasources.get(name))
    }
}

/// Fully resolved configuration for a datasource (no Option fields).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDatasourceConfig {
    pub query: QueryConfig,
    pub pivot: PivotConfig,
    pub comparison: ComparisonConfig,
    pub duckdb: DuckDbConfig,
}

impl ResolvedDatasourceConfig {
    fn merge(defaults: &GlobalDefaults, override_cfg: Option<&DatasourceConfig>) -> Self {
        match override_cfg {
            Some(ds) => Self {
                query: ds.query.clone().unwrap_or_else(|| defaults.query.clone()),
                pivot: ds.pivot.clone().unwrap_or_else(|| defaults.pivot.clone()),
                comparison: ds
                    .comparison
                    .clone()
                    .unwrap_or_else(|| defaults.comparison.clone()),
                duckdb: ds.duckdb.clone().unwrap_or_default(),
            },
            None => Self {
                query: defaults.query.clone(),
                pivot: defaults.pivot.clone(),
                comparison: defaults.comparison.clone(),
                duckdb: DuckDbConfig::default(),
            },
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.query.timeout_ms > 0).then(|| Duration::from_millis(self.query.timeout_ms))
    }

    /// Builder knobs for queries against this datasource.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            default_limit: self.query.default_limit,
            pivot_cell_limit: self.pivot.cell_limit,
            pivot_batch_size: self.pivot.batch_size,
            allow_approximate: self.comparison.allow_approximate,
            discovery_limit: self.comparison.druid_discovery_limit,
            time_anchor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = MetricsConfig::default();
        assert_eq!(cfg.defaults.query.timeout_ms, 30_000);
        assert_eq!(cfg.defaults.query.default_limit, 100);
        assert_eq!(cfg.defaults.pivot.cell_limit, 2_000_000);
        assert!(cfg.defaults.comparison.allow_approximate);
        assert_eq!(
            cfg.for_datasource("any").build_options(),
            BuildOptions::default()
        );
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[defaults.query]
timeout_ms = 60000
default_limit = 250

[defaults.pivot]
cell_limit = 1000

[datasources.local.duckdb]
max_concurrency = 4
"#;
        let cfg = MetricsConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.defaults.query.timeout_ms, 60_000);
        assert_eq!(cfg.defaults.pivot.batch_size, 1024);

        let resolved = cfg.for_datasource("local");
        assert_eq!(resolved.duckdb.max_concurrency, 4);
        assert_eq!(resolved.query.default_limit, 250);
        assert_eq!(resolved.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(resolved.build_options().pivot_cell_limit, 1000);
    }

    #[test]
    fn test_datasource_override() {
        let toml = r#"
[defaults.comparison]
allow_approximate = true

[datasources.druid.comparison]
allow_approximate = false
druid_discovery_limit = 500

[datasources.druid.query]
timeout_ms = 0
"#;
        let cfg = MetricsConfig::from_toml(toml).unwrap();

        let default_resolved = cfg.for_datasource("unknown");
        assert!(default_resolved.comparison.allow_approximate);

        let druid = cfg.for_datasource("druid");
        assert!(!druid.comparison.allow_approximate);
        assert_eq!(druid.build_options().discovery_limit, 500);
        assert_eq!(druid.timeout(), None);
        assert_eq!(druid.query.default_limit, 100);
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(matches!(
            MetricsConfig::from_toml("[defaults.query]\ntimeout_ms = \"soon\""),
            Err(MetricsError::Config(_))
        ));
    }
}
