//! OLAP engine connections.
//!
//! Each backend is implemented in its own file and gated behind a feature flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{MetricsConfig, ResolvedDatasourceConfig};
use crate::dialect::Dialect;
use crate::error::{MetricsError, Result};
use crate::executor::QueryResult;
use crate::query_builder::PivotSpec;
use crate::sql_ast::{CompiledQuery, SqlArg};

/// A compiled statement plus its execution envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlArg>,
    pub priority: i32,
    pub timeout: Option<Duration>,
}

impl Statement {
    pub fn new(query: CompiledQuery) -> Self {
        Self {
            sql: query.sql,
            args: query.args,
            priority: 0,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Unified interface for the engines a metrics view can live on.
#[async_trait]
pub trait OlapConnection: Send + Sync {
    fn dialect(&self) -> &'static dyn Dialect;

    async fn execute(&self, statement: &Statement) -> Result<QueryResult>;

    /// Runs `underlying` and pivots its rows per `spec`.
    ///
    /// Engines with a native `PIVOT` and temporary tables pivot in place;
    /// the rest fall back to the embedded side-channel engine, which loads
    /// the underlying rows and pivots them locally.
    async fn execute_pivot(&self, underlying: &Statement, spec: &PivotSpec) -> Result<QueryResult> {
        let caps = self.dialect().capabilities();
        if caps.pivot && caps.temp_tables {
            return self.execute_native_pivot(underlying, spec).await;
        }
        let rows = self.execute(underlying).await?;
        #[cfg(feature = "duckdb")]
        {
            crate::pivot_engine::SideChannelPivot::for_spec(spec)
                .pivot(rows, spec, underlying.timeout)
                .await
        }
        #[cfg(not(feature = "duckdb"))]
        {
            let _ = (rows, spec);
            Err(MetricsError::UnsupportedDialectFeature(format!(
                "pivot on {} requires the duckdb feature",
                self.dialect().kind().as_str()
            )))
        }
    }

    /// Pivots inside the engine through a per-call temporary table.
    async fn execute_native_pivot(
        &self,
        _underlying: &Statement,
        _spec: &PivotSpec,
    ) -> Result<QueryResult> {
        Err(MetricsError::UnsupportedDialectFeature(format!(
            "native pivot on {}",
            self.dialect().kind().as_str()
        )))
    }
}

/// Connections keyed by data source name.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: HashMap<String, Arc<dyn OlapConnection>>,
    config: Option<MetricsConfig>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            config: None,
        }
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            connections: HashMap::new(),
            config: Some(config),
        }
    }

    pub fn config(&self) -> Option<&MetricsConfig> {
        self.config.as_ref()
    }

    pub fn config_for(&self, name: &str) -> ResolvedDatasourceConfig {
        match &self.config {
            Some(cfg) => cfg.for_datasource(name),
            None => MetricsConfig::default().for_datasource(name),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, conn: Arc<dyn OlapConnection>) {
        self.connections.insert(name.into(), conn);
    }

    /// Registers a DuckDB file as `name`, sized by that data source's config.
    #[cfg(feature = "duckdb")]
    pub fn open_duckdb<P: AsRef<std::path::Path>>(
        &mut self,
        name: impl Into<String>,
        path: P,
    ) -> DuckDbConnection {
        let name = name.into();
        let conn = DuckDbConnection::from_config(path, &self.config_for(&name).duckdb);
        self.insert(name, Arc::new(conn.clone()));
        conn
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn OlapConnection>> {
        self.connections.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Arc<dyn OlapConnection>> {
        self.get(name)
            .ok_or_else(|| MetricsError::Config(format!("data source {name} not registered")))
    }
}

#[cfg(feature = "duckdb")]
pub(crate) mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::DuckDbConnection;

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;
    use crate::dialect::DialectKind;
    use crate::executor::ColumnMeta;
    use crate::query::Sort;

    /// Answers every statement with the same rows.
    struct Canned {
        kind: DialectKind,
    }

    #[async_trait]
    impl OlapConnection for Canned {
        fn dialect(&self) -> &'static dyn Dialect {
            self.kind.dialect()
        }

        async fn execute(&self, _statement: &Statement) -> Result<QueryResult> {
            let rows = [("Yahoo", "msn.com", 3), ("Google", "msn.com", 5)]
                .iter()
                .map(|(p, d, c)| {
                    let mut m = Map::new();
                    m.insert("pub".to_string(), json!(p));
                    m.insert("dom".to_string(), json!(d));
                    m.insert("count".to_string(), json!(c));
                    m
                })
                .collect();
            Ok(QueryResult {
                columns: vec![
                    ColumnMeta::new("pub", "VARCHAR"),
                    ColumnMeta::new("dom", "VARCHAR"),
                    ColumnMeta::new("count", "BIGINT"),
                ],
                rows,
            })
        }
    }

    fn spec() -> PivotSpec {
        PivotSpec {
            on: vec!["pub".to_string()],
            keep: vec!["dom".to_string()],
            using: vec!["count".to_string()],
            order_by: vec![Sort::asc("dom")],
            limit: None,
            cell_limit: 100,
            num_columns: 3,
            batch_size: 16,
        }
    }

    fn underlying() -> Statement {
        Statement::new(CompiledQuery {
            sql: "SELECT pub, dom, count FROM t".to_string(),
            args: vec![],
        })
    }

    #[cfg(feature = "duckdb")]
    #[tokio::test]
    async fn engines_without_native_pivot_use_the_side_channel() -> anyhow::Result<()> {
        let conn = Canned {
            kind: DialectKind::Druid,
        };
        let result = conn.execute_pivot(&underlying(), &spec()).await?;
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0]["dom"], json!("msn.com"));
        assert_eq!(result.columns.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn pivot_capable_engines_must_pivot_natively() {
        let conn = Canned {
            kind: DialectKind::DuckDb,
        };
        let err = conn.execute_pivot(&underlying(), &spec()).await.unwrap_err();
        assert!(matches!(err, MetricsError::UnsupportedDialectFeature(_)));
    }

    #[cfg(feature = "duckdb")]
    #[test]
    fn opened_duckdb_sources_follow_their_config() -> anyhow::Result<()> {
        let config = MetricsConfig::from_toml("[datasources.local.duckdb]\nmax_concurrency = 2\n")?;
        let mut manager = ConnectionManager::with_config(config);
        let local = manager.open_duckdb("local", "local.duckdb");
        let other = manager.open_duckdb("other", "other.duckdb");
        assert_eq!(local.max_concurrency(), 2);
        assert_eq!(other.max_concurrency(), 16);
        assert!(manager.require("local").is_ok());
        Ok(())
    }
}
