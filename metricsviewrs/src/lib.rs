pub mod backends;
pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod expression;
pub mod models;
#[cfg(feature = "duckdb")]
pub mod pivot_engine;
pub mod query;
pub mod query_builder;
pub mod registry;
pub mod runtime;
pub mod sql_ast;
pub mod time;

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING: OnceCell<()> = OnceCell::new();

/// Install a `RUST_LOG`-driven fmt subscriber once per process.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer())
            .try_init();
    });
}

#[cfg(feature = "duckdb")]
pub use backends::DuckDbConnection;
pub use backends::{ConnectionManager, OlapConnection, Statement};
pub use config::MetricsConfig;
pub use dialect::{Dialect, DialectKind};
pub use error::{MetricsError, Result};
pub use executor::{ColumnMeta, MetricsResponse, QueryResult};
pub use models::{MetricsView, ResolvedSecurity};
pub use query::{ComparisonToplistQuery, Expression, Query, SecurityAttributes, ToplistQuery};
pub use query_builder::{BuildOptions, QueryPlan, SqlBuilder};
pub use registry::{MetricsViewRegistry, MetricsViewResolver, ResolvedMetricsView};
pub use runtime::{MetricsRuntime, TimeRangeSummary};
