//! Side-channel pivot for engines without a native `PIVOT`.
//!
//! The underlying rows are bulk-loaded into a throwaway in-memory DuckDB
//! instance through the arrow appender and pivoted there. Every call gets its
//! own instance, so concurrent pivots never contend on a shared engine, and
//! an aborted load is discarded with the instance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::DateTime;
use duckdb::arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
    TimestampMicrosecondBuilder,
};
use duckdb::arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use duckdb::arrow::record_batch::RecordBatch;
use serde_json::{Map, Value};

use crate::backends::duckdb::{pin_utc, query_rows, with_deadline, Cancellation};
use crate::dialect::DialectKind;
use crate::error::Result;
use crate::executor::{ColumnMeta, QueryResult};
use crate::query_builder::PivotSpec;

const TABLE: &str = "pivot_source";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Boolean,
    Int,
    Float,
    Timestamp,
    Text,
}

impl ColumnKind {
    fn from_meta(column: &ColumnMeta, rows: &[Map<String, Value>]) -> Self {
        let declared = column.data_type.to_uppercase();
        match declared.as_str() {
            "BOOLEAN" => return ColumnKind::Boolean,
            "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "UTINYINT" | "USMALLINT"
            | "UINTEGER" => return ColumnKind::Int,
            "UBIGINT" => {
                let fits = rows
                    .iter()
                    .filter_map(|r| r.get(&column.name))
                    .all(|v| v.is_null() || v.is_i64());
                return if fits {
                    ColumnKind::Int
                } else {
                    ColumnKind::Text
                };
            }
            "FLOAT" | "DOUBLE" => return ColumnKind::Float,
            "TIMESTAMP" => return ColumnKind::Timestamp,
            "VARCHAR" => return ColumnKind::Text,
            t if t.starts_with("DECIMAL") => return ColumnKind::Float,
            _ => {}
        }
        let sample = rows
            .iter()
            .filter_map(|r| r.get(&column.name))
            .find(|v| !v.is_null());
        match sample {
            Some(Value::Bool(_)) => ColumnKind::Boolean,
            Some(Value::Number(n)) if n.is_i64() => ColumnKind::Int,
            Some(Value::Number(_)) => ColumnKind::Float,
            _ => ColumnKind::Text,
        }
    }

    fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Int => "BIGINT",
            ColumnKind::Float => "DOUBLE",
            ColumnKind::Timestamp => "TIMESTAMP",
            ColumnKind::Text => "VARCHAR",
        }
    }

    fn arrow_type(self) -> DataType {
        match self {
            ColumnKind::Boolean => DataType::Boolean,
            ColumnKind::Int => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            ColumnKind::Text => DataType::Utf8,
        }
    }

    fn build(self, name: &str, rows: &[Map<String, Value>]) -> ArrayRef {
        let values = rows.iter().map(|r| r.get(name).filter(|v| !v.is_null()));
        match self {
            ColumnKind::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(rows.len());
                for v in values {
                    builder.append_option(v.and_then(Value::as_bool));
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Int => {
                let mut builder = Int64Builder::with_capacity(rows.len());
                for v in values {
                    builder.append_option(v.and_then(Value::as_i64));
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Float => {
                let mut builder = Float64Builder::with_capacity(rows.len());
                for v in values {
                    builder.append_option(v.and_then(|v| match v {
                        Value::String(s) => s.parse::<f64>().ok(),
                        other => other.as_f64(),
                    }));
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Timestamp => {
                let mut builder = TimestampMicrosecondBuilder::with_capacity(rows.len());
                for v in values {
                    builder.append_option(
                        v.and_then(Value::as_str)
                            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            .map(|t| t.timestamp_micros()),
                    );
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Text => {
                let mut builder = StringBuilder::with_capacity(rows.len(), rows.len() * 16);
                for v in values {
                    match v {
                        None => builder.append_null(),
                        Some(Value::String(s)) => builder.append_value(s),
                        Some(other) => builder.append_value(other.to_string()),
                    }
                }
                Arc::new(builder.finish())
            }
        }
    }
}

/// Pivots already-fetched rows in an ephemeral embedded engine.
#[derive(Debug, Clone)]
pub struct SideChannelPivot {
    batch_size: usize,
}

impl Default for SideChannelPivot {
    fn default() -> Self {
        Self { batch_size: 1024 }
    }
}

impl SideChannelPivot {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn for_spec(spec: &PivotSpec) -> Self {
        Self::new(spec.batch_size)
    }

    pub async fn pivot(
        &self,
        rows: QueryResult,
        spec: &PivotSpec,
        timeout: Option<Duration>,
    ) -> Result<QueryResult> {
        let spec = spec.clone();
        let batch_size = self.batch_size;
        let cancellation = Cancellation::new();
        let worker = cancellation.clone();
        let task =
            tokio::task::spawn_blocking(move || pivot_blocking(rows, &spec, batch_size, &worker));
        with_deadline(timeout, Duration::ZERO, cancellation, task).await
    }
}

fn pivot_blocking(
    source: QueryResult,
    spec: &PivotSpec,
    batch_size: usize,
    cancellation: &Cancellation,
) -> Result<QueryResult> {
    let start = Instant::now();
    let dialect = DialectKind::DuckDb.dialect();
    let conn = duckdb::Connection::open_in_memory()?;
    cancellation.arm(&conn);
    pin_utc(&conn);

    let kinds: Vec<ColumnKind> = source
        .columns
        .iter()
        .map(|c| ColumnKind::from_meta(c, &source.rows))
        .collect();
    let definitions: Vec<String> = source
        .columns
        .iter()
        .zip(&kinds)
        .map(|(c, k)| format!("{} {}", dialect.quote_ident(&c.name), k.sql_type()))
        .collect();
    conn.execute_batch(&format!(
        "CREATE TABLE {} ({})",
        dialect.quote_ident(TABLE),
        definitions.join(", ")
    ))?;

    let schema = Arc::new(Schema::new(
        source
            .columns
            .iter()
            .zip(&kinds)
            .map(|(c, k)| Field::new(c.name.clone(), k.arrow_type(), true))
            .collect::<Vec<_>>(),
    ));

    let mut loaded: u64 = 0;
    {
        let mut appender = conn.appender(TABLE)?;
        for chunk in source.rows.chunks(batch_size) {
            cancellation.check()?;
            loaded += chunk.len() as u64;
            spec.check_cells(loaded)?;
            let arrays: Vec<ArrayRef> = source
                .columns
                .iter()
                .zip(&kinds)
                .map(|(c, k)| k.build(&c.name, chunk))
                .collect();
            let batch = RecordBatch::try_new(schema.clone(), arrays)?;
            appender.append_record_batch(batch)?;
        }
        appender.flush()?;
    }

    cancellation.check()?;
    let result = query_rows(&conn, &spec.pivot_sql(dialect, TABLE), &[])?;
    cancellation.finish();
    spec.check_limit(result.rows.len() as u64)?;
    tracing::debug!(
        loaded,
        rows = result.rows.len(),
        ms = start.elapsed().as_millis(),
        "side-channel pivot"
    );
    Ok(result)
}
