use chrono::{DateTime, NaiveDate, Utc};
#[cfg(feature = "duckdb")]
use duckdb::arrow::datatypes::DataType;
#[cfg(feature = "duckdb")]
use duckdb::types::{TimeUnit, Value as DuckValue};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
}

impl QueryResult {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// What the compile-and-run entry points return.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsResponse {
    pub schema: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
    /// Rows may be missing because one side of a comparison join was pre-limited.
    pub approximate: bool,
}

impl MetricsResponse {
    pub fn from_result(result: QueryResult, approximate: bool) -> Self {
        Self {
            schema: result.columns,
            rows: result.rows,
            approximate,
        }
    }
}

pub(crate) fn timestamp_to_json(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
}

fn micros_to_json(micros: i64) -> Value {
    match DateTime::<Utc>::from_timestamp_micros(micros) {
        Some(t) => timestamp_to_json(t),
        None => Value::from(micros),
    }
}

fn days_to_json(days: i32) -> Value {
    let date = NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(i64::from(days))));
    match date {
        Some(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        None => Value::from(days),
    }
}

#[cfg(feature = "duckdb")]
fn to_micros(unit: TimeUnit, t: i64) -> i64 {
    match unit {
        TimeUnit::Second => t.saturating_mul(1_000_000),
        TimeUnit::Millisecond => t.saturating_mul(1_000),
        TimeUnit::Microsecond => t,
        TimeUnit::Nanosecond => t / 1_000,
    }
}

#[cfg(feature = "duckdb")]
pub(crate) fn duck_value_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        DuckValue::HugeInt(i) => match i64::try_from(i) {
            Ok(v) => Value::from(v),
            Err(_) => Value::String(i.to_string()),
        },
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::UHugeInt(i) => match u64::try_from(i) {
            Ok(v) => Value::from(v),
            Err(_) => Value::String(i.to_string()),
        },
        DuckValue::Float(f) => Value::from(f),
        DuckValue::Double(f) => Value::from(f),
        DuckValue::Decimal(d) => Value::String(d.to_string()),
        DuckValue::Timestamp(unit, t) => micros_to_json(to_micros(unit, t)),
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Blob(bytes) => Value::String(hex::encode(bytes)),
        DuckValue::Date32(d) => days_to_json(d),
        DuckValue::Time64(unit, t) => Value::String(format!("{t} ({unit:?})")),
        DuckValue::Interval {
            months,
            days,
            nanos,
        } => Value::String(format!("{months} months {days} days {nanos} nanos")),
        DuckValue::List(items) => {
            let values = items.into_iter().map(duck_value_to_json).collect();
            Value::Array(values)
        }
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Struct(fields) => {
            let mut map = Map::new();
            for (key, val) in fields.iter() {
                map.insert(key.clone(), duck_value_to_json(val.clone()));
            }
            Value::Object(map)
        }
        DuckValue::Array(items) => {
            let values = items.into_iter().map(duck_value_to_json).collect();
            Value::Array(values)
        }
        DuckValue::Map(entries) => {
            let pairs: Vec<Value> = entries
                .iter()
                .map(|(k, v)| {
                    Value::Array(vec![
                        duck_value_to_json(k.clone()),
                        duck_value_to_json(v.clone()),
                    ])
                })
                .collect();
            Value::Array(pairs)
        }
        DuckValue::Union(inner) => duck_value_to_json(*inner),
        other => Value::String(format!("{other:?}")),
    }
}

/// SQL-facing name of a result column type.
#[cfg(feature = "duckdb")]
pub(crate) fn type_name(data_type: &DataType) -> String {
    match data_type {
        DataType::Null => "NULL".to_string(),
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Int8 => "TINYINT".to_string(),
        DataType::Int16 => "SMALLINT".to_string(),
        DataType::Int32 => "INTEGER".to_string(),
        DataType::Int64 => "BIGINT".to_string(),
        DataType::UInt8 => "UTINYINT".to_string(),
        DataType::UInt16 => "USMALLINT".to_string(),
        DataType::UInt32 => "UINTEGER".to_string(),
        DataType::UInt64 => "UBIGINT".to_string(),
        DataType::Float32 => "FLOAT".to_string(),
        DataType::Float64 => "DOUBLE".to_string(),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "VARCHAR".to_string(),
        DataType::Binary | DataType::LargeBinary => "BLOB".to_string(),
        DataType::Date32 | DataType::Date64 => "DATE".to_string(),
        DataType::Timestamp(_, _) => "TIMESTAMP".to_string(),
        DataType::Decimal128(p, s) | DataType::Decimal256(p, s) => format!("DECIMAL({p},{s})"),
        DataType::List(_) | DataType::LargeList(_) => "LIST".to_string(),
        DataType::Struct(_) => "STRUCT".to_string(),
        other => other.to_string().to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn renders_instants_as_rfc3339_utc() {
        let t = Utc.with_ymd_and_hms(2022, 1, 1, 12, 30, 0).unwrap();
        assert_eq!(timestamp_to_json(t), Value::String("2022-01-01T12:30:00Z".to_string()));
        assert_eq!(days_to_json(19_000), Value::String("2022-01-08".to_string()));
    }

    #[cfg(feature = "duckdb")]
    #[test]
    fn converts_duckdb_values() {
        assert_eq!(
            duck_value_to_json(DuckValue::Timestamp(TimeUnit::Microsecond, 1_641_038_400_000_000)),
            Value::String("2022-01-01T12:00:00Z".to_string())
        );
        assert_eq!(duck_value_to_json(DuckValue::HugeInt(42)), Value::from(42));
        assert_eq!(type_name(&DataType::Utf8), "VARCHAR");
    }
}
