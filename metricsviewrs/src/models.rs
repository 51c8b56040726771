use std::collections::HashSet;

use serde::{de, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::{MetricsError, Result};
use crate::time::{CalendarSettings, TimeGrain};

/// A semantic model over one physical table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsView {
    pub name: String,
    pub data_source: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub database_schema: Option<String>,
    pub table: String,
    #[serde(default)]
    pub time_dimension: Option<String>,
    #[serde(default)]
    pub smallest_time_grain: Option<TimeGrain>,
    /// 1 = Monday .. 7 = Sunday; anything else means Monday.
    #[serde(default)]
    pub first_day_of_week: u32,
    /// 1 = January .. 12 = December; anything else means January.
    #[serde(default)]
    pub first_month_of_year: u32,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub measures: Vec<Measure>,
    #[serde(default)]
    pub security: Option<SecurityPolicy>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionType {
    Categorical,
    Time,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dimension {
    pub name: String,
    pub column: Option<String>,
    pub expression: Option<String>,
    pub unnest: bool,
    pub data_type: Option<DimensionType>,
    pub label: Option<String>,
    pub description: Option<String>,
}

impl Dimension {
    pub fn column(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: None,
            expression: None,
            unnest: false,
            data_type: None,
            label: None,
            description: None,
        }
    }

    pub fn with_expression(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            expression: Some(expression.into()),
            ..Self::column(name)
        }
    }
}

impl<'de> Deserialize<'de> for Dimension {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(Dimension::column(s)),
            other => {
                #[derive(Deserialize)]
                struct Full {
                    name: String,
                    column: Option<String>,
                    expression: Option<String>,
                    #[serde(default)]
                    unnest: bool,
                    #[serde(rename = "type")]
                    data_type: Option<DimensionType>,
                    label: Option<String>,
                    description: Option<String>,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                Ok(Dimension {
                    name: full.name,
                    column: full.column,
                    expression: full.expression,
                    unnest: full.unnest,
                    data_type: full.data_type,
                    label: full.label,
                    description: full.description,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    pub expression: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Measure {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            label: None,
            description: None,
        }
    }
}

/// Per-view access rules. Templates reference caller attributes as `{{ name }}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Template that must render to `true` for the caller to query the view.
    pub access: Option<String>,
    /// SQL predicate template ANDed into every query.
    pub row_filter: Option<String>,
    /// When set, only these dimensions and measures are visible.
    pub include: Option<Vec<String>>,
    pub exclude: Vec<String>,
}

/// Security after evaluating a view's policy for one caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedSecurity {
    pub row_filter: Option<String>,
    /// Lowercased names the caller may reference; `None` means all.
    pub allowed_fields: Option<HashSet<String>>,
}

impl ResolvedSecurity {
    /// No row filter and every field visible.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn can_access(&self, name: &str) -> bool {
        self.allowed_fields
            .as_ref()
            .map_or(true, |fields| fields.contains(&name.to_lowercase()))
    }
}

impl MetricsView {
    pub fn calendar(&self) -> CalendarSettings {
        CalendarSettings::new(self.first_day_of_week, self.first_month_of_year)
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .or_else(|| self.dimensions.iter().find(|d| d.name.eq_ignore_ascii_case(name)))
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measures
            .iter()
            .find(|m| m.name == name)
            .or_else(|| self.measures.iter().find(|m| m.name.eq_ignore_ascii_case(name)))
    }

    /// Whether `name` can be rolled up by a time grain.
    pub fn is_time_dimension(&self, name: &str) -> bool {
        if self
            .time_dimension
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(name))
        {
            return true;
        }
        self.dimension(name)
            .is_some_and(|d| d.data_type == Some(DimensionType::Time))
    }

    pub fn table_ref(&self, dialect: &dyn Dialect) -> String {
        dialect.quote_table(
            self.database.as_deref(),
            self.database_schema.as_deref(),
            &self.table,
        )
    }

    /// The SQL expression behind a dimension name, or the time dimension column.
    pub fn dimension_expr(&self, name: &str, dialect: &dyn Dialect) -> Option<String> {
        if let Some(dim) = self.dimension(name) {
            return Some(match (&dim.expression, &dim.column) {
                (Some(expr), _) => format!("({expr})"),
                (None, Some(col)) => dialect.quote_ident(col),
                (None, None) => dialect.quote_ident(&dim.name),
            });
        }
        self.time_dimension
            .as_deref()
            .filter(|t| t.eq_ignore_ascii_case(name))
            .map(|t| dialect.quote_ident(t))
    }

    pub fn time_dimension_expr(&self, dialect: &dyn Dialect) -> Option<String> {
        let name = self.time_dimension.as_deref()?;
        self.dimension_expr(name, dialect)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(MetricsError::Validation(format!(
                "metrics view {} has no table",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for name in self
            .dimensions
            .iter()
            .map(|d| &d.name)
            .chain(self.measures.iter().map(|m| &m.name))
        {
            if !seen.insert(name.to_lowercase()) {
                return Err(MetricsError::Validation(format!(
                    "metrics view {}: duplicate dimension or measure name {name}",
                    self.name
                )));
            }
        }
        if let Some(m) = self.measures.iter().find(|m| m.expression.trim().is_empty()) {
            return Err(MetricsError::Validation(format!(
                "metrics view {}: measure {} has no expression",
                self.name, m.name
            )));
        }
        Ok(())
    }
}
