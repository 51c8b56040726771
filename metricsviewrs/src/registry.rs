use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use serde_json::Value;

use crate::error::{MetricsError, Result};
use crate::models::{MetricsView, ResolvedSecurity, SecurityPolicy};
use crate::query::SecurityAttributes;

/// A metrics view together with the security evaluated for one caller.
#[derive(Debug, Clone)]
pub struct ResolvedMetricsView {
    pub view: MetricsView,
    pub security: ResolvedSecurity,
}

/// Looks up metrics views by name and evaluates their security policy.
pub trait MetricsViewResolver: Send + Sync {
    fn resolve(&self, name: &str, attributes: &SecurityAttributes) -> Result<ResolvedMetricsView>;
}

/// Metrics views keyed by lowercased name.
#[derive(Debug, Default, Clone)]
pub struct MetricsViewRegistry {
    views: HashMap<String, MetricsView>,
}

impl MetricsViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(views: Vec<MetricsView>) -> Result<Self> {
        let mut registry = MetricsViewRegistry::new();
        for view in views {
            registry.insert(view)?;
        }
        Ok(registry)
    }

    /// Loads every `metrics_views/*.yml` and `*.yaml` file under `root`.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let mut registry = MetricsViewRegistry::new();
        registry.load_views(root.as_ref().join("metrics_views"))?;
        tracing::info!(
            root = %root.as_ref().display(),
            views = registry.views.len(),
            "loaded metrics views"
        );
        Ok(registry)
    }

    fn load_views(&mut self, dir: PathBuf) -> Result<()> {
        if !dir.exists() {
            return Err(MetricsError::Validation(format!(
                "metrics_views directory not found: {}",
                dir.display()
            )));
        }
        for pattern in ["yml", "yaml"] {
            for entry in glob(&format!("{}/*.{pattern}", dir.display()))
                .map_err(|e| MetricsError::Other(e.into()))?
                .flatten()
            {
                self.load_view_file(&entry)?;
            }
        }
        Ok(())
    }

    fn load_view_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        let view: MetricsView = serde_yaml::from_str(&contents)?;
        tracing::debug!(path = %path.display(), view = view.name.as_str(), "parsed metrics view");
        self.insert(view)
    }

    /// Validates and adds a view; names must be unique ignoring case.
    pub fn insert(&mut self, view: MetricsView) -> Result<()> {
        view.validate()?;
        let key = view.name.to_lowercase();
        if self.views.contains_key(&key) {
            return Err(MetricsError::Validation(format!(
                "duplicate metrics view name {}",
                view.name
            )));
        }
        self.views.insert(key, view);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MetricsView> {
        self.views.get(&name.to_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.views.values().map(|v| v.name.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl MetricsViewResolver for MetricsViewRegistry {
    fn resolve(&self, name: &str, attributes: &SecurityAttributes) -> Result<ResolvedMetricsView> {
        let view = self
            .get(name)
            .ok_or_else(|| MetricsError::Validation(format!("unknown metrics view {name}")))?;
        let security = match &view.security {
            Some(policy) => resolve_security(view, policy, attributes)?,
            None => ResolvedSecurity::open(),
        };
        Ok(ResolvedMetricsView {
            view: view.clone(),
            security,
        })
    }
}

fn resolve_security(
    view: &MetricsView,
    policy: &SecurityPolicy,
    attributes: &SecurityAttributes,
) -> Result<ResolvedSecurity> {
    if let Some(access) = &policy.access {
        let rendered = render_template(access, attributes, TemplateMode::Text)?;
        if !rendered.trim().eq_ignore_ascii_case("true") {
            return Err(MetricsError::AccessDenied(format!(
                "caller may not query metrics view {}",
                view.name
            )));
        }
    }

    let row_filter = policy
        .row_filter
        .as_deref()
        .map(|t| render_template(t, attributes, TemplateMode::Sql))
        .transpose()?
        .filter(|f| !f.trim().is_empty());

    let allowed_fields = if policy.include.is_none() && policy.exclude.is_empty() {
        None
    } else {
        let mut fields: HashSet<String> = match &policy.include {
            Some(include) => include.iter().map(|n| n.to_lowercase()).collect(),
            None => view
                .dimensions
                .iter()
                .map(|d| d.name.to_lowercase())
                .chain(view.measures.iter().map(|m| m.name.to_lowercase()))
                .collect(),
        };
        for name in &policy.exclude {
            fields.remove(&name.to_lowercase());
        }
        if let Some(time) = &view.time_dimension {
            fields.insert(time.to_lowercase());
        }
        Some(fields)
    };

    Ok(ResolvedSecurity {
        row_filter,
        allowed_fields,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateMode {
    /// Values are rendered as SQL literals.
    Sql,
    Text,
}

/// Substitutes `{{ name }}` placeholders from the caller's attributes.
/// Unknown attributes render as NULL (or empty text).
fn render_template(template: &str, attributes: &SecurityAttributes, mode: TemplateMode) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| {
            MetricsError::Validation(format!("unterminated placeholder in template: {template}"))
        })?;
        let key = after[..close].trim();
        let value = attributes.get(key).unwrap_or(&Value::Null);
        match mode {
            TemplateMode::Sql => out.push_str(&sql_literal(value)),
            TemplateMode::Text => out.push_str(&text_value(value)),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(items) => items.iter().map(sql_literal).collect::<Vec<_>>().join(", "),
        Value::Object(_) => format!("'{}'", value.to_string().replace('\'', "''")),
    }
}

fn text_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const VIEW: &str = r#"
name: ad_bids_metrics
data_source: local
table: ad_bids
time_dimension: timestamp
dimensions:
  - pub
  - dom
measures:
  - name: count
    expression: count(*)
  - name: bid_price
    expression: avg(bid_price)
security:
  access: "{{ admin }}"
  row_filter: "pub = {{ publisher }}"
  exclude: [bid_price]
"#;

    fn attrs(pairs: &[(&str, Value)]) -> SecurityAttributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn registry() -> MetricsViewRegistry {
        let view: MetricsView = serde_yaml::from_str(VIEW).unwrap();
        MetricsViewRegistry::from_parts(vec![view]).unwrap()
    }

    #[test]
    fn renders_row_filter_with_escaped_literals() {
        let resolved = registry()
            .resolve(
                "AD_BIDS_METRICS",
                &attrs(&[("admin", json!(true)), ("publisher", json!("O'Reilly"))]),
            )
            .unwrap();
        assert_eq!(resolved.security.row_filter.as_deref(), Some("pub = 'O''Reilly'"));
        assert!(resolved.security.can_access("Pub"));
        assert!(resolved.security.can_access("timestamp"));
        assert!(!resolved.security.can_access("bid_price"));
    }

    #[test]
    fn denies_access_when_template_is_not_true() {
        let err = registry()
            .resolve("ad_bids_metrics", &attrs(&[("publisher", json!("Yahoo"))]))
            .unwrap_err();
        assert!(matches!(err, MetricsError::AccessDenied(_)));
    }

    #[test]
    fn rejects_case_insensitive_duplicate_views() {
        let a: MetricsView = serde_yaml::from_str(VIEW).unwrap();
        let mut b = a.clone();
        b.name = "AD_BIDS_METRICS".to_string();
        assert!(matches!(
            MetricsViewRegistry::from_parts(vec![a, b]),
            Err(MetricsError::Validation(_))
        ));
    }

    #[test]
    fn loads_views_from_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let views = dir.path().join("metrics_views");
        fs::create_dir_all(&views)?;
        fs::write(views.join("ad_bids.yml"), VIEW)?;
        fs::write(
            views.join("other.yaml"),
            "name: other\ndata_source: local\ntable: other\nmeasures:\n  - name: n\n    expression: count(*)\n",
        )?;
        let registry = MetricsViewRegistry::load_from_dir(dir.path())?;
        assert_eq!(registry.names(), vec!["ad_bids_metrics", "other"]);
        assert!(registry.get("Other").is_some());
        Ok(())
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            MetricsViewRegistry::load_from_dir(dir.path()),
            Err(MetricsError::Validation(_))
        ));
    }

    #[test]
    fn renders_list_attributes_for_in_clauses() {
        let out = render_template(
            "pub IN ({{ pubs }})",
            &attrs(&[("pubs", json!(["a", "b"]))]),
            TemplateMode::Sql,
        )
        .unwrap();
        assert_eq!(out, "pub IN ('a', 'b')");
        assert!(render_template("{{ x", &attrs(&[]), TemplateMode::Text).is_err());
    }
}
