use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::{MetricsError, Result};

/// A positional argument bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl SqlArg {
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(SqlArg::Null),
            Value::Bool(b) => Ok(SqlArg::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(SqlArg::Int(i)),
                None => n.as_f64().map(SqlArg::Float).ok_or_else(|| {
                    MetricsError::Validation(format!("unsupported numeric literal {n}"))
                }),
            },
            Value::String(s) => Ok(SqlArg::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(MetricsError::Validation(format!(
                "unsupported literal {value}"
            ))),
        }
    }
}

impl From<DateTime<Utc>> for SqlArg {
    fn from(value: DateTime<Utc>) -> Self {
        SqlArg::Timestamp(value)
    }
}

impl From<&str> for SqlArg {
    fn from(value: &str) -> Self {
        SqlArg::Text(value.to_string())
    }
}

/// SQL text paired with the arguments for its placeholders, in emission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl Fragment {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn new(sql: impl Into<String>, args: Vec<SqlArg>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn push_sql(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push_arg(&mut self, arg: SqlArg) -> &mut Self {
        self.sql.push('?');
        self.args.push(arg);
        self
    }

    pub fn push(&mut self, other: &Fragment) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.args.extend(other.args.iter().cloned());
        self
    }

    pub fn wrap(&self, prefix: &str, suffix: &str) -> Fragment {
        let mut out = Fragment::raw(prefix);
        out.push(self).push_sql(suffix);
        out
    }

    /// Joins non-empty parts as `(a) <keyword> (b)`.
    pub fn join(parts: Vec<Fragment>, keyword: &str) -> Option<Fragment> {
        let mut parts = parts.into_iter().filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut out = first.wrap("(", ")");
        for part in parts {
            out.push_sql(&format!(" {keyword} "));
            out.push(&part.wrap("(", ")"));
        }
        Some(out)
    }

    pub fn and_all(parts: Vec<Fragment>) -> Option<Fragment> {
        Self::join(parts, "AND")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectField {
    pub expr: Fragment,
    pub alias: String,
}

impl SelectField {
    pub fn new(expr: Fragment, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJoinType {
    Left,
    Right,
    Full,
}

/// A subquery or a reference to a CTE, given a name in the enclosing FROM.
#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    Subquery(Box<SelectNode>),
    Cte(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AliasedRelation {
    pub relation: Relation,
    pub alias: String,
}

impl AliasedRelation {
    pub fn subquery(node: SelectNode, alias: impl Into<String>) -> Self {
        Self {
            relation: Relation::Subquery(Box::new(node)),
            alias: alias.into(),
        }
    }

    pub fn cte(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            relation: Relation::Cte(name.into()),
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub left: AliasedRelation,
    pub right: AliasedRelation,
    pub join_type: SqlJoinType,
    pub on: Fragment,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromClause {
    /// A physical table (already escaped) with trailing lateral unnest clauses.
    Table { name: String, unnest: Vec<String> },
    Relation(AliasedRelation),
    Join(Box<JoinSpec>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    /// An escaped output column name or a positional ordinal.
    pub expr: String,
    pub desc: bool,
}

/// The single select shape every builder produces. An empty `fields` list
/// renders as `SELECT *`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectNode {
    pub ctes: Vec<(String, SelectNode)>,
    pub fields: Vec<SelectField>,
    pub from: FromClause,
    pub where_clause: Option<Fragment>,
    /// 1-based ordinals into `fields`.
    pub group_by: Vec<usize>,
    pub having: Option<Fragment>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectNode {
    pub fn new(from: FromClause) -> Self {
        Self {
            ctes: Vec::new(),
            fields: Vec::new(),
            from,
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// `SELECT * FROM (<inner>) <alias>`, used to apply a filter, sort or
    /// limit over already-aggregated columns.
    pub fn wrap(inner: SelectNode, alias: &str) -> Self {
        Self::new(FromClause::Relation(AliasedRelation::subquery(inner, alias)))
    }

    pub fn field_index(&self, alias: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.alias == alias)
    }
}

/// Output of compilation: SQL text and its positional arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl CompiledQuery {
    pub fn placeholder_count(&self) -> usize {
        count_placeholders(&self.sql)
    }
}

/// Counts `?` outside of single-quoted literals and quoted identifiers.
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut in_string = false;
    let mut in_ident = false;
    for ch in sql.chars() {
        match ch {
            '\'' if !in_ident => in_string = !in_string,
            '"' if !in_string => in_ident = !in_ident,
            '?' if !in_string && !in_ident => count += 1,
            _ => {}
        }
    }
    count
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn render(&self, node: &SelectNode) -> CompiledQuery {
        let mut out = Fragment::default();
        self.render_select(node, &mut out);
        CompiledQuery {
            sql: out.sql,
            args: out.args,
        }
    }

    fn render_select(&self, node: &SelectNode, out: &mut Fragment) {
        if !node.ctes.is_empty() {
            out.push_sql("WITH ");
            for (idx, (name, cte)) in node.ctes.iter().enumerate() {
                if idx > 0 {
                    out.push_sql(", ");
                }
                out.push_sql(&format!("{} AS (", self.dialect.quote_ident(name)));
                self.render_select(cte, out);
                out.push_sql(")");
            }
            out.push_sql(" ");
        }

        out.push_sql("SELECT ");
        if node.fields.is_empty() {
            out.push_sql("*");
        }
        for (idx, field) in node.fields.iter().enumerate() {
            if idx > 0 {
                out.push_sql(", ");
            }
            out.push(&field.expr);
            out.push_sql(&format!(" AS {}", self.dialect.quote_ident(&field.alias)));
        }

        out.push_sql(" FROM ");
        self.render_from(&node.from, out);

        if let Some(filter) = &node.where_clause {
            out.push_sql(" WHERE ").push(filter);
        }

        if !node.group_by.is_empty() {
            let groups: Vec<String> = node.group_by.iter().map(|g| g.to_string()).collect();
            out.push_sql(&format!(" GROUP BY {}", groups.join(", ")));
        }

        if let Some(having) = &node.having {
            out.push_sql(" HAVING ").push(having);
        }

        if !node.order_by.is_empty() {
            let orders: Vec<String> = node
                .order_by
                .iter()
                .map(|o| self.dialect.order_by(&o.expr, o.desc))
                .collect();
            out.push_sql(&format!(" ORDER BY {}", orders.join(", ")));
        }

        if let Some(limit) = node.limit {
            out.push_sql(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = node.offset {
            out.push_sql(&format!(" OFFSET {offset}"));
        }
    }

    fn render_from(&self, from: &FromClause, out: &mut Fragment) {
        match from {
            FromClause::Table { name, unnest } => {
                out.push_sql(name);
                for clause in unnest {
                    out.push_sql(clause);
                }
            }
            FromClause::Relation(rel) => self.render_relation(rel, out),
            FromClause::Join(join) => {
                self.render_relation(&join.left, out);
                let join_kw = match join.join_type {
                    SqlJoinType::Left => "LEFT OUTER JOIN",
                    SqlJoinType::Right => "RIGHT OUTER JOIN",
                    SqlJoinType::Full => "FULL OUTER JOIN",
                };
                out.push_sql(&format!(" {join_kw} "));
                self.render_relation(&join.right, out);
                out.push_sql(" ON ").push(&join.on);
            }
        }
    }

    fn render_relation(&self, rel: &AliasedRelation, out: &mut Fragment) {
        match &rel.relation {
            Relation::Subquery(node) => {
                out.push_sql("(");
                self.render_select(node, out);
                out.push_sql(")");
            }
            Relation::Cte(name) => {
                out.push_sql(&self.dialect.quote_ident(name));
            }
        }
        out.push_sql(&format!(" {}", self.dialect.quote_ident(&rel.alias)));
    }
}
