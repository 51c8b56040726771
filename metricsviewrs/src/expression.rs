//! Compiles filter and having expression trees into SQL predicates.
//!
//! Identifiers are only ever resolved through an [`IdentifierMap`] built from
//! the metrics view, so user input can reach the SQL text solely as bound
//! arguments.

use std::collections::HashMap;

use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::{MetricsError, Result};
use crate::query::{Condition, Expression, Operator};
use crate::sql_ast::{Fragment, SqlArg};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnIdentifier {
    pub expr: String,
    /// Array-valued column that is unnested when selected.
    pub unnest: bool,
}

/// Names a predicate may reference, mapped to their SQL expressions.
#[derive(Debug, Clone, Default)]
pub struct IdentifierMap {
    entries: HashMap<String, ColumnIdentifier>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, expr: impl Into<String>, unnest: bool) {
        self.entries.insert(
            name.into(),
            ColumnIdentifier {
                expr: expr.into(),
                unnest,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ColumnIdentifier> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// Compiles `expr` into a boolean clause with its positional arguments.
pub fn compile(
    expr: &Expression,
    allowed: &IdentifierMap,
    dialect: &dyn Dialect,
) -> Result<Fragment> {
    ExpressionCompiler { allowed, dialect }.compile(expr)
}

struct ExpressionCompiler<'a> {
    allowed: &'a IdentifierMap,
    dialect: &'a dyn Dialect,
}

impl ExpressionCompiler<'_> {
    fn compile(&self, expr: &Expression) -> Result<Fragment> {
        match expr {
            Expression::Identifier(name) => self
                .allowed
                .get(name)
                .map(|c| Fragment::raw(c.expr.clone()))
                .ok_or_else(|| MetricsError::UnknownIdentifier(name.clone())),
            Expression::Value(v) => Ok(Fragment::new("?", vec![SqlArg::from_json(v)?])),
            Expression::Condition(cond) => self.compile_condition(cond),
        }
    }

    fn compile_condition(&self, cond: &Condition) -> Result<Fragment> {
        match cond.op {
            Operator::And => self.compile_junction(cond, "AND"),
            Operator::Or => self.compile_junction(cond, "OR"),
            Operator::In => self.compile_in(cond, false),
            Operator::Nin => self.compile_in(cond, true),
            Operator::Like => self.compile_like(cond, false),
            Operator::Nlike => self.compile_like(cond, true),
            Operator::Eq | Operator::Neq if self.unnested(&cond.exprs[..]) => {
                // Equality on an array dimension means membership.
                self.compile_in(cond, cond.op == Operator::Neq)
            }
            Operator::Eq => self.compile_comparison(cond, "="),
            Operator::Neq => self.compile_comparison(cond, "!="),
            Operator::Lt => self.compile_comparison(cond, "<"),
            Operator::Lte => self.compile_comparison(cond, "<="),
            Operator::Gt => self.compile_comparison(cond, ">"),
            Operator::Gte => self.compile_comparison(cond, ">="),
        }
    }

    fn compile_junction(&self, cond: &Condition, keyword: &str) -> Result<Fragment> {
        if cond.exprs.is_empty() {
            return Err(MetricsError::Validation(format!(
                "{keyword} expression should have at least 1 sub expression"
            )));
        }
        let parts = cond
            .exprs
            .iter()
            .map(|e| self.compile(e))
            .collect::<Result<Vec<_>>>()?;
        Ok(Fragment::join(parts, keyword).unwrap_or_default())
    }

    fn compile_comparison(&self, cond: &Condition, op: &str) -> Result<Fragment> {
        let [left, right] = cond.exprs.as_slice() else {
            return Err(MetricsError::Validation(format!(
                "binary expression should have exactly 2 sub expressions, got {}",
                cond.exprs.len()
            )));
        };
        let lhs = self.compile(left)?;
        if matches!(right, Expression::Value(Value::Null)) {
            match op {
                "=" => return Ok(lhs.wrap("(", ") IS NULL")),
                "!=" => return Ok(lhs.wrap("(", ") IS NOT NULL")),
                _ => {}
            }
        }
        let rhs = self.compile(right)?;
        let mut out = lhs.wrap("(", ")");
        out.push_sql(&format!(" {op} "));
        out.push(&rhs.wrap("(", ")"));
        Ok(out)
    }

    fn compile_in(&self, cond: &Condition, exclude: bool) -> Result<Fragment> {
        let Some((left, values)) = cond.exprs.split_first().filter(|(_, v)| !v.is_empty()) else {
            return Err(MetricsError::Validation(
                "in/nin expression should have at least 2 sub expressions".to_string(),
            ));
        };
        let lhs = self.compile(left)?;
        let unnest = self.unnested(std::slice::from_ref(left));

        let has_null = values
            .iter()
            .any(|v| matches!(v, Expression::Value(Value::Null)));
        let listed = values
            .iter()
            .filter(|v| !matches!(v, Expression::Value(Value::Null)))
            .map(|v| self.compile(v))
            .collect::<Result<Vec<_>>>()?;

        let not = if exclude { "NOT " } else { "" };
        let mut clauses = Vec::new();
        if !listed.is_empty() {
            let mut list = Fragment::default();
            for (idx, value) in listed.iter().enumerate() {
                if idx > 0 {
                    list.push_sql(", ");
                }
                list.push(value);
            }
            let mut clause = Fragment::default();
            if unnest {
                clause
                    .push_sql(&format!("{not}list_has_any("))
                    .push(&lhs)
                    .push_sql(", [")
                    .push(&list)
                    .push_sql("])");
            } else {
                clause
                    .push(&lhs.wrap("(", ")"))
                    .push_sql(&format!(" {not}IN ("))
                    .push(&list)
                    .push_sql(")");
            }
            clauses.push(clause);
        }
        if has_null {
            clauses.push(lhs.wrap("(", &format!(") IS {not}NULL")));
        }

        let keyword = if exclude { "AND" } else { "OR" };
        let mut out = Fragment::join(clauses, keyword).unwrap_or_default();
        if exclude && !has_null {
            // NOT IN drops NULL rows; exclusion should keep them.
            out = out.wrap("(", "");
            out.push_sql(" OR ").push(&lhs.wrap("(", ") IS NULL)"));
        }
        Ok(out)
    }

    fn compile_like(&self, cond: &Condition, exclude: bool) -> Result<Fragment> {
        let [left, right] = cond.exprs.as_slice() else {
            return Err(MetricsError::Validation(format!(
                "like/nlike expression should have exactly 2 sub expressions, got {}",
                cond.exprs.len()
            )));
        };
        let lhs = self.compile(left)?;
        let rhs = self.compile(right)?;
        let not = if exclude { "NOT " } else { "" };

        let mut clause = Fragment::default();
        if self.unnested(std::slice::from_ref(left)) {
            clause
                .push_sql(&format!("{not}len(list_filter("))
                .push(&lhs)
                .push_sql(&format!(", x -> x {not}ILIKE "))
                .push(&rhs)
                .push_sql(")) > 0");
        } else if self.dialect.capabilities().ilike {
            clause
                .push(&lhs.wrap("(", ")"))
                .push_sql(&format!(" {not}ILIKE "))
                .push(&rhs.wrap("(", ")"));
        } else {
            clause
                .push(&lhs.wrap("LOWER(", ")"))
                .push_sql(&format!(" {not}LIKE "))
                .push(&rhs.wrap("LOWER(", ")"));
        }

        if exclude {
            let mut out = clause.wrap("(", "");
            out.push_sql(" OR ").push(&lhs.wrap("(", ") IS NULL)"));
            return Ok(out);
        }
        Ok(clause)
    }

    /// Whether the leading expression is an array dimension the dialect can unnest.
    fn unnested(&self, exprs: &[Expression]) -> bool {
        if !self.dialect.capabilities().unnest {
            return false;
        }
        match exprs.first() {
            Some(Expression::Identifier(name)) => {
                self.allowed.get(name).is_some_and(|c| c.unnest)
            }
            _ => false,
        }
    }
}
