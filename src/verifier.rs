//! Verifier
//!
//! Post-execution semantic check. Rows are taken as evidence the statement
//! is sound; an empty or failed result triggers structural analysis of the
//! parsed SQL.

use crate::db::QueryRows;
use crate::error_code::ErrorCode;
use crate::stages::{Verification, VerifyStage};
use crate::types::{StageFailure, StageName, StageResult, StageTrace};
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, GroupByExpr, Query, SelectItem, SetExpr,
    Statement,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::time::Instant;
use tracing::{debug, warn};

pub const AGGREGATION_WITHOUT_GROUP_BY: &str = "aggregation_without_group_by";

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "total",
    "group_concat",
    "string_agg",
    "array_agg",
    "stddev",
    "variance",
];

/// What an unparseable statement counts as
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseFailurePolicy {
    /// Report `parse_error` and fail verification
    #[default]
    Unverified,
    /// Treat as verified, noting `skipped`
    Skip,
}

#[derive(Debug, Clone, Default)]
pub struct Verifier {
    parse_failure: ParseFailurePolicy,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parse_failure_policy(mut self, policy: ParseFailurePolicy) -> Self {
        self.parse_failure = policy;
        self
    }

    pub fn run(
        &self,
        sql: &str,
        exec_result: &StageResult<QueryRows>,
    ) -> StageResult<Verification> {
        let started = Instant::now();

        let rows = match exec_result.data() {
            Some(rows) => rows,
            None => {
                let reason = if exec_result.error_code() == Some(ErrorCode::PipelineCrash) {
                    "exec_exception"
                } else {
                    "exec_error"
                };
                let trace = StageTrace::new(StageName::Verifier, started.elapsed())
                    .with_note("reason", reason);
                return StageResult::failure(
                    StageFailure::new(format!("{}: execution did not produce a result", reason)),
                    Some(trace),
                );
            }
        };

        if !rows.is_empty() {
            let trace = StageTrace::new(StageName::Verifier, started.elapsed())
                .with_note("row_count", rows.row_count());
            return StageResult::success(Verification { verified: true }, trace);
        }

        let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
            Ok(statements) => statements,
            Err(e) => return self.parse_failed(started, e.to_string()),
        };

        let issues = structural_issues(&statements);
        let elapsed = started.elapsed();
        if issues.is_empty() {
            debug!("Verified empty result structurally");
            let trace = StageTrace::new(StageName::Verifier, elapsed);
            StageResult::success(Verification { verified: true }, trace)
        } else {
            warn!("Verification issues: {:?}", issues);
            let trace = StageTrace::new(StageName::Verifier, elapsed)
                .with_note("issues", issues.clone());
            StageResult::failure(
                StageFailure {
                    errors: issues,
                    code: None,
                },
                Some(trace),
            )
        }
    }

    fn parse_failed(&self, started: Instant, message: String) -> StageResult<Verification> {
        match self.parse_failure {
            ParseFailurePolicy::Skip => {
                debug!("Verifier could not parse SQL, skipping: {}", message);
                let trace = StageTrace::new(StageName::Verifier, started.elapsed())
                    .with_note("skipped", message);
                StageResult::success(Verification { verified: true }, trace)
            }
            ParseFailurePolicy::Unverified => {
                warn!("Verifier could not parse SQL: {}", message);
                let trace = StageTrace::new(StageName::Verifier, started.elapsed())
                    .with_note("parse_error", message.clone());
                StageResult::failure(
                    StageFailure::new(format!("parse_error: {}", message)),
                    Some(trace),
                )
            }
        }
    }
}

impl VerifyStage for Verifier {
    fn verify(&self, sql: &str, exec_result: &StageResult<QueryRows>) -> StageResult<Verification> {
        self.run(sql, exec_result)
    }
}

fn structural_issues(statements: &[Statement]) -> Vec<String> {
    let mut issues = Vec::new();
    for statement in statements {
        if let Statement::Query(query) = statement {
            check_query(query, &mut issues);
        }
    }
    issues.dedup();
    issues
}

fn check_query(query: &Query, issues: &mut Vec<String>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            check_query(&cte.query, issues);
        }
    }
    check_set_expr(&query.body, issues);
}

fn check_set_expr(body: &SetExpr, issues: &mut Vec<String>) {
    match body {
        SetExpr::Select(select) => {
            let grouped = match &select.group_by {
                GroupByExpr::All => true,
                GroupByExpr::Expressions(exprs) => !exprs.is_empty(),
            };
            if grouped {
                return;
            }

            let mut shape = ProjectionShape::default();
            for item in &select.projection {
                match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                        shape.visit(expr)
                    }
                    SelectItem::Wildcard(..) | SelectItem::QualifiedWildcard(..) => {
                        shape.bare_column = true
                    }
                }
            }
            if shape.aggregate && shape.bare_column {
                issues.push(AGGREGATION_WITHOUT_GROUP_BY.to_string());
            }
        }
        SetExpr::Query(query) => check_query(query, issues),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left, issues);
            check_set_expr(right, issues);
        }
        _ => {}
    }
}

/// Whether a projection mixes aggregates with per-row columns
#[derive(Debug, Default)]
struct ProjectionShape {
    aggregate: bool,
    bare_column: bool,
}

impl ProjectionShape {
    fn visit(&mut self, expr: &Expr) {
        match expr {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => self.bare_column = true,
            Expr::Function(func) => {
                if func.over.is_none() && is_aggregate(func) {
                    // columns inside the aggregate are not per-row
                    self.aggregate = true;
                    return;
                }
                for arg in &func.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                        | FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(e),
                            ..
                        } => self.visit(e),
                        _ => {}
                    }
                }
            }
            Expr::Nested(e)
            | Expr::UnaryOp { expr: e, .. }
            | Expr::Cast { expr: e, .. }
            | Expr::IsNull(e)
            | Expr::IsNotNull(e) => self.visit(e),
            Expr::BinaryOp { left, right, .. } => {
                self.visit(left);
                self.visit(right);
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(op) = operand {
                    self.visit(op);
                }
                for e in conditions.iter().chain(results.iter()) {
                    self.visit(e);
                }
                if let Some(e) = else_result {
                    self.visit(e);
                }
            }
            Expr::Between { expr, low, high, .. } => {
                self.visit(expr);
                self.visit(low);
                self.visit(high);
            }
            Expr::InList { expr, list, .. } => {
                self.visit(expr);
                for e in list {
                    self.visit(e);
                }
            }
            // scalar subqueries and literals are constant per row
            _ => {}
        }
    }
}

fn is_aggregate(func: &Function) -> bool {
    let name = match func.name.0.last() {
        Some(ident) => ident.value.to_lowercase(),
        None => return false,
    };
    if !AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
        return false;
    }
    // sqlite's multi-argument min/max are scalar
    !(matches!(name.as_str(), "min" | "max") && func.args.len() > 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_rows() -> StageResult<QueryRows> {
        let trace = StageTrace::new(StageName::Executor, std::time::Duration::ZERO);
        StageResult::success(QueryRows::default(), trace)
    }

    fn verify(sql: &str) -> StageResult<Verification> {
        Verifier::new().run(sql, &empty_rows())
    }

    #[test]
    fn test_rows_present_is_verified() {
        let exec = StageResult::success(
            QueryRows {
                columns: vec!["c".into()],
                rows: vec![vec![serde_json::json!(1)]],
            },
            StageTrace::new(StageName::Executor, std::time::Duration::ZERO),
        );
        let result = Verifier::new().run("SELECT COUNT(*), country FROM customers", &exec);
        assert_eq!(result.data(), Some(&Verification { verified: true }));
    }

    #[test]
    fn test_flags_aggregation_without_group_by() {
        let result = verify("SELECT COUNT(*), country FROM customers;");
        assert!(!result.is_ok());
        assert_eq!(result.errors(), &[AGGREGATION_WITHOUT_GROUP_BY.to_string()]);
        assert!(result.trace().unwrap().note("issues").is_some());
    }

    #[test]
    fn test_grouped_and_pure_aggregates_pass() {
        assert!(verify("SELECT country, COUNT(*) FROM customers GROUP BY country").is_ok());
        assert!(verify("SELECT COUNT(*) FROM customers").is_ok());
        assert!(verify("SELECT COUNT(DISTINCT country) FROM customers").is_ok());
        assert!(verify("SELECT DISTINCT COUNT(*) FROM customers").is_ok());
        assert!(verify("SELECT COUNT(*) + 1 AS n FROM customers").is_ok());
    }

    #[test]
    fn test_window_functions_are_not_aggregates() {
        assert!(
            verify("SELECT country, COUNT(*) OVER (PARTITION BY country) FROM customers").is_ok()
        );
        assert!(verify("SELECT name, MAX(a, b) FROM t").is_ok());
    }

    #[test]
    fn test_nested_selects_are_checked() {
        let result = verify("WITH c AS (SELECT name, SUM(total) FROM orders) SELECT * FROM c");
        assert!(!result.is_ok());
        let result = verify("SELECT id FROM a UNION SELECT MAX(id), name FROM b");
        assert!(!result.is_ok());
    }

    #[test]
    fn test_parse_failure_policies() {
        let unverified = verify("SELEC broken FROM");
        assert!(!unverified.is_ok());
        assert!(unverified.errors()[0].starts_with("parse_error"));
        assert!(unverified.trace().unwrap().note("parse_error").is_some());

        let skipped = Verifier::new()
            .with_parse_failure_policy(ParseFailurePolicy::Skip)
            .run("SELEC broken FROM", &empty_rows());
        assert_eq!(skipped.data(), Some(&Verification { verified: true }));
        assert!(skipped.trace().unwrap().note("skipped").is_some());
    }

    #[test]
    fn test_execution_failures_are_reported() {
        let failed: StageResult<QueryRows> = StageResult::failure(
            StageFailure::new("no such table: x").with_code(ErrorCode::PlanNoSuchTable),
            None,
        );
        let result = Verifier::new().run("SELECT * FROM x", &failed);
        assert_eq!(result.trace().unwrap().note("reason"), Some(&serde_json::json!("exec_error")));

        let crashed: StageResult<QueryRows> =
            StageResult::failure(StageFailure::crash(StageName::Executor, "boom"), None);
        let result = Verifier::new().run("SELECT * FROM x", &crashed);
        assert_eq!(
            result.trace().unwrap().note("reason"),
            Some(&serde_json::json!("exec_exception"))
        );
    }
}
