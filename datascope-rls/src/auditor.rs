//! Ownership audit for writes to teacher-owned tables

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlparser::ast::{visit_relations, BinaryOperator, Expr, Ident, Statement, TableFactor, Value};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, info, warn};

use datascope_common::config::RlsConfig;
use datascope_common::RoleType;

use crate::context::RequestContext;
use crate::parser::{SqlCommand, StatementParser};
use crate::registry::RuleRegistry;

/// One audited write
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub user_id: i64,
    pub teacher_id: Option<i64>,
    /// Sensitive table the statement writes to
    pub table: String,
    pub command: String,
    /// Whether an ownership predicate covers this write
    pub filter_applied: bool,
    pub at: DateTime<Utc>,
}

/// Records teacher writes to sensitive tables.
///
/// The auditor never changes a statement; enforcement is the rewriter's
/// job. It confirms that the rewriter's ownership predicate applies and
/// logs one line per write under the `datascope::audit` target.
pub struct OwnershipAuditor {
    registry: Arc<RuleRegistry>,
    parser: StatementParser,
    sensitive_tables: HashSet<String>,
}

impl OwnershipAuditor {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self::from_config(registry, &RlsConfig::default())
    }

    pub fn from_config(registry: Arc<RuleRegistry>, config: &RlsConfig) -> Self {
        Self {
            registry,
            parser: StatementParser::from_config(config),
            sensitive_tables: config
                .sensitive_tables
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Audit a write statement issued under `context`.
    ///
    /// Returns `None` for reads, bypassed or non-teacher contexts, and
    /// statements that do not touch a sensitive table.
    pub fn audit(&self, sql: &str, context: Option<&RequestContext>) -> Option<AuditRecord> {
        let context = context?;
        if context.ignore_permission_filter || context.role != RoleType::Teacher {
            return None;
        }

        let (command, table, filter_applied) = match self.parser.parse(sql) {
            Ok(statements) => {
                let statement = statements.first()?;
                let table = self.write_target(statement)?;
                (SqlCommand::of(statement), table, self.ownership_covered(statement, context))
            }
            Err(e) => {
                debug!(error = %e, "Audit falling back to text scan");
                (SqlCommand::detect(sql), self.mentioned_table(sql)?, false)
            }
        };

        if !command.is_write() {
            return None;
        }

        let record = AuditRecord {
            user_id: context.user_id,
            teacher_id: context.teacher_id,
            table,
            command: format!("{command:?}").to_uppercase(),
            filter_applied,
            at: Utc::now(),
        };

        if record.filter_applied {
            info!(
                target: "datascope::audit",
                user_id = record.user_id,
                teacher_id = ?record.teacher_id,
                table = %record.table,
                command = %record.command,
                "Ownership validation: teacher write scoped to own rows"
            );
        } else {
            warn!(
                target: "datascope::audit",
                user_id = record.user_id,
                teacher_id = ?record.teacher_id,
                table = %record.table,
                command = %record.command,
                "Ownership validation: teacher write not covered by an ownership filter"
            );
        }

        Some(record)
    }

    /// Whether `statement` is a single-table UPDATE whose WHERE requires the
    /// owner column to match the caller
    fn ownership_covered(&self, statement: &Statement, context: &RequestContext) -> bool {
        let Statement::Update {
            table,
            selection: Some(selection),
            ..
        } = statement
        else {
            return false;
        };
        if !table.joins.is_empty() {
            return false;
        }
        let TableFactor::Table { name, alias, .. } = &table.relation else {
            return false;
        };
        let Some(target) = name.0.last() else {
            return false;
        };
        let Some(rule) = self.registry.get(context.role, &target.value) else {
            return false;
        };
        let Some(value) = context.value_of(rule.context_field) else {
            return false;
        };

        let owner = OwnerColumn {
            qualifier: alias.as_ref().map_or(target, |a| &a.name),
            table: target,
            field: &rule.field_name,
        };
        let mut terms = Vec::new();
        conjuncts(selection, &mut terms);
        terms
            .into_iter()
            .any(|term| owner.is_restricted_by(term, value.as_i64()))
    }

    fn is_sensitive(&self, table: &str) -> bool {
        self.sensitive_tables.contains(&table.to_ascii_lowercase())
    }

    /// First sensitive table the statement writes to or reads from
    fn write_target(&self, statement: &Statement) -> Option<String> {
        if let Statement::Update { table, .. } = statement {
            if let TableFactor::Table { name, .. } = &table.relation {
                let target = name.0.last()?.value.clone();
                return self.is_sensitive(&target).then_some(target);
            }
        }

        let found = visit_relations(statement, |relation| {
            match relation.0.last() {
                Some(ident) if self.is_sensitive(&ident.value) => ControlFlow::Break(ident.value.clone()),
                _ => ControlFlow::Continue(()),
            }
        });

        match found {
            ControlFlow::Break(table) => Some(table),
            ControlFlow::Continue(()) => None,
        }
    }

    fn mentioned_table(&self, sql: &str) -> Option<String> {
        let lowered = sql.to_ascii_lowercase();
        lowered
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .find(|word| self.sensitive_tables.contains(*word))
            .map(ToString::to_string)
    }
}

/// The owner column of an UPDATE target
struct OwnerColumn<'a> {
    qualifier: &'a Ident,
    table: &'a Ident,
    field: &'a str,
}

impl OwnerColumn<'_> {
    fn matches(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Identifier(ident) => ident.value.eq_ignore_ascii_case(self.field),
            Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [.., qualifier, field] => {
                    field.value.eq_ignore_ascii_case(self.field)
                        && (qualifier.value.eq_ignore_ascii_case(&self.qualifier.value)
                            || qualifier.value.eq_ignore_ascii_case(&self.table.value))
                }
                _ => false,
            },
            Expr::Nested(inner) => self.matches(inner),
            _ => false,
        }
    }

    /// `col = v`, `col IN (v)` or `col IN (subquery)`
    fn is_restricted_by(&self, term: &Expr, value: i64) -> bool {
        match term {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => {
                (self.matches(left) && is_number(right, value))
                    || (self.matches(right) && is_number(left, value))
            }
            Expr::InList {
                expr,
                list,
                negated: false,
            } => self.matches(expr) && !list.is_empty() && list.iter().all(|v| is_number(v, value)),
            Expr::InSubquery {
                expr,
                negated: false,
                ..
            } => self.matches(expr),
            _ => false,
        }
    }
}

fn is_number(expr: &Expr, value: i64) -> bool {
    matches!(expr, Expr::Value(Value::Number(n, _)) if n.parse::<i64>() == Ok(value))
}

/// Flatten the top-level AND chain of a condition
fn conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            conjuncts(left, out);
            conjuncts(right, out);
        }
        Expr::Nested(inner) => conjuncts(inner, out),
        other => out.push(other),
    }
}
