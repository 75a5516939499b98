//! SQL statement rewriter for row-level filter injection

use sqlparser::ast::{
    BinaryOperator, Expr, Ident, ObjectName, OffsetRows, Query, Select, SetExpr, SetOperator,
    Statement, TableFactor, TableWithJoins, Value, VisitMut, VisitorMut,
};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, error, warn};

use datascope_common::config::RlsConfig;
use datascope_common::{Error, Result};

use crate::context::{ContextValue, RequestContext};
use crate::parser::StatementParser;
use crate::registry::{RuleRegistry, RuleSnapshot};
use crate::rule::{FieldRule, FilterOperator, FilterType};

/// Rewrites outgoing statements so they only reach rows the caller owns.
///
/// Rewriting is fail-open on availability: a statement that cannot be
/// parsed, or a rule that cannot be applied, leaves the statement (or that
/// one table) unfiltered instead of failing the request. Injected
/// predicates are always ANDed, so a rewrite can only narrow a result.
pub struct Rewriter {
    registry: Arc<RuleRegistry>,
    parser: StatementParser,
    sensitive_tables: HashSet<String>,
}

impl Rewriter {
    /// Create a rewriter with the default configuration
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

    #[must_use]
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Check if writes to `table` go through the reduced UPDATE path
    #[must_use]
    pub fn is_sensitive(&self, table: &str) -> bool {
        self.sensitive_tables.contains(&table.to_ascii_lowercase())
    }

    /// Rewrite a read statement.
    ///
    /// Returns `sql` unchanged (byte for byte) when there is no context,
    /// the context bypasses filtering, the statement cannot be parsed, or
    /// no rule applies.
    pub fn rewrite(&self, sql: &str, context: Option<&RequestContext>) -> String {
        let Some(context) = context.filter(|ctx| !ctx.bypasses_filter()) else {
            return sql.to_string();
        };

        let mut statements = match self.parser.parse(sql) {
            Ok(statements) => statements,
            Err(e) => {
                error!(error = %e, sql, "Failed to parse SQL for data permission");
                return sql.to_string();
            }
        };

        keep_comma_limits(&mut statements, &self.parser.limit_forms(sql));

        let snapshot = self.registry.snapshot();
        let scope = FilterScope {
            context,
            snapshot: &snapshot,
            parser: &self.parser,
        };

        let mut changed = false;
        for statement in &mut statements {
            if let Statement::Query(query) = statement {
                changed |= scope.filter_query(query, &HashSet::new());
            }
        }

        render(sql, &statements, changed)
    }

    /// Rewrite a write statement.
    ///
    /// Only single-table UPDATEs of a sensitive table are filtered; the
    /// predicate is built exactly as for reads, against the UPDATE target.
    pub fn rewrite_write(&self, sql: &str, context: Option<&RequestContext>) -> String {
        let Some(context) = context.filter(|ctx| !ctx.bypasses_filter()) else {
            return sql.to_string();
        };

        let lowered = sql.to_ascii_lowercase();
        if !self.sensitive_tables.iter().any(|t| lowered.contains(t.as_str())) {
            return sql.to_string();
        }

        let mut statements = match self.parser.parse(sql) {
            Ok(statements) => statements,
            Err(e) => {
                error!(error = %e, sql, "Failed to parse SQL for data permission");
                return sql.to_string();
            }
        };

        let snapshot = self.registry.snapshot();
        let scope = FilterScope {
            context,
            snapshot: &snapshot,
            parser: &self.parser,
        };

        let mut changed = false;
        for statement in &mut statements {
            if let Statement::Update {
                table, selection, ..
            } = statement
            {
                changed |= scope.filter_update(table, selection, &self.sensitive_tables);
            }
        }

        render(sql, &statements, changed)
    }
}

fn render(original: &str, statements: &[Statement], changed: bool) -> String {
    if !changed {
        return original.to_string();
    }

    let rewritten = statements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");

    debug!(original, rewritten = %rewritten, "Applied data permission filter");
    rewritten
}

/// Keep MySQL `LIMIT offset, count` in its written order.
///
/// sqlparser renders it as `LIMIT count OFFSET offset`, which would bind
/// positional placeholders to the wrong values. `forms` comes from
/// [`StatementParser::limit_forms`]; queries are matched to it in the order
/// their `LIMIT` clauses close, and nothing is touched if the counts differ.
fn keep_comma_limits(statements: &mut [Statement], forms: &[bool]) {
    if !forms.contains(&true) {
        return;
    }

    let mut counter = CommaLimits { forms, seen: 0, apply: false };
    for statement in statements.iter_mut() {
        let _ = statement.visit(&mut counter);
    }
    if counter.seen != forms.len() {
        debug!(expected = forms.len(), found = counter.seen, "LIMIT clauses did not line up, keeping OFFSET form");
        return;
    }

    let mut merger = CommaLimits { forms, seen: 0, apply: true };
    for statement in statements.iter_mut() {
        let _ = statement.visit(&mut merger);
    }
}

struct CommaLimits<'a> {
    forms: &'a [bool],
    seen: usize,
    apply: bool,
}

impl VisitorMut for CommaLimits<'_> {
    type Break = ();

    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        if query.limit.is_none() {
            return ControlFlow::Continue(());
        }
        if self.apply && self.forms.get(self.seen) == Some(&true) {
            merge_comma_limit(query);
        }
        self.seen += 1;
        ControlFlow::Continue(())
    }
}

fn merge_comma_limit(query: &mut Query) {
    let merged = match (&query.limit, &query.offset) {
        (Some(count), Some(offset)) if offset.rows == OffsetRows::None => {
            format!("{}, {count}", offset.value)
        }
        _ => return,
    };
    query.limit = Some(Expr::Identifier(Ident::new(merged)));
    query.offset = None;
}

/// A direct table reference at one select level
struct TableRef {
    name: ObjectName,
    alias: Option<Ident>,
}

impl TableRef {
    /// Unqualified reference whose name a `WITH` clause in scope defines
    fn is_cte(&self, ctes: &HashSet<String>) -> bool {
        self.name.0.len() == 1 && ctes.contains(&self.table_name().to_ascii_lowercase())
    }

    fn table_name(&self) -> String {
        self.name
            .0
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_default()
    }

    /// `alias.field`, `table.field`, or a bare `field` when the level has a
    /// single unaliased table
    fn column(&self, field: &str, qualify: bool) -> Expr {
        let field = Ident::new(field);
        match &self.alias {
            Some(alias) => Expr::CompoundIdentifier(vec![alias.clone(), field]),
            None if qualify => {
                let mut parts = self.name.0.clone();
                parts.push(field);
                Expr::CompoundIdentifier(parts)
            }
            None => Expr::Identifier(field),
        }
    }
}

/// Tables and relation count of one select level
#[derive(Default)]
struct Level {
    tables: Vec<TableRef>,
    relations: usize,
}

/// Per-statement walk state; one snapshot is pinned for the whole statement
struct FilterScope<'a> {
    context: &'a RequestContext,
    snapshot: &'a RuleSnapshot,
    parser: &'a StatementParser,
}

impl FilterScope<'_> {
    /// `ctes` holds the lowercased CTE names visible to this query
    fn filter_query(&self, query: &mut Query, ctes: &HashSet<String>) -> bool {
        let mut changed = false;
        let mut visible = ctes.clone();

        if let Some(with) = &mut query.with {
            let recursive = with.recursive;
            // a CTE body sees earlier siblings, and itself only under RECURSIVE
            for cte in &mut with.cte_tables {
                let name = cte.alias.name.value.to_ascii_lowercase();
                if recursive {
                    visible.insert(name.clone());
                }
                changed |= self.filter_query(&mut cte.query, &visible);
                visible.insert(name);
            }
        }

        changed | self.filter_set_expr(&mut query.body, &visible)
    }

    fn filter_set_expr(&self, body: &mut SetExpr, ctes: &HashSet<String>) -> bool {
        match body {
            SetExpr::Select(select) => self.filter_select(select, ctes),
            SetExpr::Query(query) => self.filter_query(query, ctes),
            // rows of the EXCEPT operand are subtracted: narrowing it would widen the result
            SetExpr::SetOperation {
                op: SetOperator::Except,
                left,
                ..
            } => self.filter_set_expr(left, ctes),
            SetExpr::SetOperation { left, right, .. } => {
                let left_changed = self.filter_set_expr(left, ctes);
                let right_changed = self.filter_set_expr(right, ctes);
                left_changed || right_changed
            }
            _ => false,
        }
    }

    fn filter_select(&self, select: &mut Select, ctes: &HashSet<String>) -> bool {
        let mut level = Level::default();
        let mut changed = false;

        for table_with_joins in &mut select.from {
            changed |= self.collect_relations(table_with_joins, &mut level, ctes);
        }

        let qualify = level.relations > 1;
        for table in &level.tables {
            if let Some(predicate) = self.predicate_for(table, qualify) {
                and_where(&mut select.selection, predicate);
                changed = true;
            }
        }

        changed
    }

    fn filter_update(
        &self,
        table: &TableWithJoins,
        selection: &mut Option<Expr>,
        sensitive_tables: &HashSet<String>,
    ) -> bool {
        if !table.joins.is_empty() {
            return false;
        }
        let TableFactor::Table { name, alias, .. } = &table.relation else {
            return false;
        };

        let target = TableRef {
            name: name.clone(),
            alias: alias.as_ref().map(|a| a.name.clone()),
        };
        if !sensitive_tables.contains(&target.table_name().to_ascii_lowercase()) {
            return false;
        }

        match self.predicate_for(&target, false) {
            Some(predicate) => {
                and_where(selection, predicate);
                true
            }
            None => false,
        }
    }

    /// Record direct tables of this level; recurse into derived tables
    fn collect_relations(
        &self,
        table_with_joins: &mut TableWithJoins,
        level: &mut Level,
        ctes: &HashSet<String>,
    ) -> bool {
        let mut changed = self.collect_factor(&mut table_with_joins.relation, level, ctes);
        for join in &mut table_with_joins.joins {
            changed |= self.collect_factor(&mut join.relation, level, ctes);
        }
        changed
    }

    fn collect_factor(&self, factor: &mut TableFactor, level: &mut Level, ctes: &HashSet<String>) -> bool {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                level.relations += 1;
                let table = TableRef {
                    name: name.clone(),
                    alias: alias.as_ref().map(|a| a.name.clone()),
                };
                // CTE bodies are filtered where they are defined
                if !table.is_cte(ctes) {
                    level.tables.push(table);
                }
                false
            }
            TableFactor::Derived { subquery, .. } => {
                level.relations += 1;
                self.filter_query(subquery, ctes)
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.collect_relations(table_with_joins, level, ctes),
            _ => {
                level.relations += 1;
                false
            }
        }
    }

    fn predicate_for(&self, table: &TableRef, qualify: bool) -> Option<Expr> {
        let table_name = table.table_name();
        let rule = self.snapshot.get(self.context.role, &table_name)?;

        let Some(value) = self.context.value_of(rule.context_field) else {
            let err = Error::MissingContextValue {
                field: rule.context_field.to_string(),
                user_id: self.context.user_id,
            };
            warn!(table = %table_name, role = %self.context.role, error = %err, "Skipping data permission filter");
            return None;
        };

        let column = table.column(&rule.field_name, qualify);
        match rule.filter_type {
            FilterType::Simple => Some(simple_predicate(column, rule.operator, value)),
            FilterType::Subquery => match self.subquery_predicate(column, rule, &value) {
                Ok(predicate) => Some(predicate),
                Err(e) => {
                    error!(table = %table_name, error = %e, "Failed to build subquery filter");
                    None
                }
            },
        }
    }

    fn subquery_predicate(&self, column: Expr, rule: &FieldRule, value: &ContextValue) -> Result<Expr> {
        let template = rule
            .subquery_template
            .as_ref()
            .ok_or_else(|| Error::SubqueryTemplate("rule has no template".to_string()))?;
        let rendered = template.render(value);

        let mut statements = self
            .parser
            .parse(&rendered)
            .map_err(|e| Error::SubqueryTemplate(format!("{}: {e}", template.as_str())))?;

        match (statements.pop(), statements.is_empty()) {
            (Some(Statement::Query(subquery)), true) => Ok(Expr::InSubquery {
                expr: Box::new(column),
                subquery,
                negated: false,
            }),
            _ => Err(Error::SubqueryTemplate(format!(
                "{}: template must be a single SELECT",
                template.as_str()
            ))),
        }
    }
}

fn number(value: ContextValue) -> Expr {
    Expr::Value(Value::Number(value.as_i64().to_string(), false))
}

fn simple_predicate(column: Expr, operator: FilterOperator, value: ContextValue) -> Expr {
    match operator {
        FilterOperator::Eq => Expr::BinaryOp {
            left: Box::new(column),
            op: BinaryOperator::Eq,
            right: Box::new(number(value)),
        },
        FilterOperator::In => Expr::InList {
            expr: Box::new(column),
            list: vec![number(value)],
            negated: false,
        },
    }
}

/// AND `predicate` onto `selection`, grouping an existing OR/XOR so the
/// new predicate narrows the whole condition
fn and_where(selection: &mut Option<Expr>, predicate: Expr) {
    *selection = Some(match selection.take() {
        None => predicate,
        Some(existing) => {
            let existing = match existing {
                Expr::BinaryOp {
                    op: BinaryOperator::Or | BinaryOperator::Xor,
                    ..
                } => Expr::Nested(Box::new(existing)),
                other => other,
            };
            Expr::BinaryOp {
                left: Box::new(existing),
                op: BinaryOperator::And,
                right: Box::new(predicate),
            }
        }
    });
}
