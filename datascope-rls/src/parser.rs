//! SQL parsing for the rewriter and auditor

use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use datascope_common::config::{RlsConfig, SqlDialect};
use datascope_common::{Error, Result};

/// Dialect-aware statement parser with a bounded nesting depth
#[derive(Debug, Clone, Copy)]
pub struct StatementParser {
    dialect: SqlDialect,
    recursion_limit: usize,
}

impl StatementParser {
    pub fn new(dialect: SqlDialect, recursion_limit: usize) -> Self {
        Self {
            dialect,
            recursion_limit,
        }
    }

    pub fn from_config(config: &RlsConfig) -> Self {
        Self::new(config.dialect, config.recursion_limit)
    }

    /// Parse `sql` into one or more statements
    ///
    /// # Errors
    /// Returns `ParseError` for invalid SQL, input nested deeper than the
    /// recursion limit, or input without any statement.
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>> {
        let statements = self.with_dialect(|dialect| {
            Parser::new(dialect)
                .with_recursion_limit(self.recursion_limit)
                .try_with_sql(sql)
                .and_then(|mut parser| parser.parse_statements())
                .map_err(|e| Error::ParseError(e.to_string()))
        })?;

        if statements.is_empty() {
            return Err(Error::ParseError("No statements".to_string()));
        }

        Ok(statements)
    }

    /// One entry per unquoted `LIMIT` keyword in source order: `true` when
    /// it is written in the MySQL `LIMIT offset, count` form.
    ///
    /// MySQL only accepts a literal or a placeholder as a limit, so the
    /// token right after the first operand decides the form.
    pub fn limit_forms(&self, sql: &str) -> Vec<bool> {
        let Ok(tokens) = self.with_dialect(|dialect| Tokenizer::new(dialect, sql).tokenize()) else {
            return Vec::new();
        };

        let mut significant = tokens
            .iter()
            .filter(|token| !matches!(token, Token::Whitespace(_)));
        let mut forms = Vec::new();
        while let Some(token) = significant.next() {
            if let Token::Word(word) = token {
                if word.keyword == Keyword::LIMIT && word.quote_style.is_none() {
                    let _operand = significant.next();
                    forms.push(matches!(significant.next(), Some(Token::Comma)));
                }
            }
        }
        forms
    }

    fn with_dialect<T>(&self, f: impl FnOnce(&dyn Dialect) -> T) -> T {
        match self.dialect {
            SqlDialect::Generic => f(&GenericDialect {}),
            SqlDialect::MySql => f(&MySqlDialect {}),
            SqlDialect::Postgres => f(&PostgreSqlDialect {}),
        }
    }
}

impl Default for StatementParser {
    fn default() -> Self {
        Self::from_config(&RlsConfig::default())
    }
}

/// SQL command type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCommand {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl SqlCommand {
    /// Command of a parsed statement
    pub fn of(statement: &Statement) -> Self {
        match statement {
            Statement::Query(_) => SqlCommand::Select,
            Statement::Insert { .. } => SqlCommand::Insert,
            Statement::Update { .. } => SqlCommand::Update,
            Statement::Delete { .. } => SqlCommand::Delete,
            _ => SqlCommand::Other,
        }
    }

    /// Detect the command from raw text, for input the parser rejected
    pub fn detect(sql: &str) -> Self {
        let sql_upper = sql.trim_start().to_uppercase();

        if sql_upper.starts_with("SELECT") || sql_upper.starts_with("WITH") {
            SqlCommand::Select
        } else if sql_upper.starts_with("INSERT") || sql_upper.starts_with("REPLACE") {
            SqlCommand::Insert
        } else if sql_upper.starts_with("UPDATE") {
            SqlCommand::Update
        } else if sql_upper.starts_with("DELETE") {
            SqlCommand::Delete
        } else {
            SqlCommand::Other
        }
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, SqlCommand::Insert | SqlCommand::Update | SqlCommand::Delete)
    }
}
