//! Access rule definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use datascope_common::{Error, Result, RoleType};

use crate::context::ContextValue;

/// Comparison used by a simple filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterOperator {
    #[default]
    #[serde(rename = "EQ", alias = "=", alias = "eq")]
    Eq,
    #[serde(rename = "IN", alias = "in")]
    In,
}

/// How the predicate is shaped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterType {
    /// `column <op> value`
    #[default]
    Simple,
    /// `column IN (<template with the value substituted>)`
    Subquery,
}

/// Attribute of the caller used as the comparison value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextField {
    UserId,
    StudentId,
    TeacherId,
}

impl ContextField {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextField::UserId => "userId",
            ContextField::StudentId => "studentId",
            ContextField::TeacherId => "teacherId",
        }
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "userId" | "user_id" => Ok(ContextField::UserId),
            "studentId" | "student_id" => Ok(ContextField::StudentId),
            "teacherId" | "teacher_id" => Ok(ContextField::TeacherId),
            other => Err(Error::InvalidRule(format!("unknown context field '{other}'"))),
        }
    }
}

/// Persisted access rule, one row of the rule table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Role the rule applies to
    pub role: RoleType,
    /// Table the rule guards
    pub table: String,
    /// Entity the table maps to (informational)
    #[serde(default)]
    pub entity_name: String,
    /// Column compared against the caller (e.g. `student_id`)
    pub filter_field: String,
    #[serde(default)]
    pub filter_operator: FilterOperator,
    /// Caller attribute supplying the value (e.g. `studentId`)
    pub context_field: String,
    #[serde(default)]
    pub filter_type: FilterType,
    /// Select with `?` placeholders, only for `SUBQUERY` rules
    #[serde(default)]
    pub subquery_template: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

impl AccessRule {
    /// Create an enabled `SIMPLE`/`EQ` rule
    pub fn new(role: RoleType, table: &str, filter_field: &str, context_field: &str) -> Self {
        Self {
            role,
            table: table.to_string(),
            entity_name: String::new(),
            filter_field: filter_field.to_string(),
            filter_operator: FilterOperator::Eq,
            context_field: context_field.to_string(),
            filter_type: FilterType::Simple,
            subquery_template: None,
            enabled: true,
            description: String::new(),
        }
    }

    /// Set the comparison operator
    #[must_use]
    pub fn with_operator(mut self, operator: FilterOperator) -> Self {
        self.filter_operator = operator;
        self
    }

    /// Turn the rule into a `SUBQUERY` rule using `template`
    #[must_use]
    pub fn with_subquery(mut self, template: &str) -> Self {
        self.filter_type = FilterType::Subquery;
        self.subquery_template = Some(template.to_string());
        self
    }

    #[must_use]
    pub fn with_entity(mut self, entity_name: &str) -> Self {
        self.entity_name = entity_name.to_string();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Mark the rule disabled
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check required fields and the template/filter type pairing
    ///
    /// # Errors
    /// Returns `InvalidRule` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(Error::InvalidRule("table name must not be empty".into()));
        }
        if self.filter_field.trim().is_empty() {
            return Err(Error::InvalidRule(format!(
                "{}:{} has an empty filter field",
                self.role, self.table
            )));
        }
        if self.context_field.trim().is_empty() {
            return Err(Error::InvalidRule(format!(
                "{}:{} has an empty context field",
                self.role, self.table
            )));
        }
        self.context_field.parse::<ContextField>()?;

        if self.filter_type == FilterType::Subquery
            && self
                .subquery_template
                .as_deref()
                .map_or(true, |t| t.trim().is_empty())
        {
            return Err(Error::InvalidRule(format!(
                "{}:{} is a SUBQUERY rule without a template",
                self.role, self.table
            )));
        }

        Ok(())
    }
}

/// Subquery text with `?` placeholders for the caller's value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubqueryTemplate(String);

impl SubqueryTemplate {
    pub fn new(template: &str) -> Self {
        Self(template.trim().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute every placeholder with `value`.
    ///
    /// Only a [`ContextValue`] can be substituted, and those are only ever
    /// produced from the server-side request context.
    #[must_use]
    pub fn render(&self, value: &ContextValue) -> String {
        self.0.replace('?', &value.to_string())
    }
}

/// Resolved rule as served by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub field_name: String,
    pub operator: FilterOperator,
    pub context_field: ContextField,
    pub filter_type: FilterType,
    pub subquery_template: Option<SubqueryTemplate>,
}

impl TryFrom<&AccessRule> for FieldRule {
    type Error = Error;

    fn try_from(rule: &AccessRule) -> Result<Self> {
        rule.validate()?;

        Ok(Self {
            field_name: rule.filter_field.trim().to_string(),
            operator: rule.filter_operator,
            context_field: rule.context_field.parse()?,
            filter_type: rule.filter_type,
            subquery_template: match rule.filter_type {
                FilterType::Subquery => rule.subquery_template.as_deref().map(SubqueryTemplate::new),
                FilterType::Simple => None,
            },
        })
    }
}
