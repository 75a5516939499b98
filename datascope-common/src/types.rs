//! Shared identity types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Caller role as resolved by the upstream identity provider.
///
/// The set is closed: every inbound identity is exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Admin,
    Teacher,
    Student,
}

impl RoleType {
    /// All roles, in declaration order
    pub const ALL: [RoleType; 3] = [RoleType::Admin, RoleType::Teacher, RoleType::Student];

    /// Wire name of the role (`admin`, `teacher`, `student`)
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::Admin => "admin",
            RoleType::Teacher => "teacher",
            RoleType::Student => "student",
        }
    }

    /// Admin is exempt from every row-level filter
    #[must_use]
    pub fn is_admin(&self) -> bool {
        matches!(self, RoleType::Admin)
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(RoleType::Admin),
            "teacher" => Ok(RoleType::Teacher),
            "student" => Ok(RoleType::Student),
            other => Err(Error::UnknownRole(other.to_string())),
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<&Error> for ApiError {
    fn from(err: &Error) -> Self {
        Self::new(err.error_code(), err.to_string())
    }
}
