//! Error types for the datascope access layer

use thiserror::Error;

/// Datascope error types
#[derive(Error, Debug)]
pub enum Error {
    // Rewriter Errors
    #[error("SQL parse error: {0}")]
    ParseError(String),

    #[error("Context field {field} is null for user {user_id}")]
    MissingContextValue { field: String, user_id: i64 },

    #[error("Subquery template error: {0}")]
    SubqueryTemplate(String),

    // Rule Errors
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Rule source error: {0}")]
    RuleSource(String),

    // Identity Errors
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Forbidden: insufficient permissions")]
    Forbidden,

    #[error("No request scope is active")]
    NoActiveScope,

    // General Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias for datascope operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP status code for each error type
impl Error {
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidIdentity(_) | Self::UnknownRole(_) => 400,

            // 403 Forbidden
            Self::Forbidden => 403,

            // 500 Internal Server Error
            Self::ParseError(_)
            | Self::MissingContextValue { .. }
            | Self::SubqueryTemplate(_)
            | Self::InvalidRule(_)
            | Self::RuleSource(_)
            | Self::NoActiveScope
            | Self::ConfigError(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Toml(_) => 500,
        }
    }

    /// Stable error code for logs and API responses
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ParseError(_) => "parse_error",
            Self::MissingContextValue { .. } => "missing_context_value",
            Self::SubqueryTemplate(_) => "subquery_template_error",
            Self::InvalidRule(_) => "invalid_rule",
            Self::UnknownRole(_) => "unknown_role",
            Self::RuleSource(_) => "rule_source_error",
            Self::InvalidIdentity(_) => "invalid_identity",
            Self::Forbidden => "forbidden",
            Self::NoActiveScope => "no_active_scope",
            Self::ConfigError(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Toml(_) => "toml_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(Error::InvalidIdentity("x".into()).status_code(), 400);
        assert_eq!(Error::Forbidden.status_code(), 403);
        assert_eq!(Error::ParseError("x".into()).status_code(), 500);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::MissingContextValue {
                field: "teacherId".into(),
                user_id: 7
            }
            .error_code(),
            "missing_context_value"
        );
        assert_eq!(Error::NoActiveScope.error_code(), "no_active_scope");
    }

    #[test]
    fn test_missing_context_message() {
        let err = Error::MissingContextValue {
            field: "teacherId".into(),
            user_id: 7,
        };
        assert_eq!(err.to_string(), "Context field teacherId is null for user 7");
    }
}
