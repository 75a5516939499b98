//! Configuration types for the datascope access layer

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Main configuration for the access layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataScopeConfig {
    /// Statement rewriting configuration
    pub rls: RlsConfig,
    /// Rule source configuration
    pub rules: RulesConfig,
    /// Per-call bypass registrations
    pub bypass: Vec<BypassEntry>,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// HTTP surface configuration
    pub server: ServerConfig,
}

impl DataScopeConfig {
    /// Load configuration from a TOML or JSON file, chosen by extension
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read {}: {}", path.display(), e)))?;

        let config = if path.extension().map_or(false, |ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        Ok(config)
    }
}

/// SQL dialect used to parse outgoing statements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Generic,
    #[default]
    MySql,
    Postgres,
}

/// Row-level filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RlsConfig {
    /// Master switch; when off both hooks pass statements through
    pub enabled: bool,
    /// Dialect for the SQL parser
    pub dialect: SqlDialect,
    /// Maximum expression nesting accepted by the parser
    pub recursion_limit: usize,
    /// Tables whose writes are rewritten and audited
    pub sensitive_tables: Vec<String>,
}

impl Default for RlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dialect: SqlDialect::default(),
            recursion_limit: 50,
            sensitive_tables: vec!["course_info".to_string()],
        }
    }
}

/// Rule source configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// File holding the rule list (TOML `[[rules]]` or a JSON array)
    pub path: Option<PathBuf>,
}

/// A single per-call bypass registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassEntry {
    /// Operation identifier, e.g. `CourseMapper.selectTimetable`
    pub operation: String,
    /// Why the operation already scopes itself
    #[serde(default)]
    pub reason: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
        }
    }
}
