//! Pre-read and pre-write hooks for the query pipeline

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

use crate::auditor::{AuditRecord, OwnershipAuditor};
use crate::bypass::BypassRegistry;
use crate::context;
use crate::rewriter::Rewriter;

/// A statement on its way to the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundStatement {
    /// Identifier of the issuing data-access method, used for bypass lookup
    pub operation: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

impl BoundStatement {
    pub fn new(operation: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Vec<serde_json::Value>) -> Self {
        self.params = params;
        self
    }
}

/// Integration point invoked by the query pipeline.
///
/// Both methods default to passing the statement through.
pub trait StatementHook: Send + Sync {
    fn before_read(&self, statement: BoundStatement) -> BoundStatement {
        statement
    }

    fn before_write(&self, statement: BoundStatement) -> BoundStatement {
        statement
    }
}

/// Injects row filters using the current request context
pub struct PermissionFilterHook {
    rewriter: Arc<Rewriter>,
    bypass: Arc<BypassRegistry>,
    enabled: bool,
}

impl PermissionFilterHook {
    pub fn new(rewriter: Arc<Rewriter>, bypass: Arc<BypassRegistry>) -> Self {
        Self {
            rewriter,
            bypass,
            enabled: true,
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn skips(&self, statement: &BoundStatement) -> bool {
        if !self.enabled {
            return true;
        }
        if self.bypass.is_bypassed(&statement.operation) {
            trace!(operation = %statement.operation, "Per-call bypass, skipping filter");
            return true;
        }
        context::is_permission_filter_ignored()
    }
}

impl StatementHook for PermissionFilterHook {
    fn before_read(&self, mut statement: BoundStatement) -> BoundStatement {
        if self.skips(&statement) {
            return statement;
        }
        let ctx = context::current();
        statement.sql = self.rewriter.rewrite(&statement.sql, ctx.as_ref());
        statement
    }

    fn before_write(&self, mut statement: BoundStatement) -> BoundStatement {
        if self.skips(&statement) {
            return statement;
        }
        let ctx = context::current();
        statement.sql = self.rewriter.rewrite_write(&statement.sql, ctx.as_ref());
        statement
    }
}

/// Records teacher writes to sensitive tables; never alters the statement
pub struct OwnershipAuditHook {
    auditor: Arc<OwnershipAuditor>,
    bypass: Arc<BypassRegistry>,
    enabled: bool,
}

impl OwnershipAuditHook {
    pub fn new(auditor: Arc<OwnershipAuditor>, bypass: Arc<BypassRegistry>) -> Self {
        Self {
            auditor,
            bypass,
            enabled: true,
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Audit `statement` under the current request context.
    ///
    /// Returns `None` when the hook is disabled or the operation is
    /// registered for per-call bypass.
    pub fn audit(&self, statement: &BoundStatement) -> Option<AuditRecord> {
        if !self.enabled || self.bypass.is_bypassed(&statement.operation) {
            return None;
        }
        let ctx = context::current();
        self.auditor.audit(&statement.sql, ctx.as_ref())
    }
}

impl StatementHook for OwnershipAuditHook {
    fn before_write(&self, statement: BoundStatement) -> BoundStatement {
        self.audit(&statement);
        statement
    }
}

/// Ordered list of hooks
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn StatementHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, hook: Arc<dyn StatementHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn before_read(&self, statement: BoundStatement) -> BoundStatement {
        self.hooks
            .iter()
            .fold(statement, |statement, hook| hook.before_read(statement))
    }

    pub fn before_write(&self, statement: BoundStatement) -> BoundStatement {
        self.hooks
            .iter()
            .fold(statement, |statement, hook| hook.before_write(statement))
    }
}
