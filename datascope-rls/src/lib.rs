//! Row-Level Data Permission Engine
//!
//! Scopes every read (and the UPDATE path of owned tables) to the rows the
//! calling user may see:
//! - Access rules keyed by role and table
//! - Atomically swapped rule snapshots
//! - Request-scoped identity context
//! - SQL rewriting with ownership predicates
//! - Ownership audit for teacher writes

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auditor;
pub mod bypass;
pub mod context;
pub mod interceptor;
pub mod loader;
pub mod parser;
pub mod registry;
pub mod rewriter;
pub mod rule;

pub use auditor::{AuditRecord, OwnershipAuditor};
pub use bypass::BypassRegistry;
pub use context::{ContextValue, RequestContext};
pub use interceptor::{BoundStatement, HookChain, OwnershipAuditHook, PermissionFilterHook, StatementHook};
pub use loader::{FileRuleSource, RuleLoader, RuleSource, StaticRuleSource};
pub use parser::{SqlCommand, StatementParser};
pub use registry::{RuleRegistry, RuleSnapshot};
pub use rewriter::Rewriter;
pub use rule::{AccessRule, ContextField, FieldRule, FilterOperator, FilterType};
