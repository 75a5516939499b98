//! Datascope: Row-Level Data Permission Layer
//!
//! Sits between business code and the database and rewrites each statement
//! so the caller only reaches the rows their role and identity allow.
//!
//! # Features
//!
//! - **Access rules** - Per role and table, loaded from a rule source
//! - **Statement rewriting** - Ownership predicates ANDed into every SELECT
//! - **Owned updates** - UPDATEs of sensitive tables scoped to the owner
//! - **Ownership audit** - Teacher writes to sensitive tables are logged
//! - **Identity propagation** - Request context bound per HTTP request

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use datascope_common as common;
pub use datascope_identity as identity;
pub use datascope_rls as rls;

pub mod http;

use std::sync::Arc;
use tracing::info;

use datascope_common::config::DataScopeConfig;
use datascope_common::error::Result;
use datascope_rls::{
    BoundStatement, BypassRegistry, FileRuleSource, HookChain, OwnershipAuditHook, OwnershipAuditor,
    PermissionFilterHook, Rewriter, RuleLoader, RuleRegistry, RuleSource, StaticRuleSource,
};

/// The assembled permission layer
pub struct DataScope {
    config: DataScopeConfig,
    registry: Arc<RuleRegistry>,
    loader: RuleLoader,
    rewriter: Arc<Rewriter>,
    auditor: Arc<OwnershipAuditor>,
    bypass: Arc<BypassRegistry>,
    hooks: HookChain,
}

impl DataScope {
    /// Create the layer with the rule source named in the configuration
    pub fn new(config: DataScopeConfig) -> Self {
        let source: Arc<dyn RuleSource> = match &config.rules.path {
            Some(path) => Arc::new(FileRuleSource::new(path)),
            None => {
                info!("No rule file configured, starting with an empty rule set");
                Arc::new(StaticRuleSource::default())
            }
        };
        Self::with_source(config, source)
    }

    /// Create the layer with an explicit rule source
    pub fn with_source(config: DataScopeConfig, source: Arc<dyn RuleSource>) -> Self {
        info!(
            enabled = config.rls.enabled,
            dialect = ?config.rls.dialect,
            "Initializing data permission layer"
        );

        let registry = Arc::new(RuleRegistry::new());
        let loader = RuleLoader::new(source, registry.clone());
        let rewriter = Arc::new(Rewriter::from_config(registry.clone(), &config.rls));
        let auditor = Arc::new(OwnershipAuditor::from_config(registry.clone(), &config.rls));
        let bypass = Arc::new(BypassRegistry::from_entries(&config.bypass));

        // filter first, so the audit sees the statement that will run
        let hooks = HookChain::new()
            .with(Arc::new(
                PermissionFilterHook::new(rewriter.clone(), bypass.clone()).enabled(config.rls.enabled),
            ))
            .with(Arc::new(
                OwnershipAuditHook::new(auditor.clone(), bypass.clone()).enabled(config.rls.enabled),
            ));

        Self {
            config,
            registry,
            loader,
            rewriter,
            auditor,
            bypass,
            hooks,
        }
    }

    /// Load rules at startup; failures leave the registry empty
    pub async fn start(&self) -> usize {
        self.loader.load_at_startup().await
    }

    /// Fetch the rule set again and swap it in
    ///
    /// # Errors
    /// Returns the rule source error; the current rules stay active.
    pub async fn reload_rules(&self) -> Result<usize> {
        self.loader.reload().await
    }

    /// Pre-read hook for the query pipeline
    pub fn before_read(&self, statement: BoundStatement) -> BoundStatement {
        self.hooks.before_read(statement)
    }

    /// Pre-write hook for the query pipeline
    pub fn before_write(&self, statement: BoundStatement) -> BoundStatement {
        self.hooks.before_write(statement)
    }

    #[must_use]
    pub fn config(&self) -> &DataScopeConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn rewriter(&self) -> &Rewriter {
        &self.rewriter
    }

    #[must_use]
    pub fn auditor(&self) -> &OwnershipAuditor {
        &self.auditor
    }

    #[must_use]
    pub fn bypass(&self) -> &BypassRegistry {
        &self.bypass
    }

    /// Serve the HTTP surface until the server stops
    ///
    /// # Errors
    /// Returns an error if the listener cannot be bound.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        http::serve(self).await
    }

    /// Shutdown gracefully
    ///
    /// # Errors
    /// Currently infallible.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down data permission layer");
        Ok(())
    }
}
