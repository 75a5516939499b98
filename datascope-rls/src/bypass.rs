//! Per-call bypass registrations

use std::collections::HashMap;
use tracing::info;

use datascope_common::config::BypassEntry;

/// Operations that already scope their own rows.
///
/// Built once at startup and immutable afterwards; hooks consult it by
/// operation id before doing any parsing work.
#[derive(Debug, Clone, Default)]
pub struct BypassRegistry {
    operations: HashMap<String, String>,
}

impl BypassRegistry {
    pub fn builder() -> BypassRegistryBuilder {
        BypassRegistryBuilder::default()
    }

    /// Build from configured entries
    pub fn from_entries(entries: &[BypassEntry]) -> Self {
        entries
            .iter()
            .fold(Self::builder(), |builder, entry| {
                builder.register(&entry.operation, &entry.reason)
            })
            .build()
    }

    /// Check if `operation` skips filtering
    #[must_use]
    pub fn is_bypassed(&self, operation: &str) -> bool {
        self.operations.contains_key(operation)
    }

    /// Documented reason for a registered operation
    #[must_use]
    pub fn reason(&self, operation: &str) -> Option<&str> {
        self.operations.get(operation).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Builder for [`BypassRegistry`]
#[derive(Debug, Default)]
pub struct BypassRegistryBuilder {
    operations: HashMap<String, String>,
}

impl BypassRegistryBuilder {
    /// Register `operation` as self-scoping
    #[must_use]
    pub fn register(mut self, operation: &str, reason: &str) -> Self {
        self.operations
            .insert(operation.trim().to_string(), reason.to_string());
        self
    }

    pub fn build(self) -> BypassRegistry {
        info!(operations = self.operations.len(), "Registered data permission bypasses");
        BypassRegistry {
            operations: self.operations,
        }
    }
}
