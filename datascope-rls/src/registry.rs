//! Rule registry: the active rule set, swapped as a whole

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use datascope_common::RoleType;

use crate::rule::{AccessRule, FieldRule};

fn rule_key(role: RoleType, table: &str) -> String {
    format!("{}:{}", role, table.trim().to_ascii_lowercase())
}

/// Immutable, fully built rule set
#[derive(Debug)]
pub struct RuleSnapshot {
    /// `role:table` -> (source rule, resolved rule)
    rules: HashMap<String, (AccessRule, FieldRule)>,
    generation: u64,
    loaded_at: DateTime<Utc>,
}

impl RuleSnapshot {
    fn empty(generation: u64) -> Self {
        Self {
            rules: HashMap::new(),
            generation,
            loaded_at: Utc::now(),
        }
    }

    /// Resolved rule for `(role, table)`
    #[must_use]
    pub fn get(&self, role: RoleType, table: &str) -> Option<&FieldRule> {
        self.rules.get(&rule_key(role, table)).map(|(_, rule)| rule)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Monotonic counter bumped by every load or refresh
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// Rule registry for the statement rewriter.
///
/// Readers take a snapshot pointer without locking; writers build a
/// complete new snapshot and publish it with one atomic swap, so a reader
/// sees either the old rule set or the new one, never a partial one.
pub struct RuleRegistry {
    current: ArcSwap<RuleSnapshot>,
    generation: AtomicU64,
}

impl RuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSnapshot::empty(0)),
            generation: AtomicU64::new(0),
        }
    }

    /// Replace the active rule set with `rules`.
    ///
    /// Disabled and invalid rules are skipped. When several rules share a
    /// `(role, table)` key the last one wins. Returns the number of active
    /// rules in the new snapshot.
    pub fn load(&self, rules: &[AccessRule]) -> usize {
        let mut map = HashMap::with_capacity(rules.len());

        for rule in rules.iter().filter(|r| r.enabled) {
            match FieldRule::try_from(rule) {
                Ok(field_rule) => {
                    let key = rule_key(rule.role, &rule.table);
                    if map.insert(key, (rule.clone(), field_rule)).is_some() {
                        warn!(role = %rule.role, table = %rule.table, "Duplicate data permission rule, last one wins");
                    }
                }
                Err(e) => warn!(role = %rule.role, table = %rule.table, error = %e, "Skipping invalid data permission rule"),
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let active = map.len();
        self.current.store(Arc::new(RuleSnapshot {
            rules: map,
            generation,
            loaded_at: Utc::now(),
        }));

        info!(
            total = rules.len(),
            active, generation, "Loaded data permission rules into cache"
        );
        active
    }

    /// Swap in an empty rule set.
    ///
    /// Filtering is absent until the next [`load`](Self::load); prefer
    /// `RuleLoader::reload`, which fetches before swapping.
    pub fn refresh(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.current.store(Arc::new(RuleSnapshot::empty(generation)));
        warn!(generation, "Data permission rule cache cleared");
    }

    /// Resolved rule for `(role, table)` in the current snapshot
    #[must_use]
    pub fn get(&self, role: RoleType, table: &str) -> Option<FieldRule> {
        self.current.load().get(role, table).cloned()
    }

    /// Pin the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.load_full()
    }

    /// Active source rules, ordered by role then table
    #[must_use]
    pub fn all_rules(&self) -> Vec<AccessRule> {
        let snapshot = self.current.load();
        let mut rules: Vec<AccessRule> = snapshot.rules.values().map(|(rule, _)| rule.clone()).collect();
        rules.sort_by(|a, b| {
            a.role
                .as_str()
                .cmp(b.role.as_str())
                .then_with(|| a.table.cmp(&b.table))
        });
        rules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
