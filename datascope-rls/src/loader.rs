//! Rule sources and the registry loader

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use datascope_common::{Error, Result};

use crate::registry::RuleRegistry;
use crate::rule::AccessRule;

/// Bulk source of access rules
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Fetch every enabled rule
    async fn load_enabled(&self) -> Result<Vec<AccessRule>>;
}

/// Fixed in-memory rule list
#[derive(Debug, Clone, Default)]
pub struct StaticRuleSource {
    rules: Vec<AccessRule>,
}

impl StaticRuleSource {
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl RuleSource for StaticRuleSource {
    async fn load_enabled(&self) -> Result<Vec<AccessRule>> {
        Ok(self.rules.iter().filter(|r| r.enabled).cloned().collect())
    }
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<AccessRule>,
}

/// Rules read from a TOML (`[[rules]]`) or JSON (array) file
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, content: &str) -> Result<Vec<AccessRule>> {
        if self.path.extension().map_or(false, |ext| ext == "json") {
            Ok(serde_json::from_str(content)?)
        } else {
            Ok(toml::from_str::<RuleFile>(content)?.rules)
        }
    }
}

#[async_trait]
impl RuleSource for FileRuleSource {
    async fn load_enabled(&self) -> Result<Vec<AccessRule>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::RuleSource(format!("Failed to read {}: {}", self.path.display(), e))
        })?;

        let rules = self.parse(&content)?;
        Ok(rules.into_iter().filter(|r| r.enabled).collect())
    }
}

/// Moves rules from a source into the registry.
///
/// Reloads are serialized, and a reload fetches the full rule list before
/// swapping it in, so a failed fetch leaves the current rules active.
pub struct RuleLoader {
    source: Arc<dyn RuleSource>,
    registry: Arc<RuleRegistry>,
    reload_lock: Mutex<()>,
}

impl RuleLoader {
    pub fn new(source: Arc<dyn RuleSource>, registry: Arc<RuleRegistry>) -> Self {
        Self {
            source,
            registry,
            reload_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Fetch all enabled rules and swap them in
    ///
    /// # Errors
    /// Returns the source error; the registry is left untouched.
    pub async fn reload(&self) -> Result<usize> {
        let _guard = self.reload_lock.lock().await;
        let rules = self.source.load_enabled().await?;
        Ok(self.registry.load(&rules))
    }

    /// Startup load: failures are logged and the service keeps starting
    pub async fn load_at_startup(&self) -> usize {
        match self.reload().await {
            Ok(active) => {
                info!(active, "Data permission rules loaded successfully");
                active
            }
            Err(e) => {
                error!(error = %e, "Failed to load data permission rules");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datascope_common::RoleType;
    use std::io::Write;

    struct FailingSource;

    #[async_trait]
    impl RuleSource for FailingSource {
        async fn load_enabled(&self) -> Result<Vec<AccessRule>> {
            Err(Error::RuleSource("database unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_static_source_filters_disabled() {
        let source = StaticRuleSource::new(vec![
            AccessRule::new(RoleType::Student, "course_enrollment", "student_id", "studentId"),
            AccessRule::new(RoleType::Student, "file_info", "owner_id", "userId").disabled(),
        ]);

        let rules = source.load_enabled().await.unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[tokio::test]
    async fn test_toml_file_source() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[[rules]]
role = "student"
table = "course_enrollment"
filter_field = "student_id"
context_field = "studentId"

[[rules]]
role = "teacher"
table = "course_enrollment"
filter_field = "course_id"
context_field = "teacherId"
filter_type = "SUBQUERY"
subquery_template = "SELECT id FROM course_info WHERE teacher_id = ?"

[[rules]]
role = "teacher"
table = "file_info"
filter_field = "uploader_id"
context_field = "userId"
enabled = false
"#
        )
        .unwrap();

        let rules = FileRuleSource::new(file.path()).load_enabled().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[1].subquery_template.is_some());
    }

    #[tokio::test]
    async fn test_json_file_source() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"[{{"role": "student", "table": "course_enrollment", "filter_field": "student_id", "context_field": "studentId"}}]"#
        )
        .unwrap();

        let rules = FileRuleSource::new(file.path()).load_enabled().await.unwrap();
        assert_eq!(rules[0].role, RoleType::Student);
    }

    #[tokio::test]
    async fn test_reload_swaps_rules() {
        let registry = Arc::new(RuleRegistry::new());
        let source = Arc::new(StaticRuleSource::new(vec![AccessRule::new(
            RoleType::Student,
            "course_enrollment",
            "student_id",
            "studentId",
        )]));
        let loader = RuleLoader::new(source, registry.clone());

        assert_eq!(loader.reload().await.unwrap(), 1);
        assert!(registry.get(RoleType::Student, "course_enrollment").is_some());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_current_rules() {
        let registry = Arc::new(RuleRegistry::new());
        registry.load(&[AccessRule::new(
            RoleType::Student,
            "course_enrollment",
            "student_id",
            "studentId",
        )]);
        let loader = RuleLoader::new(Arc::new(FailingSource), registry.clone());

        assert!(loader.reload().await.is_err());
        assert_eq!(loader.load_at_startup().await, 0);
        assert_eq!(registry.len(), 1);
    }
}
