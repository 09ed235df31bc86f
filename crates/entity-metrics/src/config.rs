use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, MetricsResult};
use crate::subject::Subject;

const DEFAULT_USER_KIND: &str = "User";
const DEFAULT_DATABASE_PATH: &str = "metrics.db";

/// Settings shared by every metric created from one recorder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Subject kind accepted for the user and admin roles.
    #[serde(default = "default_user_kind")]
    pub user_kind: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_user_kind() -> String {
    DEFAULT_USER_KIND.to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            user_kind: default_user_kind(),
            database_path: default_database_path(),
        }
    }
}

impl MetricsConfig {
    pub fn with_user_kind(mut self, user_kind: impl Into<String>) -> Self {
        self.user_kind = user_kind.into();
        self
    }

    pub fn with_database_path(mut self, database_path: impl Into<PathBuf>) -> Self {
        self.database_path = database_path.into();
        self
    }

    /// Reads `path` when it exists, then applies `METRICS_*` env overrides.
    pub fn load(path: Option<&Path>) -> MetricsResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<MetricsConfig>(&content)?
            }
            _ => MetricsConfig::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user_kind) = lookup("METRICS_USER_KIND").filter(|v| !v.trim().is_empty()) {
            self.user_kind = user_kind.trim().to_string();
        }
        if let Some(path) = lookup("METRICS_DATABASE_PATH").filter(|v| !v.trim().is_empty()) {
            self.database_path = PathBuf::from(path.trim());
        }
    }

    /// Fails when `subject` is present and not of the configured user kind.
    pub fn check_user_kind(&self, subject: Option<&Subject>) -> MetricsResult<()> {
        match subject {
            Some(subject) if subject.kind != self.user_kind => {
                Err(MetricsError::InvalidSubjectKind {
                    expected: self.user_kind.clone(),
                    given: subject.kind.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::MetricsConfig;
    use crate::error::MetricsError;
    use crate::subject::Subject;

    #[test]
    fn load_without_file_uses_defaults() {
        let dir = tempdir().expect("temp dir");
        let missing = dir.path().join("missing.toml");
        let config = MetricsConfig::load(Some(missing.as_path())).expect("load");

        assert_eq!(config.user_kind, "User");
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("metrics.toml");
        std::fs::write(&path, "user_kind = \"Account\"\ndatabase_path = \"data/m.db\"\n")
            .expect("write config");

        let config = MetricsConfig::load(Some(path.as_path())).expect("load");

        assert_eq!(config.user_kind, "Account");
        assert_eq!(config.database_path, PathBuf::from("data/m.db"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env = HashMap::from([
            ("METRICS_USER_KIND", " Member "),
            ("METRICS_DATABASE_PATH", ""),
        ]);
        let mut config = MetricsConfig::default();

        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.user_kind, "Member");
        assert_eq!(config.database_path, PathBuf::from("metrics.db"));
    }

    #[test]
    fn check_user_kind_rejects_other_kinds() {
        let config = MetricsConfig::default();

        assert!(config.check_user_kind(None).is_ok());
        assert!(config
            .check_user_kind(Some(&Subject::new("User", "1")))
            .is_ok());

        let error = config
            .check_user_kind(Some(&Subject::new("Order", "1")))
            .expect_err("order is not a user");
        assert!(matches!(
            error,
            MetricsError::InvalidSubjectKind { ref given, .. } if given == "Order"
        ));
    }
}
