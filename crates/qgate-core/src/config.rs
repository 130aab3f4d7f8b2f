//! Orchestrator configuration.
//!
//! Defaults can be overridden from a TOML file or from `QGATE_*`
//! environment variables:
//!
//! ```toml
//! workflow_file = "qms-quality-validation.yml"
//! default_ref = "main"
//! collaborator_timeout_secs = 30
//! protect_on_failure = false
//! retention_secs = 3600
//! bypass_approvers = ["release-manager"]
//!
//! [max_retries]
//! standard = 3
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::RepositoryTier;
use crate::policy::PolicyTable;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Workflow file dispatched for validation runs.
    pub workflow_file: String,
    /// Ref used when a request names no branch.
    pub default_ref: String,
    pub default_environment: String,
    /// Upper bound for a single collaborator call.
    pub collaborator_timeout_secs: u64,
    /// Also configure branch protection when a run fails.
    pub protect_on_failure: bool,
    /// How long terminal runs stay queryable.
    pub retention_secs: u64,
    /// Empty means any identified actor.
    pub bypass_approvers: Vec<String>,
    /// Empty means any identified actor.
    pub escalation_reviewers: Vec<String>,
    /// Retry budget overrides keyed by tier name.
    pub max_retries: BTreeMap<String, u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workflow_file: "qms-quality-validation.yml".to_string(),
            default_ref: "main".to_string(),
            default_environment: "development".to_string(),
            collaborator_timeout_secs: 30,
            protect_on_failure: false,
            retention_secs: 3600,
            bypass_approvers: Vec::new(),
            escalation_reviewers: Vec::new(),
            max_retries: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&data)
    }

    /// Defaults overlaid with `QGATE_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Overlay values found through `lookup` onto `self`.
    pub fn overlay_env<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("QGATE_WORKFLOW_FILE") {
            self.workflow_file = v;
        }
        if let Some(v) = lookup("QGATE_DEFAULT_REF") {
            self.default_ref = v;
        }
        if let Some(v) = lookup("QGATE_DEFAULT_ENVIRONMENT") {
            self.default_environment = v;
        }
        if let Some(v) = lookup("QGATE_COLLABORATOR_TIMEOUT_SECS") {
            self.collaborator_timeout_secs = parse_value("QGATE_COLLABORATOR_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("QGATE_PROTECT_ON_FAILURE") {
            self.protect_on_failure = parse_value("QGATE_PROTECT_ON_FAILURE", &v)?;
        }
        if let Some(v) = lookup("QGATE_RETENTION_SECS") {
            self.retention_secs = parse_value("QGATE_RETENTION_SECS", &v)?;
        }
        if let Some(v) = lookup("QGATE_BYPASS_APPROVERS") {
            self.bypass_approvers = split_list(&v);
        }
        if let Some(v) = lookup("QGATE_ESCALATION_REVIEWERS") {
            self.escalation_reviewers = split_list(&v);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.collaborator_timeout_secs == 0 {
            return Err(invalid("collaborator_timeout_secs", "must be greater than zero"));
        }
        if self.retention_secs == 0 {
            return Err(invalid("retention_secs", "must be greater than zero"));
        }
        if self.workflow_file.trim().is_empty() {
            return Err(invalid("workflow_file", "must not be empty"));
        }
        for tier in self.max_retries.keys() {
            tier.parse::<RepositoryTier>()
                .map_err(|e| invalid("max_retries", &e.to_string()))?;
        }
        Ok(())
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// The default tier table with this config's retry overrides applied.
    pub fn policy_table(&self) -> ConfigResult<PolicyTable> {
        self.max_retries
            .iter()
            .try_fold(PolicyTable::standard(), |table, (name, retries)| {
                let tier: RepositoryTier = name
                    .parse()
                    .map_err(|e: crate::domain::ValidationError| {
                        invalid("max_retries", &e.to_string())
                    })?;
                Ok(table.with_max_retries(tier, *retries))
            })
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_value<T>(key: &str, value: &str) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, &e.to_string()))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.workflow_file, "qms-quality-validation.yml");
        assert_eq!(config.default_ref, "main");
        assert_eq!(config.collaborator_timeout(), Duration::from_secs(30));
        assert!(!config.protect_on_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            protect_on_failure = true
            bypass_approvers = ["release-manager"]

            [max_retries]
            standard = 4
            "#,
        )
        .unwrap();
        assert!(config.protect_on_failure);
        assert_eq!(config.default_ref, "main");
        let table = config.policy_table().unwrap();
        assert_eq!(table.policy_for(RepositoryTier::Standard).max_retries, 4);
        assert_eq!(
            table.policy_for(RepositoryTier::MissionCritical).max_retries,
            3
        );
    }

    #[test]
    fn test_rejects_zero_timeout_and_unknown_tier() {
        assert!(matches!(
            OrchestratorConfig::from_toml_str("collaborator_timeout_secs = 0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            OrchestratorConfig::from_toml_str("[max_retries]\nlegendary = 1"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            OrchestratorConfig::from_toml_str("retention_secs = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_ref = \"develop\"").unwrap();
        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.default_ref, "develop");

        let missing = OrchestratorConfig::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("QGATE_DEFAULT_REF", "release"),
            ("QGATE_PROTECT_ON_FAILURE", "true"),
            ("QGATE_ESCALATION_REVIEWERS", "alice, bob,"),
        ]
        .into_iter()
        .collect();
        let config = OrchestratorConfig::default()
            .overlay_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.default_ref, "release");
        assert!(config.protect_on_failure);
        assert_eq!(config.escalation_reviewers, vec!["alice", "bob"]);
    }

    #[test]
    fn test_env_overlay_rejects_bad_number() {
        let result = OrchestratorConfig::default().overlay_env(|k| {
            (k == "QGATE_RETENTION_SECS").then(|| "forever".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
