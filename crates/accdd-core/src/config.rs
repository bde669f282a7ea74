//! Orchestrator configuration stored in `accdd.toml`.
//!
//! Missing fields take their defaults; a missing file is the all-default
//! configuration. Everything is validated before use.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::execution::CallPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "accdd.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Fix iterations allowed per cycle.
    pub max_iterations: u32,
    /// Rejections allowed per committee position before the cycle fails.
    pub reviews_per_auditor: u32,
    /// Restart the committee from the first auditor after every fix.
    pub restart_committee_on_fix: bool,
    pub integration_branch: String,
    /// Test command run in the sandbox root (argv form).
    pub test_command: Vec<String>,
    /// Bytes of test log kept in records and feedback.
    pub log_excerpt_limit_bytes: usize,
    /// Root of the artifact store.
    pub artifacts_dir: PathBuf,
    /// Repository the integrator merges into.
    pub repo_dir: PathBuf,
    pub sandbox: SandboxSettings,
    pub timeouts: TimeoutSettings,
    pub retry: RetrySettings,
    pub agent: CommandSettings,
    pub qa: CommandSettings,
    pub auditors: Vec<AuditorSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxSettings {
    /// Template directory copied into each sandbox, or `"empty"`.
    pub template: String,
    /// Parent directory for local sandboxes (system temp dir if unset).
    pub root: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            template: ".".into(),
            root: None,
        }
    }
}

/// Per-call time limits, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutSettings {
    pub provision_secs: u64,
    pub sync_secs: u64,
    pub exec_secs: u64,
    pub agent_secs: u64,
    pub review_secs: u64,
    pub qa_secs: u64,
    pub merge_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            provision_secs: 120,
            sync_secs: 60,
            exec_secs: 15 * 60,
            agent_secs: 60 * 60,
            review_secs: 15 * 60,
            qa_secs: 10 * 60,
            merge_secs: 120,
        }
    }
}

/// Retry budget for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CommandSettings {
    pub command: Vec<String>,
}

impl CommandSettings {
    fn new(exe: &str) -> Self {
        Self {
            command: vec![exe.to_string()],
        }
    }
}

/// One committee seat. Order in the file is review order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditorSettings {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_strictness")]
    pub strictness: String,
}

fn default_strictness() -> String {
    "standard".into()
}

impl Default for Settings {
    fn default() -> Self {
        let auditor = |name: &str, strictness: &str| AuditorSettings {
            name: name.into(),
            command: vec!["ac-cdd-auditor".into()],
            strictness: strictness.into(),
        };
        Self {
            max_iterations: 3,
            reviews_per_auditor: 2,
            restart_committee_on_fix: false,
            integration_branch: "main".into(),
            test_command: vec!["cargo".into(), "test".into()],
            log_excerpt_limit_bytes: 50_000,
            artifacts_dir: PathBuf::from(".accdd/cycles"),
            repo_dir: PathBuf::from("."),
            sandbox: SandboxSettings::default(),
            timeouts: TimeoutSettings::default(),
            retry: RetrySettings::default(),
            agent: CommandSettings::new("ac-cdd-agent"),
            qa: CommandSettings::new("ac-cdd-qa"),
            auditors: vec![
                auditor("auditor-1", "standard"),
                auditor("auditor-2", "strict"),
                auditor("auditor-3", "paranoid"),
            ],
        }
    }
}

fn non_empty_argv(argv: &[String]) -> bool {
    argv.first().is_some_and(|exe| !exe.trim().is_empty())
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.auditors.is_empty() {
            return invalid("auditors must name at least one committee member");
        }
        for (i, a) in self.auditors.iter().enumerate() {
            if a.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("auditors[{i}].name is empty")));
            }
            if !non_empty_argv(&a.command) {
                return Err(ConfigError::Invalid(format!(
                    "auditors[{i}].command must be a non-empty array"
                )));
            }
        }
        if !non_empty_argv(&self.test_command) {
            return invalid("test_command must be a non-empty array");
        }
        if !non_empty_argv(&self.agent.command) {
            return invalid("agent.command must be a non-empty array");
        }
        if !non_empty_argv(&self.qa.command) {
            return invalid("qa.command must be a non-empty array");
        }
        if self.integration_branch.trim().is_empty() {
            return invalid("integration_branch must not be empty");
        }
        if self.log_excerpt_limit_bytes == 0 {
            return invalid("log_excerpt_limit_bytes must be > 0");
        }
        let t = &self.timeouts;
        let timeouts = [
            ("provision_secs", t.provision_secs),
            ("sync_secs", t.sync_secs),
            ("exec_secs", t.exec_secs),
            ("agent_secs", t.agent_secs),
            ("review_secs", t.review_secs),
            ("qa_secs", t.qa_secs),
            ("merge_secs", t.merge_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("timeouts.{name} must be > 0")));
        }
        Ok(())
    }

    /// Call budgets derived from the timeouts and retry settings.
    ///
    /// Test runs and merges run once. Everything else retries transient
    /// failures.
    pub fn call_policies(&self) -> CallPolicies {
        let t = &self.timeouts;
        let r = &self.retry;
        let retried = |secs: u64| {
            CallPolicy::once(Duration::from_secs(secs)).with_retries(r.max_retries, r.backoff_base_ms)
        };
        let once = |secs: u64| CallPolicy::once(Duration::from_secs(secs));
        CallPolicies {
            provision: retried(t.provision_secs),
            sync: retried(t.sync_secs),
            teardown: once(t.provision_secs),
            exec: once(t.exec_secs),
            agent: retried(t.agent_secs),
            review: retried(t.review_secs),
            qa: retried(t.qa_secs),
            merge: once(t.merge_secs),
        }
    }
}

/// One `CallPolicy` per kind of external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicies {
    pub provision: CallPolicy,
    pub sync: CallPolicy,
    pub teardown: CallPolicy,
    pub exec: CallPolicy,
    pub agent: CallPolicy,
    pub review: CallPolicy,
    pub qa: CallPolicy,
    pub merge: CallPolicy,
}

impl Default for CallPolicies {
    fn default() -> Self {
        Settings::default().call_policies()
    }
}

/// Load settings from a TOML file. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let settings = match fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().unwrap();
        let cfg = load_settings(&temp.path().join("missing.toml")).unwrap();
        assert_eq!(cfg, Settings::default());
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.reviews_per_auditor, 2);
        assert_eq!(cfg.auditors.len(), 3);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("accdd.toml");
        std::fs::write(
            &path,
            r#"
max_iterations = 5
integration_branch = "develop"

[timeouts]
exec_secs = 30

[[auditors]]
name = "security"
command = ["review-bot", "--security"]
"#,
        )
        .unwrap();
        let cfg = load_settings(&path).unwrap();
        assert_eq!(cfg.max_iterations, 5);
        assert_eq!(cfg.integration_branch, "develop");
        assert_eq!(cfg.timeouts.exec_secs, 30);
        assert_eq!(cfg.timeouts.agent_secs, TimeoutSettings::default().agent_secs);
        assert_eq!(cfg.auditors.len(), 1);
        assert_eq!(cfg.auditors[0].strictness, "standard");
    }

    #[test]
    fn empty_committee_is_invalid() {
        let cfg = Settings {
            auditors: vec![],
            ..Settings::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let mut cfg = Settings::default();
        cfg.timeouts.merge_secs = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("timeouts.merge_secs"));
    }

    #[test]
    fn empty_test_command_is_invalid() {
        let cfg = Settings {
            test_command: vec![" ".into()],
            ..Settings::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn garbage_file_is_parse_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("accdd.toml");
        std::fs::write(&path, "max_iterations = \"many\"").unwrap();
        assert!(matches!(load_settings(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn policies_follow_timeouts() {
        let cfg = Settings::default();
        let p = cfg.call_policies();
        assert_eq!(p.exec.timeout_ms, cfg.timeouts.exec_secs * 1000);
        assert_eq!(p.exec.max_retries, 0);
        assert_eq!(p.merge.max_retries, 0);
        assert_eq!(p.review.max_retries, cfg.retry.max_retries);
    }
}
