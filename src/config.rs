use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    command::Backend,
    demarcator::{Classifier, DiagnosticKind},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub prompt: String,
    /// Bound on each read; `None` waits forever.
    pub timeout_seconds: Option<u64>,
    pub startup_timeout_seconds: u64,
    pub grace_period_millis: u64,
    /// Issued as `set shown_states N` when the session opens.
    pub shown_states: Option<u32>,
    /// Relation built when a command does not name one.
    pub backend: Backend,
    pub env: BTreeMap<String, String>,
    /// Defaults to the directory of the model.
    pub working_dir: Option<PathBuf>,
    pub merge_stderr: bool,
    pub extra_error_patterns: Vec<String>,
    pub extra_warning_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("nuxmv"),
            args: vec!["-int".to_string()],
            prompt: "nuXmv > ".to_string(),
            timeout_seconds: None,
            startup_timeout_seconds: 30,
            grace_period_millis: 500,
            shown_states: Some(65535),
            backend: Backend::Msat,
            env: BTreeMap::new(),
            working_dir: None,
            merge_stderr: true,
            extra_error_patterns: vec![],
            extra_warning_patterns: vec![],
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_millis)
    }

    /// The nuXmv table plus the configured extra patterns.
    pub fn classifier(&self) -> std::result::Result<Classifier, regex::Error> {
        let classifier = self
            .extra_error_patterns
            .iter()
            .try_fold(Classifier::nuxmv(), |c, p| {
                c.with_rule(DiagnosticKind::Internal, p)
            })?;
        self.extra_warning_patterns
            .iter()
            .try_fold(classifier, |c, p| c.with_rule(DiagnosticKind::Warning, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "executable: /opt/nuxmv/bin/nuXmv\ntimeout_seconds: 10\nbackend: bdd\nextra_error_patterns:\n  - \"out of memory\""
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.executable, PathBuf::from("/opt/nuxmv/bin/nuXmv"));
        assert_eq!(config.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.backend, Backend::Bdd);
        assert_eq!(config.args, vec!["-int".to_string()]);
        assert_eq!(config.prompt, "nuXmv > ");
        assert_eq!(config.shown_states, Some(65535));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_file(Path::new("/no/such/config.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_extra_patterns_are_classified() {
        let config = EngineConfig {
            extra_error_patterns: vec!["out of memory".into()],
            extra_warning_patterns: vec!["deprecated".into()],
            ..Default::default()
        };
        let classifier = config.classifier().unwrap();
        let cmd = crate::command::Command::raw("go");
        assert!(classifier.classify("out of memory\n", &cmd).is_error());
        assert_eq!(
            classifier.classify("option is deprecated\n", &cmd).status,
            crate::demarcator::Status::Warning
        );
    }

    #[test]
    fn test_bad_pattern() {
        let config = EngineConfig {
            extra_error_patterns: vec!["(".into()],
            ..Default::default()
        };
        assert!(config.classifier().is_err());
    }
}
