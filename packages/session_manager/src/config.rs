use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::CredentialSettings;
use crate::detector::DetectionSettings;
use crate::patterns::{PatternBank, PatternSpec, default_pattern_specs};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [sessions]
//                    max_sessions = 4
//
//   env var:         SESSIOND_SESSIONS__MAX_SESSIONS=4   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub sessions: SessionsFileConfig,
    #[serde(default)]
    pub detection: DetectionFileConfig,
    #[serde(default)]
    pub credentials: CredentialsFileConfig,
}

/// Lifecycle knobs (lives under `[sessions]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionsFileConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    #[serde(default = "default_replay_buffer_kb")]
    pub replay_buffer_kb: usize,
    #[serde(default)]
    pub default_cwd: Option<PathBuf>,
    #[serde(default)]
    pub default_shell: Option<String>,
}

impl Default for SessionsFileConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            teardown_grace_ms: default_teardown_grace_ms(),
            replay_buffer_kb: default_replay_buffer_kb(),
            default_cwd: None,
            default_shell: None,
        }
    }
}

/// Failure detection tunables (lives under `[detection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionFileConfig {
    #[serde(default = "default_enable_delay_ms")]
    pub enable_delay_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    #[serde(default = "default_min_scan_chars")]
    pub min_scan_chars: usize,
    #[serde(default = "default_resume_marker")]
    pub resume_marker: String,
    /// Replaces the built-in bank when set
    #[serde(default = "default_pattern_specs")]
    pub patterns: Vec<PatternSpec>,
}

impl Default for DetectionFileConfig {
    fn default() -> Self {
        Self {
            enable_delay_ms: default_enable_delay_ms(),
            settle_ms: default_settle_ms(),
            retention_ms: default_retention_ms(),
            min_scan_chars: default_min_scan_chars(),
            resume_marker: default_resume_marker(),
            patterns: default_pattern_specs(),
        }
    }
}

/// Credential materialization (lives under `[credentials]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialsFileConfig {
    /// Parent of per-session directories (default: `<default cwd>/.sessions`)
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_secret_field")]
    pub secret_field: String,
    /// Empty string disables
    #[serde(default = "default_home_env_var")]
    pub home_env_var: String,
}

impl Default for CredentialsFileConfig {
    fn default() -> Self {
        Self {
            root: None,
            op_timeout_ms: default_op_timeout_ms(),
            secret_field: default_secret_field(),
            home_env_var: default_home_env_var(),
        }
    }
}

fn default_max_sessions() -> usize {
    10
}
fn default_teardown_grace_ms() -> u64 {
    100
}
fn default_replay_buffer_kb() -> usize {
    1024
}
fn default_enable_delay_ms() -> u64 {
    5000
}
fn default_settle_ms() -> u64 {
    3000
}
fn default_retention_ms() -> u64 {
    10_000
}
fn default_min_scan_chars() -> usize {
    50
}
fn default_resume_marker() -> String {
    "/resume".to_string()
}
fn default_op_timeout_ms() -> u64 {
    3000
}
fn default_secret_field() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_home_env_var() -> String {
    "CODEX_HOME".to_string()
}

/// Build a figment that layers: defaults → `<config_dir>/config.toml` → SESSIOND_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("SESSIOND_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Concurrent session cap; resumes don't count against it
    pub max_sessions: usize,
    /// Upper bound on waiting for a killed process to drain its output
    pub teardown_grace: Duration,
    /// Display text retained per session for late consumers
    pub replay_buffer_bytes: usize,
    pub default_cwd: PathBuf,
    pub default_shell: Option<String>,
    pub detection: DetectionSettings,
    pub patterns: Arc<PatternBank>,
    pub credentials: CredentialSettings,
    pub file_op_timeout: Duration,
}

impl SessionConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let default_cwd = match &fc.sessions.default_cwd {
            Some(dir) => absolute(dir)?,
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp")),
        };

        let credential_root = match &fc.credentials.root {
            Some(dir) => absolute(dir)?,
            None => default_cwd.join(".sessions"),
        };

        let patterns = PatternBank::new(&fc.detection.patterns)
            .context("Failed to compile [detection] patterns")?;

        let home_env_var = Some(fc.credentials.home_env_var.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(Self {
            max_sessions: fc.sessions.max_sessions,
            teardown_grace: Duration::from_millis(fc.sessions.teardown_grace_ms),
            replay_buffer_bytes: fc.sessions.replay_buffer_kb * 1024,
            default_cwd,
            default_shell: fc.sessions.default_shell.clone(),
            detection: DetectionSettings {
                enable_delay: Duration::from_millis(fc.detection.enable_delay_ms),
                settle: Duration::from_millis(fc.detection.settle_ms),
                retention: Duration::from_millis(fc.detection.retention_ms),
                min_scan_chars: fc.detection.min_scan_chars,
                resume_marker: fc.detection.resume_marker.clone(),
            },
            patterns: Arc::new(patterns),
            credentials: CredentialSettings {
                root: credential_root,
                secret_field: fc.credentials.secret_field.clone(),
                home_env_var,
            },
            file_op_timeout: Duration::from_millis(fc.credentials.op_timeout_ms),
        })
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Failed to resolve path: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.sessions.max_sessions, 10);
        assert_eq!(fc.sessions.teardown_grace_ms, 100);
        assert_eq!(fc.detection.enable_delay_ms, 5000);
        assert_eq!(fc.detection.settle_ms, 3000);
        assert_eq!(fc.detection.retention_ms, 10_000);
        assert_eq!(fc.detection.min_scan_chars, 50);
        assert_eq!(fc.detection.resume_marker, "/resume");
        assert!(!fc.detection.patterns.is_empty());
        assert_eq!(fc.credentials.op_timeout_ms, 3000);
    }

    #[test]
    fn test_session_config_from_defaults() {
        let sc = SessionConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(sc.max_sessions, 10);
        assert_eq!(sc.teardown_grace, Duration::from_millis(100));
        assert_eq!(sc.replay_buffer_bytes, 1024 * 1024);
        assert_eq!(sc.detection.enable_delay, Duration::from_secs(5));
        assert_eq!(sc.file_op_timeout, Duration::from_secs(3));
        assert_eq!(sc.credentials.root, sc.default_cwd.join(".sessions"));
        assert_eq!(sc.credentials.home_env_var.as_deref(), Some("CODEX_HOME"));
        assert!(!sc.patterns.is_empty());
    }

    #[test]
    fn test_empty_home_env_var_disables() {
        let mut fc = FileConfig::default();
        fc.credentials.home_env_var = String::new();
        let sc = SessionConfig::from_file(&fc).unwrap();
        assert!(sc.credentials.home_env_var.is_none());
    }

    #[test]
    fn test_bad_pattern_is_rejected() {
        let mut fc = FileConfig::default();
        fc.detection.patterns = vec![PatternSpec {
            name: "bad".to_string(),
            regex: "(".to_string(),
            reason: "x".to_string(),
        }];
        let err = SessionConfig::from_file(&fc).unwrap_err();
        assert!(format!("{:#}", err).contains("bad"));
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.sessions.max_sessions, 10);
        assert!(fc.credentials.root.is_none());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            r#"
[sessions]
max_sessions = 3

[detection]
resume_marker = "/continue"
patterns = [{ name = "quota", regex = "quota", reason = "Quota" }]

[credentials]
root = "/var/lib/sessiond"
"#,
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.sessions.max_sessions, 3);
        assert_eq!(fc.sessions.teardown_grace_ms, 100);
        assert_eq!(fc.detection.resume_marker, "/continue");
        assert_eq!(fc.detection.patterns.len(), 1);
        assert_eq!(fc.credentials.root, Some(PathBuf::from("/var/lib/sessiond")));
    }

    #[test]
    fn test_load_config_env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[sessions]\nmax_sessions = 3\n")?;
            jail.set_env("SESSIOND_SESSIONS__MAX_SESSIONS", "7");
            let fc: FileConfig = load_config(jail.directory()).extract()?;
            assert_eq!(fc.sessions.max_sessions, 7);
            Ok(())
        });
    }
}
