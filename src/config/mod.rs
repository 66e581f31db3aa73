//! Fleet configuration
//!
//! A single [`FleetConfig`] is loaded once and passed by parameter into the
//! [`Fleet`](crate::fleet::Fleet) facade, the reconciler and the backend.
//! Nothing here is global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::docker::DockerConfig;
use crate::backend::InstanceSpec;
use crate::fleet::record::Role;

/// Default config file location: ~/.fleetctl/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetctl")
        .join("config.yaml")
}

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Which backend to drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Docker,
}

/// Backend selection and backend-specific settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Snapshot file for the memory backend; `~` is expanded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,

    #[serde(default)]
    pub docker: DockerConfig,
}

impl BackendConfig {
    /// Expanded snapshot path, if one is configured
    pub fn state_path(&self) -> Option<PathBuf> {
        self.state_file
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
    }
}

/// Parallel execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Maximum records operated on at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-record bound for establishing a session
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-record bound for a whole operation; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_secs: Option<u64>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            connect_timeout_secs: default_connect_timeout(),
            session_timeout_secs: None,
        }
    }
}

impl ParallelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs.map(Duration::from_secs)
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

/// Lifecycle transition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long transitions wait for convergence; 0 returns immediately
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,

    /// Delay between state polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_wait_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_wait_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// Template for newly provisioned instances
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub role: Role,

    /// Image; the backend default when empty
    #[serde(default)]
    pub image: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,

    /// Lifetime of new instances; no expiry when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_hours: Option<u64>,
}

impl TemplateConfig {
    pub fn instance_spec(&self) -> InstanceSpec {
        InstanceSpec {
            image: self.image.clone(),
            instance_type: self.instance_type.clone(),
            role: self.role,
            tags: self.tags.clone(),
        }
    }

    /// Expiry for an instance created at `now`
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expiry_hours
            .and_then(|h| i64::try_from(h).ok())
            .map(|h| now + chrono::Duration::hours(h))
    }
}

/// The complete configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Owner stamped on every record this fleet creates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub parallel: ParallelConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub template: TemplateConfig,
}

impl FleetConfig {
    /// Reject settings that would stall or deadlock the core
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "parallel.concurrency must be at least 1".to_string(),
            ));
        }
        if self.lifecycle.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.parallel.session_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "parallel.session_timeout_secs must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse config from YAML string
pub fn parse_config(content: &str) -> Result<FleetConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(FleetConfig::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Serialize config to YAML string
pub fn serialize_config(config: &FleetConfig) -> Result<String, ConfigError> {
    serde_yaml::to_string(config).map_err(|e| ConfigError::WriteError(e.to_string()))
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load config from the default location
pub fn load_config() -> Result<FleetConfig, ConfigError> {
    load_config_from(&default_config_path())
}

/// Load and validate config from a specific path; a missing file yields defaults
pub fn load_config_from(path: &Path) -> Result<FleetConfig, ConfigError> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        parse_config(&content)?
    } else {
        FleetConfig::default()
    };
    config.validate()?;
    Ok(config)
}

/// Save config to a specific path
pub fn save_config_to(config: &FleetConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();
        assert_eq!(config.parallel.concurrency, 10);
        assert_eq!(config.lifecycle.wait_secs, 600);
        assert_eq!(config.lifecycle.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
owner: alice
backend:
  kind: docker
  docker:
    image: rockylinux:9
    network: fleet
parallel:
  concurrency: 4
  session_timeout_secs: 120
template:
  role: server
  expiry_hours: 24
  tags:
    team: db
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.owner.as_deref(), Some("alice"));
        assert_eq!(config.backend.kind, BackendKind::Docker);
        assert_eq!(config.backend.docker.image, "rockylinux:9");
        assert_eq!(config.backend.docker.network.as_deref(), Some("fleet"));
        assert_eq!(config.parallel.concurrency, 4);
        assert_eq!(config.parallel.connect_timeout_secs, 30);
        assert_eq!(
            config.parallel.session_timeout(),
            Some(Duration::from_secs(120))
        );
        assert_eq!(config.template.role, Role::Server);
        assert_eq!(config.template.instance_spec().tags.get("team").unwrap(), "db");
    }

    #[test]
    fn test_empty_content_is_default() {
        assert_eq!(parse_config("").unwrap(), FleetConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = FleetConfig::default();
        config.parallel.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = FleetConfig::default();
        config.lifecycle.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_state_path_expands_tilde() {
        let backend = BackendConfig {
            state_file: Some("~/fleet/state.json".to_string()),
            ..BackendConfig::default()
        };
        let path = backend.state_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("fleet/state.json"));
    }

    #[test]
    fn test_template_expiry() {
        let now = Utc::now();
        let template = TemplateConfig {
            expiry_hours: Some(2),
            ..TemplateConfig::default()
        };
        assert_eq!(template.expires_at(now), Some(now + chrono::Duration::hours(2)));
        assert_eq!(TemplateConfig::default().expires_at(now), None);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = FleetConfig::default();
        config.owner = Some("bob".to_string());
        config.parallel.concurrency = 3;
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config_from(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(loaded, FleetConfig::default());
    }
}
