//! stackgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;

/// File name looked up at a workspace root.
pub const CONFIG_FILE: &str = "stackgrid.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub workspace: WorkspaceConfig,
    pub scan: ScanConfig,
    pub orchestrator: OrchestratorConfig,
    pub health: HealthSettings,
    #[serde(rename = "dependency", skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_depth: usize,
    pub excerpt_bytes: usize,
    pub min_confidence: f64,
    /// Extra directory names to skip, on top of the built-in list.
    pub ignore: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: 4,
            excerpt_bytes: 4096,
            min_confidence: 0.3,
            ignore: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Default per-dependency readiness wait for edges without their own.
    pub dependency_timeout_seconds: u64,
    pub dependency_retries: u32,
    /// Growth of the wait between readiness attempts (1.0 = constant).
    pub backoff_multiplier: f64,
    pub stop_timeout_seconds: u64,
    /// How long a started container may take to report running.
    pub start_timeout_seconds: u64,
    /// How often the backend is polled while waiting on a container.
    pub poll_interval: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dependency_timeout_seconds: 30,
            dependency_retries: 3,
            backoff_multiplier: 1.0,
            stop_timeout_seconds: 10,
            start_timeout_seconds: 60,
            poll_interval: "250ms".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_millis(250))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval: String,
    pub timeout: String,
    pub unhealthy_threshold: u32,
    /// Consecutive successes needed to leave `degraded`.
    pub recovery_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            timeout: "2s".to_string(),
            unhealthy_threshold: 3,
            recovery_threshold: 2,
        }
    }
}

/// An explicit `[[dependency]]` declaration. Endpoints are service names or folder paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub from: String,
    pub to: String,
    pub kind: String,
    pub required: Option<bool>,
    pub startup_order: Option<u8>,
    pub timeout_seconds: Option<u64>,
    pub retry_count: Option<u32>,
    pub environment_variable: Option<String>,
    pub health_check_path: Option<String>,
}

/// Per-service overrides under `[services.<name>]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOverride {
    pub port: Option<u16>,
    pub health_path: Option<String>,
    pub disable_health_check: bool,
    pub startup_order: Option<u8>,
    pub replicas: Option<u32>,
    pub max_replicas: Option<u32>,
    pub environment: BTreeMap<String, String>,
}

impl StackConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StackConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `stackgrid.toml` from `root` if present, defaults otherwise.
    pub fn load_or_default(root: &Path) -> anyhow::Result<Self> {
        let path = root.join(CONFIG_FILE);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(name) = &self.workspace.name {
            if let Err(reason) = crate::ids::check_workspace_name(name) {
                bail!("workspace.name: {reason}");
            }
        }
        if !(0.0..=1.0).contains(&self.scan.min_confidence) {
            bail!("scan.min_confidence must be within [0, 1], got {}", self.scan.min_confidence);
        }
        if self.orchestrator.backoff_multiplier < 1.0 {
            bail!("orchestrator.backoff_multiplier must be >= 1.0");
        }
        for d in &self.dependencies {
            if crate::DependencyType::parse(&d.kind).is_none() {
                bail!("dependency {} -> {}: unknown kind '{}'", d.from, d.to, d.kind);
            }
            if d.startup_order.is_some_and(|o| o > 100) {
                bail!("dependency {} -> {}: startup_order must be within [0, 100]", d.from, d.to);
            }
        }
        for (name, svc) in &self.services {
            if svc.startup_order.is_some_and(|o| o > 100) {
                bail!("services.{name}: startup_order must be within [0, 100]");
            }
        }
        Ok(())
    }

    /// Workspace name: the configured one, else the root folder's name.
    pub fn workspace_name(&self, root: &Path) -> String {
        self.workspace.name.clone().unwrap_or_else(|| {
            root.canonicalize()
                .ok()
                .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
                .unwrap_or_else(|| "default".to_string())
        })
    }

    /// Scaffold a starter stackgrid.toml.
    pub fn scaffold(name: &str) -> Self {
        StackConfig {
            workspace: WorkspaceConfig {
                name: Some(name.to_string()),
            },
            ..StackConfig::default()
        }
    }
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold() {
        let config = StackConfig::scaffold("shop");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("shop"));
        assert!(toml_str.contains("[orchestrator]"));
    }

    #[test]
    fn test_parse_minimal() {
        let config: StackConfig = toml::from_str("").unwrap();
        assert_eq!(config.scan.max_depth, 4);
        assert_eq!(config.orchestrator.dependency_retries, 3);
        assert!(config.dependencies.is_empty());
    }

    #[test]
    fn test_parse_dependencies_and_overrides() {
        let toml_str = r#"
[workspace]
name = "shop"

[orchestrator]
dependency_timeout_seconds = 5

[[dependency]]
from = "web"
to = "db"
kind = "requires"
timeout_seconds = 1
retry_count = 2

[services.web]
port = 8081
startup_order = 1
"#;
        let config: StackConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.workspace.name.as_deref(), Some("shop"));
        assert_eq!(config.orchestrator.dependency_timeout_seconds, 5);
        assert_eq!(config.orchestrator.stop_timeout_seconds, 10);
        assert_eq!(config.dependencies.len(), 1);
        assert_eq!(config.dependencies[0].retry_count, Some(2));
        assert_eq!(config.services["web"].port, Some(8081));
    }

    #[test]
    fn test_rejects_unknown_dependency_kind() {
        let toml_str = r#"
[[dependency]]
from = "web"
to = "db"
kind = "likes"
"#;
        let config: StackConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_confidence() {
        let mut config = StackConfig::default();
        config.scan.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_nested_workspace_name() {
        let config: StackConfig = toml::from_str("[workspace]\nname = \"team/shop\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workspace.name"));
        assert!(StackConfig::scaffold("team").validate().is_ok());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
    }
}
