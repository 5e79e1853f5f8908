//! Shared types used across stackgrid crates.
//!
//! These are the records exchanged between the scanner, graph builder,
//! orchestrator, health monitor, and state store. All of them serialize to
//! JSON for persistence and CLI output.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lifecycle::ServiceStatus;

/// Identifier of a service node within a workspace.
pub type NodeId = String;

/// Identifier of a dependency edge within a workspace.
pub type EdgeId = String;

/// Identifier of a detection run.
pub type RunId = String;

// ── Service types ─────────────────────────────────────────────────

/// Kind of service a folder is believed to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Node,
    Python,
    Go,
    Rust,
    Java,
    Ruby,
    Php,
    StaticSite,
    Container,
    Postgres,
    Mysql,
    Redis,
    Mongodb,
    Nginx,
}

impl ServiceType {
    pub const ALL: [ServiceType; 14] = [
        ServiceType::Node,
        ServiceType::Python,
        ServiceType::Go,
        ServiceType::Rust,
        ServiceType::Java,
        ServiceType::Ruby,
        ServiceType::Php,
        ServiceType::StaticSite,
        ServiceType::Container,
        ServiceType::Postgres,
        ServiceType::Mysql,
        ServiceType::Redis,
        ServiceType::Mongodb,
        ServiceType::Nginx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Node => "node",
            ServiceType::Python => "python",
            ServiceType::Go => "go",
            ServiceType::Rust => "rust",
            ServiceType::Java => "java",
            ServiceType::Ruby => "ruby",
            ServiceType::Php => "php",
            ServiceType::StaticSite => "static_site",
            ServiceType::Container => "container",
            ServiceType::Postgres => "postgres",
            ServiceType::Mysql => "mysql",
            ServiceType::Redis => "redis",
            ServiceType::Mongodb => "mongodb",
            ServiceType::Nginx => "nginx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Stateful backing services other services connect to.
    pub fn is_datastore(&self) -> bool {
        matches!(
            self,
            ServiceType::Postgres | ServiceType::Mysql | ServiceType::Redis | ServiceType::Mongodb
        )
    }

    /// Whether the service speaks HTTP and gets a default health endpoint.
    pub fn serves_http(&self) -> bool {
        !self.is_datastore()
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ServiceType::Node => 3000,
            ServiceType::Python => 8000,
            ServiceType::Go | ServiceType::Rust | ServiceType::Java | ServiceType::Container => 8080,
            ServiceType::Ruby => 3000,
            ServiceType::Php | ServiceType::StaticSite | ServiceType::Nginx => 80,
            ServiceType::Postgres => 5432,
            ServiceType::Mysql => 3306,
            ServiceType::Redis => 6379,
            ServiceType::Mongodb => 27017,
        }
    }

    /// Connection string template handed to dependents, `{host}`/`{port}` filled at deploy time.
    pub fn connection_template(&self) -> String {
        match self {
            ServiceType::Postgres => "postgres://{host}:{port}/app".to_string(),
            ServiceType::Mysql => "mysql://{host}:{port}/app".to_string(),
            ServiceType::Redis => "redis://{host}:{port}".to_string(),
            ServiceType::Mongodb => "mongodb://{host}:{port}/app".to_string(),
            _ => "http://{host}:{port}".to_string(),
        }
    }

    /// Environment-variable name prefixes conventionally pointing at this type.
    pub fn env_prefixes(&self) -> &'static [&'static str] {
        match self {
            ServiceType::Postgres => &["DATABASE", "POSTGRES", "PG", "DB"],
            ServiceType::Mysql => &["DATABASE", "MYSQL", "DB"],
            ServiceType::Redis => &["REDIS", "CACHE"],
            ServiceType::Mongodb => &["MONGO", "MONGODB"],
            _ => &[],
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Candidate ─────────────────────────────────────────────────────

/// A confidence-scored hypothesis that a folder holds a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCandidate {
    pub id: String,
    /// Folder path relative to the scanned root ("." for the root).
    pub folder_path: String,
    pub inferred_type: ServiceType,
    /// Weighted fraction of matched signals, in `[0, 1]`.
    pub confidence: f64,
    pub matched_signals: Vec<String>,
    /// Unix timestamp (seconds) of the detection run.
    pub detected_at: u64,
    /// Variables found in the folder's env files.
    #[serde(default)]
    pub declared_env: BTreeMap<String, String>,
}

// ── Service node ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
}

/// Resource limits per replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// CPU in millicores.
    pub cpu_millis: u32,
    pub storage_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_millis: 500,
            storage_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Target CPU utilisation percentage.
    pub target_cpu: u8,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 3,
            target_cpu: 70,
        }
    }
}

/// Health check parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// HTTP path to probe (e.g. "/health").
    pub path: String,
    /// Check interval (e.g. "10s").
    pub interval: String,
    /// Timeout per check (e.g. "2s").
    pub timeout: String,
    /// Consecutive failures before the service is unhealthy.
    pub retries: u32,
}

impl HealthCheckConfig {
    pub fn http(path: &str) -> Self {
        Self {
            path: path.to_string(),
            interval: "10s".to_string(),
            timeout: "2s".to_string(),
            retries: 3,
        }
    }
}

/// How the execution backend should build and run the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Build context relative to the workspace root.
    pub build_context: String,
    pub dockerfile: Option<String>,
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A deployable unit with its own lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub id: NodeId,
    pub workspace: String,
    /// Unique per workspace.
    pub name: String,
    pub folder_path: String,
    pub service_type: ServiceType,
    pub status: ServiceStatus,
    pub container_ref: Option<String>,
    pub image_ref: Option<String>,
    pub deployment_config: DeploymentConfig,
    pub port_mappings: Vec<PortMapping>,
    pub environment_variables: BTreeMap<String, String>,
    pub resource_limits: ResourceLimits,
    pub scaling_config: ScalingConfig,
    /// Current replica count.
    pub replicas: u32,
    /// Advisory startup tier hint, `0..=100`.
    pub startup_order: u8,
    pub health_check_config: Option<HealthCheckConfig>,
    pub deployed_at: Option<u64>,
    pub last_health_check_at: Option<u64>,
    /// Bumped on every persisted write.
    pub revision: u64,
}

impl ServiceNode {
    /// A fresh node in `detecting` with per-type defaults.
    pub fn skeleton(workspace: &str, name: &str, folder_path: &str, service_type: ServiceType) -> Self {
        let port = service_type.default_port();
        Self {
            id: crate::ids::derive_id("svc", &[workspace, folder_path, name]),
            workspace: workspace.to_string(),
            name: name.to_string(),
            folder_path: folder_path.to_string(),
            service_type,
            status: ServiceStatus::Detecting,
            container_ref: None,
            image_ref: None,
            deployment_config: DeploymentConfig {
                build_context: folder_path.to_string(),
                ..DeploymentConfig::default()
            },
            port_mappings: vec![PortMapping {
                container_port: port,
                host_port: None,
                protocol: "tcp".to_string(),
            }],
            environment_variables: BTreeMap::new(),
            resource_limits: ResourceLimits::default(),
            scaling_config: ScalingConfig::default(),
            replicas: 1,
            startup_order: if service_type.is_datastore() { 0 } else { 10 },
            health_check_config: service_type
                .serves_http()
                .then(|| HealthCheckConfig::http("/health")),
            deployed_at: None,
            last_health_check_at: None,
            revision: 0,
        }
    }

    /// Composite key `{workspace}/{id}` used by the state store and leases.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.workspace, self.id)
    }

    /// Port the service is reachable on from the orchestrating host.
    pub fn primary_port(&self) -> Option<u16> {
        self.port_mappings
            .first()
            .map(|p| p.host_port.unwrap_or(p.container_port))
    }
}

// ── Dependency edge ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Requires,
    ConnectsTo,
    DependsOn,
    WaitsFor,
    CommunicatesWith,
}

impl DependencyType {
    /// `requires` and `depends_on` are the hard ordering types.
    pub fn is_required_typed(&self) -> bool {
        matches!(self, DependencyType::Requires | DependencyType::DependsOn)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Requires => "requires",
            DependencyType::ConnectsTo => "connects_to",
            DependencyType::DependsOn => "depends_on",
            DependencyType::WaitsFor => "waits_for",
            DependencyType::CommunicatesWith => "communicates_with",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requires" => Some(DependencyType::Requires),
            "connects_to" => Some(DependencyType::ConnectsTo),
            "depends_on" => Some(DependencyType::DependsOn),
            "waits_for" => Some(DependencyType::WaitsFor),
            "communicates_with" => Some(DependencyType::CommunicatesWith),
            _ => None,
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed edge: `dependent_service_id` needs `required_service_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: EdgeId,
    pub workspace: String,
    pub dependent_service_id: NodeId,
    pub required_service_id: NodeId,
    pub dependency_type: DependencyType,
    pub connection_string_template: Option<String>,
    pub environment_variable: Option<String>,
    /// Advisory tier hint, `0..=100`.
    pub startup_order: u8,
    pub is_required: bool,
    pub health_check_path: Option<String>,
    pub timeout_seconds: u64,
    pub retry_count: u32,
}

impl DependencyEdge {
    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
    pub const DEFAULT_RETRY_COUNT: u32 = 3;

    pub fn new(
        workspace: &str,
        dependent: &str,
        required: &str,
        dependency_type: DependencyType,
    ) -> Self {
        Self {
            id: crate::ids::derive_id("dep", &[workspace, dependent, required]),
            workspace: workspace.to_string(),
            dependent_service_id: dependent.to_string(),
            required_service_id: required.to_string(),
            dependency_type,
            connection_string_template: None,
            environment_variable: None,
            startup_order: 0,
            is_required: dependency_type.is_required_typed(),
            health_check_path: None,
            timeout_seconds: Self::DEFAULT_TIMEOUT_SECONDS,
            retry_count: Self::DEFAULT_RETRY_COUNT,
        }
    }

    pub fn table_key(&self) -> String {
        format!("{}/{}", self.workspace, self.id)
    }

    /// The unordered identity of the edge: `(dependent, required)`.
    pub fn pair(&self) -> (&str, &str) {
        (&self.dependent_service_id, &self.required_service_id)
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Result of a health check as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Debounced health level fed back into the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

// ── Graph snapshots and detection runs ────────────────────────────

/// Serialized form of one immutable service graph version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub workspace: String,
    pub version: u64,
    pub nodes: Vec<ServiceNode>,
    pub edges: Vec<DependencyEdge>,
    pub created_at: u64,
}

impl GraphSnapshot {
    /// Key `{workspace}/{version}` with the version zero-padded so keys sort numerically.
    pub fn table_key(&self) -> String {
        format!("{}/{:020}", self.workspace, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub confidence: f64,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Analyzing,
    Completed,
    Failed,
    Cancelled,
}

/// Advisory rollout shape recommended from graph complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    /// One service, deploy directly.
    Single,
    /// A chain; deploy one at a time.
    Sequential,
    /// Independent tiers; deploy each tier concurrently.
    ParallelTiers,
    /// Large or deep graph; roll out tier by tier with health gates.
    Staged,
}

impl DeploymentStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            DeploymentStrategy::Single => "SINGLE",
            DeploymentStrategy::Sequential => "SEQUENTIAL",
            DeploymentStrategy::ParallelTiers => "PARALLEL TIERS",
            DeploymentStrategy::Staged => "STAGED",
        }
    }
}

/// One immutable record per analysis invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyDetectionRun {
    pub id: RunId,
    pub workspace: String,
    pub folder_path: String,
    pub detection_timestamp: u64,
    /// Service type name → best confidence and evidence.
    pub detected_patterns: BTreeMap<String, DetectedPattern>,
    pub service_graph: Option<GraphSnapshot>,
    /// Names of nodes recommended for deployment, in startup order.
    pub recommended_services: Vec<String>,
    pub deployment_strategy: Option<DeploymentStrategy>,
    pub status: RunStatus,
    pub total_services_detected: usize,
    pub error: Option<String>,
}

impl TopologyDetectionRun {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.workspace, self.id)
    }
}
