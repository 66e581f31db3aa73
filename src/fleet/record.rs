//! Resource records - the atomic unit of the fleet inventory
//!
//! A record is an instance, volume, image or firewall owned by one backend.
//! Instances carry a cluster name and node number; every record carries a
//! lifecycle state, an owner and a free-form tag map.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved tag key holding the record's role discriminator
pub const TAG_ROLE: &str = "fleet.role";

/// Reserved tag key holding the installed software version
pub const TAG_SOFTWARE_VERSION: &str = "fleet.software-version";

/// Backend that owns a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-process simulated backend
    Memory,
    /// Local container runtime
    Docker,
    /// Amazon Web Services
    Aws,
    /// Google Cloud Platform
    Gcp,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Memory => "memory",
            BackendType::Docker => "docker",
            BackendType::Aws => "aws",
            BackendType::Gcp => "gcp",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendType::Memory),
            "docker" => Ok(BackendType::Docker),
            "aws" => Ok(BackendType::Aws),
            "gcp" => Ok(BackendType::Gcp),
            other => Err(format!("unknown backend type: {}", other)),
        }
    }
}

/// What kind of resource a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Instance,
    Volume,
    Image,
    Firewall,
}

/// Role of a record within the fleet
///
/// Derived from the reserved [`TAG_ROLE`] tag. User tags live in
/// [`ResourceRecord::tags`] alongside it and are never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Database server node
    Server,
    /// Client machine
    Client,
    /// Log-analysis appliance
    Agi,
    /// Scratch instance used while building a template image
    TemplateBuild,
    /// No role tag present
    #[default]
    Unmanaged,
}

impl Role {
    /// Value stored under [`TAG_ROLE`]; `None` for unmanaged records
    pub fn tag_value(&self) -> Option<&'static str> {
        match self {
            Role::Server => Some("server"),
            Role::Client => Some("client"),
            Role::Agi => Some("agi"),
            Role::TemplateBuild => Some("template-build"),
            Role::Unmanaged => None,
        }
    }

    /// Resolve a role from a tag map
    pub fn from_tags(tags: &HashMap<String, String>) -> Self {
        match tags.get(TAG_ROLE).map(String::as_str) {
            Some("server") => Role::Server,
            Some("client") => Role::Client,
            Some("agi") => Role::Agi,
            Some("template-build") => Role::TemplateBuild,
            _ => Role::Unmanaged,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            "agi" => Ok(Role::Agi),
            "template-build" => Ok(Role::TemplateBuild),
            "unmanaged" => Ok(Role::Unmanaged),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Lifecycle state of a record
///
/// `Starting` and `Stopping` are transient; [`LifecycleState::stable`]
/// collapses them for querying. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LifecycleState {
    #[default]
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
}

impl LifecycleState {
    /// Terminated records accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Terminated)
    }

    /// Whether the record is in a transient state that settles on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Stopping)
    }

    /// Caller-visible state: transient states collapse onto their destination
    pub fn stable(&self) -> LifecycleState {
        match self {
            LifecycleState::Starting => LifecycleState::Running,
            LifecycleState::Stopping => LifecycleState::Stopped,
            other => *other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "Pending",
            LifecycleState::Starting => "Starting",
            LifecycleState::Running => "Running",
            LifecycleState::Stopping => "Stopping",
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Terminating => "Terminating",
            LifecycleState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(LifecycleState::Pending),
            "starting" => Ok(LifecycleState::Starting),
            "running" => Ok(LifecycleState::Running),
            "stopping" => Ok(LifecycleState::Stopping),
            "stopped" => Ok(LifecycleState::Stopped),
            "terminating" => Ok(LifecycleState::Terminating),
            "terminated" => Ok(LifecycleState::Terminated),
            other => Err(format!("unknown lifecycle state: {}", other)),
        }
    }
}

/// CPU architecture of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            other => Err(format!("unknown architecture: {}", other)),
        }
    }
}

/// Operating system of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub name: String,
    pub version: String,
}

/// Where a record lives and how it is addressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Owning backend
    pub backend: BackendType,

    /// Zone or region
    pub zone: String,

    /// Logical cluster grouping
    #[serde(rename = "clusterName")]
    pub cluster_name: String,

    /// Shared by every member of one cluster incarnation
    #[serde(rename = "clusterUuid")]
    pub cluster_uuid: Uuid,

    /// 1-based position within the cluster (instances only)
    #[serde(rename = "nodeNo")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_no: Option<u32>,

    /// Opaque backend-native identifier
    #[serde(rename = "backendId")]
    pub backend_id: String,
}

/// Addresses of a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
}

impl Network {
    /// Address to connect to: public when present, otherwise private
    pub fn routable(&self) -> Option<&str> {
        self.public.as_deref().or(self.private.as_deref())
    }
}

/// A single inventory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: RecordKind,

    pub identity: Identity,

    /// Role resolved from the reserved role tag
    #[serde(default)]
    pub role: Role,

    /// Free-form tags, reserved keys included
    #[serde(default)]
    pub tags: HashMap<String, String>,

    pub state: LifecycleState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    /// After this time external automation may reclaim the record
    #[serde(rename = "expiresAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub network: Network,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,

    #[serde(rename = "instanceType")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

impl ResourceRecord {
    /// Create a pending instance record
    pub fn instance(
        backend: BackendType,
        cluster_name: impl Into<String>,
        node_no: u32,
        backend_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: RecordKind::Instance,
            identity: Identity {
                backend,
                zone: "local".to_string(),
                cluster_name: cluster_name.into(),
                cluster_uuid: Uuid::new_v4(),
                node_no: Some(node_no),
                backend_id: backend_id.into(),
            },
            role: Role::Unmanaged,
            tags: HashMap::new(),
            state: LifecycleState::Pending,
            owner: None,
            created_at: Utc::now(),
            expires_at: None,
            network: Network::default(),
            architecture: None,
            os: None,
            instance_type: None,
        }
    }

    /// Builder: set the lifecycle state
    pub fn with_state(mut self, state: LifecycleState) -> Self {
        self.state = state;
        self
    }

    /// Builder: set the role and its reserved tag
    pub fn with_role(mut self, role: Role) -> Self {
        self.set_role(role);
        self
    }

    /// Builder: add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder: set the owner
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Builder: set the zone
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.identity.zone = zone.into();
        self
    }

    /// Set the role, keeping the reserved tag in sync
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
        match role.tag_value() {
            Some(value) => {
                self.tags.insert(TAG_ROLE.to_string(), value.to_string());
            }
            None => {
                self.tags.remove(TAG_ROLE);
            }
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.identity.cluster_name
    }

    pub fn node_no(&self) -> Option<u32> {
        self.identity.node_no
    }

    pub fn backend_id(&self) -> &str {
        &self.identity.backend_id
    }

    pub fn software_version(&self) -> Option<&str> {
        self.tags.get(TAG_SOFTWARE_VERSION).map(String::as_str)
    }

    /// Whether the record's expiry lies before `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t < now).unwrap_or(false)
    }

    /// Short human label, e.g. `mydc-3`
    pub fn label(&self) -> String {
        match self.identity.node_no {
            Some(n) => format!("{}-{}", self.identity.cluster_name, n),
            None => format!("{}/{}", self.identity.cluster_name, self.identity.backend_id),
        }
    }

    /// Compact identity used in error reports
    pub fn reference(&self) -> RecordRef {
        RecordRef {
            cluster_name: self.identity.cluster_name.clone(),
            node_no: self.identity.node_no,
            backend_id: self.identity.backend_id.clone(),
        }
    }
}

/// Identity of a record as carried inside errors
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub cluster_name: String,
    pub node_no: Option<u32>,
    pub backend_id: String,
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node_no {
            Some(n) => write!(f, "{}-{} ({})", self.cluster_name, n, self.backend_id),
            None => write!(f, "{} ({})", self.cluster_name, self.backend_id),
        }
    }
}
