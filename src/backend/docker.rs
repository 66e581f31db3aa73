//! Docker backend
//!
//! Each instance is a container managed through the `docker` CLI. Identity
//! and metadata live in container labels, so inventory is rebuilt from
//! `docker inspect` on every listing. Labels are fixed at creation, which
//! makes tag and expiry mutation unavailable on this backend.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BackendError, CreateRequest, ExecOutput, ExecRequest, InventorySource, LifecycleDriver,
    ProvisionError, Provisioner, RemoteExec, StateQuery, TagStore, Timeouts, Transfer,
    TransferDirection,
};
use crate::fleet::record::{
    Architecture, BackendType, Identity, LifecycleState, Network, OsInfo, RecordKind,
    ResourceRecord, Role, TAG_ROLE,
};

pub const LABEL_MANAGED: &str = "fleet.managed";
pub const LABEL_CLUSTER: &str = "fleet.cluster";
pub const LABEL_CLUSTER_UUID: &str = "fleet.cluster-uuid";
pub const LABEL_NODE: &str = "fleet.node";
pub const LABEL_OWNER: &str = "fleet.owner";
pub const LABEL_EXPIRES: &str = "fleet.expires";
pub const LABEL_INSTANCE_TYPE: &str = "fleet.instance-type";
pub const LABEL_ARCH: &str = "fleet.arch";
pub const LABEL_OS_NAME: &str = "fleet.os-name";
pub const LABEL_OS_VERSION: &str = "fleet.os-version";

/// Prefix for user tags stored as labels
pub const LABEL_TAG_PREFIX: &str = "fleet.tag.";

/// Docker backend configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DockerConfig {
    /// Image used when the instance spec names none
    #[serde(default = "default_image")]
    pub image: String,

    /// Network to attach containers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Command keeping the container alive
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    /// Grace period for `docker stop`
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Run containers privileged
    #[serde(default)]
    pub privileged: bool,

    /// Volume mounts: ["host:container", ...]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            network: None,
            command: default_command(),
            stop_timeout_secs: default_stop_timeout(),
            privileged: false,
            volumes: Vec::new(),
        }
    }
}

fn default_image() -> String {
    "ubuntu:24.04".to_string()
}

fn default_command() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}

fn default_stop_timeout() -> u64 {
    10
}

/// Container name for a node
pub fn container_name(cluster: &str, node_no: u32) -> String {
    let sanitized: String = cluster
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("fleet-{}-{}", sanitized, node_no)
}

/// Labels describing one node of a create request
pub fn node_labels(request: &CreateRequest, node_no: u32) -> Vec<(String, String)> {
    let mut labels = vec![
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_CLUSTER.to_string(), request.cluster_name.clone()),
        (LABEL_CLUSTER_UUID.to_string(), request.cluster_uuid.to_string()),
        (LABEL_NODE.to_string(), node_no.to_string()),
    ];
    if let Some(owner) = &request.owner {
        labels.push((LABEL_OWNER.to_string(), owner.clone()));
    }
    if let Some(expires) = &request.expires_at {
        labels.push((LABEL_EXPIRES.to_string(), expires.to_rfc3339()));
    }
    if let Some(instance_type) = &request.spec.instance_type {
        labels.push((LABEL_INSTANCE_TYPE.to_string(), instance_type.clone()));
    }
    if let Some(role) = request.spec.role.tag_value() {
        labels.push((format!("{}{}", LABEL_TAG_PREFIX, TAG_ROLE), role.to_string()));
    }
    let mut tags: Vec<_> = request.spec.tags.iter().collect();
    tags.sort();
    for (key, value) in tags {
        labels.push((format!("{}{}", LABEL_TAG_PREFIX, key), value.clone()));
    }
    labels
}

/// Generate `docker run` arguments for one node
pub fn generate_run_args(config: &DockerConfig, request: &CreateRequest, node_no: u32) -> Vec<String> {
    let name = container_name(&request.cluster_name, node_no);
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.clone(),
        "--hostname".to_string(),
        name,
    ];

    if let Some(network) = &config.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }

    if config.privileged {
        args.push("--privileged".to_string());
    }

    for vol in &config.volumes {
        args.push("-v".to_string());
        args.push(shellexpand::tilde(vol).into_owned());
    }

    for (key, value) in node_labels(request, node_no) {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    if request.spec.image.is_empty() {
        args.push(config.image.clone());
    } else {
        args.push(request.spec.image.clone());
    }
    args.extend(config.command.iter().cloned());
    args
}

/// Generate `docker stop` arguments; `force` skips the grace period
pub fn generate_stop_args(config: &DockerConfig, id: &str, force: bool) -> Vec<String> {
    let grace = if force { 0 } else { config.stop_timeout_secs };
    vec![
        "stop".to_string(),
        "-t".to_string(),
        grace.to_string(),
        id.to_string(),
    ]
}

/// Generate `docker exec` arguments
pub fn generate_exec_args(id: &str, request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if request.stdin.is_some() {
        args.push("-i".to_string());
    }
    if let Some(user) = &request.username {
        args.push("-u".to_string());
        args.push(user.clone());
    }
    for (key, value) in &request.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(id.to_string());
    args.extend(request.command.iter().cloned());
    args
}

/// Generate `docker cp` arguments
pub fn generate_cp_args(id: &str, transfer: &Transfer) -> Vec<String> {
    let local = transfer.local.to_string_lossy().into_owned();
    let remote = format!("{}:{}", id, transfer.remote);
    match transfer.direction {
        TransferDirection::Upload => vec!["cp".to_string(), local, remote],
        TransferDirection::Download => vec!["cp".to_string(), remote, local],
    }
}

/// Map a container status onto a lifecycle state
pub fn map_container_status(status: &str) -> LifecycleState {
    match status {
        "created" => LifecycleState::Pending,
        "running" | "paused" => LifecycleState::Running,
        "restarting" => LifecycleState::Starting,
        "exited" => LifecycleState::Stopped,
        "removing" => LifecycleState::Terminating,
        _ => LifecycleState::Terminated,
    }
}

fn label<'a>(labels: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    labels.get(key).and_then(Value::as_str)
}

/// Build records from `docker inspect` output
///
/// Containers without the managed label are skipped.
pub fn parse_inspect(json: &str) -> Result<Vec<ResourceRecord>, BackendError> {
    let containers: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| BackendError::CallFailed(format!("unparseable docker inspect output: {}", e)))?;

    let empty = serde_json::Map::new();
    let mut records = Vec::new();

    for container in containers {
        let labels = container["Config"]["Labels"].as_object().unwrap_or(&empty);
        if label(labels, LABEL_MANAGED) != Some("true") {
            continue;
        }

        let tags: HashMap<String, String> = labels
            .iter()
            .filter_map(|(k, v)| {
                let key = k.strip_prefix(LABEL_TAG_PREFIX)?;
                Some((key.to_string(), v.as_str()?.to_string()))
            })
            .collect();

        let private = container["NetworkSettings"]["Networks"]
            .as_object()
            .and_then(|nets| {
                nets.values()
                    .filter_map(|n| n["IPAddress"].as_str())
                    .find(|ip| !ip.is_empty())
            })
            .map(str::to_string);

        let created_at = container["Created"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let os = match (label(labels, LABEL_OS_NAME), label(labels, LABEL_OS_VERSION)) {
            (Some(name), Some(version)) => Some(OsInfo {
                name: name.to_string(),
                version: version.to_string(),
            }),
            _ => None,
        };

        records.push(ResourceRecord {
            kind: RecordKind::Instance,
            identity: Identity {
                backend: BackendType::Docker,
                zone: "local".to_string(),
                cluster_name: label(labels, LABEL_CLUSTER).unwrap_or_default().to_string(),
                cluster_uuid: label(labels, LABEL_CLUSTER_UUID)
                    .and_then(|s| s.parse::<Uuid>().ok())
                    .unwrap_or_else(Uuid::nil),
                node_no: label(labels, LABEL_NODE).and_then(|s| s.parse().ok()),
                backend_id: container["Id"].as_str().unwrap_or_default().to_string(),
            },
            role: Role::from_tags(&tags),
            tags,
            state: map_container_status(
                container["State"]["Status"].as_str().unwrap_or_default(),
            ),
            owner: label(labels, LABEL_OWNER).map(str::to_string),
            created_at,
            expires_at: label(labels, LABEL_EXPIRES)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            network: Network {
                public: None,
                private,
            },
            architecture: label(labels, LABEL_ARCH).and_then(|s| s.parse::<Architecture>().ok()),
            os,
            instance_type: label(labels, LABEL_INSTANCE_TYPE).map(str::to_string),
        });
    }

    Ok(records)
}

/// Backend driving containers through the docker CLI
#[derive(Debug, Clone)]
pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Run `docker` with `args`, failing on non-zero exit
    async fn docker(&self, args: &[String]) -> Result<String, BackendError> {
        debug!("docker {:?}", args);
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::Unavailable(format!("failed to run docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::CallFailed(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn inspect(&self, ids: &[String]) -> Result<Vec<ResourceRecord>, BackendError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string()];
        args.extend(ids.iter().cloned());
        parse_inspect(&self.docker(&args).await?)
    }

    async fn run_exec(
        &self,
        id: &str,
        request: &ExecRequest,
        timeouts: &Timeouts,
    ) -> Result<ExecOutput, BackendError> {
        let args = generate_exec_args(id, request);
        debug!("docker {:?}", args);

        let child = timeouts
            .connecting(async {
                let mut child = Command::new("docker")
                    .args(&args)
                    .stdin(if request.stdin.is_some() {
                        Stdio::piped()
                    } else {
                        Stdio::null()
                    })
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        BackendError::Unavailable(format!("failed to run docker: {}", e))
                    })?;

                if let (Some(data), Some(mut stdin)) = (&request.stdin, child.stdin.take()) {
                    stdin
                        .write_all(data.as_bytes())
                        .await
                        .map_err(|e| BackendError::Transport(e.to_string()))?;
                }
                Ok::<_, BackendError>(child)
            })
            .await??;

        let output = timeouts
            .in_session(child.wait_with_output())
            .await?
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

// ============================================================================
// Capability implementations
// ============================================================================

#[async_trait]
impl InventorySource for DockerBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Docker
    }

    async fn list_records(&self) -> Result<Vec<ResourceRecord>, BackendError> {
        let ids = self
            .docker(&[
                "ps".to_string(),
                "-aq".to_string(),
                "--no-trunc".to_string(),
                "--filter".to_string(),
                format!("label={}=true", LABEL_MANAGED),
            ])
            .await?;
        let ids: Vec<String> = ids.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
        self.inspect(&ids).await
    }
}

#[async_trait]
impl Provisioner for DockerBackend {
    async fn create_records(
        &self,
        request: &CreateRequest,
    ) -> Result<Vec<ResourceRecord>, ProvisionError> {
        let mut created = Vec::with_capacity(request.count());

        for &node_no in &request.node_numbers {
            let args = generate_run_args(&self.config, request, node_no);
            let id = match self.docker(&args).await {
                Ok(out) => out.trim().to_string(),
                Err(e) => return Err(ProvisionError::new(created, e)),
            };
            info!("Created container {} for {}-{}", id, request.cluster_name, node_no);

            match self.inspect(&[id]).await {
                Ok(mut records) if !records.is_empty() => created.push(records.remove(0)),
                Ok(_) => {
                    return Err(ProvisionError::new(
                        created,
                        BackendError::Provisioning(format!(
                            "container for {}-{} vanished after creation",
                            request.cluster_name, node_no
                        )),
                    ))
                }
                Err(e) => return Err(ProvisionError::new(created, e)),
            }
        }

        Ok(created)
    }
}

#[async_trait]
impl RemoteExec for DockerBackend {
    async fn exec(
        &self,
        record: &ResourceRecord,
        request: &ExecRequest,
        timeouts: &Timeouts,
    ) -> Result<ExecOutput, BackendError> {
        self.run_exec(record.backend_id(), request, timeouts).await
    }

    async fn transfer(
        &self,
        record: &ResourceRecord,
        transfer: &Transfer,
        timeouts: &Timeouts,
    ) -> Result<(), BackendError> {
        let args = generate_cp_args(record.backend_id(), transfer);
        timeouts.in_session(self.docker(&args)).await??;
        Ok(())
    }
}

#[async_trait]
impl StateQuery for DockerBackend {
    async fn current_state(
        &self,
        record: &ResourceRecord,
    ) -> Result<LifecycleState, BackendError> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Status}}".to_string(),
            record.backend_id().to_string(),
        ];
        match self.docker(&args).await {
            Ok(status) => Ok(map_container_status(status.trim())),
            // A removed container is gone for good
            Err(BackendError::CallFailed(msg)) if msg.contains("No such") => {
                Ok(LifecycleState::Terminated)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl LifecycleDriver for DockerBackend {
    async fn start(&self, record: &ResourceRecord) -> Result<(), BackendError> {
        self.docker(&["start".to_string(), record.backend_id().to_string()])
            .await
            .map(|_| ())
    }

    async fn stop(&self, record: &ResourceRecord, force: bool) -> Result<(), BackendError> {
        self.docker(&generate_stop_args(&self.config, record.backend_id(), force))
            .await
            .map(|_| ())
    }

    async fn terminate(&self, record: &ResourceRecord) -> Result<(), BackendError> {
        self.docker(&[
            "rm".to_string(),
            "-f".to_string(),
            record.backend_id().to_string(),
        ])
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl TagStore for DockerBackend {
    async fn add_tags(
        &self,
        _record: &ResourceRecord,
        _tags: &HashMap<String, String>,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unavailable(
            "container labels cannot be changed after creation".to_string(),
        ))
    }

    async fn remove_tags(
        &self,
        _record: &ResourceRecord,
        _keys: &[String],
    ) -> Result<(), BackendError> {
        Err(BackendError::Unavailable(
            "container labels cannot be changed after creation".to_string(),
        ))
    }

    async fn set_expiry(
        &self,
        _record: &ResourceRecord,
        _expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unavailable(
            "container labels cannot be changed after creation".to_string(),
        ))
    }
}
