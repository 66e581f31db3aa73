//! Backend capabilities
//!
//! The fleet core never talks to a cloud API or container runtime directly.
//! It consumes a handful of narrow capabilities, each an object-safe async
//! trait, and every concrete backend implements all of them:
//!
//! - [`InventorySource`] - list the records the backend currently holds
//! - [`Provisioner`] - create new instance records
//! - [`RemoteExec`] - run commands and move files on a record
//! - [`StateQuery`] - observe a record's lifecycle state
//! - [`LifecycleDriver`] - issue start/stop/terminate calls
//! - [`TagStore`] - mutate tags and expiry

pub mod docker;
pub mod memory;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{BackendConfig, BackendKind};
use crate::fleet::record::{BackendType, LifecycleState, ResourceRecord, Role};

pub use docker::DockerBackend;
pub use memory::MemoryBackend;

/// Errors reported by a backend for a single call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Record '{0}' not found")]
    RecordNotFound(String),

    #[error("Instance not running: {0}")]
    NotRunning(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend call failed: {0}")]
    CallFailed(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

/// A provisioning call that stopped part way
///
/// `created` holds every record that was successfully created before the
/// failure so callers never lose track of applied state.
#[derive(Error, Debug, Clone)]
#[error("provisioning stopped after {} record(s): {source}", .created.len())]
pub struct ProvisionError {
    pub created: Vec<ResourceRecord>,
    #[source]
    pub source: BackendError,
}

impl ProvisionError {
    pub fn new(created: Vec<ResourceRecord>, source: BackendError) -> Self {
        Self { created, source }
    }
}

/// Backend-independent shape of the instances to create
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Image or template to boot from
    pub image: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    #[serde(default)]
    pub role: Role,

    /// Extra tags applied to every created record
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Request to create instance records
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub cluster_name: String,

    /// Existing cluster UUID when growing, a fresh one when creating
    pub cluster_uuid: Uuid,

    /// Node numbers to assign, one record per entry
    pub node_numbers: Vec<u32>,

    pub spec: InstanceSpec,

    pub owner: Option<String>,

    pub expires_at: Option<DateTime<Utc>>,
}

impl CreateRequest {
    pub fn count(&self) -> usize {
        self.node_numbers.len()
    }
}

/// A command to run on a record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecRequest {
    /// Program and arguments
    pub command: Vec<String>,

    /// Extra environment variables
    pub env: Vec<(String, String)>,

    /// Data fed to the command's standard input
    pub stdin: Option<String>,

    /// Remote user; backend default when absent
    pub username: Option<String>,
}

impl ExecRequest {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Run a script through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }

    /// Builder: add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Builder: feed data on standard input
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Direction of a file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// A file transfer between the local machine and a record
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub local: PathBuf,
    pub remote: String,
}

impl Transfer {
    pub fn upload(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Upload,
            local: local.into(),
            remote: remote.into(),
        }
    }

    pub fn download(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self {
            direction: TransferDirection::Download,
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// Per-call bounds for remote operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on reaching the record and starting the operation
    pub connect: Duration,
    /// Bound on the whole operation; unbounded when absent
    pub session: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            session: None,
        }
    }
}

impl Timeouts {
    pub fn new(connect: Duration, session: Option<Duration>) -> Self {
        Self { connect, session }
    }

    /// Await `fut`, bounded by the session timeout when one is set
    pub async fn in_session<F, T>(&self, fut: F) -> Result<T, BackendError>
    where
        F: std::future::Future<Output = T>,
    {
        match self.session {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| BackendError::Timeout(limit)),
            None => Ok(fut.await),
        }
    }

    /// Await `fut`, bounded by the connect timeout
    pub async fn connecting<F, T>(&self, fut: F) -> Result<T, BackendError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.connect, fut)
            .await
            .map_err(|_| BackendError::Timeout(self.connect))
    }
}

// ============================================================================
// Capability traits
// ============================================================================

#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Which backend this is
    fn backend_type(&self) -> BackendType;

    /// Every record the backend knows about, terminated ones included
    async fn list_records(&self) -> Result<Vec<ResourceRecord>, BackendError>;
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_records(
        &self,
        request: &CreateRequest,
    ) -> Result<Vec<ResourceRecord>, ProvisionError>;
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(
        &self,
        record: &ResourceRecord,
        request: &ExecRequest,
        timeouts: &Timeouts,
    ) -> Result<ExecOutput, BackendError>;

    async fn transfer(
        &self,
        record: &ResourceRecord,
        transfer: &Transfer,
        timeouts: &Timeouts,
    ) -> Result<(), BackendError>;
}

#[async_trait]
pub trait StateQuery: Send + Sync {
    async fn current_state(&self, record: &ResourceRecord)
        -> Result<LifecycleState, BackendError>;
}

#[async_trait]
pub trait LifecycleDriver: Send + Sync {
    async fn start(&self, record: &ResourceRecord) -> Result<(), BackendError>;

    /// `force` skips any graceful shutdown period
    async fn stop(&self, record: &ResourceRecord, force: bool) -> Result<(), BackendError>;

    async fn terminate(&self, record: &ResourceRecord) -> Result<(), BackendError>;
}

#[async_trait]
pub trait TagStore: Send + Sync {
    async fn add_tags(
        &self,
        record: &ResourceRecord,
        tags: &HashMap<String, String>,
    ) -> Result<(), BackendError>;

    async fn remove_tags(&self, record: &ResourceRecord, keys: &[String])
        -> Result<(), BackendError>;

    async fn set_expiry(
        &self,
        record: &ResourceRecord,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError>;
}

/// Everything the fleet core needs from one backend
pub trait Backend:
    InventorySource + Provisioner + RemoteExec + StateQuery + LifecycleDriver + TagStore
{
}

impl<T> Backend for T where
    T: InventorySource + Provisioner + RemoteExec + StateQuery + LifecycleDriver + TagStore
{
}

/// Shared handle to a backend
pub type SharedBackend = Arc<dyn Backend>;

/// Build the backend selected by configuration
pub fn build_backend(config: &BackendConfig) -> Result<SharedBackend, BackendError> {
    match config.kind {
        BackendKind::Memory => {
            let backend = match config.state_path() {
                Some(path) => MemoryBackend::open(path)?,
                None => MemoryBackend::new(),
            };
            Ok(Arc::new(backend))
        }
        BackendKind::Docker => Ok(Arc::new(DockerBackend::new(config.docker.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_request_builders() {
        let req = ExecRequest::shell("echo hi")
            .with_env("A", "1")
            .with_stdin("data");
        assert_eq!(req.command, vec!["sh", "-c", "echo hi"]);
        assert_eq!(req.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(req.stdin.as_deref(), Some("data"));
    }

    #[test]
    fn test_provision_error_message_counts_created() {
        let err = ProvisionError::new(Vec::new(), BackendError::Provisioning("quota".into()));
        assert_eq!(
            err.to_string(),
            "provisioning stopped after 0 record(s): Provisioning failed: quota"
        );
    }

    #[test]
    fn test_transfer_constructors() {
        let up = Transfer::upload("/tmp/a", "/opt/a");
        assert_eq!(up.direction, TransferDirection::Upload);
        let down = Transfer::download("/opt/b", "/tmp/b");
        assert_eq!(down.direction, TransferDirection::Download);
        assert_eq!(down.remote, "/opt/b");
    }

    #[tokio::test]
    async fn test_session_timeout_bounds_future() {
        let timeouts = Timeouts::new(Duration::from_secs(1), Some(Duration::from_millis(10)));
        let err = timeouts
            .in_session(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_millis(10)));

        let unbounded = Timeouts::default();
        assert_eq!(unbounded.in_session(async { 7 }).await, Ok(7));
    }

    #[test]
    fn test_build_memory_backend_without_state_file() {
        let config = BackendConfig::default();
        let backend = build_backend(&config).unwrap();
        assert_eq!(backend.backend_type(), BackendType::Memory);
    }
}
