//! In-memory backend
//!
//! Simulates a provider entirely in process. Records live in a [`DashMap`]
//! keyed by backend ID and transitions settle after a configurable delay, so
//! the fleet core can be exercised without a real provider. Optionally the
//! inventory is snapshotted to a JSON file after every mutation.
//!
//! Test hooks allow failure injection: a provisioning budget, per-record
//! transition and exec failures, and records whose transitions never settle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tracing::{debug, warn};

use super::{
    BackendError, CreateRequest, ExecOutput, ExecRequest, InventorySource, LifecycleDriver,
    ProvisionError, Provisioner, RemoteExec, StateQuery, TagStore, Timeouts, Transfer,
    TransferDirection,
};
use crate::fleet::record::{BackendType, LifecycleState, Network, ResourceRecord, Role};

/// Produces the output of a simulated command
pub type ExecHandler =
    Arc<dyn Fn(&ResourceRecord, &ExecRequest) -> Result<ExecOutput, BackendError> + Send + Sync>;

#[derive(Debug, Clone)]
struct Entry {
    record: ResourceRecord,
    /// Pending settle: target state and the instant it is reached
    settles: Option<(LifecycleState, Instant)>,
}

impl Entry {
    fn settle(&mut self, now: Instant) {
        if let Some((target, at)) = self.settles {
            if now >= at {
                self.record.state = target;
                self.settles = None;
            }
        }
    }
}

/// Simulated backend holding records in memory
#[derive(Clone)]
pub struct MemoryBackend {
    records: Arc<DashMap<String, Entry>>,
    next_id: Arc<AtomicU64>,
    settle_delay: Duration,
    exec_delay: Duration,
    exec_handler: Option<ExecHandler>,
    provision_budget: Arc<AtomicUsize>,
    fail_transitions: Arc<DashSet<String>>,
    fail_exec: Arc<DashSet<String>>,
    fail_tags: Arc<DashSet<String>>,
    held: Arc<DashSet<String>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    exec_log: Arc<DashMap<String, Vec<ExecRequest>>>,
    files: Arc<DashMap<(String, String), Vec<u8>>>,
    state_file: Option<PathBuf>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend whose transitions settle immediately
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            settle_delay: Duration::ZERO,
            exec_delay: Duration::ZERO,
            exec_handler: None,
            provision_budget: Arc::new(AtomicUsize::new(usize::MAX)),
            fail_transitions: Arc::new(DashSet::new()),
            fail_exec: Arc::new(DashSet::new()),
            fail_tags: Arc::new(DashSet::new()),
            held: Arc::new(DashSet::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            exec_log: Arc::new(DashMap::new()),
            files: Arc::new(DashMap::new()),
            state_file: None,
        }
    }

    /// Open a backend persisted at `path`, starting empty if the file is absent
    ///
    /// Records caught mid-transition when the snapshot was written are loaded
    /// in the state they were heading to.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let mut backend = Self::new();
        backend.state_file = Some(path.to_path_buf());

        if !path.exists() {
            return Ok(backend);
        }

        let contents = std::fs::read_to_string(path)?;
        let records: Vec<ResourceRecord> = serde_json::from_str(&contents).map_err(|e| {
            BackendError::Unavailable(format!("corrupt state file {}: {}", path.display(), e))
        })?;

        let mut max_seq = 0u64;
        for mut record in records {
            record.state = match record.state {
                LifecycleState::Terminating => LifecycleState::Terminated,
                other => other.stable(),
            };
            if let Some(seq) = parse_seq(record.backend_id()) {
                max_seq = max_seq.max(seq);
            }
            backend.records.insert(
                record.backend_id().to_string(),
                Entry {
                    record,
                    settles: None,
                },
            );
        }
        backend.next_id.store(max_seq + 1, Ordering::SeqCst);
        debug!(
            "Loaded {} records from {}",
            backend.records.len(),
            path.display()
        );
        Ok(backend)
    }

    // =========================================================================
    // Simulation knobs
    // =========================================================================

    /// Transitions pass through their transient state for `delay`
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Every exec sleeps for `delay` before answering
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    /// Replace the default exec behaviour (empty output, exit 0)
    pub fn with_exec_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ResourceRecord, &ExecRequest) -> Result<ExecOutput, BackendError>
            + Send
            + Sync
            + 'static,
    {
        self.exec_handler = Some(Arc::new(handler));
        self
    }

    /// Allow only `count` more records to be provisioned
    pub fn limit_provisioning(&self, count: usize) {
        self.provision_budget.store(count, Ordering::SeqCst);
    }

    /// Lifecycle calls against `backend_id` fail
    pub fn fail_transitions_for(&self, backend_id: &str) {
        self.fail_transitions.insert(backend_id.to_string());
    }

    /// Exec and transfer calls against `backend_id` fail
    pub fn fail_exec_for(&self, backend_id: &str) {
        self.fail_exec.insert(backend_id.to_string());
    }

    /// Tag and expiry writes against `backend_id` fail
    pub fn fail_tags_for(&self, backend_id: &str) {
        self.fail_tags.insert(backend_id.to_string());
    }

    /// Transitions of `backend_id` enter their transient state and never settle
    pub fn hold_transitions_for(&self, backend_id: &str) {
        self.held.insert(backend_id.to_string());
    }

    // =========================================================================
    // Direct access
    // =========================================================================

    /// Insert a record as-is, assigning a backend ID when it has none
    pub fn insert(&self, mut record: ResourceRecord) -> ResourceRecord {
        if record.identity.backend_id.is_empty() {
            record.identity.backend_id = self.allocate_id();
        }
        record.identity.backend = BackendType::Memory;
        self.records.insert(
            record.backend_id().to_string(),
            Entry {
                record: record.clone(),
                settles: None,
            },
        );
        self.persist();
        record
    }

    /// Force a record into `state`, cancelling any pending settle
    pub fn set_state(&self, backend_id: &str, state: LifecycleState) -> Result<(), BackendError> {
        let mut entry = self
            .records
            .get_mut(backend_id)
            .ok_or_else(|| BackendError::RecordNotFound(backend_id.to_string()))?;
        entry.record.state = state;
        entry.settles = None;
        drop(entry);
        self.persist();
        Ok(())
    }

    /// Latest view of one record
    pub fn record(&self, backend_id: &str) -> Option<ResourceRecord> {
        self.records.get_mut(backend_id).map(|mut entry| {
            entry.settle(Instant::now());
            entry.record.clone()
        })
    }

    /// Highest number of exec/transfer calls observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Commands executed against `backend_id`, oldest first
    pub fn executed(&self, backend_id: &str) -> Vec<ExecRequest> {
        self.exec_log
            .get(backend_id)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    /// Contents of a file on a simulated record
    pub fn remote_file(&self, backend_id: &str, path: &str) -> Option<Vec<u8>> {
        self.files
            .get(&(backend_id.to_string(), path.to_string()))
            .map(|data| data.value().clone())
    }

    /// Place a file on a simulated record
    pub fn put_remote_file(&self, backend_id: &str, path: &str, data: impl Into<Vec<u8>>) {
        self.files
            .insert((backend_id.to_string(), path.to_string()), data.into());
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn allocate_id(&self) -> String {
        format!("mem-{:08}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        let mut records: Vec<ResourceRecord> =
            self.records.iter().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.backend_id().cmp(b.backend_id()));

        let result = serde_json::to_string_pretty(&records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)
            });
        if let Err(e) = result {
            warn!("Failed to persist state to {}: {}", path.display(), e);
        }
    }

    fn take_provision_slot(&self) -> bool {
        self.provision_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }

    /// Move a record towards `target` through `transient`
    fn begin_transition(
        &self,
        backend_id: &str,
        transient: LifecycleState,
        target: LifecycleState,
        immediate: bool,
    ) -> Result<(), BackendError> {
        if self.fail_transitions.contains(backend_id) {
            return Err(BackendError::CallFailed(format!(
                "simulated failure transitioning {}",
                backend_id
            )));
        }

        let mut entry = self
            .records
            .get_mut(backend_id)
            .ok_or_else(|| BackendError::RecordNotFound(backend_id.to_string()))?;
        entry.settle(Instant::now());

        if self.held.contains(backend_id) {
            entry.record.state = transient;
            entry.settles = None;
        } else if immediate || self.settle_delay.is_zero() {
            entry.record.state = target;
            entry.settles = None;
        } else {
            entry.record.state = transient;
            entry.settles = Some((target, Instant::now() + self.settle_delay));
        }
        drop(entry);
        self.persist();
        Ok(())
    }

    fn check_tag_write(&self, backend_id: &str) -> Result<(), BackendError> {
        if self.fail_tags.contains(backend_id) {
            return Err(BackendError::CallFailed(format!(
                "simulated failure tagging {}",
                backend_id
            )));
        }
        Ok(())
    }

    fn running_entry(&self, backend_id: &str) -> Result<ResourceRecord, BackendError> {
        let record = self
            .record(backend_id)
            .ok_or_else(|| BackendError::RecordNotFound(backend_id.to_string()))?;
        if record.state != LifecycleState::Running {
            return Err(BackendError::NotRunning(record.label()));
        }
        if self.fail_exec.contains(backend_id) {
            return Err(BackendError::Transport(format!(
                "simulated connection failure to {}",
                record.label()
            )));
        }
        Ok(record)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

/// Decrements the in-flight counter when dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn parse_seq(backend_id: &str) -> Option<u64> {
    backend_id.strip_prefix("mem-")?.parse().ok()
}

fn private_address(seq: u64) -> String {
    format!("10.0.{}.{}", (seq >> 8) & 0xff, seq & 0xff)
}

// ============================================================================
// Capability implementations
// ============================================================================

#[async_trait]
impl InventorySource for MemoryBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    async fn list_records(&self) -> Result<Vec<ResourceRecord>, BackendError> {
        let now = Instant::now();
        let mut records: Vec<ResourceRecord> = self
            .records
            .iter_mut()
            .map(|mut entry| {
                entry.settle(now);
                entry.record.clone()
            })
            .collect();
        records.sort_by(|a, b| a.backend_id().cmp(b.backend_id()));
        Ok(records)
    }
}

#[async_trait]
impl Provisioner for MemoryBackend {
    async fn create_records(
        &self,
        request: &CreateRequest,
    ) -> Result<Vec<ResourceRecord>, ProvisionError> {
        let mut created = Vec::with_capacity(request.count());

        for &node_no in &request.node_numbers {
            if !self.take_provision_slot() {
                self.persist();
                return Err(ProvisionError::new(
                    created,
                    BackendError::Provisioning(format!(
                        "capacity exhausted creating {}-{}",
                        request.cluster_name, node_no
                    )),
                ));
            }

            let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
            let backend_id = format!("mem-{:08}", seq);
            let mut record =
                ResourceRecord::instance(BackendType::Memory, &request.cluster_name, node_no, &backend_id);
            record.identity.cluster_uuid = request.cluster_uuid;
            record.tags.extend(request.spec.tags.clone());
            record.set_role(if request.spec.role == Role::Unmanaged {
                Role::from_tags(&record.tags)
            } else {
                request.spec.role
            });
            record.owner = request.owner.clone();
            record.expires_at = request.expires_at;
            record.instance_type = request.spec.instance_type.clone();
            record.network = Network {
                public: None,
                private: Some(private_address(seq)),
            };

            let settles = if self.settle_delay.is_zero() {
                record.state = LifecycleState::Running;
                None
            } else {
                record.state = LifecycleState::Starting;
                Some((LifecycleState::Running, Instant::now() + self.settle_delay))
            };

            debug!("Created {} as {}", record.label(), backend_id);
            self.records.insert(
                backend_id,
                Entry {
                    record: record.clone(),
                    settles,
                },
            );
            created.push(record);
        }

        self.persist();
        Ok(created)
    }
}

#[async_trait]
impl RemoteExec for MemoryBackend {
    async fn exec(
        &self,
        record: &ResourceRecord,
        request: &ExecRequest,
        timeouts: &Timeouts,
    ) -> Result<ExecOutput, BackendError> {
        let current = self.running_entry(record.backend_id())?;
        let _guard = self.enter();

        if !self.exec_delay.is_zero() {
            timeouts
                .in_session(tokio::time::sleep(self.exec_delay))
                .await?;
        }

        self.exec_log
            .entry(record.backend_id().to_string())
            .or_default()
            .push(request.clone());

        match &self.exec_handler {
            Some(handler) => handler(&current, request),
            None => Ok(ExecOutput::default()),
        }
    }

    async fn transfer(
        &self,
        record: &ResourceRecord,
        transfer: &Transfer,
        timeouts: &Timeouts,
    ) -> Result<(), BackendError> {
        self.running_entry(record.backend_id())?;
        let _guard = self.enter();
        let key = (record.backend_id().to_string(), transfer.remote.clone());

        let work = async {
            match transfer.direction {
                TransferDirection::Upload => {
                    let data = tokio::fs::read(&transfer.local).await?;
                    self.files.insert(key, data);
                    Ok::<(), BackendError>(())
                }
                TransferDirection::Download => {
                    let data = self
                        .files
                        .get(&key)
                        .map(|d| d.value().clone())
                        .ok_or_else(|| {
                            BackendError::CallFailed(format!(
                                "{}: no such file on {}",
                                transfer.remote,
                                record.label()
                            ))
                        })?;
                    tokio::fs::write(&transfer.local, data).await?;
                    Ok::<(), BackendError>(())
                }
            }
        };

        timeouts.in_session(work).await?
    }
}

#[async_trait]
impl StateQuery for MemoryBackend {
    async fn current_state(
        &self,
        record: &ResourceRecord,
    ) -> Result<LifecycleState, BackendError> {
        self.record(record.backend_id())
            .map(|r| r.state)
            .ok_or_else(|| BackendError::RecordNotFound(record.backend_id().to_string()))
    }
}

#[async_trait]
impl LifecycleDriver for MemoryBackend {
    async fn start(&self, record: &ResourceRecord) -> Result<(), BackendError> {
        self.begin_transition(
            record.backend_id(),
            LifecycleState::Starting,
            LifecycleState::Running,
            false,
        )
    }

    async fn stop(&self, record: &ResourceRecord, force: bool) -> Result<(), BackendError> {
        self.begin_transition(
            record.backend_id(),
            LifecycleState::Stopping,
            LifecycleState::Stopped,
            force,
        )
    }

    async fn terminate(&self, record: &ResourceRecord) -> Result<(), BackendError> {
        self.begin_transition(
            record.backend_id(),
            LifecycleState::Terminating,
            LifecycleState::Terminated,
            false,
        )
    }
}

#[async_trait]
impl TagStore for MemoryBackend {
    async fn add_tags(
        &self,
        record: &ResourceRecord,
        tags: &HashMap<String, String>,
    ) -> Result<(), BackendError> {
        self.check_tag_write(record.backend_id())?;
        let mut entry = self
            .records
            .get_mut(record.backend_id())
            .ok_or_else(|| BackendError::RecordNotFound(record.backend_id().to_string()))?;
        entry.record.tags.extend(tags.clone());
        entry.record.role = Role::from_tags(&entry.record.tags);
        drop(entry);
        self.persist();
        Ok(())
    }

    async fn remove_tags(
        &self,
        record: &ResourceRecord,
        keys: &[String],
    ) -> Result<(), BackendError> {
        self.check_tag_write(record.backend_id())?;
        let mut entry = self
            .records
            .get_mut(record.backend_id())
            .ok_or_else(|| BackendError::RecordNotFound(record.backend_id().to_string()))?;
        for key in keys {
            entry.record.tags.remove(key);
        }
        entry.record.role = Role::from_tags(&entry.record.tags);
        drop(entry);
        self.persist();
        Ok(())
    }

    async fn set_expiry(
        &self,
        record: &ResourceRecord,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError> {
        self.check_tag_write(record.backend_id())?;
        let mut entry = self
            .records
            .get_mut(record.backend_id())
            .ok_or_else(|| BackendError::RecordNotFound(record.backend_id().to_string()))?;
        entry.record.expires_at = expires_at;
        drop(entry);
        self.persist();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InstanceSpec;
    use uuid::Uuid;

    fn request(cluster: &str, nodes: Vec<u32>) -> CreateRequest {
        CreateRequest {
            cluster_name: cluster.to_string(),
            cluster_uuid: Uuid::new_v4(),
            node_numbers: nodes,
            spec: InstanceSpec {
                image: "ubuntu:24.04".to_string(),
                role: Role::Server,
                ..InstanceSpec::default()
            },
            owner: Some("alice".to_string()),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_identity() {
        let backend = MemoryBackend::new();
        let req = request("mydc", vec![1, 2]);
        let created = backend.create_records(&req).await.unwrap();

        assert_eq!(created.len(), 2);
        assert_eq!(created[0].backend_id(), "mem-00000001");
        assert_eq!(created[1].node_no(), Some(2));
        assert!(created.iter().all(|r| r.identity.cluster_uuid == req.cluster_uuid));
        assert!(created.iter().all(|r| r.role == Role::Server));
        assert!(created.iter().all(|r| r.state == LifecycleState::Running));
        assert_eq!(backend.list_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_provisioning_budget_reports_partial_creation() {
        let backend = MemoryBackend::new();
        backend.limit_provisioning(1);
        let err = backend
            .create_records(&request("mydc", vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert_eq!(err.created.len(), 1);
        assert!(matches!(err.source, BackendError::Provisioning(_)));
        assert_eq!(backend.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_settle_after_delay() {
        let backend = MemoryBackend::new().with_settle_delay(Duration::from_millis(20));
        let record = backend.insert(
            ResourceRecord::instance(BackendType::Memory, "mydc", 1, "")
                .with_state(LifecycleState::Running),
        );

        backend.stop(&record, false).await.unwrap();
        assert_eq!(
            backend.current_state(&record).await.unwrap(),
            LifecycleState::Stopping
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            backend.current_state(&record).await.unwrap(),
            LifecycleState::Stopped
        );
    }

    #[tokio::test]
    async fn test_forced_stop_is_immediate() {
        let backend = MemoryBackend::new().with_settle_delay(Duration::from_secs(60));
        let record = backend.insert(
            ResourceRecord::instance(BackendType::Memory, "mydc", 1, "")
                .with_state(LifecycleState::Running),
        );
        backend.stop(&record, true).await.unwrap();
        assert_eq!(
            backend.current_state(&record).await.unwrap(),
            LifecycleState::Stopped
        );
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let backend = MemoryBackend::new();
        let record = backend.insert(
            ResourceRecord::instance(BackendType::Memory, "mydc", 1, "")
                .with_state(LifecycleState::Stopped),
        );
        let err = backend
            .exec(&record, &ExecRequest::shell("true"), &Timeouts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_exec_uses_handler_and_logs() {
        let backend = MemoryBackend::new().with_exec_handler(|record, _req| {
            Ok(ExecOutput {
                stdout: record.label(),
                ..ExecOutput::default()
            })
        });
        let record = backend.insert(
            ResourceRecord::instance(BackendType::Memory, "mydc", 4, "")
                .with_state(LifecycleState::Running),
        );
        let out = backend
            .exec(&record, &ExecRequest::shell("hostname"), &Timeouts::default())
            .await
            .unwrap();
        assert_eq!(out.stdout, "mydc-4");
        assert_eq!(backend.executed(record.backend_id()).len(), 1);
    }

    #[tokio::test]
    async fn test_exec_delay_respects_timeout() {
        let backend = MemoryBackend::new().with_exec_delay(Duration::from_secs(5));
        let record = backend.insert(
            ResourceRecord::instance(BackendType::Memory, "mydc", 1, "")
                .with_state(LifecycleState::Running),
        );
        let err = backend
            .exec(
                &record,
                &ExecRequest::shell("sleep"),
                &Timeouts::new(Duration::from_secs(1), Some(Duration::from_millis(20))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_tags_and_expiry() {
        let backend = MemoryBackend::new();
        let record = backend.insert(ResourceRecord::instance(BackendType::Memory, "mydc", 1, ""));

        let mut tags = HashMap::new();
        tags.insert("team".to_string(), "db".to_string());
        tags.insert(crate::fleet::record::TAG_ROLE.to_string(), "client".to_string());
        backend.add_tags(&record, &tags).await.unwrap();
        let updated = backend.record(record.backend_id()).unwrap();
        assert_eq!(updated.tags.get("team").unwrap(), "db");
        assert_eq!(updated.role, Role::Client);

        backend
            .remove_tags(&record, &["team".to_string()])
            .await
            .unwrap();
        let expiry = Utc::now();
        backend.set_expiry(&record, Some(expiry)).await.unwrap();
        let updated = backend.record(record.backend_id()).unwrap();
        assert!(!updated.tags.contains_key("team"));
        assert_eq!(updated.expires_at, Some(expiry));
    }

    #[tokio::test]
    async fn test_state_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let backend = MemoryBackend::open(&path).unwrap();
        backend.create_records(&request("mydc", vec![1, 2])).await.unwrap();
        assert!(path.exists());

        let reopened = MemoryBackend::open(&path).unwrap();
        let records = reopened.list_records().await.unwrap();
        assert_eq!(records.len(), 2);

        let more = reopened.create_records(&request("mydc", vec![3])).await.unwrap();
        assert_eq!(more[0].backend_id(), "mem-00000003");
    }
}
