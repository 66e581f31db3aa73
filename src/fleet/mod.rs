//! Fleet core
//!
//! - [`record`] - resource records, roles and lifecycle states
//! - [`collection`] - immutable, chainable queries over records
//! - [`node_range`] - `1,3,5-7` node selections
//! - [`lifecycle`] - transition rules and poll-until-converged
//! - [`executor`] - bounded, all-attempt parallel execution
//! - [`reconcile`] - desired-count reconciliation
//! - [`hosts`] - hosts file rollout
//!
//! [`Fleet`] ties a backend and a [`FleetConfig`] to the core operations.

pub mod collection;
pub mod executor;
pub mod hosts;
pub mod lifecycle;
pub mod node_range;
pub mod reconcile;
pub mod record;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use collection::{Collection, Filter, FilterError, NotFoundError};
pub use executor::{
    run_parallel, AggregateError, BatchReport, Concurrency, ExecutorError, ParallelOptions,
    RecordError, RecordFailure, RecordOutcome,
};
pub use lifecycle::{apply_transition, LifecycleError, Transition};
pub use node_range::{expand_node_range, NodeRangeError, NodeSelection};
pub use reconcile::{ReconcileAction, ReconcileError, ReconcileOutcome, Reconciler};
pub use record::{LifecycleState, RecordRef, ResourceRecord, Role};

use crate::backend::{
    BackendError, ExecOutput, ExecRequest, InventorySource, RemoteExec, SharedBackend, TagStore,
    Timeouts, Transfer, TransferDirection,
};
use crate::config::{ConfigError, FleetConfig};

/// Environment variable carrying the record's cluster name during exec
pub const ENV_CLUSTER_NAME: &str = "FLEET_CLUSTER_NAME";

/// Environment variable carrying the record's node number during exec
pub const ENV_NODE_NO: &str = "FLEET_NODE_NO";

/// Errors raised while selecting records
#[derive(Error, Debug)]
pub enum FleetError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A backend plus the configuration driving it
#[derive(Clone)]
pub struct Fleet {
    backend: SharedBackend,
    config: Arc<FleetConfig>,
    cancel: CancellationToken,
}

impl Fleet {
    /// Wire `backend` and a validated `config` together
    pub fn new(backend: SharedBackend, config: FleetConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            backend,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        })
    }

    /// Share `cancel` with every batch this fleet runs
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Batch options from config, with an optional concurrency override
    pub fn parallel_options(&self, concurrency: Option<usize>) -> Result<ParallelOptions, ExecutorError> {
        let limit = concurrency.unwrap_or(self.config.parallel.concurrency);
        Ok(ParallelOptions::new(Concurrency::new(limit)?)
            .with_timeout(self.config.parallel.session_timeout())
            .with_cancel(self.cancel.clone()))
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::new(
            self.config.parallel.connect_timeout(),
            self.config.parallel.session_timeout(),
        )
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Every record the backend holds, terminated ones included
    pub async fn inventory(&self) -> Result<Collection, BackendError> {
        let records = self.backend.list_records().await?;
        debug!(count = records.len(), "Listed inventory");
        Ok(Collection::new(records))
    }

    /// Records matching `filter`; terminated records only when asked for
    pub async fn query(&self, filter: &Filter, include_terminated: bool) -> Result<Collection, BackendError> {
        let inventory = self.inventory().await?;
        let scope = if include_terminated {
            inventory
        } else {
            inventory.active()
        };
        Ok(scope.filter(filter))
    }

    /// Live instances of the named clusters, optionally narrowed to `nodes`
    ///
    /// Fails when a cluster has no live instance, or when any selected node
    /// number is missing from a cluster.
    pub async fn select<S: AsRef<str>>(
        &self,
        clusters: &[S],
        nodes: Option<&NodeSelection>,
    ) -> Result<Collection, FleetError> {
        let instances = self
            .inventory()
            .await?
            .active()
            .with_kind(&[record::RecordKind::Instance]);

        let mut selected = Vec::new();
        for cluster in clusters {
            let cluster = cluster.as_ref();
            let members = match nodes {
                Some(selection) => instances.require_nodes(cluster, selection)?,
                None => instances
                    .with_cluster_name(&[cluster])
                    .require_any(format!("cluster '{}'", cluster))?,
            };
            selected.extend(members.sorted().iter().cloned());
        }
        Ok(selected.into_iter().collect())
    }

    // =========================================================================
    // Parallel operations
    // =========================================================================

    /// Run `request` on every record
    ///
    /// Records not Running fail with "instance not running" without reaching
    /// the backend. A non-zero exit status fails the record.
    pub async fn exec(
        &self,
        collection: &Collection,
        request: &ExecRequest,
        options: &ParallelOptions,
    ) -> BatchReport<ExecOutput> {
        let backend = &self.backend;
        let timeouts = self.timeouts();

        run_parallel(collection, options, |record| async move {
            if record.state != LifecycleState::Running {
                return Err(RecordError::NotRunning);
            }
            let request = with_record_env(request, &record);
            let output = backend.exec(&record, &request, &timeouts).await?;
            if !output.success() {
                return Err(RecordError::ExitStatus {
                    code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
            Ok(output)
        })
        .await
    }

    /// Copy a file to or from every record
    ///
    /// Downloads from more than one record land in `<local>/<cluster>-<n>`.
    pub async fn transfer(
        &self,
        collection: &Collection,
        transfer: &Transfer,
        options: &ParallelOptions,
    ) -> BatchReport<PathBuf> {
        let backend = &self.backend;
        let timeouts = self.timeouts();
        let fan_out = transfer.direction == TransferDirection::Download && collection.len() > 1;

        run_parallel(collection, options, |record| async move {
            if record.state != LifecycleState::Running {
                return Err(RecordError::NotRunning);
            }
            let mut transfer = transfer.clone();
            if fan_out {
                tokio::fs::create_dir_all(&transfer.local)
                    .await
                    .map_err(BackendError::from)?;
                transfer.local = transfer.local.join(record.label());
            }
            backend.transfer(&record, &transfer, &timeouts).await?;
            Ok(transfer.local)
        })
        .await
    }

    /// Drive every record through `transition`
    pub async fn transition(
        &self,
        collection: &Collection,
        transition: Transition,
        wait: Duration,
        options: &ParallelOptions,
    ) -> BatchReport<LifecycleState> {
        let backend = &self.backend;
        let poll = self.config.lifecycle.poll_interval();
        info!(%transition, records = collection.len(), "Applying transition");

        run_parallel(collection, options, |record| async move {
            apply_transition(backend.as_ref(), &record, transition, wait, poll)
                .await
                .map_err(RecordError::from)
        })
        .await
    }

    /// Drive one record through `transition`
    pub async fn transition_record(
        &self,
        record: &ResourceRecord,
        transition: Transition,
        wait: Duration,
    ) -> Result<LifecycleState, LifecycleError> {
        apply_transition(
            self.backend.as_ref(),
            record,
            transition,
            wait,
            self.config.lifecycle.poll_interval(),
        )
        .await
    }

    /// Merge `tags` into every record
    pub async fn add_tags(
        &self,
        collection: &Collection,
        tags: &HashMap<String, String>,
        options: &ParallelOptions,
    ) -> BatchReport<()> {
        let backend = &self.backend;
        run_parallel(collection, options, |record| async move {
            backend.add_tags(&record, tags).await.map_err(RecordError::from)
        })
        .await
    }

    /// Remove `keys` from every record
    pub async fn remove_tags(
        &self,
        collection: &Collection,
        keys: &[String],
        options: &ParallelOptions,
    ) -> BatchReport<()> {
        let backend = &self.backend;
        run_parallel(collection, options, |record| async move {
            backend.remove_tags(&record, keys).await.map_err(RecordError::from)
        })
        .await
    }

    /// Set or clear the expiry of every record
    pub async fn change_expiry(
        &self,
        collection: &Collection,
        expires_at: Option<DateTime<Utc>>,
        options: &ParallelOptions,
    ) -> BatchReport<()> {
        let backend = &self.backend;
        run_parallel(collection, options, |record| async move {
            backend
                .set_expiry(&record, expires_at)
                .await
                .map_err(RecordError::from)
        })
        .await
    }

    /// Push hosts entries for every member of `collection` to every member
    pub async fn update_hosts(&self, collection: &Collection, options: &ParallelOptions) -> BatchReport<ExecOutput> {
        let entries = hosts::render_hosts_entries(collection);
        debug!(entries = entries.len(), "Rendered hosts entries");
        let request = hosts::hosts_update_request(&entries);
        self.exec(collection, &request, options).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    pub fn reconciler(&self, options: ParallelOptions) -> Reconciler<'_> {
        Reconciler::new(self.backend.as_ref(), &self.config, options)
    }

    /// Bring one cluster to `desired` live members
    pub async fn reconcile(
        &self,
        cluster: &str,
        desired: i64,
        dry_run: bool,
    ) -> Result<ReconcileOutcome, FleetReconcileError> {
        let options = self.parallel_options(None)?;
        Ok(self.reconciler(options).reconcile(cluster, desired, dry_run).await?)
    }

    /// Bring each cluster of a comma-separated list to `desired` live members
    pub async fn reconcile_many(
        &self,
        clusters: &str,
        desired: i64,
        dry_run: bool,
    ) -> Result<Vec<ReconcileOutcome>, FleetReconcileError> {
        let options = self.parallel_options(None)?;
        Ok(self
            .reconciler(options)
            .reconcile_many(clusters, desired, dry_run)
            .await?)
    }
}

/// Reconciliation failures including setup of the batch
#[derive(Error, Debug)]
pub enum FleetReconcileError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// `request` with the record's identity added to its environment
fn with_record_env(request: &ExecRequest, record: &ResourceRecord) -> ExecRequest {
    let mut request = request.clone().with_env(ENV_CLUSTER_NAME, record.cluster_name());
    if let Some(n) = record.node_no() {
        request = request.with_env(ENV_NODE_NO, n.to_string());
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::fleet::record::BackendType;

    fn fleet_with(backend: &MemoryBackend) -> Fleet {
        let mut config = FleetConfig::default();
        config.lifecycle.wait_secs = 0;
        Fleet::new(Arc::new(backend.clone()), config).unwrap()
    }

    fn seed(backend: &MemoryBackend, cluster: &str, nodes: &[u32]) {
        for &n in nodes {
            backend.insert(
                ResourceRecord::instance(BackendType::Memory, cluster, n, "")
                    .with_state(LifecycleState::Running),
            );
        }
    }

    #[test]
    fn test_record_env_added() {
        let record = ResourceRecord::instance(BackendType::Memory, "mydc", 3, "i-3");
        let req = with_record_env(&ExecRequest::shell("env"), &record);
        assert!(req
            .env
            .contains(&(ENV_CLUSTER_NAME.to_string(), "mydc".to_string())));
        assert!(req.env.contains(&(ENV_NODE_NO.to_string(), "3".to_string())));
    }

    #[test]
    fn test_zero_concurrency_config_rejected() {
        let mut config = FleetConfig::default();
        config.parallel.concurrency = 0;
        assert!(Fleet::new(Arc::new(MemoryBackend::new()), config).is_err());
    }

    #[tokio::test]
    async fn test_select_missing_nodes_named() {
        let backend = MemoryBackend::new();
        seed(&backend, "mydc", &[1, 2, 3]);
        let fleet = fleet_with(&backend);

        let nodes: NodeSelection = "2-5".parse().unwrap();
        let err = fleet.select(&["mydc"], Some(&nodes)).await.unwrap_err();
        match err {
            FleetError::NotFound(NotFoundError::Nodes { cluster, missing }) => {
                assert_eq!(cluster, "mydc");
                assert_eq!(missing, vec![4, 5]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = fleet.select(&["nope"], None).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(NotFoundError::NoMatch(_))));
    }

    #[tokio::test]
    async fn test_exec_guard_and_exit_status() {
        let backend = MemoryBackend::new().with_exec_handler(|record, _| {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: "bad\n".to_string(),
                exit_code: if record.node_no() == Some(2) { 3 } else { 0 },
            })
        });
        seed(&backend, "mydc", &[1, 2, 3]);
        let fleet = fleet_with(&backend);

        let stopped = backend.list_records().await.unwrap()[2].clone();
        backend
            .set_state(stopped.backend_id(), LifecycleState::Stopped)
            .unwrap();

        let members = fleet.select(&["mydc"], None).await.unwrap();
        let options = fleet.parallel_options(Some(2)).unwrap();
        let report = fleet.exec(&members, &ExecRequest::shell("true"), &options).await;

        let results: Vec<_> = report.outcomes().iter().map(|o| o.result.clone()).collect();
        assert!(results[0].is_ok());
        assert_eq!(
            results[1],
            Err(RecordError::ExitStatus {
                code: 3,
                stderr: "bad".to_string()
            })
        );
        assert_eq!(results[2], Err(RecordError::NotRunning));
        assert!(backend.executed(stopped.backend_id()).is_empty());
    }

    #[tokio::test]
    async fn test_tags_and_expiry_through_executor() {
        let backend = MemoryBackend::new();
        seed(&backend, "mydc", &[1, 2]);
        let fleet = fleet_with(&backend);
        let members = fleet.select(&["mydc"], None).await.unwrap();
        let options = fleet.parallel_options(None).unwrap();

        let mut tags = HashMap::new();
        tags.insert("team".to_string(), "db".to_string());
        assert!(fleet.add_tags(&members, &tags, &options).await.is_success());

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(fleet
            .change_expiry(&members, Some(past), &options)
            .await
            .is_success());

        let tagged = fleet
            .query(&Filter::new().tag("team", "db"), false)
            .await
            .unwrap();
        assert_eq!(tagged.len(), 2);
        assert_eq!(tagged.with_expired(true, Utc::now()).len(), 2);

        assert!(fleet
            .remove_tags(&members, &["team".to_string()], &options)
            .await
            .is_success());
        let tagged = fleet
            .query(&Filter::new().tag("team", "db"), false)
            .await
            .unwrap();
        assert!(tagged.is_empty());
    }

    #[tokio::test]
    async fn test_update_hosts_pushes_entries() {
        let backend = MemoryBackend::new();
        for n in 1..=2 {
            let mut record = ResourceRecord::instance(BackendType::Memory, "mydc", n, "")
                .with_state(LifecycleState::Running);
            record.network.private = Some(format!("10.0.0.{n}"));
            backend.insert(record);
        }
        let fleet = fleet_with(&backend);
        let members = fleet.select(&["mydc"], None).await.unwrap();
        let options = fleet.parallel_options(None).unwrap();

        assert!(fleet.update_hosts(&members, &options).await.is_success());
        for record in members.iter() {
            let sent = backend.executed(record.backend_id());
            assert_eq!(sent.len(), 1);
            let stdin = sent[0].stdin.clone().unwrap();
            assert_eq!(stdin.lines().count(), 2);
        }
    }

    #[tokio::test]
    async fn test_transfer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("payload.txt");
        std::fs::write(&local, "hello").unwrap();

        let backend = MemoryBackend::new();
        seed(&backend, "mydc", &[1, 2]);
        let fleet = fleet_with(&backend);
        let members = fleet.select(&["mydc"], None).await.unwrap();
        let options = fleet.parallel_options(None).unwrap();

        let up = Transfer::upload(&local, "/opt/payload.txt");
        assert!(fleet.transfer(&members, &up, &options).await.is_success());

        let out_dir = dir.path().join("out");
        let down = Transfer::download("/opt/payload.txt", &out_dir);
        let report = fleet.transfer(&members, &down, &options).await;
        assert!(report.is_success());
        assert_eq!(
            std::fs::read_to_string(out_dir.join("mydc-2")).unwrap(),
            "hello"
        );
    }
}
