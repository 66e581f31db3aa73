//! Reconciliation engine
//!
//! Diffs a cluster's live membership against a desired node count and
//! applies exactly one action: create, grow, shrink or nothing. Live
//! membership is every instance of the cluster that is neither Terminating
//! nor Terminated, so re-applying the same count after a shrink whose
//! terminations have not settled is still a no-op.
//!
//! Shrink always removes the highest node numbers. Grow appends numbers
//! after the highest number still held by any non-terminated record.

use std::fmt;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::collection::Collection;
use super::executor::{run_parallel, AggregateError, ParallelOptions, RecordError};
use super::lifecycle::{apply_transition, LifecycleError, Transition};
use super::record::{LifecycleState, RecordKind, ResourceRecord};
use crate::backend::{Backend, BackendError, CreateRequest};
use crate::config::FleetConfig;

/// Errors raised while reconciling
#[derive(Error, Debug, Clone)]
pub enum ReconcileError {
    #[error("Desired count must be zero or more, got {0}")]
    InvalidDesiredCount(i64),

    #[error("Invalid cluster list '{0}': empty cluster name")]
    InvalidClusterList(String),

    #[error("Failed to read inventory: {0}")]
    Inventory(#[source] BackendError),

    #[error("Cannot number {count} more node(s) after node {highest}")]
    NodeNumberOverflow { highest: u32, count: usize },

    #[error("Reconciling '{cluster}' applied {} change(s) before failing: {source}", .applied.len())]
    Partial {
        cluster: String,
        action: ReconcileAction,
        /// Records created, or sent to termination, before the failure
        applied: Vec<ResourceRecord>,
        #[source]
        source: ApplyFailure,
    },

    #[error("Cluster '{cluster}' failed after {} cluster(s) completed: {source}", .completed.len())]
    Cluster {
        cluster: String,
        completed: Vec<ReconcileOutcome>,
        #[source]
        source: Box<ReconcileError>,
    },
}

/// Underlying cause of a partial reconciliation
#[derive(Error, Debug, Clone)]
pub enum ApplyFailure {
    #[error("provisioning failed: {0}")]
    Provision(BackendError),

    #[error(transparent)]
    Destroy(AggregateError),
}

/// The single action a reconciliation takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "action")]
pub enum ReconcileAction {
    Noop,
    Create { count: usize },
    Grow { delta: usize },
    Shrink { delta: usize },
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::Noop => f.write_str("noop"),
            ReconcileAction::Create { count } => write!(f, "create {}", count),
            ReconcileAction::Grow { delta } => write!(f, "grow {}", delta),
            ReconcileAction::Shrink { delta } => write!(f, "shrink {}", delta),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Choose the action taking `current` members to `desired`
pub fn plan_action(current: usize, desired: usize) -> ReconcileAction {
    if current == desired {
        ReconcileAction::Noop
    } else if current == 0 {
        ReconcileAction::Create { count: desired }
    } else if current < desired {
        ReconcileAction::Grow {
            delta: desired - current,
        }
    } else {
        ReconcileAction::Shrink {
            delta: current - desired,
        }
    }
}

/// The `delta` members with the highest node numbers
pub fn select_shrink_victims(members: &Collection, delta: usize) -> Collection {
    let mut sorted: Vec<_> = members.iter().cloned().collect();
    sorted.sort_by_key(|r| r.node_no());
    let keep = sorted.len().saturating_sub(delta);
    sorted.into_iter().skip(keep).collect()
}

/// `count` node numbers following the highest of `existing`
pub fn next_node_numbers(existing: &[u32], count: usize) -> Result<Vec<u32>, ReconcileError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let highest = existing.iter().copied().max().unwrap_or(0);
    let last = u32::try_from(count)
        .ok()
        .and_then(|count| highest.checked_add(count))
        .ok_or(ReconcileError::NodeNumberOverflow { highest, count })?;
    Ok((highest + 1..=last).collect())
}

/// Validate a caller-supplied desired count
pub fn validate_desired(desired: i64) -> Result<usize, ReconcileError> {
    usize::try_from(desired).map_err(|_| ReconcileError::InvalidDesiredCount(desired))
}

/// Split `a,b,c` into cluster names, rejecting empty names
pub fn parse_cluster_list(names: &str) -> Result<Vec<String>, ReconcileError> {
    let parsed: Vec<String> = names.split(',').map(|n| n.trim().to_string()).collect();
    if parsed.iter().any(String::is_empty) {
        return Err(ReconcileError::InvalidClusterList(names.to_string()));
    }
    Ok(parsed)
}

/// Everything a reconciliation would do, computed without side effects
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub cluster: String,
    pub action: ReconcileAction,
    /// Node numbers of live members
    pub current: Vec<u32>,
    /// Node numbers that would be created
    pub create: Vec<u32>,
    /// Members that would be terminated
    pub destroy: Collection,
    /// UUID shared by the cluster's members
    pub cluster_uuid: Uuid,
}

impl ReconcilePlan {
    /// Build the plan for `cluster` from an inventory snapshot
    pub fn build(
        inventory: &Collection,
        cluster: &str,
        desired: usize,
    ) -> Result<Self, ReconcileError> {
        let cluster_records = inventory
            .active()
            .with_kind(&[RecordKind::Instance])
            .with_cluster_name(&[cluster]);
        let members = cluster_records.with_not_state(&[LifecycleState::Terminating]);

        let action = plan_action(members.len(), desired);
        let cluster_uuid = members
            .iter()
            .next()
            .map(|r| r.identity.cluster_uuid)
            .unwrap_or_else(Uuid::new_v4);

        let (create, destroy) = match action {
            ReconcileAction::Noop => (Vec::new(), Collection::empty()),
            ReconcileAction::Create { count } | ReconcileAction::Grow { delta: count } => (
                next_node_numbers(&cluster_records.node_numbers(), count)?,
                Collection::empty(),
            ),
            ReconcileAction::Shrink { delta } => {
                (Vec::new(), select_shrink_victims(&members, delta))
            }
        };

        Ok(Self {
            cluster: cluster.to_string(),
            action,
            current: members.node_numbers(),
            create,
            destroy,
            cluster_uuid,
        })
    }
}

/// What a reconciliation did, or would have done in dry-run
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub cluster: String,
    pub action: ReconcileAction,
    pub dry_run: bool,
    /// Node numbers created, ascending
    pub created: Vec<u32>,
    /// Node numbers destroyed, ascending
    pub destroyed: Vec<u32>,
    /// Records created or terminated; in dry-run, the records that would be terminated
    #[serde(skip)]
    pub affected: Vec<ResourceRecord>,
}

impl ReconcileOutcome {
    /// Report line such as `created-node-numbers:4,5`; `None` for a no-op
    pub fn summary_line(&self) -> Option<String> {
        let (label, nodes) = match self.action {
            ReconcileAction::Noop => return None,
            ReconcileAction::Create { .. } | ReconcileAction::Grow { .. } => {
                ("created-node-numbers", &self.created)
            }
            ReconcileAction::Shrink { .. } => ("destroyed-node-numbers", &self.destroyed),
        };
        let joined: Vec<String> = nodes.iter().map(u32::to_string).collect();
        Some(format!("{}:{}", label, joined.join(",")))
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Applies desired node counts to clusters on one backend
pub struct Reconciler<'a> {
    backend: &'a dyn Backend,
    config: &'a FleetConfig,
    options: ParallelOptions,
}

impl<'a> Reconciler<'a> {
    pub fn new(backend: &'a dyn Backend, config: &'a FleetConfig, options: ParallelOptions) -> Self {
        Self {
            backend,
            config,
            options,
        }
    }

    async fn inventory(&self) -> Result<Collection, ReconcileError> {
        self.backend
            .list_records()
            .await
            .map(Collection::new)
            .map_err(ReconcileError::Inventory)
    }

    /// Bring `cluster` to `desired` live members
    pub async fn reconcile(
        &self,
        cluster: &str,
        desired: i64,
        dry_run: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let desired = validate_desired(desired)?;
        let inventory = self.inventory().await?;
        let plan = ReconcilePlan::build(&inventory, cluster, desired)?;

        info!(
            cluster,
            action = %plan.action,
            current = plan.current.len(),
            desired,
            dry_run,
            "Reconciling cluster"
        );

        if dry_run {
            return Ok(ReconcileOutcome {
                cluster: plan.cluster,
                action: plan.action,
                dry_run: true,
                created: plan.create,
                destroyed: plan.destroy.node_numbers(),
                affected: plan.destroy.describe(),
            });
        }

        match plan.action {
            ReconcileAction::Noop => Ok(ReconcileOutcome {
                cluster: plan.cluster,
                action: plan.action,
                dry_run: false,
                created: Vec::new(),
                destroyed: Vec::new(),
                affected: Vec::new(),
            }),
            ReconcileAction::Create { .. } | ReconcileAction::Grow { .. } => {
                self.create(plan).await
            }
            ReconcileAction::Shrink { .. } => self.shrink(plan).await,
        }
    }

    async fn create(&self, plan: ReconcilePlan) -> Result<ReconcileOutcome, ReconcileError> {
        let request = CreateRequest {
            cluster_name: plan.cluster.clone(),
            cluster_uuid: plan.cluster_uuid,
            node_numbers: plan.create.clone(),
            spec: self.config.template.instance_spec(),
            owner: self.config.owner.clone(),
            expires_at: self.config.template.expires_at(Utc::now()),
        };

        match self.backend.create_records(&request).await {
            Ok(created) => {
                let mut nodes: Vec<u32> = created.iter().filter_map(|r| r.node_no()).collect();
                nodes.sort_unstable();
                info!(cluster = %plan.cluster, created = ?nodes, "Created nodes");
                Ok(ReconcileOutcome {
                    cluster: plan.cluster,
                    action: plan.action,
                    dry_run: false,
                    created: nodes,
                    destroyed: Vec::new(),
                    affected: created,
                })
            }
            Err(e) => {
                warn!(cluster = %plan.cluster, created = e.created.len(), "Provisioning stopped early");
                Err(ReconcileError::Partial {
                    cluster: plan.cluster,
                    action: plan.action,
                    applied: e.created,
                    source: ApplyFailure::Provision(e.source),
                })
            }
        }
    }

    async fn shrink(&self, plan: ReconcilePlan) -> Result<ReconcileOutcome, ReconcileError> {
        let backend = self.backend;
        let wait = self.config.lifecycle.wait();
        let poll = self.config.lifecycle.poll_interval();

        let report = run_parallel(&plan.destroy, &self.options, |record| async move {
            apply_transition(backend, &record, Transition::Terminate, wait, poll)
                .await
                .map_err(RecordError::from)
        })
        .await;

        // A convergence timeout still means the terminate call went out
        let applied: Vec<ResourceRecord> = report
            .outcomes()
            .iter()
            .filter_map(|outcome| {
                let state = match &outcome.result {
                    Ok(state) => *state,
                    Err(RecordError::Lifecycle(LifecycleError::Timeout { last, .. })) => *last,
                    Err(_) => return None,
                };
                Some((*outcome.record).clone().with_state(state))
            })
            .collect();

        if let Some(error) = report.aggregate_error() {
            warn!(cluster = %plan.cluster, failed = error.failures.len(), "Shrink partially failed");
            return Err(ReconcileError::Partial {
                cluster: plan.cluster,
                action: plan.action,
                applied,
                source: ApplyFailure::Destroy(error),
            });
        }

        let mut destroyed: Vec<u32> = applied.iter().filter_map(|r| r.node_no()).collect();
        destroyed.sort_unstable();
        info!(cluster = %plan.cluster, destroyed = ?destroyed, "Destroyed nodes");
        Ok(ReconcileOutcome {
            cluster: plan.cluster,
            action: plan.action,
            dry_run: false,
            created: Vec::new(),
            destroyed,
            affected: applied,
        })
    }

    /// Reconcile every cluster in a comma-separated list, in order
    ///
    /// Stops at the first failing cluster and reports it together with the
    /// outcomes of the clusters already completed.
    pub async fn reconcile_many(
        &self,
        names: &str,
        desired: i64,
        dry_run: bool,
    ) -> Result<Vec<ReconcileOutcome>, ReconcileError> {
        validate_desired(desired)?;
        let clusters = parse_cluster_list(names)?;

        let mut completed = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            match self.reconcile(&cluster, desired, dry_run).await {
                Ok(outcome) => completed.push(outcome),
                Err(e) => {
                    return Err(ReconcileError::Cluster {
                        cluster,
                        completed,
                        source: Box::new(e),
                    })
                }
            }
        }
        Ok(completed)
    }
}
