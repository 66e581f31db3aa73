//! Collection & filter engine
//!
//! A [`Collection`] is an immutable, ordered set of records. Every `with_*`
//! method returns a new collection holding the matching subset in the same
//! relative order, so chained filters commute.
//!
//! One rule governs empty criteria: a criterion that is present but empty
//! (no cluster names, an empty tag map, no states) places no restriction.
//! "Match nothing" is never expressed through an empty criterion, and node
//! selections cannot be empty at all (see [`NodeSelection`]).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::node_range::{NodeRangeError, NodeSelection};
use super::record::{
    Architecture, BackendType, LifecycleState, RecordKind, ResourceRecord, Role,
};

/// Errors raised while building filter criteria
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Unknown filter field '{0}'")]
    UnknownField(String),

    #[error("Filter criterion '{0}' must have the form key=value")]
    Malformed(String),

    #[error("Invalid value for filter field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error(transparent)]
    NodeRange(#[from] NodeRangeError),
}

/// A selection produced fewer records than the caller requires
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotFoundError {
    #[error("No records match {0}")]
    NoMatch(String),

    #[error("Nodes {missing:?} not found in cluster '{cluster}'")]
    Nodes { cluster: String, missing: Vec<u32> },
}

/// Immutable set of resource records
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: Vec<Arc<ResourceRecord>>,
}

impl Collection {
    pub fn new(records: Vec<ResourceRecord>) -> Self {
        records.into_iter().collect()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    fn retain<F>(&self, predicate: F) -> Self
    where
        F: Fn(&ResourceRecord) -> bool,
    {
        Self {
            records: self
                .records
                .iter()
                .filter(|r| predicate(r))
                .cloned()
                .collect(),
        }
    }

    // =========================================================================
    // Filters
    // =========================================================================

    /// Default query scope: everything not yet terminated
    pub fn active(&self) -> Self {
        self.with_not_state(&[LifecycleState::Terminated])
    }

    pub fn with_backend(&self, backends: &[BackendType]) -> Self {
        if backends.is_empty() {
            return self.clone();
        }
        self.retain(|r| backends.contains(&r.identity.backend))
    }

    pub fn with_kind(&self, kinds: &[RecordKind]) -> Self {
        if kinds.is_empty() {
            return self.clone();
        }
        self.retain(|r| kinds.contains(&r.kind))
    }

    pub fn with_role(&self, roles: &[Role]) -> Self {
        if roles.is_empty() {
            return self.clone();
        }
        self.retain(|r| roles.contains(&r.role))
    }

    pub fn with_cluster_name<S: AsRef<str>>(&self, names: &[S]) -> Self {
        if names.is_empty() {
            return self.clone();
        }
        self.retain(|r| names.iter().any(|n| n.as_ref() == r.identity.cluster_name))
    }

    /// Keep records whose node number is in the selection
    pub fn with_node_numbers(&self, selection: &NodeSelection) -> Self {
        self.retain(|r| r.identity.node_no.is_some_and(|n| selection.contains(n)))
    }

    /// Exact-match tag filter; an empty value only requires the key to exist
    pub fn with_tags(&self, tags: &HashMap<String, String>) -> Self {
        if tags.is_empty() {
            return self.clone();
        }
        self.retain(|r| {
            tags.iter().all(|(k, v)| match r.tags.get(k) {
                Some(actual) => v.is_empty() || actual == v,
                None => false,
            })
        })
    }

    /// Keep records whose caller-visible state is one of `states`
    pub fn with_state(&self, states: &[LifecycleState]) -> Self {
        if states.is_empty() {
            return self.clone();
        }
        self.retain(|r| states.iter().any(|s| s.stable() == r.state.stable()))
    }

    /// Drop records whose caller-visible state is one of `states`
    pub fn with_not_state(&self, states: &[LifecycleState]) -> Self {
        if states.is_empty() {
            return self.clone();
        }
        self.retain(|r| !states.iter().any(|s| s.stable() == r.state.stable()))
    }

    pub fn with_owner<S: AsRef<str>>(&self, owners: &[S]) -> Self {
        if owners.is_empty() {
            return self.clone();
        }
        self.retain(|r| {
            r.owner
                .as_deref()
                .is_some_and(|o| owners.iter().any(|w| w.as_ref() == o))
        })
    }

    pub fn with_zone<S: AsRef<str>>(&self, zones: &[S]) -> Self {
        if zones.is_empty() {
            return self.clone();
        }
        self.retain(|r| zones.iter().any(|z| z.as_ref() == r.identity.zone))
    }

    pub fn with_backend_id<S: AsRef<str>>(&self, ids: &[S]) -> Self {
        if ids.is_empty() {
            return self.clone();
        }
        self.retain(|r| ids.iter().any(|id| id.as_ref() == r.identity.backend_id))
    }

    pub fn with_architecture(&self, architecture: Architecture) -> Self {
        self.retain(|r| r.architecture == Some(architecture))
    }

    pub fn with_os_name(&self, name: &str) -> Self {
        self.retain(|r| r.os.as_ref().is_some_and(|os| os.name == name))
    }

    pub fn with_os_version(&self, version: &str) -> Self {
        self.retain(|r| r.os.as_ref().is_some_and(|os| os.version == version))
    }

    /// Keep expired (`true`) or unexpired (`false`) records as of `now`
    pub fn with_expired(&self, expired: bool, now: DateTime<Utc>) -> Self {
        self.retain(|r| r.is_expired(now) == expired)
    }

    /// Apply every criterion present in `filter`
    pub fn filter(&self, filter: &Filter) -> Self {
        let mut out = self
            .with_cluster_name(filter.cluster_names.as_slice())
            .with_tags(&filter.tags)
            .with_state(&filter.states)
            .with_not_state(&filter.not_states)
            .with_owner(filter.owners.as_slice())
            .with_zone(filter.zones.as_slice())
            .with_backend(&filter.backends)
            .with_role(&filter.roles);
        if let Some(nodes) = &filter.nodes {
            out = out.with_node_numbers(nodes);
        }
        if let Some(arch) = filter.architecture {
            out = out.with_architecture(arch);
        }
        if let Some(name) = &filter.os_name {
            out = out.with_os_name(name);
        }
        if let Some(version) = &filter.os_version {
            out = out.with_os_version(version);
        }
        if let Some(expired) = filter.expired {
            out = out.with_expired(expired, Utc::now());
        }
        out
    }

    // =========================================================================
    // Shortfall checks
    // =========================================================================

    /// Narrow to `selection` within one cluster, failing if any number is missing
    pub fn require_nodes(
        &self,
        cluster: &str,
        selection: &NodeSelection,
    ) -> Result<Self, NotFoundError> {
        let found = self.with_cluster_name(&[cluster]).with_node_numbers(selection);
        let present: BTreeSet<u32> = found.node_numbers().into_iter().collect();
        let missing: Vec<u32> = selection
            .numbers()
            .iter()
            .copied()
            .filter(|n| !present.contains(n))
            .collect();
        if !missing.is_empty() {
            return Err(NotFoundError::Nodes {
                cluster: cluster.to_string(),
                missing,
            });
        }
        Ok(found)
    }

    /// Fail with the given criterion description when nothing matched
    pub fn require_any(self, criterion: impl Into<String>) -> Result<Self, NotFoundError> {
        if self.is_empty() {
            return Err(NotFoundError::NoMatch(criterion.into()));
        }
        Ok(self)
    }

    // =========================================================================
    // Materialization
    // =========================================================================

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceRecord>> {
        self.records.iter()
    }

    /// Owned copies of the current membership
    pub fn describe(&self) -> Vec<ResourceRecord> {
        self.records.iter().map(|r| (**r).clone()).collect()
    }

    /// Node numbers present, ascending
    pub fn node_numbers(&self) -> Vec<u32> {
        let mut nodes: Vec<u32> = self.records.iter().filter_map(|r| r.node_no()).collect();
        nodes.sort_unstable();
        nodes
    }

    /// Distinct cluster names, ascending
    pub fn cluster_names(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self.records.iter().map(|r| r.cluster_name()).collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// Copy ordered by cluster name then node number
    pub fn sorted(&self) -> Self {
        let mut records = self.records.clone();
        records.sort_by(|a, b| {
            a.cluster_name()
                .cmp(b.cluster_name())
                .then(a.node_no().cmp(&b.node_no()))
                .then(a.backend_id().cmp(b.backend_id()))
        });
        Self { records }
    }

    /// Backend IDs in collection order
    pub fn backend_ids(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| r.backend_id().to_string())
            .collect()
    }
}

impl FromIterator<ResourceRecord> for Collection {
    fn from_iter<T: IntoIterator<Item = ResourceRecord>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().map(Arc::new).collect(),
        }
    }
}

impl FromIterator<Arc<ResourceRecord>> for Collection {
    fn from_iter<T: IntoIterator<Item = Arc<ResourceRecord>>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Arc<ResourceRecord>;
    type IntoIter = std::slice::Iter<'a, Arc<ResourceRecord>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Filter criteria assembled by callers
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub cluster_names: Vec<String>,
    pub nodes: Option<NodeSelection>,
    pub tags: HashMap<String, String>,
    pub states: Vec<LifecycleState>,
    pub not_states: Vec<LifecycleState>,
    pub owners: Vec<String>,
    pub zones: Vec<String>,
    pub backends: Vec<BackendType>,
    pub roles: Vec<Role>,
    pub architecture: Option<Architecture>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub expired: Option<bool>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: restrict to cluster names
    pub fn cluster(mut self, name: impl Into<String>) -> Self {
        self.cluster_names.push(name.into());
        self
    }

    /// Builder: restrict to a node selection
    pub fn nodes(mut self, nodes: NodeSelection) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Builder: require a tag
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder: restrict to states
    pub fn state(mut self, state: LifecycleState) -> Self {
        self.states.push(state);
        self
    }

    /// Parse a `key=value` criterion and add it
    ///
    /// Known keys: `cluster`, `nodes`, `tag.<name>`, `state`, `not-state`,
    /// `owner`, `zone`, `backend`, `role`, `arch`, `os`, `os-version`,
    /// `expired`.
    pub fn add_criterion(&mut self, criterion: &str) -> Result<(), FilterError> {
        let (key, value) = criterion
            .split_once('=')
            .ok_or_else(|| FilterError::Malformed(criterion.to_string()))?;
        let key = key.trim();
        let value = value.trim();

        let invalid = |reason: String| FilterError::InvalidValue {
            field: key.to_string(),
            reason,
        };

        if let Some(tag) = key.strip_prefix("tag.") {
            if tag.is_empty() {
                return Err(FilterError::Malformed(criterion.to_string()));
            }
            self.tags.insert(tag.to_string(), value.to_string());
            return Ok(());
        }

        match key {
            "cluster" => self.cluster_names.push(value.to_string()),
            "nodes" => self.nodes = Some(value.parse()?),
            "state" => self.states.push(value.parse().map_err(invalid)?),
            "not-state" => self.not_states.push(value.parse().map_err(invalid)?),
            "owner" => self.owners.push(value.to_string()),
            "zone" => self.zones.push(value.to_string()),
            "backend" => self.backends.push(value.parse().map_err(invalid)?),
            "role" => self.roles.push(value.parse().map_err(invalid)?),
            "arch" => self.architecture = Some(value.parse().map_err(invalid)?),
            "os" => self.os_name = Some(value.to_string()),
            "os-version" => self.os_version = Some(value.to_string()),
            "expired" => {
                self.expired = Some(
                    value
                        .parse::<bool>()
                        .map_err(|e| invalid(e.to_string()))?,
                )
            }
            other => return Err(FilterError::UnknownField(other.to_string())),
        }
        Ok(())
    }

    /// Parse a list of `key=value` criteria
    pub fn parse<S: AsRef<str>>(criteria: &[S]) -> Result<Self, FilterError> {
        let mut filter = Filter::new();
        for c in criteria {
            filter.add_criterion(c.as_ref())?;
        }
        Ok(filter)
    }
}
