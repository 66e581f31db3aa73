//! Lifecycle state machine
//!
//! ```text
//! Pending -> Running <-> Stopping/Stopped <-> Starting -> Running
//! any non-terminal  -> Terminating -> Terminated
//! ```
//!
//! A transition issues one backend call and, when given a non-zero wait,
//! polls [`StateQuery::current_state`] until the target stable state is seen.
//! Each call owns its deadline. A timeout is reported as-is: the backend
//! call is neither retried nor rolled back.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::record::{LifecycleState, ResourceRecord};
use crate::backend::{BackendError, LifecycleDriver, StateQuery};

/// A requested lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Start,
    /// `force` goes straight to the backend stop call
    Stop { force: bool },
    Terminate,
}

impl Transition {
    /// Stable state this transition converges to
    pub fn target(&self) -> LifecycleState {
        match self {
            Transition::Start => LifecycleState::Running,
            Transition::Stop { .. } => LifecycleState::Stopped,
            Transition::Terminate => LifecycleState::Terminated,
        }
    }

    /// Transient state the record passes through on the way
    pub fn transient(&self) -> LifecycleState {
        match self {
            Transition::Start => LifecycleState::Starting,
            Transition::Stop { .. } => LifecycleState::Stopping,
            Transition::Terminate => LifecycleState::Terminating,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Start => f.write_str("start"),
            Transition::Stop { force: false } => f.write_str("stop"),
            Transition::Stop { force: true } => f.write_str("force-stop"),
            Transition::Terminate => f.write_str("terminate"),
        }
    }
}

/// Per-record transition failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Cannot {transition} {record}: record is {state}")]
    Incompatible {
        record: String,
        transition: Transition,
        state: LifecycleState,
    },

    #[error("{record} did not reach {target} within {waited:?} (last seen {last})")]
    Timeout {
        record: String,
        target: LifecycleState,
        last: LifecycleState,
        waited: Duration,
    },

    #[error("{record}: {source}")]
    Backend {
        record: String,
        #[source]
        source: BackendError,
    },
}

/// What a transition has to do given the record's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    /// Issue the backend call
    Issue,
    /// Already heading to the target; only wait
    AwaitConvergence,
    /// Already at the target
    Done,
}

/// Decide how to drive `transition` from `state`
pub fn plan_transition(
    state: LifecycleState,
    transition: Transition,
) -> Result<TransitionPlan, LifecycleState> {
    use LifecycleState::*;

    if state == transition.target() {
        return Ok(TransitionPlan::Done);
    }
    if state == transition.transient() {
        // A forced stop escalates a graceful one that is still draining
        if transition == (Transition::Stop { force: true }) {
            return Ok(TransitionPlan::Issue);
        }
        return Ok(TransitionPlan::AwaitConvergence);
    }
    match (transition, state) {
        (_, Terminated) => Err(state),
        (Transition::Start | Transition::Stop { .. }, Terminating) => Err(state),
        _ => Ok(TransitionPlan::Issue),
    }
}

/// Drive one record through `transition`
///
/// The record's state is read from the backend first so a stale snapshot
/// never decides compatibility. With a zero `wait` the call returns right
/// after issuing; otherwise the backend is polled every `poll_interval`
/// until the target is observed or `wait` elapses. Returns the converged
/// state, or the transient state the record was sent into when not waiting.
pub async fn apply_transition<B>(
    backend: &B,
    record: &ResourceRecord,
    transition: Transition,
    wait: Duration,
    poll_interval: Duration,
) -> Result<LifecycleState, LifecycleError>
where
    B: StateQuery + LifecycleDriver + ?Sized,
{
    let label = record.label();
    let backend_err = |source: BackendError| LifecycleError::Backend {
        record: label.clone(),
        source,
    };

    let state = backend.current_state(record).await.map_err(backend_err)?;
    let plan = plan_transition(state, transition).map_err(|state| LifecycleError::Incompatible {
        record: label.clone(),
        transition,
        state,
    })?;

    match plan {
        TransitionPlan::Done => {
            debug!(record = %label, %transition, "Already {}", state);
            return Ok(state);
        }
        TransitionPlan::AwaitConvergence => {
            debug!(record = %label, %transition, "Already {}, waiting", state);
        }
        TransitionPlan::Issue => {
            debug!(record = %label, %transition, from = %state, "Issuing transition");
            match transition {
                Transition::Start => backend.start(record).await,
                Transition::Stop { force } => backend.stop(record, force).await,
                Transition::Terminate => backend.terminate(record).await,
            }
            .map_err(backend_err)?;
        }
    }

    if wait.is_zero() {
        return Ok(transition.transient());
    }

    wait_for_state(backend, record, transition, wait, poll_interval).await
}

async fn wait_for_state<B>(
    backend: &B,
    record: &ResourceRecord,
    transition: Transition,
    wait: Duration,
    poll_interval: Duration,
) -> Result<LifecycleState, LifecycleError>
where
    B: StateQuery + ?Sized,
{
    let target = transition.target();
    let deadline = Instant::now() + wait;

    loop {
        let state = backend
            .current_state(record)
            .await
            .map_err(|source| LifecycleError::Backend {
                record: record.label(),
                source,
            })?;
        trace!(record = %record.label(), %state, "Polled state");

        if state == target {
            return Ok(state);
        }
        if state.is_terminal() {
            return Err(LifecycleError::Incompatible {
                record: record.label(),
                transition,
                state,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(LifecycleError::Timeout {
                record: record.label(),
                target,
                last: state,
                waited: wait,
            });
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
