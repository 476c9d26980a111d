// Execution State
// Per-run state table for job instances with single-writer-per-instance updates

use crate::error::SchedulingViolation;
use crate::execution::context::RunId;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::InstanceId;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle state of one job instance within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            ExecutionState::Succeeded => Some(Outcome::Succeeded),
            ExecutionState::Failed => Some(Outcome::Failed),
            ExecutionState::Skipped => Some(Outcome::Skipped),
            ExecutionState::Cancelled => Some(Outcome::Cancelled),
            _ => None,
        }
    }

    /// Legal edges of the instance state machine
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, Blocked | Ready | Skipped | Cancelled)
                | (Blocked, Ready | Skipped | Cancelled)
                | (Ready, Running | Blocked | Skipped | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Blocked => "blocked",
            ExecutionState::Ready => "ready",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::Skipped => "skipped",
            ExecutionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal result of a job instance or step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl Outcome {
    /// Spelling used by `needs.<job>.result` and `steps.<id>.outcome`
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "success",
            Outcome::Failed => "failure",
            Outcome::Skipped => "skipped",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

impl From<Outcome> for ExecutionState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => ExecutionState::Succeeded,
            Outcome::Failed => ExecutionState::Failed,
            Outcome::Skipped => ExecutionState::Skipped,
            Outcome::Cancelled => ExecutionState::Cancelled,
        }
    }
}

/// Aggregate result of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl AggregateOutcome {
    /// Failed if anything failed, else cancelled if anything was cancelled
    pub fn from_states<'a>(states: impl IntoIterator<Item = &'a ExecutionState>) -> Self {
        let mut cancelled = false;
        for state in states {
            match state {
                ExecutionState::Failed => return AggregateOutcome::Failed,
                ExecutionState::Succeeded | ExecutionState::Skipped => {}
                _ => cancelled = true,
            }
        }
        if cancelled {
            AggregateOutcome::Cancelled
        } else {
            AggregateOutcome::Succeeded
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            AggregateOutcome::Succeeded => 0,
            AggregateOutcome::Failed => 1,
            AggregateOutcome::Cancelled => 2,
        }
    }
}

impl fmt::Display for AggregateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateOutcome::Succeeded => write!(f, "succeeded"),
            AggregateOutcome::Failed => write!(f, "failed"),
            AggregateOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Already in the requested state
    Unchanged,
    /// The instance was already terminal; the first terminal state stands
    Ignored { current: ExecutionState },
}

/// Shared handle to one run's state table and cancellation tokens
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    states: DashMap<InstanceId, ExecutionState>,
    tokens: HashMap<InstanceId, CancellationToken>,
    token: CancellationToken,
    superseded_by: OnceLock<RunId>,
    events: Option<ProgressSender>,
}

impl RunHandle {
    /// Create the table with every instance `Pending`
    pub fn new(
        run_id: RunId,
        instances: impl IntoIterator<Item = InstanceId>,
        events: Option<ProgressSender>,
    ) -> Self {
        let token = CancellationToken::new();
        let states = DashMap::new();
        let mut tokens = HashMap::new();

        for id in instances {
            tokens.insert(id.clone(), token.child_token());
            states.insert(id, ExecutionState::Pending);
        }

        Self {
            run_id,
            states,
            tokens,
            token,
            superseded_by: OnceLock::new(),
            events,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn events(&self) -> &Option<ProgressSender> {
        &self.events
    }

    pub fn state(&self, id: &InstanceId) -> Option<ExecutionState> {
        self.states.get(id).map(|entry| *entry)
    }

    /// Move an instance to `next`. Terminal instances never change; late
    /// reports against them are ignored.
    pub fn transition(
        &self,
        id: &InstanceId,
        next: ExecutionState,
    ) -> Result<Transition, SchedulingViolation> {
        let mut entry = self
            .states
            .get_mut(id)
            .ok_or_else(|| SchedulingViolation::UnknownInstance(id.clone()))?;
        let current = *entry;

        if current == next {
            return Ok(Transition::Unchanged);
        }

        if current.is_terminal() {
            debug!(
                run_id = %self.run_id,
                instance = %id,
                current = %current,
                ignored = %next,
                "ignoring report for terminal instance"
            );
            return Ok(Transition::Ignored { current });
        }

        if !current.can_transition_to(next) {
            return Err(SchedulingViolation::IllegalTransition {
                instance: id.clone(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        *entry = next;
        // Emitted under the entry lock so events for one instance stay ordered
        self.events
            .send_event(ExecutionEvent::state_changed(self.run_id, id.clone(), next));

        Ok(Transition::Applied)
    }

    /// Cancel the given non-terminal instances; returns those actually cancelled
    pub fn cancel_instances(&self, ids: &[InstanceId]) -> Vec<InstanceId> {
        let mut cancelled = Vec::new();
        for id in ids {
            if let Ok(Transition::Applied) = self.transition(id, ExecutionState::Cancelled) {
                cancelled.push(id.clone());
            }
            if let Some(token) = self.tokens.get(id) {
                token.cancel();
            }
        }
        cancelled
    }

    /// Cancel every non-terminal instance and the run itself
    pub fn cancel(&self) -> Vec<InstanceId> {
        let pending = self.non_terminal();
        let cancelled = self.cancel_instances(&pending);
        self.token.cancel();
        cancelled
    }

    /// Cancel the run because `by` took over its concurrency group
    pub fn supersede(&self, by: RunId) -> Vec<InstanceId> {
        let _ = self.superseded_by.set(by);
        let cancelled = self.cancel();
        self.events.send_event(ExecutionEvent::run_superseded(
            self.run_id,
            by,
            cancelled.clone(),
        ));
        cancelled
    }

    pub fn superseded_by(&self) -> Option<RunId> {
        self.superseded_by.get().copied()
    }

    /// Run-wide cancellation token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token forwarded to the task runner for one instance
    pub fn instance_token(&self, id: &InstanceId) -> CancellationToken {
        self.tokens
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.token.child_token())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn non_terminal(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self
            .states
            .iter()
            .filter(|entry| !entry.value().is_terminal())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_finished(&self) -> bool {
        self.states.iter().all(|entry| entry.value().is_terminal())
    }

    pub fn snapshot(&self) -> BTreeMap<InstanceId, ExecutionState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
