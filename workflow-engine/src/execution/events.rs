// Execution Events
// Status reporting for runs, job instances and steps

use crate::execution::context::RunId;
use crate::execution::matrix::InstanceId;
use crate::execution::state::{AggregateOutcome, ExecutionState};
use crate::runners::StepStatus;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// One state change of one job instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub run_id: RunId,
    pub instance_id: InstanceId,
    pub state: ExecutionState,
    pub timestamp: DateTime<Utc>,
}

/// Events emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Run accepted and about to schedule
    RunStarted {
        run_id: RunId,
        workflow: String,
        instances: usize,
    },

    /// A newer run in the same concurrency group cancelled this run's work
    RunSuperseded {
        run_id: RunId,
        by: RunId,
        cancelled: Vec<InstanceId>,
    },

    /// Job instance changed state
    StateChanged(StatusEvent),

    /// Step dispatched to the task runner
    StepStarted {
        run_id: RunId,
        instance_id: InstanceId,
        step_index: usize,
        step_name: String,
    },

    /// Step output line (stdout/stderr)
    StepOutput {
        run_id: RunId,
        instance_id: InstanceId,
        step_index: usize,
        line: String,
        is_error: bool,
    },

    /// Step finished
    StepCompleted {
        run_id: RunId,
        instance_id: InstanceId,
        step_index: usize,
        step_name: String,
        status: StepStatus,
        exit_code: Option<i32>,
        duration_ms: u64,
    },

    /// Step not run (earlier failure or condition false)
    StepSkipped {
        run_id: RunId,
        instance_id: InstanceId,
        step_index: usize,
        step_name: String,
        reason: String,
    },

    /// Every instance reached a terminal state
    RunCompleted {
        run_id: RunId,
        outcome: AggregateOutcome,
        duration_ms: u64,
    },
}

impl ExecutionEvent {
    pub fn run_started(run_id: RunId, workflow: impl Into<String>, instances: usize) -> Self {
        Self::RunStarted {
            run_id,
            workflow: workflow.into(),
            instances,
        }
    }

    pub fn run_superseded(run_id: RunId, by: RunId, cancelled: Vec<InstanceId>) -> Self {
        Self::RunSuperseded {
            run_id,
            by,
            cancelled,
        }
    }

    /// Create a state change event stamped with the current time
    pub fn state_changed(run_id: RunId, instance_id: InstanceId, state: ExecutionState) -> Self {
        Self::StateChanged(StatusEvent {
            run_id,
            instance_id,
            state,
            timestamp: Utc::now(),
        })
    }

    pub fn step_started(
        run_id: RunId,
        instance_id: InstanceId,
        step_index: usize,
        step_name: impl Into<String>,
    ) -> Self {
        Self::StepStarted {
            run_id,
            instance_id,
            step_index,
            step_name: step_name.into(),
        }
    }

    pub fn step_output(
        run_id: RunId,
        instance_id: InstanceId,
        step_index: usize,
        line: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            run_id,
            instance_id,
            step_index,
            line: line.into(),
            is_error,
        }
    }

    pub fn step_completed(
        run_id: RunId,
        instance_id: InstanceId,
        step_index: usize,
        step_name: impl Into<String>,
        status: StepStatus,
        exit_code: Option<i32>,
        duration: Duration,
    ) -> Self {
        Self::StepCompleted {
            run_id,
            instance_id,
            step_index,
            step_name: step_name.into(),
            status,
            exit_code,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn step_skipped(
        run_id: RunId,
        instance_id: InstanceId,
        step_index: usize,
        step_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepSkipped {
            run_id,
            instance_id,
            step_index,
            step_name: step_name.into(),
            reason: reason.into(),
        }
    }

    pub fn run_completed(run_id: RunId, outcome: AggregateOutcome, duration: Duration) -> Self {
        Self::RunCompleted {
            run_id,
            outcome,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Run the event belongs to
    pub fn run_id(&self) -> RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunSuperseded { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepOutput { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::RunCompleted { run_id, .. } => *run_id,
            Self::StateChanged(status) => status.run_id,
        }
    }
}

/// Helper trait for sending events
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_changed_serializes_as_tagged_json() {
        let event = ExecutionEvent::state_changed(
            RunId::new(3),
            InstanceId::matrix("test", 1),
            ExecutionState::Running,
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["run_id"], 3);
        assert_eq!(json["instance_id"], "test[1]");
        assert_eq!(json["state"], "running");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();
        let sender = Some(tx);
        sender.send_event(ExecutionEvent::run_started(RunId::new(1), "ci", 3));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), RunId::new(1));
        assert!(matches!(event, ExecutionEvent::RunStarted { instances: 3, .. }));
    }

    #[test]
    fn test_none_sender_drops_events() {
        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::run_started(RunId::new(1), "ci", 0));
    }
}
