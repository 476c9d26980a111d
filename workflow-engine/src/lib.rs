// Workflow Engine Library
// Orchestration core for gantry: job graphs, matrices, conditions,
// concurrency groups, scheduling and execution

pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod runners;
pub mod workflow;

// Re-export commonly used types
pub use config::{DependencyMode, EngineConfig};
pub use error::{EngineError, EngineResult, GraphError, SchedulingViolation};

// Re-export expression types
pub use expression::{Condition, ExprError, ExprScope, ExpressionContext, Template};

// Re-export execution types
pub use execution::{
    progress_channel, AggregateOutcome, CompiledWorkflow, ConcurrencyController, Engine,
    ExecutionEvent, ExecutionState, Graph, InstanceId, JobInstance, JobTemplate, MatrixExpander,
    MatrixSpec, Outcome, ProgressReceiver, ProgressSender, RunContext, RunHandle, RunId, RunReport,
    Scheduler, StepTemplate, TriggerKind, WorkflowDefinition,
};

// Re-export runner types
pub use runners::{ScriptedRunner, Shell, ShellRunner, StepRequest, StepResult, StepStatus, TaskRunner};

// Re-export workflow types
pub use workflow::{TriggerRule, TriggerRules, WorkflowParser};
