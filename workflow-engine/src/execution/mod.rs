// Execution Engine Module
// Job graph, matrix expansion, concurrency groups, scheduling and execution

pub mod concurrency;
pub mod context;
pub mod engine;
pub mod events;
pub mod executor;
pub mod graph;
pub mod matrix;
pub mod scheduler;
pub mod state;
pub mod template;

// Re-export key types
pub use concurrency::{ConcurrencyController, ConcurrencyGroup, GroupSpec, Registration, Supersession};
pub use context::{RunContext, RunId, RunIdAllocator, TriggerKind};
pub use engine::{Engine, PreparedRun};
pub use events::{progress_channel, ExecutionEvent, ProgressReceiver, ProgressSender, StatusEvent};
pub use executor::{InstanceReport, RunExecutor, StepReport};
pub use graph::{CompiledStep, Graph, JobNode, TopologicalLayers};
pub use matrix::{Binding, InstanceId, JobInstance, MatrixAxis, MatrixExpander, MatrixSpec};
pub use scheduler::{InstanceSummary, RunReport, Scheduler};
pub use state::{AggregateOutcome, ExecutionState, Outcome, RunHandle, Transition};
pub use template::{
    CancelSetting, CompiledWorkflow, ConcurrencySetting, Dependency, JobTemplate, StepTemplate,
    WorkflowDefinition,
};
