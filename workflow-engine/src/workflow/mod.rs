// Workflow Documents
// YAML binding of workflow definitions and their trigger rules

pub mod models;
pub mod parser;
pub mod triggers;

pub use models::{
    CancelInProgress, Concurrency, EventConfig, Job, JobNeeds, Matrix, Need, OrderedMap, Step,
    Strategy, Trigger, WorkflowDocument,
};
pub use parser::WorkflowParser;
pub use triggers::{glob_match, TriggerRule, TriggerRules};
