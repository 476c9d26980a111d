// Error Types
// Graph, scheduling and engine-level errors

use crate::execution::matrix::InstanceId;
use crate::expression::ExprError;

use thiserror::Error;

/// Errors detected while loading a workflow graph.
///
/// All of these are reported before any job starts; a run never executes
/// partially because of a definition problem.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    #[error("duplicate job '{id}'")]
    DuplicateTemplate { id: String },

    #[error("job '{template}' depends on unknown job '{dependency}'")]
    UnknownDependency { template: String, dependency: String },

    #[error("circular dependency detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("invalid condition in job '{template}' ({field}): {source}")]
    InvalidCondition {
        template: String,
        field: String,
        source: ExprError,
    },

    #[error("invalid concurrency group in {scope}: {message}")]
    InvalidConcurrencyGroup { scope: String, message: String },

    #[error("job '{template}' declares step id '{step}' more than once")]
    DuplicateStepId { template: String, step: String },

    #[error("matrix axis '{axis}' of job '{template}' has no values")]
    EmptyAxis { template: String, axis: String },

    #[error("matrix exclusion in job '{template}' references unknown axis '{axis}'")]
    InvalidExclusion { template: String, axis: String },

    #[error(
        "matrix of job '{template}' has {} combinations, the limit is {limit}",
        size.map_or_else(|| "too many".to_string(), |n| n.to_string())
    )]
    MatrixTooLarge {
        template: String,
        /// `None` when the product does not fit in `usize`
        size: Option<usize>,
        limit: usize,
    },
}

impl GraphError {
    /// The job template the error is attached to, when there is one
    pub fn template(&self) -> Option<&str> {
        match self {
            GraphError::DuplicateTemplate { id } => Some(id),
            GraphError::UnknownDependency { template, .. }
            | GraphError::InvalidCondition { template, .. }
            | GraphError::DuplicateStepId { template, .. }
            | GraphError::EmptyAxis { template, .. }
            | GraphError::InvalidExclusion { template, .. }
            | GraphError::MatrixTooLarge { template, .. } => Some(template),
            GraphError::CycleDetected { cycle } => cycle.first().map(String::as_str),
            GraphError::InvalidConcurrencyGroup { .. } => None,
        }
    }
}

/// Internal invariant breach in the scheduler. Indicates an engine bug, not a
/// user error.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulingViolation {
    #[error("instance '{instance}' dispatched while dependency '{dependency}' is not terminal")]
    DispatchBeforeDependencies {
        instance: InstanceId,
        dependency: InstanceId,
    },

    #[error("illegal transition for '{instance}': {from} -> {to}")]
    IllegalTransition {
        instance: InstanceId,
        from: String,
        to: String,
    },

    #[error("unknown instance '{0}'")]
    UnknownInstance(InstanceId),

    #[error("run stalled with {remaining} non-terminal instance(s) and nothing running")]
    Stalled { remaining: usize },
}

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("scheduling violation: {0}")]
    Scheduling(#[from] SchedulingViolation),

    #[error("workflow is not triggered by '{trigger}' on '{git_ref}'")]
    NotTriggered { trigger: String, git_ref: String },

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = GraphError::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
        assert_eq!(err.template(), Some("a"));
    }

    #[test]
    fn test_engine_error_wraps_graph_error() {
        let err: EngineError = GraphError::EmptyAxis {
            template: "test".into(),
            axis: "os".into(),
        }
        .into();
        assert!(matches!(err, EngineError::Graph(GraphError::EmptyAxis { .. })));
        assert_eq!(err.to_string(), "matrix axis 'os' of job 'test' has no values");
    }
}
