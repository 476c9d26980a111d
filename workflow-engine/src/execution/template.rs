// Job Templates
// Declarative job and workflow definitions, independent of any file format

use crate::error::GraphError;
use crate::execution::concurrency::GroupSpec;
use crate::execution::graph::Graph;
use crate::execution::matrix::MatrixSpec;
use crate::workflow::triggers::TriggerRules;

use std::collections::BTreeMap;

/// A dependency edge on another job template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub job: String,
    /// A failed or skipped dependency does not block the dependent
    pub continue_on_failure: bool,
}

impl Dependency {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            continue_on_failure: false,
        }
    }
}

/// Cancel-in-progress flag, either fixed or computed from run facts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelSetting {
    Bool(bool),
    Expression(String),
}

impl Default for CancelSetting {
    fn default() -> Self {
        CancelSetting::Bool(false)
    }
}

/// Concurrency-group membership: key template plus cancel-in-progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConcurrencySetting {
    /// Group key; may embed `${{ }}` expressions. Empty means no grouping.
    pub group: String,
    pub cancel_in_progress: CancelSetting,
}

impl ConcurrencySetting {
    pub fn new(group: impl Into<String>, cancel_in_progress: bool) -> Self {
        Self {
            group: group.into(),
            cancel_in_progress: CancelSetting::Bool(cancel_in_progress),
        }
    }

    pub fn cancel_when(group: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            cancel_in_progress: CancelSetting::Expression(expression.into()),
        }
    }
}

/// One step of a job, handed opaquely to the task runner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepTemplate {
    /// Referenced by later step conditions as `steps.<id>.outcome`
    pub id: Option<String>,
    pub name: Option<String>,
    pub run: String,
    pub condition: Option<String>,
    /// Run even after an earlier step failed
    pub always: bool,
    pub env: BTreeMap<String, String>,
}

impl StepTemplate {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Name shown in events and reports
    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| format!("step {}", index + 1))
    }
}

/// Declarative description of one logical job, before matrix expansion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobTemplate {
    pub id: String,
    pub name: Option<String>,
    pub needs: Vec<Dependency>,
    pub condition: Option<String>,
    pub concurrency: Option<ConcurrencySetting>,
    pub matrix: Option<MatrixSpec>,
    /// Applies to every dependency edge of this job
    pub continue_on_failure: bool,
    /// Maximum simultaneously running instances of this template
    pub max_parallel: Option<usize>,
    pub steps: Vec<StepTemplate>,
    pub env: BTreeMap<String, String>,
}

impl JobTemplate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn needs(mut self, job: impl Into<String>) -> Self {
        self.needs.push(Dependency::new(job));
        self
    }

    pub fn needs_allowing_failure(mut self, job: impl Into<String>) -> Self {
        self.needs.push(Dependency {
            job: job.into(),
            continue_on_failure: true,
        });
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn concurrency(mut self, setting: ConcurrencySetting) -> Self {
        self.concurrency = Some(setting);
        self
    }

    pub fn matrix(mut self, matrix: MatrixSpec) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }

    pub fn max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = Some(limit);
        self
    }

    pub fn step(mut self, step: StepTemplate) -> Self {
        self.steps.push(step);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Ids of the templates this job depends on, in declared order
    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.needs.iter().map(|dep| dep.job.as_str())
    }

    /// Whether a failed or skipped instance of `dependency` lets this job proceed
    pub fn tolerates_failure_of(&self, dependency: &str) -> bool {
        self.continue_on_failure
            || self
                .needs
                .iter()
                .any(|dep| dep.job == dependency && dep.continue_on_failure)
    }

    /// Matrix axis names, empty without a matrix
    pub fn axis_names(&self) -> Vec<String> {
        self.matrix
            .as_ref()
            .map(|m| m.axis_names().map(String::from).collect())
            .unwrap_or_default()
    }
}

/// A workflow: trigger rules, optional run-level concurrency group and jobs
#[derive(Debug, Clone, Default)]
pub struct WorkflowDefinition {
    pub name: String,
    pub triggers: TriggerRules,
    pub concurrency: Option<ConcurrencySetting>,
    pub env: BTreeMap<String, String>,
    pub jobs: Vec<JobTemplate>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn job(mut self, job: JobTemplate) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn concurrency(mut self, setting: ConcurrencySetting) -> Self {
        self.concurrency = Some(setting);
        self
    }

    pub fn triggers(mut self, triggers: TriggerRules) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Validate and build the job graph. Nothing runs if this fails.
    pub fn compile(self) -> Result<CompiledWorkflow, GraphError> {
        let concurrency = self
            .concurrency
            .as_ref()
            .map(|setting| GroupSpec::compile_workflow(setting))
            .transpose()?;
        let graph = Graph::load(self.jobs)?;

        Ok(CompiledWorkflow {
            name: self.name,
            triggers: self.triggers,
            env: self.env,
            concurrency,
            graph,
        })
    }
}

/// A validated workflow, shared read-only by every run
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub name: String,
    pub triggers: TriggerRules,
    pub env: BTreeMap<String, String>,
    pub concurrency: Option<GroupSpec>,
    pub graph: Graph,
}
