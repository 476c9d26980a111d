use crate::error::{EngineError, EngineResult};
use crate::execution::context::TriggerKind;
use crate::execution::matrix::{Binding, MatrixSpec};
use crate::execution::template::{
    CompiledWorkflow, ConcurrencySetting, JobTemplate, StepTemplate, WorkflowDefinition,
};
use crate::workflow::models::{
    CancelInProgress, Concurrency, EventConfig, Job, Step, Trigger, WorkflowDocument,
};
use crate::workflow::triggers::{TriggerRule, TriggerRules};

use std::fs;
use std::path::Path;
use tracing::debug;

/// Parser for gantry workflow YAML files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow document from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<WorkflowDocument> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a workflow document from a YAML string.
    pub fn parse(content: &str) -> EngineResult<WorkflowDocument> {
        let document: WorkflowDocument = serde_yaml::from_str(content)?;
        Ok(document)
    }

    /// Read, convert and compile a workflow file. The file stem names
    /// workflows without a `name`.
    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<CompiledWorkflow> {
        let path = path.as_ref();
        let document = Self::from_file(path)?;
        let fallback = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow");
        let definition = Self::into_definition(document, fallback)?;
        debug!(workflow = %definition.name, jobs = definition.jobs.len(), "workflow loaded");
        Ok(definition.compile()?)
    }

    /// Compile a workflow from a YAML string.
    pub fn compile_str(content: &str, fallback_name: &str) -> EngineResult<CompiledWorkflow> {
        let definition = Self::into_definition(Self::parse(content)?, fallback_name)?;
        Ok(definition.compile()?)
    }

    /// Convert a document into the format-independent definition.
    pub fn into_definition(
        document: WorkflowDocument,
        fallback_name: &str,
    ) -> EngineResult<WorkflowDefinition> {
        let mut definition = WorkflowDefinition::new(
            document
                .name
                .unwrap_or_else(|| fallback_name.to_string()),
        );
        definition.env = document.env;

        if let Some(on) = &document.on {
            definition.triggers = Self::convert_triggers(on)?;
        }
        if let Some(concurrency) = document.concurrency {
            definition.concurrency = Some(Self::convert_concurrency(concurrency));
        }

        if document.jobs.is_empty() {
            return Err(EngineError::InvalidWorkflow(
                "workflow has no jobs".to_string(),
            ));
        }

        for (id, job) in document.jobs {
            definition.jobs.push(Self::convert_job(id, job)?);
        }

        Ok(definition)
    }

    fn convert_triggers(on: &Trigger) -> EngineResult<TriggerRules> {
        let events: Vec<(&str, Option<&EventConfig>)> = match on {
            Trigger::Single(event) => vec![(event.as_str(), None)],
            Trigger::Multiple(events) => events.iter().map(|e| (e.as_str(), None)).collect(),
            Trigger::Detailed(events) => events
                .0
                .iter()
                .map(|(e, config)| (e.as_str(), config.as_ref()))
                .collect(),
        };

        let mut rules = TriggerRules::new();
        for (event, config) in events {
            let kind: TriggerKind = event.parse().map_err(EngineError::InvalidWorkflow)?;
            let mut rule = TriggerRule::new(kind);
            if let Some(config) = config {
                rule = rule
                    .branches(config.branches.iter().cloned())
                    .branches_ignore(config.branches_ignore.iter().cloned())
                    .tags(config.tags.iter().cloned())
                    .tags_ignore(config.tags_ignore.iter().cloned());
            }
            rules = rules.rule(rule);
        }
        Ok(rules)
    }

    fn convert_concurrency(concurrency: Concurrency) -> ConcurrencySetting {
        match concurrency {
            Concurrency::Simple(group) => ConcurrencySetting::new(group, false),
            Concurrency::Detailed {
                group,
                cancel_in_progress: CancelInProgress::Bool(flag),
            } => ConcurrencySetting::new(group, flag),
            Concurrency::Detailed {
                group,
                cancel_in_progress: CancelInProgress::Expression(expression),
            } => ConcurrencySetting::cancel_when(group, expression),
        }
    }

    fn convert_job(id: String, job: Job) -> EngineResult<JobTemplate> {
        if job.steps.is_empty() {
            return Err(EngineError::InvalidWorkflow(format!(
                "job '{}' has no steps",
                id
            )));
        }

        let mut template = JobTemplate::new(id).continue_on_failure(job.continue_on_failure);
        template.env = job.env;

        if let Some(name) = job.name {
            template = template.named(name);
        }
        for need in job.needs.to_vec() {
            template = if need.continue_on_failure() {
                template.needs_allowing_failure(need.job())
            } else {
                template.needs(need.job())
            };
        }
        if let Some(condition) = job.if_condition {
            template = template.when(condition);
        }
        if let Some(concurrency) = job.concurrency {
            template = template.concurrency(Self::convert_concurrency(concurrency));
        }
        if let Some(strategy) = job.strategy {
            if let Some(matrix) = strategy.matrix {
                let spec = matrix
                    .axes
                    .into_iter()
                    .fold(MatrixSpec::new(), |spec, (axis, values)| spec.axis(axis, values));
                let spec = matrix
                    .exclude
                    .into_iter()
                    .fold(spec, |spec, partial| spec.exclude(Binding::from_pairs(partial)));
                template = template.matrix(spec);
            }
            if let Some(limit) = strategy.max_parallel {
                template = template.max_parallel(limit);
            }
        }

        for step in job.steps {
            template = template.step(Self::convert_step(step));
        }
        Ok(template)
    }

    fn convert_step(step: Step) -> StepTemplate {
        let mut template = StepTemplate::new(step.run);
        template.env = step.env;
        if let Some(id) = step.id {
            template = template.id(id);
        }
        if let Some(name) = step.name {
            template = template.named(name);
        }
        if let Some(condition) = step.if_condition {
            template = template.when(condition);
        }
        if step.always {
            template = template.always();
        }
        template
    }
}
