// Engine
// One run end to end: trigger check, concurrency registration, scheduling, release

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::concurrency::{ConcurrencyController, ConcurrencyGroup, Registration};
use crate::execution::context::{RunContext, RunId, RunIdAllocator};
use crate::execution::events::ProgressSender;
use crate::execution::executor::RunExecutor;
use crate::execution::matrix::InstanceId;
use crate::execution::scheduler::{RunReport, Scheduler};
use crate::execution::state::RunHandle;
use crate::execution::template::CompiledWorkflow;
use crate::expression::ExpressionContext;
use crate::runners::TaskRunner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// A run that has been admitted and registered with its concurrency groups
pub struct PreparedRun {
    workflow: Arc<CompiledWorkflow>,
    handle: Arc<RunHandle>,
    context: Arc<RunContext>,
    events: Option<ProgressSender>,
    /// Effective group keys to release once the run is over
    claims: Vec<String>,
}

impl PreparedRun {
    pub fn run_id(&self) -> RunId {
        self.handle.run_id()
    }

    pub fn handle(&self) -> &Arc<RunHandle> {
        &self.handle
    }

    /// Superseded during registration; executing it cancels everything
    pub fn is_superseded(&self) -> bool {
        self.handle.superseded_by().is_some()
    }

    /// Group keys the run holds claims on
    pub fn claims(&self) -> &[String] {
        &self.claims
    }
}

/// Runs workflows against a shared concurrency controller
pub struct Engine {
    config: EngineConfig,
    controller: Arc<ConcurrencyController>,
    runner: Arc<dyn TaskRunner>,
    run_ids: RunIdAllocator,
    working_dir: PathBuf,
}

impl Engine {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            config: EngineConfig::default(),
            controller: Arc::new(ConcurrencyController::new()),
            runner,
            run_ids: RunIdAllocator::new(),
            working_dir: PathBuf::from("."),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share group state with other engines
    pub fn with_controller(mut self, controller: Arc<ConcurrencyController>) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.controller
    }

    /// Allocate the id for the next run
    pub fn next_run_id(&self) -> RunId {
        self.run_ids.next_id()
    }

    /// Admit a run: check its trigger, create its instances and claim its
    /// concurrency groups. Older runs in the same groups may be cancelled here.
    pub fn prepare(
        &self,
        workflow: Arc<CompiledWorkflow>,
        context: RunContext,
        events: Option<ProgressSender>,
    ) -> EngineResult<PreparedRun> {
        if !workflow.triggers.matches(&context) {
            return Err(EngineError::NotTriggered {
                trigger: context.trigger().to_string(),
                git_ref: context.git_ref().to_string(),
            });
        }

        let run_id = context.run_id();
        let handle = Arc::new(RunHandle::new(
            run_id,
            workflow.graph.instance_ids(),
            events.clone(),
        ));
        let mut claims = Vec::new();

        if let Some(spec) = &workflow.concurrency {
            let group = spec.resolve(&ExpressionContext::new().with_run(&context));
            let registration = self.controller.register(&handle, &group);
            self.note(run_id, &group, &registration);
            claims.push(ConcurrencyController::effective_key(&group, run_id));
        }

        // A run that lost its workflow group claims nothing else
        let groups = if handle.is_cancelled() {
            Vec::new()
        } else {
            self.job_groups(&workflow, &context)
        };

        for (group, instances) in groups {
            let registration = self
                .controller
                .register_instances(&handle, &group, instances);
            self.note(run_id, &group, &registration);
            claims.push(ConcurrencyController::effective_key(&group, run_id));
        }

        claims.sort();
        claims.dedup();

        Ok(PreparedRun {
            workflow,
            handle,
            context: Arc::new(context),
            events,
            claims,
        })
    }

    /// Schedule a prepared run to completion and release its claims
    pub async fn execute(&self, prepared: PreparedRun) -> EngineResult<RunReport> {
        let PreparedRun {
            workflow,
            handle,
            context,
            events,
            claims,
        } = prepared;
        let run_id = handle.run_id();

        let executor = RunExecutor::new(Arc::clone(&self.runner))
            .with_progress(events)
            .with_env(workflow.env.clone())
            .with_working_dir(self.working_dir.clone());

        let result = Scheduler::new(workflow, Arc::new(executor))
            .with_config(self.config.clone())
            .run(Arc::clone(&handle), context)
            .await;

        for key in &claims {
            self.controller.release(key, run_id);
        }

        Ok(result?)
    }

    /// Prepare and execute in one go
    pub async fn run(
        &self,
        workflow: Arc<CompiledWorkflow>,
        context: RunContext,
        events: Option<ProgressSender>,
    ) -> EngineResult<RunReport> {
        let prepared = self.prepare(workflow, context, events)?;
        self.execute(prepared).await
    }

    /// Job-level groups resolved per instance, instances sharing a group
    /// claimed together
    fn job_groups(
        &self,
        workflow: &CompiledWorkflow,
        context: &RunContext,
    ) -> Vec<(ConcurrencyGroup, Vec<InstanceId>)> {
        let mut groups: BTreeMap<(String, bool), Vec<InstanceId>> = BTreeMap::new();

        for node in workflow.graph.nodes() {
            let Some(spec) = &node.concurrency else {
                continue;
            };
            for instance in &node.instances {
                let ctx = ExpressionContext::new()
                    .with_run(context)
                    .with_matrix(&instance.binding);
                let group = spec.resolve(&ctx);
                groups
                    .entry((group.key, group.cancel_in_progress))
                    .or_default()
                    .push(instance.id.clone());
            }
        }

        groups
            .into_iter()
            .map(|((key, cancel), ids)| (ConcurrencyGroup::new(key, cancel), ids))
            .collect()
    }

    fn note(&self, run_id: RunId, group: &ConcurrencyGroup, registration: &Registration) {
        match registration {
            Registration::Accepted { superseded } if superseded.is_empty() => {
                debug!(run_id = %run_id, group = %group.key, "concurrency group claimed");
            }
            Registration::Accepted { superseded } => {
                for s in superseded {
                    info!(
                        run_id = %run_id,
                        group = %group.key,
                        superseded = %s.run_id,
                        cancelled = s.cancelled.len(),
                        "took over concurrency group"
                    );
                }
            }
            Registration::Superseded { by } => {
                info!(run_id = %run_id, group = %group.key, by = %by, "newer run holds the group, cancelled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::TriggerKind;
    use crate::execution::state::{AggregateOutcome, ExecutionState};
    use crate::execution::template::{
        ConcurrencySetting, JobTemplate, StepTemplate, WorkflowDefinition,
    };
    use crate::runners::ScriptedRunner;
    use crate::workflow::triggers::{TriggerRule, TriggerRules};

    use std::time::Duration;

    fn build_workflow(group: Option<ConcurrencySetting>) -> Arc<CompiledWorkflow> {
        let mut definition = WorkflowDefinition::new("ci")
            .job(JobTemplate::new("build").step(StepTemplate::new("make")));
        if let Some(group) = group {
            definition = definition.concurrency(group);
        }
        Arc::new(definition.compile().unwrap())
    }

    fn context(engine: &Engine) -> RunContext {
        RunContext::new(engine.next_run_id(), TriggerKind::Push, "main")
    }

    fn build() -> InstanceId {
        InstanceId::singleton("build")
    }

    async fn wait_until_running(handle: &RunHandle, id: &InstanceId) {
        for _ in 0..200 {
            if handle.state(id) == Some(ExecutionState::Running) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never started", id);
    }

    #[tokio::test]
    async fn test_run_without_groups() {
        let engine = Engine::new(Arc::new(ScriptedRunner::new()));
        let report = engine
            .run(build_workflow(None), context(&engine), None)
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.run_id, RunId::new(1));
    }

    #[tokio::test]
    async fn test_newer_run_supersedes_running_run() {
        let controller = Arc::new(ConcurrencyController::new());
        let first = Engine::new(Arc::new(ScriptedRunner::new().hang_job("build")))
            .with_controller(controller.clone());
        let second = Engine::new(Arc::new(ScriptedRunner::new())).with_controller(controller.clone());
        let workflow = build_workflow(Some(ConcurrencySetting::new("main", true)));

        let r1 = first
            .prepare(
                workflow.clone(),
                RunContext::new(RunId::new(1), TriggerKind::Push, "main"),
                None,
            )
            .unwrap();
        let r1_handle = r1.handle().clone();
        let r1_task = tokio::spawn(async move { first.execute(r1).await });
        wait_until_running(&r1_handle, &build()).await;

        let r2 = second
            .prepare(
                workflow,
                RunContext::new(RunId::new(2), TriggerKind::Push, "main"),
                None,
            )
            .unwrap();
        assert_eq!(r1_handle.state(&build()), Some(ExecutionState::Cancelled));

        let r2_report = second.execute(r2).await.unwrap();
        assert!(r2_report.succeeded());

        let r1_report = r1_task.await.unwrap().unwrap();
        assert_eq!(r1_report.outcome, AggregateOutcome::Cancelled);
        assert_eq!(r1_report.superseded_by, Some(RunId::new(2)));
        assert!(controller.active_runs("main").is_empty());
    }

    #[tokio::test]
    async fn test_without_cancel_in_progress_runs_overlap() {
        let controller = Arc::new(ConcurrencyController::new());
        let engine = Arc::new(
            Engine::new(Arc::new(
                ScriptedRunner::new().with_delay(Duration::from_millis(30)),
            ))
            .with_controller(controller.clone()),
        );
        let workflow = build_workflow(Some(ConcurrencySetting::new("main", false)));

        let r1 = engine
            .prepare(workflow.clone(), context(&engine), None)
            .unwrap();
        let r2 = engine.prepare(workflow, context(&engine), None).unwrap();
        assert_eq!(
            controller.active_runs("main"),
            vec![RunId::new(1), RunId::new(2)]
        );

        let (a, b) = tokio::join!(engine.execute(r1), engine.execute(r2));
        assert!(a.unwrap().succeeded());
        assert!(b.unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_late_arrival_is_superseded() {
        let engine = Engine::new(Arc::new(ScriptedRunner::new()));
        let workflow = build_workflow(Some(ConcurrencySetting::new("ci-${{ ref }}", true)));

        let newer = engine
            .prepare(
                workflow.clone(),
                RunContext::new(RunId::new(7), TriggerKind::Push, "main"),
                None,
            )
            .unwrap();
        let older = engine
            .prepare(
                workflow,
                RunContext::new(RunId::new(3), TriggerKind::Push, "main"),
                None,
            )
            .unwrap();

        assert!(older.is_superseded());
        assert!(!newer.is_superseded());
        assert_eq!(older.claims().to_vec(), vec!["ci-refs/heads/main".to_string()]);

        let report = engine.execute(older).await.unwrap();
        assert_eq!(report.outcome, AggregateOutcome::Cancelled);
        assert_eq!(report.superseded_by, Some(RunId::new(7)));
        assert!(engine.execute(newer).await.unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_job_group_cancels_only_its_instances() {
        let controller = Arc::new(ConcurrencyController::new());
        let workflow = Arc::new(
            WorkflowDefinition::new("deploy")
                .job(JobTemplate::new("test").step(StepTemplate::new("make test")))
                .job(
                    JobTemplate::new("deploy")
                        .concurrency(ConcurrencySetting::new("deploy-${{ ref }}", true))
                        .step(StepTemplate::new("./deploy.sh")),
                )
                .compile()
                .unwrap(),
        );
        let deploy = InstanceId::singleton("deploy");

        let first = Engine::new(Arc::new(ScriptedRunner::new().hang_job("deploy")))
            .with_controller(controller.clone());
        let r1 = first
            .prepare(
                workflow.clone(),
                RunContext::new(RunId::new(1), TriggerKind::Push, "main"),
                None,
            )
            .unwrap();
        let r1_handle = r1.handle().clone();
        let r1_task = tokio::spawn(async move { first.execute(r1).await });
        wait_until_running(&r1_handle, &deploy).await;

        let second = Engine::new(Arc::new(ScriptedRunner::new())).with_controller(controller);
        let r2_report = second
            .run(
                workflow,
                RunContext::new(RunId::new(2), TriggerKind::Push, "main"),
                None,
            )
            .await
            .unwrap();
        assert!(r2_report.succeeded());

        let r1_report = r1_task.await.unwrap().unwrap();
        assert_eq!(r1_report.state_of(&deploy), Some(ExecutionState::Cancelled));
        assert_eq!(
            r1_report.state_of(&InstanceId::singleton("test")),
            Some(ExecutionState::Succeeded)
        );
        assert_eq!(r1_report.superseded_by, None);
        assert_eq!(r1_report.outcome, AggregateOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_untriggered_workflow_is_rejected() {
        let workflow = Arc::new(
            WorkflowDefinition::new("release")
                .triggers(TriggerRules::new().rule(TriggerRule::new(TriggerKind::Tag)))
                .job(JobTemplate::new("build").step(StepTemplate::new("make")))
                .compile()
                .unwrap(),
        );
        let engine = Engine::new(Arc::new(ScriptedRunner::new()));

        let err = engine
            .run(workflow, context(&engine), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotTriggered { .. }));
    }
}
