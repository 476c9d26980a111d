// Scheduler
// Drives one run: gates instances on their dependencies and conditions,
// dispatches everything eligible and feeds outcomes back into the state table

use crate::config::{DependencyMode, EngineConfig};
use crate::error::SchedulingViolation;
use crate::execution::context::{RunContext, RunId};
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::executor::{InstanceReport, RunExecutor};
use crate::execution::graph::JobNode;
use crate::execution::matrix::{InstanceId, JobInstance};
use crate::execution::state::{AggregateOutcome, ExecutionState, Outcome, RunHandle, Transition};
use crate::execution::template::CompiledWorkflow;
use crate::expression::{ExpressionContext, StatusView};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, info_span, Instrument};

/// Final state of one instance
#[derive(Debug, Clone)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub display_name: String,
    pub state: ExecutionState,
    /// Present when the instance was dispatched
    pub report: Option<InstanceReport>,
}

/// Result of a whole run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow: String,
    pub outcome: AggregateOutcome,
    /// Instances in execution order
    pub instances: Vec<InstanceSummary>,
    pub superseded_by: Option<RunId>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl RunReport {
    /// 0 iff the run succeeded
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == AggregateOutcome::Succeeded
    }

    pub fn instance(&self, id: &InstanceId) -> Option<&InstanceSummary> {
        self.instances.iter().find(|s| &s.id == id)
    }

    pub fn state_of(&self, id: &InstanceId) -> Option<ExecutionState> {
        self.instance(id).map(|s| s.state)
    }

    /// Number of instances that ended in `state`
    pub fn count(&self, state: ExecutionState) -> usize {
        self.instances.iter().filter(|s| s.state == state).count()
    }
}

/// What the dependencies of an instance allow once they are all terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    Skip,
    Cancel,
}

/// Position of an instance in the graph: (node index, instance index)
type Slot = (usize, usize);

/// Schedules the instances of one compiled workflow
pub struct Scheduler {
    workflow: Arc<CompiledWorkflow>,
    executor: Arc<RunExecutor>,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(workflow: Arc<CompiledWorkflow>, executor: Arc<RunExecutor>) -> Self {
        Self {
            workflow,
            executor,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute the run to completion. Returns once every instance is terminal
    /// and every dispatched task has reported.
    pub async fn run(
        &self,
        run: Arc<RunHandle>,
        context: Arc<RunContext>,
    ) -> Result<RunReport, SchedulingViolation> {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = run.run_id();
        let order = self.execution_order();

        info!(
            run_id = %run_id,
            workflow = %self.workflow.name,
            instances = order.len(),
            "run started"
        );
        run.events().send_event(ExecutionEvent::run_started(
            run_id,
            &self.workflow.name,
            order.len(),
        ));

        let token = run.token();
        let mut tasks: JoinSet<(InstanceId, InstanceReport)> = JoinSet::new();
        let mut in_flight: HashMap<InstanceId, usize> = HashMap::new();
        let mut task_ids: HashMap<task::Id, InstanceId> = HashMap::new();
        let mut reports: HashMap<InstanceId, InstanceReport> = HashMap::new();
        let mut cancel_seen = false;

        loop {
            self.advance(&run, &context, &order)?;
            self.dispatch(
                &run,
                &context,
                &order,
                &mut tasks,
                &mut in_flight,
                &mut task_ids,
            )?;

            if tasks.is_empty() {
                // Tasks that ended without a report and without a known task id
                if !in_flight.is_empty() {
                    for (id, _) in in_flight.drain() {
                        error!(run_id = %run_id, instance = %id, "job task ended without a report");
                        run.transition(&id, ExecutionState::Failed)?;
                    }
                    continue;
                }
                if run.is_finished() {
                    break;
                }
                return Err(SchedulingViolation::Stalled {
                    remaining: run.non_terminal().len(),
                });
            }

            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    Some(Ok((task, (id, report)))) => {
                        task_ids.remove(&task);
                        in_flight.remove(&id);
                        self.record(&run, &id, &report)?;
                        reports.insert(id, report);
                    }
                    // A panicked task frees its slot at once so dependents
                    // and queued siblings are not held back
                    Some(Err(e)) => match task_ids.remove(&e.id()) {
                        Some(id) => {
                            in_flight.remove(&id);
                            error!(run_id = %run_id, instance = %id, error = %e, "job task ended without a report");
                            run.transition(&id, ExecutionState::Failed)?;
                        }
                        None => {
                            error!(run_id = %run_id, error = %e, "unknown job task failed to complete");
                        }
                    },
                    None => {}
                },
                _ = token.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    let cancelled = run.cancel();
                    info!(
                        run_id = %run_id,
                        cancelled = cancelled.len(),
                        running = in_flight.len(),
                        "run cancelled, waiting for running jobs to stop"
                    );
                }
            }
        }

        let states = run.snapshot();
        let outcome = AggregateOutcome::from_states(states.values());
        let duration = start.elapsed();

        let instances = order
            .iter()
            .map(|&slot| {
                let instance = self.instance_at(slot);
                InstanceSummary {
                    id: instance.id.clone(),
                    display_name: instance.display_name.clone(),
                    state: states
                        .get(&instance.id)
                        .copied()
                        .unwrap_or(ExecutionState::Cancelled),
                    report: reports.remove(&instance.id),
                }
            })
            .collect();

        info!(
            run_id = %run_id,
            outcome = %outcome,
            duration_ms = duration.as_millis() as u64,
            "run finished"
        );
        run.events()
            .send_event(ExecutionEvent::run_completed(run_id, outcome, duration));

        Ok(RunReport {
            run_id,
            workflow: self.workflow.name.clone(),
            outcome,
            instances,
            superseded_by: run.superseded_by(),
            started_at,
            duration,
        })
    }

    /// Every instance, dependencies before dependents
    fn execution_order(&self) -> Vec<Slot> {
        let nodes = self.workflow.graph.nodes();
        self.workflow
            .graph
            .topological_order()
            .into_iter()
            .filter_map(|node| nodes.iter().position(|n| n.id() == node.id()))
            .flat_map(|n| (0..nodes[n].instances.len()).map(move |i| (n, i)))
            .collect()
    }

    fn node_at(&self, (node, _): Slot) -> &JobNode {
        &self.workflow.graph.nodes()[node]
    }

    fn instance_at(&self, (node, instance): Slot) -> &JobInstance {
        &self.workflow.graph.nodes()[node].instances[instance]
    }

    /// Dependency instances that gate `instance`
    fn relevant_dependencies<'a>(
        &'a self,
        node: &JobNode,
        instance: &JobInstance,
    ) -> Vec<(&'a str, &'a JobInstance)> {
        let mut relevant = Vec::new();
        for dep in self.workflow.graph.dependencies_of(node.id()) {
            for candidate in &dep.instances {
                let paired = match self.config.dependency_mode {
                    DependencyMode::FanIn => true,
                    DependencyMode::FanOut => candidate.binding.compatible_with(&instance.binding),
                };
                if paired {
                    relevant.push((dep.id(), candidate));
                }
            }
        }
        relevant
    }

    /// Move pending and blocked instances forward as far as their
    /// dependencies and conditions allow
    fn advance(
        &self,
        run: &RunHandle,
        context: &RunContext,
        order: &[Slot],
    ) -> Result<(), SchedulingViolation> {
        for &slot in order {
            let node = self.node_at(slot);
            let instance = self.instance_at(slot);
            let id = &instance.id;

            let current = match run.state(id) {
                Some(state @ (ExecutionState::Pending | ExecutionState::Blocked)) => state,
                Some(_) => continue,
                None => return Err(SchedulingViolation::UnknownInstance(id.clone())),
            };

            // Conditions that ignore outcomes are decided up front
            if let Some(condition) = &node.condition {
                if !condition.references_outcomes() {
                    let ctx = ExpressionContext::new()
                        .with_run(context)
                        .with_matrix(&instance.binding);
                    if !condition.evaluate(&ctx) {
                        debug!(instance = %id, condition = condition.source(), "condition false, skipping");
                        run.transition(id, ExecutionState::Skipped)?;
                        continue;
                    }
                }
            }

            let dependencies = self.relevant_dependencies(node, instance);
            let mut outcomes = Vec::with_capacity(dependencies.len());
            for (template, dep) in &dependencies {
                match run.state(&dep.id).and_then(|s| s.outcome()) {
                    Some(outcome) => outcomes.push((*template, outcome)),
                    None => break,
                }
            }

            if outcomes.len() < dependencies.len() {
                if current == ExecutionState::Pending {
                    run.transition(id, ExecutionState::Blocked)?;
                }
                continue;
            }

            let next = self.resolve(node, instance, context, run.is_cancelled(), &outcomes);
            if next == ExecutionState::Ready {
                debug!(instance = %id, "dependencies satisfied");
            } else {
                debug!(instance = %id, state = %next, "not running");
            }
            run.transition(id, next)?;
        }
        Ok(())
    }

    /// Decide the state of an instance whose dependencies are all terminal
    fn resolve(
        &self,
        node: &JobNode,
        instance: &JobInstance,
        context: &RunContext,
        run_cancelled: bool,
        outcomes: &[(&str, Outcome)],
    ) -> ExecutionState {
        let mut gate = Gate::Open;
        for &(template, outcome) in outcomes {
            match outcome {
                Outcome::Succeeded => {}
                Outcome::Cancelled => gate = Gate::Cancel,
                Outcome::Failed | Outcome::Skipped => {
                    if gate == Gate::Open && !node.template.tolerates_failure_of(template) {
                        gate = Gate::Skip;
                    }
                }
            }
        }

        let needs = needs_results(outcomes);
        let status = StatusView {
            failed: outcomes.iter().any(|(_, o)| *o == Outcome::Failed),
            cancelled: run_cancelled || outcomes.iter().any(|(_, o)| *o == Outcome::Cancelled),
        };
        let ctx = ExpressionContext::new()
            .with_run(context)
            .with_matrix(&instance.binding)
            .with_needs(&needs)
            .with_status(status);

        match &node.condition {
            // A status function replaces the implicit success gate
            Some(condition) if condition.has_status_check() => {
                if condition.evaluate(&ctx) {
                    ExecutionState::Ready
                } else {
                    ExecutionState::Skipped
                }
            }
            condition => match gate {
                Gate::Cancel => ExecutionState::Cancelled,
                Gate::Skip => ExecutionState::Skipped,
                Gate::Open if condition.as_ref().is_some_and(|c| !c.evaluate(&ctx)) => {
                    ExecutionState::Skipped
                }
                Gate::Open => ExecutionState::Ready,
            },
        }
    }

    /// Start every ready instance the parallelism limits allow
    fn dispatch(
        &self,
        run: &Arc<RunHandle>,
        context: &Arc<RunContext>,
        order: &[Slot],
        tasks: &mut JoinSet<(InstanceId, InstanceReport)>,
        in_flight: &mut HashMap<InstanceId, usize>,
        task_ids: &mut HashMap<task::Id, InstanceId>,
    ) -> Result<(), SchedulingViolation> {
        for &slot in order {
            if !self.config.allows(in_flight.len()) {
                break;
            }

            let node = self.node_at(slot);
            let instance = self.instance_at(slot);
            if run.state(&instance.id) != Some(ExecutionState::Ready) {
                continue;
            }

            if let Some(limit) = node.template.max_parallel.filter(|&l| l > 0) {
                let running = in_flight.values().filter(|&&n| n == slot.0).count();
                if running >= limit {
                    continue;
                }
            }

            let mut needs_outcomes = Vec::new();
            for (template, dep) in self.relevant_dependencies(node, instance) {
                match run.state(&dep.id).and_then(|s| s.outcome()) {
                    Some(outcome) => needs_outcomes.push((template, outcome)),
                    None => {
                        return Err(SchedulingViolation::DispatchBeforeDependencies {
                            instance: instance.id.clone(),
                            dependency: dep.id.clone(),
                        })
                    }
                }
            }
            let needs = needs_results(&needs_outcomes);

            if run.transition(&instance.id, ExecutionState::Running)? != Transition::Applied {
                continue;
            }
            in_flight.insert(instance.id.clone(), slot.0);

            let workflow = Arc::clone(&self.workflow);
            let executor = Arc::clone(&self.executor);
            let context = Arc::clone(context);
            let cancel = run.instance_token(&instance.id);
            let span = info_span!("job", run_id = %run.run_id(), instance = %instance.id);
            let (node_idx, instance_idx) = slot;

            let spawned = tasks.spawn(
                async move {
                    let node = &workflow.graph.nodes()[node_idx];
                    let instance = &node.instances[instance_idx];
                    let report = executor
                        .execute(node, instance, &context, &needs, cancel)
                        .await;
                    (instance.id.clone(), report)
                }
                .instrument(span),
            );
            task_ids.insert(spawned.id(), instance.id.clone());
        }
        Ok(())
    }

    /// Apply an executor report. The first terminal state wins.
    fn record(
        &self,
        run: &RunHandle,
        id: &InstanceId,
        report: &InstanceReport,
    ) -> Result<(), SchedulingViolation> {
        let reported = ExecutionState::from(report.outcome);
        if let Transition::Ignored { current } = run.transition(id, reported)? {
            debug!(
                run_id = %run.run_id(),
                instance = %id,
                reported = %reported,
                current = %current,
                "cancellation race: late report ignored"
            );
        }
        Ok(())
    }
}

/// Result per dependency template, as seen by `needs.<job>.result`
fn needs_results(outcomes: &[(&str, Outcome)]) -> BTreeMap<String, Outcome> {
    let mut needs: BTreeMap<String, Outcome> = BTreeMap::new();
    for &(template, outcome) in outcomes {
        let merged = match needs.get(template) {
            None => outcome,
            Some(&existing) => worst(existing, outcome),
        };
        needs.insert(template.to_string(), merged);
    }
    needs
}

/// Failure dominates cancellation, which dominates success; a template is
/// skipped only when every instance was
fn worst(a: Outcome, b: Outcome) -> Outcome {
    let rank = |o: Outcome| match o {
        Outcome::Skipped => 0,
        Outcome::Succeeded => 1,
        Outcome::Cancelled => 2,
        Outcome::Failed => 3,
    };
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::TriggerKind;
    use crate::execution::events::progress_channel;
    use crate::execution::matrix::MatrixSpec;
    use crate::execution::template::{JobTemplate, StepTemplate, WorkflowDefinition};
    use crate::runners::{
        JournalEntry, OutputCallback, ScriptedRunner, StepRequest, StepResult, TaskRunner,
    };

    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;

    /// Panics on every step of one template, delegates everything else
    struct PanickingRunner {
        template: &'static str,
        inner: ScriptedRunner,
    }

    #[async_trait::async_trait]
    impl TaskRunner for PanickingRunner {
        async fn run(
            &self,
            request: &StepRequest,
            on_output: OutputCallback,
            cancel: CancellationToken,
        ) -> StepResult {
            if request.instance.template() == self.template {
                panic!("runner crashed on {}", request.instance);
            }
            self.inner.run(request, on_output, cancel).await
        }
    }

    fn job(id: &str) -> JobTemplate {
        JobTemplate::new(id).step(StepTemplate::new(format!("make {}", id)))
    }

    fn compile(jobs: Vec<JobTemplate>) -> Arc<CompiledWorkflow> {
        let definition = jobs
            .into_iter()
            .fold(WorkflowDefinition::new("ci"), |def, job| def.job(job));
        Arc::new(definition.compile().unwrap())
    }

    fn context(trigger: TriggerKind) -> Arc<RunContext> {
        Arc::new(RunContext::new(RunId::new(1), trigger, "main"))
    }

    fn handle(workflow: &CompiledWorkflow) -> Arc<RunHandle> {
        Arc::new(RunHandle::new(RunId::new(1), workflow.graph.instance_ids(), None))
    }

    async fn run(
        workflow: Arc<CompiledWorkflow>,
        runner: Arc<ScriptedRunner>,
        config: EngineConfig,
    ) -> RunReport {
        let run = handle(&workflow);
        Scheduler::new(workflow, Arc::new(RunExecutor::new(runner)))
            .with_config(config)
            .run(run, context(TriggerKind::Push))
            .await
            .unwrap()
    }

    fn id(template: &str) -> InstanceId {
        InstanceId::singleton(template)
    }

    fn lint_test_publish() -> Vec<JobTemplate> {
        vec![
            job("lint"),
            job("test"),
            job("publish").needs("lint").needs("test"),
        ]
    }

    /// Highest number of instances running at the same time
    fn peak_concurrency(runner: &ScriptedRunner) -> usize {
        let mut running = 0usize;
        let mut peak = 0;
        for entry in runner.journal() {
            match entry {
                JournalEntry::Started { .. } => {
                    running += 1;
                    peak = peak.max(running);
                }
                JournalEntry::Finished { .. } => running -= 1,
            }
        }
        peak
    }

    fn drain(rx: &mut UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn position_of(events: &[ExecutionEvent], instance: &InstanceId, state: ExecutionState) -> usize {
        events
            .iter()
            .position(|e| {
                matches!(e, ExecutionEvent::StateChanged(s) if &s.instance_id == instance && s.state == state)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_waits_for_lint_and_test() {
        let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(10)));
        let report = run(compile(lint_test_publish()), runner.clone(), EngineConfig::default()).await;

        assert_eq!(report.outcome, AggregateOutcome::Succeeded);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.count(ExecutionState::Succeeded), 3);

        let publish_start = runner.started_at(&id("publish")).unwrap();
        assert!(publish_start >= runner.finished_at(&id("lint")).unwrap());
        assert!(publish_start >= runner.finished_at(&id("test")).unwrap());

        // lint and test overlap
        assert_eq!(peak_concurrency(&runner), 2);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependent() {
        let runner = Arc::new(ScriptedRunner::new().fail_job("test"));
        let report = run(compile(lint_test_publish()), runner.clone(), EngineConfig::default()).await;

        assert_eq!(report.state_of(&id("test")), Some(ExecutionState::Failed));
        assert_eq!(report.state_of(&id("publish")), Some(ExecutionState::Skipped));
        assert_eq!(report.outcome, AggregateOutcome::Failed);
        assert_eq!(report.exit_code(), 1);
        assert!(!runner.started_instances().contains(&id("publish")));

        let failed = report.instance(&id("test")).unwrap().report.as_ref().unwrap();
        assert!(failed.failed_step().is_some());
    }

    #[tokio::test]
    async fn test_continue_on_failure_edge() {
        let workflow = compile(vec![
            job("lint"),
            job("test"),
            job("publish").needs("lint").needs_allowing_failure("test"),
        ]);
        let runner = Arc::new(ScriptedRunner::new().fail_job("test"));
        let report = run(workflow, runner, EngineConfig::default()).await;

        assert_eq!(report.state_of(&id("publish")), Some(ExecutionState::Succeeded));
        assert_eq!(report.outcome, AggregateOutcome::Failed);
    }

    #[tokio::test]
    async fn test_status_condition_runs_after_failure() {
        let workflow = compile(vec![
            job("test"),
            job("report").needs("test").when("always()"),
            job("notify")
                .needs("test")
                .when("failure() && needs.test.result == 'failure'"),
            job("deploy").needs("test").when("success()"),
        ]);
        let runner = Arc::new(ScriptedRunner::new().fail_job("test"));
        let report = run(workflow, runner, EngineConfig::default()).await;

        assert_eq!(report.state_of(&id("report")), Some(ExecutionState::Succeeded));
        assert_eq!(report.state_of(&id("notify")), Some(ExecutionState::Succeeded));
        assert_eq!(report.state_of(&id("deploy")), Some(ExecutionState::Skipped));
    }

    #[tokio::test]
    async fn test_needs_condition_waits_for_outcome() {
        let workflow = compile(vec![
            job("build"),
            job("publish")
                .needs("build")
                .when("needs.build.result == 'success'"),
            job("rollback")
                .needs("build")
                .when("needs.build.result == 'failure'"),
        ]);
        let report = run(workflow, Arc::new(ScriptedRunner::new()), EngineConfig::default()).await;

        assert_eq!(report.state_of(&id("publish")), Some(ExecutionState::Succeeded));
        assert_eq!(report.state_of(&id("rollback")), Some(ExecutionState::Skipped));
    }

    #[tokio::test]
    async fn test_static_condition_skips_before_dependencies_finish() {
        let workflow = compile(vec![
            job("build"),
            job("release").needs("build").when("trigger == 'tag'"),
        ]);
        let (tx, mut rx) = progress_channel();
        let handle = Arc::new(RunHandle::new(
            RunId::new(1),
            workflow.graph.instance_ids(),
            Some(tx),
        ));
        let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(10)));

        let report = Scheduler::new(workflow, Arc::new(RunExecutor::new(runner)))
            .run(handle, context(TriggerKind::Push))
            .await
            .unwrap();

        assert_eq!(report.state_of(&id("release")), Some(ExecutionState::Skipped));
        assert_eq!(report.outcome, AggregateOutcome::Succeeded);

        let events = drain(&mut rx);
        assert!(
            position_of(&events, &id("release"), ExecutionState::Skipped)
                < position_of(&events, &id("build"), ExecutionState::Succeeded)
        );
        assert!(matches!(events.first(), Some(ExecutionEvent::RunStarted { .. })));
        assert!(matches!(events.last(), Some(ExecutionEvent::RunCompleted { .. })));
    }

    #[tokio::test]
    async fn test_global_parallelism_limit() {
        let workflow = compile(vec![
            job("a"),
            job("b"),
            job("c"),
            job("d").needs("a"),
        ]);
        let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(5)));
        let report = run(
            workflow,
            runner.clone(),
            EngineConfig::default().with_max_parallel(1),
        )
        .await;

        assert!(report.succeeded());
        assert_eq!(peak_concurrency(&runner), 1);
    }

    #[tokio::test]
    async fn test_template_parallelism_limit() {
        let matrix = MatrixSpec::new()
            .axis("os", ["linux", "macos"])
            .axis("version", [1, 2]);
        let workflow = compile(vec![job("test").matrix(matrix).max_parallel(2)]);
        let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(5)));
        let report = run(workflow, runner.clone(), EngineConfig::default()).await;

        assert_eq!(report.instances.len(), 4);
        assert!(report.succeeded());
        assert_eq!(peak_concurrency(&runner), 2);
    }

    #[tokio::test]
    async fn test_fan_in_waits_for_every_matrix_instance() {
        let matrix = || MatrixSpec::new().axis("os", ["linux", "macos"]);
        let jobs = || {
            vec![
                job("build").matrix(matrix()),
                job("test").matrix(matrix()).needs("build"),
            ]
        };
        let runner =
            || Arc::new(ScriptedRunner::new().fail_instance(InstanceId::matrix("build", 0)));

        let fan_in = run(compile(jobs()), runner(), EngineConfig::default()).await;
        assert_eq!(fan_in.state_of(&InstanceId::matrix("test", 0)), Some(ExecutionState::Skipped));
        assert_eq!(fan_in.state_of(&InstanceId::matrix("test", 1)), Some(ExecutionState::Skipped));

        let fan_out = run(
            compile(jobs()),
            runner(),
            EngineConfig::default().with_dependency_mode(DependencyMode::FanOut),
        )
        .await;
        assert_eq!(fan_out.state_of(&InstanceId::matrix("test", 0)), Some(ExecutionState::Skipped));
        assert_eq!(
            fan_out.state_of(&InstanceId::matrix("test", 1)),
            Some(ExecutionState::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_fan_in_dependent_starts_after_every_instance() {
        let matrix = || MatrixSpec::new().axis("os", ["linux", "macos", "windows"]);
        let workflow = compile(vec![
            job("build").matrix(matrix()),
            job("test").matrix(matrix()).needs("build"),
        ]);
        let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(10)));
        let report = run(workflow, runner.clone(), EngineConfig::default()).await;
        assert!(report.succeeded());

        let last_build = (0..3)
            .map(|j| runner.finished_at(&InstanceId::matrix("build", j)).unwrap())
            .max()
            .unwrap();
        for i in 0..3 {
            let started = runner.started_at(&InstanceId::matrix("test", i)).unwrap();
            assert!(started >= last_build, "test[{}] started before build finished", i);
        }
    }

    #[tokio::test]
    async fn test_panicked_job_fails_without_waiting_for_siblings() {
        let workflow = compile(vec![
            job("crash"),
            job("slow"),
            job("report").needs("crash").when("always()"),
        ]);
        let runner = Arc::new(PanickingRunner {
            template: "crash",
            inner: ScriptedRunner::new().hang_job("slow"),
        });
        let (tx, mut rx) = progress_channel();
        let handle = Arc::new(RunHandle::new(
            RunId::new(1),
            workflow.graph.instance_ids(),
            Some(tx),
        ));

        // "slow" hangs until "report" has been decided
        let watcher = handle.clone();
        tokio::spawn(async move {
            while !watcher
                .state(&id("report"))
                .is_some_and(|s| s.is_terminal())
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            watcher.cancel_instances(&[id("slow")]);
        });

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            Scheduler::new(workflow, Arc::new(RunExecutor::new(runner)))
                .run(handle, context(TriggerKind::Push)),
        )
        .await
        .expect("dependents of a panicked job must not wait for its siblings")
        .unwrap();

        assert_eq!(report.state_of(&id("crash")), Some(ExecutionState::Failed));
        assert_eq!(report.state_of(&id("report")), Some(ExecutionState::Succeeded));
        assert_eq!(report.state_of(&id("slow")), Some(ExecutionState::Cancelled));
        assert!(report.instance(&id("crash")).unwrap().report.is_none());

        let events = drain(&mut rx);
        assert!(
            position_of(&events, &id("report"), ExecutionState::Succeeded)
                < position_of(&events, &id("slow"), ExecutionState::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_cancelled_dependency_cancels_dependent() {
        let workflow = compile(vec![job("build"), job("deploy").needs("build")]);
        let runner = Arc::new(ScriptedRunner::new().hang_job("build"));
        let handle = handle(&workflow);

        let canceller = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel_instances(&[InstanceId::singleton("build")]);
        });

        let report = Scheduler::new(workflow, Arc::new(RunExecutor::new(runner)))
            .run(handle, context(TriggerKind::Push))
            .await
            .unwrap();

        assert_eq!(report.state_of(&id("build")), Some(ExecutionState::Cancelled));
        assert_eq!(report.state_of(&id("deploy")), Some(ExecutionState::Cancelled));
        assert_eq!(report.outcome, AggregateOutcome::Cancelled);
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_run_cancellation_stops_running_jobs() {
        let workflow = compile(lint_test_publish());
        let runner = Arc::new(ScriptedRunner::new().hang_job("test"));
        let handle = handle(&workflow);

        let token = handle.token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let report = Scheduler::new(workflow, Arc::new(RunExecutor::new(runner.clone())))
            .run(handle, context(TriggerKind::Push))
            .await
            .unwrap();

        assert_eq!(report.state_of(&id("lint")), Some(ExecutionState::Succeeded));
        assert_eq!(report.state_of(&id("test")), Some(ExecutionState::Cancelled));
        assert_eq!(report.state_of(&id("publish")), Some(ExecutionState::Cancelled));
        assert_eq!(report.outcome, AggregateOutcome::Cancelled);
        // the hung step observed the cancellation
        assert!(runner.finished_at(&id("test")).is_some());
    }

    #[tokio::test]
    async fn test_already_cancelled_run_finishes_without_dispatch() {
        let workflow = compile(lint_test_publish());
        let handle = handle(&workflow);
        handle.supersede(RunId::new(2));

        let runner = Arc::new(ScriptedRunner::new());
        let report = Scheduler::new(workflow, Arc::new(RunExecutor::new(runner.clone())))
            .run(handle, context(TriggerKind::Push))
            .await
            .unwrap();

        assert_eq!(report.count(ExecutionState::Cancelled), 3);
        assert_eq!(report.superseded_by, Some(RunId::new(2)));
        assert!(runner.journal().is_empty());
    }

    #[test]
    fn test_needs_results_merge_instances() {
        let needs = needs_results(&[
            ("build", Outcome::Succeeded),
            ("build", Outcome::Failed),
            ("lint", Outcome::Skipped),
            ("test", Outcome::Skipped),
            ("test", Outcome::Succeeded),
        ]);
        assert_eq!(needs["build"], Outcome::Failed);
        assert_eq!(needs["lint"], Outcome::Skipped);
        assert_eq!(needs["test"], Outcome::Succeeded);
    }
}
