// Run Executor
// Executes one job instance's steps through the task runner

use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::JobNode;
use crate::execution::matrix::JobInstance;
use crate::execution::state::Outcome;
use crate::expression::{value_to_string, ExpressionContext, StatusView};
use crate::runners::{OutputCallback, StepRequest, StepStatus, TaskRunner};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one step within an instance
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub index: usize,
    pub name: String,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Result of executing one job instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceReport {
    pub outcome: Outcome,
    pub steps: Vec<StepReport>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl InstanceReport {
    /// First failed step, if any
    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.outcome == Outcome::Failed)
    }
}

/// Executes job instances; never retries
pub struct RunExecutor {
    runner: Arc<dyn TaskRunner>,
    events: Option<ProgressSender>,
    env: BTreeMap<String, String>,
    working_dir: PathBuf,
}

impl RunExecutor {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            events: None,
            env: BTreeMap::new(),
            working_dir: PathBuf::from("."),
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.events = tx;
        self
    }

    /// Workflow-level environment shared by every step
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Run the instance's steps in declared order. After a failure only steps
    /// marked `always` (or whose condition calls `always()`/`failure()`) run;
    /// after cancellation nothing more runs.
    pub async fn execute(
        &self,
        node: &JobNode,
        instance: &JobInstance,
        run: &RunContext,
        needs: &BTreeMap<String, Outcome>,
        cancel: CancellationToken,
    ) -> InstanceReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = run.run_id();

        info!(run_id = %run_id, instance = %instance.id, name = %instance.display_name, "job started");

        let mut failed = false;
        let mut cancelled = false;
        let mut step_outcomes: BTreeMap<String, Outcome> = BTreeMap::new();
        let mut reports = Vec::with_capacity(node.steps.len());

        for step in &node.steps {
            let skip_reason = if cancelled || cancel.is_cancelled() {
                cancelled = true;
                Some("job cancelled")
            } else {
                let context = ExpressionContext::new()
                    .with_run(run)
                    .with_matrix(&instance.binding)
                    .with_needs(needs)
                    .with_steps(&step_outcomes)
                    .with_status(StatusView {
                        failed,
                        cancelled: false,
                    });

                if failed && !step.runs_after_failure() {
                    Some("an earlier step failed")
                } else if step.condition.as_ref().is_some_and(|c| !c.evaluate(&context)) {
                    Some("condition evaluated to false")
                } else {
                    None
                }
            };

            if let Some(reason) = skip_reason {
                debug!(instance = %instance.id, step = %step.label, reason, "step skipped");
                self.events.send_event(ExecutionEvent::step_skipped(
                    run_id,
                    instance.id.clone(),
                    step.index,
                    &step.label,
                    reason,
                ));
                if let Some(id) = &step.template.id {
                    step_outcomes.insert(id.clone(), Outcome::Skipped);
                }
                reports.push(StepReport {
                    index: step.index,
                    name: step.label.clone(),
                    outcome: Outcome::Skipped,
                    exit_code: None,
                    output: String::new(),
                    error: None,
                    duration: Duration::ZERO,
                });
                continue;
            }

            let context = ExpressionContext::new()
                .with_run(run)
                .with_matrix(&instance.binding)
                .with_steps(&step_outcomes);
            let request = StepRequest {
                run_id,
                instance: instance.id.clone(),
                step_index: step.index,
                step_name: step.label.clone(),
                command: step.command.render(&context),
                env: self.step_env(node, instance, run, &step.template.env),
                working_dir: self.working_dir.clone(),
            };

            self.events.send_event(ExecutionEvent::step_started(
                run_id,
                instance.id.clone(),
                step.index,
                &step.label,
            ));

            let result = self
                .runner
                .run(&request, self.output_callback(&request), cancel.clone())
                .await;

            let outcome = match result.status {
                StepStatus::Succeeded => Outcome::Succeeded,
                StepStatus::Failed => {
                    warn!(
                        instance = %instance.id,
                        step = %step.label,
                        exit_code = ?result.exit_code,
                        "step failed"
                    );
                    failed = true;
                    Outcome::Failed
                }
                StepStatus::Cancelled => {
                    cancelled = true;
                    Outcome::Cancelled
                }
            };

            self.events.send_event(ExecutionEvent::step_completed(
                run_id,
                instance.id.clone(),
                step.index,
                &step.label,
                result.status,
                result.exit_code,
                result.duration,
            ));

            if let Some(id) = &step.template.id {
                step_outcomes.insert(id.clone(), outcome);
            }
            reports.push(StepReport {
                index: step.index,
                name: step.label.clone(),
                outcome,
                exit_code: result.exit_code,
                output: result.output,
                error: result.error,
                duration: result.duration,
            });
        }

        let outcome = if cancelled || cancel.is_cancelled() {
            Outcome::Cancelled
        } else if failed {
            Outcome::Failed
        } else {
            Outcome::Succeeded
        };
        let duration = start.elapsed();

        info!(
            run_id = %run_id,
            instance = %instance.id,
            outcome = outcome.as_str(),
            duration_ms = duration.as_millis() as u64,
            "job finished"
        );

        InstanceReport {
            outcome,
            steps: reports,
            started_at,
            duration,
        }
    }

    /// Workflow env, then job env, then step env, then matrix values and run facts
    fn step_env(
        &self,
        node: &JobNode,
        instance: &JobInstance,
        run: &RunContext,
        step_env: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(node.template.env.clone());
        env.extend(step_env.clone());

        for (axis, value) in instance.binding.iter() {
            env.insert(format!("MATRIX_{}", env_name(axis)), value_to_string(value));
        }

        env.insert("GANTRY_RUN_ID".into(), run.run_id().to_string());
        env.insert("GANTRY_TRIGGER".into(), run.trigger().to_string());
        env.insert("GANTRY_REF".into(), run.git_ref().to_string());
        env.insert("GANTRY_JOB".into(), instance.id.to_string());
        env
    }

    fn output_callback(&self, request: &StepRequest) -> OutputCallback {
        let events = self.events.clone();
        let run_id = request.run_id;
        let instance = request.instance.clone();
        let step_index = request.step_index;

        Arc::new(move |line, is_error| {
            events.send_event(ExecutionEvent::step_output(
                run_id,
                instance.clone(),
                step_index,
                line,
                is_error,
            ));
        })
    }
}

/// `node-version` becomes `NODE_VERSION`
fn env_name(axis: &str) -> String {
    axis.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::{RunId, TriggerKind};
    use crate::execution::events::progress_channel;
    use crate::execution::graph::Graph;
    use crate::execution::matrix::MatrixSpec;
    use crate::execution::template::{JobTemplate, StepTemplate};
    use crate::runners::ScriptedRunner;

    fn run_context() -> RunContext {
        RunContext::new(RunId::new(1), TriggerKind::Push, "main")
    }

    fn load(job: JobTemplate) -> Graph {
        Graph::load(vec![job]).unwrap()
    }

    async fn execute(graph: &Graph, runner: Arc<ScriptedRunner>) -> InstanceReport {
        let node = &graph.nodes()[0];
        RunExecutor::new(runner)
            .execute(
                node,
                &node.instances[0],
                &run_context(),
                &BTreeMap::new(),
                CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let graph = load(
            JobTemplate::new("build")
                .step(StepTemplate::new("make"))
                .step(StepTemplate::new("make test")),
        );
        let report = execute(&graph, Arc::new(ScriptedRunner::new())).await;

        assert_eq!(report.outcome, Outcome::Succeeded);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[1].output, "[dry-run] make test");
    }

    #[tokio::test]
    async fn test_failure_short_circuits_except_always_steps() {
        let graph = load(
            JobTemplate::new("build")
                .step(StepTemplate::new("compile"))
                .step(StepTemplate::new("test"))
                .step(StepTemplate::new("upload").always())
                .step(StepTemplate::new("notify").when("failure()"))
                .step(StepTemplate::new("publish").when("success()")),
        );
        let runner = Arc::new(ScriptedRunner::new().fail_step("build", 0));
        let report = execute(&graph, runner).await;

        let outcomes: Vec<_> = report.steps.iter().map(|s| s.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                Outcome::Failed,
                Outcome::Skipped,
                Outcome::Succeeded,
                Outcome::Succeeded,
                Outcome::Skipped
            ]
        );
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.failed_step().map(|s| s.index), Some(0));
    }

    #[tokio::test]
    async fn test_step_condition_sees_earlier_outcomes() {
        let graph = load(
            JobTemplate::new("build")
                .step(StepTemplate::new("check").id("check"))
                .step(StepTemplate::new("after").when("steps.check.outcome == 'success'"))
                .step(StepTemplate::new("never").when("steps.check.outcome == 'failure'")),
        );
        let report = execute(&graph, Arc::new(ScriptedRunner::new())).await;

        assert_eq!(report.steps[1].outcome, Outcome::Succeeded);
        assert_eq!(report.steps[2].outcome, Outcome::Skipped);
        assert_eq!(report.outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn test_commands_and_env_are_resolved() {
        let graph = load(
            JobTemplate::new("test")
                .matrix(MatrixSpec::new().axis("node-version", [18, 20]))
                .env("JOB", "1")
                .step(StepTemplate::new("use ${{ matrix.node-version }} on ${{ branch }}")),
        );
        let node = &graph.nodes()[0];
        let executor = RunExecutor::new(Arc::new(ScriptedRunner::new()));
        let env = executor.step_env(node, &node.instances[1], &run_context(), &BTreeMap::new());

        assert_eq!(env.get("MATRIX_NODE_VERSION").map(String::as_str), Some("20"));
        assert_eq!(env.get("GANTRY_REF").map(String::as_str), Some("refs/heads/main"));
        assert_eq!(env.get("GANTRY_JOB").map(String::as_str), Some("test[1]"));
        assert_eq!(env.get("JOB").map(String::as_str), Some("1"));

        let report = executor
            .execute(
                node,
                &node.instances[1],
                &run_context(),
                &BTreeMap::new(),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(report.steps[0].output, "[dry-run] use 20 on main");
    }

    #[tokio::test]
    async fn test_cancellation_reports_cancelled() {
        let graph = load(
            JobTemplate::new("deploy")
                .step(StepTemplate::new("rollout"))
                .step(StepTemplate::new("verify").always()),
        );
        let node = &graph.nodes()[0];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = RunExecutor::new(Arc::new(ScriptedRunner::new().hang_job("deploy")))
            .execute(node, &node.instances[0], &run_context(), &BTreeMap::new(), cancel)
            .await;

        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.steps[0].outcome, Outcome::Cancelled);
        assert_eq!(report.steps[1].outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn test_step_events_emitted() {
        let graph = load(JobTemplate::new("a").step(StepTemplate::new("echo hi").named("Say hi")));
        let node = &graph.nodes()[0];
        let (tx, mut rx) = progress_channel();

        RunExecutor::new(Arc::new(ScriptedRunner::new()))
            .with_progress(Some(tx))
            .execute(
                node,
                &node.instances[0],
                &run_context(),
                &BTreeMap::new(),
                CancellationToken::new(),
            )
            .await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                ExecutionEvent::StepStarted { step_name, .. } => format!("started {}", step_name),
                ExecutionEvent::StepOutput { .. } => "output".to_string(),
                ExecutionEvent::StepCompleted { status, .. } => format!("completed {}", status),
                other => format!("{:?}", other),
            });
        }
        assert_eq!(kinds, vec!["started Say hi", "output", "completed succeeded"]);
    }
}
