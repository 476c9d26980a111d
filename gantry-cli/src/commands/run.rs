use crate::output;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::Result;

use workflow_engine::execution::RunReport;
use workflow_engine::{
    progress_channel, DependencyMode, Engine, EngineConfig, EngineError, ExecutionEvent,
    ExecutionState, InstanceId, RunContext, RunId, ScriptedRunner, ShellRunner, StepStatus, TaskRunner,
    TriggerKind, WorkflowParser,
};

/// Run a workflow locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Event that triggered the run (push, pull_request, manual, tag)
    #[arg(long, env = "GANTRY_TRIGGER", default_value = "push")]
    pub trigger: TriggerKind,

    /// Git ref of the run; short names are qualified by trigger
    #[arg(long = "ref", env = "GANTRY_REF", default_value = "main", value_name = "REF")]
    pub git_ref: String,

    /// Run id from the event source (default: next id of this process)
    #[arg(long, env = "GANTRY_RUN_ID", value_name = "ID")]
    pub run_id: Option<u64>,

    /// Default branch of the repository
    #[arg(long, env = "GANTRY_DEFAULT_BRANCH", default_value = "main")]
    pub default_branch: String,

    /// Set a manual input (can be repeated, format: name=value)
    #[arg(long = "input", short = 'i', value_name = "NAME=VALUE")]
    pub inputs: Vec<String>,

    /// Maximum simultaneously running job instances (0 = unlimited)
    #[arg(long, env = "GANTRY_MAX_PARALLEL", default_value_t = 0)]
    pub max_parallel: usize,

    /// How matrix instances pair with matrix dependencies (fan-in, fan-out)
    #[arg(long, env = "GANTRY_DEPENDENCY_MODE", default_value = "fan-in")]
    pub dependency_mode: DependencyMode,

    /// Working directory for step commands
    #[arg(long, short = 'w', env = "GANTRY_WORKING_DIR", value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Kill steps that run longer than this many seconds
    #[arg(long, env = "GANTRY_STEP_TIMEOUT", value_name = "SECS")]
    pub step_timeout: Option<u64>,

    /// Print events as JSON lines on stdout
    #[arg(long)]
    pub json: bool,

    /// Schedule everything but do not execute step commands
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(args: RunArgs) -> Result<u8> {
    let workflow_path = &args.workflow;

    if !workflow_path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", workflow_path.display());
    }

    let context_inputs = parse_inputs(&args.inputs)?;

    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    output::status("Loading", &format!("{}", workflow_path.display()));
    let workflow = Arc::new(WorkflowParser::load(workflow_path)?);

    let names: HashMap<InstanceId, String> = workflow
        .graph
        .nodes()
        .iter()
        .flat_map(|node| &node.instances)
        .map(|instance| (instance.id.clone(), instance.display_name.clone()))
        .collect();

    if !args.json {
        output::info(&format!(
            "Workflow '{}': {} jobs, {} instances",
            workflow.name,
            workflow.graph.len(),
            workflow.graph.instance_count()
        ));
    }

    let runner: Arc<dyn TaskRunner> = if args.dry_run {
        Arc::new(ScriptedRunner::new())
    } else {
        let runner = ShellRunner::new();
        match args.step_timeout {
            Some(secs) => Arc::new(runner.with_timeout(Duration::from_secs(secs))),
            None => Arc::new(runner),
        }
    };

    let config = EngineConfig::default()
        .with_max_parallel(args.max_parallel)
        .with_dependency_mode(args.dependency_mode);
    let engine = Engine::new(runner)
        .with_config(config)
        .with_working_dir(working_dir);

    let run_id = args
        .run_id
        .map(RunId::new)
        .unwrap_or_else(|| engine.next_run_id());
    let context = context_inputs.into_iter().fold(
        RunContext::new(run_id, args.trigger, &args.git_ref)
            .with_default_branch(&args.default_branch),
        |context, (name, value)| context.with_input(name, value),
    );

    let (tx, mut rx) = progress_channel();

    let prepared = match engine.prepare(workflow, context, Some(tx)) {
        Ok(prepared) => prepared,
        Err(EngineError::NotTriggered { trigger, git_ref }) => {
            output::warning(&format!(
                "Workflow is not triggered by '{}' on '{}', nothing to run",
                trigger, git_ref
            ));
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    // Ctrl-C cancels the run; running steps are killed
    let token = prepared.handle().token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let mut exec = tokio::spawn(async move { engine.execute(prepared).await });

    let report = loop {
        tokio::select! {
            biased;
            Some(event) = rx.recv() => print_event(&event, &names, args.json)?,
            result = &mut exec => break result??,
        }
    };
    while let Ok(event) = rx.try_recv() {
        print_event(&event, &names, args.json)?;
    }
    interrupt.abort();

    if !args.json {
        print_summary(&report);
    }

    Ok(report.exit_code() as u8)
}

fn parse_inputs(inputs: &[String]) -> Result<Vec<(String, String)>> {
    inputs
        .iter()
        .map(|input| match input.split_once('=') {
            Some((name, value)) => Ok((name.to_string(), value.to_string())),
            None => color_eyre::eyre::bail!(
                "Invalid input format '{}'. Expected name=value",
                input
            ),
        })
        .collect()
}

fn print_event(
    event: &ExecutionEvent,
    names: &HashMap<InstanceId, String>,
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let name_of = |id: &InstanceId| names.get(id).cloned().unwrap_or_else(|| id.to_string());

    match event {
        ExecutionEvent::RunStarted {
            run_id,
            workflow,
            instances,
        } => {
            println!();
            output::header(&format!(
                "Run {} of '{}' ({} instances)",
                run_id, workflow, instances
            ));
        }

        ExecutionEvent::RunSuperseded {
            run_id,
            by,
            cancelled,
        } => {
            output::warning(&format!(
                "Run {} superseded by run {} ({} instances cancelled)",
                run_id,
                by,
                cancelled.len()
            ));
        }

        ExecutionEvent::StateChanged(status) => {
            let name = name_of(&status.instance_id);
            let label = match status.state {
                ExecutionState::Running => "started",
                ExecutionState::Succeeded => "OK",
                ExecutionState::Failed => "FAIL",
                ExecutionState::Skipped => "skipped",
                ExecutionState::Cancelled => "cancelled",
                ExecutionState::Pending | ExecutionState::Blocked | ExecutionState::Ready => {
                    return Ok(())
                }
            };
            output::instance_line(status.state, &format!("    Job '{}' {}", name, label));
        }

        ExecutionEvent::StepStarted {
            instance_id,
            step_index,
            step_name,
            ..
        } => {
            println!(
                "      [{}] [Step {}] {}",
                name_of(instance_id),
                step_index + 1,
                step_name
            );
        }

        ExecutionEvent::StepOutput { line, is_error, .. } => {
            if *is_error {
                output::step_error(line);
            } else {
                output::step_output(line);
            }
        }

        ExecutionEvent::StepCompleted {
            status,
            exit_code,
            duration_ms,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "        {} ({:.2}s){}",
                match status {
                    StepStatus::Succeeded => "OK",
                    StepStatus::Failed => "FAIL",
                    StepStatus::Cancelled => "CANCELLED",
                },
                *duration_ms as f64 / 1000.0,
                exit_info
            );
            output::step_line(*status, &line);
        }

        ExecutionEvent::StepSkipped {
            step_name, reason, ..
        } => {
            output::warning(&format!("        {} skipped: {}", step_name, reason));
        }

        ExecutionEvent::RunCompleted { .. } => {}
    }

    Ok(())
}

fn print_summary(report: &RunReport) {
    println!();
    for instance in &report.instances {
        let line = format!("  {:<10} {}", instance.state, instance.display_name);
        output::instance_line(instance.state, &line);
        if let Some(step) = instance.report.as_ref().and_then(|r| r.failed_step()) {
            if let Some(error) = &step.error {
                output::instance_line(
                    ExecutionState::Failed,
                    &format!("             step '{}': {}", step.name, error),
                );
            }
        }
    }
    println!();

    let seconds = report.duration.as_secs_f64();
    if report.succeeded() {
        output::success(&format!("Run {} succeeded in {:.2}s", report.run_id, seconds));
    } else {
        output::failure(&format!(
            "Run {} {} after {:.2}s",
            report.run_id, report.outcome, seconds
        ));
        if let Some(by) = report.superseded_by {
            output::info(&format!("Superseded by run {}", by));
        }
    }
}
