use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use workflow_engine::WorkflowParser;

/// Validate a workflow YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<u8> {
    let workflow_path = &args.workflow;

    if !workflow_path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", workflow_path.display());
    }

    // Step 1: Parse YAML syntax
    output::status("Validating", &format!("{}", workflow_path.display()));

    let document = match WorkflowParser::from_file(workflow_path) {
        Ok(document) => document,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            return Ok(1);
        }
    };

    output::check("YAML syntax valid");

    let steps_count: usize = document.jobs.iter().map(|(_, job)| job.steps.len()).sum();
    output::check(&format!(
        "Structure: {} jobs, {} steps",
        document.jobs.len(),
        steps_count
    ));

    // Step 2: Convert and compile the job graph
    let fallback = workflow_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("workflow");
    let workflow = match WorkflowParser::into_definition(document, fallback)
        .and_then(|definition| Ok(definition.compile()?))
    {
        Ok(workflow) => workflow,
        Err(e) => {
            output::error(&format!("Validation error: {}", e));
            return Ok(1);
        }
    };

    output::check(&format!(
        "Job graph valid: {} instances after matrix expansion",
        workflow.graph.instance_count()
    ));

    println!();
    output::success(&format!("Workflow '{}' is valid", workflow.name));

    Ok(0)
}
