use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use workflow_engine::WorkflowParser;

/// Show the execution plan of a workflow without running it
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,
}

pub fn execute(args: PlanArgs) -> Result<u8> {
    let workflow_path = &args.workflow;

    if !workflow_path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", workflow_path.display());
    }

    let workflow = WorkflowParser::load(workflow_path)?;
    let graph = &workflow.graph;

    output::header(&format!("Plan for '{}'", workflow.name));
    if let Some(group) = &workflow.concurrency {
        output::info(&format!("Workflow concurrency group: {}", group.key_source()));
    }
    println!();

    for (index, layer) in graph.topological_layers().enumerate() {
        let nodes: Vec<_> = layer.iter().filter_map(|id| graph.node(id)).collect();
        let instances: usize = nodes.iter().map(|node| node.instances.len()).sum();
        output::layer_header(index + 1, instances);

        for node in nodes {
            let needs: Vec<&str> = graph.dependencies_of(node.id()).map(|dep| dep.id()).collect();
            let mut line = format!("    {}", node.id());
            if !needs.is_empty() {
                line.push_str(&format!(" (needs: {})", needs.join(", ")));
            }
            if let Some(limit) = node.template.max_parallel {
                line.push_str(&format!(" [max-parallel {}]", limit));
            }
            println!("{}", line);

            if let Some(setting) = &node.template.concurrency {
                output::dim(&format!("      concurrency group: {}", setting.group));
            }
            if let Some(condition) = &node.condition {
                output::dim(&format!("      if: {}", condition.source()));
            }
            if node.instances.len() > 1 {
                for instance in &node.instances {
                    output::dim(&format!("      - {}", instance.display_name));
                }
            }
        }
    }

    println!();
    output::info(&format!(
        "{} jobs, {} instances, at most {} running at once",
        graph.len(),
        graph.instance_count(),
        graph.max_parallelism()
    ));

    Ok(0)
}
