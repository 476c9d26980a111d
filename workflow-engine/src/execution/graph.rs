// Execution Graph (DAG) Builder
// Validates job templates and orders them for execution

use crate::error::GraphError;
use crate::execution::concurrency::GroupSpec;
use crate::execution::matrix::{InstanceId, JobInstance, MatrixExpander};
use crate::execution::template::{JobTemplate, StepTemplate};
use crate::expression::{Condition, ExprScope, Template};

use std::collections::{HashMap, HashSet};

/// A step with its condition and command compiled
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub index: usize,
    pub label: String,
    pub template: StepTemplate,
    pub condition: Option<Condition>,
    pub command: Template,
}

impl CompiledStep {
    /// Whether the step runs after an earlier step of the job failed
    pub fn runs_after_failure(&self) -> bool {
        self.template.always
            || self
                .condition
                .as_ref()
                .is_some_and(Condition::overrides_failure)
    }
}

/// A node representing a job template in the execution graph
#[derive(Debug, Clone)]
pub struct JobNode {
    pub template: JobTemplate,
    /// Expanded instances in ordinal order
    pub instances: Vec<JobInstance>,
    pub condition: Option<Condition>,
    pub concurrency: Option<GroupSpec>,
    pub steps: Vec<CompiledStep>,
    dependencies: Vec<usize>,
}

impl JobNode {
    pub fn id(&self) -> &str {
        &self.template.id
    }
}

/// Validated, acyclic job graph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<JobNode>,
    indices: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
}

impl Graph {
    /// Build the graph, rejecting duplicates, unknown dependencies, cycles and
    /// malformed conditions, matrices or concurrency groups
    pub fn load(templates: Vec<JobTemplate>) -> Result<Self, GraphError> {
        let mut indices = HashMap::with_capacity(templates.len());
        for (i, template) in templates.iter().enumerate() {
            if indices.insert(template.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTemplate {
                    id: template.id.clone(),
                });
            }
        }

        let mut dependencies = Vec::with_capacity(templates.len());
        for template in &templates {
            let mut deps: Vec<usize> = Vec::new();
            for dep in template.dependency_ids() {
                let idx = *indices
                    .get(dep)
                    .ok_or_else(|| GraphError::UnknownDependency {
                        template: template.id.clone(),
                        dependency: dep.to_string(),
                    })?;
                if !deps.contains(&idx) {
                    deps.push(idx);
                }
            }
            dependencies.push(deps);
        }

        if let Some(cycle) = Self::find_cycle(&templates, &dependencies) {
            return Err(GraphError::CycleDetected { cycle });
        }

        let mut dependents = vec![Vec::new(); templates.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(i);
            }
        }

        let nodes = templates
            .into_iter()
            .zip(dependencies)
            .map(|(template, deps)| Self::compile_node(template, deps))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            nodes,
            indices,
            dependents,
        })
    }

    fn compile_node(template: JobTemplate, dependencies: Vec<usize>) -> Result<JobNode, GraphError> {
        let instances = MatrixExpander::expand(&template)?;
        let axes = template.axis_names();
        let needs: Vec<String> = template.dependency_ids().map(String::from).collect();

        let invalid = |field: String| {
            let template = template.id.clone();
            move |source| GraphError::InvalidCondition {
                template,
                field,
                source,
            }
        };

        let condition = template
            .condition
            .as_deref()
            .map(|src| Condition::compile(src, &ExprScope::job(needs.clone(), axes.clone())))
            .transpose()
            .map_err(invalid("if".to_string()))?;

        let concurrency = template
            .concurrency
            .as_ref()
            .map(|setting| GroupSpec::compile_job(&template.id, setting, &axes))
            .transpose()?;

        let mut steps = Vec::with_capacity(template.steps.len());
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (index, step) in template.steps.iter().enumerate() {
            let label = step.label(index);
            let scope = ExprScope::step(axes.clone(), seen_ids.iter().map(|s| s.to_string()));

            let condition = step
                .condition
                .as_deref()
                .map(|src| Condition::compile(src, &scope))
                .transpose()
                .map_err(invalid(format!("steps[{}].if", index)))?;

            let command = Template::compile(&step.run, &scope.clone().without_status())
                .map_err(invalid(format!("steps[{}].run", index)))?;

            if let Some(id) = step.id.as_deref() {
                if !seen_ids.insert(id) {
                    return Err(GraphError::DuplicateStepId {
                        template: template.id.clone(),
                        step: id.to_string(),
                    });
                }
            }

            steps.push(CompiledStep {
                index,
                label,
                template: step.clone(),
                condition,
                command,
            });
        }

        Ok(JobNode {
            template,
            instances,
            condition,
            concurrency,
            steps,
            dependencies,
        })
    }

    /// DFS over templates in declared order; returns the cycle path closed on
    /// its first member. Iterative, so long dependency chains cannot exhaust
    /// the stack.
    fn find_cycle(templates: &[JobTemplate], dependencies: &[Vec<usize>]) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; templates.len()];
        for start in 0..templates.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }

            // (node, index of the next dependency edge to follow)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::InProgress;

            while let Some(frame) = stack.last_mut() {
                let (node, edge) = *frame;
                let Some(&dep) = dependencies[node].get(edge) else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                match marks[dep] {
                    Mark::InProgress => {
                        let from = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[from..]
                            .iter()
                            .map(|&(n, _)| templates[n].id.clone())
                            .collect();
                        cycle.push(templates[dep].id.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        marks[dep] = Mark::InProgress;
                        stack.push((dep, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declared order
    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&JobNode> {
        self.indices.get(id).map(|&idx| &self.nodes[idx])
    }

    /// Direct dependencies of a template
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &JobNode> {
        self.indices
            .get(id)
            .into_iter()
            .flat_map(move |&idx| self.nodes[idx].dependencies.iter())
            .map(move |&dep| &self.nodes[dep])
    }

    /// Layers of template ids: each layer depends only on earlier layers
    pub fn topological_layers(&self) -> TopologicalLayers<'_> {
        TopologicalLayers {
            graph: self,
            in_degree: self.nodes.iter().map(|n| n.dependencies.len()).collect(),
            emitted: vec![false; self.nodes.len()],
        }
    }

    /// Nodes in an order where every dependency precedes its dependents
    pub fn topological_order(&self) -> Vec<&JobNode> {
        self.topological_layers()
            .flatten()
            .filter_map(|id| self.node(id))
            .collect()
    }

    /// Total number of job instances across all templates
    pub fn instance_count(&self) -> usize {
        self.nodes.iter().map(|n| n.instances.len()).sum()
    }

    /// Every instance id, in declared template order
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.nodes
            .iter()
            .flat_map(|n| n.instances.iter().map(|i| i.id.clone()))
            .collect()
    }

    /// Widest layer, counted in instances
    pub fn max_parallelism(&self) -> usize {
        self.topological_layers()
            .map(|layer| {
                layer
                    .iter()
                    .filter_map(|id| self.node(id))
                    .map(|node| match node.template.max_parallel {
                        Some(limit) if limit > 0 => node.instances.len().min(limit),
                        _ => node.instances.len(),
                    })
                    .sum()
            })
            .max()
            .unwrap_or(0)
    }
}

/// Lazy layer iterator over a graph
pub struct TopologicalLayers<'a> {
    graph: &'a Graph,
    in_degree: Vec<usize>,
    emitted: Vec<bool>,
}

impl<'a> Iterator for TopologicalLayers<'a> {
    type Item = Vec<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        let layer: Vec<usize> = (0..self.graph.nodes.len())
            .filter(|&i| !self.emitted[i] && self.in_degree[i] == 0)
            .collect();

        if layer.is_empty() {
            return None;
        }

        for &i in &layer {
            self.emitted[i] = true;
            for &dependent in &self.graph.dependents[i] {
                self.in_degree[dependent] -= 1;
            }
        }

        Some(layer.into_iter().map(|i| self.graph.nodes[i].id()).collect())
    }
}
