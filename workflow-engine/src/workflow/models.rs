use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// A gantry workflow document.
///
/// This is the top-level structure of a workflow YAML file. Jobs keep the
/// order in which they appear in the document.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDocument {
    /// The name of the workflow
    #[serde(default)]
    pub name: Option<String>,

    /// The trigger configuration; absent means every trigger starts the workflow
    #[serde(default, rename = "on")]
    pub on: Option<Trigger>,

    /// Workflow-level concurrency group
    #[serde(default)]
    pub concurrency: Option<Concurrency>,

    /// Workflow-level environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// The jobs that make up this workflow
    pub jobs: OrderedMap<Job>,
}

/// Map that keeps document order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V> IntoIterator for OrderedMap<V> {
    type Item = (String, V);
    type IntoIter = std::vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, V)> = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, V>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(de::Error::custom(format!("duplicate key '{}'", key)));
                    }
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

/// Trigger configuration for when the workflow should run.
///
/// Supports multiple trigger formats:
/// - Simple: `on: push`
/// - List: `on: [push, pull_request]`
/// - Detailed: `on: { push: { branches: [main] } }`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    /// Single event trigger: `on: push`
    Single(String),

    /// Multiple events: `on: [push, pull_request]`
    Multiple(Vec<String>),

    /// Detailed event configuration
    Detailed(OrderedMap<Option<EventConfig>>),
}

/// Filters for a specific trigger event.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct EventConfig {
    /// Branch filters for push/pull_request events
    #[serde(default)]
    pub branches: Vec<String>,

    /// Branch ignore patterns
    #[serde(default)]
    pub branches_ignore: Vec<String>,

    /// Tag filters for push events
    #[serde(default)]
    pub tags: Vec<String>,

    /// Tag ignore patterns
    #[serde(default)]
    pub tags_ignore: Vec<String>,
}

/// Concurrency settings to limit workflow runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Concurrency {
    /// Simple concurrency group name
    Simple(String),

    /// Detailed concurrency configuration
    Detailed {
        group: String,
        #[serde(default, rename = "cancel-in-progress")]
        cancel_in_progress: CancelInProgress,
    },
}

/// Cancel-in-progress setting - can be a boolean or an expression.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CancelInProgress {
    Bool(bool),
    Expression(String),
}

impl Default for CancelInProgress {
    fn default() -> Self {
        CancelInProgress::Bool(false)
    }
}

/// A job within a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    /// Display name for the job; may use `${{ matrix.<axis> }}`
    #[serde(default)]
    pub name: Option<String>,

    /// Jobs that must complete before this job runs
    #[serde(default)]
    pub needs: JobNeeds,

    /// Conditional expression for job execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Job-level environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Matrix strategy for running multiple job instances
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// Job-level concurrency group
    #[serde(default)]
    pub concurrency: Option<Concurrency>,

    /// Run even when any dependency failed or was skipped
    #[serde(default, rename = "continue-on-failure", alias = "continue-on-error")]
    pub continue_on_failure: bool,

    /// The steps that make up this job
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Job dependencies - a single job, or a list of jobs and detailed edges.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(untagged)]
pub enum JobNeeds {
    #[default]
    None,
    Single(String),
    Multiple(Vec<Need>),
}

/// One dependency edge
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Need {
    Job(String),
    Detailed {
        job: String,
        #[serde(default, rename = "continue-on-failure", alias = "continue-on-error")]
        continue_on_failure: bool,
    },
}

impl Need {
    pub fn job(&self) -> &str {
        match self {
            Need::Job(job) | Need::Detailed { job, .. } => job,
        }
    }

    pub fn continue_on_failure(&self) -> bool {
        matches!(
            self,
            Need::Detailed {
                continue_on_failure: true,
                ..
            }
        )
    }
}

impl JobNeeds {
    /// Convert to a list of edges.
    pub fn to_vec(&self) -> Vec<Need> {
        match self {
            JobNeeds::None => vec![],
            JobNeeds::Single(s) => vec![Need::Job(s.clone())],
            JobNeeds::Multiple(v) => v.clone(),
        }
    }

    /// Check if there are any dependencies.
    pub fn is_empty(&self) -> bool {
        match self {
            JobNeeds::None => true,
            JobNeeds::Single(_) => false,
            JobNeeds::Multiple(v) => v.is_empty(),
        }
    }
}

/// Strategy configuration for matrix builds.
#[derive(Debug, Clone, Deserialize)]
pub struct Strategy {
    /// Matrix configuration
    #[serde(default)]
    pub matrix: Option<Matrix>,

    /// Maximum number of instances of this job running at once
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<usize>,
}

/// Matrix configuration: axes in document order plus exclusions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matrix {
    /// Matrix dimensions
    pub axes: Vec<(String, Vec<Value>)>,

    /// Partial bindings to remove from the product
    pub exclude: Vec<BTreeMap<String, Value>>,
}

impl<'de> Deserialize<'de> for Matrix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = OrderedMap::<Value>::deserialize(deserializer)?;
        let mut matrix = Matrix::default();

        for (key, value) in entries {
            match (key.as_str(), value) {
                ("exclude", Value::Array(items)) => {
                    for item in items {
                        match item {
                            Value::Object(map) => matrix.exclude.push(map.into_iter().collect()),
                            other => {
                                return Err(de::Error::custom(format!(
                                    "matrix exclude entries must be mappings, found {}",
                                    other
                                )))
                            }
                        }
                    }
                }
                ("exclude", _) => return Err(de::Error::custom("matrix exclude must be a list")),
                ("include", _) => {
                    return Err(de::Error::custom("matrix include is not supported"))
                }
                (_, Value::Array(values)) => matrix.axes.push((key, values)),
                (_, other) => {
                    return Err(de::Error::custom(format!(
                        "matrix axis '{}' must be a list, found {}",
                        key, other
                    )))
                }
            }
        }

        Ok(matrix)
    }
}

/// A step within a job.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    /// Identifier referenced by later step conditions
    #[serde(default)]
    pub id: Option<String>,

    /// Display name for the step
    #[serde(default)]
    pub name: Option<String>,

    /// Conditional expression for step execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Command handed to the task runner
    pub run: String,

    /// Run even after an earlier step failed
    #[serde(default)]
    pub always: bool,

    /// Step-level environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_keep_document_order() {
        let yaml = r#"
jobs:
  zeta: { steps: [{ run: "z" }] }
  alpha: { steps: [{ run: "a" }] }
  mid: { steps: [{ run: "m" }] }
"#;
        let doc: WorkflowDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.jobs.keys().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
        assert!(doc.on.is_none());
    }

    #[test]
    fn test_needs_forms() {
        let yaml = r#"
jobs:
  a: { steps: [{ run: "a" }] }
  b: { needs: a, steps: [{ run: "b" }] }
  c:
    needs: [a, { job: b, continue-on-failure: true }]
    steps: [{ run: "c" }]
"#;
        let doc: WorkflowDocument = serde_yaml::from_str(yaml).unwrap();
        assert!(doc.jobs.get("a").unwrap().needs.is_empty());
        assert_eq!(doc.jobs.get("b").unwrap().needs.to_vec(), vec![Need::Job("a".into())]);

        let needs = doc.jobs.get("c").unwrap().needs.to_vec();
        assert_eq!(needs[0].job(), "a");
        assert!(!needs[0].continue_on_failure());
        assert_eq!(needs[1].job(), "b");
        assert!(needs[1].continue_on_failure());
    }

    #[test]
    fn test_matrix_axes_in_order_with_exclusions() {
        let yaml = r#"
matrix:
  version: [1, 2]
  os: [linux, macos]
  exclude:
    - { os: macos, version: 2 }
max-parallel: 2
"#;
        let strategy: Strategy = serde_yaml::from_str(yaml).unwrap();
        let matrix = strategy.matrix.unwrap();

        let names: Vec<&str> = matrix.axes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["version", "os"]);
        assert_eq!(matrix.axes[0].1, vec![Value::from(1), Value::from(2)]);
        assert_eq!(matrix.exclude.len(), 1);
        assert_eq!(matrix.exclude[0]["os"], Value::from("macos"));
        assert_eq!(strategy.max_parallel, Some(2));
    }

    #[test]
    fn test_matrix_rejects_scalar_axis() {
        let result: Result<Matrix, _> = serde_yaml::from_str("os: linux");
        assert!(result.unwrap_err().to_string().contains("must be a list"));
    }

    #[test]
    fn test_concurrency_forms() {
        let simple: Concurrency = serde_yaml::from_str(r#""ci-${{ ref }}""#).unwrap();
        assert!(matches!(simple, Concurrency::Simple(ref g) if g == "ci-${{ ref }}"));

        let detailed: Concurrency =
            serde_yaml::from_str("{ group: deploy, cancel-in-progress: true }").unwrap();
        assert!(matches!(
            detailed,
            Concurrency::Detailed {
                cancel_in_progress: CancelInProgress::Bool(true),
                ..
            }
        ));

        let expression: Concurrency = serde_yaml::from_str(
            r#"{ group: deploy, cancel-in-progress: "${{ branch != 'main' }}" }"#,
        )
        .unwrap();
        assert!(matches!(
            expression,
            Concurrency::Detailed {
                cancel_in_progress: CancelInProgress::Expression(_),
                ..
            }
        ));
    }

    #[test]
    fn test_trigger_forms() {
        let single: Trigger = serde_yaml::from_str("push").unwrap();
        assert!(matches!(single, Trigger::Single(ref s) if s == "push"));

        let list: Trigger = serde_yaml::from_str("[push, pull_request]").unwrap();
        assert!(matches!(list, Trigger::Multiple(ref v) if v.len() == 2));

        let detailed: Trigger =
            serde_yaml::from_str("{ push: { branches: [main], tags-ignore: ['*-rc'] }, manual: ~ }")
                .unwrap();
        let Trigger::Detailed(events) = detailed else {
            panic!("expected detailed trigger");
        };
        let push = events.get("push").unwrap().as_ref().unwrap();
        assert_eq!(push.branches, vec!["main"]);
        assert_eq!(push.tags_ignore, vec!["*-rc"]);
        assert!(events.get("manual").unwrap().is_none());
    }
}
