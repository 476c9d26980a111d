// Matrix Strategy Expansion
// Expands job templates into concrete job instances

use crate::error::GraphError;
use crate::execution::template::JobTemplate;
use crate::expression::{value_to_string, ExprScope, ExpressionContext, Template};

use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Most combinations a single matrix may declare, counted before exclusions
pub const MAX_MATRIX_COMBINATIONS: usize = 256;

/// One named matrix axis with its ordered values
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<Value>,
}

/// Matrix declared on a job template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixSpec {
    /// Axes in declared order; the first axis varies slowest
    pub axes: Vec<MatrixAxis>,
    /// Partial bindings to skip
    pub exclude: Vec<Binding>,
}

impl MatrixSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis<V: Into<Value>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.axes.push(MatrixAxis {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn exclude(mut self, partial: Binding) -> Self {
        self.exclude.push(partial);
        self
    }

    pub fn axis_names(&self) -> impl Iterator<Item = &str> {
        self.axes.iter().map(|axis| axis.name.as_str())
    }

    /// Size of the full Cartesian product, before exclusions. `None` on overflow.
    pub fn product_size(&self) -> Option<usize> {
        self.axes
            .iter()
            .try_fold(1usize, |size, axis| size.checked_mul(axis.values.len()))
    }
}

/// Ordered axis-value assignment of one instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Binding(Vec<(String, Value)>);

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, axis: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every entry of `partial` is present with an equal value
    pub fn matches(&self, partial: &Binding) -> bool {
        partial
            .iter()
            .all(|(axis, value)| self.get(axis) == Some(value))
    }

    /// True when both bindings agree on every axis they share
    pub fn compatible_with(&self, other: &Binding) -> bool {
        self.iter()
            .all(|(axis, value)| other.get(axis).map_or(true, |v| v == value))
    }

    /// Comma-separated values, as used in default display names
    pub fn label(&self) -> String {
        self.0
            .iter()
            .map(|(_, value)| value_to_string(value))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Serialize for Binding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

/// Identifier of a job instance within a run: `lint` or `test[2]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    template: String,
    ordinal: Option<usize>,
}

impl InstanceId {
    pub fn singleton(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ordinal: None,
        }
    }

    pub fn matrix(template: impl Into<String>, ordinal: usize) -> Self {
        Self {
            template: template.into(),
            ordinal: Some(ordinal),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn ordinal(&self) -> Option<usize> {
        self.ordinal
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ordinal {
            Some(ordinal) => write!(f, "{}[{}]", self.template, ordinal),
            None => write!(f, "{}", self.template),
        }
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One schedulable expansion of a job template
#[derive(Debug, Clone, PartialEq)]
pub struct JobInstance {
    pub id: InstanceId,
    pub display_name: String,
    pub binding: Binding,
}

impl JobInstance {
    pub fn template(&self) -> &str {
        self.id.template()
    }
}

/// Matrix expander for job templates
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a template into its instances, in odometer order over the
    /// declared axes
    pub fn expand(template: &JobTemplate) -> Result<Vec<JobInstance>, GraphError> {
        let base_name = template.name.as_deref().unwrap_or(&template.id);

        let Some(matrix) = &template.matrix else {
            return Ok(vec![JobInstance {
                id: InstanceId::singleton(&template.id),
                display_name: base_name.to_string(),
                binding: Binding::new(),
            }]);
        };

        Self::validate(template, matrix)?;

        let name_template = Self::name_template(template, matrix)?;
        let mut instances = Vec::new();

        for binding in Self::combinations(matrix) {
            if matrix.exclude.iter().any(|partial| binding.matches(partial)) {
                continue;
            }

            let display_name = match &name_template {
                Some(name) => name.render(&ExpressionContext::new().with_matrix(&binding)),
                None => format!("{} ({})", base_name, binding.label()),
            };

            instances.push(JobInstance {
                id: InstanceId::matrix(&template.id, instances.len()),
                display_name,
                binding,
            });
        }

        Ok(instances)
    }

    fn validate(template: &JobTemplate, matrix: &MatrixSpec) -> Result<(), GraphError> {
        if let Some(axis) = matrix.axes.iter().find(|axis| axis.values.is_empty()) {
            return Err(GraphError::EmptyAxis {
                template: template.id.clone(),
                axis: axis.name.clone(),
            });
        }

        match matrix.product_size() {
            Some(size) if size <= MAX_MATRIX_COMBINATIONS => {}
            size => {
                return Err(GraphError::MatrixTooLarge {
                    template: template.id.clone(),
                    size,
                    limit: MAX_MATRIX_COMBINATIONS,
                })
            }
        }

        for partial in &matrix.exclude {
            if let Some(axis) = partial
                .names()
                .find(|name| !matrix.axis_names().any(|declared| declared == *name))
            {
                return Err(GraphError::InvalidExclusion {
                    template: template.id.clone(),
                    axis: axis.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Compiled display-name template when the name embeds expressions
    fn name_template(
        template: &JobTemplate,
        matrix: &MatrixSpec,
    ) -> Result<Option<Template>, GraphError> {
        let Some(name) = template.name.as_deref().filter(|name| name.contains("${{")) else {
            return Ok(None);
        };

        let scope = ExprScope::matrix_only(matrix.axis_names().map(String::from));
        Template::compile(name, &scope)
            .map(Some)
            .map_err(|source| GraphError::InvalidCondition {
                template: template.id.clone(),
                field: "name".to_string(),
                source,
            })
    }

    /// All combinations, first axis varying slowest
    fn combinations(matrix: &MatrixSpec) -> Vec<Binding> {
        if matrix.axes.is_empty() {
            return vec![Binding::new()];
        }

        let mut indices = vec![0usize; matrix.axes.len()];
        let mut bindings = Vec::with_capacity(matrix.product_size().unwrap_or(0));

        loop {
            bindings.push(Binding(
                matrix
                    .axes
                    .iter()
                    .zip(&indices)
                    .map(|(axis, &i)| (axis.name.clone(), axis.values[i].clone()))
                    .collect(),
            ));

            // Advance the odometer from the last axis
            let mut position = matrix.axes.len();
            loop {
                if position == 0 {
                    return bindings;
                }
                position -= 1;
                indices[position] += 1;
                if indices[position] < matrix.axes[position].values.len() {
                    break;
                }
                indices[position] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_version() -> MatrixSpec {
        MatrixSpec::new()
            .axis("os", ["a", "b"])
            .axis("version", [1, 2])
    }

    #[test]
    fn test_no_matrix_yields_singleton() {
        let template = JobTemplate::new("lint");
        let instances = MatrixExpander::expand(&template).unwrap();

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id.to_string(), "lint");
        assert!(instances[0].binding.is_empty());
        assert_eq!(instances[0].display_name, "lint");
    }

    #[test]
    fn test_full_product_in_odometer_order() {
        let template = JobTemplate::new("matrix-job").matrix(os_version());
        let instances = MatrixExpander::expand(&template).unwrap();

        assert_eq!(instances.len(), 4);
        let labels: Vec<_> = instances.iter().map(|i| i.binding.label()).collect();
        assert_eq!(labels, vec!["a, 1", "a, 2", "b, 1", "b, 2"]);
        assert_eq!(instances[3].id.to_string(), "matrix-job[3]");
    }

    #[test]
    fn test_exclusion_removes_matching_combination() {
        let matrix = os_version().exclude(Binding::from_pairs([
            ("os", Value::from("a")),
            ("version", Value::from(2)),
        ]));
        let template = JobTemplate::new("matrix-job").matrix(matrix);
        let instances = MatrixExpander::expand(&template).unwrap();

        assert_eq!(instances.len(), 3);
        assert!(instances.iter().all(|i| !(i.binding.get("os") == Some(&Value::from("a"))
            && i.binding.get("version") == Some(&Value::from(2)))));
        // Ordinals stay dense after exclusions
        assert_eq!(instances[2].id, InstanceId::matrix("matrix-job", 2));
    }

    #[test]
    fn test_partial_exclusion_is_superset_match() {
        let matrix = os_version().exclude(Binding::from_pairs([("os", "b")]));
        let template = JobTemplate::new("t").matrix(matrix);
        let instances = MatrixExpander::expand(&template).unwrap();

        assert_eq!(instances.len(), 2);
        assert!(instances
            .iter()
            .all(|i| i.binding.get("os") == Some(&Value::from("a"))));
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let template = JobTemplate::new("t").matrix(os_version());
        let first = MatrixExpander::expand(&template).unwrap();
        let second = MatrixExpander::expand(&template).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_axis_rejected() {
        let matrix = MatrixSpec::new().axis("os", Vec::<Value>::new());
        let template = JobTemplate::new("t").matrix(matrix);
        assert_eq!(
            MatrixExpander::expand(&template),
            Err(GraphError::EmptyAxis {
                template: "t".into(),
                axis: "os".into()
            })
        );
    }

    #[test]
    fn test_exclusion_with_unknown_axis_rejected() {
        let matrix = os_version().exclude(Binding::from_pairs([("arch", "x64")]));
        let template = JobTemplate::new("t").matrix(matrix);
        assert_eq!(
            MatrixExpander::expand(&template),
            Err(GraphError::InvalidExclusion {
                template: "t".into(),
                axis: "arch".into()
            })
        );
    }

    #[test]
    fn test_oversized_matrix_rejected() {
        // 2^64 combinations overflow usize
        let matrix = (0..64).fold(MatrixSpec::new(), |m, i| m.axis(format!("a{}", i), [0, 1]));
        let template = JobTemplate::new("huge").matrix(matrix);
        assert_eq!(
            MatrixExpander::expand(&template),
            Err(GraphError::MatrixTooLarge {
                template: "huge".into(),
                size: None,
                limit: MAX_MATRIX_COMBINATIONS,
            })
        );

        let matrix = MatrixSpec::new()
            .axis("x", (0..16).collect::<Vec<_>>())
            .axis("y", (0..17).collect::<Vec<_>>());
        let template = JobTemplate::new("wide").matrix(matrix);
        let err = MatrixExpander::expand(&template).unwrap_err();
        assert_eq!(
            err.to_string(),
            "matrix of job 'wide' has 272 combinations, the limit is 256"
        );

        let matrix = MatrixSpec::new()
            .axis("x", (0..16).collect::<Vec<_>>())
            .axis("y", (0..16).collect::<Vec<_>>());
        let template = JobTemplate::new("full").matrix(matrix);
        assert_eq!(MatrixExpander::expand(&template).unwrap().len(), 256);
    }

    #[test]
    fn test_default_display_name() {
        let template = JobTemplate::new("test").named("Test").matrix(os_version());
        let instances = MatrixExpander::expand(&template).unwrap();
        assert_eq!(instances[1].display_name, "Test (a, 2)");
    }

    #[test]
    fn test_templated_display_name() {
        let template = JobTemplate::new("test")
            .named("Test on ${{ matrix.os }} v${{ matrix.version }}")
            .matrix(os_version());
        let instances = MatrixExpander::expand(&template).unwrap();
        assert_eq!(instances[2].display_name, "Test on b v1");
    }

    #[test]
    fn test_display_name_with_unknown_axis_rejected() {
        let template = JobTemplate::new("test")
            .named("Test ${{ matrix.arch }}")
            .matrix(os_version());
        assert!(matches!(
            MatrixExpander::expand(&template),
            Err(GraphError::InvalidCondition { field, .. }) if field == "name"
        ));
    }

    #[test]
    fn test_binding_compatibility() {
        let left = Binding::from_pairs([("os", "a"), ("arch", "x64")]);
        let right = Binding::from_pairs([("os", "a")]);
        let other = Binding::from_pairs([("os", "b")]);
        assert!(left.compatible_with(&right));
        assert!(!left.compatible_with(&other));
        assert!(left.compatible_with(&Binding::new()));
    }
}
