// Expression Evaluator
// Compiles conditions against a static scope and evaluates them against run facts

use crate::execution::context::RunContext;
use crate::execution::matrix::Binding;
use crate::execution::state::Outcome;
use crate::expression::functions::BuiltinFunctions;
use crate::expression::lexer::{extract_expressions, strip_wrapper, Segment};
use crate::expression::parser::{BinaryOp, Expr, ExprParser, ParseExprError};

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Run-fact references available wherever run facts are in scope
const RUN_FACTS: &[&str] = &["trigger", "ref", "branch", "tag", "default_branch", "run_id"];

/// Compile-time error for an expression
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error(transparent)]
    Syntax(#[from] ParseExprError),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' expects {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("unknown reference '{0}'")]
    UnknownReference(String),

    #[error("'{0}' is not available here")]
    NotAvailable(String),
}

/// What an expression may reference at a given site.
///
/// Validation against the scope happens when the workflow is loaded, so that
/// evaluation itself can never fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExprScope {
    run_facts: bool,
    status_functions: bool,
    matrix_axes: Option<BTreeSet<String>>,
    needs: Option<BTreeSet<String>>,
    steps: Option<BTreeSet<String>>,
}

impl ExprScope {
    /// Workflow-level sites: only run facts
    pub fn workflow() -> Self {
        Self {
            run_facts: true,
            ..Self::default()
        }
    }

    /// Display names: only matrix values
    pub fn matrix_only(axes: impl IntoIterator<Item = String>) -> Self {
        Self {
            matrix_axes: Some(axes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Job conditions and job-level concurrency groups
    pub fn job(
        needs: impl IntoIterator<Item = String>,
        axes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            run_facts: true,
            status_functions: true,
            matrix_axes: Some(axes.into_iter().collect()),
            needs: Some(needs.into_iter().collect()),
            steps: None,
        }
    }

    /// Step conditions and commands: earlier step ids are visible
    pub fn step(
        axes: impl IntoIterator<Item = String>,
        prior_steps: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            run_facts: true,
            status_functions: true,
            matrix_axes: Some(axes.into_iter().collect()),
            needs: None,
            steps: Some(prior_steps.into_iter().collect()),
        }
    }

    /// Same scope without status functions (concurrency groups, commands)
    pub fn without_status(mut self) -> Self {
        self.status_functions = false;
        self
    }

    fn check(&self, expr: &Expr) -> Result<(), ExprError> {
        let mut result = Ok(());
        expr.walk(&mut |node| {
            if result.is_err() {
                return;
            }
            result = match node {
                Expr::Reference(path) => self.check_reference(path),
                Expr::FunctionCall { name, args } => self.check_call(name, args.len()),
                _ => Ok(()),
            };
        });
        result
    }

    fn check_reference(&self, path: &[String]) -> Result<(), ExprError> {
        let joined = path.join(".");
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();

        match segments.as_slice() {
            [fact] if RUN_FACTS.contains(fact) => self.require(self.run_facts, joined),
            ["inputs", _] => self.require(self.run_facts, joined),
            ["matrix", axis] => match &self.matrix_axes {
                Some(axes) if axes.contains(*axis) => Ok(()),
                Some(_) => Err(ExprError::UnknownReference(joined)),
                None => Err(ExprError::NotAvailable(joined)),
            },
            ["needs", job, "result"] => match &self.needs {
                Some(needs) if needs.contains(*job) => Ok(()),
                Some(_) => Err(ExprError::UnknownReference(joined)),
                None => Err(ExprError::NotAvailable(joined)),
            },
            ["steps", step, "outcome"] => match &self.steps {
                Some(steps) if steps.contains(*step) => Ok(()),
                Some(_) => Err(ExprError::UnknownReference(joined)),
                None => Err(ExprError::NotAvailable(joined)),
            },
            _ => Err(ExprError::UnknownReference(joined)),
        }
    }

    fn check_call(&self, name: &str, argc: usize) -> Result<(), ExprError> {
        let sig = BuiltinFunctions::signature(name)
            .ok_or_else(|| ExprError::UnknownFunction(name.to_string()))?;
        if sig.arity != argc {
            return Err(ExprError::Arity {
                name: name.to_string(),
                expected: sig.arity,
                found: argc,
            });
        }
        if sig.is_status && !self.status_functions {
            return Err(ExprError::NotAvailable(format!("{}()", name)));
        }
        Ok(())
    }

    fn require(&self, available: bool, joined: String) -> Result<(), ExprError> {
        if available {
            Ok(())
        } else {
            Err(ExprError::NotAvailable(joined))
        }
    }
}

/// Status inputs for `success()`, `failure()` and `cancelled()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusView {
    pub failed: bool,
    pub cancelled: bool,
}

/// Values an expression is evaluated against
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionContext<'a> {
    pub run: Option<&'a RunContext>,
    pub matrix: Option<&'a Binding>,
    pub needs: Option<&'a BTreeMap<String, Outcome>>,
    pub steps: Option<&'a BTreeMap<String, Outcome>>,
    pub status: StatusView,
}

impl<'a> ExpressionContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run(mut self, run: &'a RunContext) -> Self {
        self.run = Some(run);
        self
    }

    pub fn with_matrix(mut self, matrix: &'a Binding) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn with_needs(mut self, needs: &'a BTreeMap<String, Outcome>) -> Self {
        self.needs = Some(needs);
        self
    }

    pub fn with_steps(mut self, steps: &'a BTreeMap<String, Outcome>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_status(mut self, status: StatusView) -> Self {
        self.status = status;
        self
    }

    fn lookup(&self, path: &[String]) -> Value {
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        let run = self.run;

        match segments.as_slice() {
            ["trigger"] => run.map(|r| Value::from(r.trigger().as_str())),
            ["ref"] => run.map(|r| Value::from(r.git_ref())),
            ["branch"] => run.and_then(|r| r.branch()).map(Value::from),
            ["tag"] => run.and_then(|r| r.tag()).map(Value::from),
            ["default_branch"] => run.map(|r| Value::from(r.default_branch())),
            ["run_id"] => run.map(|r| Value::from(r.run_id().get())),
            ["inputs", name] => run.and_then(|r| r.input(name)).map(Value::from),
            ["matrix", axis] => self.matrix.and_then(|m| m.get(axis)).cloned(),
            ["needs", job, "result"] => self
                .needs
                .and_then(|n| n.get(*job))
                .map(|o| Value::from(o.as_str())),
            ["steps", step, "outcome"] => self
                .steps
                .and_then(|s| s.get(*step))
                .map(|o| Value::from(o.as_str())),
            _ => None,
        }
        .unwrap_or(Value::Null)
    }
}

/// Tree-walking evaluator
pub struct Evaluator<'a> {
    context: &'a ExpressionContext<'a>,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &'a ExpressionContext<'a>) -> Self {
        Self { context }
    }

    pub fn eval(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Literal(value) => value.clone(),
            Expr::Reference(path) => self.context.lookup(path),
            Expr::FunctionCall { name, args } => {
                let values: Vec<Value> = args.iter().map(|arg| self.eval(arg)).collect();
                BuiltinFunctions::call(name, &values, self.context)
            }
            Expr::Not(inner) => Value::Bool(!is_truthy(&self.eval(inner))),
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    Value::Bool(is_truthy(&self.eval(left)) && is_truthy(&self.eval(right)))
                }
                BinaryOp::Or => {
                    Value::Bool(is_truthy(&self.eval(left)) || is_truthy(&self.eval(right)))
                }
                BinaryOp::Eq => Value::Bool(values_equal(&self.eval(left), &self.eval(right))),
                BinaryOp::Ne => Value::Bool(!values_equal(&self.eval(left), &self.eval(right))),
            },
        }
    }
}

/// A validated boolean predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse and validate a condition. A single `${{ }}` wrapper is accepted.
    pub fn compile(source: &str, scope: &ExprScope) -> Result<Self, ExprError> {
        let expr = ExprParser::parse_str(strip_wrapper(source))?;
        scope.check(&expr)?;
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a boolean; total for compiled conditions
    pub fn evaluate(&self, context: &ExpressionContext<'_>) -> bool {
        is_truthy(&Evaluator::new(context).eval(&self.expr))
    }

    /// Whether the result depends on prior job or step outcomes
    pub fn references_outcomes(&self) -> bool {
        let mut found = false;
        self.expr.walk(&mut |node| match node {
            Expr::Reference(path) => {
                found |= matches!(path.first().map(String::as_str), Some("needs" | "steps"));
            }
            Expr::FunctionCall { name, .. } => {
                found |= BuiltinFunctions::signature(name).is_some_and(|sig| sig.is_status);
            }
            _ => {}
        });
        found
    }

    /// Whether the condition calls a status function. Such a condition
    /// replaces the implicit "all dependencies succeeded" gate.
    pub fn has_status_check(&self) -> bool {
        let mut found = false;
        self.expr.walk(&mut |node| {
            if let Expr::FunctionCall { name, .. } = node {
                found |= BuiltinFunctions::signature(name).is_some_and(|sig| sig.is_status);
            }
        });
        found
    }

    /// Whether the condition opts into running after a failure
    /// (`always()` or `failure()`)
    pub fn overrides_failure(&self) -> bool {
        let mut found = false;
        self.expr.walk(&mut |node| {
            if let Expr::FunctionCall { name, .. } = node {
                found |= matches!(name.to_lowercase().as_str(), "always" | "failure");
            }
        });
        found
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Expr(Expr),
}

/// A string with embedded `${{ expression }}` segments
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn compile(source: &str, scope: &ExprScope) -> Result<Self, ExprError> {
        let segments = extract_expressions(source).map_err(ParseExprError::from)?;
        let mut parts = Vec::with_capacity(segments.len());

        for segment in segments {
            match segment {
                Segment::Text(text) => parts.push(Part::Text(text)),
                Segment::Expression(body) => {
                    let expr = ExprParser::parse_str(&body)?;
                    scope.check(&expr)?;
                    parts.push(Part::Expr(expr));
                }
            }
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template contains no expressions
    pub fn is_static(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Text(_)))
    }

    pub fn render(&self, context: &ExpressionContext<'_>) -> String {
        let evaluator = Evaluator::new(context);
        self.parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => text.clone(),
                Part::Expr(expr) => value_to_string(&evaluator.eval(expr)),
            })
            .collect()
    }
}

/// Truthiness: null, false, 0 and '' are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value the way it appears in names and commands
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loose equality: strings compare case-insensitively, numbers and booleans
/// coerce from strings
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Number(a), Value::String(b)) | (Value::String(b), Value::Number(a)) => b
            .parse::<f64>()
            .ok()
            .zip(a.as_f64())
            .is_some_and(|(b, a)| (a - b).abs() < f64::EPSILON),
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            let b = b.to_lowercase();
            (*a && b == "true") || (!*a && b == "false")
        }
        (a, b) => a == b,
    }
}
