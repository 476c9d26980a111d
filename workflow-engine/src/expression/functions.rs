// Built-in Functions
// String predicates and status functions available to conditions

use crate::expression::evaluator::{value_to_string, ExpressionContext};

use serde_json::Value;

/// Static description of a built-in function, used for load-time validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionSignature {
    pub arity: usize,
    /// Status functions inspect prior outcomes and are only valid in job and
    /// step conditions
    pub is_status: bool,
}

/// Registry of built-in functions
pub struct BuiltinFunctions;

impl BuiltinFunctions {
    /// Look up a function by name (case-insensitive)
    pub fn signature(name: &str) -> Option<FunctionSignature> {
        let sig = |arity, is_status| Some(FunctionSignature { arity, is_status });
        match name.to_lowercase().as_str() {
            "startswith" | "endswith" | "contains" => sig(2, false),
            "success" | "failure" | "cancelled" | "canceled" | "always" => sig(0, true),
            _ => None,
        }
    }

    /// Call a built-in function. Names and arity are validated at compile time,
    /// so unknown names evaluate to null instead of failing.
    pub fn call(name: &str, args: &[Value], context: &ExpressionContext<'_>) -> Value {
        match name.to_lowercase().as_str() {
            "startswith" => Self::string_predicate(args, |a, b| a.starts_with(b)),
            "endswith" => Self::string_predicate(args, |a, b| a.ends_with(b)),
            "contains" => Self::fn_contains(args),

            "success" => Value::Bool(!context.status.failed && !context.status.cancelled),
            "failure" => Value::Bool(context.status.failed),
            "cancelled" | "canceled" => Value::Bool(context.status.cancelled),
            "always" => Value::Bool(true),

            _ => Value::Null,
        }
    }

    fn string_predicate(args: &[Value], op: impl Fn(&str, &str) -> bool) -> Value {
        let [haystack, needle] = args else {
            return Value::Bool(false);
        };
        let haystack = value_to_string(haystack).to_lowercase();
        let needle = value_to_string(needle).to_lowercase();
        Value::Bool(op(&haystack, &needle))
    }

    fn fn_contains(args: &[Value]) -> Value {
        match args {
            [Value::Array(items), needle] => Value::Bool(
                items
                    .iter()
                    .any(|item| crate::expression::evaluator::values_equal(item, needle)),
            ),
            _ => Self::string_predicate(args, |a, b| a.contains(b)),
        }
    }
}
