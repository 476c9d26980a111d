// Expression Engine Module
// Conditions and ${{ }} templates over run facts, matrix values and prior outcomes

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{
    is_truthy, value_to_string, values_equal, Condition, Evaluator, ExprError, ExprScope,
    ExpressionContext, StatusView, Template,
};
pub use functions::{BuiltinFunctions, FunctionSignature};
pub use lexer::{extract_expressions, strip_wrapper, LexError, Lexer, Segment, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError};
