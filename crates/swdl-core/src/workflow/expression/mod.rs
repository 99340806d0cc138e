//! The `${{ expr }}` expression language.
//!
//! - `lexer` -- single-pass tokenizer with source positions
//! - `parser` -- recursive-descent parser producing an `Expr` tree
//! - `eval` -- evaluator over the six-namespace `ExpressionContext`
//! - `template` -- placeholder discovery and string/value resolution
//!
//! The grammar is deliberately small: literals, dotted property access,
//! comparison and logical operators, a ternary, and four built-in functions
//! (`length`, `contains`, `toJSON`, `fromJSON`).

pub mod eval;
pub mod lexer;
pub mod parser;
pub mod template;

pub use eval::{ExpressionContext, Namespace, evaluate, is_truthy};
pub use parser::{Expr, parse};
pub use template::{
    evaluate_condition, extract_expressions, has_placeholder, resolve_string, resolve_value,
};

/// Errors raised while tokenizing, parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown namespace '{0}' (expected one of parameters, stages, context, env, run, workflow)")]
    UnknownNamespace(String),

    #[error("unknown function '{name}' at position {position}")]
    UnknownFunction { name: String, position: usize },

    #[error("cannot compare {left} {op} {right}")]
    IncomparableTypes {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("bad arguments to {function}(): {message}")]
    BadArguments { function: String, message: String },

    #[error("JSON error: {0}")]
    Json(String),

    #[error("template error: {0}")]
    Template(String),
}

/// Parse and evaluate a bare expression body in one call.
pub fn evaluate_str(
    source: &str,
    ctx: &ExpressionContext,
) -> Result<serde_json::Value, ExpressionError> {
    evaluate(&parse(source)?, ctx)
}
