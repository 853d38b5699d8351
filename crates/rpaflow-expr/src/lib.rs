//! Restricted expression language and script sandbox.
//!
//! Decision-edge conditions and SCRIPT node bodies are parsed into an AST and
//! interpreted over `serde_json::Value`s. There is no host `eval`: scripts can
//! only read and write their own bindings and call the allow-listed builtins
//! in [`builtins`]. Script execution is bounded by a step budget and a nesting
//! depth limit.
//!
//! Expression syntax:
//! - literals: `42`, `1.5`, `"text"`, `'text'`, `true`, `false`, `null`, `[1, 2]`, `{a: 1}`
//! - operators: `||`, `&&`, `==`/`===`, `!=`/`!==`, `<`, `<=`, `>`, `>=`, `=~`,
//!   `+`, `-`, `*`, `/`, `%`, unary `!` and `-`
//! - access: `a.b`, `a["b"]`, `items[0]`, `name.length`
//! - calls: `len(x)`, or method style `x.contains("y")`

pub mod ast;
pub mod builtins;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod script;

pub use error::ExprError;
pub use eval::{is_truthy, Evaluator};
pub use script::{ScriptEngine, ScriptLimits};

use serde_json::{Map, Value};

/// Name under which the whole context is bound, for keys that are not
/// valid identifiers (e.g. `ctx["7f0c-node"]`).
pub const CONTEXT_BINDING: &str = "ctx";

/// Build the variable bindings for a context: every key becomes a variable,
/// and the whole map is additionally bound as [`CONTEXT_BINDING`].
pub fn bindings_from_context(context: &Map<String, Value>) -> Map<String, Value> {
    let mut vars = context.clone();
    vars.insert(CONTEXT_BINDING.into(), Value::Object(context.clone()));
    vars
}

/// Parse and evaluate a boolean condition against a context.
///
/// Unknown identifiers evaluate to `null`. The result is converted with
/// JavaScript-like truthiness.
pub fn evaluate_condition(expr: &str, context: &Map<String, Value>) -> Result<bool, ExprError> {
    let evaluator = Evaluator::lenient();
    let ast = parser::parse_expression(expr, evaluator.max_depth())?;
    let vars = bindings_from_context(context);
    let value = evaluator.eval(&ast, &vars)?;
    Ok(is_truthy(&value))
}
