//! AST evaluation over `serde_json::Value`.

use std::borrow::Cow;

use regex::Regex;
use serde_json::{Map, Value};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::builtins;
use crate::error::ExprError;

static NULL: Value = Value::Null;

/// Default nesting limit for conditions.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Evaluates expression ASTs against a set of variable bindings.
#[derive(Debug, Clone)]
pub struct Evaluator {
    max_depth: usize,
    /// Unknown identifiers evaluate to `null` instead of failing.
    undefined_is_null: bool,
}

impl Evaluator {
    /// Evaluator for decision conditions: unknown names are `null`, and
    /// member access on `null` yields `null`.
    pub fn lenient() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            undefined_is_null: true,
        }
    }

    /// Evaluator for scripts: unknown names and member access on `null`
    /// are errors.
    pub fn strict(max_depth: usize) -> Self {
        Self {
            max_depth,
            undefined_is_null: false,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn eval(&self, expr: &Expr, vars: &Map<String, Value>) -> Result<Value, ExprError> {
        self.eval_ref(expr, vars).map(Cow::into_owned)
    }

    fn eval_ref<'a>(
        &self,
        expr: &'a Expr,
        vars: &'a Map<String, Value>,
    ) -> Result<Cow<'a, Value>, ExprError> {
        match expr {
            Expr::Literal(value) => Ok(Cow::Borrowed(value)),

            Expr::Ident(name) => match vars.get(name) {
                Some(value) => Ok(Cow::Borrowed(value)),
                None if self.undefined_is_null => Ok(Cow::Borrowed(&NULL)),
                None => Err(ExprError::Undefined(name.clone())),
            },

            Expr::Unary { op, expr } => {
                let value = self.eval_ref(expr, vars)?;
                match op {
                    UnaryOp::Not => Ok(Cow::Owned(Value::Bool(!is_truthy(&value)))),
                    UnaryOp::Negate => match as_number(&value) {
                        Some(n) => Ok(Cow::Owned(number_value(-n))),
                        None => Err(ExprError::Type(format!(
                            "cannot negate {}",
                            type_name(&value)
                        ))),
                    },
                }
            }

            Expr::Binary { left, op, right } => self.eval_binary(left, *op, right, vars),

            Expr::Member { object, property } => {
                let object = self.eval_ref(object, vars)?;
                self.check_readable(&object, property)?;
                if property == "length" {
                    if let Some(len) = length_of(&object) {
                        return Ok(Cow::Owned(Value::from(len)));
                    }
                }
                Ok(project(object, |v| v.get(property.as_str())))
            }

            Expr::Index { object, index } => {
                let object = self.eval_ref(object, vars)?;
                let index = self.eval_ref(index, vars)?;
                self.check_readable(&object, &builtins::display(&index))?;
                match index.as_ref() {
                    Value::Number(n) => {
                        let i = n.as_u64().map(|i| i as usize);
                        if let Value::String(s) = object.as_ref() {
                            let ch = i
                                .and_then(|i| s.chars().nth(i))
                                .map(|c| Value::String(c.to_string()))
                                .unwrap_or(Value::Null);
                            return Ok(Cow::Owned(ch));
                        }
                        Ok(project(object, |v| i.and_then(|i| v.get(i))))
                    }
                    Value::String(key) => Ok(project(object, |v| v.get(key.as_str()))),
                    other => Err(ExprError::Type(format!(
                        "cannot index with {}",
                        type_name(other)
                    ))),
                }
            }

            Expr::Call { name, args } => {
                if !builtins::is_builtin(name) {
                    return Err(ExprError::UnknownFunction(name.clone()));
                }
                let args = args
                    .iter()
                    .map(|a| self.eval(a, vars))
                    .collect::<Result<Vec<_>, _>>()?;
                builtins::call(name, &args).map(Cow::Owned)
            }

            Expr::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.eval(item, vars))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Cow::Owned(Value::Array(items)))
            }

            Expr::Object(fields) => {
                let mut obj = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    obj.insert(key.clone(), self.eval(value, vars)?);
                }
                Ok(Cow::Owned(Value::Object(obj)))
            }
        }
    }

    fn check_readable(&self, object: &Value, property: &str) -> Result<(), ExprError> {
        if object.is_null() && !self.undefined_is_null {
            return Err(ExprError::Type(format!(
                "cannot read property '{property}' of null"
            )));
        }
        Ok(())
    }

    fn eval_binary<'a>(
        &self,
        left: &'a Expr,
        op: BinaryOp,
        right: &'a Expr,
        vars: &'a Map<String, Value>,
    ) -> Result<Cow<'a, Value>, ExprError> {
        // Short-circuit: the deciding operand is returned as-is.
        match op {
            BinaryOp::And => {
                let l = self.eval_ref(left, vars)?;
                return if is_truthy(&l) {
                    self.eval_ref(right, vars)
                } else {
                    Ok(l)
                };
            }
            BinaryOp::Or => {
                let l = self.eval_ref(left, vars)?;
                return if is_truthy(&l) {
                    Ok(l)
                } else {
                    self.eval_ref(right, vars)
                };
            }
            _ => {}
        }

        let l = self.eval_ref(left, vars)?;
        let r = self.eval_ref(right, vars)?;
        let (l, r) = (l.as_ref(), r.as_ref());

        let value = match op {
            BinaryOp::Add => add(l, r)?,
            BinaryOp::Subtract => arithmetic(op, l, r, |a, b| Ok(a - b))?,
            BinaryOp::Multiply => arithmetic(op, l, r, |a, b| Ok(a * b))?,
            BinaryOp::Divide => arithmetic(op, l, r, |a, b| {
                if b == 0.0 {
                    Err(ExprError::DivisionByZero)
                } else {
                    Ok(a / b)
                }
            })?,
            BinaryOp::Modulo => arithmetic(op, l, r, |a, b| {
                if b == 0.0 {
                    Err(ExprError::DivisionByZero)
                } else {
                    Ok(a % b)
                }
            })?,
            BinaryOp::Equal => Value::Bool(loose_eq(l, r)),
            BinaryOp::NotEqual => Value::Bool(!loose_eq(l, r)),
            BinaryOp::LessThan => Value::Bool(compare(op, l, r)?.is_lt()),
            BinaryOp::LessEqual => Value::Bool(compare(op, l, r)?.is_le()),
            BinaryOp::GreaterThan => Value::Bool(compare(op, l, r)?.is_gt()),
            BinaryOp::GreaterEqual => Value::Bool(compare(op, l, r)?.is_ge()),
            BinaryOp::RegexMatch => Value::Bool(regex_match(l, r)?),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        Ok(Cow::Owned(value))
    }
}

/// Project into a child of a possibly-borrowed value without cloning the parent.
fn project<'a>(parent: Cow<'a, Value>, pick: impl Fn(&Value) -> Option<&Value>) -> Cow<'a, Value> {
    match parent {
        Cow::Borrowed(v) => Cow::Borrowed(pick(v).unwrap_or(&NULL)),
        Cow::Owned(v) => Cow::Owned(pick(&v).cloned().unwrap_or(Value::Null)),
    }
}

fn add(l: &Value, r: &Value) -> Result<Value, ExprError> {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => {
            arithmetic(BinaryOp::Add, l, r, |a, b| Ok(a + b))
        }
        (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
            "{}{}",
            builtins::display(l),
            builtins::display(r)
        ))),
        (Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => Err(ExprError::Type(format!(
            "cannot add {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn arithmetic(
    op: BinaryOp,
    l: &Value,
    r: &Value,
    f: impl Fn(f64, f64) -> Result<f64, ExprError>,
) -> Result<Value, ExprError> {
    match (as_number(l), as_number(r)) {
        (Some(a), Some(b)) => f(a, b).map(number_value),
        _ => Err(ExprError::Type(format!(
            "'{op}' needs numbers, got {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => {
            let (a, b) = (as_number(l).unwrap_or(0.0), as_number(r).unwrap_or(0.0));
            a.partial_cmp(&b)
                .ok_or_else(|| ExprError::Type("cannot compare NaN".into()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExprError::Type(format!(
            "cannot compare {} {op} {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

/// Equality with numbers compared by value (`1 == 1.0`), everything else
/// structurally.
pub fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => as_number(l) == as_number(r),
        _ => l == r,
    }
}

fn regex_match(l: &Value, r: &Value) -> Result<bool, ExprError> {
    let Value::String(pattern) = r else {
        return Err(ExprError::Type(format!(
            "regex pattern must be a string, got {}",
            type_name(r)
        )));
    };
    if l.is_null() {
        return Ok(false);
    }
    let re = Regex::new(pattern).map_err(|e| ExprError::Regex(e.to_string()))?;
    Ok(re.is_match(&builtins::display(l)))
}

/// JavaScript-style truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub(crate) fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Convert an `f64` to a JSON number, keeping integral values integral.
/// Non-finite values become `null`.
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

pub(crate) fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;
    use serde_json::json;

    fn eval_with(src: &str, vars: Value) -> Result<Value, ExprError> {
        let vars = vars.as_object().cloned().unwrap_or_default();
        let ast = parse_expression(src, 64)?;
        Evaluator::lenient().eval(&ast, &vars)
    }

    fn eval(src: &str) -> Value {
        eval_with(src, json!({})).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3"), json!(7));
        assert_eq!(eval("(1 + 2) * 3"), json!(9));
        assert_eq!(eval("7 / 2"), json!(3.5));
        assert_eq!(eval("7 % 4"), json!(3));
        assert_eq!(eval("-(2 - 5)"), json!(3));
        assert_eq!(
            eval_with("1 / 0", json!({})).unwrap_err(),
            ExprError::DivisionByZero
        );
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(eval("'count: ' + 3"), json!("count: 3"));
        assert_eq!(eval("[1] + [2, 3]"), json!([1, 2, 3]));
        assert!(matches!(
            eval_with("true + 1", json!({})).unwrap_err(),
            ExprError::Type(_)
        ));
    }

    #[test]
    fn test_equality_is_numeric_aware() {
        assert_eq!(eval("1 == 1.0"), json!(true));
        assert_eq!(eval("'1' == 1"), json!(false));
        assert_eq!(eval("[1, 2] === [1, 2]"), json!(true));
        assert_eq!(eval("null != false"), json!(true));
    }

    #[test]
    fn test_comparison_type_errors() {
        assert_eq!(eval("'abc' < 'abd'"), json!(true));
        assert!(matches!(
            eval_with("'1' < 2", json!({})).unwrap_err(),
            ExprError::Type(_)
        ));
    }

    #[test]
    fn test_short_circuit_returns_operand() {
        assert_eq!(eval("0 || 'fallback'"), json!("fallback"));
        assert_eq!(eval("'' && boom(1)"), json!(""));
        // The right side is never evaluated, so the unknown call is not an error.
        assert_eq!(eval("true || boom(1)"), json!(true));
    }

    #[test]
    fn test_member_and_index_access() {
        let vars = json!({
            "page": {"title": "Inbox", "rows": [{"id": 7}, {"id": 9}]},
        });
        assert_eq!(eval_with("page.rows[1].id", vars.clone()).unwrap(), json!(9));
        assert_eq!(eval_with("page['title']", vars.clone()).unwrap(), json!("Inbox"));
        assert_eq!(eval_with("page.rows.length", vars.clone()).unwrap(), json!(2));
        assert_eq!(eval_with("page.title[0]", vars.clone()).unwrap(), json!("I"));
        assert_eq!(eval_with("page.missing.deeper", vars).unwrap(), json!(null));
    }

    #[test]
    fn test_regex_match() {
        let vars = json!({"url": "https://example.com/orders/42"});
        assert_eq!(
            eval_with(r#"url =~ "/orders/\\d+$""#, vars.clone()).unwrap(),
            json!(true)
        );
        assert!(matches!(
            eval_with("url =~ '('", vars).unwrap_err(),
            ExprError::Regex(_)
        ));
    }

    #[test]
    fn test_strict_mode() {
        let ast = parse_expression("nope", 64).unwrap();
        assert_eq!(
            Evaluator::strict(64).eval(&ast, &Map::new()).unwrap_err(),
            ExprError::Undefined("nope".into())
        );

        let vars = json!({"a": null}).as_object().cloned().unwrap();
        let ast = parse_expression("a.b", 64).unwrap();
        assert!(matches!(
            Evaluator::strict(64).eval(&ast, &vars).unwrap_err(),
            ExprError::Type(_)
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }
}
