//! The allow-listed functions callable from conditions and scripts.
//!
//! Each builtin is reachable under a snake_case name and, where one exists,
//! the equivalent JavaScript method name (`x.startsWith("a")`).

use regex::Regex;
use serde_json::Value;

use crate::error::ExprError;
use crate::eval::{as_number, is_truthy, length_of, loose_eq, number_value, type_name};

const BUILTINS: &[&str] = &[
    "len",
    "length",
    "contains",
    "includes",
    "starts_with",
    "startsWith",
    "ends_with",
    "endsWith",
    "lower",
    "toLowerCase",
    "upper",
    "toUpperCase",
    "trim",
    "number",
    "string",
    "toString",
    "bool",
    "is_null",
    "keys",
    "values",
    "matches",
    "abs",
    "min",
    "max",
    "round",
    "floor",
    "ceil",
    "join",
    "split",
    "push",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Invoke a builtin with already-evaluated arguments.
pub fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        "len" | "length" => {
            let v = arg(name, args, 0)?;
            length_of(v)
                .map(Value::from)
                .ok_or_else(|| type_err(name, "string, array or object", v))
        }
        "contains" | "includes" => {
            let (haystack, needle) = (arg(name, args, 0)?, arg(name, args, 1)?);
            let found = match haystack {
                Value::String(s) => s.contains(display(needle).as_str()),
                Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
                Value::Object(map) => map.contains_key(display(needle).as_str()),
                Value::Null => false,
                other => return Err(type_err(name, "string, array or object", other)),
            };
            Ok(Value::Bool(found))
        }
        "starts_with" | "startsWith" => {
            let s = str_arg(name, args, 0)?;
            Ok(Value::Bool(s.starts_with(str_arg(name, args, 1)?)))
        }
        "ends_with" | "endsWith" => {
            let s = str_arg(name, args, 0)?;
            Ok(Value::Bool(s.ends_with(str_arg(name, args, 1)?)))
        }
        "lower" | "toLowerCase" => Ok(Value::String(str_arg(name, args, 0)?.to_lowercase())),
        "upper" | "toUpperCase" => Ok(Value::String(str_arg(name, args, 0)?.to_uppercase())),
        "trim" => Ok(Value::String(str_arg(name, args, 0)?.trim().to_string())),
        "number" => {
            let v = arg(name, args, 0)?;
            let n = match v {
                Value::Number(_) => as_number(v),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                Value::Null => Some(0.0),
                _ => None,
            };
            Ok(n.map(number_value).unwrap_or(Value::Null))
        }
        "string" | "toString" => Ok(Value::String(display(arg(name, args, 0)?))),
        "bool" => Ok(Value::Bool(is_truthy(arg(name, args, 0)?))),
        "is_null" => Ok(Value::Bool(arg(name, args, 0)?.is_null())),
        "keys" => match arg(name, args, 0)? {
            Value::Object(map) => Ok(Value::Array(
                map.keys().cloned().map(Value::String).collect(),
            )),
            other => Err(type_err(name, "object", other)),
        },
        "values" => match arg(name, args, 0)? {
            Value::Object(map) => Ok(Value::Array(map.values().cloned().collect())),
            other => Err(type_err(name, "object", other)),
        },
        "matches" => {
            let s = display(arg(name, args, 0)?);
            let re = Regex::new(str_arg(name, args, 1)?)
                .map_err(|e| ExprError::Regex(e.to_string()))?;
            Ok(Value::Bool(re.is_match(&s)))
        }
        "abs" => num_fn(name, args, f64::abs),
        "round" => num_fn(name, args, f64::round),
        "floor" => num_fn(name, args, f64::floor),
        "ceil" => num_fn(name, args, f64::ceil),
        "min" | "max" => {
            let nums = numbers(name, args)?;
            let picked = if name == "min" {
                nums.into_iter().reduce(f64::min)
            } else {
                nums.into_iter().reduce(f64::max)
            };
            Ok(picked.map(number_value).unwrap_or(Value::Null))
        }
        "join" => {
            let Value::Array(items) = arg(name, args, 0)? else {
                return Err(type_err(name, "array", &args[0]));
            };
            let sep = match args.get(1) {
                Some(Value::String(s)) => s.as_str(),
                Some(other) => return Err(type_err(name, "string separator", other)),
                None => ",",
            };
            Ok(Value::String(
                items.iter().map(display).collect::<Vec<_>>().join(sep),
            ))
        }
        "split" => {
            let s = str_arg(name, args, 0)?;
            let sep = str_arg(name, args, 1)?;
            Ok(Value::Array(
                s.split(sep).map(|part| Value::String(part.to_string())).collect(),
            ))
        }
        "push" => {
            // Values are immutable; push returns the extended array.
            let Value::Array(items) = arg(name, args, 0)? else {
                return Err(type_err(name, "array", &args[0]));
            };
            let mut items = items.clone();
            items.extend(args[1..].iter().cloned());
            Ok(Value::Array(items))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// Render a value the way string concatenation sees it: strings bare,
/// everything else as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn arg<'a>(name: &str, args: &'a [Value], i: usize) -> Result<&'a Value, ExprError> {
    args.get(i).ok_or_else(|| {
        ExprError::Type(format!("{name}() expects at least {} argument(s)", i + 1))
    })
}

fn str_arg<'a>(name: &str, args: &'a [Value], i: usize) -> Result<&'a str, ExprError> {
    match arg(name, args, i)? {
        Value::String(s) => Ok(s),
        other => Err(type_err(name, "string", other)),
    }
}

fn numbers(name: &str, args: &[Value]) -> Result<Vec<f64>, ExprError> {
    // min([1, 2]) and min(1, 2) are both accepted
    let items = match args {
        [Value::Array(items)] => items.as_slice(),
        _ => args,
    };
    items
        .iter()
        .map(|v| as_number(v).ok_or_else(|| type_err(name, "number", v)))
        .collect()
}

fn num_fn(name: &str, args: &[Value], f: fn(f64) -> f64) -> Result<Value, ExprError> {
    let v = arg(name, args, 0)?;
    let n = as_number(v).ok_or_else(|| type_err(name, "number", v))?;
    Ok(number_value(f(n)))
}

fn type_err(name: &str, expected: &str, got: &Value) -> ExprError {
    ExprError::Type(format!(
        "{name}() expects {expected}, got {}",
        type_name(got)
    ))
}
