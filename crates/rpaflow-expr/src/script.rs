//! Statement interpreter for SCRIPT node bodies.

use serde_json::{Map, Value};
use tracing::trace;

use crate::ast::{AssignTarget, PathSegment, Stmt};
use crate::builtins::display;
use crate::error::ExprError;
use crate::eval::{is_truthy, type_name, Evaluator};
use crate::parser::parse_program;

/// Resource limits for one script run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLimits {
    /// Statements plus loop iterations.
    pub max_steps: u64,
    /// Block and expression nesting.
    pub max_depth: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            max_depth: 64,
        }
    }
}

/// Runs scripts against a copy of their bindings.
///
/// The script sees its bindings as variables and can only mutate its own
/// copy. The value of the first executed `return` is the result; a script
/// that falls off the end returns `null`.
#[derive(Debug, Clone)]
pub struct ScriptEngine {
    limits: ScriptLimits,
    evaluator: Evaluator,
}

enum Flow {
    Normal,
    Return(Value),
}

struct Frame {
    vars: Map<String, Value>,
    steps: u64,
}

impl ScriptEngine {
    pub fn new(limits: ScriptLimits) -> Self {
        Self {
            limits,
            evaluator: Evaluator::strict(limits.max_depth),
        }
    }

    pub fn limits(&self) -> ScriptLimits {
        self.limits
    }

    pub fn run(&self, code: &str, bindings: Map<String, Value>) -> Result<Value, ExprError> {
        let program = parse_program(code, self.limits.max_depth)?;
        let mut frame = Frame {
            vars: bindings,
            steps: 0,
        };
        let result = match self.exec_block(&program, &mut frame)? {
            Flow::Return(value) => value,
            Flow::Normal => Value::Null,
        };
        trace!(steps = frame.steps, "script finished");
        Ok(result)
    }

    fn tick(&self, frame: &mut Frame) -> Result<(), ExprError> {
        frame.steps += 1;
        if frame.steps > self.limits.max_steps {
            return Err(ExprError::StepLimit(self.limits.max_steps));
        }
        Ok(())
    }

    fn exec_block(&self, stmts: &[Stmt], frame: &mut Frame) -> Result<Flow, ExprError> {
        for stmt in stmts {
            if let Flow::Return(value) = self.exec(stmt, frame)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&self, stmt: &Stmt, frame: &mut Frame) -> Result<Flow, ExprError> {
        self.tick(frame)?;
        match stmt {
            Stmt::Let { name, value } => {
                let value = self.evaluator.eval(value, &frame.vars)?;
                frame.vars.insert(name.clone(), value);
            }
            Stmt::Assign { target, value } => {
                let value = self.evaluator.eval(value, &frame.vars)?;
                self.assign(target, value, frame)?;
            }
            Stmt::If {
                branches,
                otherwise,
            } => {
                for (cond, body) in branches {
                    if is_truthy(&self.evaluator.eval(cond, &frame.vars)?) {
                        return self.exec_block(body, frame);
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec_block(body, frame);
                }
            }
            Stmt::For {
                var,
                iterable,
                body,
            } => {
                let items = match self.evaluator.eval(iterable, &frame.vars)? {
                    Value::Array(items) => items,
                    Value::Object(map) => map.into_iter().map(|(k, _)| Value::String(k)).collect(),
                    Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                    other => {
                        return Err(ExprError::Type(format!(
                            "cannot iterate over {}",
                            type_name(&other)
                        )))
                    }
                };
                for item in items {
                    self.tick(frame)?;
                    frame.vars.insert(var.clone(), item);
                    if let Flow::Return(value) = self.exec_block(body, frame)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.evaluator.eval(expr, &frame.vars)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Throw(expr) => {
                let value = self.evaluator.eval(expr, &frame.vars)?;
                let message = match &value {
                    Value::Object(obj) => obj
                        .get("message")
                        .map(display)
                        .unwrap_or_else(|| display(&value)),
                    other => display(other),
                };
                return Err(ExprError::Thrown(message));
            }
            Stmt::Expr(expr) => {
                self.evaluator.eval(expr, &frame.vars)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn assign(&self, target: &AssignTarget, value: Value, frame: &mut Frame) -> Result<(), ExprError> {
        // Resolve index expressions before borrowing the target mutably.
        let mut keys = Vec::with_capacity(target.path.len());
        for segment in &target.path {
            keys.push(match segment {
                PathSegment::Field(name) => Value::String(name.clone()),
                PathSegment::Index(expr) => self.evaluator.eval(expr, &frame.vars)?,
            });
        }

        let Some(mut slot) = frame.vars.get_mut(&target.name) else {
            return Err(ExprError::Undefined(target.name.clone()));
        };

        for key in &keys {
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            slot = match (slot, key) {
                (Value::Object(map), key) => map.entry(display(key)).or_insert(Value::Null),
                (Value::Array(items), Value::Number(n)) => {
                    let i = n
                        .as_u64()
                        .map(|i| i as usize)
                        .filter(|i| *i <= items.len())
                        .ok_or_else(|| ExprError::Type(format!("array index {n} out of bounds")))?;
                    if i == items.len() {
                        items.push(Value::Null);
                    }
                    &mut items[i]
                }
                (other, key) => {
                    return Err(ExprError::Type(format!(
                        "cannot set property '{}' on {}",
                        display(key),
                        type_name(other)
                    )))
                }
            };
        }
        *slot = value;
        Ok(())
    }
}
