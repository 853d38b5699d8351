use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("Syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("Type error: {0}")]
    Type(String),

    #[error("{0} is not defined")]
    Undefined(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Invalid regex: {0}")]
    Regex(String),

    #[error("Division by zero")]
    DivisionByZero,

    /// Raised by a script's `throw` statement.
    #[error("{0}")]
    Thrown(String),

    #[error("Step budget exhausted ({0} steps)")]
    StepLimit(u64),

    #[error("Maximum nesting depth ({0}) exceeded")]
    TooDeep(usize),
}

impl ExprError {
    pub(crate) fn syntax(pos: usize, message: impl Into<String>) -> Self {
        ExprError::Syntax {
            pos,
            message: message.into(),
        }
    }

    /// Whether the error is a sandbox limit rather than a script fault.
    pub fn is_sandbox_violation(&self) -> bool {
        matches!(self, ExprError::StepLimit(_) | ExprError::TooDeep(_))
    }
}
