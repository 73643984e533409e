use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: f64, len: usize },

    #[error("stack underflow")]
    StackUnderflow,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("no instance {0}")]
    NoInstance(f64),

    #[error("call depth limit exceeded ({0}) - possible infinite recursion")]
    CallDepth(usize),

    #[error("execution step limit exceeded ({0})")]
    StepLimit(usize),

    #[error("{0}")]
    Other(String),
}

/// An executor failure and the functions active when it happened, outermost
/// first.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub call_stack: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {}", self.kind)?;

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl From<ErrorKind> for RuntimeError {
    fn from(kind: ErrorKind) -> Self {
        RuntimeError {
            kind,
            call_stack: Vec::new(),
        }
    }
}

impl RuntimeError {
    pub fn new(msg: &str) -> Self {
        ErrorKind::Other(msg.to_string()).into()
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }
}

pub fn type_error(message: impl Into<String>) -> RuntimeError {
    ErrorKind::Type(message.into()).into()
}

pub fn division_by_zero() -> RuntimeError {
    ErrorKind::DivisionByZero.into()
}

pub fn index_out_of_bounds(index: f64, len: usize) -> RuntimeError {
    ErrorKind::IndexOutOfBounds { index, len }.into()
}

pub fn stack_underflow() -> RuntimeError {
    ErrorKind::StackUnderflow.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_stack() {
        assert_eq!(division_by_zero().to_string(), "runtime error: division by zero");
    }

    #[test]
    fn test_display_innermost_first() {
        let err = type_error("cannot add string and real")
            .with_context("main")
            .with_context("helper (line 3)");
        assert_eq!(
            err.to_string(),
            "runtime error: type error: cannot add string and real\n  call stack:\n    0: helper (line 3)\n    1: main"
        );
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            index_out_of_bounds(4.0, 2).kind.to_string(),
            "index 4 out of bounds (length 2)"
        );
        assert_eq!(stack_underflow().kind, ErrorKind::StackUnderflow);
    }
}
