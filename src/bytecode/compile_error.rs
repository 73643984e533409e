use crate::lang::ast::Span;
use thiserror::Error;

/// Where a source error was found.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    pub function: String,
    pub line: u32,
    pub col: u32,
}

impl Location {
    pub fn new(function: impl Into<String>, span: Span) -> Self {
        Self {
            function: function.into(),
            line: span.line,
            col: span.col,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.function, self.line, self.col)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// A name that is not a variable, constant, asset or function.
    #[error("compile error: unresolved name '{name}' at {location}")]
    Unresolved { name: String, location: Location },

    #[error("compile error: '{name}' expects {expected} argument(s), got {got} at {location}")]
    ArityMismatch {
        name: String,
        expected: String,
        got: usize,
        location: Location,
    },

    /// A construct that is valid syntax but not valid where it appears.
    #[error("compile error: {message} at {location}")]
    Malformed { message: String, location: Location },

    #[error("compile error: function '{name}' is defined more than once at {location}")]
    DuplicateFunction { name: String, location: Location },

    #[error("compile error: {what} limit ({limit}) exceeded in '{function}'")]
    Capacity {
        function: String,
        what: &'static str,
        limit: usize,
    },

    /// Internal compiler error (shouldn't happen in normal use)
    #[error("compile error: internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn unresolved(name: &str, location: Location) -> Self {
        CompileError::Unresolved {
            name: name.to_string(),
            location,
        }
    }

    pub fn arity(name: &str, expected: impl Into<String>, got: usize, location: Location) -> Self {
        CompileError::ArityMismatch {
            name: name.to_string(),
            expected: expected.into(),
            got,
            location,
        }
    }

    pub fn malformed(message: impl Into<String>, location: Location) -> Self {
        CompileError::Malformed {
            message: message.into(),
            location,
        }
    }

    pub fn duplicate_function(name: &str, location: Location) -> Self {
        CompileError::DuplicateFunction {
            name: name.to_string(),
            location,
        }
    }

    pub fn capacity(function: &str, what: &'static str, limit: usize) -> Self {
        CompileError::Capacity {
            function: function.to_string(),
            what,
            limit,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }

    /// Internal errors abort a project compilation; everything else is
    /// batched.
    pub fn is_internal(&self) -> bool {
        matches!(self, CompileError::Internal(_))
    }
}

/// Every error a project compilation produced, in declaration order.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", render(.0))]
pub struct CompileErrors(pub Vec<CompileError>);

fn render(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl CompileErrors {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CompileError> {
        self.0.iter()
    }
}

impl From<CompileError> for CompileErrors {
    fn from(e: CompileError) -> Self {
        CompileErrors(vec![e])
    }
}
