use std::fmt;

/// Raised by filter-column evaluation when a value cannot be interpreted
/// against the column's type.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError(pub String);

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter evaluation error: {}", self.0)
    }
}

impl std::error::Error for EvalError {}
