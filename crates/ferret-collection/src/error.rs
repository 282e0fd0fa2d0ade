use std::fmt;

use ferret_index::EvalError;
use ferret_query::ParseError;
use ferret_store::StoreError;

/// Closed error set for the collection core. `http_code` maps kinds to
/// status codes at the boundary; messages are user-visible.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Timeout(String),
    Internal(String),
}

impl Error {
    pub fn http_code(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Unprocessable(_) => 422,
            Error::Timeout(_) => 408,
            Error::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::BadRequest(msg)
            | Error::NotFound(msg)
            | Error::Conflict(msg)
            | Error::Unprocessable(msg)
            | Error::Timeout(msg)
            | Error::Internal(msg) => msg,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for Error {}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::BadRequest(e.to_string())
    }
}

impl From<EvalError> for Error {
    fn from(e: EvalError) -> Self {
        Error::BadRequest(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(format!("malformed JSON: {e}"))
    }
}
