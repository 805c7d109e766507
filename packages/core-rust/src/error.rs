//! Error types raised while mapping ids, encoding filters and planning SQL.
//!
//! None of these are retried anywhere in the workspace; they propagate to the
//! immediate caller.

/// A durable identity was requested from a key strategy that cannot give one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{mapper} keys are not durable: {reason}")]
pub struct UnsupportedMapping {
    pub mapper: &'static str,
    pub reason: String,
}

/// Failure to convert between a feature id and primary-key values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("malformed feature id '{fid}': {reason}")]
    Malformed { fid: String, reason: String },
    #[error("expected {expected} key value(s), got {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("key value '{value}' cannot be encoded: {reason}")]
    Unencodable { value: String, reason: String },
    #[error(transparent)]
    Unsupported(#[from] UnsupportedMapping),
}

impl MappingError {
    pub(crate) fn malformed(fid: &str, reason: impl Into<String>) -> Self {
        MappingError::Malformed {
            fid: fid.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure to translate a filter into SQL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{operator} is not supported by the {dialect} dialect")]
    UnsupportedOperator {
        operator: String,
        dialect: &'static str,
    },
    #[error("function {name} has no SQL equivalent in the {dialect} dialect")]
    UnsupportedFunction { name: String, dialect: &'static str },
    #[error("literal cannot be encoded: {0}")]
    Literal(String),
    #[error("malformed filter: {0}")]
    Malformed(String),
}

/// Failure to plan a statement. Always raised before any SQL executes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("cannot sort {type_name} by unknown attribute '{attribute}'")]
    UnknownSortAttribute { type_name: String, attribute: String },
    #[error("{type_name} has no attribute '{attribute}'")]
    UnknownAttribute { type_name: String, attribute: String },
    #[error("{type_name} has no primary key, natural order is undefined")]
    NoPrimaryKey { type_name: String },
    #[error("{type_name} has no primary key, offset paging would be unstable")]
    UnstablePaging { type_name: String },
    #[error("the {dialect} dialect has no sequences (needed for '{sequence}')")]
    NoSequences {
        dialect: &'static str,
        sequence: String,
    },
    #[error("update of {type_name} sets no attributes")]
    EmptyUpdate { type_name: String },
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
