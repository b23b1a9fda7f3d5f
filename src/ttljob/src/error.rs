use std::fmt;

use thiserror::Error;

use crate::keys::KeyDecodeError;
use crate::store::StoreError;

/// Errors surfaced by a TTL job run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TtlJobError {
    #[error("table {table} has had a schema change since the job has started at {changed_at}, aborting")]
    SchemaChanged { table: String, changed_at: String },

    #[error("found a recent schema change on the table at {changed_at}, aborting")]
    RecentSchemaChange { changed_at: String },

    #[error("unable to find TTL on table {table}")]
    MissingTtl { table: String },

    #[error("error discovering ranges: {0}")]
    Discovery(Box<TtlJobError>),

    #[error("error selecting rows to delete: {0}")]
    Select(Box<TtlJobError>),

    #[error("error during row deletion: {0}")]
    Delete(Box<TtlJobError>),

    #[error("job cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("key decode error: {0}")]
    KeyDecode(#[from] KeyDecodeError),

    #[error("invalid TTL settings: {0}")]
    InvalidSettings(String),

    #[error("range worker failed: {0}")]
    Worker(String),

    #[error("{}", MultipleErrors(.0))]
    Multiple(Vec<TtlJobError>),
}

impl TtlJobError {
    pub fn discovery(err: impl Into<TtlJobError>) -> Self {
        TtlJobError::Discovery(Box::new(err.into()))
    }

    pub fn select(err: impl Into<TtlJobError>) -> Self {
        TtlJobError::Select(Box::new(err.into()))
    }

    pub fn delete(err: impl Into<TtlJobError>) -> Self {
        TtlJobError::Delete(Box::new(err.into()))
    }

    /// True if this error, or any error it wraps, reports schema drift.
    pub fn is_schema_change(&self) -> bool {
        match self {
            TtlJobError::SchemaChanged { .. } | TtlJobError::RecentSchemaChange { .. } => true,
            TtlJobError::Discovery(inner)
            | TtlJobError::Select(inner)
            | TtlJobError::Delete(inner) => inner.is_schema_change(),
            TtlJobError::Multiple(errors) => errors.iter().any(TtlJobError::is_schema_change),
            _ => false,
        }
    }

    /// True if the error stems from cancellation only.
    pub fn is_cancelled(&self) -> bool {
        match self {
            TtlJobError::Cancelled | TtlJobError::Store(StoreError::Cancelled) => true,
            TtlJobError::Discovery(inner)
            | TtlJobError::Select(inner)
            | TtlJobError::Delete(inner) => inner.is_cancelled(),
            TtlJobError::Multiple(errors) => errors.iter().all(TtlJobError::is_cancelled),
            _ => false,
        }
    }

    /// Combines errors in the order given. A single error is returned as is.
    pub fn combine(mut errors: Vec<TtlJobError>) -> Option<TtlJobError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(TtlJobError::Multiple(errors)),
        }
    }
}

struct MultipleErrors<'a>(&'a [TtlJobError]);

impl fmt::Display for MultipleErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            [] => write!(f, "no errors"),
            [first] => write!(f, "{first}"),
            [first, rest @ ..] => write!(f, "{first} (and {} more errors)", rest.len()),
        }
    }
}
