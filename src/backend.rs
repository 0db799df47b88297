//! Seam to the execution engine that actually answers queries.
//!
//! The front-end does not plan or execute anything itself: a decoded query
//! string goes in, a tagged outcome comes back. Recoverable failures keep the
//! session alive (the client gets an ErrorResponse and a new ReadyForQuery),
//! fatal ones terminate it.

use crate::pg::protocol::{ColumnType, ERRCODE_INTERNAL_ERROR};
use thiserror::Error;

/// One column of a result set, as described to the client in RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDescription {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self { name: name.into(), ty }
    }
}

/// Result of a successfully executed query.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// Row-returning statement: RowDescription + DataRows are sent.
    Rows {
        columns: Vec<ColumnDescription>,
        /// Text-format cell values; `None` encodes SQL NULL.
        rows: Vec<Vec<Option<String>>>,
    },
    /// Statement that only reports how many rows it touched.
    RowCount(u64),
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub sqlstate: String,
    /// Fatal errors terminate the session; recoverable ones do not.
    pub fatal: bool,
}

impl BackendError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: ERRCODE_INTERNAL_ERROR.to_string(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: ERRCODE_INTERNAL_ERROR.to_string(),
            fatal: true,
        }
    }
}

/// The execution collaborator. Dispatch is a plain call on the session's
/// task; a session never suspends in the middle of a query.
pub trait Backend: Send + Sync + 'static {
    fn dispatch(&self, query: &str) -> Result<QueryOutcome, BackendError>;
}

/// Minimal backend used by the binary and the tests. Answers a couple of
/// fixed queries and rejects everything else as recoverable.
pub struct StaticBackend;

impl Backend for StaticBackend {
    fn dispatch(&self, query: &str) -> Result<QueryOutcome, BackendError> {
        let trimmed = query.trim().trim_end_matches(';').trim();

        if trimmed.eq_ignore_ascii_case("select 1") {
            return Ok(QueryOutcome::Rows {
                columns: vec![ColumnDescription::new("?column?", ColumnType::Int8)],
                rows: vec![vec![Some("1".to_string())]],
            });
        }

        if trimmed.eq_ignore_ascii_case("select version()") {
            return Ok(QueryOutcome::Rows {
                columns: vec![ColumnDescription::new("version", ColumnType::Text)],
                rows: vec![vec![Some("pgfe 0.1.0".to_string())]],
            });
        }

        if trimmed.to_ascii_lowercase().starts_with("set ") {
            return Ok(QueryOutcome::RowCount(0));
        }

        Err(BackendError::recoverable(format!(
            "failed to execute query '{}'",
            trimmed
        )))
    }
}
