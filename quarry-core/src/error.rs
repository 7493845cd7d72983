//! Error types for Quarry

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The closed set of outcomes callers branch on.
///
/// Compare kinds with `==` (or [`Error::is`]); never match on message text.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The query ran, but no row matched where at least one was expected
    #[error("record not found")]
    NotFound,

    /// The resource addressed by its primary identity does not exist
    #[error("record does not exist")]
    NotExist,

    /// Argument or data shape mismatch, malformed SQL, illegal argument counts
    #[error("not valid")]
    NotValid,

    /// Unique constraint violation
    #[error("record already exists")]
    Exists,

    /// Required structural information is absent
    #[error("missing data")]
    MissingData,

    /// A destination that must be addressable was not
    #[error("unaddressable destination")]
    Unaddressable,

    /// Anything not otherwise classified
    #[error("unexpected error")]
    Unexpected,
}

/// The main error type for Quarry operations
///
/// Carries the [`ErrorKind`], the table the failing operation targeted (when known),
/// a message for logs, and the underlying driver error. Cloning is cheap so a
/// sticky error can travel inside a cloned query.
#[derive(Error, Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    target: Option<String>,
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

/// Convenience Result type for Quarry operations
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(target) = &self.target {
            write!(f, " (table {target})")?;
        }
        Ok(())
    }
}

impl Error {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            target: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn not_exist(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotExist, message)
    }

    pub fn not_valid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotValid, message)
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exists, message)
    }

    pub fn missing_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingData, message)
    }

    pub fn unaddressable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unaddressable, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    /// Attach the underlying error
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Attach the table name, keeping one that is already set
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        if self.target.is_none() {
            self.target = Some(target.into());
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Check the error kind
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// The table the failing operation targeted, if known
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, kind.to_string())
    }
}
