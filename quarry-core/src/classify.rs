//! Translation of driver errors into [`ErrorKind`]
//!
//! Classification prefers structured information: the Postgres SQLSTATE code,
//! then the driver's own constraint kind. Message matching is a best-effort
//! fallback, confined to [`classify_message`], because message text changes
//! between server versions and locales.

use crate::error::{Error, ErrorKind};
use sqlx::error::{DatabaseError, ErrorKind as DriverKind};

/// Classify a Postgres SQLSTATE code
///
/// Returns `None` for codes with no specific meaning here, so callers can fall back
/// to other information before settling on [`ErrorKind::Unexpected`].
pub fn classify_sqlstate(code: &str) -> Option<ErrorKind> {
    match code {
        // unique_violation, exclusion_violation
        "23505" | "23P01" => Some(ErrorKind::Exists),
        // foreign_key_violation, not_null_violation, check_violation
        "23503" | "23502" | "23514" => Some(ErrorKind::NotValid),
        // no_data, plpgsql no_data_found
        "02000" | "P0002" => Some(ErrorKind::NotFound),
        // data_exception (22xxx), syntax_error_or_access_rule_violation (42xxx)
        _ if code.starts_with("22") || code.starts_with("42") => Some(ErrorKind::NotValid),
        _ => None,
    }
}

/// Best-effort classification from message text, used only when no code is available
pub fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_lowercase();
    if message.contains("record not found") || message.contains("no rows") {
        ErrorKind::NotFound
    } else if message.contains("duplicate key") || message.contains("unique constraint") {
        ErrorKind::Exists
    } else if message.contains("foreign key") || message.contains("syntax error") {
        ErrorKind::NotValid
    } else {
        ErrorKind::Unexpected
    }
}

/// Classify a backend-reported database error
pub fn classify_database(err: &dyn DatabaseError) -> ErrorKind {
    if let Some(kind) = err.code().as_deref().and_then(classify_sqlstate) {
        return kind;
    }
    match err.kind() {
        DriverKind::UniqueViolation => ErrorKind::Exists,
        DriverKind::ForeignKeyViolation
        | DriverKind::NotNullViolation
        | DriverKind::CheckViolation => ErrorKind::NotValid,
        _ if err.code().is_some() => ErrorKind::Unexpected,
        _ => classify_message(err.message()),
    }
}

/// Classify any sqlx error
pub fn classify(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Database(db) => classify_database(db.as_ref()),
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => ErrorKind::NotValid,
        _ => ErrorKind::Unexpected,
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let kind = classify(&err);
        let mut error = Error::new(kind, err.to_string());
        if let sqlx::Error::Database(db) = &err {
            if let Some(table) = db.table() {
                error = error.with_target(table);
            }
        }
        error.with_source(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::not_valid(format!("cannot decode row: {err}")).with_source(err)
    }
}
