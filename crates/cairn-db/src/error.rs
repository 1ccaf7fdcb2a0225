//! Error taxonomy for database operations.
//!
//! Every failure surfaced by this crate is a [`DbError`]. Each error names
//! the operation that failed (`"Commit"`, `"Migrate.Apply"`, ...) and can be
//! reduced to an [`ErrorKind`], which is what callers should branch on.
//! Raw SQLite failures are mapped onto the taxonomy by [`classify`], which
//! also extracts the table, column, or constraint implicated when SQLite
//! reports one.

use std::fmt;

use rusqlite::ffi;
use thiserror::Error;

use crate::tx::ScopeState;

/// Boxed error used to carry a caller's original error inside a composite.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Maximum number of SQL characters attached to an error.
pub const ERROR_QUERY_MAX_LEN: usize = 200;

/// Classification of a database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A query expected a row and found none.
    NotFound,
    /// A unique or primary-key constraint was violated.
    Duplicate,
    /// A foreign-key constraint was violated.
    ForeignKeyViolation,
    /// A `NOT NULL` constraint was violated.
    NotNullViolation,
    /// A `CHECK` constraint was violated.
    CheckViolation,
    /// The transaction's snapshot could not be upgraded; retry it.
    SerializationFailure,
    /// A lock conflict that cannot resolve itself; retry it.
    Deadlock,
    /// The operation timed out or was cancelled.
    Timeout,
    /// No usable connection could be obtained, or it broke mid-operation.
    ConnectionFailed,
    /// An applied migration's SQL no longer matches its recorded checksum.
    ChecksumDrift,
    /// A transaction was used after it had already finished.
    InvalidState,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Returns the stable string code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Duplicate => "DUPLICATE",
            Self::ForeignKeyViolation => "FOREIGN_KEY",
            Self::NotNullViolation => "NOT_NULL",
            Self::CheckViolation => "CHECK_VIOLATION",
            Self::SerializationFailure => "SERIALIZATION",
            Self::Deadlock => "DEADLOCK",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ChecksumDrift => "CHECKSUM_DRIFT",
            Self::InvalidState => "INVALID_STATE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether re-running the whole transaction may succeed unchanged.
    ///
    /// Only serialization failures and deadlocks qualify. Constraint
    /// violations need the caller to change something first.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::SerializationFailure | Self::Deadlock)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors produced by the transaction manager and the migration engine.
#[derive(Debug, Error)]
pub enum DbError {
    /// A statement failed.
    #[error("{op}: {message}{}", target_suffix(.table.as_deref(), .constraint.as_deref()))]
    Query {
        /// Classification of the failure.
        kind: ErrorKind,
        /// The operation that failed.
        op: &'static str,
        /// Human-readable description.
        message: String,
        /// Table implicated, if SQLite reported one.
        table: Option<String>,
        /// Column implicated, if SQLite reported one.
        column: Option<String>,
        /// Constraint implicated, if SQLite reported one.
        constraint: Option<String>,
        /// The (truncated) SQL that failed, when it is useful to show.
        query: Option<String>,
        /// The underlying SQLite error.
        #[source]
        source: Option<rusqlite::Error>,
    },

    /// No connection could be checked out of the pool.
    #[error("{op}: failed to acquire connection: {source}")]
    Pool {
        /// The operation that failed.
        op: &'static str,
        /// The underlying pool error.
        #[source]
        source: r2d2::Error,
    },

    /// The caller's cancellation signal fired or its deadline passed.
    #[error("{op}: operation cancelled")]
    Cancelled {
        /// The operation that was abandoned.
        op: &'static str,
    },

    /// An applied migration's SQL has changed since it was recorded.
    #[error("Migrate: migration {id} has changed (checksum mismatch: expected {expected}, got {actual})")]
    ChecksumDrift {
        /// The migration identifier.
        id: String,
        /// Checksum stored in the ledger.
        expected: String,
        /// Checksum of the SQL supplied now.
        actual: String,
    },

    /// Work on a transaction that has already finished, or that SQLite
    /// ended on its own.
    #[error("{op}: transaction already {state}")]
    InvalidState {
        /// The operation that was refused.
        op: &'static str,
        /// The state the transaction was in.
        state: ScopeState,
    },

    /// Rolling back after a failed callback also failed.
    #[error("Rollback: rollback failed: {rollback} (original error: {original})")]
    RollbackFailed {
        /// The rollback failure.
        #[source]
        rollback: Box<DbError>,
        /// The error that triggered the rollback.
        original: BoxError,
    },

    /// Rolling back to a savepoint failed; the connection may be unusable.
    #[error("RollbackToSavepoint: rollback to savepoint {savepoint} failed, connection may be unusable: {rollback} (original error: {original})")]
    SavepointRollbackFailed {
        /// The savepoint that could not be restored.
        savepoint: String,
        /// The rollback failure.
        #[source]
        rollback: Box<DbError>,
        /// The error that triggered the rollback.
        original: BoxError,
    },
}

fn target_suffix(table: Option<&str>, constraint: Option<&str>) -> String {
    let mut suffix = String::new();
    if let Some(table) = table {
        suffix.push_str(&format!(" (table: {table})"));
    }
    if let Some(constraint) = constraint {
        suffix.push_str(&format!(" (constraint: {constraint})"));
    }
    suffix
}

impl DbError {
    /// Builds a `Query` error that did not originate in SQLite.
    pub fn other(kind: ErrorKind, op: &'static str, message: impl Into<String>) -> Self {
        Self::Query {
            kind,
            op,
            message: message.into(),
            table: None,
            column: None,
            constraint: None,
            query: None,
            source: None,
        }
    }

    /// Returns the classification of this error.
    ///
    /// Composite rollback errors report the kind of the rollback failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Query { kind, .. } => *kind,
            Self::Pool { .. } => ErrorKind::ConnectionFailed,
            Self::Cancelled { .. } => ErrorKind::Timeout,
            Self::ChecksumDrift { .. } => ErrorKind::ChecksumDrift,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::RollbackFailed { rollback, .. } => rollback.kind(),
            Self::SavepointRollbackFailed { rollback, .. } => rollback.kind(),
        }
    }

    /// Returns the name of the operation that failed.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Query { op, .. }
            | Self::Pool { op, .. }
            | Self::Cancelled { op }
            | Self::InvalidState { op, .. } => *op,
            Self::ChecksumDrift { .. } => "Migrate",
            Self::RollbackFailed { .. } => "Rollback",
            Self::SavepointRollbackFailed { .. } => "RollbackToSavepoint",
        }
    }

    /// Table implicated by the failure, if known.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::Query { table, .. } => table.as_deref(),
            _ => None,
        }
    }

    /// Column implicated by the failure, if known.
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Query { column, .. } => column.as_deref(),
            _ => None,
        }
    }

    /// Constraint implicated by the failure, if known.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Self::Query { constraint, .. } => constraint.as_deref(),
            _ => None,
        }
    }

    /// The SQL attached to the failure, if any.
    pub fn query(&self) -> Option<&str> {
        match self {
            Self::Query { query, .. } => query.as_deref(),
            _ => None,
        }
    }

    /// The error that triggered a failed rollback, for composite errors.
    pub fn original(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::RollbackFailed { original, .. }
            | Self::SavepointRollbackFailed { original, .. } => Some(original.as_ref()),
            _ => None,
        }
    }

    /// Whether the caller may retry the whole transaction.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether this error reports a missing row.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Whether this error reports a unique-constraint violation.
    pub fn is_duplicate(&self) -> bool {
        self.kind() == ErrorKind::Duplicate
    }

    /// Whether this error reports a foreign-key violation.
    pub fn is_foreign_key(&self) -> bool {
        self.kind() == ErrorKind::ForeignKeyViolation
    }

    /// Whether this error reports a check-constraint violation.
    pub fn is_check_violation(&self) -> bool {
        self.kind() == ErrorKind::CheckViolation
    }

    /// Whether this error reports a not-null violation.
    pub fn is_not_null_violation(&self) -> bool {
        self.kind() == ErrorKind::NotNullViolation
    }

    /// Whether this error reports a connection failure.
    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::ConnectionFailed
    }

    /// Whether this error reports a timeout or cancellation.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Rewrites a statement failure as the failure of migration `id`.
    pub(crate) fn in_migration(self, id: &str, sql: &str) -> Self {
        match self {
            Self::Query {
                kind,
                op,
                message,
                table,
                column,
                constraint,
                source,
                ..
            } => Self::Query {
                kind,
                op,
                message: format!("migration {id} failed: {message}"),
                table,
                column,
                constraint,
                query: Some(truncate_sql(sql, ERROR_QUERY_MAX_LEN)),
                source,
            },
            other => other,
        }
    }
}

/// Maps a raw SQLite error onto the taxonomy under operation `op`.
pub fn classify(err: rusqlite::Error, op: &'static str) -> DbError {
    let (kind, message) = match &err {
        rusqlite::Error::QueryReturnedNoRows => (ErrorKind::NotFound, "record not found".to_string()),
        rusqlite::Error::SqliteFailure(code, message) => (
            kind_for(code),
            message.clone().unwrap_or_else(|| code.to_string()),
        ),
        other => (ErrorKind::Unknown, other.to_string()),
    };
    let mut target = Target::parse(kind, &message);
    // RAISE(...) in a trigger reports only the author's message.
    if is_trigger_failure(&err) && target.constraint.is_none() {
        target.constraint = Some(message.clone());
    }

    DbError::Query {
        kind,
        op,
        message,
        table: target.table,
        column: target.column,
        constraint: target.constraint,
        query: None,
        source: Some(err),
    }
}

fn is_trigger_failure(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _) if code.extended_code == ffi::SQLITE_CONSTRAINT_TRIGGER
    )
}

fn kind_for(code: &ffi::Error) -> ErrorKind {
    match code.extended_code {
        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => ErrorKind::Duplicate,
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => ErrorKind::ForeignKeyViolation,
        ffi::SQLITE_CONSTRAINT_NOTNULL => ErrorKind::NotNullViolation,
        ffi::SQLITE_CONSTRAINT_CHECK | ffi::SQLITE_CONSTRAINT_TRIGGER => {
            ErrorKind::CheckViolation
        }
        ffi::SQLITE_BUSY_SNAPSHOT => ErrorKind::SerializationFailure,
        _ => match code.code {
            ffi::ErrorCode::DatabaseLocked => ErrorKind::Deadlock,
            ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::OperationInterrupted => {
                ErrorKind::Timeout
            }
            ffi::ErrorCode::CannotOpen
            | ffi::ErrorCode::NotADatabase
            | ffi::ErrorCode::SystemIoFailure => ErrorKind::ConnectionFailed,
            _ => ErrorKind::Unknown,
        },
    }
}

/// Table, column, and constraint named in a SQLite constraint message.
#[derive(Debug, Default, PartialEq, Eq)]
struct Target {
    table: Option<String>,
    column: Option<String>,
    constraint: Option<String>,
}

impl Target {
    // SQLite reports e.g. "UNIQUE constraint failed: users.email",
    // "UNIQUE constraint failed: index 'idx_lower_email'" or
    // "CHECK constraint failed: price_positive".
    fn parse(kind: ErrorKind, message: &str) -> Self {
        let Some((_, detail)) = message.split_once("constraint failed: ") else {
            return Self::default();
        };
        let detail = detail.trim();

        match kind {
            ErrorKind::CheckViolation => Self {
                constraint: Some(detail.to_string()),
                ..Self::default()
            },
            ErrorKind::Duplicate | ErrorKind::NotNullViolation => {
                if let Some(index) = detail.strip_prefix("index ") {
                    return Self {
                        constraint: Some(index.trim_matches('\'').to_string()),
                        ..Self::default()
                    };
                }
                let first = detail.split(',').next().unwrap_or(detail).trim();
                match first.split_once('.') {
                    Some((table, column)) => Self {
                        table: Some(table.to_string()),
                        column: Some(column.to_string()),
                        constraint: None,
                    },
                    None => Self::default(),
                }
            }
            _ => Self::default(),
        }
    }
}

/// Truncates `sql` to at most `max_len` characters, marking the cut.
pub(crate) fn truncate_sql(sql: &str, max_len: usize) -> String {
    match sql.char_indices().nth(max_len) {
        Some((cut, _)) => format!("{}...", &sql[..cut]),
        None => sql.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn conn_with_schema() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE users (
                 id INTEGER PRIMARY KEY,
                 email TEXT NOT NULL UNIQUE,
                 age INTEGER CONSTRAINT age_positive CHECK (age > 0)
             );
             CREATE TABLE posts (
                 id INTEGER PRIMARY KEY,
                 user_id INTEGER NOT NULL REFERENCES users(id)
             );
             INSERT INTO users (id, email, age) VALUES (1, 'a@example.com', 30);",
        )
        .expect("should create schema");
        conn
    }

    #[test]
    fn unique_violation_is_duplicate_with_table_and_column() {
        let conn = conn_with_schema();
        let err = conn
            .execute(
                "INSERT INTO users (email, age) VALUES ('a@example.com', 20)",
                [],
            )
            .expect_err("duplicate email should fail");

        let err = classify(err, "Create");
        assert_eq!(err.kind(), ErrorKind::Duplicate);
        assert!(err.is_duplicate());
        assert_eq!(err.op(), "Create");
        assert_eq!(err.table(), Some("users"));
        assert_eq!(err.column(), Some("email"));
        assert!(
            err.to_string().starts_with("Create: UNIQUE constraint failed"),
            "unexpected message: {err}"
        );
        assert!(err.to_string().contains("(table: users)"));
    }

    #[test]
    fn primary_key_violation_is_duplicate() {
        let conn = conn_with_schema();
        let err = conn
            .execute(
                "INSERT INTO users (id, email, age) VALUES (1, 'b@example.com', 20)",
                [],
            )
            .expect_err("duplicate id should fail");
        assert_eq!(classify(err, "Create").kind(), ErrorKind::Duplicate);
    }

    #[test]
    fn not_null_violation_names_column() {
        let conn = conn_with_schema();
        let err = conn
            .execute("INSERT INTO users (email, age) VALUES (NULL, 20)", [])
            .expect_err("null email should fail");

        let err = classify(err, "Create");
        assert_eq!(err.kind(), ErrorKind::NotNullViolation);
        assert_eq!(err.table(), Some("users"));
        assert_eq!(err.column(), Some("email"));
    }

    #[test]
    fn check_violation_names_constraint() {
        let conn = conn_with_schema();
        let err = conn
            .execute(
                "INSERT INTO users (email, age) VALUES ('c@example.com', -1)",
                [],
            )
            .expect_err("negative age should fail");

        let err = classify(err, "Create");
        assert_eq!(err.kind(), ErrorKind::CheckViolation);
        assert_eq!(err.constraint(), Some("age_positive"));
        assert!(err.to_string().contains("(constraint: age_positive)"));
    }

    #[test]
    fn trigger_raise_is_check_violation() {
        let conn = conn_with_schema();
        conn.execute_batch(
            "CREATE TRIGGER users_no_admin BEFORE INSERT ON users
             WHEN NEW.email = 'admin@example.com'
             BEGIN SELECT RAISE(ABORT, 'admin is reserved'); END;",
        )
        .expect("should create trigger");

        let err = conn
            .execute(
                "INSERT INTO users (email, age) VALUES ('admin@example.com', 40)",
                [],
            )
            .expect_err("trigger should reject the row");

        let err = classify(err, "Create");
        assert_eq!(err.kind(), ErrorKind::CheckViolation);
        assert!(err.is_check_violation());
        assert_eq!(err.constraint(), Some("admin is reserved"));
    }

    #[test]
    fn foreign_key_violation_is_classified() {
        let conn = conn_with_schema();
        let err = conn
            .execute("INSERT INTO posts (user_id) VALUES (42)", [])
            .expect_err("dangling user_id should fail");
        assert!(classify(err, "Create").is_foreign_key());
    }

    #[test]
    fn missing_row_is_not_found() {
        let conn = conn_with_schema();
        let err = conn
            .query_row("SELECT id FROM users WHERE id = 99", [], |row| {
                row.get::<_, i64>(0)
            })
            .expect_err("no row should be found");

        let err = classify(err, "FindByID");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "FindByID: record not found");
    }

    #[test]
    fn syntax_error_is_unknown() {
        let conn = conn_with_schema();
        let err = conn
            .execute_batch("CREATE TABLEE broken (id INTEGER)")
            .expect_err("syntax error should fail");
        let err = classify(err, "Exec");
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_serialization_and_deadlock_are_retryable() {
        let retryable: Vec<ErrorKind> = [
            ErrorKind::NotFound,
            ErrorKind::Duplicate,
            ErrorKind::ForeignKeyViolation,
            ErrorKind::NotNullViolation,
            ErrorKind::CheckViolation,
            ErrorKind::SerializationFailure,
            ErrorKind::Deadlock,
            ErrorKind::Timeout,
            ErrorKind::ConnectionFailed,
            ErrorKind::ChecksumDrift,
            ErrorKind::InvalidState,
            ErrorKind::Unknown,
        ]
        .into_iter()
        .filter(|kind| kind.is_retryable())
        .collect();

        assert_eq!(
            retryable,
            vec![ErrorKind::SerializationFailure, ErrorKind::Deadlock]
        );
    }

    #[test]
    fn rollback_failure_keeps_both_errors() {
        let err = DbError::RollbackFailed {
            rollback: Box::new(DbError::other(
                ErrorKind::ConnectionFailed,
                "Rollback",
                "disk I/O error",
            )),
            original: Box::new(DbError::other(ErrorKind::Unknown, "Exec", "bad insert")),
        };

        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(err.op(), "Rollback");
        let text = err.to_string();
        assert!(text.contains("disk I/O error"), "{text}");
        assert!(text.contains("bad insert"), "{text}");
        let original = err.original().expect("original error should be kept");
        assert_eq!(original.to_string(), "Exec: bad insert");
    }

    #[test]
    fn index_constraint_message_names_index() {
        let target = Target::parse(
            ErrorKind::Duplicate,
            "UNIQUE constraint failed: index 'idx_lower_email'",
        );
        assert_eq!(target.constraint.as_deref(), Some("idx_lower_email"));
        assert_eq!(target.table, None);
    }

    #[test]
    fn truncate_sql_respects_limit() {
        assert_eq!(truncate_sql("SELECT 1", 200), "SELECT 1");
        assert_eq!(truncate_sql("abcdef", 3), "abc...");
        assert_eq!(truncate_sql("ééééé", 2), "éé...");
    }

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ErrorKind::ForeignKeyViolation.to_string(), "FOREIGN_KEY");
        assert_eq!(ErrorKind::ChecksumDrift.code(), "CHECKSUM_DRIFT");
    }
}
