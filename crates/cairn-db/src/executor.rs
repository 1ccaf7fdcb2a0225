//! The "anything that can run SQL" capability.
//!
//! [`Executor`] is implemented by [`Database`](crate::Database) (each call
//! checks out a pooled connection), by [`Transaction`](crate::Transaction)
//! and by every [`Scope`](crate::Scope) inside one. Helper code written
//! against `&impl Executor` therefore runs unchanged inside or outside a
//! transaction.

use std::time::{Duration, Instant};

use rusqlite::{Connection, Params, Row};

use crate::cancel::CancelToken;
use crate::error::{classify, truncate_sql, BoxError, DbError};
use crate::tx::Scope;

/// Maximum number of SQL characters written to the log.
pub const LOG_QUERY_MAX_LEN: usize = 500;

/// Runs parameterized SQL and opens nested transaction scopes.
pub trait Executor {
    /// Runs `f` against the underlying connection as operation `op`.
    ///
    /// `sql` is the statement `f` is about to run; it is used for logging.
    /// The cancellation signal is checked first, and any SQLite failure is
    /// classified under `op`.
    fn run<T, F>(&self, op: &'static str, sql: &str, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>;

    /// Runs `f` inside a transaction scope.
    ///
    /// On a [`Database`](crate::Database) this opens a top-level transaction
    /// with default options; on a transaction or scope it opens a nested
    /// savepoint scope. `f` succeeding commits (or releases) the scope; `f`
    /// failing rolls it back.
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Scope<'_>) -> Result<T, E>,
        E: From<DbError> + Into<BoxError>;

    /// Executes a single statement and returns the number of affected rows.
    fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, DbError> {
        self.run("Exec", sql, |conn| conn.execute(sql, params))
    }

    /// Executes one or more statements without parameters.
    fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.run("ExecBatch", sql, |conn| conn.execute_batch(sql))
    }

    /// Runs a query expected to return exactly one row.
    ///
    /// No row yields a `NotFound`-kind error.
    fn query_row<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<T, DbError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.run("QueryRow", sql, |conn| conn.query_row(sql, params, map))
    }

    /// Runs a query and maps every row.
    fn query_all<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>, DbError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.run("QueryAll", sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, map)?.collect();
            rows
        })
    }

    /// Whether a query returns at least one row.
    fn exists<P: Params>(&self, sql: &str, params: P) -> Result<bool, DbError> {
        self.run("Exists", sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            stmt.exists(params)
        })
    }
}

/// Per-statement settings shared by every executor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatementContext<'a> {
    pub(crate) cancel: &'a CancelToken,
    pub(crate) slow_query: Option<Duration>,
}

impl StatementContext<'_> {
    /// Runs one statement with cancellation, timing, and classification.
    pub(crate) fn run<T, F>(
        &self,
        conn: &Connection,
        op: &'static str,
        sql: &str,
        f: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        self.cancel.check(op)?;
        let _watch = self.cancel.watch(conn.get_interrupt_handle());

        let started = Instant::now();
        let result = f(conn);
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                if self.slow_query.is_some_and(|threshold| elapsed >= threshold) {
                    tracing::warn!(
                        op,
                        operation = operation_type(sql),
                        duration_ms = elapsed.as_millis() as u64,
                        query = %truncate_sql(sql, LOG_QUERY_MAX_LEN),
                        "slow database query"
                    );
                }
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(
                    op,
                    operation = operation_type(sql),
                    duration_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "database query failed"
                );
                if self.cancel.is_cancelled()
                    && e.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted)
                {
                    return Err(DbError::Cancelled { op });
                }
                Err(classify(e, op))
            }
        }
    }
}

/// Runs a statement that must not be skipped because of cancellation.
///
/// Used for rollbacks and connection cleanup, which have to run on the
/// unwind path after the caller's signal has already fired.
pub(crate) fn run_uncancellable(conn: &Connection, op: &'static str, sql: &str) -> Result<(), DbError> {
    conn.execute_batch(sql).map_err(|e| {
        tracing::debug!(op, error = %e, "database cleanup statement failed");
        classify(e, op)
    })
}

/// Coarse statement type used as a log field.
pub fn operation_type(sql: &str) -> &'static str {
    let head = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == ';' || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    match head.as_str() {
        "SELECT" | "WITH" | "PRAGMA" => "select",
        "INSERT" | "REPLACE" => "insert",
        "UPDATE" => "update",
        "DELETE" => "delete",
        "CREATE" => "create",
        "DROP" => "drop",
        "ALTER" => "alter",
        "BEGIN" => "begin",
        "COMMIT" | "END" => "commit",
        "ROLLBACK" => "rollback",
        "SAVEPOINT" => "savepoint",
        "RELEASE" => "release",
        _ => "other",
    }
}
