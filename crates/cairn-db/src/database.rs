//! The connection handle: a cloneable wrapper around the pool.

use std::fmt;

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::cancel::CancelToken;
use crate::error::{BoxError, DbError};
use crate::executor::{run_uncancellable, Executor, StatementContext};
use crate::pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
use crate::tx::{Scope, Transaction, TxOptions};

/// Handle to a pooled SQLite database.
///
/// Cheap to clone; clones share the pool. Every blocking call made through
/// a handle observes the handle's [`CancelToken`], see
/// [`with_cancel`](Self::with_cancel).
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    settings: DbRuntimeSettings,
    cancel: CancelToken,
}

impl Database {
    /// Opens a pool on `db_path` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::PoolInit` if the pool cannot be created.
    pub fn open(db_path: &str, settings: DbRuntimeSettings) -> Result<Self, PoolError> {
        let pool = create_pool(db_path, settings)?;
        Ok(Self::new(pool, settings))
    }

    /// Wraps an existing pool.
    pub fn new(pool: DbPool, settings: DbRuntimeSettings) -> Self {
        Self {
            pool,
            settings,
            cancel: CancelToken::new(),
        }
    }

    /// Returns a handle on the same pool that observes `cancel`.
    ///
    /// Transactions begun and migrations run through the returned handle
    /// are abandoned and rolled back when `cancel` fires.
    pub fn with_cancel(&self, cancel: CancelToken) -> Self {
        Self {
            pool: self.pool.clone(),
            settings: self.settings,
            cancel,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Runtime settings the handle was created with.
    pub fn settings(&self) -> DbRuntimeSettings {
        self.settings
    }

    /// The cancellation signal this handle observes.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Verifies that a connection can be checked out and queried.
    pub fn ping(&self) -> Result<(), DbError> {
        self.run("Ping", "SELECT 1", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        })
        .map(|_| ())
    }

    /// Begins a top-level transaction for manual control.
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` if no connection can be checked out, `Timeout` if
    /// the handle's signal has fired, or the classified `BEGIN` failure.
    pub fn begin(&self, options: TxOptions) -> Result<Transaction, DbError> {
        let conn = self.connection("Begin")?;
        Transaction::begin(conn, options, self.settings, self.cancel.clone())
    }

    /// Runs `f` in a new top-level transaction.
    ///
    /// Commits when `f` succeeds and returns the commit error if that
    /// fails. Rolls back when `f` fails and returns `f`'s error; if the
    /// rollback fails too, returns a `RollbackFailed` error carrying both.
    /// If `f` panics the transaction is rolled back while unwinding and the
    /// panic continues; a rollback failure at that point is only logged.
    pub fn run_in_transaction<T, E, F>(&self, options: TxOptions, f: F) -> Result<T, E>
    where
        F: FnOnce(&Scope<'_>) -> Result<T, E>,
        E: From<DbError> + Into<BoxError>,
    {
        let mut tx = self.begin(options)?;

        let outcome = f(&tx.scope());

        match outcome {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => match tx.rollback() {
                Ok(()) => Err(err),
                Err(rollback_err) => {
                    tracing::error!(error = %rollback_err, "rollback after failed transaction also failed");
                    Err(E::from(DbError::RollbackFailed {
                        rollback: Box::new(rollback_err),
                        original: err.into(),
                    }))
                }
            },
        }
    }

    /// Runs `f` in a read-only transaction.
    pub fn read_only_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Scope<'_>) -> Result<T, E>,
        E: From<DbError> + Into<BoxError>,
    {
        self.run_in_transaction(TxOptions::read_only(), f)
    }

    /// Checks out a pooled connection for operation `op`.
    pub(crate) fn connection(
        &self,
        op: &'static str,
    ) -> Result<PooledConnection<SqliteConnectionManager>, DbError> {
        self.cancel.check(op)?;
        let conn = self
            .pool
            .get()
            .map_err(|source| DbError::Pool { op, source })?;

        // A connection whose transaction could not be rolled back earlier
        // must not leak that transaction into the next user.
        if !conn.is_autocommit() {
            tracing::warn!(op, "pooled connection had an open transaction, rolling back");
            run_uncancellable(&conn, op, "ROLLBACK")?;
        }

        Ok(conn)
    }

    fn statement(&self) -> StatementContext<'_> {
        StatementContext {
            cancel: &self.cancel,
            slow_query: self.settings.slow_query_threshold(),
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("settings", &self.settings)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl Executor for Database {
    fn run<T, F>(&self, op: &'static str, sql: &str, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.connection(op)?;
        self.statement().run(&conn, op, sql, f)
    }

    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Scope<'_>) -> Result<T, E>,
        E: From<DbError> + Into<BoxError>,
    {
        self.run_in_transaction(TxOptions::default(), f)
    }
}
