//! Transaction manager: top-level transactions and nested savepoint scopes.
//!
//! A [`Transaction`] owns one pooled connection and the physical SQLite
//! transaction running on it. Work inside the transaction goes through a
//! [`Scope`], which borrows the connection. [`Scope::transaction`] opens a
//! nested scope as a savepoint on the same physical transaction: if the
//! nested callback fails only its writes are undone and the parent scope
//! stays open.
//!
//! Savepoint names come from a counter owned by the top-level transaction
//! and shared by every descendant scope, so names never repeat within one
//! physical transaction.
//!
//! # State machine
//!
//! ```text
//! top-level:  Open -> Committed | RolledBack
//! ```
//!
//! A nested scope has no state of its own: when its callback returns, the
//! savepoint is released into the parent or rolled back to, and the parent
//! stays open either way.
//!
//! Rolling back a finished transaction succeeds without doing anything, so
//! cleanup paths never fail after the happy path has concluded. Committing a
//! finished transaction is an `InvalidState` error. Dropping an open
//! transaction, including while unwinding from a panic, rolls it back.
//!
//! SQLite ends the physical transaction by itself after some failures
//! (`RAISE(ROLLBACK, ...)` in a trigger, I/O or out-of-memory errors). From
//! then on every scope refuses to run statements with an `InvalidState`
//! error and `commit` reports the transaction as rolled back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::cancel::CancelToken;
use crate::error::{BoxError, DbError, ErrorKind};
use crate::executor::{run_uncancellable, Executor, StatementContext};
use crate::pool::DbRuntimeSettings;

/// Prefix of generated savepoint names (`sp_1`, `sp_2`, ...).
pub const SAVEPOINT_PREFIX: &str = "sp_";

/// Transaction isolation requested at begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// `BEGIN DEFERRED`: locks are taken on first read or write.
    #[default]
    Default,
    /// `BEGIN IMMEDIATE`: the write lock is taken at begin, so concurrent
    /// writers queue behind this transaction instead of failing mid-way.
    Serializable,
}

impl Isolation {
    fn begin_sql(self) -> &'static str {
        match self {
            Self::Default => "BEGIN DEFERRED",
            Self::Serializable => "BEGIN IMMEDIATE",
        }
    }
}

/// Options for beginning a top-level transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    /// Isolation level.
    pub isolation: Isolation,
    /// Reject writes for the lifetime of the transaction.
    pub read_only: bool,
}

impl TxOptions {
    /// Default isolation, writes rejected.
    pub fn read_only() -> Self {
        Self {
            isolation: Isolation::Default,
            read_only: true,
        }
    }

    /// Serializable isolation, writes allowed.
    pub fn serializable() -> Self {
        Self {
            isolation: Isolation::Serializable,
            read_only: false,
        }
    }
}

/// Lifecycle state of a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Still accepting work.
    Open,
    /// Committed to the database.
    Committed,
    /// Rolled back.
    RolledBack,
}

impl ScopeState {
    /// Whether the scope can no longer change state.
    pub fn is_terminal(self) -> bool {
        self != Self::Open
    }
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}

/// A top-level transaction on a pooled connection.
///
/// Created by [`Database::begin`](crate::Database::begin). Use
/// [`commit`](Self::commit) and [`rollback`](Self::rollback) for manual
/// control, or [`Database::run_in_transaction`](crate::Database::run_in_transaction)
/// to have both handled around a callback.
pub struct Transaction {
    conn: PooledConnection<SqliteConnectionManager>,
    savepoint_seq: AtomicU64,
    state: ScopeState,
    options: TxOptions,
    settings: DbRuntimeSettings,
    cancel: CancelToken,
}

impl Transaction {
    pub(crate) fn begin(
        conn: PooledConnection<SqliteConnectionManager>,
        options: TxOptions,
        settings: DbRuntimeSettings,
        cancel: CancelToken,
    ) -> Result<Self, DbError> {
        let sql = options.isolation.begin_sql();
        StatementContext {
            cancel: &cancel,
            slow_query: settings.slow_query_threshold(),
        }
        .run(&conn, "Begin", sql, |c| c.execute_batch(sql))?;

        // From here on, Drop rolls back if anything below fails.
        let tx = Self {
            conn,
            savepoint_seq: AtomicU64::new(0),
            state: ScopeState::Open,
            options,
            settings,
            cancel,
        };

        if options.read_only {
            tx.statement().run(&tx.conn, "Begin", "PRAGMA query_only = ON", |c| {
                c.execute_batch("PRAGMA query_only = ON")
            })?;
        }

        tracing::debug!(
            isolation = ?options.isolation,
            read_only = options.read_only,
            "transaction started"
        );
        Ok(tx)
    }

    /// Current state of the transaction.
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Options the transaction was started with.
    pub fn options(&self) -> TxOptions {
        self.options
    }

    /// The executor view of this transaction, as handed to callbacks.
    pub fn scope(&self) -> Scope<'_> {
        Scope {
            conn: &*self.conn,
            savepoint_seq: &self.savepoint_seq,
            savepoint: None,
            ctx: self.statement(),
        }
    }

    /// Commits the transaction.
    ///
    /// If `COMMIT` fails the transaction is rolled back and the commit error
    /// is returned; it is not retried.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the transaction has already finished, otherwise
    /// the classified commit failure.
    pub fn commit(&mut self) -> Result<(), DbError> {
        if self.state.is_terminal() {
            return Err(DbError::InvalidState {
                op: "Commit",
                state: self.state,
            });
        }

        if self.conn.is_autocommit() {
            tracing::warn!("transaction was ended by the database before commit");
            self.state = ScopeState::RolledBack;
            self.finish();
            return Err(DbError::InvalidState {
                op: "Commit",
                state: self.state,
            });
        }

        let committed = self
            .statement()
            .run(&self.conn, "Commit", "COMMIT", |c| c.execute_batch("COMMIT"));
        if let Err(err) = committed {
            tracing::warn!(error = %err, "commit failed, rolling back");
            if let Err(rollback_err) = self.rollback() {
                tracing::warn!(error = %rollback_err, "rollback after failed commit also failed");
            }
            return Err(err);
        }

        self.state = ScopeState::Committed;
        self.finish();
        tracing::debug!("transaction committed");
        Ok(())
    }

    /// Rolls the transaction back.
    ///
    /// Returns `Ok(())` without doing anything if the transaction has
    /// already been committed or rolled back.
    ///
    /// # Errors
    ///
    /// The classified rollback failure. The transaction then stays open and
    /// a later call (or drop) tries again.
    pub fn rollback(&mut self) -> Result<(), DbError> {
        if self.state.is_terminal() {
            return Ok(());
        }

        // SQLite ends the transaction on its own after some failures
        // (e.g. an interrupted write); there is nothing left to undo.
        if !self.conn.is_autocommit() {
            run_uncancellable(&self.conn, "Rollback", "ROLLBACK")?;
        }

        self.state = ScopeState::RolledBack;
        self.finish();
        tracing::debug!("transaction rolled back");
        Ok(())
    }

    fn statement(&self) -> StatementContext<'_> {
        StatementContext {
            cancel: &self.cancel,
            slow_query: self.settings.slow_query_threshold(),
        }
    }

    fn ensure_open(&self, op: &'static str) -> Result<(), DbError> {
        if self.state.is_terminal() {
            return Err(DbError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    // Pooled connections are reused; undo per-transaction settings.
    fn finish(&self) {
        if self.options.read_only {
            if let Err(err) = run_uncancellable(&self.conn, "Rollback", "PRAGMA query_only = OFF") {
                tracing::warn!(error = %err, "failed to restore query_only after read-only transaction");
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == ScopeState::Open {
            if std::thread::panicking() {
                tracing::warn!("rolling back transaction during panic");
            }
            if let Err(err) = self.rollback() {
                tracing::warn!(error = %err, "rollback on drop failed");
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("options", &self.options)
            .field("savepoints", &self.savepoint_seq.load(Ordering::SeqCst))
            .finish()
    }
}

impl Executor for Transaction {
    fn run<T, F>(&self, op: &'static str, sql: &str, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        self.ensure_open(op)?;
        ensure_active(&self.conn)?;
        self.statement().run(&self.conn, op, sql, f)
    }

    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Scope<'_>) -> Result<T, E>,
        E: From<DbError> + Into<BoxError>,
    {
        self.ensure_open("Transaction.Savepoint")?;
        self.scope().transaction(f)
    }
}

/// A view of an open transaction through which statements run.
///
/// The top-level scope comes from [`Transaction::scope`]; nested scopes are
/// created by [`Scope::transaction`] and each owns one savepoint. A scope
/// never ends the physical transaction itself.
pub struct Scope<'t> {
    conn: &'t Connection,
    savepoint_seq: &'t AtomicU64,
    savepoint: Option<String>,
    ctx: StatementContext<'t>,
}

impl<'t> Scope<'t> {
    /// Name of the savepoint this scope owns, `None` at the top level.
    pub fn savepoint_name(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    /// Whether this scope is a nested savepoint scope.
    pub fn is_nested(&self) -> bool {
        self.savepoint.is_some()
    }

    /// Runs `f` in a nested scope backed by a fresh savepoint.
    ///
    /// On success the savepoint is released into this scope. On failure it
    /// is rolled back to, which undoes only the nested writes, and `f`'s
    /// error is returned; this scope remains open.
    ///
    /// # Errors
    ///
    /// `f`'s error, or the savepoint statement failures. If rolling back to
    /// the savepoint itself fails, a `SavepointRollbackFailed` error carrying
    /// both failures is returned instead: the connection may be unusable.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Scope<'_>) -> Result<T, E>,
        E: From<DbError> + Into<BoxError>,
    {
        // SAVEPOINT outside a transaction would start a new one.
        ensure_active(self.conn)?;
        let id = self.savepoint_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{SAVEPOINT_PREFIX}{id}");

        let create = format!("SAVEPOINT {name}");
        self.ctx
            .run(self.conn, "Transaction.Savepoint", &create, |c| c.execute_batch(&create))?;
        tracing::debug!(savepoint = %name, "savepoint created");

        let child = Scope {
            conn: self.conn,
            savepoint_seq: self.savepoint_seq,
            savepoint: Some(name.clone()),
            ctx: self.ctx,
        };
        let guard = SavepointGuard {
            conn: self.conn,
            name: &name,
            armed: true,
        };

        let outcome = f(&child);
        guard.disarm();

        // The savepoint went away with the physical transaction.
        if self.conn.is_autocommit() {
            tracing::warn!(savepoint = %name, "transaction ended by the database inside nested scope");
            return match outcome {
                Ok(_) => Err(E::from(transaction_ended())),
                Err(err) => Err(err),
            };
        }

        match outcome {
            Ok(value) => {
                let release = format!("RELEASE SAVEPOINT {name}");
                if let Err(err) = self.ctx.run(
                    self.conn,
                    "Transaction.ReleaseSavepoint",
                    &release,
                    |c| c.execute_batch(&release),
                ) {
                    // The nested work must not survive a failed release.
                    if let Err(rollback_err) = rollback_to_savepoint(self.conn, &name) {
                        tracing::warn!(savepoint = %name, error = %rollback_err, "rollback after failed release also failed");
                    }
                    return Err(err.into());
                }
                tracing::debug!(savepoint = %name, "savepoint released");
                Ok(value)
            }
            Err(err) => match rollback_to_savepoint(self.conn, &name) {
                Ok(()) => {
                    tracing::debug!(savepoint = %name, "savepoint rolled back");
                    Err(err)
                }
                Err(rollback_err) => {
                    tracing::error!(savepoint = %name, error = %rollback_err, "rollback to savepoint failed");
                    Err(E::from(DbError::SavepointRollbackFailed {
                        savepoint: name,
                        rollback: Box::new(rollback_err),
                        original: err.into(),
                    }))
                }
            },
        }
    }

    /// Creates a named savepoint for manual control.
    pub fn savepoint(&self, name: &str) -> Result<(), DbError> {
        let sql = format!("SAVEPOINT {}", checked_name("Savepoint", name)?);
        ensure_active(self.conn)?;
        self.ctx.run(self.conn, "Savepoint", &sql, |c| c.execute_batch(&sql))
    }

    /// Rolls back to a named savepoint, keeping it on the stack.
    pub fn rollback_to(&self, name: &str) -> Result<(), DbError> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", checked_name("RollbackTo", name)?);
        run_uncancellable(self.conn, "RollbackTo", &sql)
    }

    /// Releases a named savepoint into its enclosing scope.
    pub fn release_savepoint(&self, name: &str) -> Result<(), DbError> {
        let sql = format!("RELEASE SAVEPOINT {}", checked_name("ReleaseSavepoint", name)?);
        self.ctx
            .run(self.conn, "ReleaseSavepoint", &sql, |c| c.execute_batch(&sql))
    }
}

impl fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("savepoint", &self.savepoint)
            .finish()
    }
}

impl Executor for Scope<'_> {
    fn run<T, F>(&self, op: &'static str, sql: &str, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        ensure_active(self.conn)?;
        self.ctx.run(self.conn, op, sql, f)
    }

    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Scope<'_>) -> Result<T, E>,
        E: From<DbError> + Into<BoxError>,
    {
        Scope::transaction(self, f)
    }
}

/// Rolls back to the savepoint if the nested callback unwinds.
struct SavepointGuard<'a> {
    conn: &'a Connection,
    name: &'a str,
    armed: bool,
}

impl SavepointGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SavepointGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = rollback_to_savepoint(self.conn, self.name) {
                tracing::warn!(savepoint = self.name, error = %err, "rollback to savepoint during panic failed");
            }
        }
    }
}

// ROLLBACK TO leaves the savepoint on the stack; release it too.
fn rollback_to_savepoint(conn: &Connection, name: &str) -> Result<(), DbError> {
    run_uncancellable(
        conn,
        "RollbackToSavepoint",
        &format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};"),
    )
}

fn transaction_ended() -> DbError {
    DbError::InvalidState {
        op: "Transaction",
        state: ScopeState::RolledBack,
    }
}

// Refuses to run once SQLite has ended the physical transaction itself.
fn ensure_active(conn: &Connection) -> Result<(), DbError> {
    if conn.is_autocommit() {
        return Err(transaction_ended());
    }
    Ok(())
}

fn checked_name<'n>(op: &'static str, name: &'n str) -> Result<&'n str, DbError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(DbError::other(
            ErrorKind::Unknown,
            op,
            format!("invalid savepoint name {name:?}"),
        ));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_maps_to_begin_mode() {
        assert_eq!(Isolation::Default.begin_sql(), "BEGIN DEFERRED");
        assert_eq!(Isolation::Serializable.begin_sql(), "BEGIN IMMEDIATE");
        assert_eq!(TxOptions::default().isolation, Isolation::Default);
        assert!(TxOptions::read_only().read_only);
        assert_eq!(TxOptions::serializable().isolation, Isolation::Serializable);
    }

    #[test]
    fn terminal_states() {
        assert!(!ScopeState::Open.is_terminal());
        assert!(ScopeState::Committed.is_terminal());
        assert!(ScopeState::RolledBack.is_terminal());
        assert_eq!(ScopeState::RolledBack.to_string(), "rolled back");
    }

    #[test]
    fn savepoint_names_are_validated() {
        assert!(checked_name("Savepoint", "before_import").is_ok());
        assert!(checked_name("Savepoint", "_x1").is_ok());
        assert!(checked_name("Savepoint", "").is_err());
        assert!(checked_name("Savepoint", "1abc").is_err());
        assert!(checked_name("Savepoint", "x; DROP TABLE users").is_err());
    }
}
