//! Transactions and schema migrations over a pooled SQLite connection.
//!
//! Provides scoped transactions with savepoint-based nesting, a classified
//! error taxonomy, cancellation, and a migration engine that applies
//! author-supplied SQL exactly once, tracked by a checksummed ledger table.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: no external database process. WAL mode allows
//!   concurrent readers with a single writer, and `BEGIN IMMEDIATE` takes
//!   that writer lock up front, which is what serializes concurrent
//!   migrators.
//! - **`r2d2` connection pool**: a transaction owns its pooled connection
//!   until it commits or rolls back, so nothing else can interleave
//!   statements on it.
//! - **Closure-scoped transactions**: [`Database::run_in_transaction`] and
//!   [`Executor::transaction`] commit on `Ok`, roll back on `Err`, and roll
//!   back while unwinding from a panic. Nested scopes are savepoints named
//!   `sp_1`, `sp_2`, ... in creation order.
//! - **Per-migration atomicity**: each migration and its ledger row commit
//!   together or not at all.

mod cancel;
mod database;
mod discover;
mod error;
mod executor;
mod health;
mod ledger;
mod migrations;
mod pool;
mod tx;

pub use cancel::CancelToken;
pub use database::Database;
pub use discover::{discover, DiscoverError};
pub use error::{classify, BoxError, DbError, ErrorKind, ERROR_QUERY_MAX_LEN};
pub use executor::{operation_type, Executor, LOG_QUERY_MAX_LEN};
pub use health::{HealthStatus, PoolStats};
pub use ledger::{checksum, AppliedMigration, LEDGER_TABLE};
pub use migrations::{Migration, MigrationResult, MigrationStatus, Migrator};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
pub use tx::{Isolation, Scope, ScopeState, Transaction, TxOptions, SAVEPOINT_PREFIX};
