//! The migration ledger: one row per applied migration.
//!
//! The ledger table is created on first use and its own schema is never
//! migrated. Rows are written by the migration engine inside the same
//! transaction as the migration's SQL and are never updated or deleted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::DbError;
use crate::executor::Executor;

/// Name of the ledger table.
pub const LEDGER_TABLE: &str = "_cairn_migrations";

/// A migration recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    /// Migration identifier.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// SHA-256 of the migration's SQL, lowercase hex.
    pub checksum: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
    /// How long applying it took, in milliseconds.
    pub duration_ms: u64,
}

/// SHA-256 of `sql` as 64 lowercase hex characters.
///
/// The text is hashed exactly as given: whitespace or case changes produce
/// a different checksum.
pub fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

fn create_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL DEFAULT '',
            checksum TEXT NOT NULL CHECK (length(checksum) = 64),
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
            duration_ms INTEGER NOT NULL
        );"
    )
}

/// Creates the ledger table if it does not exist.
pub(crate) fn ensure_table<X: Executor>(db: &X, op: &'static str) -> Result<(), DbError> {
    let sql = create_table_sql();
    db.run(op, &sql, |conn| conn.execute_batch(&sql))
}

/// Whether the ledger table exists, without creating it.
pub(crate) fn table_exists<X: Executor>(db: &X, op: &'static str) -> Result<bool, DbError> {
    let sql = "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)";
    db.run(op, sql, |conn| {
        conn.query_row(sql, [LEDGER_TABLE], |row| row.get(0))
    })
}

/// Reads every recorded id with its checksum.
pub(crate) fn checksums<X: Executor>(
    db: &X,
    op: &'static str,
) -> Result<HashMap<String, String>, DbError> {
    let sql = format!("SELECT id, checksum FROM {LEDGER_TABLE}");
    db.run(op, &sql, |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect();
        rows
    })
}

/// The recorded checksum of migration `id`, if it has been applied.
pub(crate) fn lookup<X: Executor>(
    db: &X,
    id: &str,
    op: &'static str,
) -> Result<Option<String>, DbError> {
    let sql = format!("SELECT checksum FROM {LEDGER_TABLE} WHERE id = ?1");
    db.run(op, &sql, |conn| {
        conn.query_row(&sql, [id], |row| row.get(0)).optional()
    })
}

/// Records an applied migration.
///
/// A second insert for the same id fails with a `Duplicate`-kind error.
pub(crate) fn insert<X: Executor>(
    db: &X,
    entry: &AppliedMigration,
    op: &'static str,
) -> Result<(), DbError> {
    let sql = format!(
        "INSERT INTO {LEDGER_TABLE} (id, description, checksum, applied_at, duration_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)"
    );
    let duration_ms = i64::try_from(entry.duration_ms).unwrap_or(i64::MAX);
    db.run(op, &sql, |conn| {
        conn.execute(
            &sql,
            params![
                entry.id,
                entry.description,
                entry.checksum,
                entry.applied_at,
                duration_ms
            ],
        )
    })
    .map(|_| ())
}

/// Every recorded migration, oldest first.
pub(crate) fn entries<X: Executor>(
    db: &X,
    op: &'static str,
) -> Result<Vec<AppliedMigration>, DbError> {
    let sql = format!(
        "SELECT id, description, checksum, applied_at, duration_ms
         FROM {LEDGER_TABLE}
         ORDER BY applied_at ASC, rowid ASC"
    );
    db.run(op, &sql, |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], entry_from_row)?.collect();
        rows
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AppliedMigration> {
    let duration_ms: i64 = row.get(4)?;
    Ok(AppliedMigration {
        id: row.get(0)?,
        description: row.get(1)?,
        checksum: row.get(2)?,
        applied_at: row.get(3)?,
        duration_ms: u64::try_from(duration_ms).unwrap_or(0),
    })
}
