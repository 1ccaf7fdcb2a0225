//! Migration engine.
//!
//! Applies an ordered list of author-supplied SQL migrations exactly once
//! each, tracked by the ledger table (see [`crate::ledger`]). Migrations run
//! in the order given, not sorted. Each pending migration runs in its own
//! transaction together with its ledger insert, so a failure leaves neither
//! its schema changes nor its ledger entry behind and the run can simply be
//! repeated after the cause is fixed. Migrations applied earlier in the same
//! run stay committed.
//!
//! An already-applied migration whose SQL no longer hashes to the recorded
//! checksum aborts the run with a `ChecksumDrift` error.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::database::Database;
use crate::error::DbError;
use crate::executor::Executor;
use crate::ledger::{self, AppliedMigration};
use crate::tx::TxOptions;

/// A single migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Unique identifier chosen by the caller.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// One or more SQL statements. Must not manage transactions itself.
    pub sql: String,
}

impl Migration {
    /// Creates a migration.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            sql: sql.into(),
        }
    }

    /// Checksum of this migration's SQL.
    pub fn checksum(&self) -> String {
        ledger::checksum(&self.sql)
    }
}

/// Outcome of a [`Migrator::migrate`] call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationResult {
    /// Migrations applied by this call, in the order they were applied.
    pub applied: Vec<AppliedMigration>,
    /// Ids that were already applied, in input order.
    pub skipped: Vec<String>,
    /// Wall-clock time of the whole call.
    pub total_duration: Duration,
}

/// Status of one migration relative to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Migration identifier.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Checksum of the SQL supplied now.
    pub checksum: String,
    /// Whether the ledger has an entry for this id.
    pub applied: bool,
    /// Whether the recorded checksum matches. Only meaningful if `applied`.
    pub checksum_match: bool,
}

enum Outcome {
    Applied(AppliedMigration),
    AlreadyApplied,
}

/// Runs migrations against a [`Database`].
#[derive(Debug, Clone, Copy)]
pub struct Migrator<'a> {
    db: &'a Database,
}

impl<'a> Migrator<'a> {
    /// Creates a migrator. Cancellation follows `db`'s token.
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Applies every migration not yet recorded in the ledger.
    ///
    /// An empty list is a no-op apart from creating the ledger table.
    ///
    /// # Errors
    ///
    /// Stops at the first failure: `ChecksumDrift` for a changed migration,
    /// or the classified failure of the migration being applied
    /// (`Migrate.Apply` for its SQL, `Migrate.Record` for its ledger insert).
    /// Migrations applied before the failure remain applied.
    pub fn migrate(&self, migrations: &[Migration]) -> Result<MigrationResult, DbError> {
        let started = Instant::now();

        ledger::ensure_table(self.db, "Migrate.EnsureLedger")?;
        let recorded = ledger::checksums(self.db, "Migrate.GetApplied")?;

        let mut result = MigrationResult::default();
        for migration in migrations {
            let checksum = migration.checksum();

            if let Some(expected) = recorded.get(&migration.id) {
                verify_checksum(&migration.id, expected, &checksum)?;
                tracing::debug!(
                    migration = %migration.id,
                    "migration already applied, skipping"
                );
                result.skipped.push(migration.id.clone());
                continue;
            }

            match self.apply(migration, checksum)? {
                Outcome::Applied(entry) => result.applied.push(entry),
                Outcome::AlreadyApplied => result.skipped.push(migration.id.clone()),
            }
        }

        result.total_duration = started.elapsed();
        tracing::info!(
            applied = result.applied.len(),
            skipped = result.skipped.len(),
            duration_ms = result.total_duration.as_millis() as u64,
            "migration run complete"
        );
        Ok(result)
    }

    // The ledger is re-read inside the write transaction: BEGIN IMMEDIATE
    // holds the database write lock, so a concurrent migrator has either
    // committed this migration already or has not started it.
    fn apply(&self, migration: &Migration, checksum: String) -> Result<Outcome, DbError> {
        tracing::info!(migration = %migration.id, "applying migration");
        let started = Instant::now();

        self.db
            .run_in_transaction(TxOptions::serializable(), |tx| {
                if let Some(expected) = ledger::lookup(tx, &migration.id, "Migrate.GetApplied")? {
                    verify_checksum(&migration.id, &expected, &checksum)?;
                    tracing::info!(
                        migration = %migration.id,
                        "migration applied concurrently, skipping"
                    );
                    return Ok(Outcome::AlreadyApplied);
                }

                tx.run("Migrate.Apply", &migration.sql, |conn| {
                    conn.execute_batch(&migration.sql)
                })
                .map_err(|e| e.in_migration(&migration.id, &migration.sql))?;

                let entry = AppliedMigration {
                    id: migration.id.clone(),
                    description: migration.description.clone(),
                    checksum: checksum.clone(),
                    applied_at: Utc::now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                ledger::insert(tx, &entry, "Migrate.Record")?;

                Ok(Outcome::Applied(entry))
            })
            .inspect_err(|e| {
                tracing::error!(migration = %migration.id, error = %e, "migration failed");
            })
    }

    /// Reports each migration's state against the ledger.
    ///
    /// Read-only: neither the ledger nor its table is created or modified.
    pub fn status(&self, migrations: &[Migration]) -> Result<Vec<MigrationStatus>, DbError> {
        let recorded = if ledger::table_exists(self.db, "MigrationStatus")? {
            ledger::checksums(self.db, "MigrationStatus")?
        } else {
            HashMap::new()
        };

        Ok(migrations
            .iter()
            .map(|migration| {
                let checksum = migration.checksum();
                let recorded = recorded.get(&migration.id);
                MigrationStatus {
                    id: migration.id.clone(),
                    description: migration.description.clone(),
                    applied: recorded.is_some(),
                    checksum_match: recorded.is_some_and(|expected| *expected == checksum),
                    checksum,
                }
            })
            .collect())
    }

    /// Every migration recorded in the ledger, oldest first.
    pub fn list_applied(&self) -> Result<Vec<AppliedMigration>, DbError> {
        if !ledger::table_exists(self.db, "GetAppliedMigrations")? {
            return Ok(Vec::new());
        }
        ledger::entries(self.db, "GetAppliedMigrations")
    }
}

fn verify_checksum(id: &str, expected: &str, actual: &str) -> Result<(), DbError> {
    if expected != actual {
        tracing::error!(
            migration = id,
            expected,
            actual,
            "applied migration has changed"
        );
        return Err(DbError::ChecksumDrift {
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
