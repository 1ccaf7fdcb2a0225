//! Command implementations for the `cairn` binary.
//!
//! Each command returns the text it would print, so the binary stays a thin
//! layer over argument parsing and logging setup.

pub mod config;

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use cairn_db::{
    discover, CancelToken, Database, DbError, DiscoverError, Migration, Migrator, PoolError,
};
use serde::Serialize;
use thiserror::Error;

use crate::config::{Config, ConfigError};

/// Errors surfaced by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Discover(#[from] DiscoverError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

/// What every command needs: an open database and where migrations live.
#[derive(Debug)]
pub struct Context {
    pub db: Database,
    pub migrations_dir: PathBuf,
    pub json: bool,
}

impl Context {
    /// Opens the configured database.
    ///
    /// With a `timeout`, every database call made by the command is
    /// abandoned once it elapses.
    pub fn open(config: &Config, timeout: Option<Duration>, json: bool) -> Result<Self, CliError> {
        let db = Database::open(&config.database.path, config.database.runtime_settings())?;
        let db = match timeout {
            Some(timeout) => db.with_cancel(CancelToken::with_timeout(timeout)),
            None => db,
        };
        Ok(Self {
            db,
            migrations_dir: PathBuf::from(&config.database.migrations_dir),
            json,
        })
    }

    fn migrations(&self) -> Result<Vec<Migration>, CliError> {
        Ok(discover(&self.migrations_dir)?)
    }

    fn render<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<String, CliError> {
        if self.json {
            Ok(serde_json::to_string_pretty(value)?)
        } else {
            Ok(text(value))
        }
    }
}

/// `cairn migrate`: applies pending migrations.
pub fn migrate(ctx: &Context) -> Result<String, CliError> {
    let migrations = ctx.migrations()?;
    let result = Migrator::new(&ctx.db).migrate(&migrations)?;

    ctx.render(&result, |result| {
        let mut out = String::new();
        for m in &result.applied {
            let _ = writeln!(out, "applied  {} ({} ms)", m.id, m.duration_ms);
        }
        let _ = write!(
            out,
            "{} applied, {} already applied in {} ms",
            result.applied.len(),
            result.skipped.len(),
            result.total_duration.as_millis()
        );
        out
    })
}

/// `cairn status`: compares migration files against the ledger.
pub fn status(ctx: &Context) -> Result<String, CliError> {
    let migrations = ctx.migrations()?;
    let status = Migrator::new(&ctx.db).status(&migrations)?;

    ctx.render(&status, |status| {
        if status.is_empty() {
            return "no migrations found".to_string();
        }
        status
            .iter()
            .map(|s| {
                let state = match (s.applied, s.checksum_match) {
                    (true, true) => "applied",
                    (true, false) => "CHANGED",
                    (false, _) => "pending",
                };
                format!("{state:<8} {}  {}", s.id, s.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

/// `cairn applied`: lists the ledger.
pub fn applied(ctx: &Context) -> Result<String, CliError> {
    let applied = Migrator::new(&ctx.db).list_applied()?;

    ctx.render(&applied, |applied| {
        if applied.is_empty() {
            return "no migrations applied".to_string();
        }
        applied
            .iter()
            .map(|m| {
                format!(
                    "{}  {}  {}  {}",
                    m.applied_at.format("%Y-%m-%d %H:%M:%S"),
                    m.id,
                    &m.checksum[..m.checksum.len().min(12)],
                    m.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

/// `cairn health`: pings the database. Returns whether it is healthy.
pub fn health(ctx: &Context) -> Result<(bool, String), CliError> {
    let status = ctx.db.health();
    let out = ctx.render(&status, |status| match &status.error {
        None => format!(
            "healthy ({} us, {}/{} connections idle, max {})",
            status.latency.as_micros(),
            status.pool.idle_connections,
            status.pool.connections,
            status.pool.max_size
        ),
        Some(error) => format!("unhealthy: {error}"),
    })?;
    Ok((status.is_healthy(), out))
}
