//! Database health probe.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::database::Database;

/// Pool occupancy at the time of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured maximum number of connections.
    pub max_size: u32,
    /// Connections currently open, idle or in use.
    pub connections: u32,
    /// Open connections not checked out.
    pub idle_connections: u32,
}

/// Result of [`Database::health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Round-trip time of the probe query.
    pub latency: Duration,
    /// Why the probe failed, if it did.
    pub error: Option<String>,
    pub pool: PoolStats,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

impl Database {
    /// Pings the database and reports pool occupancy.
    ///
    /// Never fails: a failed probe is reported as an unhealthy status.
    pub fn health(&self) -> HealthStatus {
        let started = Instant::now();
        let probe = self.ping();
        let latency = started.elapsed();

        let state = self.pool().state();
        let pool = PoolStats {
            max_size: self.pool().max_size(),
            connections: state.connections,
            idle_connections: state.idle_connections,
        };

        match probe {
            Ok(()) => HealthStatus {
                healthy: true,
                latency,
                error: None,
                pool,
            },
            Err(e) => {
                tracing::warn!(error = %e, "database health check failed");
                HealthStatus {
                    healthy: false,
                    latency,
                    error: Some(e.to_string()),
                    pool,
                }
            }
        }
    }

    /// Shorthand for `self.health().is_healthy()`.
    pub fn is_healthy(&self) -> bool {
        self.health().is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use crate::{CancelToken, Database, DbRuntimeSettings};

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("health.db");
        let db = Database::open(
            path.to_str().expect("temp path should be utf-8"),
            DbRuntimeSettings {
                pool_max_size: 3,
                ..DbRuntimeSettings::default()
            },
        )
        .expect("should open database");
        (dir, db)
    }

    #[test]
    fn healthy_database_reports_pool_stats() {
        let (_dir, db) = test_db();
        let status = db.health();

        assert!(status.is_healthy());
        assert!(status.error.is_none());
        assert_eq!(status.pool.max_size, 3);
        assert!(status.pool.connections >= 1);
        assert!(status.pool.idle_connections <= status.pool.connections);
        assert!(db.is_healthy());
    }

    #[test]
    fn cancelled_handle_is_unhealthy() {
        let (_dir, db) = test_db();
        let cancel = CancelToken::new();
        cancel.cancel();

        let status = db.with_cancel(cancel).health();
        assert!(!status.is_healthy());
        assert!(status
            .error
            .as_deref()
            .is_some_and(|e| e.contains("cancelled")));
    }

    #[test]
    fn status_serializes() {
        let (_dir, db) = test_db();
        let json = serde_json::to_value(db.health()).expect("should serialize");
        assert_eq!(json["healthy"], true);
        assert_eq!(json["pool"]["max_size"], 3);
    }
}
