#![allow(dead_code)]

use cairn_db::{Database, DbRuntimeSettings, Executor};
use tempfile::TempDir;

/// Opens a file-backed database in a fresh temp dir.
///
/// In-memory databases are private to each pooled connection, so every test
/// that checks state across calls needs a real file.
pub fn open_db(pool_max_size: u32) -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("cairn.db");
    let db = Database::open(
        path.to_str().expect("temp path should be utf-8"),
        DbRuntimeSettings {
            pool_max_size,
            ..DbRuntimeSettings::default()
        },
    )
    .expect("failed to open database");
    (dir, db)
}

/// Opens a database with an `items` table.
pub fn db_with_items() -> (TempDir, Database) {
    let (dir, db) = open_db(4);
    db.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);")
        .expect("failed to create items table");
    (dir, db)
}

pub fn item_names(db: &impl Executor) -> Vec<String> {
    db.query_all("SELECT name FROM items ORDER BY id", [], |row| row.get(0))
        .expect("failed to read items")
}

pub fn table_exists(db: &impl Executor, name: &str) -> bool {
    db.exists(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
    )
    .expect("failed to query sqlite_master")
}

/// Every schema object as `(type, name, sql)`, in a stable order.
pub fn schema(db: &impl Executor) -> Vec<(String, String, Option<String>)> {
    db.query_all(
        "SELECT type, name, sql FROM sqlite_master ORDER BY type, name",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .expect("failed to read schema")
}
