//! Loading migrations from a directory of `.sql` files.
//!
//! Each `*.sql` file is one migration. Its id is the file stem
//! (`001_users.sql` becomes `001_users`) and files are returned sorted by
//! file name, so zero-padded prefixes give the intended order. A first line
//! of the form `-- description: ...` becomes the migration's description.
//! The whole file, including that line, is the migration's SQL.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::migrations::Migration;

const DESCRIPTION_PREFIX: &str = "-- description:";

/// Errors raised while loading migration files.
#[derive(Debug, Error)]
pub enum DiscoverError {
    /// The directory or a file in it could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file name is not valid UTF-8 or has an empty stem.
    #[error("invalid migration file name: {}", path.display())]
    InvalidName { path: PathBuf },
}

/// Loads every `*.sql` file in `dir` as a migration, ordered by file name.
///
/// Subdirectories and files with other extensions are ignored.
pub fn discover(dir: impl AsRef<Path>) -> Result<Vec<Migration>, DiscoverError> {
    let dir = dir.as_ref();
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| DiscoverError::Io { path, source }
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    files.sort();

    let mut migrations = Vec::with_capacity(files.len());
    for path in files {
        let id = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) if !stem.is_empty() => stem.to_string(),
            _ => return Err(DiscoverError::InvalidName { path }),
        };
        let sql = fs::read_to_string(&path).map_err(io_err(&path))?;
        let description = description_of(&sql);
        migrations.push(Migration::new(id, description, sql));
    }

    tracing::debug!(
        dir = %dir.display(),
        count = migrations.len(),
        "discovered migration files"
    );
    Ok(migrations)
}

fn description_of(sql: &str) -> String {
    sql.lines()
        .next()
        .and_then(|line| line.trim().strip_prefix(DESCRIPTION_PREFIX))
        .map(|rest| rest.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_sql_files_sorted_by_name() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        fs::write(
            dir.path().join("002_posts.sql"),
            "CREATE TABLE posts (id INTEGER);",
        )
        .expect("should write file");
        fs::write(
            dir.path().join("001_users.sql"),
            "-- description: create users\nCREATE TABLE users (id INTEGER);",
        )
        .expect("should write file");
        fs::write(dir.path().join("README.md"), "not a migration").expect("should write file");
        fs::create_dir(dir.path().join("003_nested.sql")).expect("should create dir");

        let migrations = discover(dir.path()).expect("discovery should succeed");
        let ids: Vec<&str> = migrations.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["001_users", "002_posts"]);

        assert_eq!(migrations[0].description, "create users");
        assert!(migrations[0].sql.starts_with("-- description: create users\n"));
        assert_eq!(migrations[1].description, "");
    }

    #[test]
    fn empty_directory_yields_nothing() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        assert!(discover(dir.path()).expect("should succeed").is_empty());
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let err = discover(dir.path().join("absent")).expect_err("missing dir should fail");
        assert!(matches!(err, DiscoverError::Io { .. }));
        assert!(err.to_string().contains("absent"), "{err}");
    }

    #[test]
    fn description_requires_first_line() {
        assert_eq!(description_of("-- description:  spaced  \nSELECT 1;"), "spaced");
        assert_eq!(description_of("SELECT 1;\n-- description: late"), "");
        assert_eq!(description_of(""), "");
    }
}
