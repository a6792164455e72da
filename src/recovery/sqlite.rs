//! SQLite plumbing shared by the checkpoint manifest and the chunk
//! size cache.

use std::path::Path;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use crate::errors::SqliteContext;
use crate::errors::StoreError;

/// Schema of `manifest.sqlite3`.
///
/// A row in `manifest` with a `NULL` `file_ref` is a tombstone: the
/// dataset stopped existing as of that checkpoint.
pub(crate) fn manifest_migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE checkpoints ( \
             checkpoint_id INTEGER NOT NULL PRIMARY KEY CHECK (checkpoint_id > 0), \
             step_name TEXT NOT NULL, \
             created_at TEXT NOT NULL \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE manifest ( \
             checkpoint_id INTEGER NOT NULL \
             REFERENCES checkpoints (checkpoint_id) ON DELETE CASCADE, \
             dataset_name TEXT NOT NULL, \
             file_ref TEXT, \
             digest TEXT, \
             row_count INTEGER NOT NULL CHECK (row_count >= 0), \
             PRIMARY KEY (checkpoint_id, dataset_name), \
             CHECK ((file_ref IS NULL) = (digest IS NULL)) \
             ) STRICT",
        ),
    ])
}

/// Schema of the chunk size estimate cache.
pub(crate) fn cache_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE size_estimates ( \
         updated_at TEXT NOT NULL, \
         step_name TEXT NOT NULL, \
         dataset_name TEXT NOT NULL, \
         row_bucket INTEGER NOT NULL CHECK (row_bucket >= 0), \
         bytes_per_row REAL NOT NULL CHECK (bytes_per_row > 0), \
         PRIMARY KEY (step_name, dataset_name, row_bucket) \
         ) STRICT",
    )])
}

#[test]
fn manifest_migrations_valid() -> rusqlite_migration::Result<()> {
    manifest_migrations().validate()
}

#[test]
fn cache_migrations_valid() -> rusqlite_migration::Result<()> {
    cache_migrations().validate()
}

/// Open (creating if needed) a DB file, set our connection-level
/// pragmas and bring the schema up to date.
pub(crate) fn open_db(file: &Path, migrations: &Migrations) -> Result<Connection, StoreError> {
    let mut conn = Connection::open_with_flags(
        file,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .reraise(&format!("can't open DB at {file:?}"))?;

    conn.pragma_update(None, "foreign_keys", "ON")
        .reraise("can't enable foreign keys")?;
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")
        .reraise("can't enable WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")
        .reraise("can't set busy timeout")?;
    migrations.to_latest(&mut conn)?;
    Ok(conn)
}
