//! Learned per-row memory costs, persisted across runs.

use std::fs;
use std::path::Path;

use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;

use crate::errors::IoContext;
use crate::errors::SqliteContext;
use crate::errors::StoreError;
use crate::recovery::sqlite;

/// Bytes-per-row estimates keyed by step, dataset and a bucket of
/// the row count (its bit length), so a run over a similar number of
/// rows finds a close estimate.
pub struct SizeEstimateCache {
    conn: Connection,
}

/// Number of bits needed to write the row count.
pub(crate) fn row_bucket(rows: usize) -> u32 {
    usize::BITS - rows.leading_zeros()
}

impl SizeEstimateCache {
    pub fn open(file: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir).reraise_at("can't create cache dir", dir)?;
        }
        let conn = sqlite::open_db(file, &sqlite::cache_migrations())?;
        Ok(Self { conn })
    }

    /// Estimate from the nearest row bucket, preferring the larger
    /// bucket on ties.
    pub fn get(&self, step: &str, dataset: &str, rows: usize) -> Result<Option<f64>, StoreError> {
        self.conn
            .query_row(
                "SELECT bytes_per_row FROM size_estimates \
                 WHERE step_name = ?1 AND dataset_name = ?2 \
                 ORDER BY ABS(row_bucket - ?3), row_bucket DESC \
                 LIMIT 1",
                (step, dataset, row_bucket(rows)),
                |row| row.get(0),
            )
            .optional()
            .reraise("can't read size estimate")
    }

    pub fn put(&self, step: &str, dataset: &str, rows: usize, bytes_per_row: f64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO size_estimates (updated_at, step_name, dataset_name, row_bucket, bytes_per_row) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (step_name, dataset_name, row_bucket) DO UPDATE \
                 SET updated_at = EXCLUDED.updated_at, bytes_per_row = EXCLUDED.bytes_per_row",
                (Utc::now().to_rfc3339(), step, dataset, row_bucket(rows), bytes_per_row),
            )
            .reraise("can't write size estimate")?;
        Ok(())
    }
}

#[test]
fn buckets_by_bit_length() {
    assert_eq!(row_bucket(0), 0);
    assert_eq!(row_bucket(1), 1);
    assert_eq!(row_bucket(1000), 10);
    assert_eq!(row_bucket(1024), 11);
}

#[test]
fn nearest_bucket_wins() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let cache = SizeEstimateCache::open(&dir.join("nested").join("cache.sqlite3")).unwrap();
    assert_eq!(cache.get("s", "persons", 1000).unwrap(), None);

    cache.put("s", "persons", 100, 10.0).unwrap();
    cache.put("s", "persons", 100_000, 20.0).unwrap();
    cache.put("other", "persons", 1000, 99.0).unwrap();

    assert_eq!(cache.get("s", "persons", 120).unwrap(), Some(10.0));
    assert_eq!(cache.get("s", "persons", 50_000).unwrap(), Some(20.0));

    cache.put("s", "persons", 120, 11.0).unwrap();
    assert_eq!(cache.get("s", "persons", 100).unwrap(), Some(11.0));
}
