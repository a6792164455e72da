//! Durable checkpoints of the dataset pool.
//!
//! A store lives in a single directory:
//!
//! ```text
//! <dir>/manifest.sqlite3
//! <dir>/data/<dataset>.<checkpoint_id>.json
//! ```
//!
//! The manifest is the only source of truth. A commit first writes
//! every new data file under a temporary name, fsyncs it and renames
//! it into place; only then are the checkpoint row and its manifest
//! rows inserted in one transaction. A reader that consults the
//! manifest therefore sees checkpoint `k` completely or not at all.
//! Data files left behind by a commit that never reached the manifest
//! are removed the next time the store is opened.
//!
//! Datasets are versioned independently. A commit only writes a new
//! file for a dataset whose content digest differs from its latest
//! visible version; a dataset that disappeared gets a tombstone row.
//! Restoring checkpoint `k` takes, for every dataset, the latest
//! manifest row at or before `k`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Display;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde::Serialize;

use crate::codec;
use crate::errors::IoContext;
use crate::errors::SqliteContext;
use crate::errors::StoreError;
use crate::table::Datasets;

pub(crate) mod sqlite;

/// Whether `name` can name a dataset. Names become part of data file
/// names, so only ASCII letters, digits, `_` and `-` are allowed.
pub fn is_valid_dataset_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Strictly increasing label of a committed checkpoint. The first
/// checkpoint in a store is `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub u64);

impl Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Which checkpoint to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointRef {
    /// Latest checkpoint committed under this step name.
    Step(String),
    Id(CheckpointId),
    /// The most recent checkpoint.
    Last,
}

impl CheckpointRef {
    /// Parse a resume point as given on the command line. `_` means
    /// the last checkpoint.
    pub fn parse(s: &str) -> Self {
        if s == "_" {
            Self::Last
        } else {
            Self::Step(s.to_string())
        }
    }
}

impl Display for CheckpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step(name) => write!(f, "{name:?}"),
            Self::Id(id) => write!(f, "#{id}"),
            Self::Last => write!(f, "_"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id: CheckpointId,
    pub step_name: String,
    pub created_at: DateTime<Utc>,
}

struct ManifestEntry {
    dataset_name: String,
    file_ref: String,
    digest: String,
}

/// Checkpoint store rooted at a directory.
pub struct CheckpointStore {
    dir: PathBuf,
    conn: Connection,
    /// Digest of the latest visible version of each live dataset.
    visible: HashMap<String, String>,
}

impl CheckpointStore {
    pub const MANIFEST_FILE: &'static str = "manifest.sqlite3";
    pub const DATA_DIR: &'static str = "data";

    /// Open the store in `dir`, creating it if it doesn't exist.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let data_dir = dir.join(Self::DATA_DIR);
        fs::create_dir_all(&data_dir).reraise_at("can't create checkpoint dir", &data_dir)?;
        let conn = sqlite::open_db(&dir.join(Self::MANIFEST_FILE), &sqlite::manifest_migrations())?;

        let mut store = Self {
            dir: dir.to_path_buf(),
            conn,
            visible: HashMap::new(),
        };
        store.remove_orphans()?;
        store.refresh_visible()?;
        tracing::debug!(
            "Opened checkpoint store at {dir:?} with {} live datasets",
            store.visible.len()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, file_ref: &str) -> PathBuf {
        self.dir.join(Self::DATA_DIR).join(file_ref)
    }

    fn next_id(&self) -> Result<CheckpointId, StoreError> {
        let max: Option<u64> = self
            .conn
            .query_row("SELECT MAX(checkpoint_id) FROM checkpoints", (), |row| {
                row.get(0)
            })
            .reraise("can't read max checkpoint id")?;
        Ok(CheckpointId(max.unwrap_or(0) + 1))
    }

    /// Latest manifest row per dataset at or before `at`, tombstones
    /// included as `None`.
    fn live_entries(&self, at: CheckpointId) -> Result<Vec<(String, Option<ManifestEntry>)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "WITH latest AS ( \
                 SELECT dataset_name, MAX(checkpoint_id) AS checkpoint_id \
                 FROM manifest \
                 WHERE checkpoint_id <= ?1 \
                 GROUP BY dataset_name \
                 ) \
                 SELECT dataset_name, file_ref, digest \
                 FROM manifest \
                 JOIN latest USING (dataset_name, checkpoint_id) \
                 ORDER BY dataset_name",
            )
            .reraise("can't prepare manifest query")?;
        let rows = stmt
            .query_map((at.0,), |row| {
                let dataset_name: String = row.get(0)?;
                let file_ref: Option<String> = row.get(1)?;
                let digest: Option<String> = row.get(2)?;
                let entry = file_ref.zip(digest).map(|(file_ref, digest)| ManifestEntry {
                    dataset_name: dataset_name.clone(),
                    file_ref,
                    digest,
                });
                Ok((dataset_name, entry))
            })
            .reraise("can't query manifest")?;
        let entries = rows
            .collect::<Result<Vec<_>, _>>()
            .reraise("can't unpack manifest row")?;
        Ok(entries)
    }

    fn refresh_visible(&mut self) -> Result<(), StoreError> {
        self.visible = self
            .live_entries(CheckpointId(u64::MAX >> 1))?
            .into_iter()
            .filter_map(|(name, entry)| entry.map(|e| (name, e.digest)))
            .collect();
        Ok(())
    }

    /// Delete data files the manifest does not reference. These are
    /// temp files or renamed files of a commit that crashed before
    /// its transaction.
    fn remove_orphans(&self) -> Result<(), StoreError> {
        let referenced: HashSet<String> = {
            let mut stmt = self
                .conn
                .prepare("SELECT file_ref FROM manifest WHERE file_ref IS NOT NULL")
                .reraise("can't prepare file ref query")?;
            let refs = stmt
                .query_map((), |row| row.get(0))
                .reraise("can't query file refs")?;
            refs.collect::<Result<_, _>>().reraise("can't unpack file ref")?
        };

        let data_dir = self.dir.join(Self::DATA_DIR);
        for entry in fs::read_dir(&data_dir).reraise_at("can't list data dir", &data_dir)? {
            let path = entry.reraise_at("can't list data dir", &data_dir)?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !referenced.contains(name) {
                tracing::warn!("Removing orphaned checkpoint data file {path:?}");
                fs::remove_file(&path).reraise_at("can't remove orphaned data file", &path)?;
            }
        }
        Ok(())
    }

    /// Durably record the full dataset pool as a new checkpoint
    /// labeled with `step_name`.
    #[tracing::instrument(name = "checkpoint_commit", skip_all, fields(step = step_name))]
    pub fn commit(&mut self, step_name: &str, datasets: &Datasets) -> Result<CheckpointId, StoreError> {
        if let Some(bad) = datasets.keys().find(|name| !is_valid_dataset_name(name)) {
            return Err(StoreError::InvalidDatasetName(bad.clone()));
        }
        let id = self.next_id()?;

        // (dataset_name, file_ref, digest, row_count)
        let mut rows: Vec<(String, Option<String>, Option<String>, usize)> = Vec::new();
        let mut written = Vec::new();
        for (name, table) in datasets {
            let bytes = codec::encode(name, table)?;
            let digest = codec::digest(&bytes);
            if self.visible.get(name) == Some(&digest) {
                continue;
            }
            let file_ref = format!("{name}.{id}.json");
            let path = self.data_path(&file_ref);
            write_atomic(&path, &bytes)?;
            written.push(path);
            rows.push((name.clone(), Some(file_ref), Some(digest), table.len()));
        }
        for name in self.visible.keys() {
            if !datasets.contains_key(name) {
                tracing::debug!("Dataset {name:?} dropped as of checkpoint {id}");
                rows.push((name.clone(), None, None, 0));
            }
        }
        if !written.is_empty() {
            let data_dir = self.dir.join(Self::DATA_DIR);
            File::open(&data_dir)
                .and_then(|d| d.sync_all())
                .reraise_at("can't sync data dir", &data_dir)?;
        }

        let txn = self
            .conn
            .transaction()
            .reraise("can't start commit transaction")?;
        txn.execute(
            "INSERT INTO checkpoints (checkpoint_id, step_name, created_at) VALUES (?1, ?2, ?3)",
            (id.0, step_name, Utc::now().to_rfc3339()),
        )
        .reraise("can't insert checkpoint")?;
        for (dataset_name, file_ref, digest, row_count) in &rows {
            txn.execute(
                "INSERT INTO manifest (checkpoint_id, dataset_name, file_ref, digest, row_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id.0, dataset_name, file_ref, digest, row_count),
            )
            .reraise("can't insert manifest row")?;
        }
        txn.commit().reraise("can't commit checkpoint")?;

        for (dataset_name, _file_ref, digest, _row_count) in rows {
            match digest {
                Some(digest) => self.visible.insert(dataset_name, digest),
                None => self.visible.remove(&dataset_name),
            };
        }
        tracing::info!(
            "Committed checkpoint {id} after step {step_name:?}, {} data files written",
            written.len()
        );
        Ok(id)
    }

    /// Find a checkpoint without loading any data.
    pub fn resolve(&self, at: &CheckpointRef) -> Result<CheckpointInfo, StoreError> {
        let found = match at {
            CheckpointRef::Step(name) => self
                .query_info(
                    "SELECT checkpoint_id, step_name, created_at FROM checkpoints \
                     WHERE step_name = ?1 ORDER BY checkpoint_id DESC LIMIT 1",
                    (name,),
                )?,
            CheckpointRef::Id(id) => self.query_info(
                "SELECT checkpoint_id, step_name, created_at FROM checkpoints \
                 WHERE checkpoint_id = ?1",
                (id.0,),
            )?,
            CheckpointRef::Last => self.latest()?,
        };
        found.ok_or_else(|| StoreError::CheckpointNotFound(at.to_string()))
    }

    fn query_info<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<CheckpointInfo>, StoreError> {
        let raw: Option<(u64, String, String)> = self
            .conn
            .query_row(sql, params, |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .optional()
            .reraise("can't query checkpoints")?;
        raw.map(info_from_row).transpose()
    }

    /// Rebuild the complete dataset pool as of a checkpoint.
    #[tracing::instrument(name = "checkpoint_restore", skip_all, fields(at = %at))]
    pub fn restore(&self, at: &CheckpointRef) -> Result<(CheckpointInfo, Datasets), StoreError> {
        let info = self.resolve(at)?;
        let mut datasets = BTreeMap::new();
        for (name, entry) in self.live_entries(info.id)? {
            let Some(entry) = entry else {
                continue;
            };
            let path = self.data_path(&entry.file_ref);
            let bytes = fs::read(&path).reraise_at("can't read data file", &path)?;
            if codec::digest(&bytes) != entry.digest {
                return Err(StoreError::Corrupt {
                    dataset: entry.dataset_name,
                    path,
                });
            }
            datasets.insert(name.clone(), codec::decode(&name, &bytes)?);
        }
        tracing::info!(
            "Restored {} datasets from checkpoint {} ({:?})",
            datasets.len(),
            info.id,
            info.step_name
        );
        Ok((info, datasets))
    }

    pub fn latest(&self) -> Result<Option<CheckpointInfo>, StoreError> {
        self.query_info(
            "SELECT checkpoint_id, step_name, created_at FROM checkpoints \
             ORDER BY checkpoint_id DESC LIMIT 1",
            (),
        )
    }

    /// All checkpoints, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT checkpoint_id, step_name, created_at FROM checkpoints \
                 ORDER BY checkpoint_id",
            )
            .reraise("can't prepare checkpoint listing")?;
        let raw = stmt
            .query_map((), |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .reraise("can't list checkpoints")?
            .collect::<Result<Vec<(u64, String, String)>, _>>()
            .reraise("can't unpack checkpoint row")?;
        raw.into_iter().map(info_from_row).collect()
    }

    /// Forget every checkpoint after `id`, so a resumed run
    /// continues numbering from there.
    pub fn truncate_after(&mut self, id: CheckpointId) -> Result<(), StoreError> {
        let doomed: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT file_ref FROM manifest \
                     WHERE checkpoint_id > ?1 AND file_ref IS NOT NULL",
                )
                .reraise("can't prepare truncate query")?;
            let refs = stmt
                .query_map((id.0,), |row| row.get(0))
                .reraise("can't query truncated files")?;
            refs.collect::<Result<_, _>>()
                .reraise("can't unpack file ref")?
        };
        let removed = self
            .conn
            .execute("DELETE FROM checkpoints WHERE checkpoint_id > ?1", (id.0,))
            .reraise("can't truncate checkpoints")?;
        for file_ref in doomed {
            let path = self.data_path(&file_ref);
            fs::remove_file(&path).reraise_at("can't remove truncated data file", &path)?;
        }
        if removed > 0 {
            tracing::info!("Dropped {removed} checkpoints after {id}");
        }
        self.refresh_visible()
    }

    /// Drop all history.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.truncate_after(CheckpointId(0))
    }
}

fn info_from_row((id, step_name, created_at): (u64, String, String)) -> Result<CheckpointInfo, StoreError> {
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|err| StoreError::Sqlite {
            context: format!("bad created_at {created_at:?} in checkpoint {id}"),
            source: rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(err),
            ),
        })?
        .with_timezone(&Utc);
    Ok(CheckpointInfo {
        id: CheckpointId(id),
        step_name,
        created_at,
    })
}

/// Write a file so that it is either fully present under `path` or
/// not at all.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    let mut file = File::create(&tmp).reraise_at("can't create temp file", &tmp)?;
    file.write_all(bytes).reraise_at("can't write temp file", &tmp)?;
    file.sync_all().reraise_at("can't sync temp file", &tmp)?;
    fs::rename(&tmp, path).reraise_at("can't move temp file into place", path)?;
    Ok(())
}
