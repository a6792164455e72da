//! Error types for every layer of the engine.
//!
//! Each subsystem has its own enum; [`EngineError`] folds them
//! together and is what the public entry points return. Nothing is
//! ever retried, so errors carry enough context (step, worker, path)
//! to diagnose the failure from the message alone.

use std::panic::Location;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::table::EntityId;

/// What a step body may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("duplicate index value {id}")]
    DuplicateIndex { id: EntityId },
    #[error("column {column:?} has {found} values but the index has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("column '{column}' not in dataset")]
    ColumnMissing { column: String },
    #[error("column {column:?} is {found}, expected {expected}")]
    ColumnType {
        column: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("can't concat tables with different schemas: {0}")]
    SchemaMismatch(String),
    #[error("nothing to concat")]
    NothingToConcat,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context} at {path:?}")]
    Io {
        context: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("can't migrate database")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("can't (de)serialize {what}")]
    Codec {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("data file {path:?} of dataset {dataset:?} does not match its manifest digest")]
    Corrupt { dataset: String, path: PathBuf },
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),
    #[error("invalid dataset name {0:?}; use ASCII letters, digits, '_' and '-'")]
    InvalidDatasetName(String),
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown step {0:?}; it is not in the step registry")]
    UnknownStep(String),
    #[error("step {0:?} is registered twice")]
    DuplicateStep(String),
    #[error("step {step:?} is misdeclared: {reason}")]
    InvalidStep { step: String, reason: String },
    #[error("resume point {0:?} is not in the checkpoint history")]
    UnknownResumePoint(String),
    #[error("invalid setting `{key}`: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
    #[error("population dataset {0:?} does not exist when partitioning")]
    MissingPopulation(String),
    #[error("can't load settings")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Error)]
pub enum ChunkPlanError {
    #[error("can't plan chunks for step {step:?}: dataset {dataset:?} has no rows")]
    EmptyDataset { step: String, dataset: String },
    #[error("{chunks} chunks over {rows} rows in step {step:?} would leave empty chunks")]
    InvalidChunkPlan {
        step: String,
        rows: usize,
        chunks: usize,
    },
    #[error("no trained chunk size for step {step:?} on dataset {dataset:?}")]
    MissingTrainedPlan { step: String, dataset: String },
    #[error("size estimate cache")]
    Cache(#[source] StoreError),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// A step body touched a dataset outside its declared sets.
#[derive(Debug, Clone, Error)]
pub enum StepContractError {
    #[error("step {step:?} read {dataset:?} which is not in its declared reads")]
    UndeclaredRead { step: String, dataset: String },
    #[error("step {step:?} wrote {dataset:?} which is not in its declared writes")]
    UndeclaredWrite { step: String, dataset: String },
    #[error("dataset {0:?} does not exist")]
    MissingDataset(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("step {step:?} failed{} after {elapsed:.3?} (all steps until this error)", on_worker(.worker))]
    StepExecution {
        step: String,
        elapsed: Duration,
        worker: Option<usize>,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    ChunkPlan(#[from] ChunkPlanError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entity {id} of dataset {dataset:?} was produced by both worker {} and worker {}", .workers.0, .workers.1)]
    PartitionOverlap {
        dataset: String,
        id: EntityId,
        workers: (usize, usize),
    },
    #[error("broadcast dataset {dataset:?} differs between worker {} and worker {}", .workers.0, .workers.1)]
    BroadcastDiverged {
        dataset: String,
        workers: (usize, usize),
    },
    #[error("worker {worker} ({partition}) failed in step {}: {message}", .step.as_deref().unwrap_or("<startup>"))]
    WorkerFailed {
        worker: usize,
        partition: String,
        step: Option<String>,
        message: String,
    },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("run interrupted")]
    Interrupted,
    #[error("can't set up {what}: {message}")]
    Setup { what: &'static str, message: String },
}

fn on_worker(worker: &Option<usize>) -> String {
    worker.map(|w| format!(" on worker {w}")).unwrap_or_default()
}

/// Attach call-site context to SQLite errors.
pub(crate) trait SqliteContext<T> {
    fn reraise(self, msg: &str) -> Result<T, StoreError>;
}

impl<T> SqliteContext<T> for rusqlite::Result<T> {
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T, StoreError> {
        let caller = Location::caller();
        self.map_err(|source| StoreError::Sqlite {
            context: prepend_caller(caller, msg),
            source,
        })
    }
}

/// Attach call-site and path context to IO errors.
pub(crate) trait IoContext<T> {
    fn reraise_at(self, msg: &str, path: &Path) -> Result<T, StoreError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    #[track_caller]
    fn reraise_at(self, msg: &str, path: &Path) -> Result<T, StoreError> {
        let caller = Location::caller();
        self.map_err(|source| StoreError::Io {
            context: prepend_caller(caller, msg),
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

/// Render an error and its whole source chain.
pub fn report(err: &(dyn std::error::Error + 'static)) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(&format!("\nCaused by => {cause}"));
        source = cause.source();
    }
    msg
}

#[test]
fn reraise_records_caller() {
    let res: rusqlite::Result<()> = Err(rusqlite::Error::InvalidQuery);
    let err = res.reraise("can't frob").unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("(src/errors.rs:"), "{msg}");
    assert!(msg.ends_with(") can't frob"), "{msg}");
}

#[test]
fn report_walks_sources() {
    let err = EngineError::StepExecution {
        step: "tours".into(),
        elapsed: Duration::from_millis(1500),
        worker: Some(2),
        source: "boom".into(),
    };
    let msg = report(&err);
    assert!(msg.starts_with("step \"tours\" failed on worker 2 after 1.500s"), "{msg}");
    assert!(msg.ends_with("Caused by => boom"), "{msg}");
}

#[test]
fn tname_prefixes_each_line() {
    let out = std::thread::Builder::new()
        .name("w0".into())
        .spawn(|| prepend_tname("a\nb".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(out, "<w0> a\n<w0> b\n");
}
