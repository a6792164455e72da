//! The worker side of a partitioned segment.
//!
//! The coordinator prepares a directory per worker holding an
//! [`WorkerAssignment`] and a checkpoint store seeded with the
//! worker's slice under the [`PARTITION_CHECKPOINT`] label. The worker
//! resumes from that checkpoint, runs the segment's steps, and leaves
//! a [`WorkerReport`] next to the assignment. Its final datasets stay
//! in its own store for the coordinator to gather.

use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tracing::instrument;

use crate::chunk::ChunkLog;
use crate::config::RunSettings;
use crate::errors::prepend_tname;
use crate::errors::report;
use crate::errors::EngineError;
use crate::errors::IoContext;
use crate::errors::StoreError;
use crate::execution::WorkerPartition;
use crate::recovery::write_atomic;
use crate::recovery::CheckpointStore;
use crate::scheduler::RunState;
use crate::scheduler::RunSummary;
use crate::scheduler::Scheduler;
use crate::scheduler::StepRegistry;

/// Label of the checkpoint a worker store is seeded with.
pub const PARTITION_CHECKPOINT: &str = "_partition";

const PIPELINE_DIR: &str = "pipeline";

fn write_json<T: Serialize>(path: &Path, what: &str, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Codec {
        what: what.to_string(),
        source,
    })?;
    write_atomic(path, &bytes)
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, StoreError> {
    let bytes = fs::read(path).reraise_at(&format!("can't read {what}"), path)?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Codec {
        what: what.to_string(),
        source,
    })
}

/// What one worker has to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub partition: WorkerPartition,
    /// Whole step list of the run; only `steps[start..end]` are run.
    pub steps: Vec<String>,
    pub start: usize,
    pub end: usize,
    pub settings: RunSettings,
}

impl WorkerAssignment {
    pub const FILE: &'static str = "assignment.json";

    pub fn worker(&self) -> usize {
        self.partition.worker
    }

    pub fn write(&self, dir: &Path) -> Result<(), StoreError> {
        write_json(&dir.join(Self::FILE), "worker assignment", self)
    }

    pub fn read(dir: &Path) -> Result<Self, StoreError> {
        read_json(&dir.join(Self::FILE), "worker assignment")
    }
}

/// How a worker's run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub ok: bool,
    /// Step that failed.
    pub step: Option<String>,
    pub message: Option<String>,
    pub chunk_log: ChunkLog,
}

impl WorkerReport {
    pub const FILE: &'static str = "report.json";

    pub fn write(&self, dir: &Path) -> Result<(), StoreError> {
        write_json(&dir.join(Self::FILE), "worker report", self)
    }

    pub fn read(dir: &Path) -> Result<Self, StoreError> {
        read_json(&dir.join(Self::FILE), "worker report")
    }
}

/// Checkpoint store of the worker using `dir`.
pub fn worker_store(dir: &Path) -> Result<CheckpointStore, StoreError> {
    CheckpointStore::open(&dir.join(PIPELINE_DIR))
}

/// Run the assignment in `dir` to completion.
///
/// Always leaves a report behind, also when failing.
#[instrument(name = "worker", skip_all, fields(dir = ?dir))]
pub fn worker_main(
    dir: &Path,
    registry: Arc<StepRegistry>,
    interrupt: Arc<AtomicBool>,
) -> Result<RunSummary, EngineError> {
    let assignment = WorkerAssignment::read(dir)?;
    let worker = assignment.worker();
    tracing::info!("Worker {worker} starting on {}", assignment.partition);

    let mut scheduler = None;
    let res = run_assignment(dir, &assignment, registry, interrupt, &mut scheduler);

    let outcome = match &res {
        Ok(summary) => WorkerReport {
            worker,
            ok: true,
            step: None,
            message: None,
            chunk_log: summary.chunk_log.clone(),
        },
        Err(err) => {
            let step = match err {
                EngineError::StepExecution { step, .. } => Some(step.clone()),
                _ => scheduler.as_ref().and_then(|s| match s.state() {
                    RunState::Running(i) | RunState::Failed(i) => assignment.steps.get(i).cloned(),
                    _ => None,
                }),
            };
            let message = prepend_tname(report(err));
            tracing::error!("Worker {worker} failed:\n{message}");
            WorkerReport {
                worker,
                ok: false,
                step,
                message: Some(message),
                chunk_log: ChunkLog::default(),
            }
        }
    };
    outcome.write(dir)?;
    res
}

fn run_assignment(
    dir: &Path,
    assignment: &WorkerAssignment,
    registry: Arc<StepRegistry>,
    interrupt: Arc<AtomicBool>,
    scheduler: &mut Option<Scheduler>,
) -> Result<RunSummary, EngineError> {
    let mut settings = assignment.settings.clone();
    settings.pipeline_dir = dir.join(PIPELINE_DIR);
    settings.resume_after = Some(PARTITION_CHECKPOINT.to_string());

    let store = worker_store(dir)?;
    let scheduler = scheduler.insert(
        Scheduler::new(registry, &settings, store)?
            .for_worker(assignment.worker())
            .with_interrupt(interrupt),
    );
    let first = scheduler.prepare(&assignment.steps, settings.resume_after.as_deref())?;
    for index in first.max(assignment.start)..assignment.end {
        scheduler.run_step(index)?;
    }
    scheduler.finish()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::PartitionRule;
    use crate::scheduler::StepSpec;
    use crate::table::Datasets;
    use crate::table::Table;

    fn prepare(dir: &Path, steps: &[&str]) -> WorkerAssignment {
        let households = Table::new(Some("household_id"), vec![1, 2]).unwrap();
        let datasets = Datasets::from([("households".to_string(), households)]);
        let mut store = worker_store(dir).unwrap();
        store.commit(PARTITION_CHECKPOINT, &datasets).unwrap();

        let assignment = WorkerAssignment {
            partition: WorkerPartition::compute(&[1, 2], 1, PartitionRule::Slice).remove(0),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            start: 0,
            end: steps.len(),
            settings: RunSettings {
                output_dir: dir.join("output"),
                ..Default::default()
            },
        };
        assignment.write(dir).unwrap();
        assignment
    }

    fn registry() -> Arc<StepRegistry> {
        let mut registry = StepRegistry::new();
        registry
            .register(
                StepSpec::new("double").reads(["households"]).writes(["doubled"]),
                |ctx| {
                    let ids: Vec<i64> = ctx.read("households")?.index().iter().map(|i| i * 2).collect();
                    ctx.write("doubled", Table::new(Some("doubled_id"), ids)?)?;
                    Ok(())
                },
            )
            .unwrap();
        registry
            .register(StepSpec::new("fail"), |_| Err("no good".into()))
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn assignment_round_trips() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let assignment = prepare(dir, &["double"]);
        assert_eq!(WorkerAssignment::read(dir).unwrap(), assignment);
    }

    #[test]
    fn runs_from_the_partition_checkpoint() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        prepare(dir, &["double"]);
        let summary = worker_main(dir, registry(), Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(summary.steps_run, vec!["double".to_string()]);

        let (info, datasets) = worker_store(dir)
            .unwrap()
            .restore(&crate::recovery::CheckpointRef::Last)
            .unwrap();
        assert_eq!(info.step_name, "double");
        assert_eq!(datasets["doubled"].index(), &[2, 4]);
        assert!(WorkerReport::read(dir).unwrap().ok);
    }

    #[test]
    fn failure_is_reported() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        prepare(dir, &["double", "fail"]);
        let err = worker_main(dir, registry(), Arc::new(AtomicBool::new(false))).unwrap_err();
        assert!(matches!(err, EngineError::StepExecution { worker: Some(0), .. }));

        let report = WorkerReport::read(dir).unwrap();
        assert!(!report.ok);
        assert_eq!(report.step.as_deref(), Some("fail"));
        assert!(report.message.unwrap().contains("no good"));
    }
}
