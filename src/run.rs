//! Entry points for running a pipeline.
//!
//! [`cli_main`] is what a simulation binary calls: it parses flags,
//! sets up logging and metrics and calls [`run_main`], unless the
//! process was started as a worker by a [`ProcessLauncher`], in which
//! case it runs [`worker_main`] instead.
//!
//! [`run_main`] picks single process execution when one worker is
//! configured and [`run_multiprocess`] otherwise. Both stop at the next
//! step or chunk boundary on Ctrl-C or SIGTERM.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use tokio::runtime::Runtime;

use crate::chunk::ChunkLog;
use crate::config::RunArgs;
use crate::config::RunSettings;
use crate::errors::report;
use crate::errors::EngineError;
use crate::errors::IoContext;
use crate::execution::gather;
use crate::execution::segments;
use crate::execution::ProcessLauncher;
use crate::execution::Segment;
use crate::execution::SlicePlan;
use crate::execution::ThreadLauncher;
use crate::execution::WorkerHandle;
use crate::execution::WorkerLauncher;
use crate::execution::WorkerPartition;
use crate::execution::WORKER_DIR_ENV;
use crate::logging;
use crate::memory::consolidate_memory_logs;
use crate::memory::MemorySampler;
use crate::memory::MEMORY_PROFILE_FILE;
use crate::memory::SAMPLE_INTERVAL;
use crate::metrics::initialize_metrics;
use crate::metrics::write_snapshot;
use crate::recovery::CheckpointRef;
use crate::recovery::CheckpointStore;
use crate::scheduler::RunSummary;
use crate::scheduler::Scheduler;
use crate::scheduler::StepRegistry;
use crate::table::Datasets;
use crate::worker::worker_main;
use crate::worker::worker_store;
use crate::worker::WorkerAssignment;
use crate::worker::WorkerReport;
use crate::worker::PARTITION_CHECKPOINT;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Start a small tokio runtime that flips `flag` on Ctrl-C or
/// SIGTERM. Keep the runtime around for as long as the run lasts.
fn watch_interrupts(flag: Arc<AtomicBool>) -> Result<Runtime, EngineError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("simrun-signals")
        .enable_all()
        .build()
        .map_err(|err| EngineError::Setup {
            what: "signal handler",
            message: err.to_string(),
        })?;
    rt.spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Interrupt received; stopping at the next step or chunk");
        flag.store(true, Ordering::Relaxed);
    });
    Ok(rt)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Can't listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("Can't listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Run `steps` as configured by `settings`, blocking until done.
///
/// Writes the chunk summary and a metrics snapshot to the output
/// directory at the end of a successful run.
pub fn run_main(
    registry: Arc<StepRegistry>,
    steps: &[String],
    settings: &RunSettings,
) -> Result<RunSummary, EngineError> {
    settings.validate()?;
    registry.validate(steps)?;
    let interrupt = Arc::new(AtomicBool::new(false));
    let _signals = watch_interrupts(Arc::clone(&interrupt))?;

    let summary = if settings.num_workers > 1 {
        let launcher: Box<dyn WorkerLauncher> = if settings.fast {
            Box::new(ThreadLauncher::new(Arc::clone(&registry)))
        } else {
            Box::new(ProcessLauncher)
        };
        run_multiprocess(registry, steps, settings, launcher.as_ref(), interrupt)?
    } else {
        tracing::info!("Running {} steps in a single process", steps.len());
        let _sampler = if settings.memory_profile {
            let dir = &settings.output_dir;
            fs::create_dir_all(dir).reraise_at("can't create output dir", dir)?;
            Some(MemorySampler::start(&dir.join(MEMORY_PROFILE_FILE), SAMPLE_INTERVAL)?)
        } else {
            None
        };
        let store = CheckpointStore::open(&settings.pipeline_dir)?;
        Scheduler::new(registry, settings, store)?
            .with_interrupt(interrupt)
            .run(steps, settings.resume_after.as_deref())?
    };

    finish_run(&summary, settings)?;
    Ok(summary)
}

fn finish_run(summary: &RunSummary, settings: &RunSettings) -> Result<(), EngineError> {
    summary.chunk_log.log_summary();
    if !summary.chunk_log.is_empty() {
        summary.chunk_log.write_json(&settings.output_dir)?;
    }
    write_snapshot(&settings.output_dir.join("metrics.prom"))?;
    if settings.memory_profile {
        match consolidate_memory_logs(&settings.output_dir)? {
            Some(hwm) => tracing::info!(
                "Memory high water mark: {} bytes after step {:?} in process {}",
                hwm.bytes,
                hwm.step,
                hwm.process
            ),
            None => tracing::info!("No memory readings were logged"),
        }
    }
    if settings.cleanup_pipeline_after_run {
        let dir = &settings.pipeline_dir;
        tracing::info!("Removing checkpoint store at {dir:?}");
        fs::remove_dir_all(dir).reraise_at("can't remove checkpoint store", dir)?;
    }
    tracing::info!(
        "Run finished in {:.3?} after {} steps",
        summary.elapsed,
        summary.steps_run.len()
    );
    Ok(())
}

/// Run `steps` with partitioned segments spread over
/// `settings.num_workers` workers started by `launcher`.
///
/// Only checkpoints the coordinator commits (after a coalesce step or
/// after gathering a partitioned segment) can be resumed from.
#[tracing::instrument(name = "coordinator", skip_all, fields(workers = settings.num_workers))]
pub fn run_multiprocess(
    registry: Arc<StepRegistry>,
    steps: &[String],
    settings: &RunSettings,
    launcher: &dyn WorkerLauncher,
    interrupt: Arc<AtomicBool>,
) -> Result<RunSummary, EngineError> {
    let store = CheckpointStore::open(&settings.pipeline_dir)?;
    let mut coordinator =
        Scheduler::new(Arc::clone(&registry), settings, store)?.with_interrupt(Arc::clone(&interrupt));
    let start = coordinator.prepare(steps, settings.resume_after.as_deref())?;

    for segment in segments(steps, start, &registry)? {
        match segment {
            Segment::Coalesce(index) => {
                tracing::info!("Running coalesce step {:?}", steps[index]);
                coordinator.run_step(index)?;
            }
            Segment::Partitioned(range) => {
                let first = range.start;
                let started = Instant::now();
                let res = run_segment(&coordinator, steps, range.clone(), settings, launcher, &interrupt)
                    .and_then(|(datasets, log)| {
                        coordinator.replace_datasets(datasets);
                        coordinator.merge_chunk_log(&log);
                        coordinator.commit_segment(range, started.elapsed())
                    });
                if let Err(err) = res {
                    return Err(coordinator.fail(first, err));
                }
            }
        }
    }
    coordinator.finish()
}

/// Prepare worker directories, launch the workers and wait for all of
/// them. Returns the gathered datasets and merged chunk log.
fn run_segment(
    coordinator: &Scheduler,
    steps: &[String],
    range: std::ops::Range<usize>,
    settings: &RunSettings,
    launcher: &dyn WorkerLauncher,
    interrupt: &AtomicBool,
) -> Result<(Datasets, ChunkLog), EngineError> {
    let span = tracing::info_span!("segment", first = steps[range.start].as_str(), len = range.len());
    let _guard = span.enter();

    let datasets = coordinator.datasets();
    let plan = SlicePlan::new(datasets, &settings.population)?;
    let population = datasets
        .get(&settings.population)
        .map(|t| t.index().to_vec())
        .unwrap_or_default();
    let partitions = WorkerPartition::compute(&population, settings.num_workers, settings.partition_rule);

    let root = settings.workers_dir();
    let mut dirs = Vec::with_capacity(partitions.len());
    for partition in &partitions {
        let dir = root.join(format!("w{}", partition.worker));
        if dir.exists() {
            fs::remove_dir_all(&dir).reraise_at("can't clear worker dir", &dir)?;
        }
        fs::create_dir_all(&dir).reraise_at("can't create worker dir", &dir)?;
        let mut store = worker_store(&dir)?;
        store.commit(PARTITION_CHECKPOINT, &plan.slice(datasets, partition)?)?;
        WorkerAssignment {
            partition: partition.clone(),
            steps: steps.to_vec(),
            start: range.start,
            end: range.end,
            settings: settings.clone(),
        }
        .write(&dir)?;
        dirs.push(dir);
    }

    tracing::info!(
        "Running steps {:?} on {} workers",
        &steps[range.clone()],
        partitions.len()
    );
    let mut handles = Vec::with_capacity(dirs.len());
    for (worker, dir) in dirs.iter().enumerate() {
        match launcher.launch(worker, dir) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                terminate_all(&mut handles);
                return Err(err);
            }
        }
    }
    wait_all(&mut handles, &partitions, &dirs, interrupt)?;

    let mut parts = Vec::with_capacity(dirs.len());
    let mut chunk_log = ChunkLog::default();
    for dir in &dirs {
        let (_, part) = worker_store(dir)?.restore(&CheckpointRef::Last)?;
        parts.push(part);
        if let Ok(report) = WorkerReport::read(dir) {
            chunk_log.merge(&report.chunk_log);
        }
    }
    let merged = gather(parts, &plan.broadcast())?;
    Ok((merged, chunk_log))
}

fn terminate_all(handles: &mut [Box<dyn WorkerHandle>]) {
    for handle in handles.iter_mut() {
        handle.terminate();
    }
}

/// Block until every worker succeeded, or fail as soon as one worker
/// does, terminating the rest.
fn wait_all(
    handles: &mut [Box<dyn WorkerHandle>],
    partitions: &[WorkerPartition],
    dirs: &[PathBuf],
    interrupt: &AtomicBool,
) -> Result<(), EngineError> {
    let mut done = vec![false; handles.len()];
    loop {
        if interrupt.load(Ordering::Relaxed) {
            terminate_all(handles);
            return Err(EngineError::Interrupted);
        }
        let mut failure = None;
        for (worker, handle) in handles.iter_mut().enumerate() {
            if done[worker] {
                continue;
            }
            match handle.try_wait() {
                Ok(None) => {}
                Ok(Some(true)) => {
                    tracing::info!("Worker {worker} finished");
                    done[worker] = true;
                }
                Ok(Some(false)) => {
                    failure = Some(worker_failed(worker, &partitions[worker], &dirs[worker]));
                    break;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            terminate_all(handles);
            return Err(err);
        }
        if done.iter().all(|d| *d) {
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn worker_failed(worker: usize, partition: &WorkerPartition, dir: &Path) -> EngineError {
    let (step, message) = match WorkerReport::read(dir) {
        Ok(filed) => (
            filed.step,
            filed.message.unwrap_or_else(|| "no message".to_string()),
        ),
        Err(err) => (None, format!("exited without a report: {}", report(&err))),
    };
    EngineError::WorkerFailed {
        worker,
        partition: partition.to_string(),
        step,
        message,
    }
}

/// Main function of a simulation binary.
///
/// Parses [`RunArgs`] from the command line, or runs a worker when
/// started by [`ProcessLauncher`].
pub fn cli_main(registry: StepRegistry, steps: &[String]) -> Result<RunSummary, EngineError> {
    let registry = Arc::new(registry);
    if let Ok(dir) = std::env::var(WORKER_DIR_ENV) {
        let dir = PathBuf::from(dir);
        let assignment = WorkerAssignment::read(&dir)?;
        logging::setup(&assignment.settings.log_level)?;
        let interrupt = Arc::new(AtomicBool::new(false));
        let _signals = watch_interrupts(Arc::clone(&interrupt))?;
        return worker_main(&dir, registry, interrupt);
    }

    let settings = RunArgs::parse().resolve()?;
    logging::setup(&settings.log_level)?;
    initialize_metrics()?;
    run_main(registry, steps, &settings)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::scheduler::tests::toy_registry;
    use crate::scheduler::tests::toy_settings;
    use crate::scheduler::tests::toy_steps;
    use crate::scheduler::ChunkTarget;
    use crate::scheduler::StepSpec;
    use crate::table::Column;
    use crate::table::Table;

    fn by_household() -> ChunkTarget {
        ChunkTarget::over("persons").grouped_by("household_id")
    }

    fn single(registry: StepRegistry, settings: &RunSettings, steps: &[String]) -> Datasets {
        let store = CheckpointStore::open(&settings.pipeline_dir).unwrap();
        let mut sched = Scheduler::new(Arc::new(registry), settings, store).unwrap();
        sched.run(steps, None).unwrap();
        sched.datasets().clone()
    }

    fn multi(
        registry: StepRegistry,
        settings: &RunSettings,
        steps: &[String],
    ) -> Result<RunSummary, EngineError> {
        let registry = Arc::new(registry);
        let launcher = ThreadLauncher::new(Arc::clone(&registry));
        run_multiprocess(registry, steps, settings, &launcher, Arc::new(AtomicBool::new(false)))
    }

    fn restore_last(settings: &RunSettings) -> Datasets {
        CheckpointStore::open(&settings.pipeline_dir)
            .unwrap()
            .restore(&CheckpointRef::Last)
            .unwrap()
            .1
    }

    #[test]
    fn partitioned_matches_single_process() {
        let single_dir = tempdir().unwrap();
        let expected = single(
            toy_registry(by_household()),
            &toy_settings(single_dir.path()),
            &toy_steps(),
        );

        let tmp = tempdir().unwrap();
        let mut settings = toy_settings(tmp.path());
        settings.num_workers = 3;
        let summary = multi(toy_registry(by_household()), &settings, &toy_steps()).unwrap();
        assert_eq!(summary.steps_run, toy_steps());
        assert_eq!(restore_last(&settings), expected);

        // Only coordinator checkpoints are in the global store.
        let labels: Vec<String> = CheckpointStore::open(&settings.pipeline_dir)
            .unwrap()
            .list_checkpoints()
            .unwrap()
            .into_iter()
            .map(|c| c.step_name)
            .collect();
        assert_eq!(labels, vec!["households", "tours", "summary"]);
        assert!(settings.output_dir.join("timing_log.w2.csv").exists());
    }

    #[test]
    fn worker_timing_logs_span_segments() {
        let mut registry = toy_registry(by_household());
        registry
            .register(StepSpec::new("midpoint").coalesce(), |_ctx| Ok(()))
            .unwrap();
        let tmp = tempdir().unwrap();
        let mut settings = toy_settings(tmp.path());
        settings.num_workers = 2;
        let steps: Vec<String> = ["households", "persons", "midpoint", "tours", "summary"]
            .into_iter()
            .map(String::from)
            .collect();
        multi(registry, &settings, &steps).unwrap();

        for worker in 0..2 {
            let log = fs::read_to_string(settings.output_dir.join(format!("timing_log.w{worker}.csv"))).unwrap();
            let logged: Vec<&str> = log.lines().filter_map(|l| l.split(',').next()).collect();
            assert_eq!(logged, vec!["step_name", "persons", "tours"], "{log}");
        }
    }

    #[test]
    fn resume_from_gathered_checkpoint() {
        let tmp = tempdir().unwrap();
        let mut settings = toy_settings(tmp.path());
        settings.num_workers = 2;
        multi(toy_registry(by_household()), &settings, &toy_steps()).unwrap();
        let expected = restore_last(&settings);

        settings.resume_after = Some("tours".to_string());
        let summary = multi(toy_registry(by_household()), &settings, &toy_steps()).unwrap();
        assert_eq!(summary.steps_run, vec!["summary".to_string()]);
        assert_eq!(restore_last(&settings), expected);

        // Worker checkpoints aren't resumable.
        settings.resume_after = Some("persons".to_string());
        assert!(matches!(
            multi(toy_registry(by_household()), &settings, &toy_steps()),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn overlapping_ids_are_rejected() {
        let mut registry = toy_registry(by_household());
        registry
            .register(StepSpec::new("stats").writes(["stats"]), |ctx| {
                ctx.write("stats", Table::new(Some("stat_id"), vec![1])?)?;
                Ok(())
            })
            .unwrap();
        let tmp = tempdir().unwrap();
        let mut settings = toy_settings(tmp.path());
        settings.num_workers = 2;
        let steps: Vec<String> = ["households", "persons", "stats"]
            .into_iter()
            .map(String::from)
            .collect();

        let err = multi(registry, &settings, &steps).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PartitionOverlap { ref dataset, id: 1, workers: (0, 1) } if dataset == "stats"
        ));
    }

    #[test]
    fn workers_must_agree_on_broadcast_datasets() {
        let mut registry = toy_registry(by_household());
        registry
            .register(StepSpec::new("zones").writes(["land_use"]).coalesce(), |ctx| {
                ctx.write("land_use", Table::new(Some("zone_id"), vec![1, 2])?)?;
                Ok(())
            })
            .unwrap();
        registry
            .register(
                StepSpec::new("stamp").reads(["land_use"]).writes(["land_use"]),
                |ctx| {
                    let worker = ctx.worker().unwrap_or_default() as i64;
                    let stamped = ctx
                        .read("land_use")?
                        .clone()
                        .with_column("n", Column::Int(vec![worker; 2]))?;
                    ctx.write("land_use", stamped)?;
                    Ok(())
                },
            )
            .unwrap();
        let tmp = tempdir().unwrap();
        let mut settings = toy_settings(tmp.path());
        settings.num_workers = 2;
        let steps: Vec<String> = ["households", "zones", "stamp"]
            .into_iter()
            .map(String::from)
            .collect();

        let err = multi(registry, &settings, &steps).unwrap_err();
        assert!(matches!(
            err,
            EngineError::BroadcastDiverged { ref dataset, workers: (0, 1) } if dataset == "land_use"
        ));
    }

    #[test]
    fn worker_failure_names_the_worker() {
        let mut registry = toy_registry(by_household());
        registry
            .register(StepSpec::new("picky"), |ctx| {
                if ctx.worker() == Some(1) {
                    return Err("bad partition".into());
                }
                Ok(())
            })
            .unwrap();
        let tmp = tempdir().unwrap();
        let mut settings = toy_settings(tmp.path());
        settings.num_workers = 2;
        let steps: Vec<String> = ["households", "persons", "picky"]
            .into_iter()
            .map(String::from)
            .collect();

        match multi(registry, &settings, &steps).unwrap_err() {
            EngineError::WorkerFailed {
                worker,
                partition,
                step,
                message,
            } => {
                assert_eq!(worker, 1);
                assert!(partition.starts_with("partition 1 of 2"), "{partition}");
                assert_eq!(step.as_deref(), Some("picky"));
                assert!(message.contains("bad partition"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Nothing was gathered.
        let labels: Vec<String> = CheckpointStore::open(&settings.pipeline_dir)
            .unwrap()
            .list_checkpoints()
            .unwrap()
            .into_iter()
            .map(|c| c.step_name)
            .collect();
        assert_eq!(labels, vec!["households"]);
    }

    #[test]
    fn population_must_exist() {
        let tmp = tempdir().unwrap();
        let mut settings = toy_settings(tmp.path());
        settings.num_workers = 2;
        settings.population = "zones".to_string();
        let err = multi(toy_registry(by_household()), &settings, &toy_steps()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Configuration(crate::errors::ConfigurationError::MissingPopulation(_))
        ));
    }

    #[test]
    fn interrupt_stops_the_run() {
        let tmp = tempdir().unwrap();
        let mut settings = toy_settings(tmp.path());
        settings.num_workers = 2;
        let registry = Arc::new(toy_registry(by_household()));
        let launcher = ThreadLauncher::new(Arc::clone(&registry));
        let err = run_multiprocess(
            registry,
            &toy_steps(),
            &settings,
            &launcher,
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Interrupted));
    }
}
