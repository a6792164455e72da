use std::path::Path;

use tempfile::tempdir;

use super::*;
use crate::chunk::ChunkTrainingMode;
use crate::chunk::SizeEstimateCache;
use crate::config::MeterKind;
use crate::config::TraceSettings;
use crate::errors::ChunkPlanError;
use crate::errors::StepContractError;
use crate::errors::TableError;
use crate::table::Column;

/// households -> persons -> tours -> summary, the shape of a small
/// travel demand model.
pub(crate) fn toy_registry(tours_chunk: ChunkTarget) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry
        .register(
            StepSpec::new("households")
                .writes(["households"])
                .coalesce(),
            |ctx| {
                let ids: Vec<i64> = (1..=12).collect();
                let income = ids.iter().map(|id| id * 1000).collect();
                let households =
                    Table::new(Some("household_id"), ids)?.with_column("income", Column::Int(income))?;
                ctx.write("households", households)?;
                Ok(())
            },
        )
        .unwrap();
    registry
        .register(
            StepSpec::new("persons")
                .reads(["households"])
                .writes(["persons"]),
            |ctx| {
                let households = ctx.read("households")?;
                let mut ids = Vec::new();
                let mut household_ids = Vec::new();
                for &hh in households.index() {
                    for k in 0..(hh % 3 + 1) {
                        ids.push(hh * 10 + k);
                        household_ids.push(hh);
                    }
                }
                let persons = Table::new(Some("person_id"), ids)?
                    .with_column("household_id", Column::Int(household_ids))?;
                ctx.write("persons", persons)?;
                Ok(())
            },
        )
        .unwrap();
    registry
        .register(
            StepSpec::new("tours")
                .reads(["persons"])
                .writes(["tours"])
                .chunked(tours_chunk),
            |ctx| {
                let persons = ctx.read("persons")?;
                ctx.log_bytes(persons.approx_bytes());
                let ids = persons.index().iter().map(|p| p * 10).collect();
                let tours = Table::new(Some("tour_id"), ids)?
                    .with_column("person_id", Column::Int(persons.index().to_vec()))?
                    .with_column(
                        "household_id",
                        Column::Int(persons.int_column("household_id")?.to_vec()),
                    )?;
                ctx.write("tours", tours)?;
                Ok(())
            },
        )
        .unwrap();
    registry
        .register(
            StepSpec::new("summary")
                .reads(["households", "persons", "tours"])
                .writes(["summary"])
                .coalesce(),
            |ctx| {
                let counts = ["households", "persons", "tours"]
                    .into_iter()
                    .map(|name| ctx.read(name).map(|t| t.len() as i64))
                    .collect::<Result<Vec<_>, _>>()?;
                let summary = Table::new(None, vec![0])?
                    .with_column("households", Column::Int(vec![counts[0]]))?
                    .with_column("persons", Column::Int(vec![counts[1]]))?
                    .with_column("tours", Column::Int(vec![counts[2]]))?;
                ctx.write("summary", summary)?;
                Ok(())
            },
        )
        .unwrap();
    registry
}

pub(crate) fn toy_steps() -> Vec<String> {
    ["households", "persons", "tours", "summary"]
        .into_iter()
        .map(String::from)
        .collect()
}

pub(crate) fn toy_settings(dir: &Path) -> RunSettings {
    let mut settings = RunSettings {
        pipeline_dir: dir.join("pipeline"),
        output_dir: dir.join("output"),
        ..Default::default()
    };
    settings.chunk.meter = MeterKind::Logged;
    settings
}

fn scheduler(registry: StepRegistry, settings: &RunSettings) -> Scheduler {
    let store = CheckpointStore::open(&settings.pipeline_dir).unwrap();
    Scheduler::new(Arc::new(registry), settings, store).unwrap()
}

fn by_household() -> ChunkTarget {
    ChunkTarget::over("persons").grouped_by("household_id")
}

#[test]
fn restore_matches_memory() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut sched = scheduler(toy_registry(by_household()), &settings);
    assert_eq!(sched.state(), RunState::Pending);

    let summary = sched.run(&toy_steps(), None).unwrap();
    assert_eq!(sched.state(), RunState::Completed);
    assert_eq!(summary.steps_run, toy_steps());

    let (info, restored) = sched.store().restore(&CheckpointRef::Last).unwrap();
    assert_eq!(info.step_name, "summary");
    assert_eq!(&restored, sched.datasets());
    assert_eq!(restored["summary"].int_column("tours").unwrap(), &[24]);
    assert!(settings.output_dir.join("timing_log.csv").exists());
}

#[test]
fn resume_reproduces_full_run() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut full = scheduler(toy_registry(by_household()), &settings);
    full.run(&toy_steps(), None).unwrap();
    let expected = full.datasets().clone();
    drop(full);

    let mut resumed = scheduler(toy_registry(by_household()), &settings);
    let summary = resumed.run(&toy_steps(), Some("persons")).unwrap();
    assert_eq!(summary.steps_run, vec!["tours".to_string(), "summary".to_string()]);
    assert_eq!(resumed.datasets(), &expected);

    let labels: Vec<String> = resumed
        .store()
        .list_checkpoints()
        .unwrap()
        .into_iter()
        .map(|c| c.step_name)
        .collect();
    assert_eq!(labels, toy_steps());
}

#[test]
fn resume_from_last_runs_nothing() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    scheduler(toy_registry(by_household()), &settings)
        .run(&toy_steps(), None)
        .unwrap();

    let mut resumed = scheduler(toy_registry(by_household()), &settings);
    let summary = resumed.run(&toy_steps(), Some("_")).unwrap();
    assert!(summary.steps_run.is_empty());
    assert!(resumed.datasets().contains_key("summary"));
}

#[test]
fn unknown_resume_point_changes_nothing() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    scheduler(toy_registry(by_household()), &settings)
        .run(&toy_steps(), None)
        .unwrap();

    let mut sched = scheduler(toy_registry(by_household()), &settings);
    let err = sched.run(&toy_steps(), Some("trips")).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigurationError::UnknownResumePoint(ref p)) if p == "trips"
    ));
    assert_eq!(sched.store().list_checkpoints().unwrap().len(), 4);
}

#[test]
fn unknown_step_rejected_before_running() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut sched = scheduler(toy_registry(by_household()), &settings);
    let steps = vec!["households".to_string(), "trips".to_string()];
    let err = sched.run(&steps, None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigurationError::UnknownStep(_))
    ));
    assert!(sched.store().list_checkpoints().unwrap().is_empty());
}

#[test]
fn chunked_matches_unchunked() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut plain = scheduler(toy_registry(by_household()), &settings);
    plain.run(&toy_steps(), None).unwrap();

    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let mut settings = toy_settings(dir);
    settings.chunk.training_mode = ChunkTrainingMode::Adaptive;
    settings.chunk.row_threshold = 5;
    settings.chunk.min_chunk_rows = 1;
    settings.chunk.chunk_size = 500;
    settings.chunk.default_row_size = 100;
    let mut chunked = scheduler(toy_registry(by_household()), &settings);
    let summary = chunked.run(&toy_steps(), None).unwrap();

    assert_eq!(chunked.datasets(), plain.datasets());
    let tours = &summary.chunk_log.0["tours"];
    assert!(tours.chunks > 1, "{tours:?}");
    assert!(settings.chunk_cache_file().exists());
}

#[test]
fn fixed_chunks_match_unchunked() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut plain = scheduler(toy_registry(by_household()), &settings);
    plain.run(&toy_steps(), None).unwrap();

    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut chunked = scheduler(toy_registry(by_household().fixed(3)), &settings);
    let summary = chunked.run(&toy_steps(), None).unwrap();

    assert_eq!(chunked.datasets(), plain.datasets());
    assert_eq!(summary.chunk_log.0["tours"].chunks, 3);
}

/// Persons 1 to 4 alternating between two households, then a step
/// that extends them and derives one choice per person.
fn interleaved_registry(chunk: Option<ChunkTarget>) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry
        .register(StepSpec::new("persons").writes(["persons"]), |ctx| {
            let persons = Table::new(Some("person_id"), vec![1, 2, 3, 4])?
                .with_column("household_id", Column::Int(vec![5, 6, 5, 6]))?;
            ctx.write("persons", persons)?;
            Ok(())
        })
        .unwrap();
    let mut spec = StepSpec::new("choose")
        .reads(["persons"])
        .writes(["persons", "choices"]);
    if let Some(chunk) = chunk {
        spec = spec.chunked(chunk);
    }
    registry
        .register(spec, |ctx| {
            let persons = ctx.read("persons")?;
            let ids = persons.index().to_vec();
            let choices = Table::new(Some("choice_id"), ids.iter().map(|p| p + 100).collect())?
                .with_column("person_id", Column::Int(ids.clone()))?;
            let extended = persons
                .clone()
                .with_column("doubled", Column::Int(ids.iter().map(|p| p * 2).collect()))?;
            ctx.write("persons", extended)?;
            ctx.write("choices", choices)?;
            Ok(())
        })
        .unwrap();
    registry
}

#[test]
fn grouped_chunks_keep_row_order() {
    let steps = vec!["persons".to_string(), "choose".to_string()];
    let tmp = tempdir().unwrap();
    let settings = toy_settings(tmp.path());
    let mut plain = scheduler(interleaved_registry(None), &settings);
    plain.run(&steps, None).unwrap();

    let tmp = tempdir().unwrap();
    let settings = toy_settings(tmp.path());
    let target = ChunkTarget::over("persons").grouped_by("household_id").fixed(2);
    let mut chunked = scheduler(interleaved_registry(Some(target)), &settings);
    let summary = chunked.run(&steps, None).unwrap();

    assert_eq!(summary.chunk_log.0["choose"].chunks, 2);
    assert_eq!(chunked.datasets()["persons"].index(), &[1, 2, 3, 4]);
    assert_eq!(chunked.datasets()["choices"].index(), &[101, 102, 103, 104]);
    assert_eq!(chunked.datasets(), plain.datasets());
}

#[test]
fn clashing_chunk_writes_fail_the_step() {
    let tmp = tempdir().unwrap();
    let settings = toy_settings(tmp.path());
    let mut registry = toy_registry(by_household());
    registry
        .register(
            StepSpec::new("lookup")
                .reads(["persons"])
                .writes(["lookup"])
                .chunked(by_household().fixed(2)),
            |ctx| {
                ctx.write("lookup", Table::new(Some("lookup_id"), vec![1])?)?;
                Ok(())
            },
        )
        .unwrap();
    let mut sched = scheduler(registry, &settings);
    let steps = vec!["households".to_string(), "persons".to_string(), "lookup".to_string()];
    let err = sched.run(&steps, None).unwrap_err();

    let EngineError::StepExecution { step, source, .. } = err else {
        panic!("expected a step failure");
    };
    assert_eq!(step, "lookup");
    assert!(matches!(
        source.downcast_ref::<TableError>(),
        Some(TableError::DuplicateIndex { id: 1 })
    ));
    assert_eq!(sched.state(), RunState::Failed(2));
}

#[test]
fn training_without_logged_bytes_fills_cache() {
    let with_quiet = || {
        let mut registry = toy_registry(by_household());
        registry
            .register(
                StepSpec::new("quiet")
                    .reads(["persons"])
                    .writes(["persons"])
                    .chunked(ChunkTarget::over("persons")),
                |ctx| {
                    let persons = ctx.read("persons")?;
                    let flags = vec![1; persons.len()];
                    ctx.write("persons", persons.clone().with_column("seen", Column::Int(flags))?)?;
                    Ok(())
                },
            )
            .unwrap();
        registry
    };
    let steps = vec!["households".to_string(), "persons".to_string(), "quiet".to_string()];

    let tmp = tempdir().unwrap();
    let settings = toy_settings(tmp.path());
    let mut plain = scheduler(with_quiet(), &settings);
    plain.run(&steps, None).unwrap();

    let tmp = tempdir().unwrap();
    let mut settings = toy_settings(tmp.path());
    settings.chunk.training_mode = ChunkTrainingMode::Training;
    settings.chunk.row_threshold = 5;
    settings.chunk.min_chunk_rows = 1;
    settings.chunk.initial_rows_per_chunk = 2;
    let mut trained = scheduler(with_quiet(), &settings);
    let summary = trained.run(&steps, None).unwrap();

    assert_eq!(trained.datasets(), plain.datasets());
    assert!(summary.chunk_log.0["quiet"].chunks > 1);
    let cache = SizeEstimateCache::open(&settings.chunk_cache_file()).unwrap();
    assert_eq!(cache.get("quiet", "persons", 24).unwrap(), Some(1.0));
}

#[test]
fn too_many_fixed_chunks_fail() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut sched = scheduler(toy_registry(by_household().fixed(1000)), &settings);
    let err = sched.run(&toy_steps(), None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::ChunkPlan(ChunkPlanError::InvalidChunkPlan { chunks: 1000, .. })
    ));
    assert_eq!(sched.state(), RunState::Failed(2));
}

#[test]
fn failing_step_names_itself() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut registry = toy_registry(by_household());
    registry
        .register(StepSpec::new("boom").reads(["persons"]), |_ctx| {
            Err("bad input".into())
        })
        .unwrap();
    let mut sched = scheduler(registry, &settings);
    let steps = vec!["households".to_string(), "persons".to_string(), "boom".to_string()];
    let err = sched.run(&steps, None).unwrap_err();

    match &err {
        EngineError::StepExecution { step, worker, .. } => {
            assert_eq!(step, "boom");
            assert_eq!(*worker, None);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(crate::errors::report(&err).ends_with("Caused by => bad input"));
    assert_eq!(sched.state(), RunState::Failed(2));
    // Earlier steps stay committed.
    assert_eq!(
        sched.store().latest().unwrap().unwrap().step_name,
        "persons"
    );
    assert!(settings.output_dir.join("timing_log.csv").exists());
}

#[test]
fn panicking_step_is_a_step_failure() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut registry = StepRegistry::new();
    registry
        .register(StepSpec::new("panics"), |_ctx| panic!("oh no"))
        .unwrap();
    let mut sched = scheduler(registry, &settings);
    let err = sched.run(&["panics".to_string()], None).unwrap_err();
    let msg = crate::errors::report(&err);
    assert!(msg.contains("panicked: oh no"), "{msg}");
}

#[test]
fn swallowed_contract_violation_fails_step() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut registry = toy_registry(by_household());
    registry
        .register(
            StepSpec::new("sneaky").reads(["persons"]).writes(["persons"]),
            |ctx| {
                let _ = ctx.read("households");
                Ok(())
            },
        )
        .unwrap();
    let mut sched = scheduler(registry, &settings);
    let steps = vec!["households".to_string(), "persons".to_string(), "sneaky".to_string()];
    let err = sched.run(&steps, None).unwrap_err();
    let EngineError::StepExecution { source, .. } = err else {
        panic!("expected a step failure");
    };
    assert!(matches!(
        source.downcast_ref::<StepContractError>(),
        Some(StepContractError::UndeclaredRead { dataset, .. }) if dataset == "households"
    ));
}

#[test]
fn removal_is_committed() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let mut registry = toy_registry(by_household());
    registry
        .register(StepSpec::new("drop_tours").writes(["tours"]), |ctx| {
            ctx.remove("tours")?;
            Ok(())
        })
        .unwrap();
    let mut sched = scheduler(registry, &settings);
    let mut steps = toy_steps();
    steps.push("drop_tours".to_string());
    sched.run(&steps, None).unwrap();

    assert!(!sched.datasets().contains_key("tours"));
    let (_, restored) = sched.store().restore(&CheckpointRef::Last).unwrap();
    assert!(!restored.contains_key("tours"));
    let (_, before) = sched
        .store()
        .restore(&CheckpointRef::Step("summary".to_string()))
        .unwrap();
    assert!(before.contains_key("tours"));
}

#[test]
fn interrupt_stops_before_next_step() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let settings = toy_settings(dir);
    let flag = Arc::new(AtomicBool::new(true));
    let mut sched = scheduler(toy_registry(by_household()), &settings).with_interrupt(flag);
    let err = sched.run(&toy_steps(), None).unwrap_err();
    assert!(matches!(err, EngineError::Interrupted));
    assert_eq!(sched.state(), RunState::Failed(0));
}

#[test]
fn traced_rows_are_dumped() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path();
    let mut settings = toy_settings(dir);
    settings.trace = TraceSettings {
        ids: vec![1],
        tables: vec!["households".into(), "persons".into(), "tours".into()],
        ..Default::default()
    };
    let mut sched = scheduler(toy_registry(by_household()), &settings);
    sched.run(&toy_steps(), None).unwrap();

    assert_eq!(sched.traces().trace_ids("persons"), &[10, 11]);
    assert_eq!(sched.traces().trace_ids("tours"), &[100, 110]);
    let writer = TraceWriter::new(&settings.output_dir, None);
    let dump = fs::read_to_string(writer.file_path("tours", "tours")).unwrap();
    assert_eq!(dump.lines().count(), 2);
    assert!(!writer.file_path("summary", "summary").exists());
}

#[test]
fn fresh_run_clears_previous_outputs() {
    let tmp = tempdir().unwrap();
    let mut settings = toy_settings(tmp.path());
    settings.memory_profile = true;
    fs::create_dir_all(&settings.output_dir).unwrap();
    for name in ["timing_log.w3.csv", "mem.w3.csv", MEMORY_PROFILE_FILE] {
        fs::write(settings.output_dir.join(name), "stale\n").unwrap();
    }

    let mut sched = scheduler(toy_registry(by_household()), &settings);
    sched.run(&toy_steps(), None).unwrap();

    assert!(!settings.output_dir.join("timing_log.w3.csv").exists());
    assert!(!settings.output_dir.join("mem.w3.csv").exists());
    // Written by a sampler that starts before the run.
    assert!(settings.output_dir.join(MEMORY_PROFILE_FILE).exists());

    // Resuming keeps what's there.
    fs::write(settings.output_dir.join("timing_log.w3.csv"), "stale\n").unwrap();
    sched.run(&toy_steps(), Some("tours")).unwrap();
    assert!(settings.output_dir.join("timing_log.w3.csv").exists());
}

#[cfg(target_os = "linux")]
#[test]
fn memory_profile_logs_every_step() {
    let tmp = tempdir().unwrap();
    let mut settings = toy_settings(tmp.path());
    settings.memory_profile = true;
    let mut sched = scheduler(toy_registry(by_household()), &settings);
    sched.run(&toy_steps(), None).unwrap();

    let log = fs::read_to_string(settings.output_dir.join(MemoryLog::file_name(None))).unwrap();
    let steps: Vec<&str> = log
        .lines()
        .skip(1)
        .filter_map(|line| line.split(',').next())
        .collect();
    assert_eq!(steps, toy_steps());

    let hwm = crate::memory::consolidate_memory_logs(&settings.output_dir)
        .unwrap()
        .unwrap();
    assert_eq!(hwm.process, "main");
    assert!(hwm.bytes > 0);
}

#[test]
fn registry_rejects_bad_declarations() {
    let mut registry = toy_registry(by_household());
    assert!(matches!(
        registry.register(StepSpec::new("tours"), |_| Ok(())),
        Err(ConfigurationError::DuplicateStep(_))
    ));
    assert!(matches!(
        registry.register(
            StepSpec::new("trips").chunked(ChunkTarget::over("tours")),
            |_| Ok(())
        ),
        Err(ConfigurationError::InvalidStep { .. })
    ));
    assert!(matches!(
        registry.register(StepSpec::new("escape").writes(["../persons"]), |_| Ok(())),
        Err(ConfigurationError::InvalidStep { ref step, .. }) if step == "escape"
    ));
}
