//! Running an ordered list of steps over the dataset pool.
//!
//! Every step is looked up in an explicit [`StepRegistry`] that is
//! validated before anything runs. A [`Scheduler`] executes steps
//! strictly in order; after each one it applies the step's staged
//! writes, commits a checkpoint labeled with the step name, and then
//! updates the trace registry and diagnostic dumps.
//!
//! A step whose chunk target dataset is large runs its body once per
//! chunk (see [`crate::chunk`]); the writes of all chunks are
//! concatenated before anything is applied. When grouping made the
//! chunks visit rows out of order, each concatenated table is put back
//! in the row order of the chunked dataset.
//!
//! Lifecycle, as reported by [`Scheduler::state`]:
//!
//! ```text
//! Pending -> Running(i) -> Committed(i) -> Running(i + 1) ... -> Completed
//!                       \-> Failed(i)
//! ```

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crate::chunk::ChunkCursor;
use crate::chunk::ChunkLog;
use crate::chunk::ChunkPlan;
use crate::chunk::ChunkPlanner;
use crate::chunk::ChunkSizer;
use crate::chunk::ChunkTracker;
use crate::chunk::restore_row_order;
use crate::chunk::MemoryMeter;
use crate::config::RunSettings;
use crate::errors::BoxError;
use crate::errors::ConfigurationError;
use crate::errors::EngineError;
use crate::errors::IoContext;
use crate::errors::StoreError;
use crate::memory::MemoryLog;
use crate::memory::MEMORY_PROFILE_FILE;
use crate::metrics::StepMetrics;
use crate::output::append_csv;
use crate::output::delete_output_files;
use crate::recovery::write_atomic;
use crate::recovery::CheckpointId;
use crate::recovery::CheckpointRef;
use crate::recovery::is_valid_dataset_name;
use crate::recovery::CheckpointStore;
use crate::table::Datasets;
use crate::table::Table;
use crate::trace::delete_trace_files;
use crate::trace::TraceRegistry;
use crate::trace::TraceWriter;
use crate::with_timer;

mod context;

pub use context::ChunkInfo;
pub use context::StepContext;
use context::Staged;

/// Body of a step.
pub type StepFn = Arc<dyn Fn(&mut StepContext) -> Result<(), BoxError> + Send + Sync>;

/// Dataset a step can be chunked over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTarget {
    pub dataset: String,
    /// Integer column whose equal values must share a chunk.
    pub group_by: Option<String>,
    /// Always run exactly this many chunks.
    pub fixed_chunks: Option<usize>,
}

impl ChunkTarget {
    pub fn over(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            group_by: None,
            fixed_chunks: None,
        }
    }

    pub fn grouped_by(mut self, column: &str) -> Self {
        self.group_by = Some(column.to_string());
        self
    }

    pub fn fixed(mut self, chunks: usize) -> Self {
        self.fixed_chunks = Some(chunks);
        self
    }
}

/// Declaration of a step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepSpec {
    pub name: String,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub chunk: Option<ChunkTarget>,
    /// Needs the whole population at once; never run inside a
    /// partitioned worker.
    pub coalesce: bool,
}

impl StepSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn reads<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn writes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn chunked(mut self, target: ChunkTarget) -> Self {
        self.chunk = Some(target);
        self
    }

    pub fn coalesce(mut self) -> Self {
        self.coalesce = true;
        self
    }

    pub fn chunk_dataset(&self) -> Option<&str> {
        self.chunk.as_ref().map(|c| c.dataset.as_str())
    }
}

#[derive(Clone)]
pub struct RegisteredStep {
    pub spec: StepSpec,
    body: StepFn,
}

/// All steps a run may refer to, by name.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, RegisteredStep>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, spec: StepSpec, body: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&mut StepContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        if self.steps.contains_key(&spec.name) {
            return Err(ConfigurationError::DuplicateStep(spec.name));
        }
        if let Some(bad) = spec
            .reads
            .iter()
            .chain(&spec.writes)
            .find(|name| !is_valid_dataset_name(name))
        {
            return Err(ConfigurationError::InvalidStep {
                step: spec.name.clone(),
                reason: format!("{bad:?} is not a valid dataset name"),
            });
        }
        if let Some(dataset) = spec.chunk_dataset() {
            if !spec.reads.iter().any(|r| r == dataset) {
                return Err(ConfigurationError::InvalidStep {
                    step: spec.name.clone(),
                    reason: format!("chunk target {dataset:?} is not among its reads"),
                });
            }
        }
        self.steps.insert(
            spec.name.clone(),
            RegisteredStep {
                spec,
                body: Arc::new(body),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredStep> {
        self.steps.get(name)
    }

    pub fn spec(&self, name: &str) -> Option<&StepSpec> {
        self.get(name).map(|s| &s.spec)
    }

    /// Every name must be registered.
    pub fn validate(&self, steps: &[String]) -> Result<(), ConfigurationError> {
        match steps.iter().find(|s| !self.steps.contains_key(s.as_str())) {
            Some(unknown) => Err(ConfigurationError::UnknownStep(unknown.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running(usize),
    Committed(usize),
    Failed(usize),
    Completed,
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub last_checkpoint: Option<CheckpointId>,
    pub steps_run: Vec<String>,
    pub elapsed: Duration,
    pub chunk_log: ChunkLog,
}

/// Runs steps in order against one checkpoint store.
pub struct Scheduler {
    registry: Arc<StepRegistry>,
    settings: RunSettings,
    store: CheckpointStore,
    planner: ChunkPlanner,
    meter: Box<dyn MemoryMeter>,
    traces: TraceRegistry,
    trace_writer: TraceWriter,
    metrics: StepMetrics,
    worker: Option<usize>,
    interrupt: Arc<AtomicBool>,
    datasets: Datasets,
    steps: Vec<String>,
    state: RunState,
    last_checkpoint: Option<CheckpointId>,
    steps_run: Vec<String>,
    timings: Vec<(String, Duration)>,
    memory: Option<MemoryLog>,
    chunk_log: ChunkLog,
    started: Instant,
}

const TIMING_HEADER: &str = "step_name,seconds\n";

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else {
        "unknown panic".to_string()
    }
}

impl Scheduler {
    pub fn new(
        registry: Arc<StepRegistry>,
        settings: &RunSettings,
        store: CheckpointStore,
    ) -> Result<Self, EngineError> {
        let planner = ChunkPlanner::open(&settings.chunk, &settings.chunk_cache_file())?;
        Ok(Self {
            registry,
            settings: settings.clone(),
            store,
            planner,
            meter: settings.chunk.meter.build(),
            traces: TraceRegistry::new(&settings.trace),
            trace_writer: TraceWriter::new(&settings.output_dir, None),
            metrics: StepMetrics::new(),
            worker: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            datasets: Datasets::new(),
            steps: Vec::new(),
            state: RunState::Pending,
            last_checkpoint: None,
            steps_run: Vec::new(),
            timings: Vec::new(),
            memory: settings.memory_profile.then(MemoryLog::default),
            chunk_log: ChunkLog::default(),
            started: Instant::now(),
        })
    }

    /// Run as worker `index` of a partitioned segment.
    pub fn for_worker(mut self, index: usize) -> Self {
        self.worker = Some(index);
        self.traces = TraceRegistry::for_partition(&self.settings.trace);
        self.trace_writer = TraceWriter::new(&self.settings.output_dir, Some(index));
        self
    }

    /// Stop before the next step or chunk once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn datasets(&self) -> &Datasets {
        &self.datasets
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn traces(&self) -> &TraceRegistry {
        &self.traces
    }

    /// Run `steps` from the start, or after the checkpoint named by
    /// `resume_after`.
    #[tracing::instrument(name = "run", skip_all, fields(worker = ?self.worker))]
    pub fn run(&mut self, steps: &[String], resume_after: Option<&str>) -> Result<RunSummary, EngineError> {
        let start = self.prepare(steps, resume_after)?;
        for index in start..steps.len() {
            self.run_step(index)?;
        }
        self.finish()
    }

    /// Validate, then restore or reset. Returns the index of the first
    /// step to run.
    pub(crate) fn prepare(&mut self, steps: &[String], resume_after: Option<&str>) -> Result<usize, EngineError> {
        self.registry.validate(steps)?;
        self.steps = steps.to_vec();
        self.started = Instant::now();
        self.state = RunState::Pending;
        self.steps_run.clear();
        self.timings.clear();
        if let Some(memory) = &mut self.memory {
            memory.clear();
        }

        let Some(label) = resume_after else {
            self.store.reset()?;
            self.datasets.clear();
            self.last_checkpoint = None;
            if self.worker.is_none() {
                let keep: &[&str] = if self.settings.memory_profile {
                    &[MEMORY_PROFILE_FILE]
                } else {
                    &[]
                };
                delete_output_files(&self.settings.output_dir, keep)?;
            }
            tracing::info!("Starting fresh run of {} steps", steps.len());
            return Ok(0);
        };

        // Look before touching anything, so a bad resume point leaves
        // the store and the pool as they were.
        let info = match self.store.resolve(&CheckpointRef::parse(label)) {
            Ok(info) => info,
            Err(StoreError::CheckpointNotFound(_)) => {
                return Err(ConfigurationError::UnknownResumePoint(label.to_string()).into())
            }
            Err(err) => return Err(err.into()),
        };
        let (info, datasets) = self.store.restore(&CheckpointRef::Id(info.id))?;
        self.store.truncate_after(info.id)?;
        self.datasets = datasets;
        self.last_checkpoint = Some(info.id);

        self.traces = match self.worker {
            Some(_) => TraceRegistry::for_partition(&self.settings.trace),
            None => TraceRegistry::new(&self.settings.trace),
        };
        let names: Vec<String> = self.datasets.keys().cloned().collect();
        self.traces
            .register_all(&self.datasets, names.iter().map(String::as_str));
        if self.worker.is_none() && self.settings.trace.cleanup_trace_files_on_resume {
            delete_trace_files(&self.settings.output_dir)?;
        }

        let start = steps
            .iter()
            .position(|s| *s == info.step_name)
            .map_or(0, |i| i + 1);
        tracing::info!(
            "Resuming after checkpoint {} ({:?}) at step {start} of {}",
            info.id,
            info.step_name,
            steps.len()
        );
        Ok(start)
    }

    fn check_interrupt(&self) -> Result<(), EngineError> {
        if self.interrupt.load(Ordering::Relaxed) {
            Err(EngineError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Run step `index` of the prepared list and commit it.
    pub(crate) fn run_step(&mut self, index: usize) -> Result<(), EngineError> {
        let name = self.steps[index].clone();
        let span = tracing::info_span!("step", step = name.as_str(), index);
        let _guard = span.enter();

        self.state = RunState::Running(index);
        let step_started = Instant::now();
        let labels = StepMetrics::labels(&name, self.worker);
        let res = with_timer!(self.metrics.step_duration, labels, self.execute(index, &name));
        let elapsed = step_started.elapsed();
        self.timings.push((name.clone(), elapsed));
        match res {
            Ok(()) => {
                tracing::info!("Step {name:?} done in {elapsed:.3?}");
                if let Some(memory) = &mut self.memory {
                    memory.record_rss(&name);
                }
                self.steps_run.push(name);
                Ok(())
            }
            Err(err) => {
                tracing::error!("Step {name:?} failed");
                Err(self.fail(index, err))
            }
        }
    }

    fn execute(&mut self, index: usize, name: &str) -> Result<(), EngineError> {
        self.check_interrupt()?;
        let registry = Arc::clone(&self.registry);
        let step = registry
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownStep(name.to_string()))?;

        let staged = match self.chunk_plan(&step.spec)? {
            None => {
                let (staged, _elapsed, _peak) = self.run_body(step, None)?;
                staged
            }
            Some((plan, fixed)) => self.run_chunked(step, plan, fixed)?,
        };
        self.apply(index, name, staged)
    }

    fn step_failed(&self, step: &str, source: impl Into<BoxError>) -> EngineError {
        EngineError::StepExecution {
            step: step.to_string(),
            elapsed: self.started.elapsed(),
            worker: self.worker,
            source: source.into(),
        }
    }

    /// `Some((plan, fixed))` when the step should run chunked.
    fn chunk_plan(&self, spec: &StepSpec) -> Result<Option<(ChunkPlan, bool)>, EngineError> {
        let Some(target) = &spec.chunk else {
            return Ok(None);
        };
        // Left for the body to report.
        let Some(table) = self.datasets.get(&target.dataset) else {
            return Ok(None);
        };
        let rows = table.len();
        if rows == 0 {
            return Ok(None);
        }
        if let Some(chunks) = target.fixed_chunks {
            let plan = self
                .planner
                .plan_fixed(&spec.name, &target.dataset, rows, chunks)?;
            return Ok(Some((plan, true)));
        }
        if !self.planner.needs_chunking(&spec.name, &target.dataset, rows)? {
            return Ok(None);
        }
        let plan = self
            .planner
            .plan(&spec.name, &target.dataset, rows, self.planner.mode())?;
        Ok(Some((plan, false)))
    }

    /// One invocation of a body; returns its staged writes, elapsed
    /// time and peak memory.
    fn run_body(
        &self,
        step: &RegisteredStep,
        chunk: Option<(&Table, ChunkInfo)>,
    ) -> Result<(Staged, Duration, u64), EngineError> {
        let tracker = ChunkTracker::start(self.meter.as_ref());
        let mut ctx = StepContext::new(
            &step.spec,
            &self.datasets,
            chunk,
            &self.traces,
            self.worker,
            tracker,
        );
        let res = std::panic::catch_unwind(AssertUnwindSafe(|| (step.body)(&mut ctx)))
            .unwrap_or_else(|payload| {
                Err(format!("step body panicked: {}", panic_message(payload.as_ref())).into())
            });
        let (staged, violation, tracker) = ctx.into_parts();
        let (elapsed, peak) = tracker.finish();

        let failure: BoxError = match (res, violation) {
            (Err(source), _) => source,
            (Ok(()), Some(violation)) => violation.into(),
            (Ok(()), None) => return Ok((staged, elapsed, peak)),
        };
        Err(self.step_failed(&step.spec.name, failure))
    }

    fn run_chunked(&mut self, step: &RegisteredStep, plan: ChunkPlan, fixed: bool) -> Result<Staged, EngineError> {
        let name = step.spec.name.as_str();
        let target = step
            .spec
            .chunk
            .as_ref()
            .ok_or_else(|| ConfigurationError::UnknownStep(name.to_string()))?;
        tracing::info!(
            "Running step {name:?} in chunks of {:?}: {plan:?}",
            target.dataset
        );

        let (staged, sizer, records) = self.run_chunks(step, target, plan, fixed)?;

        let labels = StepMetrics::labels(name, self.worker);
        for (elapsed, peak) in records {
            self.chunk_log.record(name, elapsed, peak);
            self.metrics.chunk_peak_bytes.record(peak, &labels);
            self.metrics.chunks_run.add(1, &labels);
        }
        let rows = self
            .datasets
            .get(&target.dataset)
            .map_or(0, |t| t.len());
        self.planner
            .finish(name, &target.dataset, rows, &sizer)
            .map_err(|err| self.step_failed(name, err))?;
        Ok(staged)
    }

    #[allow(clippy::type_complexity)]
    fn run_chunks(
        &self,
        step: &RegisteredStep,
        target: &ChunkTarget,
        plan: ChunkPlan,
        fixed: bool,
    ) -> Result<(Staged, ChunkSizer, Vec<(Duration, u64)>), EngineError> {
        let name = step.spec.name.as_str();
        let table = self
            .datasets
            .get(&target.dataset)
            .ok_or_else(|| ConfigurationError::UnknownStep(name.to_string()))?;
        let mut sizer = if fixed {
            self.planner.fixed_sizer(plan, table.len())
        } else {
            self.planner.sizer(plan, table.len())
        };
        let mut cursor = ChunkCursor::new(table, target.group_by.as_deref())
            .map_err(|err| self.step_failed(name, err))?;
        let labels = StepMetrics::labels(name, self.worker);

        let mut parts: BTreeMap<String, Vec<Table>> = BTreeMap::new();
        let mut removed = BTreeSet::new();
        let mut records = Vec::new();
        let mut index = 0;
        while let Some(positions) = cursor.next_positions(sizer.next_chunk_rows(cursor.remaining())) {
            self.check_interrupt()?;
            let chunk = table.take(&positions);
            let info = ChunkInfo {
                index,
                rows: positions.len(),
                plan,
            };
            let span = tracing::debug_span!("chunk", index);
            let _guard = span.enter();
            let (staged, elapsed, peak) = with_timer!(
                self.metrics.chunk_duration,
                labels,
                self.run_body(step, Some((&chunk, info)))
            )?;
            tracing::info!(
                "Chunk {index} of step {name:?}: {} rows in {elapsed:.3?}, peak {peak} bytes",
                positions.len()
            );
            sizer.observe(positions.len(), peak);
            records.push((elapsed, peak));
            for (dataset, table) in staged {
                match table {
                    Some(table) => parts.entry(dataset).or_default().push(table),
                    None => {
                        removed.insert(dataset);
                    }
                }
            }
            index += 1;
        }

        let mut staged = Staged::new();
        for dataset in removed {
            staged.insert(dataset, None);
        }
        let reordered = cursor.is_reordered();
        for (dataset, tables) in parts {
            let mut output = Table::concat(tables).map_err(|err| self.step_failed(name, err))?;
            if reordered {
                output = restore_row_order(output, table);
            }
            staged.insert(dataset, Some(output));
        }
        Ok((staged, sizer, records))
    }

    fn apply(&mut self, index: usize, name: &str, staged: Staged) -> Result<(), EngineError> {
        let written: Vec<String> = staged.keys().cloned().collect();
        for (dataset, table) in staged {
            match table {
                Some(table) => {
                    self.datasets.insert(dataset, table);
                }
                None => {
                    self.datasets.remove(&dataset);
                }
            }
        }
        self.commit(index, name)?;
        self.after_mutation(name, &written)
    }

    fn commit(&mut self, index: usize, label: &str) -> Result<CheckpointId, EngineError> {
        let labels = StepMetrics::labels(label, self.worker);
        let id = with_timer!(
            self.metrics.commit_duration,
            labels,
            self.store.commit(label, &self.datasets)
        )?;
        self.last_checkpoint = Some(id);
        self.state = RunState::Committed(index);
        Ok(id)
    }

    /// Refresh trace sets of written datasets and dump their traced
    /// rows.
    fn after_mutation(&mut self, step: &str, written: &[String]) -> Result<(), EngineError> {
        if !self.traces.enabled() {
            return Ok(());
        }
        self.traces
            .register_all(&self.datasets, written.iter().map(String::as_str));
        for dataset in written {
            if let Some(table) = self.datasets.get(dataset) {
                self.trace_writer
                    .write_traced(&self.traces, step, dataset, table)?;
            }
        }
        Ok(())
    }

    /// Swap in a whole new pool, as gathered from workers.
    pub(crate) fn replace_datasets(&mut self, datasets: Datasets) {
        self.datasets = datasets;
    }

    /// Commit the current pool as the result of `steps`, which ran
    /// elsewhere. The checkpoint is labeled with the last of them.
    pub(crate) fn commit_segment(&mut self, steps: Range<usize>, elapsed: Duration) -> Result<CheckpointId, EngineError> {
        let last = steps.end - 1;
        let name = self.steps[last].clone();
        let id = self.commit(last, &name)?;
        if self.traces.enabled() {
            let names: Vec<String> = self.datasets.keys().cloned().collect();
            self.traces
                .register_all(&self.datasets, names.iter().map(String::as_str));
        }
        let label = self.steps[steps.clone()].join("+");
        if let Some(memory) = &mut self.memory {
            memory.record_rss(&label);
        }
        self.timings.push((label, elapsed));
        self.steps_run.extend_from_slice(&self.steps[steps]);
        Ok(id)
    }

    pub(crate) fn fail(&mut self, index: usize, err: EngineError) -> EngineError {
        self.state = RunState::Failed(index);
        tracing::error!(
            "{err}; elapsed time for all steps until this error {:.3?}",
            self.started.elapsed()
        );
        if let Err(log_err) = self.write_logs() {
            tracing::warn!("Can't write timing or memory log: {log_err}");
        }
        err
    }

    pub(crate) fn merge_chunk_log(&mut self, other: &ChunkLog) {
        self.chunk_log.merge(other);
    }

    pub(crate) fn finish(&mut self) -> Result<RunSummary, EngineError> {
        self.state = RunState::Completed;
        self.write_logs()?;
        let elapsed = self.started.elapsed();
        tracing::info!(
            "Ran {} steps in {elapsed:.3?}",
            self.steps_run.len()
        );
        Ok(RunSummary {
            last_checkpoint: self.last_checkpoint,
            steps_run: std::mem::take(&mut self.steps_run),
            elapsed,
            chunk_log: self.chunk_log.clone(),
        })
    }

    /// The coordinator's timing log covers the whole run and is
    /// rewritten; a worker runs once per partitioned segment and
    /// appends to its logs.
    fn write_logs(&self) -> Result<(), StoreError> {
        let dir = &self.settings.output_dir;
        fs::create_dir_all(dir).reraise_at("can't create output dir", dir)?;
        let mut rows = String::new();
        for (step, elapsed) in &self.timings {
            rows.push_str(&format!("{step},{:.3}\n", elapsed.as_secs_f64()));
        }
        match self.worker {
            Some(w) => append_csv(&dir.join(format!("timing_log.w{w}.csv")), TIMING_HEADER, &rows)?,
            None => write_atomic(&dir.join("timing_log.csv"), format!("{TIMING_HEADER}{rows}").as_bytes())?,
        }
        match &self.memory {
            Some(memory) => memory.append_to(dir, self.worker),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests;
