use std::collections::BTreeMap;

use crate::chunk::ChunkPlan;
use crate::chunk::ChunkTracker;
use crate::errors::StepContractError;
use crate::scheduler::StepSpec;
use crate::table::Datasets;
use crate::table::EntityId;
use crate::table::Table;
use crate::trace::TraceRegistry;

/// Which chunk a body invocation is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Starts at 0.
    pub index: usize,
    pub rows: usize,
    pub plan: ChunkPlan,
}

/// Writes of one body invocation; `None` removes the dataset.
pub(crate) type Staged = BTreeMap<String, Option<Table>>;

/// Everything a step body can see and do.
///
/// Reads see the datasets as they were when the step started (for a
/// chunked step, the chunk target is replaced by the current chunk).
/// Writes are staged and only become visible once the whole step has
/// succeeded.
pub struct StepContext<'a> {
    spec: &'a StepSpec,
    datasets: &'a Datasets,
    chunk: Option<(&'a Table, ChunkInfo)>,
    traces: &'a TraceRegistry,
    worker: Option<usize>,
    tracker: ChunkTracker<'a>,
    staged: Staged,
    violation: Option<StepContractError>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        spec: &'a StepSpec,
        datasets: &'a Datasets,
        chunk: Option<(&'a Table, ChunkInfo)>,
        traces: &'a TraceRegistry,
        worker: Option<usize>,
        tracker: ChunkTracker<'a>,
    ) -> Self {
        Self {
            spec,
            datasets,
            chunk,
            traces,
            worker,
            tracker,
            staged: BTreeMap::new(),
            violation: None,
        }
    }

    pub fn step_name(&self) -> &str {
        &self.spec.name
    }

    /// Index of the worker running this step, if partitioned.
    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    fn reject(&mut self, err: StepContractError) -> StepContractError {
        if self.violation.is_none() {
            self.violation = Some(err.clone());
        }
        err
    }

    fn check_read(&mut self, name: &str) -> Result<(), StepContractError> {
        if self.spec.reads.iter().any(|r| r == name) {
            Ok(())
        } else {
            Err(self.reject(StepContractError::UndeclaredRead {
                step: self.spec.name.clone(),
                dataset: name.to_string(),
            }))
        }
    }

    fn lookup(&self, name: &str) -> Option<&'a Table> {
        match self.chunk {
            Some((table, _)) if self.spec.chunk_dataset() == Some(name) => Some(table),
            _ => self.datasets.get(name),
        }
    }

    /// A declared input dataset.
    pub fn read(&mut self, name: &str) -> Result<&'a Table, StepContractError> {
        self.check_read(name)?;
        match self.lookup(name) {
            Some(table) => Ok(table),
            None => Err(self.reject(StepContractError::MissingDataset(name.to_string()))),
        }
    }

    /// Like [`StepContext::read`] but a missing dataset is not an
    /// error.
    pub fn try_read(&mut self, name: &str) -> Result<Option<&'a Table>, StepContractError> {
        self.check_read(name)?;
        Ok(self.lookup(name))
    }

    fn check_write(&mut self, name: &str) -> Result<(), StepContractError> {
        if self.spec.writes.iter().any(|w| w == name) {
            Ok(())
        } else {
            Err(self.reject(StepContractError::UndeclaredWrite {
                step: self.spec.name.clone(),
                dataset: name.to_string(),
            }))
        }
    }

    /// Stage a new version of a declared output dataset.
    pub fn write(&mut self, name: &str, table: Table) -> Result<(), StepContractError> {
        self.check_write(name)?;
        self.tracker.sample();
        self.staged.insert(name.to_string(), Some(table));
        Ok(())
    }

    /// Stage removal of a declared output dataset.
    pub fn remove(&mut self, name: &str) -> Result<(), StepContractError> {
        self.check_write(name)?;
        self.staged.insert(name.to_string(), None);
        Ok(())
    }

    /// Is this population entity traced?
    pub fn is_traced(&self, id: EntityId) -> bool {
        self.traces.is_traced(id)
    }

    pub fn is_traced_in(&self, dataset: &str, id: EntityId) -> bool {
        self.traces.is_traced_in(dataset, id)
    }

    pub fn trace_ids(&self, dataset: &str) -> &[EntityId] {
        self.traces.trace_ids(dataset)
    }

    /// Report bytes currently held, for memory accounting of chunks.
    pub fn log_bytes(&mut self, bytes: u64) {
        self.tracker.log_bytes(bytes);
    }

    pub fn chunk(&self) -> Option<&ChunkInfo> {
        self.chunk.as_ref().map(|(_, info)| info)
    }

    pub(crate) fn into_parts(self) -> (Staged, Option<StepContractError>, ChunkTracker<'a>) {
        (self.staged, self.violation, self.tracker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Logged;
    use crate::config::TraceSettings;

    fn spec() -> StepSpec {
        StepSpec::new("tours")
            .reads(["persons"])
            .writes(["tours"])
    }

    #[test]
    fn undeclared_access_is_recorded() {
        let spec = spec();
        let datasets: Datasets = [("persons".to_string(), Table::new(None, vec![1]).unwrap())]
            .into_iter()
            .collect();
        let traces = TraceRegistry::new(&TraceSettings::default());
        let meter = Logged;
        let mut ctx = StepContext::new(&spec, &datasets, None, &traces, None, ChunkTracker::start(&meter));

        assert_eq!(ctx.read("persons").unwrap().len(), 1);
        // Swallowed by the body, still remembered.
        let _ = ctx.read("households");
        assert!(ctx.write("persons", Table::new(None, vec![]).unwrap()).is_err());
        ctx.write("tours", Table::new(None, vec![]).unwrap()).unwrap();

        let (staged, violation, _) = ctx.into_parts();
        assert!(staged.contains_key("tours"));
        assert!(matches!(
            violation,
            Some(StepContractError::UndeclaredRead { .. })
        ));
    }

    #[test]
    fn try_read_missing_is_none() {
        let spec = spec();
        let datasets = Datasets::new();
        let traces = TraceRegistry::new(&TraceSettings::default());
        let meter = Logged;
        let mut ctx = StepContext::new(&spec, &datasets, None, &traces, None, ChunkTracker::start(&meter));
        assert!(ctx.try_read("persons").unwrap().is_none());
        assert!(ctx.read("persons").is_err());
    }
}
