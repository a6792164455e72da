//! Following a handful of entities through a run.
//!
//! A run can be configured with a few IDs of the population dataset
//! (the first of the traceable tables, typically households). Every
//! time a traceable dataset is written, [`TraceRegistry`] works out
//! which of its rows relate to those entities by walking foreign
//! keys back to an already registered dataset, and [`TraceWriter`]
//! dumps those rows so they can be inspected without the rest of the
//! population.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::TraceSettings;
use crate::errors::IoContext;
use crate::errors::StoreError;
use crate::table::Datasets;
use crate::table::EntityId;
use crate::table::Table;
use crate::table::Value;

#[derive(Debug, Clone, PartialEq)]
struct TraceSet {
    index_name: String,
    ids: Vec<EntityId>,
}

/// Which rows of which datasets are being traced.
#[derive(Debug, Clone)]
pub struct TraceRegistry {
    root_ids: Vec<EntityId>,
    /// In dependency order; the first is the population.
    traceable: Vec<String>,
    /// Registered datasets in registration order.
    sets: Vec<(String, TraceSet)>,
    /// Inside a worker most root IDs live in other partitions.
    partial_population: bool,
}

impl TraceRegistry {
    pub fn new(settings: &TraceSettings) -> Self {
        Self {
            root_ids: settings.ids.clone(),
            traceable: settings.tables.clone(),
            sets: Vec::new(),
            partial_population: false,
        }
    }

    /// Registry for a worker holding one slice of the population.
    pub fn for_partition(settings: &TraceSettings) -> Self {
        Self {
            partial_population: true,
            ..Self::new(settings)
        }
    }

    pub fn enabled(&self) -> bool {
        !self.root_ids.is_empty() && !self.traceable.is_empty()
    }

    pub fn is_traceable(&self, dataset: &str) -> bool {
        self.traceable.iter().any(|t| t == dataset)
    }

    fn get(&self, dataset: &str) -> Option<&TraceSet> {
        self.sets
            .iter()
            .find(|(name, _)| name == dataset)
            .map(|(_, set)| set)
    }

    /// Traced IDs of a dataset; empty if nothing is traced in it.
    pub fn trace_ids(&self, dataset: &str) -> &[EntityId] {
        self.get(dataset).map(|s| s.ids.as_slice()).unwrap_or(&[])
    }

    /// Is this population entity being traced?
    pub fn is_traced(&self, id: EntityId) -> bool {
        self.root_ids.contains(&id)
    }

    pub fn is_traced_in(&self, dataset: &str, id: EntityId) -> bool {
        self.trace_ids(dataset).contains(&id)
    }

    /// Compute (or extend) the trace set of a traceable dataset from
    /// its current contents.
    pub fn register_traceable_table(&mut self, name: &str, table: &Table) {
        if !self.enabled() || !self.is_traceable(name) {
            return;
        }
        let Some(index_name) = table.index_name() else {
            tracing::warn!("Can't register table '{name}' without index name");
            return;
        };

        let found = if self.traceable[0] == name {
            self.root_rows(name, table)
        } else {
            match self.related_rows(name, table) {
                Some(ids) => ids,
                None => {
                    tracing::warn!(
                        "can't find a registered table to slice table '{name}' index name '{index_name}'"
                    );
                    Vec::new()
                }
            }
        };

        match self.sets.iter_mut().find(|(n, _)| n == name) {
            Some((_, set)) => {
                let mut seen: HashSet<EntityId> = set.ids.iter().copied().collect();
                set.ids.extend(found.into_iter().filter(|id| seen.insert(*id)));
                set.index_name = index_name.to_string();
            }
            None => {
                tracing::debug!("Tracing {} rows of {name:?}", found.len());
                self.sets.push((
                    name.to_string(),
                    TraceSet {
                        index_name: index_name.to_string(),
                        ids: found,
                    },
                ));
            }
        }
    }

    /// Register every given dataset that is traceable, population
    /// first so dependents can find their parents.
    pub fn register_all<'a>(&mut self, datasets: &Datasets, names: impl IntoIterator<Item = &'a str>) {
        let names: HashSet<&str> = names.into_iter().collect();
        let order = self.traceable.clone();
        for name in order.iter().filter(|n| names.contains(n.as_str())) {
            if let Some(table) = datasets.get(name) {
                self.register_traceable_table(name, table);
            }
        }
    }

    fn root_rows(&self, name: &str, table: &Table) -> Vec<EntityId> {
        let present: HashSet<EntityId> = table.index().iter().copied().collect();
        let mut ids = Vec::new();
        for id in &self.root_ids {
            if present.contains(id) {
                ids.push(*id);
            } else if self.partial_population {
                tracing::debug!("trace id {id} not in this partition of '{name}'");
            } else {
                tracing::warn!("trace id {id} not in dataset '{name}'");
            }
        }
        ids
    }

    /// Rows related to an already registered dataset, either sharing
    /// its index or holding a column that refers to it.
    fn related_rows(&self, name: &str, table: &Table) -> Option<Vec<EntityId>> {
        let own_index = table.index_name();
        self.sets
            .iter()
            .filter(|(other, _)| other != name)
            .find_map(|(_, set)| {
                let parents: HashSet<EntityId> = set.ids.iter().copied().collect();
                let column = if own_index == Some(set.index_name.as_str()) {
                    None
                } else if table.has_column(&set.index_name) {
                    Some(set.index_name.as_str())
                } else {
                    return None;
                };
                let positions = table.positions_in(&parents, column).ok()?;
                Some(positions.into_iter().map(|p| table.index()[p]).collect())
            })
    }
}

/// One traced row in a diagnostic file.
#[derive(Debug, Serialize)]
pub struct DiagnosticRow<'a> {
    pub dataset: &'a str,
    pub entity_id: EntityId,
    pub step: &'a str,
    pub row: BTreeMap<String, Value>,
}

/// Writes the traced rows of datasets as JSON lines.
pub struct TraceWriter {
    dir: PathBuf,
    suffix: Option<String>,
}

impl TraceWriter {
    pub const TRACE_DIR: &'static str = "trace";

    pub fn new(output_dir: &Path, worker: Option<usize>) -> Self {
        Self {
            dir: output_dir.join(Self::TRACE_DIR),
            suffix: worker.map(|w| format!(".w{w}")),
        }
    }

    pub fn file_path(&self, step: &str, dataset: &str) -> PathBuf {
        let suffix = self.suffix.as_deref().unwrap_or("");
        self.dir.join(format!("trace.{step}.{dataset}{suffix}.jsonl"))
    }

    /// Dump the traced rows of `dataset` as written by `step`.
    ///
    /// Returns how many rows were written.
    pub fn write_traced(
        &self,
        registry: &TraceRegistry,
        step: &str,
        dataset: &str,
        table: &Table,
    ) -> Result<usize, StoreError> {
        let traced: HashSet<EntityId> = registry.trace_ids(dataset).iter().copied().collect();
        if traced.is_empty() {
            return Ok(0);
        }
        let Ok(positions) = table.positions_in(&traced, None) else {
            return Ok(0);
        };

        fs::create_dir_all(&self.dir).reraise_at("can't create trace dir", &self.dir)?;
        let path = self.file_path(step, dataset);
        let file = File::create(&path).reraise_at("can't create trace file", &path)?;
        let mut out = BufWriter::new(file);
        for &pos in &positions {
            let record = DiagnosticRow {
                dataset,
                entity_id: table.index()[pos],
                step,
                row: table.row(pos),
            };
            serde_json::to_writer(&mut out, &record).map_err(|source| StoreError::Codec {
                what: format!("trace row of {dataset:?}"),
                source,
            })?;
            out.write_all(b"\n").reraise_at("can't write trace file", &path)?;
        }
        out.flush().reraise_at("can't flush trace file", &path)?;
        Ok(positions.len())
    }
}

/// Remove trace files left by a previous run.
pub fn delete_trace_files(output_dir: &Path) -> Result<usize, StoreError> {
    let dir = output_dir.join(TraceWriter::TRACE_DIR);
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(&dir).reraise_at("can't list trace dir", &dir)? {
        let path = entry.reraise_at("can't list trace dir", &dir)?.path();
        let is_trace = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("trace.") && n.ends_with(".jsonl"))
            .unwrap_or(false);
        if is_trace {
            fs::remove_file(&path).reraise_at("can't remove trace file", &path)?;
            removed += 1;
        }
    }
    tracing::debug!("Removed {removed} trace files from {dir:?}");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::table::Column;

    fn settings(ids: Vec<EntityId>) -> TraceSettings {
        TraceSettings {
            ids,
            tables: vec!["households".into(), "persons".into(), "tours".into()],
            ..Default::default()
        }
    }

    fn households() -> Table {
        Table::new(Some("household_id"), vec![1, 2, 3]).unwrap()
    }

    fn tours(household_ids: Vec<i64>) -> Table {
        Table::new(Some("tour_id"), vec![10, 11, 12])
            .unwrap()
            .with_column("household_id", Column::Int(household_ids))
            .unwrap()
    }

    #[test]
    fn follows_foreign_key() {
        let mut reg = TraceRegistry::new(&settings(vec![1]));
        reg.register_traceable_table("households", &households());
        reg.register_traceable_table("tours", &tours(vec![1, 5, 1]));
        assert_eq!(reg.trace_ids("households"), &[1]);
        assert_eq!(reg.trace_ids("tours"), &[10, 12]);
        assert!(reg.is_traced(1));
        assert!(!reg.is_traced(2));
        assert!(reg.is_traced_in("tours", 12));
        assert!(!reg.is_traced_in("tours", 11));
    }

    #[test]
    fn no_parent_yields_nothing() {
        let mut reg = TraceRegistry::new(&settings(vec![3]));
        reg.register_traceable_table("tours", &tours(vec![1, 5, 3]));
        assert!(reg.trace_ids("tours").is_empty());

        // Registered parent but no column pointing at it.
        reg.register_traceable_table("households", &households());
        let no_fk = Table::new(Some("tour_id"), vec![10, 11, 12]).unwrap();
        reg.register_traceable_table("tours", &no_fk);
        assert!(reg.trace_ids("tours").is_empty());

        reg.register_traceable_table("tours", &tours(vec![1, 5, 3]));
        assert_eq!(reg.trace_ids("tours"), &[12]);
    }

    #[test]
    fn missing_index_name_skipped() {
        let mut reg = TraceRegistry::new(&settings(vec![1]));
        reg.register_traceable_table("households", &Table::new(None, vec![1, 2]).unwrap());
        assert!(reg.trace_ids("households").is_empty());
    }

    #[test]
    fn root_id_not_present() {
        let mut reg = TraceRegistry::new(&settings(vec![5]));
        reg.register_traceable_table("households", &households());
        assert!(reg.trace_ids("households").is_empty());
        assert!(reg.is_traced(5));
    }

    #[test]
    fn reregistration_extends_without_duplicates() {
        let mut reg = TraceRegistry::new(&settings(vec![1]));
        reg.register_traceable_table("households", &households());
        reg.register_traceable_table("tours", &tours(vec![1, 5, 2]));
        assert_eq!(reg.trace_ids("tours"), &[10]);

        let more = Table::new(Some("tour_id"), vec![10, 13])
            .unwrap()
            .with_column("household_id", Column::Int(vec![1, 1]))
            .unwrap();
        reg.register_traceable_table("tours", &more);
        assert_eq!(reg.trace_ids("tours"), &[10, 13]);
    }

    #[test]
    fn shared_index_name_slices_by_index() {
        let mut reg = TraceRegistry::new(&TraceSettings {
            ids: vec![2],
            tables: vec!["households".into(), "households_merged".into()],
            ..Default::default()
        });
        reg.register_traceable_table("households", &households());
        reg.register_traceable_table("households_merged", &households());
        assert_eq!(reg.trace_ids("households_merged"), &[2]);
    }

    #[test]
    fn untraceable_and_disabled_ignored() {
        let mut reg = TraceRegistry::new(&settings(vec![]));
        assert!(!reg.enabled());
        reg.register_traceable_table("households", &households());
        assert!(reg.trace_ids("households").is_empty());

        let mut reg = TraceRegistry::new(&settings(vec![1]));
        reg.register_traceable_table("skims", &households());
        assert!(reg.trace_ids("skims").is_empty());
    }

    #[test]
    fn register_all_goes_parent_first() {
        let mut reg = TraceRegistry::new(&settings(vec![1]));
        let datasets: Datasets = [
            ("tours".to_string(), tours(vec![1, 5, 1])),
            ("households".to_string(), households()),
        ]
        .into_iter()
        .collect();
        reg.register_all(&datasets, ["tours", "households"]);
        assert_eq!(reg.trace_ids("tours"), &[10, 12]);
    }

    #[test]
    fn writes_and_deletes_trace_files() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let mut reg = TraceRegistry::new(&settings(vec![1]));
        reg.register_traceable_table("households", &households());
        let t = tours(vec![1, 5, 1]);
        reg.register_traceable_table("tours", &t);

        let writer = TraceWriter::new(dir, Some(3));
        let n = writer.write_traced(&reg, "tour_gen", "tours", &t).unwrap();
        assert_eq!(n, 2);
        let path = writer.file_path("tour_gen", "tours");
        assert!(path.ends_with("trace/trace.tour_gen.tours.w3.jsonl"));

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["entity_id"], 12);
        assert_eq!(lines[1]["row"]["household_id"], 1);

        assert_eq!(delete_trace_files(dir).unwrap(), 1);
        assert!(!path.exists());
    }
}
