//! Splitting oversized datasets into memory-bounded chunks.
//!
//! A step that declares a chunk target has its body run once per
//! chunk of that dataset when the dataset is large. How many rows go
//! in a chunk depends on the [`ChunkTrainingMode`]:
//!
//! - `training` starts with a small first chunk, measures the memory
//!   it took and grows the chunk size while the projection stays
//!   under budget. The last per-row cost is saved to the
//!   [`SizeEstimateCache`].
//! - `adaptive` sizes chunks from the cache (or a default), then
//!   corrects once after measuring the first chunk.
//! - `production` uses the cached size verbatim and never adjusts.
//! - `disabled` runs a single chunk.
//!
//! [`ChunkPlanner`] makes the up-front [`ChunkPlan`]; a [`ChunkSizer`]
//! then decides each successive chunk's row count from what was
//! observed; a [`ChunkCursor`] turns row counts into row positions.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::config::ChunkSettings;
use crate::errors::ChunkPlanError;
use crate::errors::TableError;
use crate::table::EntityId;
use crate::table::Table;

mod cache;
mod meter;
mod summary;

pub use cache::SizeEstimateCache;
pub use meter::ChunkTracker;
pub use meter::Logged;
pub use meter::MemoryMeter;
pub use meter::ProcessRss;
pub use summary::ChunkLog;
pub use summary::ChunkSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkTrainingMode {
    Training,
    Adaptive,
    Production,
    #[default]
    Disabled,
}

impl ChunkTrainingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Adaptive => "adaptive",
            Self::Production => "production",
            Self::Disabled => "disabled",
        }
    }
}

impl Display for ChunkTrainingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkTrainingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "training" => Ok(Self::Training),
            "adaptive" => Ok(Self::Adaptive),
            "production" => Ok(Self::Production),
            "disabled" => Ok(Self::Disabled),
            other => Err(format!("unknown chunk training mode {other:?}")),
        }
    }
}

/// Up-front projection of how a dataset will be chunked.
///
/// In `training` and `adaptive` modes the actual chunk sizes drift
/// from this as memory is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub num_chunks: usize,
    pub rows_per_chunk: usize,
    pub mode: ChunkTrainingMode,
}

impl ChunkPlan {
    fn new(rows: usize, rows_per_chunk: usize, mode: ChunkTrainingMode) -> Self {
        let rows_per_chunk = rows_per_chunk.clamp(1, rows.max(1));
        Self {
            num_chunks: rows.div_ceil(rows_per_chunk),
            rows_per_chunk,
            mode,
        }
    }
}

/// Smallest per-row cost training records. A chunk that didn't
/// measurably grow memory still costs something.
const MIN_BYTES_PER_ROW: f64 = 1.0;

/// How many rows fit in the budget at a per-row cost.
fn rows_for_budget(budget: u64, bytes_per_row: f64) -> usize {
    ((budget as f64 / bytes_per_row).floor() as usize).max(1)
}

/// Plans chunking of step target datasets.
pub struct ChunkPlanner {
    settings: ChunkSettings,
    cache: Option<SizeEstimateCache>,
}

impl ChunkPlanner {
    /// The cache is only opened when the mode can use it.
    pub fn open(settings: &ChunkSettings, cache_file: &Path) -> Result<Self, ChunkPlanError> {
        let cache = match settings.training_mode {
            ChunkTrainingMode::Disabled => None,
            _ => Some(SizeEstimateCache::open(cache_file).map_err(ChunkPlanError::Cache)?),
        };
        Ok(Self {
            settings: settings.clone(),
            cache,
        })
    }

    pub fn mode(&self) -> ChunkTrainingMode {
        self.settings.training_mode
    }

    fn cached_row_size(&self, step: &str, dataset: &str, rows: usize) -> Result<Option<f64>, ChunkPlanError> {
        match &self.cache {
            Some(cache) => cache
                .get(step, dataset, rows)
                .map_err(ChunkPlanError::Cache),
            None => Ok(None),
        }
    }

    /// Should a step over this many rows of `dataset` be chunked?
    pub fn needs_chunking(&self, step: &str, dataset: &str, rows: usize) -> Result<bool, ChunkPlanError> {
        if rows == 0 || self.mode() == ChunkTrainingMode::Disabled {
            return Ok(false);
        }
        if rows > self.settings.row_threshold {
            return Ok(true);
        }
        let estimate = self.cached_row_size(step, dataset, rows)?;
        Ok(estimate.is_some_and(|per_row| rows as f64 * per_row > self.settings.chunk_size as f64))
    }

    /// Plan chunking of `row_count` rows of `dataset` for `step`.
    pub fn plan(
        &self,
        step: &str,
        dataset: &str,
        row_count: usize,
        mode: ChunkTrainingMode,
    ) -> Result<ChunkPlan, ChunkPlanError> {
        if row_count == 0 {
            return Err(ChunkPlanError::EmptyDataset {
                step: step.to_string(),
                dataset: dataset.to_string(),
            });
        }
        if mode == ChunkTrainingMode::Disabled || row_count < self.settings.min_chunk_rows {
            return Ok(ChunkPlan::new(row_count, row_count, mode));
        }
        let budget = self.settings.chunk_size;
        let rows_per_chunk = match mode {
            ChunkTrainingMode::Training => self.settings.initial_rows_per_chunk,
            ChunkTrainingMode::Adaptive => {
                let per_row = self
                    .cached_row_size(step, dataset, row_count)?
                    .unwrap_or(self.settings.default_row_size as f64);
                rows_for_budget(budget, per_row)
            }
            ChunkTrainingMode::Production => {
                let per_row = match self.cached_row_size(step, dataset, row_count)? {
                    Some(per_row) => per_row,
                    None if self.settings.strict_production => {
                        return Err(ChunkPlanError::MissingTrainedPlan {
                            step: step.to_string(),
                            dataset: dataset.to_string(),
                        })
                    }
                    None => {
                        tracing::warn!(
                            "No trained chunk size for step {step:?} on {dataset:?}; using default row size"
                        );
                        self.settings.default_row_size as f64
                    }
                };
                rows_for_budget(budget, per_row)
            }
            ChunkTrainingMode::Disabled => row_count,
        };
        let plan = ChunkPlan::new(row_count, rows_per_chunk, mode);
        tracing::debug!("Chunk plan for step {step:?} over {row_count} rows of {dataset:?}: {plan:?}");
        Ok(plan)
    }

    /// Plan exactly `chunks` chunks of near-equal size.
    pub fn plan_fixed(
        &self,
        step: &str,
        dataset: &str,
        row_count: usize,
        chunks: usize,
    ) -> Result<ChunkPlan, ChunkPlanError> {
        if row_count == 0 {
            return Err(ChunkPlanError::EmptyDataset {
                step: step.to_string(),
                dataset: dataset.to_string(),
            });
        }
        if chunks == 0 || chunks > row_count {
            return Err(ChunkPlanError::InvalidChunkPlan {
                step: step.to_string(),
                rows: row_count,
                chunks,
            });
        }
        Ok(ChunkPlan {
            num_chunks: chunks,
            rows_per_chunk: row_count.div_ceil(chunks),
            mode: self.mode(),
        })
    }

    pub fn sizer(&self, plan: ChunkPlan, row_count: usize) -> ChunkSizer {
        ChunkSizer::new(plan, row_count, self.settings.chunk_size)
    }

    pub fn fixed_sizer(&self, plan: ChunkPlan, row_count: usize) -> ChunkSizer {
        ChunkSizer::fixed(plan, row_count, self.settings.chunk_size)
    }

    /// Save what a training run learned about a step.
    pub fn finish(&mut self, step: &str, dataset: &str, row_count: usize, sizer: &ChunkSizer) -> Result<(), ChunkPlanError> {
        if sizer.plan.mode != ChunkTrainingMode::Training {
            return Ok(());
        }
        match (&mut self.cache, sizer.bytes_per_row()) {
            (Some(cache), Some(per_row)) => {
                tracing::info!(
                    "Trained step {step:?} on {dataset:?}: {per_row:.1} bytes per row"
                );
                cache
                    .put(step, dataset, row_count, per_row)
                    .map_err(ChunkPlanError::Cache)
            }
            _ => Ok(()),
        }
    }
}

/// Decides each chunk's row count as chunks complete.
#[derive(Debug, Clone)]
pub struct ChunkSizer {
    plan: ChunkPlan,
    budget: u64,
    /// Per chunk row counts when the chunk count is fixed.
    fixed: Option<Vec<usize>>,
    /// Rows of the whole dataset.
    rows: usize,
    next_rows: usize,
    bytes_per_row: Option<f64>,
    stable: bool,
    observed: usize,
}

impl ChunkSizer {
    fn new(plan: ChunkPlan, row_count: usize, budget: u64) -> Self {
        Self {
            plan,
            budget,
            fixed: None,
            rows: row_count,
            next_rows: plan.rows_per_chunk.min(row_count).max(1),
            bytes_per_row: None,
            stable: plan.num_chunks <= 1,
            observed: 0,
        }
    }

    fn fixed(plan: ChunkPlan, row_count: usize, budget: u64) -> Self {
        let n = plan.num_chunks.max(1);
        let sizes = (0..n)
            .map(|i| row_count / n + usize::from(i < row_count % n))
            .collect();
        Self {
            fixed: Some(sizes),
            stable: true,
            ..Self::new(plan, row_count, budget)
        }
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    /// Rows in the next chunk given how many are left.
    pub fn next_chunk_rows(&self, remaining: usize) -> usize {
        let rows = match &self.fixed {
            Some(sizes) => sizes.get(self.observed).copied().unwrap_or(remaining),
            None => self.next_rows,
        };
        rows.clamp(1, remaining.max(1))
    }

    /// Record the peak memory a chunk of `rows` rows took.
    pub fn observe(&mut self, rows: usize, peak_bytes: u64) {
        let first = self.observed == 0;
        self.observed += 1;
        if rows == 0 || self.fixed.is_some() {
            return;
        }
        let measured = (peak_bytes > 0).then(|| peak_bytes as f64 / rows as f64);

        match self.plan.mode {
            ChunkTrainingMode::Training => {
                let per_row = measured.unwrap_or(0.0).max(MIN_BYTES_PER_ROW);
                self.bytes_per_row = Some(per_row);
                if !self.stable {
                    let doubled = rows.saturating_mul(2).min(self.rows.max(1));
                    if (doubled as f64) * per_row < self.budget as f64 {
                        self.next_rows = doubled;
                        return;
                    }
                    self.stable = true;
                }
                self.next_rows = rows_for_budget(self.budget, per_row);
            }
            ChunkTrainingMode::Adaptive => {
                if let (true, Some(per_row)) = (first, measured) {
                    self.bytes_per_row = Some(per_row);
                    self.next_rows = rows_for_budget(self.budget, per_row);
                    tracing::debug!(
                        "Adjusted chunk size to {} rows after measuring {per_row:.1} bytes per row",
                        self.next_rows
                    );
                }
            }
            ChunkTrainingMode::Production | ChunkTrainingMode::Disabled => {}
        }
    }

    /// Latest measured per-row cost.
    pub fn bytes_per_row(&self) -> Option<f64> {
        self.bytes_per_row
    }
}

/// Walks a table's rows chunk by chunk.
///
/// With a grouping column, rows are visited group by group (groups
/// in order of first appearance) and chunk boundaries always fall
/// between groups.
#[derive(Debug, Clone)]
pub struct ChunkCursor {
    order: Vec<usize>,
    group_ends: Option<Vec<usize>>,
    pos: usize,
}

impl ChunkCursor {
    pub fn new(table: &Table, group_by: Option<&str>) -> Result<Self, TableError> {
        let Some(column) = group_by else {
            return Ok(Self {
                order: (0..table.len()).collect(),
                group_ends: None,
                pos: 0,
            });
        };

        let keys = table.int_column(column)?;
        let mut slots: HashMap<i64, usize> = HashMap::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (pos, key) in keys.iter().enumerate() {
            let slot = *slots.entry(*key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(pos);
        }

        let mut order = Vec::with_capacity(keys.len());
        let mut ends = Vec::with_capacity(groups.len());
        for group in groups {
            order.extend(group);
            ends.push(order.len());
        }
        Ok(Self {
            order,
            group_ends: Some(ends),
            pos: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.order.len() - self.pos
    }

    /// Whether chunks visit rows out of table order.
    pub fn is_reordered(&self) -> bool {
        self.order.windows(2).any(|w| w[0] > w[1])
    }

    /// Positions of the next chunk of about `rows` rows, ascending.
    pub fn next_positions(&mut self, rows: usize) -> Option<Vec<usize>> {
        if self.remaining() == 0 {
            return None;
        }
        let target = (self.pos + rows.max(1)).min(self.order.len());
        let end = match &self.group_ends {
            Some(ends) => {
                let i = ends.partition_point(|&e| e < target);
                ends.get(i).copied().unwrap_or(self.order.len())
            }
            None => target,
        };
        let mut positions = self.order[self.pos..end].to_vec();
        positions.sort_unstable();
        self.pos = end;
        Some(positions)
    }
}

/// Put the concatenated output of a grouped chunked step back in the
/// row order of the dataset it was chunked over.
///
/// Output rows are matched to `source` rows by index when both share
/// an index name, otherwise by an integer column named like the
/// source index. Rows matching nothing keep their relative order after
/// all matched rows. Tables with neither key are returned as is.
pub fn restore_row_order(output: Table, source: &Table) -> Table {
    let Some(ranks) = source_ranks(&output, source) else {
        return output;
    };
    if ranks.windows(2).all(|w| w[0] <= w[1]) {
        return output;
    }
    let mut positions: Vec<usize> = (0..output.len()).collect();
    positions.sort_by_key(|&p| ranks[p]);
    output.take(&positions)
}

fn source_ranks(output: &Table, source: &Table) -> Option<Vec<usize>> {
    let key = source.index_name()?;
    let keys = if output.index_name() == Some(key) {
        output.index()
    } else {
        output.int_column(key).ok()?
    };
    let rank: HashMap<EntityId, usize> = source
        .index()
        .iter()
        .enumerate()
        .map(|(pos, id)| (*id, pos))
        .collect();
    Some(
        keys.iter()
            .map(|k| rank.get(k).copied().unwrap_or(usize::MAX))
            .collect(),
    )
}
