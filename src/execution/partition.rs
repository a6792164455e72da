use std::fmt::Display;
use std::hash::BuildHasher;
use std::hash::BuildHasherDefault;

use seahash::SeaHasher;
use serde::Deserialize;
use serde::Serialize;

use crate::config::PartitionRule;
use crate::table::EntityId;

/// The population IDs one worker is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPartition {
    pub worker: usize,
    pub num_workers: usize,
    pub rule: PartitionRule,
    /// Ascending.
    pub ids: Vec<EntityId>,
}

fn route(id: EntityId, num_workers: usize) -> usize {
    let hash = BuildHasherDefault::<SeaHasher>::default().hash_one(id);
    (hash % num_workers as u64) as usize
}

impl WorkerPartition {
    /// Split `ids` into `num_workers` disjoint partitions covering
    /// all of them.
    ///
    /// With [`PartitionRule::Slice`] each worker gets a contiguous run
    /// of the sorted IDs and sizes differ by at most one. With
    /// [`PartitionRule::Hash`] an ID always lands on the same worker
    /// for a given worker count regardless of which other IDs exist.
    pub fn compute(ids: &[EntityId], num_workers: usize, rule: PartitionRule) -> Vec<Self> {
        let num_workers = num_workers.max(1);
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() < num_workers {
            tracing::warn!(
                "Only {} population IDs for {num_workers} workers; some workers get nothing to do",
                sorted.len()
            );
        }

        let mut parts: Vec<Vec<EntityId>> = vec![Vec::new(); num_workers];
        match rule {
            PartitionRule::Slice => {
                let base = sorted.len() / num_workers;
                let extra = sorted.len() % num_workers;
                let mut rest = sorted.as_slice();
                for (worker, part) in parts.iter_mut().enumerate() {
                    let take = base + usize::from(worker < extra);
                    let (mine, tail) = rest.split_at(take);
                    part.extend_from_slice(mine);
                    rest = tail;
                }
            }
            PartitionRule::Hash => {
                for id in sorted {
                    parts[route(id, num_workers)].push(id);
                }
            }
        }

        parts
            .into_iter()
            .enumerate()
            .map(|(worker, ids)| Self {
                worker,
                num_workers,
                rule,
                ids,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Display for WorkerPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "partition {} of {} by {:?}, {} ids",
            self.worker, self.num_workers, self.rule, self.ids.len()
        )?;
        if let (Some(first), Some(last)) = (self.ids.first(), self.ids.last()) {
            write!(f, " in {first}..={last}")?;
        }
        Ok(())
    }
}
