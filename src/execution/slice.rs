//! Cutting the dataset pool into per-worker pieces and putting the
//! pieces back together.

use std::collections::BTreeSet;
use std::collections::HashMap;

use crate::codec;
use crate::errors::ConfigurationError;
use crate::errors::EngineError;
use crate::errors::StoreError;
use crate::errors::TableError;
use crate::execution::WorkerPartition;
use crate::table::Datasets;
use crate::table::EntityId;
use crate::table::Table;

/// How one dataset is handed to workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Share {
    /// Each worker gets the rows whose key is one of its entities.
    ///
    /// `key` is the index name the rows are matched against; the row
    /// key is the dataset's own index when `column` is [`None`].
    Sliced { key: String, column: Option<String> },
    /// Every worker gets a full copy.
    Broadcast,
}

/// Decides which datasets follow the population into partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePlan {
    /// In the order they can be sliced; parents before children.
    shares: Vec<(String, Share)>,
}

impl SlicePlan {
    /// Relate every dataset in the pool to the population.
    ///
    /// A dataset is sliced when its index name is the index name of a
    /// sliced dataset, or when it has a column named after one. That
    /// is applied until nothing more can be related; whatever is left
    /// is broadcast.
    pub fn new(datasets: &Datasets, population: &str) -> Result<Self, ConfigurationError> {
        let root = datasets
            .get(population)
            .ok_or_else(|| ConfigurationError::MissingPopulation(population.to_string()))?;
        let root_key = root.index_name().ok_or_else(|| ConfigurationError::InvalidSetting {
            key: "population",
            reason: format!("dataset {population:?} has no index name"),
        })?;

        let mut shares = vec![(
            population.to_string(),
            Share::Sliced {
                key: root_key.to_string(),
                column: None,
            },
        )];
        let mut keys = vec![root_key.to_string()];
        let mut pending: Vec<(&String, &Table)> = datasets
            .iter()
            .filter(|(name, _)| name.as_str() != population)
            .collect();

        loop {
            let before = pending.len();
            pending.retain(|(name, table)| {
                let share = keys.iter().find_map(|key| {
                    if table.index_name() == Some(key.as_str()) {
                        Some(Share::Sliced {
                            key: key.clone(),
                            column: None,
                        })
                    } else if table.int_column(key).is_ok() {
                        Some(Share::Sliced {
                            key: key.clone(),
                            column: Some(key.clone()),
                        })
                    } else {
                        None
                    }
                });
                match share {
                    Some(share) => {
                        shares.push((name.to_string(), share));
                        if let Some(own) = table.index_name() {
                            if !keys.iter().any(|k| k == own) {
                                keys.push(own.to_string());
                            }
                        }
                        false
                    }
                    None => true,
                }
            });
            if pending.len() == before {
                break;
            }
        }
        for (name, _) in pending {
            shares.push((name.clone(), Share::Broadcast));
        }

        for (name, share) in &shares {
            tracing::debug!("Dataset {name:?} is {share:?}");
        }
        Ok(Self { shares })
    }

    pub fn share(&self, dataset: &str) -> Option<&Share> {
        self.shares
            .iter()
            .find(|(name, _)| name == dataset)
            .map(|(_, share)| share)
    }

    pub fn broadcast(&self) -> BTreeSet<String> {
        self.shares
            .iter()
            .filter(|(_, share)| *share == Share::Broadcast)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The datasets worker `partition` starts from.
    pub fn slice(&self, datasets: &Datasets, partition: &WorkerPartition) -> Result<Datasets, TableError> {
        let mut keys: HashMap<String, Vec<EntityId>> = HashMap::new();
        let mut out = Datasets::new();
        for (name, share) in &self.shares {
            let Some(table) = datasets.get(name) else {
                continue;
            };
            let piece = match share {
                Share::Broadcast => table.clone(),
                Share::Sliced { key, column } => {
                    let ids = match keys.get(key.as_str()) {
                        Some(ids) => ids.as_slice(),
                        // Only the population has no parent.
                        None => partition.ids.as_slice(),
                    };
                    table.slice_ids(ids, column.as_deref())?
                }
            };
            if let (Share::Sliced { .. }, Some(own)) = (share, piece.index_name()) {
                keys.entry(own.to_string()).or_insert_with(|| piece.index().to_vec());
            }
            out.insert(name.clone(), piece);
        }
        Ok(out)
    }
}

/// Merge what each worker ended with into one pool.
///
/// `parts` are in worker order. Every worker must end with the same
/// copy of a broadcast dataset (or none at all), which is then kept
/// once. Everything else is concatenated in worker order, and an ID
/// produced by two workers is an error.
pub fn gather(mut parts: Vec<Datasets>, broadcast: &BTreeSet<String>) -> Result<Datasets, EngineError> {
    let names: BTreeSet<String> = parts.iter().flat_map(|p| p.keys().cloned()).collect();
    let mut merged = Datasets::new();
    for name in names {
        if broadcast.contains(&name) {
            let mut copies = parts.iter_mut().map(|p| p.remove(&name)).enumerate();
            let Some((_, kept)) = copies.next() else {
                continue;
            };
            let kept_digest = copy_digest(&name, kept.as_ref())?;
            for (worker, copy) in copies {
                if copy_digest(&name, copy.as_ref())? != kept_digest {
                    return Err(EngineError::BroadcastDiverged {
                        dataset: name.clone(),
                        workers: (0, worker),
                    });
                }
            }
            if let Some(table) = kept {
                merged.insert(name, table);
            }
            continue;
        }

        let mut owner: HashMap<EntityId, usize> = HashMap::new();
        let mut tables = Vec::new();
        for (worker, part) in parts.iter_mut().enumerate() {
            let Some(table) = part.remove(&name) else {
                continue;
            };
            for &id in table.index() {
                if let Some(&first) = owner.get(&id) {
                    return Err(EngineError::PartitionOverlap {
                        dataset: name,
                        id,
                        workers: (first, worker),
                    });
                }
                owner.insert(id, worker);
            }
            tables.push(table);
        }
        merged.insert(name, Table::concat(tables)?);
    }
    Ok(merged)
}

fn copy_digest(name: &str, table: Option<&Table>) -> Result<Option<String>, StoreError> {
    table
        .map(|t| codec::encode(name, t).map(|bytes| codec::digest(&bytes)))
        .transpose()
}
