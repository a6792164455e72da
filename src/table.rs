//! Indexed, column-oriented tables.
//!
//! A [`Table`] is the unit of data that steps read and write through
//! the pipeline. Every row is identified by an [`EntityId`] in the
//! index and index values are unique at all times; every way of
//! building a table checks this.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::ops::Range;

use serde::Deserialize;
use serde::Serialize;

use crate::codec::float_bits;
use crate::errors::TableError;

/// ID of a single row (a household, person, tour...).
pub type EntityId = i64;

/// The pool of named datasets a run operates on.
pub type Datasets = BTreeMap<String, Table>;

/// One typed column of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum Column {
    Int(Vec<i64>),
    /// Stored as raw bit patterns so restores are bit-identical.
    Float(#[serde(with = "float_bits")] Vec<f64>),
    Text(Vec<String>),
    Bool(Vec<bool>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Text(v) => v.len(),
            Column::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Column::Int(_) => "int",
            Column::Float(_) => "float",
            Column::Text(_) => "text",
            Column::Bool(_) => "bool",
        }
    }

    pub fn value(&self, position: usize) -> Option<Value> {
        match self {
            Column::Int(v) => v.get(position).copied().map(Value::Int),
            Column::Float(v) => v.get(position).copied().map(Value::Float),
            Column::Text(v) => v.get(position).cloned().map(Value::Text),
            Column::Bool(v) => v.get(position).copied().map(Value::Bool),
        }
    }

    fn take(&self, positions: &[usize]) -> Self {
        fn pick<T: Clone>(values: &[T], positions: &[usize]) -> Vec<T> {
            positions.iter().map(|&p| values[p].clone()).collect()
        }
        match self {
            Column::Int(v) => Column::Int(pick(v, positions)),
            Column::Float(v) => Column::Float(pick(v, positions)),
            Column::Text(v) => Column::Text(pick(v, positions)),
            Column::Bool(v) => Column::Bool(pick(v, positions)),
        }
    }

    fn slice(&self, range: Range<usize>) -> Self {
        match self {
            Column::Int(v) => Column::Int(v[range].to_vec()),
            Column::Float(v) => Column::Float(v[range].to_vec()),
            Column::Text(v) => Column::Text(v[range].to_vec()),
            Column::Bool(v) => Column::Bool(v[range].to_vec()),
        }
    }

    fn empty_like(&self) -> Self {
        match self {
            Column::Int(_) => Column::Int(Vec::new()),
            Column::Float(_) => Column::Float(Vec::new()),
            Column::Text(_) => Column::Text(Vec::new()),
            Column::Bool(_) => Column::Bool(Vec::new()),
        }
    }

    fn extend(&mut self, name: &str, other: Column) -> Result<(), TableError> {
        match (self, other) {
            (Column::Int(a), Column::Int(b)) => a.extend(b),
            (Column::Float(a), Column::Float(b)) => a.extend(b),
            (Column::Text(a), Column::Text(b)) => a.extend(b),
            (Column::Bool(a), Column::Bool(b)) => a.extend(b),
            (a, b) => {
                return Err(TableError::ColumnType {
                    column: name.to_string(),
                    expected: a.kind(),
                    found: b.kind(),
                })
            }
        }
        Ok(())
    }

    fn approx_bytes(&self) -> u64 {
        let bytes = match self {
            Column::Int(v) => v.len() * 8,
            Column::Float(v) => v.len() * 8,
            Column::Text(v) => v.iter().map(|s| s.len() + 24).sum(),
            Column::Bool(v) => v.len(),
        };
        bytes as u64
    }
}

/// A single cell, used when rows are pulled out for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

/// A named dataset's contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    index_name: Option<String>,
    index: Vec<EntityId>,
    columns: BTreeMap<String, Column>,
}

fn check_unique(index: &[EntityId]) -> Result<(), TableError> {
    let mut seen = HashSet::with_capacity(index.len());
    for id in index {
        if !seen.insert(*id) {
            return Err(TableError::DuplicateIndex { id: *id });
        }
    }
    Ok(())
}

impl Table {
    pub fn new(index_name: Option<&str>, index: Vec<EntityId>) -> Result<Self, TableError> {
        check_unique(&index)?;
        Ok(Self {
            index_name: index_name.map(String::from),
            index,
            columns: BTreeMap::new(),
        })
    }

    /// Builder-style [`Table::set_column`].
    pub fn with_column(mut self, name: &str, column: Column) -> Result<Self, TableError> {
        self.set_column(name, column)?;
        Ok(self)
    }

    pub fn set_column(&mut self, name: &str, column: Column) -> Result<(), TableError> {
        if column.len() != self.index.len() {
            return Err(TableError::LengthMismatch {
                column: name.to_string(),
                expected: self.index.len(),
                found: column.len(),
            });
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }

    pub fn index_name(&self) -> Option<&str> {
        self.index_name.as_deref()
    }

    pub fn set_index_name(&mut self, index_name: Option<&str>) {
        self.index_name = index_name.map(String::from);
    }

    pub fn index(&self) -> &[EntityId] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, col)| (name.as_str(), col))
    }

    /// Borrow an integer column, typically a foreign key.
    pub fn int_column(&self, name: &str) -> Result<&[i64], TableError> {
        match self.columns.get(name) {
            Some(Column::Int(values)) => Ok(values),
            Some(other) => Err(TableError::ColumnType {
                column: name.to_string(),
                expected: "int",
                found: other.kind(),
            }),
            None => Err(TableError::ColumnMissing {
                column: name.to_string(),
            }),
        }
    }

    /// Select rows by position, in the order given.
    ///
    /// Positions must be distinct, otherwise the index would repeat.
    pub fn take(&self, positions: &[usize]) -> Self {
        Self {
            index_name: self.index_name.clone(),
            index: positions.iter().map(|&p| self.index[p]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.take(positions)))
                .collect(),
        }
    }

    /// Contiguous range of rows.
    pub fn slice_rows(&self, range: Range<usize>) -> Self {
        Self {
            index_name: self.index_name.clone(),
            index: self.index[range.clone()].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.slice(range.clone())))
                .collect(),
        }
    }

    /// Same schema, no rows.
    pub fn empty_like(&self) -> Self {
        Self {
            index_name: self.index_name.clone(),
            index: Vec::new(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.empty_like()))
                .collect(),
        }
    }

    /// Positions of rows whose key is in `ids`.
    ///
    /// The key is the index when `column` is [`None`], otherwise the
    /// named integer column.
    pub fn positions_in(
        &self,
        ids: &HashSet<EntityId>,
        column: Option<&str>,
    ) -> Result<Vec<usize>, TableError> {
        let keys = match column {
            Some(column) => self.int_column(column)?,
            None => &self.index,
        };
        Ok(keys
            .iter()
            .enumerate()
            .filter(|(_, key)| ids.contains(key))
            .map(|(pos, _)| pos)
            .collect())
    }

    /// Rows whose key (index or named column) is in `ids`, keeping
    /// row order.
    pub fn slice_ids(&self, ids: &[EntityId], column: Option<&str>) -> Result<Self, TableError> {
        let ids: HashSet<EntityId> = ids.iter().copied().collect();
        let positions = self.positions_in(&ids, column)?;
        Ok(self.take(&positions))
    }

    /// Stack tables with identical schemas, in order.
    pub fn concat(tables: impl IntoIterator<Item = Table>) -> Result<Self, TableError> {
        let mut tables = tables.into_iter();
        let mut acc = tables.next().ok_or(TableError::NothingToConcat)?;
        for table in tables {
            if table.index_name != acc.index_name {
                return Err(TableError::SchemaMismatch(format!(
                    "index name {:?} vs {:?}",
                    acc.index_name, table.index_name
                )));
            }
            if !table.columns.keys().eq(acc.columns.keys()) {
                return Err(TableError::SchemaMismatch(format!(
                    "columns {:?} vs {:?}",
                    acc.columns.keys().collect::<Vec<_>>(),
                    table.columns.keys().collect::<Vec<_>>()
                )));
            }
            acc.index.extend(table.index);
            for (name, col) in table.columns {
                if let Some(acc_col) = acc.columns.get_mut(&name) {
                    acc_col.extend(&name, col)?;
                }
            }
        }
        check_unique(&acc.index)?;
        Ok(acc)
    }

    /// Rough in-memory footprint, used when estimating chunk sizes.
    pub fn approx_bytes(&self) -> u64 {
        (self.index.len() * 8) as u64 + self.columns.values().map(Column::approx_bytes).sum::<u64>()
    }

    /// All cells of one row, keyed by column name.
    pub fn row(&self, position: usize) -> BTreeMap<String, Value> {
        self.columns
            .iter()
            .filter_map(|(name, col)| col.value(position).map(|v| (name.clone(), v)))
            .collect()
    }
}
