//! Run settings.
//!
//! Settings come from, in increasing priority: built-in defaults, an
//! optional settings file (TOML, YAML or JSON), `SIMRUN__*`
//! environment variables (`SIMRUN__CHUNK__CHUNK_SIZE=...` for nested
//! keys) and finally command line flags.

use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::chunk::ChunkTrainingMode;
use crate::errors::ConfigurationError;
use crate::table::EntityId;

/// How the population is split across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRule {
    /// Contiguous runs of the sorted IDs.
    #[default]
    Slice,
    /// Hash of the ID modulo the worker count.
    Hash,
}

impl FromStr for PartitionRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slice" => Ok(Self::Slice),
            "hash" => Ok(Self::Hash),
            other => Err(format!("unknown partition rule {other:?}")),
        }
    }
}

/// Where chunk memory readings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterKind {
    /// Resident set size of this process.
    #[default]
    Rss,
    /// Only what step bodies report through `log_bytes`.
    Logged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    pub training_mode: ChunkTrainingMode,
    /// Memory budget of a single chunk, in bytes.
    pub chunk_size: u64,
    /// Datasets with more rows than this are considered for chunking
    /// even if their estimated size fits the budget.
    pub row_threshold: usize,
    /// Rows in the first, probing, chunk of training mode.
    pub initial_rows_per_chunk: usize,
    /// Below this many rows there is only ever one chunk.
    pub min_chunk_rows: usize,
    /// Per-row cost assumed when nothing is cached, in bytes.
    pub default_row_size: u64,
    /// Fail rather than fall back to defaults in production mode.
    pub strict_production: bool,
    pub meter: MeterKind,
    /// Size estimate cache; `<output_dir>/cache/chunk_cache.sqlite3`
    /// when unset.
    pub cache_file: Option<PathBuf>,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            training_mode: ChunkTrainingMode::Disabled,
            chunk_size: 1 << 30,
            row_threshold: 1_000_000,
            initial_rows_per_chunk: 100,
            min_chunk_rows: 10,
            default_row_size: 1024,
            strict_production: false,
            meter: MeterKind::Rss,
            cache_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    /// Population IDs to follow. Empty disables tracing.
    pub ids: Vec<EntityId>,
    /// Traceable datasets, population first.
    pub tables: Vec<String>,
    pub cleanup_trace_files_on_resume: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Global checkpoint store.
    pub pipeline_dir: PathBuf,
    /// Trace files, timing log, chunk summaries and worker dirs.
    pub output_dir: PathBuf,
    /// Step name to resume after, or `_` for the last checkpoint.
    pub resume_after: Option<String>,
    pub num_workers: usize,
    /// Dataset whose index is partitioned across workers.
    pub population: String,
    pub partition_rule: PartitionRule,
    /// Run workers as threads of this process.
    pub fast: bool,
    pub log_level: String,
    pub cleanup_pipeline_after_run: bool,
    /// Log resident memory after every step and report the run's
    /// high water mark.
    pub memory_profile: bool,
    pub chunk: ChunkSettings,
    pub trace: TraceSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            pipeline_dir: PathBuf::from("pipeline"),
            output_dir: PathBuf::from("output"),
            resume_after: None,
            num_workers: 1,
            population: "households".to_string(),
            partition_rule: PartitionRule::Slice,
            fast: false,
            log_level: "info".to_string(),
            cleanup_pipeline_after_run: false,
            memory_profile: false,
            chunk: ChunkSettings::default(),
            trace: TraceSettings::default(),
        }
    }
}

impl RunSettings {
    /// Load from an optional settings file plus `SIMRUN__*`
    /// environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_with_env_prefix(file, "SIMRUN")
    }

    fn load_with_env_prefix(file: Option<&Path>, prefix: &str) -> Result<Self, ConfigurationError> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file));
        }
        let settings: Self = builder
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Reject settings that can't describe a valid run.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |key, reason: &str| ConfigurationError::InvalidSetting {
            key,
            reason: reason.to_string(),
        };
        crate::logging::get_log_level(&self.log_level)?;
        if self.num_workers < 1 {
            return Err(invalid("num_workers", "must be at least 1"));
        }
        if self.chunk.chunk_size == 0 {
            return Err(invalid("chunk.chunk_size", "must be greater than 0"));
        }
        if self.chunk.initial_rows_per_chunk == 0 {
            return Err(invalid("chunk.initial_rows_per_chunk", "must be at least 1"));
        }
        if self.chunk.default_row_size == 0 {
            return Err(invalid("chunk.default_row_size", "must be greater than 0"));
        }
        if self.chunk.training_mode == ChunkTrainingMode::Training && self.num_workers > 1 {
            return Err(invalid(
                "chunk.training_mode",
                "training writes the shared size cache and must run with a single worker",
            ));
        }
        if !self.trace.ids.is_empty() && self.trace.tables.is_empty() {
            return Err(invalid("trace.tables", "tracing ids needs at least the population table"));
        }
        Ok(())
    }

    pub fn chunk_cache_file(&self) -> PathBuf {
        self.chunk
            .cache_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("cache").join("chunk_cache.sqlite3"))
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.output_dir.join("workers")
    }
}

/// Command line flags of a simulation binary.
#[derive(Parser, Debug, Clone, Default)]
#[command(about = "Run a simulation pipeline", long_about = None)]
pub struct RunArgs {
    /// Settings file (TOML, YAML or JSON)
    #[arg(short = 'c', long, env = "SIMRUN_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Resume after this step's checkpoint; `_` for the last one
    #[arg(short, long)]
    pub resume_after: Option<String>,

    /// Memory budget of one chunk, in bytes
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// training, adaptive, production or disabled
    #[arg(long)]
    pub chunk_training_mode: Option<ChunkTrainingMode>,

    /// Number of worker processes
    #[arg(short = 'm', long = "multiprocess")]
    pub num_workers: Option<usize>,

    #[arg(long)]
    pub partition_rule: Option<PartitionRule>,

    /// Run workers as threads instead of processes
    #[arg(long)]
    pub fast: bool,

    #[arg(long)]
    pub pipeline_dir: Option<PathBuf>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Log memory use after every step
    #[arg(long)]
    pub memory_profile: bool,
}

impl RunArgs {
    pub fn apply_to(&self, settings: &mut RunSettings) {
        if let Some(resume_after) = &self.resume_after {
            settings.resume_after = Some(resume_after.clone());
        }
        if let Some(chunk_size) = self.chunk_size {
            settings.chunk.chunk_size = chunk_size;
        }
        if let Some(mode) = self.chunk_training_mode {
            settings.chunk.training_mode = mode;
        }
        if let Some(num_workers) = self.num_workers {
            settings.num_workers = num_workers;
        }
        if let Some(rule) = self.partition_rule {
            settings.partition_rule = rule;
        }
        if self.fast {
            settings.fast = true;
        }
        if let Some(dir) = &self.pipeline_dir {
            settings.pipeline_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            settings.output_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        if self.memory_profile {
            settings.memory_profile = true;
        }
    }

    /// Settings file, environment, then these flags; validated.
    pub fn resolve(&self) -> Result<RunSettings, ConfigurationError> {
        let mut settings = RunSettings::load(self.settings.as_deref())?;
        self.apply_to(&mut settings);
        settings.validate()?;
        Ok(settings)
    }
}
