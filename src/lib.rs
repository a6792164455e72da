//! A checkpointed, resumable step runner for microsimulation
//! pipelines.
//!
//! A pipeline is an ordered list of named steps, each a function over
//! a pool of named [`table::Table`]s. The [`scheduler::Scheduler`]
//! runs the steps in order and commits every result to a
//! [`recovery::CheckpointStore`], so a run can resume after any step.
//! Steps over oversized datasets are run in memory-bounded chunks
//! planned by [`chunk::ChunkPlanner`]; long pipelines can be spread
//! over worker processes by [`run::run_multiprocess`]; and a handful
//! of entities can be followed through the whole run with
//! [`trace::TraceRegistry`].
//!
//! Binaries build a [`scheduler::StepRegistry`] and hand it to
//! [`run::cli_main`].

pub mod chunk;
pub(crate) mod codec;
pub mod config;
pub mod errors;
pub mod execution;
pub mod logging;
pub mod memory;
#[macro_use]
pub mod metrics;
pub mod output;
pub mod recovery;
pub mod run;
pub mod scheduler;
pub mod table;
pub mod trace;
pub mod worker;

pub use config::RunArgs;
pub use config::RunSettings;
pub use errors::EngineError;
pub use run::cli_main;
pub use run::run_main;
pub use scheduler::ChunkTarget;
pub use scheduler::StepContext;
pub use scheduler::StepRegistry;
pub use scheduler::StepSpec;
pub use table::Column;
pub use table::Table;
