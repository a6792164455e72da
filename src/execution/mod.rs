//! Spreading steps over worker processes.
//!
//! A step list is cut into [`Segment`]s. Runs of ordinary steps are
//! partitioned: the population is split by [`WorkerPartition`], every
//! dataset related to it is sliced by a [`SlicePlan`], and each worker
//! runs the whole segment on its slice in a private directory. Workers
//! never talk to each other or to the coordinator; once all of them
//! are done their results are [`gather`]ed into one pool. Coalesce
//! steps need the whole population and form single-step segments run
//! by the coordinator itself.
//!
//! See [`crate::run`] for the coordinator loop and
//! [`crate::worker`] for the worker side.

use std::ops::Range;

use crate::errors::ConfigurationError;
use crate::scheduler::StepRegistry;

mod launcher;
mod partition;
mod slice;

pub use launcher::ProcessLauncher;
pub use launcher::ThreadLauncher;
pub use launcher::WorkerHandle;
pub use launcher::WorkerLauncher;
pub use launcher::PROC_ID_ENV;
pub use launcher::WORKER_DIR_ENV;
pub use partition::WorkerPartition;
pub use slice::gather;
pub use slice::Share;
pub use slice::SlicePlan;

/// A stretch of the step list run one way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Indices of consecutive steps run by every worker.
    Partitioned(Range<usize>),
    /// Index of a step run once by the coordinator.
    Coalesce(usize),
}

/// Cut `steps[start..]` into segments. Indices refer to `steps`.
pub fn segments(
    steps: &[String],
    start: usize,
    registry: &StepRegistry,
) -> Result<Vec<Segment>, ConfigurationError> {
    let mut out = Vec::new();
    let mut open: Option<usize> = None;
    for (index, name) in steps.iter().enumerate().skip(start) {
        let spec = registry
            .spec(name)
            .ok_or_else(|| ConfigurationError::UnknownStep(name.clone()))?;
        if spec.coalesce {
            if let Some(from) = open.take() {
                out.push(Segment::Partitioned(from..index));
            }
            out.push(Segment::Coalesce(index));
        } else if open.is_none() {
            open = Some(index);
        }
    }
    if let Some(from) = open {
        out.push(Segment::Partitioned(from..steps.len()));
    }
    Ok(out)
}
