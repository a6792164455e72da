use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

#[cfg(unix)]
use nix::sys::signal::kill;
#[cfg(unix)]
use nix::sys::signal::Signal;
#[cfg(unix)]
use nix::unistd::Pid;

use crate::errors::EngineError;
use crate::scheduler::RunSummary;
use crate::scheduler::StepRegistry;
use crate::worker::worker_main;

/// Set in a re-executed worker process to its index.
pub const PROC_ID_ENV: &str = "__SIMRUN_PROC_ID";
/// Set in a re-executed worker process to its private directory.
pub const WORKER_DIR_ENV: &str = "__SIMRUN_WORKER_DIR";

/// How long a terminated worker process gets to reach a step or chunk
/// boundary before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(20);

fn launch_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Setup {
        what: "worker",
        message: err.to_string(),
    }
}

/// A running worker.
pub trait WorkerHandle: Send {
    /// `None` while running, then whether it succeeded.
    fn try_wait(&mut self) -> Result<Option<bool>, EngineError>;

    /// Ask the worker to stop, then wait for it to go away.
    fn terminate(&mut self);
}

/// Starts a worker on a prepared worker directory.
pub trait WorkerLauncher {
    fn launch(&self, worker: usize, dir: &Path) -> Result<Box<dyn WorkerHandle>, EngineError>;
}

/// Re-executes the current binary once per worker.
///
/// The binary must call [`crate::run::cli_main`], which notices
/// [`WORKER_DIR_ENV`] and runs the worker instead of a whole run.
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, worker: usize, dir: &Path) -> Result<Box<dyn WorkerHandle>, EngineError> {
        let mut args = std::env::args();
        let program = args
            .next()
            .ok_or_else(|| launch_err("can't find the current program in its arguments"))?;
        let child = Command::new(program)
            .env(PROC_ID_ENV, worker.to_string())
            .env(WORKER_DIR_ENV, dir)
            .args(args.collect::<Vec<String>>())
            .spawn()
            .map_err(launch_err)?;
        tracing::info!("Started worker {worker} as process {}", child.id());
        Ok(Box::new(ProcessHandle {
            worker,
            child,
            grace: TERMINATE_GRACE,
        }))
    }
}

struct ProcessHandle {
    worker: usize,
    child: Child,
    grace: Duration,
}

impl ProcessHandle {
    /// Send SIGTERM, which the worker turns into an interrupt.
    #[cfg(unix)]
    fn request_stop(&self) -> bool {
        let pid = Pid::from_raw(self.child.id() as i32);
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("Can't signal worker {}: {err}", self.worker);
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&self) -> bool {
        false
    }

    /// Whether the process exited before `deadline`.
    fn exited_by(&mut self, deadline: Instant) -> bool {
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                Ok(None) => return false,
                Err(err) => {
                    tracing::debug!("Can't poll worker {}: {err}", self.worker);
                    return false;
                }
            }
        }
    }
}

impl WorkerHandle for ProcessHandle {
    fn try_wait(&mut self) -> Result<Option<bool>, EngineError> {
        let status = self.child.try_wait().map_err(launch_err)?;
        Ok(status.map(|status| status.success()))
    }

    fn terminate(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        if self.request_stop() && self.exited_by(Instant::now() + self.grace) {
            tracing::info!("Worker {} stopped", self.worker);
            return;
        }
        tracing::warn!(
            "Worker {} did not stop within {:?}; killing it",
            self.worker,
            self.grace
        );
        if let Err(err) = self.child.kill() {
            tracing::debug!("Can't kill worker {}: {err}", self.worker);
        }
        if let Err(err) = self.child.wait() {
            tracing::debug!("Can't reap worker {}: {err}", self.worker);
        }
    }
}

/// Runs each worker on a thread of this process.
///
/// Workers still only share what's on disk, so this behaves like
/// [`ProcessLauncher`] without the process startup cost.
pub struct ThreadLauncher {
    registry: Arc<StepRegistry>,
}

impl ThreadLauncher {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, worker: usize, dir: &Path) -> Result<Box<dyn WorkerHandle>, EngineError> {
        let interrupt = Arc::new(AtomicBool::new(false));
        let registry = Arc::clone(&self.registry);
        let dir: PathBuf = dir.to_path_buf();
        let flag = Arc::clone(&interrupt);
        let join = thread::Builder::new()
            .name(format!("simrun-worker-{worker}"))
            .spawn(move || worker_main(&dir, registry, flag))
            .map_err(launch_err)?;
        Ok(Box::new(ThreadHandle {
            join: Some(join),
            interrupt,
            outcome: None,
        }))
    }
}

struct ThreadHandle {
    join: Option<JoinHandle<Result<RunSummary, EngineError>>>,
    interrupt: Arc<AtomicBool>,
    outcome: Option<bool>,
}

impl ThreadHandle {
    fn join(&mut self) {
        if let Some(join) = self.join.take() {
            self.outcome = Some(matches!(join.join(), Ok(Ok(_))));
        }
    }
}

impl WorkerHandle for ThreadHandle {
    fn try_wait(&mut self) -> Result<Option<bool>, EngineError> {
        if self.join.as_ref().is_some_and(JoinHandle::is_finished) {
            self.join();
        }
        Ok(self.outcome)
    }

    fn terminate(&mut self) {
        // Threads can't be killed; the worker stops at its next step
        // or chunk boundary.
        self.interrupt.store(true, Ordering::Relaxed);
        self.join();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    fn spawn(script: &str, grace: Duration) -> ProcessHandle {
        let child = Command::new("sh").args(["-c", script]).spawn().unwrap();
        // Let the shell install its traps.
        thread::sleep(Duration::from_millis(300));
        ProcessHandle {
            worker: 0,
            child,
            grace,
        }
    }

    #[test]
    fn terminate_lets_worker_exit_on_sigterm() {
        let mut handle = spawn("exec sleep 30", Duration::from_secs(10));
        let started = Instant::now();
        handle.terminate();
        assert!(started.elapsed() < Duration::from_secs(5));
        let status = handle.child.try_wait().unwrap().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[test]
    fn terminate_kills_after_grace() {
        let mut handle = spawn("trap '' TERM; exec sleep 30", Duration::from_millis(200));
        let started = Instant::now();
        handle.terminate();
        assert!(started.elapsed() >= Duration::from_millis(200));
        let status = handle.child.try_wait().unwrap().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }
}
