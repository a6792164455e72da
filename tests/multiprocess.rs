//! Runs the demo binary with worker processes.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use simrun::recovery::CheckpointRef;
use simrun::recovery::CheckpointStore;
use simrun::table::Datasets;
use tempfile::tempdir;

fn run_demo(out: &Path, workers: usize) {
    let status = Command::new(env!("CARGO_BIN_EXE_simrun-demo"))
        .arg("--multiprocess")
        .arg(workers.to_string())
        .arg("--output-dir")
        .arg(out)
        .arg("--pipeline-dir")
        .arg(out.join("pipeline"))
        .arg("--log-level")
        .arg("warn")
        .env_remove("SIMRUN_SETTINGS")
        .status()
        .unwrap();
    assert!(status.success(), "{status}");
}

fn last_checkpoint(out: &Path) -> Datasets {
    CheckpointStore::open(&out.join("pipeline"))
        .unwrap()
        .restore(&CheckpointRef::Last)
        .unwrap()
        .1
}

#[test]
fn worker_processes_match_single_process() {
    let tmp = tempdir().unwrap();
    let single: PathBuf = tmp.path().join("single");
    let multi: PathBuf = tmp.path().join("multi");
    run_demo(&single, 1);
    run_demo(&multi, 2);

    assert!(multi.join("timing_log.w0.csv").exists());
    assert!(multi.join("timing_log.w1.csv").exists());
    let gathered = last_checkpoint(&multi);
    assert_eq!(gathered["summary"].int_column("households").unwrap(), &[2000]);
    assert_eq!(gathered, last_checkpoint(&single));
}
