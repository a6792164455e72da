//! Memory profiling of a run.
//!
//! With `memory_profile` on, every process of a run appends its
//! resident memory after each step to `mem.csv` (`mem.w<k>.csv` for
//! workers). At the end of the run those logs are merged into
//! `mem_summary.csv` and the run's high water mark is logged. A
//! single process run also samples its memory on a background thread
//! into `memory_profile.csv`.

use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crate::chunk::MemoryMeter;
use crate::chunk::ProcessRss;
use crate::errors::IoContext;
use crate::errors::StoreError;
use crate::output::append_csv;
use crate::recovery::write_atomic;

pub const MEMORY_PROFILE_FILE: &str = "memory_profile.csv";
pub const MEMORY_SUMMARY_FILE: &str = "mem_summary.csv";
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

const LOG_HEADER: &str = "step_name,rss_bytes\n";

/// Resident memory of this process after each step.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    rows: Vec<(String, u64)>,
}

impl MemoryLog {
    pub fn file_name(worker: Option<usize>) -> String {
        match worker {
            Some(w) => format!("mem.w{w}.csv"),
            None => "mem.csv".to_string(),
        }
    }

    /// Take a reading after `step`. Platforms without a reading record
    /// nothing.
    pub fn record(&mut self, step: &str, meter: &dyn MemoryMeter) {
        if let Some(bytes) = meter.current_bytes() {
            self.rows.push((step.to_string(), bytes));
        }
    }

    pub fn record_rss(&mut self, step: &str) {
        self.record(step, &ProcessRss);
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Append the readings to this process's log in `dir`.
    pub fn append_to(&self, dir: &Path, worker: Option<usize>) -> Result<(), StoreError> {
        let mut lines = String::new();
        for (step, bytes) in &self.rows {
            lines.push_str(&format!("{step},{bytes}\n"));
        }
        append_csv(&dir.join(Self::file_name(worker)), LOG_HEADER, &lines)
    }
}

/// Highest resident memory any process of a run reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighWaterMark {
    pub bytes: u64,
    pub step: String,
    /// `main` or `w<k>`.
    pub process: String,
}

/// Merge every process's memory log in `output_dir` into
/// [`MEMORY_SUMMARY_FILE`], one row per step with the number of
/// processes that ran it and their largest reading. Returns the
/// run's high water mark, if anything was logged.
pub fn consolidate_memory_logs(output_dir: &Path) -> Result<Option<HighWaterMark>, StoreError> {
    let mut logs = Vec::new();
    for entry in fs::read_dir(output_dir).reraise_at("can't list output dir", output_dir)? {
        let path = entry.reraise_at("can't list output dir", output_dir)?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let process = if name == MemoryLog::file_name(None) {
            "main".to_string()
        } else {
            match name.strip_prefix("mem.").and_then(|n| n.strip_suffix(".csv")) {
                Some(process) => process.to_string(),
                None => continue,
            }
        };
        logs.push((process, path));
    }
    logs.sort();

    // (step, processes, max bytes), in order of first appearance.
    let mut steps: Vec<(String, usize, u64)> = Vec::new();
    let mut hwm: Option<HighWaterMark> = None;
    for (process, path) in &logs {
        let text = fs::read_to_string(path).reraise_at("can't read memory log", path)?;
        for line in text.lines().skip(1) {
            let Some((step, bytes)) = line.rsplit_once(',') else {
                continue;
            };
            let Ok(bytes) = bytes.parse::<u64>() else {
                tracing::debug!("Skipping bad memory log line {line:?} in {path:?}");
                continue;
            };
            match steps.iter_mut().find(|(s, _, _)| s == step) {
                Some((_, processes, max)) => {
                    *processes += 1;
                    *max = (*max).max(bytes);
                }
                None => steps.push((step.to_string(), 1, bytes)),
            }
            if hwm.as_ref().map_or(true, |h| bytes > h.bytes) {
                hwm = Some(HighWaterMark {
                    bytes,
                    step: step.to_string(),
                    process: process.clone(),
                });
            }
        }
    }
    if steps.is_empty() {
        return Ok(None);
    }

    let mut csv = String::from("step_name,processes,max_rss_bytes\n");
    for (step, processes, max) in &steps {
        csv.push_str(&format!("{step},{processes},{max}\n"));
    }
    write_atomic(&output_dir.join(MEMORY_SUMMARY_FILE), csv.as_bytes())?;
    Ok(hwm)
}

/// Samples this process's resident memory into a CSV file on a
/// background thread until dropped.
pub struct MemorySampler {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MemorySampler {
    pub fn start(path: &Path, interval: Duration) -> Result<Self, StoreError> {
        let mut file = File::create(path).reraise_at("can't create memory profile", path)?;
        file.write_all(b"seconds,rss_bytes\n")
            .reraise_at("can't write memory profile", path)?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let started = Instant::now();
        let join = thread::Builder::new()
            .name("simrun-memory".to_string())
            .spawn(move || loop {
                if let Some(bytes) = ProcessRss.current_bytes() {
                    let line = format!("{:.3},{bytes}\n", started.elapsed().as_secs_f64());
                    if let Err(err) = file.write_all(line.as_bytes()) {
                        tracing::warn!("Stopping memory profile: {err}");
                        return;
                    }
                }
                if flag.load(Ordering::Relaxed) {
                    return;
                }
                thread::park_timeout(interval);
            })
            .reraise_at("can't start memory sampler", path)?;
        tracing::info!("Sampling memory every {interval:?} into {path:?}");
        Ok(Self {
            stop,
            join: Some(join),
        })
    }
}

impl Drop for MemorySampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            join.thread().unpark();
            if join.join().is_err() {
                tracing::warn!("Memory sampler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    struct Fixed(u64);

    impl MemoryMeter for Fixed {
        fn current_bytes(&self) -> Option<u64> {
            Some(self.0)
        }
    }

    #[test]
    fn logs_merge_into_summary() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();

        let mut main = MemoryLog::default();
        main.record("households", &Fixed(100));
        main.record("summary", &Fixed(150));
        main.append_to(dir, None).unwrap();
        for (worker, bytes) in [(0, 300), (1, 700)] {
            let mut log = MemoryLog::default();
            log.record("persons", &Fixed(bytes));
            log.append_to(dir, Some(worker)).unwrap();
        }

        let hwm = consolidate_memory_logs(dir).unwrap().unwrap();
        assert_eq!(
            hwm,
            HighWaterMark {
                bytes: 700,
                step: "persons".to_string(),
                process: "w1".to_string(),
            }
        );
        let summary = fs::read_to_string(dir.join(MEMORY_SUMMARY_FILE)).unwrap();
        assert_eq!(
            summary,
            "step_name,processes,max_rss_bytes\n\
             households,1,100\n\
             summary,1,150\n\
             persons,2,700\n"
        );
    }

    #[test]
    fn nothing_logged_is_no_summary() {
        let tmp = tempdir().unwrap();
        assert_eq!(consolidate_memory_logs(tmp.path()).unwrap(), None);
        assert!(!tmp.path().join(MEMORY_SUMMARY_FILE).exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sampler_writes_until_dropped() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join(MEMORY_PROFILE_FILE);
        let sampler = MemorySampler::start(&path, Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(100));
        drop(sampler);

        let profile = fs::read_to_string(&path).unwrap();
        let mut lines = profile.lines();
        assert_eq!(lines.next(), Some("seconds,rss_bytes"));
        assert!(lines.count() >= 2, "{profile}");
    }
}
