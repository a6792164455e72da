use std::fs;
use std::time::Duration;
use std::time::Instant;

use crate::config::MeterKind;

/// Source of memory usage readings.
pub trait MemoryMeter: Send {
    /// Current usage in bytes, if this meter can see it.
    fn current_bytes(&self) -> Option<u64>;
}

/// Resident set size of this process, from `/proc/self/status`.
///
/// Reads nothing on platforms without procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRss;

impl MemoryMeter for ProcessRss {
    fn current_bytes(&self) -> Option<u64> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

/// Only counts what step bodies report.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logged;

impl MemoryMeter for Logged {
    fn current_bytes(&self) -> Option<u64> {
        None
    }
}

impl MeterKind {
    pub fn build(&self) -> Box<dyn MemoryMeter> {
        match self {
            MeterKind::Rss => Box::new(ProcessRss),
            MeterKind::Logged => Box::new(Logged),
        }
    }
}

/// Peak memory and elapsed time of one chunk.
///
/// The peak is the larger of the meter's growth over its reading at
/// the start of the chunk and the largest byte count logged.
pub struct ChunkTracker<'a> {
    meter: &'a dyn MemoryMeter,
    started: Instant,
    baseline: Option<u64>,
    high_water: Option<u64>,
    logged: u64,
}

impl<'a> ChunkTracker<'a> {
    pub fn start(meter: &'a dyn MemoryMeter) -> Self {
        let baseline = meter.current_bytes();
        Self {
            meter,
            started: Instant::now(),
            baseline,
            high_water: baseline,
            logged: 0,
        }
    }

    pub fn sample(&mut self) {
        if let Some(now) = self.meter.current_bytes() {
            self.high_water = Some(self.high_water.map_or(now, |hw| hw.max(now)));
        }
    }

    /// A step reported holding `bytes`.
    pub fn log_bytes(&mut self, bytes: u64) {
        self.logged = self.logged.max(bytes);
        self.sample();
    }

    /// Elapsed time and peak bytes.
    pub fn finish(mut self) -> (Duration, u64) {
        self.sample();
        let grown = match (self.baseline, self.high_water) {
            (Some(base), Some(hw)) => hw.saturating_sub(base),
            _ => 0,
        };
        (self.started.elapsed(), grown.max(self.logged))
    }
}

#[test]
fn parses_vm_rss() {
    let status = "Name:\tsimrun\nVmPeak:\t  2000 kB\nVmRSS:\t    1234 kB\nThreads:\t1\n";
    assert_eq!(parse_vm_rss(status), Some(1234 * 1024));
    assert_eq!(parse_vm_rss("Name:\tx\n"), None);
}

#[test]
fn logged_bytes_set_the_peak() {
    let meter = Logged;
    let mut tracker = ChunkTracker::start(&meter);
    tracker.log_bytes(500);
    tracker.log_bytes(300);
    let (_, peak) = tracker.finish();
    assert_eq!(peak, 500);
}

#[cfg(test)]
struct Scripted(std::sync::Mutex<Vec<u64>>);

#[cfg(test)]
impl MemoryMeter for Scripted {
    fn current_bytes(&self) -> Option<u64> {
        let mut readings = self.0.lock().unwrap();
        if readings.len() > 1 {
            Some(readings.remove(0))
        } else {
            readings.first().copied()
        }
    }
}

#[test]
fn meter_growth_counts() {
    let meter = Scripted(std::sync::Mutex::new(vec![1000, 5000, 3000]));
    let mut tracker = ChunkTracker::start(&meter);
    tracker.log_bytes(100);
    let (_, peak) = tracker.finish();
    assert_eq!(peak, 4000);
}
