//! Application-layer latency accounting
//!
//! One meter per connection samples the wall-clock time of each READ batch;
//! a single global meter samples the fan-out-to-complete-all duration of
//! each tick. Samples are integer nanoseconds from a monotonic clock.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

const INITIAL_SAMPLE_CAPACITY: usize = 100;

pub struct LatencyMeter {
    start: Instant,
    samples: Vec<u64>,
    finished: usize,
}

impl Default for LatencyMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyMeter {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            samples: Vec::with_capacity(INITIAL_SAMPLE_CAPACITY),
            finished: 0,
        }
    }

    /// Restart the clock for the next measurement.
    pub fn restart_clock(&mut self) {
        self.start = Instant::now();
    }

    /// Begin a new cycle: zero the finished-counter and restart the clock.
    pub fn restart_cycle(&mut self) {
        self.finished = 0;
        self.restart_clock();
    }

    /// Record the time elapsed since the last clock restart as one sample.
    pub fn record_elapsed(&mut self) -> u64 {
        let ns = self.start.elapsed().as_nanos() as u64;
        self.samples.push(ns);
        ns
    }

    /// Count one participant as finished within the current cycle.
    pub fn mark_finished(&mut self) -> usize {
        self.finished += 1;
        self.finished
    }

    pub fn num_finished(&self) -> usize {
        self.finished
    }

    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Write the collected samples, one decimal nanosecond value per line.
    pub fn flush<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for sample in &self.samples {
            writeln!(out, "{}", sample)?;
        }
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn records_positive_samples() {
        let mut lm = LatencyMeter::new();
        lm.restart_clock();
        std::thread::sleep(Duration::from_millis(1));
        let ns = lm.record_elapsed();
        assert!(ns >= 1_000_000);
        assert_eq!(lm.len(), 1);
        assert_eq!(lm.samples()[0], ns);
    }

    #[test]
    fn cycle_resets_finished_counter_not_samples() {
        let mut lm = LatencyMeter::new();
        lm.record_elapsed();
        assert_eq!(lm.mark_finished(), 1);
        assert_eq!(lm.mark_finished(), 2);

        lm.restart_cycle();
        assert_eq!(lm.num_finished(), 0);
        assert_eq!(lm.len(), 1);
    }

    #[test]
    fn flush_writes_one_sample_per_line() {
        let mut lm = LatencyMeter::new();
        lm.restart_clock();
        lm.record_elapsed();
        lm.record_elapsed();

        let path = std::env::temp_dir().join(format!("meter_flush_{}.txt", std::process::id()));
        lm.flush(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<u64> = contents
            .lines()
            .map(|l| l.parse().unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        std::fs::remove_file(&path).unwrap();
    }
}
