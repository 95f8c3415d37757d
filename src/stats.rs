use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Stats {
    pub label: &'static str,
    pub submitted: u64,
    pub retrieved: u64,
    pub bad: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    interval: Duration,
    t0: Instant,
    last: Instant,
    window_retrieved: u64,
}

impl Stats {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            submitted: 0,
            retrieved: 0,
            bad: 0,
            bytes_out: 0,
            bytes_in: 0,
            interval: Duration::from_secs(1),
            t0: Instant::now(),
            last: Instant::now(),
            window_retrieved: 0,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn add_submitted(&mut self, bytes: usize) {
        self.submitted += 1;
        self.bytes_out += bytes as u64;
    }

    pub fn add_retrieved(&mut self, bytes: usize) {
        self.retrieved += 1;
        self.window_retrieved += 1;
        self.bytes_in += bytes as u64;
    }

    pub fn inc_bad(&mut self) {
        self.bad += 1;
    }

    /// Counts a result spoiled by its own contents and lets the run go on.
    /// Any other error passes through.
    pub fn absorb(&mut self, outcome: Result<()>) -> Result<()> {
        match outcome {
            Err(e) if e.is_result_local() => {
                warn!(label = self.label, "dropping result: {e}");
                self.inc_bad();
                Ok(())
            }
            other => other,
        }
    }

    /// Results per second since the last periodic line.
    fn window_fps(&self) -> f64 {
        let dur = self.last.elapsed().as_secs_f64().max(1e-3);
        self.window_retrieved as f64 / dur
    }

    pub fn maybe_log(&mut self) {
        if self.last.elapsed() >= self.interval {
            info!(
                "[{}] sent={} done={} bad={} out={}kB in={}kB => {:.1} fps",
                self.label,
                self.submitted,
                self.retrieved,
                self.bad,
                self.bytes_out / 1000,
                self.bytes_in / 1000,
                self.window_fps()
            );
            self.last = Instant::now();
            self.window_retrieved = 0;
        }
    }

    pub fn log_summary(&self) {
        let dur = self.t0.elapsed().as_secs_f64().max(1e-3);
        info!(
            "[{}] total sent={} done={} bad={} over {:.1}s => {:.1} fps",
            self.label,
            self.submitted,
            self.retrieved,
            self.bad,
            dur,
            self.retrieved as f64 / dur
        );
    }
}
