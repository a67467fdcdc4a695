//! Worker progress and speed aggregation.
//!
//! Every worker reports how many bytes it moved since its last report; the
//! aggregator keeps a fixed-size ring of instantaneous rates per worker and
//! periodically re-sums the per-worker averages into one cumulative figure.
//! Progress itself is counted in whole files.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const DEFAULT_REPORT_COUNT: usize = 50;
const DEFAULT_REPORTS_PER_SAMPLE: usize = 25;

const DATA_UNITS: [(f64, &str); 5] = [
    (1099511627776.0, "TiB"),
    (1073741824.0, "GiB"),
    (1048576.0, "MiB"),
    (1024.0, "KiB"),
    (1.0, "B"),
];

/// Instantaneous-rate ring for a single worker.
struct SpeedInfo {
    samples: VecDeque<f64>,
    capacity: usize,
    last: Option<Instant>,
    buffered: usize,
}

impl SpeedInfo {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            last: None,
            buffered: 0,
        }
    }

    fn report(&mut self, n: usize) {
        let now = Instant::now();
        match self.last {
            None => {
                // First report only starts the clock.
                self.last = Some(now);
            }
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs_f64();
                if elapsed == 0.0 {
                    // Two reports in the same instant; fold into the next one.
                    self.buffered += n;
                    return;
                }
                let total = (n + self.buffered) as f64;
                self.buffered = 0;
                if self.samples.len() == self.capacity {
                    self.samples.pop_front();
                }
                self.samples.push_back(total / elapsed);
                self.last = Some(now);
            }
        }
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

struct SpeedBook {
    workers: HashMap<usize, SpeedInfo>,
    reports: usize,
}

/// Shared between the coordinator, the sinks and the workers.
pub struct ProgressAggregator {
    total: usize,
    current: AtomicUsize,
    reports_per_sample: usize,
    speeds: Mutex<SpeedBook>,
    overall: Mutex<f64>,
}

impl ProgressAggregator {
    /// `total` in files; [`crate::plugin::UNKNOWN_TOTAL`] when unknown.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            current: AtomicUsize::new(0),
            reports_per_sample: DEFAULT_REPORTS_PER_SAMPLE,
            speeds: Mutex::new(SpeedBook {
                workers: HashMap::new(),
                reports: 0,
            }),
            overall: Mutex::new(0.0),
        }
    }

    /// How many `report` calls it takes to refresh the cumulative average.
    pub fn with_reports_per_sample(mut self, n: usize) -> Self {
        self.reports_per_sample = n.max(1);
        self
    }

    /// A worker reports `n` bytes moved since its last report.
    pub fn report(&self, worker: usize, n: usize) {
        let mut book = self.speeds.lock().unwrap_or_else(|e| e.into_inner());
        book.workers
            .entry(worker)
            .or_insert_with(|| SpeedInfo::new(DEFAULT_REPORT_COUNT))
            .report(n);
        book.reports += 1;

        if book.reports % self.reports_per_sample == 0 {
            let sum: f64 = book.workers.values().map(SpeedInfo::average).sum();
            let mut overall = self.overall.lock().unwrap_or_else(|e| e.into_inner());
            *overall = sum;
        }
    }

    /// A worker finished; its ring no longer contributes to the average.
    pub fn done(&self, worker: usize) {
        let mut book = self.speeds.lock().unwrap_or_else(|e| e.into_inner());
        book.workers.remove(&worker);
    }

    /// Count `n` finished files.
    pub fn advance(&self, n: usize) -> usize {
        let current = self.current.fetch_add(n, Ordering::Relaxed) + n;
        if self.total != 0 {
            current.min(self.total)
        } else {
            current
        }
    }

    pub fn current(&self) -> usize {
        let current = self.current.load(Ordering::Relaxed);
        if self.total != 0 {
            current.min(self.total)
        } else {
            current
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn overall_speed(&self) -> f64 {
        *self.overall.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Human-readable cumulative rate, e.g. `3.4 MiB/s`.
    pub fn speed_display(&self) -> String {
        let speed = self.overall_speed();
        let (size, name) = DATA_UNITS
            .iter()
            .find(|(size, _)| speed > *size)
            .unwrap_or(&DATA_UNITS[4]);
        format!("{:.1} {}/s", speed / size, name)
    }
}

/// The stderr progress bar for one run.
pub fn make_bar(total: usize) -> ProgressBar {
    let bar = if total == 0 {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{prefix} [{elapsed_precise}] {pos} files {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar
    } else {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        bar
    };
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar.set_prefix("pages");
    bar.enable_steady_tick(std::time::Duration::from_millis(500));
    bar
}
