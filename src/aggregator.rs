//! Results aggregator: turns a stream of completion records into per-wave
//! and global statistics (`4.5`), plus the streaming/reservoir-sampling
//! variant for very large traces (`4.6`).

use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::journey::JourneyResult;

/// The unit handed from worker to aggregator: wave number (or event index
/// for replay), thread index, launch/completion wall-clock, and the
/// journey outcome (or a crash indicator).
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub wave: u64,
    pub thread: usize,
    pub launch_wall_clock_ms: u128,
    pub completion_wall_clock_ms: u128,
    pub journey: Option<JourneyResult>,
    pub crashed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_error: Option<String>,
}

impl CompletionRecord {
    pub fn success(&self) -> bool {
        self.journey.as_ref().map(|j| j.success).unwrap_or(false) && !self.crashed
    }

    pub fn total_latency_ms(&self) -> Option<u64> {
        if self.success() {
            self.journey.as_ref().map(JourneyResult::total_latency_ms)
        } else {
            None
        }
    }
}

/// Per-wave statistics over the successful subset.
#[derive(Debug, Clone, Serialize)]
pub struct WaveStat {
    pub wave: u64,
    pub threads: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub std_dev_ms: f64,
    pub outlier_count: usize,
    pub step_mean_latencies_ms: HashMap<String, f64>,
}

/// `p95`/`p50` as plain order statistics over a sorted vector: the element
/// at `⌊q·N⌋`, zero-indexed. Not interpolated. Empty input returns 0.
fn order_statistic(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64) * q).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Population standard deviation.
fn population_std_dev(values: &[u64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}

fn step_mean(records: &[&CompletionRecord], extractor: impl Fn(&JourneyResult) -> Option<u64>) -> f64 {
    let values: Vec<u64> = records
        .iter()
        .filter_map(|r| r.journey.as_ref().and_then(&extractor))
        .collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<u64>() as f64 / values.len() as f64
    }
}

pub fn wave_stat(wave: u64, records: &[CompletionRecord]) -> WaveStat {
    let refs: Vec<&CompletionRecord> = records.iter().filter(|r| r.wave == wave).collect();
    let threads = refs.len();
    let successes: Vec<&CompletionRecord> = refs.iter().copied().filter(|r| r.success()).collect();
    let failure_count = threads - successes.len();

    let mut latencies: Vec<u64> = successes.iter().filter_map(|r| r.total_latency_ms()).collect();
    latencies.sort_unstable();

    let mean = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
    };
    let std_dev = population_std_dev(&latencies, mean);
    let outlier_count = latencies
        .iter()
        .filter(|&&v| v as f64 > mean + 2.0 * std_dev)
        .count();

    let mut step_means = HashMap::new();
    step_means.insert(
        "step1".to_string(),
        step_mean(&successes, |j| j.step1.timing.as_ref().map(|t| t.latency_ms)),
    );
    step_means.insert(
        "step2".to_string(),
        step_mean(&successes, |j| j.step2.timing.as_ref().map(|t| t.latency_ms)),
    );
    step_means.insert(
        "step3".to_string(),
        step_mean(&successes, |j| j.step3.timing.as_ref().map(|t| t.latency_ms)),
    );
    step_means.insert(
        "step4".to_string(),
        step_mean(&successes, |j| {
            j.step4
                .iterations
                .as_ref()
                .map(|iters| iters.iter().map(|i| i.latency_ms).sum())
        }),
    );

    WaveStat {
        wave,
        threads,
        success_count: successes.len(),
        failure_count,
        min_latency_ms: latencies.first().copied().unwrap_or(0),
        max_latency_ms: latencies.last().copied().unwrap_or(0),
        mean_latency_ms: mean,
        p95_latency_ms: order_statistic(&latencies, 0.95),
        std_dev_ms: std_dev,
        outlier_count,
        step_mean_latencies_ms: step_means,
    }
}

/// Overall statistics across every completion record.
#[derive(Debug, Clone, Serialize)]
pub struct OverallStats {
    pub total_threads: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub success_rate_pct: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
}

pub fn overall_stats(records: &[CompletionRecord]) -> OverallStats {
    let total_threads = records.len();
    let successes: Vec<&CompletionRecord> = records.iter().filter(|r| r.success()).collect();
    let failure_count = total_threads - successes.len();

    let mut latencies: Vec<u64> = successes.iter().filter_map(|r| r.total_latency_ms()).collect();
    latencies.sort_unstable();

    let mean = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
    };

    OverallStats {
        total_threads,
        success_count: successes.len(),
        failure_count,
        success_rate_pct: if total_threads == 0 {
            0.0
        } else {
            (successes.len() as f64 / total_threads as f64) * 100.0
        },
        min_latency_ms: latencies.first().copied().unwrap_or(0),
        max_latency_ms: latencies.last().copied().unwrap_or(0),
        mean_latency_ms: mean,
        p50_latency_ms: order_statistic(&latencies, 0.5),
        p95_latency_ms: order_statistic(&latencies, 0.95),
    }
}

/// `{title, timestamp, config, waves, results, total_time_ms}`, per `6`.
#[derive(Debug, Clone, Serialize)]
pub struct ResultsConfig {
    pub rps: usize,
    pub duration: u64,
    pub puzzle_id: String,
    pub state_len: usize,
    pub true_rps: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultsDocument {
    pub title: String,
    pub timestamp: u128,
    pub config: ResultsConfig,
    pub waves: Vec<WaveStat>,
    pub results: Vec<CompletionRecord>,
    pub total_time_ms: u64,
}

/// Thread-safe append-only sink fed by workers; aggregation runs only after
/// the completion latch resolves, so there is no lock contention on the
/// request hot path.
pub struct Aggregator {
    records: Mutex<Vec<CompletionRecord>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, record: CompletionRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn finalize(&self, title: String, config: ResultsConfig, total_time_ms: u64, timestamp: u128) -> ResultsDocument {
        let records = self.records.lock().unwrap().clone();
        let waves: Vec<u64> = {
            let mut w: Vec<u64> = records.iter().map(|r| r.wave).collect();
            w.sort_unstable();
            w.dedup();
            w
        };
        let wave_stats = waves.into_iter().map(|w| wave_stat(w, &records)).collect();

        ResultsDocument {
            title,
            timestamp,
            config,
            waves: wave_stats,
            results: records,
            total_time_ms,
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded reservoir for the streaming variant: aggregate counters stay
/// exact, but per-event detail and the latency-percentile sample are capped
/// (`4.6`).
pub struct ReservoirSampler<T> {
    capacity: usize,
    seen: usize,
    items: Vec<T>,
}

impl<T: Clone> ReservoirSampler<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn offer(&mut self, item: T, rng: &mut impl Rng) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        let j = rng.gen_range(0..self.seen);
        if j < self.capacity {
            self.items[j] = item;
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn seen(&self) -> usize {
        self.seen
    }
}
