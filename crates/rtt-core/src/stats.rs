use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Quantile used for the tail latency figure.
pub const P95: f64 = 0.95;

/// Descriptive latency statistics in milliseconds.
///
/// `median_ms` and `p95_ms` need at least two samples and are `None` below
/// that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub max_ms: f64,
}

impl LatencyStats {
    /// Aggregate a sequence of round-trip times. Returns `None` when empty.
    pub fn from_durations(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = samples.iter().copied().map(as_millis_f64).collect();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let mean_ms = sorted.iter().sum::<f64>() / count as f64;
        let max_ms = sorted[count - 1];

        let (median_ms, p95_ms) = if count >= 2 {
            (Some(median(&sorted)), Some(percentile(&sorted, P95)))
        } else {
            (None, None)
        };

        Some(Self {
            count,
            mean_ms,
            median_ms,
            p95_ms,
            max_ms,
        })
    }
}

/// Linear interpolation between closest ranks at position `q * (n - 1)`.
///
/// `sorted` must be ascending and non-empty; `q` is clamped to `[0, 1]`.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let q = q.clamp(0.0, 1.0);
    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Arithmetic mean in milliseconds, `None` when empty.
pub fn mean_ms(samples: &[Duration]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let total: f64 = samples.iter().copied().map(as_millis_f64).sum();
    Some(total / samples.len() as f64)
}

pub fn as_millis_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}
