//! Latency summary statistics.
//!
//! Everything here is a pure function over a slice of durations so the
//! numbers can be checked without touching the log.
//!
//! Percentiles use linear interpolation between closest ranks: for `p` in
//! `[0, 100]` over `n` sorted values the rank is `p / 100 * (n - 1)` and the
//! result interpolates between the values at `floor(rank)` and `ceil(rank)`.
//! This is the same definition numpy uses by default; changing it changes
//! reported values and must be treated as an API change.

use serde::Serialize;

/// Minimum, maximum, mean and median of the successful durations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub med: f64,
}

/// The reported percentile set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Percentiles {
    pub p1: f64,
    pub p5: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Interpolated percentile of an ascending slice. `None` when empty.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }

    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;

    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Sort `values` and compute the stats and percentile set.
///
/// The result only depends on the multiset of values: sorting happens
/// before any accumulation, including the sum behind the mean.
pub fn summarize(mut values: Vec<f64>) -> Option<(LatencyStats, Percentiles)> {
    values.retain(|v| v.is_finite());
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);

    let at = |p: f64| percentile(&values, p).unwrap_or_default();
    let sum: f64 = values.iter().sum();

    let stats = LatencyStats {
        min: values[0],
        max: values[values.len() - 1],
        avg: sum / values.len() as f64,
        med: at(50.0),
    };

    let percentiles = Percentiles {
        p1: at(1.0),
        p5: at(5.0),
        p10: at(10.0),
        p25: at(25.0),
        p50: at(50.0),
        p75: at(75.0),
        p90: at(90.0),
        p95: at(95.0),
        p99: at(99.0),
    };

    Some((stats, percentiles))
}
