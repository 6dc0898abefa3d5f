//! Estimate Consolidator
//! Mission: Many disagreeing estimates in, one defensible number out
//!
//! Up to four samples the median is the answer. Above that, a trimmed mean
//! (12.5% off each tail, at least one value) is computed and the lower of the
//! two central estimates wins. The downward bias is deliberate buyer-side
//! policy.

use serde::Serialize;

/// Sample count above which tails are trimmed.
pub const TRIM_THRESHOLD: usize = 4;
/// Fraction of samples dropped from each tail.
pub const TRIM_FRACTION: f64 = 0.125;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedResult {
    pub best_estimate: f64,
    pub median: f64,
}

/// Returns `None` for an empty sample: zero successful sources is not a
/// zero-dollar estimate. Non-finite values are ignored.
pub fn consolidate(values: &[f64]) -> Option<ConsolidatedResult> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let median = median_sorted(&sorted);
    let n = sorted.len();
    if n <= TRIM_THRESHOLD {
        return Some(ConsolidatedResult {
            best_estimate: median,
            median,
        });
    }

    let trim = ((TRIM_FRACTION * n as f64).floor() as usize).max(1);
    let kept = &sorted[trim..n - trim];
    let trimmed_mean = (kept.iter().sum::<f64>() / kept.len() as f64).round();

    Some(ConsolidatedResult {
        best_estimate: median.min(trimmed_mean),
        median,
    })
}

/// Median of any order of values; `None` when empty.
pub fn median(values: &[f64]) -> Option<f64> {
    consolidate(values).map(|r| r.median)
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    let mid = n / 2;
    if n % 2 == 0 {
        ((sorted[mid - 1] + sorted[mid]) / 2.0).round()
    } else {
        sorted[mid]
    }
}
