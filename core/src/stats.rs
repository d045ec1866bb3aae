//! Small descriptive-statistics helpers shared by the stages.
//!
//! Quantiles use linear interpolation between order statistics
//! (position = q * (n - 1)), the usual data-frame convention.

use std::collections::BTreeMap;

/// Quantile of an already-sorted slice. Returns None for an empty slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Sort a copy of the values, ignoring ordering problems with NaN
/// (callers only pass finite values).
pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    v
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile_sorted(&sorted_copy(values), 0.5)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator). Zero for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

/// Tukey fences `[Q1 - k*IQR, Q3 + k*IQR]` for the given values.
///
/// Each fence is widened to cover the order statistics its quartile
/// interpolates between, so clamping a column to its own fences leaves
/// both quartiles (and therefore the fences) unchanged. For n <= 4 that
/// reaches the minimum and maximum and nothing is fenced off.
pub fn iqr_bounds(values: &[f64], k: f64) -> Option<(f64, f64)> {
    let sorted = sorted_copy(values);
    let q1 = quantile_sorted(&sorted, 0.25)?;
    let q3 = quantile_sorted(&sorted, 0.75)?;
    let iqr = q3 - q1;
    let last = (sorted.len() - 1) as f64;
    let q1_floor = sorted[(0.25 * last).floor() as usize];
    let q3_ceil = sorted[(0.75 * last).ceil() as usize];
    Some(((q1 - k * iqr).min(q1_floor), (q3 + k * iqr).max(q3_ceil)))
}

/// Most frequent label; ties go to the lexicographically smallest.
pub fn mode<'a, I>(labels: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for l in labels {
        *counts.entry(l).or_insert(0) += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (label, count) in counts {
        match best {
            Some((_, c)) if c >= count => {}
            _ => best = Some((label, count)),
        }
    }
    best.map(|(l, _)| l.to_string())
}
