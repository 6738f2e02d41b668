//! Trend statistics over a window of timestamped samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of a sample window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendStats {
    pub data_points: usize,
    /// OLS slope of value against sample index.
    pub slope: f64,
    /// OLS slope of value against elapsed minutes.
    pub slope_per_minute: f64,
    /// Pearson correlation of value against sample index.
    pub correlation: f64,
    /// Mean of the first third of the window.
    pub baseline_avg: f64,
    /// Mean of the last third of the window.
    pub recent_avg: f64,
    pub change_percent: f64,
    /// `recent_avg - baseline_avg`.
    pub change_absolute: f64,
    pub latest: f64,
}

/// Least-squares slope of `ys` against `xs`. Zero when `xs` has no spread.
pub fn ols_slope(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let mean_x = mean(&xs[..n]);
    let mean_y = mean(&ys[..n]);
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for i in 0..n {
        let dx = xs[i] - mean_x;
        sxy += dx * (ys[i] - mean_y);
        sxx += dx * dx;
    }
    if sxx == 0.0 { 0.0 } else { sxy / sxx }
}

/// Pearson correlation of `ys` against `xs`. Zero when either side is flat.
pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let mean_x = mean(&xs[..n]);
    let mean_y = mean(&ys[..n]);
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return 0.0;
    }
    (sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Relative change from `baseline` to `recent` in percent.
pub fn change_percent(baseline: f64, recent: f64) -> f64 {
    if baseline == 0.0 {
        if recent == 0.0 {
            0.0
        } else {
            100.0_f64.copysign(recent)
        }
    } else {
        (recent - baseline) / baseline.abs() * 100.0
    }
}

/// Analyze samples ordered oldest first. Needs at least two samples.
pub fn analyze(samples: &[(f64, DateTime<Utc>)]) -> Option<TrendStats> {
    let n = samples.len();
    if n < 2 {
        return None;
    }

    let values: Vec<f64> = samples.iter().map(|(v, _)| *v).collect();
    let index: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let start = samples[0].1;
    let minutes: Vec<f64> = samples
        .iter()
        .map(|(_, ts)| (*ts - start).num_milliseconds() as f64 / 60_000.0)
        .collect();

    let third = (n / 3).max(1);
    let baseline_avg = mean(&values[..third]);
    let recent_avg = mean(&values[n - third..]);

    Some(TrendStats {
        data_points: n,
        slope: ols_slope(&index, &values),
        slope_per_minute: ols_slope(&minutes, &values),
        correlation: pearson(&index, &values),
        baseline_avg,
        recent_avg,
        change_percent: change_percent(baseline_avg, recent_avg),
        change_absolute: recent_avg - baseline_avg,
        latest: values[n - 1],
    })
}
