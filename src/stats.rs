//! Summary statistics shared by the rollup engines and the history merger.
//!
//! Two different medians live here on purpose: the batch rollup engine keeps
//! the lower-middle sorted element, everything else uses the interpolated
//! statistical median. They disagree for even-sized samples.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryStats {
    pub minimum: f64,
    pub maximum: f64,
    pub median: f64,
    pub mean: f64,
}

impl SummaryStats {
    /// Statistics with the interpolated median. `None` for an empty input.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let sorted = sorted_copy(values)?;
        Some(Self {
            minimum: sorted[0],
            maximum: sorted[sorted.len() - 1],
            median: median_of_sorted(&sorted),
            mean: mean(&sorted),
        })
    }

    /// Statistics with the lower-middle element (`values[n / 2]`) as median.
    pub fn from_values_lower_median(values: &[f64]) -> Option<Self> {
        let sorted = sorted_copy(values)?;
        Some(Self {
            minimum: sorted[0],
            maximum: sorted[sorted.len() - 1],
            median: sorted[sorted.len() / 2],
            mean: mean(&sorted),
        })
    }
}

/// Nullable statistics row as written by the summary collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NullableStats {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub median: Option<f64>,
    pub mean: Option<f64>,
}

impl From<Option<SummaryStats>> for NullableStats {
    fn from(stats: Option<SummaryStats>) -> Self {
        match stats {
            Some(s) => Self {
                minimum: Some(s.minimum),
                maximum: Some(s.maximum),
                median: Some(s.median),
                mean: Some(s.mean),
            },
            None => Self::default(),
        }
    }
}

/// Interpolated median; `None` for an empty input.
pub fn median(values: &[f64]) -> Option<f64> {
    sorted_copy(values).map(|sorted| median_of_sorted(&sorted))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn sorted_copy(values: &[f64]) -> Option<Vec<f64>> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(sorted)
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
