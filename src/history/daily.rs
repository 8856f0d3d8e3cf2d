use crate::quantity::day_start;
use crate::stats::{median, round2};
use serde::Serialize;
use std::collections::BTreeMap;

/// One hourly-equivalent value extracted from a source store.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyValue {
    pub hour_start: i64,
    pub sensor: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DailyStats {
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

/// Groups hourly values by UTC day and sensor. Each statistic is rounded to
/// two decimals; the median is interpolated.
pub fn aggregate_to_daily(rows: &[HourlyValue]) -> BTreeMap<(i64, String), DailyStats> {
    let mut grouped: BTreeMap<(i64, String), Vec<f64>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry((day_start(row.hour_start), row.sensor.clone()))
            .or_default()
            .push(row.value);
    }

    grouped
        .into_iter()
        .filter_map(|(key, values)| {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let median = median(&values)?;
            Some((
                key,
                DailyStats {
                    min: round2(min),
                    max: round2(max),
                    median: round2(median),
                },
            ))
        })
        .collect()
}
