use crate::quantity::hour_start;
use crate::stats::SummaryStats;

/// Readings of one sensor/quantity accumulated since the last flush.
#[derive(Debug, Clone)]
pub struct HourAccumulator {
    hour: i64,
    values: Vec<f64>,
}

impl HourAccumulator {
    pub fn new(recorded_at: i64, value: f64) -> Self {
        Self {
            hour: hour_start(recorded_at),
            values: vec![value],
        }
    }

    pub fn hour(&self) -> i64 {
        self.hour
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Adds a reading. When it falls in a different hour than the previous
    /// reading, the completed hour's statistics are returned together with
    /// its start, and the accumulator restarts from the new reading.
    pub fn observe(&mut self, recorded_at: i64, value: f64) -> Option<(i64, SummaryStats)> {
        let hour = hour_start(recorded_at);
        if hour == self.hour {
            self.values.push(value);
            return None;
        }

        let completed = std::mem::replace(&mut self.values, vec![value]);
        let completed_hour = std::mem::replace(&mut self.hour, hour);
        SummaryStats::from_values(&completed).map(|stats| (completed_hour, stats))
    }
}
