use super::rollup::HourAccumulator;
use crate::quantity::Quantity;
use crate::stats::SummaryStats;
use std::collections::{HashMap, VecDeque};

/// Completed hours kept for another write attempt after a failed flush.
pub(in crate::ingest) const MAX_PENDING_FLUSHES: usize = 4_096;

/// Process-local rollup state. Lost on restart.
#[derive(Debug, Default)]
pub(in crate::ingest) struct RollupState {
    accumulators: HashMap<(String, Quantity), HourAccumulator>,
    pending: VecDeque<FlushedHour>,
}

#[derive(Debug, Clone, PartialEq)]
pub(in crate::ingest) struct FlushedHour {
    pub(in crate::ingest) sensor: String,
    pub(in crate::ingest) quantity: Quantity,
    pub(in crate::ingest) hour: i64,
    pub(in crate::ingest) stats: SummaryStats,
}

impl RollupState {
    pub(in crate::ingest) fn new() -> Self {
        Self::default()
    }

    pub(in crate::ingest) fn observe(
        &mut self,
        sensor: &str,
        quantity: Quantity,
        recorded_at: i64,
        value: f64,
    ) -> Option<FlushedHour> {
        let key = (sensor.to_string(), quantity);
        match self.accumulators.get_mut(&key) {
            Some(acc) => acc
                .observe(recorded_at, value)
                .map(|(hour, stats)| FlushedHour {
                    sensor: sensor.to_string(),
                    quantity,
                    hour,
                    stats,
                }),
            None => {
                self.accumulators
                    .insert(key, HourAccumulator::new(recorded_at, value));
                None
            }
        }
    }

    pub(in crate::ingest) fn tracked(&self) -> usize {
        self.accumulators.len()
    }

    /// Hours whose write failed earlier, oldest first.
    pub(in crate::ingest) fn take_pending(&mut self) -> Vec<FlushedHour> {
        self.pending.drain(..).collect()
    }

    /// Queues a completed hour for retry. Returns the hour evicted to stay
    /// within [`MAX_PENDING_FLUSHES`], if any.
    pub(in crate::ingest) fn requeue(&mut self, hour: FlushedHour) -> Option<FlushedHour> {
        let evicted = if self.pending.len() >= MAX_PENDING_FLUSHES {
            self.pending.pop_front()
        } else {
            None
        };
        self.pending.push_back(hour);
        evicted
    }

    pub(in crate::ingest) fn pending(&self) -> usize {
        self.pending.len()
    }
}
