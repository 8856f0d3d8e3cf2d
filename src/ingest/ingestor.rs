use super::dedup::{prune_before, touch_sensor, write_reading};
use super::state::{FlushedHour, RollupState};
use super::{IngestStats, Ingestor};
use crate::db::Store;
use crate::quantity::CollectorPeriod;
use crate::stats::NullableStats;
use crate::telemetry::DecodedMessage;
use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub written: usize,
    pub compacted: usize,
    pub pruned: u64,
    pub flushed: usize,
}

impl Ingestor {
    /// `summaries` enables the Online Rollup Engine; completed hours are
    /// written to its `hourly_<quantity>` tables.
    pub fn new(
        raw: Store,
        summaries: Option<Store>,
        stats: Arc<IngestStats>,
        retention: Option<Duration>,
    ) -> Self {
        Self {
            raw,
            summaries,
            state: Arc::new(Mutex::new(RollupState::new())),
            stats,
            retention,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn raw_store(&self) -> &Store {
        &self.raw
    }

    /// Creates the tables the ingest path writes to.
    pub async fn prepare(&self) -> Result<()> {
        self.raw.ensure_raw_tables().await?;
        if let Some(summaries) = &self.summaries {
            summaries.ensure_collector_tables().await?;
        }
        Ok(())
    }

    /// Persists one decoded message. All raw-store writes for the message
    /// commit together; rollup flushes go to the summaries store afterwards.
    pub async fn ingest(&self, message: &DecodedMessage) -> Result<IngestOutcome> {
        let recorded_at = message.recorded_at.timestamp();
        let sensor = message.sensor_id.as_str();
        let mut outcome = IngestOutcome::default();

        {
            let _guard = self.raw.lock().await;
            let mut tx = self.raw.begin().await?;
            touch_sensor(&mut tx, sensor, recorded_at).await?;
            for &(quantity, value) in &message.readings {
                if write_reading(&mut tx, quantity, sensor, recorded_at, value)
                    .await
                    .with_context(|| format!("failed to store {quantity} for {sensor}"))?
                {
                    outcome.compacted += 1;
                }
                outcome.written += 1;
            }
            if let Some(retention) = self.retention {
                let cutoff = recorded_at - retention.as_secs() as i64;
                outcome.pruned = prune_before(&mut tx, cutoff).await?;
            }
            tx.commit().await?;
        }

        self.stats
            .readings_ingested
            .fetch_add(outcome.written as u64, Ordering::Relaxed);
        self.stats
            .readings_compacted
            .fetch_add(outcome.compacted as u64, Ordering::Relaxed);
        tracing::trace!(
            sensor,
            written = outcome.written,
            compacted = outcome.compacted,
            pruned = outcome.pruned,
            "stored reading"
        );

        if let Some(summaries) = &self.summaries {
            let flushed = self.observe(message).await;
            outcome.flushed = self.write_all(summaries, flushed).await;
            self.stats
                .summaries_flushed
                .fetch_add(outcome.flushed as u64, Ordering::Relaxed);
        }

        Ok(outcome)
    }

    /// Writes completed hours and returns how many were written. A failed
    /// hour is logged and queued for the next message instead of failing
    /// the ingest.
    async fn write_all(&self, summaries: &Store, flushed: Vec<FlushedHour>) -> usize {
        let mut written = 0;
        let mut failed = Vec::new();
        for hour in flushed {
            match self.write_flushed(summaries, &hour).await {
                Ok(()) => written += 1,
                Err(err) => {
                    let err = format!("{err:#}");
                    tracing::warn!(error = %err, "hourly summary write failed; will retry");
                    self.stats.record_error(err);
                    failed.push(hour);
                }
            }
        }
        if !failed.is_empty() {
            let mut state = self.state.lock().await;
            for hour in failed {
                if let Some(dropped) = state.requeue(hour) {
                    tracing::error!(
                        sensor = %dropped.sensor,
                        quantity = %dropped.quantity,
                        hour = dropped.hour,
                        "retry queue full; discarding hourly summary"
                    );
                }
            }
            tracing::debug!(pending = state.pending(), "hourly summaries awaiting retry");
        }
        written
    }

    async fn observe(&self, message: &DecodedMessage) -> Vec<FlushedHour> {
        let recorded_at = message.recorded_at.timestamp();
        let mut state = self.state.lock().await;
        let mut flushed = state.take_pending();
        let retried = flushed.len();
        flushed.extend(message.readings.iter().filter_map(|&(quantity, value)| {
            state.observe(&message.sensor_id, quantity, recorded_at, value)
        }));
        if flushed.len() > retried {
            tracing::debug!(
                sensor = %message.sensor_id,
                flushed = flushed.len() - retried,
                retried,
                tracked = state.tracked(),
                "hour boundary crossed"
            );
        }
        flushed
    }

    async fn write_flushed(&self, summaries: &Store, hour: &FlushedHour) -> Result<()> {
        tracing::info!(
            sensor = %hour.sensor,
            quantity = %hour.quantity,
            hour = hour.hour,
            median = hour.stats.median,
            "writing hourly summary"
        );
        summaries
            .upsert_collector_summary(
                hour.quantity,
                CollectorPeriod::Hourly,
                hour.hour,
                &hour.sensor,
                &NullableStats::from(Some(hour.stats)),
            )
            .await
            .with_context(|| {
                format!(
                    "failed to write hourly {} summary for {}",
                    hour.quantity, hour.sensor
                )
            })
    }
}
