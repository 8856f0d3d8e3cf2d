use crate::db::Store;
use crate::quantity::{align_down, Period, Quantity};
use crate::stats::SummaryStats;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::time::Instant;

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupReport {
    pub written: usize,
    pub skipped_existing: usize,
    pub skipped_empty: usize,
}

impl RollupReport {
    fn absorb(&mut self, other: RollupReport) {
        self.written += other.written;
        self.skipped_existing += other.skipped_existing;
        self.skipped_empty += other.skipped_empty;
    }
}

/// Batch Rollup Engine over the raw store's `measurement_<quantity>` tables.
#[derive(Clone)]
pub struct BatchSummarizer {
    store: Store,
}

impl BatchSummarizer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Summarises the bucket of `period` containing `containing`, for every
    /// sensor present in the raw table.
    pub async fn summarize_period(
        &self,
        quantity: Quantity,
        period: Period,
        containing: i64,
        overwrite: bool,
    ) -> Result<RollupReport> {
        // A fresh store has no raw tables yet; its buckets are simply empty.
        self.store.ensure_raw_tables().await?;
        self.store.ensure_summary_table(quantity, period).await?;
        let sensors = self.store.raw_sensors(quantity).await?;
        let start = align_down(containing, period.secs());
        self.summarize_bucket(quantity, period, start, &sensors, overwrite)
            .await
    }

    async fn summarize_bucket(
        &self,
        quantity: Quantity,
        period: Period,
        start: i64,
        sensors: &[String],
        overwrite: bool,
    ) -> Result<RollupReport> {
        let mut report = RollupReport::default();
        let end = start + period.secs();
        for sensor in sensors {
            if !overwrite
                && self
                    .store
                    .summary_exists(quantity, period, start, sensor)
                    .await?
            {
                report.skipped_existing += 1;
                continue;
            }
            let values: Vec<f64> = self
                .store
                .raw_values(quantity, sensor, start, end)
                .await?
                .into_iter()
                .map(|point| point.value)
                .collect();
            let Some(stats) = SummaryStats::from_values_lower_median(&values) else {
                tracing::debug!(%quantity, sensor = %sensor, start, period = period.secs(), "no values in bucket");
                report.skipped_empty += 1;
                continue;
            };
            self.store
                .upsert_summary(quantity, period, start, sensor, &stats)
                .await
                .with_context(|| format!("failed to write {quantity} summary for {sensor}"))?;
            report.written += 1;
        }
        Ok(report)
    }

    /// Bucket containing `now` for every standard period, overwritten.
    pub async fn summarize_latest(&self, now: i64) -> Result<RollupReport> {
        let mut report = RollupReport::default();
        for period in Period::STANDARD {
            for quantity in Quantity::ALL {
                report.absorb(self.summarize_period(quantity, period, now, true).await?);
            }
        }
        tracing::info!(?report, "summarised latest buckets");
        Ok(report)
    }

    /// Last complete bucket for every standard period. Existing rows are kept.
    pub async fn summarize_previous(&self, now: i64) -> Result<RollupReport> {
        let mut report = RollupReport::default();
        for period in Period::STANDARD {
            for quantity in Quantity::ALL {
                report.absorb(
                    self.summarize_period(quantity, period, now - period.secs(), false)
                        .await?,
                );
            }
        }
        tracing::info!(?report, "summarised previous buckets");
        Ok(report)
    }

    /// Every bucket of every standard period between `since` and `now`,
    /// newest first.
    pub async fn summarize_since(&self, since: i64, now: i64, overwrite: bool) -> Result<RollupReport> {
        let buckets = buckets_between(since, now);
        self.store.ensure_raw_tables().await?;

        let mut sensors = Vec::with_capacity(Quantity::ALL.len());
        for quantity in Quantity::ALL {
            for period in Period::STANDARD {
                self.store.ensure_summary_table(quantity, period).await?;
            }
            sensors.push((quantity, self.store.raw_sensors(quantity).await?));
        }

        let total = buckets.len() * sensors.len();
        tracing::info!(total, since, now, overwrite, "summarising buckets");
        let started = Instant::now();
        let mut report = RollupReport::default();
        let mut done = 0usize;

        for (period, start) in buckets {
            for (quantity, quantity_sensors) in &sensors {
                report.absorb(
                    self.summarize_bucket(*quantity, period, start, quantity_sensors, overwrite)
                        .await?,
                );
                done += 1;
                if done % PROGRESS_EVERY == 0 {
                    let elapsed = started.elapsed().as_secs_f64();
                    let rate = done as f64 / elapsed.max(f64::EPSILON);
                    let eta_secs = (total - done) as f64 / rate.max(f64::EPSILON);
                    tracing::info!(
                        done,
                        total,
                        buckets_per_sec = rate,
                        eta_secs = eta_secs.round() as u64,
                        "summary progress"
                    );
                }
            }
        }

        tracing::info!(
            ?report,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "summarised range"
        );
        Ok(report)
    }

    pub async fn clear(&self) -> Result<Vec<String>> {
        let dropped = self.store.drop_summary_tables().await?;
        tracing::info!(tables = dropped.len(), "dropped summary tables");
        Ok(dropped)
    }
}

/// `(period, bucket_start)` for every standard period from the bucket
/// containing `since` up to the bucket containing `now`, newest first.
pub fn buckets_between(since: i64, now: i64) -> Vec<(Period, i64)> {
    let mut buckets = Vec::new();
    if now < since {
        return buckets;
    }
    for period in Period::STANDARD {
        let mut start = align_down(now, period.secs());
        let floor = align_down(since, period.secs());
        while start >= floor {
            buckets.push((period, start));
            start -= period.secs();
        }
    }
    buckets.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    buckets
}

/// UTC midnight of a `YYYY-MM-DD` date.
pub fn parse_since(date: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .with_context(|| format!("expected a YYYY-MM-DD date, got {date:?}"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("invalid midnight")?
        .and_utc();
    Ok(midnight.timestamp())
}
