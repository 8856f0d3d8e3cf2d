//! Hourly/daily Summary Collector.
//!
//! Polls the live buffer endpoint once per completed UTC hour and day and
//! writes one row per sensor and quantity into `hourly_<q>` / `daily_<q>`.

use crate::db::Store;
use crate::quantity::{day_start, hour_start, CollectorPeriod, Quantity, DAY_SECS, HOUR_SECS};
use crate::stats::{NullableStats, SummaryStats};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferReading {
    pub recorded_at: i64,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub voltage: Option<f64>,
}

impl BufferReading {
    pub fn value(&self, quantity: Quantity) -> Option<f64> {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::Humidity => self.humidity,
            Quantity::Pressure => self.pressure,
            Quantity::Voltage => self.voltage,
        }
    }

    pub fn set(&mut self, quantity: Quantity, value: f64) {
        let slot = match quantity {
            Quantity::Temperature => &mut self.temperature,
            Quantity::Humidity => &mut self.humidity,
            Quantity::Pressure => &mut self.pressure,
            Quantity::Voltage => &mut self.voltage,
        };
        *slot = Some(value);
    }
}

/// Readings grouped by sensor, ascending by time.
pub type BufferSnapshot = BTreeMap<String, Vec<BufferReading>>;

/// Where the collector reads a window of live readings from.
pub trait MeasurementSource: Send + Sync {
    fn fetch(&self, start: i64, end: i64) -> impl Future<Output = Result<BufferSnapshot>> + Send;
}

#[derive(Clone)]
pub struct HttpBufferSource {
    client: Client,
    endpoint: Url,
}

impl HttpBufferSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).with_context(|| format!("invalid buffer url {base_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("buffer.json")?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

impl MeasurementSource for HttpBufferSource {
    async fn fetch(&self, start: i64, end: i64) -> Result<BufferSnapshot> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("start", &start.to_string())
            .append_pair("end", &end.to_string());
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()?;
        let mut body = response.bytes().await?.to_vec();
        let snapshot: BufferSnapshot = simd_json::serde::from_slice(&mut body)
            .with_context(|| format!("unexpected payload from {url}"))?;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    Collected { sensors: usize },
    Skipped,
}

pub struct SummaryCollector<S> {
    store: Store,
    source: S,
}

impl<S: MeasurementSource> SummaryCollector<S> {
    pub fn new(store: Store, source: S) -> Self {
        Self { store, source }
    }

    pub async fn prepare(&self) -> Result<()> {
        self.store.ensure_collector_tables().await
    }

    /// Collects `[start, end)` into the tables of `granularity`. An
    /// unavailable source skips the window.
    pub async fn collect(
        &self,
        granularity: CollectorPeriod,
        start: i64,
        end: i64,
    ) -> Result<CollectOutcome> {
        let snapshot = match self.source.fetch(start, end).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    error = %format!("{err:#}"),
                    granularity = granularity.as_str(),
                    start,
                    "skipping summary collection; measurement buffer unavailable"
                );
                return Ok(CollectOutcome::Skipped);
            }
        };

        for (sensor, readings) in &snapshot {
            for quantity in Quantity::ALL {
                let values: Vec<f64> = readings
                    .iter()
                    .filter_map(|reading| reading.value(quantity))
                    .collect();
                let stats = NullableStats::from(SummaryStats::from_values(&values));
                self.store
                    .upsert_collector_summary(quantity, granularity, start, sensor, &stats)
                    .await?;
            }
        }

        tracing::info!(
            granularity = granularity.as_str(),
            sensors = snapshot.len(),
            period_start = start,
            "collected summaries"
        );
        Ok(CollectOutcome::Collected {
            sensors: snapshot.len(),
        })
    }
}

/// `(granularity, start, end)` of one collection window.
pub type Window = (CollectorPeriod, i64, i64);

/// Skipped windows kept for retry; two days of hourly windows.
pub const MAX_PENDING_WINDOWS: usize = 48;

/// Last UTC hour/day the scheduler acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerState {
    last_hour: i64,
    last_day: i64,
}

impl SchedulerState {
    pub fn new(now: i64) -> Self {
        Self {
            last_hour: hour_start(now),
            last_day: day_start(now),
        }
    }

    /// Windows that became complete since the last call. Each window is
    /// reported once; retrying a skipped one is up to the caller.
    pub fn due(&mut self, now: i64) -> Vec<Window> {
        let mut due = Vec::new();
        let hour = hour_start(now);
        if hour != self.last_hour {
            tracing::info!(from = self.last_hour, to = hour, "hour changed");
            due.push((CollectorPeriod::Hourly, hour - HOUR_SECS, hour));
            self.last_hour = hour;
        }
        let day = day_start(now);
        if day != self.last_day {
            tracing::info!(from = self.last_day, to = day, "day changed");
            due.push((CollectorPeriod::Daily, day - DAY_SECS, day));
            self.last_day = day;
        }
        due
    }
}

pub struct CollectorService<S> {
    collector: SummaryCollector<S>,
    check_interval: Duration,
    error_backoff: Duration,
    initial: Option<SchedulerState>,
}

impl<S: MeasurementSource + 'static> CollectorService<S> {
    pub fn new(collector: SummaryCollector<S>, check_interval: Duration, error_backoff: Duration) -> Self {
        Self {
            collector,
            check_interval,
            error_backoff,
            initial: None,
        }
    }

    /// Starts scheduling from `state` instead of the current time.
    pub fn with_state(mut self, state: SchedulerState) -> Self {
        self.initial = Some(state);
        self
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut state = self
            .initial
            .unwrap_or_else(|| SchedulerState::new(chrono::Utc::now().timestamp()));
        let mut pending = VecDeque::new();
        tracing::info!(
            check_secs = self.check_interval.as_secs(),
            "starting summary collector"
        );
        if let Err(err) = self.collector.prepare().await {
            tracing::error!(error = %format!("{err:#}"), "failed to create summary tables");
        }

        loop {
            let pause = match self.tick(&mut state, &mut pending).await {
                Ok(()) => self.check_interval,
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "unexpected error in summary collector loop");
                    self.error_backoff
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }
        tracing::info!("summary collector stopped");
    }

    /// Collects every due window plus the ones skipped earlier. Windows that
    /// are skipped again, or not reached because of an error, stay pending.
    async fn tick(&self, state: &mut SchedulerState, pending: &mut VecDeque<Window>) -> Result<()> {
        for window in state.due(chrono::Utc::now().timestamp()) {
            if pending.len() >= MAX_PENDING_WINDOWS {
                if let Some((granularity, start, _)) = pending.pop_front() {
                    tracing::warn!(
                        granularity = granularity.as_str(),
                        start,
                        "giving up on summary window"
                    );
                }
            }
            pending.push_back(window);
        }

        let mut retry = VecDeque::with_capacity(pending.len());
        while let Some(window) = pending.pop_front() {
            let (granularity, start, end) = window;
            match self.collector.collect(granularity, start, end).await {
                Ok(CollectOutcome::Collected { .. }) => {}
                Ok(CollectOutcome::Skipped) => retry.push_back(window),
                Err(err) => {
                    retry.push_back(window);
                    retry.append(pending);
                    *pending = retry;
                    return Err(err);
                }
            }
        }
        *pending = retry;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct StubSource {
        snapshot: Option<BufferSnapshot>,
        calls: Mutex<Vec<(i64, i64)>>,
    }

    impl StubSource {
        fn new(snapshot: Option<BufferSnapshot>) -> Self {
            Self {
                snapshot,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl MeasurementSource for StubSource {
        async fn fetch(&self, start: i64, end: i64) -> Result<BufferSnapshot> {
            self.calls.lock().unwrap().push((start, end));
            self.snapshot
                .clone()
                .ok_or_else(|| anyhow!("connection refused"))
        }
    }

    /// Fails the first `failures` fetches, then serves `snapshot`.
    struct FlakySource {
        failures: usize,
        calls: Arc<AtomicUsize>,
        snapshot: BufferSnapshot,
    }

    impl MeasurementSource for FlakySource {
        async fn fetch(&self, _start: i64, _end: i64) -> Result<BufferSnapshot> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(anyhow!("connection refused"));
            }
            Ok(self.snapshot.clone())
        }
    }

    fn reading(recorded_at: i64, temperature: Option<f64>, humidity: Option<f64>) -> BufferReading {
        BufferReading {
            recorded_at,
            temperature,
            humidity,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_a_row_per_sensor_and_quantity() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path().join("s.db"), 1).await?;
        let mut snapshot = BufferSnapshot::new();
        snapshot.insert(
            "A".to_string(),
            vec![
                reading(10, Some(20.0), Some(40.0)),
                reading(20, Some(22.0), None),
                reading(30, Some(21.0), Some(50.0)),
                reading(40, Some(23.0), None),
            ],
        );
        let collector = SummaryCollector::new(store.clone(), StubSource::new(Some(snapshot)));
        collector.prepare().await?;

        let outcome = collector.collect(CollectorPeriod::Hourly, 0, 3_600).await?;
        assert_eq!(outcome, CollectOutcome::Collected { sensors: 1 });

        let temperature = store
            .collector_summaries_in_range(Quantity::Temperature, CollectorPeriod::Hourly, 0, 1)
            .await?;
        assert_eq!(temperature.len(), 1);
        assert_eq!(temperature[0].stats.minimum, Some(20.0));
        assert_eq!(temperature[0].stats.maximum, Some(23.0));
        assert_eq!(temperature[0].stats.median, Some(21.5));
        assert_eq!(temperature[0].stats.mean, Some(21.5));

        let humidity = store
            .collector_summaries_in_range(Quantity::Humidity, CollectorPeriod::Hourly, 0, 1)
            .await?;
        assert_eq!(humidity[0].stats.median, Some(45.0));

        // Quantities the sensor never reported still get an all-null row.
        let pressure = store
            .collector_summaries_in_range(Quantity::Pressure, CollectorPeriod::Hourly, 0, 1)
            .await?;
        assert_eq!(pressure.len(), 1);
        assert_eq!(pressure[0].stats, NullableStats::default());
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_buffer_skips_the_window() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path().join("s.db"), 1).await?;
        let collector = SummaryCollector::new(store.clone(), StubSource::new(None));
        collector.prepare().await?;

        let outcome = collector.collect(CollectorPeriod::Daily, 0, DAY_SECS).await?;
        assert_eq!(outcome, CollectOutcome::Skipped);
        let rows = store
            .collector_summaries_in_range(Quantity::Temperature, CollectorPeriod::Daily, 0, i64::MAX)
            .await?;
        assert!(rows.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn skipped_window_is_collected_once_the_buffer_recovers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path().join("s.db"), 1).await?;
        let mut snapshot = BufferSnapshot::new();
        snapshot.insert("A".to_string(), vec![reading(10, Some(20.0), None)]);
        let calls = Arc::new(AtomicUsize::new(0));
        let source = FlakySource {
            failures: 1,
            calls: calls.clone(),
            snapshot,
        };

        let now = chrono::Utc::now().timestamp();
        let window_start = hour_start(now) - HOUR_SECS;
        let cancel = CancellationToken::new();
        let handle = CollectorService::new(
            SummaryCollector::new(store.clone(), source),
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .with_state(SchedulerState::new(now - HOUR_SECS))
        .start(cancel.clone());

        let mut rows = Vec::new();
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.table_names().await?.iter().any(|t| t == "hourly_temperature") {
                rows = store
                    .collector_summaries_in_range(
                        Quantity::Temperature,
                        CollectorPeriod::Hourly,
                        window_start,
                        window_start + 1,
                    )
                    .await?;
            }
            if !rows.is_empty() {
                break;
            }
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stats.median, Some(20.0));
        assert!(calls.load(Ordering::SeqCst) >= 2);

        // Nothing is pending any more, so later ticks do not fetch.
        let settled = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), settled);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await??;
        Ok(())
    }

    #[test]
    fn scheduler_fires_on_hour_and_day_changes() {
        let day = 19_723 * DAY_SECS;
        let mut state = SchedulerState::new(day + 22 * HOUR_SECS + 100);
        assert!(state.due(day + 22 * HOUR_SECS + 130).is_empty());

        assert_eq!(
            state.due(day + 23 * HOUR_SECS + 5),
            vec![(CollectorPeriod::Hourly, day + 22 * HOUR_SECS, day + 23 * HOUR_SECS)]
        );
        assert!(state.due(day + 23 * HOUR_SECS + 35).is_empty());

        let next_day = day + DAY_SECS;
        assert_eq!(
            state.due(next_day + 1),
            vec![
                (CollectorPeriod::Hourly, next_day - HOUR_SECS, next_day),
                (CollectorPeriod::Daily, day, next_day),
            ]
        );
    }

    #[tokio::test]
    async fn http_source_requests_the_window() -> Result<()> {
        use axum::extract::Query;
        use axum::routing::get;
        use axum::{Json, Router};
        use std::collections::HashMap;

        async fn buffer(Query(params): Query<HashMap<String, i64>>) -> Json<BufferSnapshot> {
            let mut snapshot = BufferSnapshot::new();
            snapshot.insert(
                "AABBCC".to_string(),
                vec![reading(params["start"], Some(19.5), None)],
            );
            Json(snapshot)
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let app = Router::new().route("/buffer.json", get(buffer));
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let source = HttpBufferSource::new(&format!("http://{address}"), Duration::from_secs(5))?;
        let snapshot = source.fetch(3_600, 7_200).await?;
        assert_eq!(snapshot["AABBCC"], vec![reading(3_600, Some(19.5), None)]);

        server.abort();
        Ok(())
    }
}
