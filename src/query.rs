//! Query Engine: column-major matrices over the live stores, optionally
//! stitched with the historical daily archive.

use crate::collector::{BufferReading, BufferSnapshot};
use crate::db::{SensorRow, Store};
use crate::error::HubError;
use crate::history::HistoricalArchive;
use crate::quantity::{align_down, day_start, hour_start, CollectorPeriod, Period, Quantity, DAY_SECS, HOUR_SECS};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

pub const MINUTE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Minute,
    Summary(Period),
}

impl Resolution {
    pub fn for_span(span_secs: i64) -> Self {
        if span_secs < DAY_SECS {
            Resolution::Minute
        } else if span_secs < 7 * DAY_SECS {
            Resolution::Summary(Period::Hour)
        } else if span_secs < 32 * DAY_SECS {
            Resolution::Summary(Period::ThreeHours)
        } else {
            Resolution::Summary(Period::Day)
        }
    }
}

/// Raw query string of the matrix endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParams {
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(rename = "measurementType")]
    pub measurement_type: Option<String>,
    /// Comma-separated sensor ids.
    pub sensors: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub start: i64,
    pub end: i64,
    pub quantity: Quantity,
    pub sensors: Option<Vec<String>>,
}

impl QueryRequest {
    /// Validates every parameter before anything reaches a store.
    pub fn parse(params: &QueryParams) -> Result<Self, HubError> {
        let start = required_timestamp(params.start.as_deref(), "start")?;
        let end = required_timestamp(params.end.as_deref(), "end")?;
        if end <= start {
            return Err(HubError::InvalidRange { start, end });
        }
        let name = non_empty(params.measurement_type.as_deref()).ok_or_else(|| {
            HubError::InvalidParameter {
                name: "measurementType",
                reason: "required".to_string(),
            }
        })?;
        let quantity = Quantity::parse_external(name)?;

        let sensors = params.sensors.as_deref().and_then(|raw| {
            let mut seen = BTreeSet::new();
            let list: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty() && seen.insert(*id))
                .map(str::to_string)
                .collect();
            (!list.is_empty()).then_some(list)
        });

        Ok(Self {
            start,
            end,
            quantity,
            sensors,
        })
    }

    pub fn span(&self) -> i64 {
        self.end - self.start
    }

    fn wants(&self, sensor: &str) -> bool {
        self.sensors
            .as_ref()
            .map_or(true, |list| list.iter().any(|id| id == sensor))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BufferParams {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl BufferParams {
    /// `[start, end)`; without parameters the hour up to `now`.
    pub fn window(&self, now: i64) -> Result<(i64, i64), HubError> {
        let end = match non_empty(self.end.as_deref()) {
            Some(raw) => parse_unix(raw, "end")?,
            None => now,
        };
        let start = match non_empty(self.start.as_deref()) {
            Some(raw) => parse_unix(raw, "start")?,
            None => end - HOUR_SECS,
        };
        if end <= start {
            return Err(HubError::InvalidRange { start, end });
        }
        Ok((start, end))
    }
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

fn required_timestamp(raw: Option<&str>, name: &'static str) -> Result<i64, HubError> {
    let raw = non_empty(raw).ok_or_else(|| HubError::InvalidParameter {
        name,
        reason: "required".to_string(),
    })?;
    parse_unix(raw, name)
}

fn parse_unix(raw: &str, name: &'static str) -> Result<i64, HubError> {
    raw.parse::<i64>()
        .ok()
        .or_else(|| {
            raw.parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite())
                .map(|secs| secs.floor() as i64)
        })
        .ok_or_else(|| HubError::InvalidParameter {
            name,
            reason: format!("not a unix timestamp: {raw:?}"),
        })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Column {
    Timestamps(Vec<i64>),
    Values(Vec<Option<f64>>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatrixResponse {
    pub data: Vec<Column>,
    pub sensors: Vec<String>,
    pub summaries: bool,
}

struct MatrixBuilder {
    width: usize,
    rows: BTreeMap<i64, Vec<Option<f64>>>,
}

impl MatrixBuilder {
    fn new(width: usize) -> Self {
        Self {
            width,
            rows: BTreeMap::new(),
        }
    }

    fn set(&mut self, ts: i64, column: usize, value: Option<f64>) {
        let width = self.width;
        let row = self.rows.entry(ts).or_insert_with(|| vec![None; width]);
        if let Some(slot) = row.get_mut(column) {
            if value.is_some() {
                *slot = value;
            }
        }
    }

    fn build(self) -> Vec<Column> {
        let mut data = Vec::with_capacity(self.width + 1);
        data.push(Column::Timestamps(self.rows.keys().copied().collect()));
        for column in 0..self.width {
            data.push(Column::Values(
                self.rows.values().map(|row| row[column]).collect(),
            ));
        }
        data
    }
}

fn column_index(sensors: &[String]) -> HashMap<&str, usize> {
    sensors
        .iter()
        .enumerate()
        .map(|(idx, sensor)| (sensor.as_str(), idx))
        .collect()
}

#[derive(Clone)]
pub struct QueryEngine {
    raw: Store,
    summaries: Store,
    archive: Arc<HistoricalArchive>,
}

impl QueryEngine {
    pub fn new(raw: Store, summaries: Store, archive: Arc<HistoricalArchive>) -> Self {
        Self {
            raw,
            summaries,
            archive,
        }
    }

    /// Creates every table the engine reads so empty stores answer with empty
    /// matrices.
    pub async fn prepare(&self) -> Result<()> {
        self.raw.ensure_raw_tables().await?;
        for quantity in Quantity::ALL {
            for period in Period::STANDARD {
                self.raw.ensure_summary_table(quantity, period).await?;
            }
        }
        self.summaries.ensure_collector_tables().await
    }

    pub fn archive(&self) -> &HistoricalArchive {
        &self.archive
    }

    pub async fn measurements(&self, request: &QueryRequest) -> Result<MatrixResponse> {
        match Resolution::for_span(request.span()) {
            Resolution::Minute => self.minute_matrix(request).await,
            Resolution::Summary(period) => self.summary_matrix(request, period).await,
        }
    }

    async fn minute_matrix(&self, request: &QueryRequest) -> Result<MatrixResponse> {
        let rows: Vec<(i64, String, f64)> = self
            .raw
            .raw_rows(request.quantity, request.start, request.end)
            .await?
            .into_iter()
            .filter(|(_, sensor, _)| request.wants(sensor))
            .collect();
        let sensors = self
            .sensor_columns(request, rows.iter().map(|(_, sensor, _)| sensor.as_str()))
            .await?;
        let index = column_index(&sensors);

        let mut matrix = MatrixBuilder::new(sensors.len());
        // Rows arrive oldest first, so the last reading in a minute wins.
        for (ts, sensor, value) in &rows {
            if let Some(&column) = index.get(sensor.as_str()) {
                matrix.set(align_down(*ts, MINUTE_SECS), column, Some(*value));
            }
        }
        Ok(MatrixResponse {
            data: matrix.build(),
            sensors,
            summaries: false,
        })
    }

    /// Three columns per sensor: minimum, maximum, mean.
    async fn summary_matrix(&self, request: &QueryRequest, period: Period) -> Result<MatrixResponse> {
        let rows: Vec<_> = self
            .raw
            .summaries_in_range(
                request.quantity,
                period,
                align_down(request.start, period.secs()),
                request.end,
            )
            .await?
            .into_iter()
            .filter(|row| request.wants(&row.sensor))
            .collect();
        let sensors = self
            .sensor_columns(request, rows.iter().map(|row| row.sensor.as_str()))
            .await?;
        let index = column_index(&sensors);

        let mut matrix = MatrixBuilder::new(sensors.len() * 3);
        for row in &rows {
            if let Some(&idx) = index.get(row.sensor.as_str()) {
                matrix.set(row.starts_at, idx * 3, row.stats.minimum);
                matrix.set(row.starts_at, idx * 3 + 1, row.stats.maximum);
                matrix.set(row.starts_at, idx * 3 + 2, row.stats.mean);
            }
        }
        Ok(MatrixResponse {
            data: matrix.build(),
            sensors,
            summaries: true,
        })
    }

    /// Hourly medians from the summaries store, followed by archive
    /// `(min, max, median)` triples for days the live store does not cover.
    pub async fn summaries(&self, request: &QueryRequest) -> Result<MatrixResponse> {
        let live: Vec<_> = self
            .summaries
            .collector_summaries_in_range(
                request.quantity,
                CollectorPeriod::Hourly,
                hour_start(request.start),
                request.end,
            )
            .await?
            .into_iter()
            .filter(|row| request.wants(&row.sensor))
            .collect();

        let covered: BTreeSet<i64> = live.iter().map(|row| day_start(row.starts_at)).collect();
        let history: Vec<_> = self
            .archive
            .days_in_range(request.quantity, day_start(request.start), request.end)
            .filter(|(key, _)| !covered.contains(&key.day_start) && request.wants(&key.sensor))
            .collect();

        let mut present: BTreeSet<&str> = live.iter().map(|row| row.sensor.as_str()).collect();
        present.extend(history.iter().map(|(key, _)| key.sensor.as_str()));
        let sensors: Vec<String> = match &request.sensors {
            Some(list) => list.clone(),
            None => present.into_iter().map(str::to_string).collect(),
        };
        let index = column_index(&sensors);
        let n = sensors.len();

        let mut matrix = MatrixBuilder::new(n * 4);
        for row in &live {
            if let Some(&idx) = index.get(row.sensor.as_str()) {
                matrix.set(row.starts_at, idx, row.stats.median);
            }
        }
        for (key, stats) in &history {
            if let Some(&idx) = index.get(key.sensor.as_str()) {
                let base = n + idx * 3;
                matrix.set(key.day_start, base, Some(stats.min));
                matrix.set(key.day_start, base + 1, Some(stats.max));
                matrix.set(key.day_start, base + 2, Some(stats.median));
            }
        }
        tracing::debug!(
            quantity = %request.quantity,
            live_rows = live.len(),
            history_days = history.len(),
            "stitched summaries"
        );
        Ok(MatrixResponse {
            data: matrix.build(),
            sensors,
            summaries: true,
        })
    }

    /// Raw readings in `[start, end)` merged across quantities per sensor and
    /// timestamp.
    pub async fn buffer(&self, start: i64, end: i64) -> Result<BufferSnapshot> {
        let mut grouped: BTreeMap<String, BTreeMap<i64, BufferReading>> = BTreeMap::new();
        for quantity in Quantity::ALL {
            for (recorded_at, sensor, value) in self.raw.raw_rows(quantity, start, end).await? {
                grouped
                    .entry(sensor)
                    .or_default()
                    .entry(recorded_at)
                    .or_insert_with(|| BufferReading {
                        recorded_at,
                        ..BufferReading::default()
                    })
                    .set(quantity, value);
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(sensor, readings)| (sensor, readings.into_values().collect()))
            .collect())
    }

    pub async fn sensors(&self) -> Result<Vec<SensorRow>> {
        self.raw.sensors().await
    }

    /// Explicit filter order, or every known sensor plus any seen in `rows`,
    /// sorted.
    async fn sensor_columns<'a>(
        &self,
        request: &QueryRequest,
        rows: impl Iterator<Item = &'a str>,
    ) -> Result<Vec<String>> {
        if let Some(list) = &request.sensors {
            return Ok(list.clone());
        }
        let mut sensors: BTreeSet<String> = rows.map(str::to_string).collect();
        sensors.extend(self.raw.sensors().await?.into_iter().map(|row| row.sensor));
        Ok(sensors.into_iter().collect())
    }
}
