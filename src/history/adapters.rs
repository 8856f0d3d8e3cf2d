use super::daily::HourlyValue;
use crate::db::Store;
use crate::quantity::{hour_start, Quantity};
use crate::schema::SchemaVariant;
use crate::stats::median;
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime};
use futures::future::BoxFuture;
use std::collections::BTreeMap;

/// Reads a uniform hourly series for one quantity out of one store layout.
pub trait SchemaAdapter: Send + Sync {
    fn variant(&self) -> SchemaVariant;

    fn extract_hourly<'a>(
        &'a self,
        store: &'a Store,
        quantity: Quantity,
    ) -> BoxFuture<'a, Result<Vec<HourlyValue>>>;
}

pub struct LegacySummaryAdapter;
pub struct IndividualValueAdapter;
pub struct AggregatedAdapter;
pub struct SummaryCollectorAdapter;

static LEGACY_SUMMARY: LegacySummaryAdapter = LegacySummaryAdapter;
static INDIVIDUAL_VALUE: IndividualValueAdapter = IndividualValueAdapter;
static AGGREGATED: AggregatedAdapter = AggregatedAdapter;
static SUMMARY_COLLECTOR: SummaryCollectorAdapter = SummaryCollectorAdapter;

pub fn adapter_for(variant: SchemaVariant) -> Option<&'static dyn SchemaAdapter> {
    match variant {
        SchemaVariant::LegacySummary => Some(&LEGACY_SUMMARY),
        SchemaVariant::IndividualValue => Some(&INDIVIDUAL_VALUE),
        SchemaVariant::Aggregated => Some(&AGGREGATED),
        SchemaVariant::SummaryCollector => Some(&SUMMARY_COLLECTOR),
        SchemaVariant::Unknown => None,
    }
}

impl SchemaAdapter for LegacySummaryAdapter {
    fn variant(&self) -> SchemaVariant {
        SchemaVariant::LegacySummary
    }

    /// Pre-computed hourly medians from `summary_<q>_3600`.
    fn extract_hourly<'a>(
        &'a self,
        store: &'a Store,
        quantity: Quantity,
    ) -> BoxFuture<'a, Result<Vec<HourlyValue>>> {
        Box::pin(async move {
            let candidates: Vec<String> = quantity
                .table_names()
                .iter()
                .map(|name| format!("summary_{name}_3600"))
                .collect();
            let Some(table) = first_existing(store, &candidates).await? else {
                return Ok(Vec::new());
            };
            let rows = fetch_series(store, &table, "starts_at", "median_value").await?;
            Ok(rows
                .into_iter()
                .map(|(ts, sensor, value)| HourlyValue {
                    hour_start: hour_start(ts),
                    sensor,
                    value,
                })
                .collect())
        })
    }
}

impl SchemaAdapter for IndividualValueAdapter {
    fn variant(&self) -> SchemaVariant {
        SchemaVariant::IndividualValue
    }

    /// Raw readings grouped per sensor and hour, reduced to their median.
    fn extract_hourly<'a>(
        &'a self,
        store: &'a Store,
        quantity: Quantity,
    ) -> BoxFuture<'a, Result<Vec<HourlyValue>>> {
        Box::pin(async move {
            let Some(table) = raw_table(store, quantity).await? else {
                return Ok(Vec::new());
            };
            let rows = fetch_series(store, &table, "recorded_at", "value").await?;
            Ok(hourly_medians(rows))
        })
    }
}

impl SchemaAdapter for AggregatedAdapter {
    fn variant(&self) -> SchemaVariant {
        SchemaVariant::Aggregated
    }

    /// Sub-hourly medians grouped per sensor and hour. A lone value is kept
    /// as is, otherwise the median of the medians is taken.
    fn extract_hourly<'a>(
        &'a self,
        store: &'a Store,
        quantity: Quantity,
    ) -> BoxFuture<'a, Result<Vec<HourlyValue>>> {
        Box::pin(async move {
            let Some(table) = raw_table(store, quantity).await? else {
                return Ok(Vec::new());
            };
            let columns = store.table_columns(&table).await?;
            if !columns.iter().any(|c| c == "median") {
                return Ok(Vec::new());
            }
            let rows = fetch_series(store, &table, "recorded_at", "median").await?;
            Ok(hourly_medians(rows))
        })
    }
}

impl SchemaAdapter for SummaryCollectorAdapter {
    fn variant(&self) -> SchemaVariant {
        SchemaVariant::SummaryCollector
    }

    /// `hourly_<q>` medians, falling back to the coarser `daily_<q>`.
    fn extract_hourly<'a>(
        &'a self,
        store: &'a Store,
        quantity: Quantity,
    ) -> BoxFuture<'a, Result<Vec<HourlyValue>>> {
        Box::pin(async move {
            let mut candidates = Vec::new();
            for granularity in ["hourly", "daily"] {
                for name in quantity.table_names() {
                    candidates.push(format!("{granularity}_{name}"));
                }
            }
            let Some(table) = first_existing(store, &candidates).await? else {
                return Ok(Vec::new());
            };
            let rows = fetch_series(store, &table, "period_start_at", "median").await?;
            Ok(rows
                .into_iter()
                .map(|(ts, sensor, value)| HourlyValue {
                    hour_start: hour_start(ts),
                    sensor,
                    value,
                })
                .collect())
        })
    }
}

async fn first_existing(store: &Store, candidates: &[String]) -> Result<Option<String>> {
    let tables = store.table_names().await?;
    Ok(candidates
        .iter()
        .find(|candidate| tables.contains(candidate))
        .cloned())
}

async fn raw_table(store: &Store, quantity: Quantity) -> Result<Option<String>> {
    let candidates: Vec<String> = quantity
        .table_names()
        .iter()
        .map(|name| format!("measurement_{name}"))
        .collect();
    first_existing(store, &candidates).await
}

/// `(timestamp, sensor, value)` rows with a non-null value, in time order.
/// Table and column names come from the adapters above, never from input.
async fn fetch_series(
    store: &Store,
    table: &str,
    time_column: &str,
    value_column: &str,
) -> Result<Vec<(i64, String, f64)>> {
    let _guard = store.lock().await;
    let rows: Vec<(Option<String>, Option<String>, Option<f64>)> = sqlx::query_as(&format!(
        r#"
        SELECT CAST({time_column} AS TEXT), CAST(sensor AS TEXT), CAST({value_column} AS REAL)
        FROM {table}
        WHERE {value_column} IS NOT NULL
        ORDER BY {time_column}, sensor
        "#
    ))
    .fetch_all(store.pool())
    .await?;

    let mut series = Vec::with_capacity(rows.len());
    let mut unparsed = 0usize;
    for (ts, sensor, value) in rows {
        match (ts.as_deref().and_then(parse_timestamp), sensor, value) {
            (Some(ts), Some(sensor), Some(value)) => series.push((ts, sensor, value)),
            _ => unparsed += 1,
        }
    }
    if unparsed > 0 {
        tracing::warn!(table, unparsed, "skipped rows with unreadable timestamps");
    }
    Ok(series)
}

fn hourly_medians(rows: Vec<(i64, String, f64)>) -> Vec<HourlyValue> {
    let mut grouped: BTreeMap<(String, i64), Vec<f64>> = BTreeMap::new();
    for (ts, sensor, value) in rows {
        grouped.entry((sensor, hour_start(ts))).or_default().push(value);
    }
    grouped
        .into_iter()
        .filter_map(|((sensor, hour), values)| {
            let value = match values.as_slice() {
                [single] => *single,
                _ => median(&values)?,
            };
            Some(HourlyValue {
                hour_start: hour,
                sensor,
                value,
            })
        })
        .collect()
}

/// Unix seconds from an integer, a float, or an ISO-8601 string. Timestamps
/// without an offset are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(secs);
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return secs.is_finite().then(|| secs.floor() as i64);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.timestamp());
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::{self as fx, fixture};

    #[test]
    fn parses_every_timestamp_generation() {
        assert_eq!(parse_timestamp("1704067200"), Some(1_704_067_200));
        assert_eq!(parse_timestamp("1704067200.75"), Some(1_704_067_200));
        assert_eq!(parse_timestamp("2024-01-01T00:00:00+00:00"), Some(1_704_067_200));
        assert_eq!(parse_timestamp("2024-01-01T01:00:00+01:00"), Some(1_704_067_200));
        assert_eq!(parse_timestamp("2024-01-01 00:00:00.123456"), Some(1_704_067_200));
        assert_eq!(parse_timestamp("2024-01-01T00:30:00"), Some(1_704_069_000));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[tokio::test]
    async fn individual_values_reduce_to_hourly_medians() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = fixture(
            &dir.path().join("individual.db"),
            &[
                fx::INDIVIDUAL_VALUE[0],
                "INSERT INTO measurement_temperature VALUES ('2024-01-01 00:10:00', 'A', 20.0)",
                "INSERT INTO measurement_temperature VALUES ('2024-01-01 00:20:00', 'A', 21.0)",
                "INSERT INTO measurement_temperature VALUES ('2024-01-01 00:30:00', 'A', 23.0)",
                "INSERT INTO measurement_temperature VALUES ('2024-01-01 00:40:00', 'A', 30.0)",
                "INSERT INTO measurement_temperature VALUES ('2024-01-01 01:00:00', 'A', 19.0)",
                "INSERT INTO measurement_temperature VALUES ('2024-01-01 01:05:00', 'A', NULL)",
            ],
        )
        .await;

        let rows = IndividualValueAdapter
            .extract_hourly(&store, Quantity::Temperature)
            .await?;
        assert_eq!(
            rows,
            vec![
                HourlyValue { hour_start: 1_704_067_200, sensor: "A".into(), value: 22.0 },
                HourlyValue { hour_start: 1_704_070_800, sensor: "A".into(), value: 19.0 },
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn aggregated_rows_take_the_median_of_medians() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = fixture(
            &dir.path().join("aggregated.db"),
            &[
                fx::AGGREGATED[0],
                "INSERT INTO measurement_temperature VALUES ('2024-01-01T00:00:00', 'A', 1, 3, 2.0)",
                "INSERT INTO measurement_temperature VALUES ('2024-01-01T00:15:00', 'A', 1, 5, 4.0)",
                "INSERT INTO measurement_temperature VALUES ('2024-01-01T02:00:00', 'B', 1, 9, 7.5)",
            ],
        )
        .await;

        let rows = AggregatedAdapter
            .extract_hourly(&store, Quantity::Temperature)
            .await?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 3.0);
        assert_eq!(rows[1].sensor, "B");
        assert_eq!(rows[1].value, 7.5);
        Ok(())
    }

    #[tokio::test]
    async fn collector_prefers_hourly_tables() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = fixture(
            &dir.path().join("collector.db"),
            &[
                fx::SUMMARY_COLLECTOR[0],
                "CREATE TABLE hourly_temperature (period_start_at INTEGER, sensor TEXT, minimum REAL, maximum REAL, median REAL, mean REAL)",
                "INSERT INTO daily_temperature VALUES (1704067200, 'A', 0, 0, 99.0, 0)",
                "INSERT INTO hourly_temperature VALUES (1704070800, 'A', 0, 0, 21.0, 0)",
                "INSERT INTO hourly_temperature VALUES (1704074400, 'A', NULL, NULL, NULL, NULL)",
            ],
        )
        .await;

        let rows = SummaryCollectorAdapter
            .extract_hourly(&store, Quantity::Temperature)
            .await?;
        assert_eq!(
            rows,
            vec![HourlyValue { hour_start: 1_704_070_800, sensor: "A".into(), value: 21.0 }]
        );

        let daily_only = fixture(
            &dir.path().join("daily.db"),
            &[
                fx::SUMMARY_COLLECTOR[0],
                "INSERT INTO daily_temperature VALUES (1704067200, 'A', 0, 0, 18.5, 0)",
            ],
        )
        .await;
        let rows = SummaryCollectorAdapter
            .extract_hourly(&daily_only, Quantity::Temperature)
            .await?;
        assert_eq!(rows[0].value, 18.5);
        Ok(())
    }

    #[tokio::test]
    async fn legacy_summaries_accept_the_old_voltage_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = fixture(
            &dir.path().join("legacy.db"),
            &[
                fx::LEGACY_SUMMARY[0],
                "CREATE TABLE summary_battery_voltage_3600 (starts_at INTEGER, sensor TEXT, min_value REAL, max_value REAL, median_value REAL, mean_value REAL)",
                "INSERT INTO summary_battery_voltage_3600 VALUES (1704067200, 'A', 2.9, 3.0, 2.95, 2.95)",
            ],
        )
        .await;

        let adapter = adapter_for(SchemaVariant::LegacySummary).unwrap();
        assert_eq!(adapter.variant(), SchemaVariant::LegacySummary);
        let rows = adapter.extract_hourly(&store, Quantity::Voltage).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 2.95);
        assert!(adapter
            .extract_hourly(&store, Quantity::Humidity)
            .await?
            .is_empty());
        assert!(adapter_for(SchemaVariant::Unknown).is_none());
        Ok(())
    }
}
