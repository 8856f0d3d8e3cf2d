//! Historical merger: reads older store generations, reduces them to daily
//! statistics and merges them into one archive.

mod adapters;
mod archive;
mod daily;

pub use adapters::{adapter_for, parse_timestamp, SchemaAdapter};
pub use archive::{format_value, DailyKey, HistoricalArchive, TSV_COMMENT, TSV_HEADER};
pub use daily::{aggregate_to_daily, DailyStats, HourlyValue};

use crate::db::Store;
use crate::quantity::Quantity;
use crate::schema;
use anyhow::Result;
use chrono::DateTime;
use std::path::{Path, PathBuf};

/// Combines sources in order. A key produced by a later source replaces the
/// entry of any earlier one.
pub fn merge(sources: impl IntoIterator<Item = HistoricalArchive>) -> HistoricalArchive {
    let mut merged = HistoricalArchive::new();
    for source in sources {
        merged.absorb(source.iter().map(|(key, stats)| (key.clone(), *stats)));
    }
    merged
}

/// Daily statistics for every quantity in one store.
pub async fn extract_store(store: &Store) -> Result<HistoricalArchive> {
    let variant = schema::detect(store).await?;
    let mut archive = HistoricalArchive::new();
    let Some(adapter) = adapter_for(variant) else {
        tracing::warn!(path = %store.path().display(), "unrecognised store layout; skipping");
        return Ok(archive);
    };
    tracing::info!(path = %store.path().display(), schema = %variant, "extracting history");

    for quantity in Quantity::ALL {
        let hourly = adapter.extract_hourly(store, quantity).await?;
        let daily = aggregate_to_daily(&hourly);
        tracing::info!(
            path = %store.path().display(),
            quantity = %quantity,
            hourly = hourly.len(),
            days = daily.len(),
            "extracted quantity"
        );
        archive.absorb(daily.into_iter().map(|((day_start, sensor), stats)| {
            (
                DailyKey {
                    day_start,
                    sensor,
                    quantity,
                },
                stats,
            )
        }));
    }
    Ok(archive)
}

async fn extract_path(path: &Path) -> HistoricalArchive {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "history source not found; skipping");
        return HistoricalArchive::new();
    }
    let store = match Store::open_read_only(path).await {
        Ok(store) => store,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "history source unreadable; skipping");
            return HistoricalArchive::new();
        }
    };
    match extract_store(&store).await {
        Ok(archive) => archive,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "history extraction failed; skipping");
            HistoricalArchive::new()
        }
    }
}

/// Runs the merger over `paths`, later paths taking precedence. Sources that
/// are missing, unreadable or of an unknown layout contribute nothing.
pub async fn extract_history(paths: &[PathBuf]) -> HistoricalArchive {
    let mut sources = Vec::with_capacity(paths.len());
    for (idx, path) in paths.iter().enumerate() {
        tracing::info!(source = idx + 1, total = paths.len(), path = %path.display(), "reading history source");
        sources.push(extract_path(path).await);
    }
    let merged = merge(sources);

    match merged.day_range() {
        Some((first, last)) => tracing::info!(
            rows = merged.len(),
            sensors = merged.sensors().len(),
            first_day = %format_day(first),
            last_day = %format_day(last),
            "history merge complete"
        ),
        None => tracing::warn!("history merge produced no rows"),
    }
    merged
}

fn format_day(day_start: i64) -> String {
    DateTime::from_timestamp(day_start, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| day_start.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaVariant;
    use crate::schema::fixtures::{fixture, AGGREGATED, INDIVIDUAL_VALUE, SUMMARY_COLLECTOR};

    const JAN_1: i64 = 1_704_067_200;

    fn single(value: f64) -> HistoricalArchive {
        let mut archive = HistoricalArchive::new();
        archive.absorb([(
            DailyKey {
                day_start: JAN_1,
                sensor: "X".to_string(),
                quantity: Quantity::Temperature,
            },
            DailyStats {
                min: value,
                max: value,
                median: value,
            },
        )]);
        archive
    }

    #[test]
    fn last_source_wins_for_a_shared_key() {
        let merged = merge([single(1.0), single(2.0), single(3.0)]);
        assert_eq!(merged.len(), 1);
        let (_, stats) = merged.iter().next().unwrap();
        assert_eq!(stats.median, 3.0);
    }

    #[test]
    fn later_source_replaces_the_whole_entry() {
        let mut richer = single(1.0);
        richer.absorb([(
            DailyKey {
                day_start: JAN_1 + 86_400,
                sensor: "X".to_string(),
                quantity: Quantity::Temperature,
            },
            DailyStats {
                min: 0.0,
                max: 9.0,
                median: 4.0,
            },
        )]);
        let partial = single(7.0);

        let merged = merge([richer, partial]);
        assert_eq!(merged.len(), 2);
        let medians: Vec<f64> = merged.iter().map(|(_, s)| s.median).collect();
        assert_eq!(medians, vec![7.0, 4.0]);
    }

    #[tokio::test]
    async fn extracts_and_merges_store_files() {
        let dir = tempfile::tempdir().unwrap();

        let old = dir.path().join("old.db");
        let _old = fixture(
            &old,
            &[
                INDIVIDUAL_VALUE[0],
                "INSERT INTO measurement_temperature VALUES (1704067200, 'X', 10.0)",
                "INSERT INTO measurement_temperature VALUES (1704070800, 'X', 12.0)",
                "INSERT INTO measurement_temperature VALUES (1704153600, 'Y', 5.0)",
            ],
        )
        .await;

        let mid = dir.path().join("mid.db");
        let _mid = fixture(
            &mid,
            &[
                AGGREGATED[0],
                "INSERT INTO measurement_temperature VALUES (1704067200, 'X', 1.0, 3.0, 2.0)",
            ],
        )
        .await;

        let new = dir.path().join("new.db");
        let _new = fixture(
            &new,
            &[
                SUMMARY_COLLECTOR[0],
                "INSERT INTO daily_temperature VALUES (1704153600, 'Y', 4.0, 6.0, 5.5, 5.0)",
            ],
        )
        .await;

        let paths = vec![old, dir.path().join("missing.db"), mid, new];
        let merged = extract_history(&paths).await;
        assert_eq!(merged.len(), 2);

        let x = merged
            .get(&DailyKey {
                day_start: JAN_1,
                sensor: "X".to_string(),
                quantity: Quantity::Temperature,
            })
            .unwrap();
        assert_eq!(x.median, 2.0);

        let y = merged
            .get(&DailyKey {
                day_start: JAN_1 + 86_400,
                sensor: "Y".to_string(),
                quantity: Quantity::Temperature,
            })
            .unwrap();
        assert_eq!(y.median, 5.5);
    }

    #[tokio::test]
    async fn unknown_layout_contributes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        let store = fixture(&path, &["CREATE TABLE readings (ts INTEGER, v REAL)"]).await;
        assert_eq!(schema::detect(&store).await.unwrap(), SchemaVariant::Unknown);

        assert!(extract_history(&[path]).await.is_empty());
    }
}
