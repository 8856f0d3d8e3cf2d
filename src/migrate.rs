//! Splits the legacy single wide `measurement` table into per-quantity raw
//! tables.

use crate::db::Store;
use crate::history::parse_timestamp;
use crate::quantity::Quantity;
use anyhow::{bail, Result};
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::time::Instant;

pub const LEGACY_TABLE: &str = "measurement";
pub const COMMIT_EVERY: u64 = 100_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitReport {
    pub copied: u64,
    pub skipped_existing: u64,
    pub skipped_null: u64,
    pub unparsed: u64,
}

/// Copies every quantity column present in `source` into `destination`.
/// Keys already present in the destination are left untouched.
pub async fn split_legacy(source: &Store, destination: &Store) -> Result<BTreeMap<Quantity, SplitReport>> {
    let columns = source.table_columns(LEGACY_TABLE).await?;
    if columns.is_empty() {
        bail!(
            "{} has no {LEGACY_TABLE} table to split",
            source.path().display()
        );
    }
    destination.ensure_raw_tables().await?;

    let mut reports = BTreeMap::new();
    for quantity in Quantity::ALL {
        let Some(column) = quantity
            .table_names()
            .iter()
            .find(|name| columns.iter().any(|c| c == *name))
        else {
            tracing::info!(quantity = %quantity, "no legacy column; skipping");
            continue;
        };
        let report = copy_quantity(source, destination, quantity, column).await?;
        tracing::info!(
            quantity = %quantity,
            column,
            copied = report.copied,
            skipped_existing = report.skipped_existing,
            skipped_null = report.skipped_null,
            unparsed = report.unparsed,
            "split quantity"
        );
        reports.insert(quantity, report);
    }
    Ok(reports)
}

async fn copy_quantity(
    source: &Store,
    destination: &Store,
    quantity: Quantity,
    column: &str,
) -> Result<SplitReport> {
    let _source_guard = source.lock().await;
    let _destination_guard = destination.lock().await;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {LEGACY_TABLE}"))
        .fetch_one(source.pool())
        .await?;
    let select = format!(
        "SELECT CAST(recorded_at AS TEXT), CAST(sensor AS TEXT), CAST({column} AS REAL) FROM {LEGACY_TABLE} ORDER BY recorded_at"
    );
    let insert = format!(
        "INSERT INTO {} (recorded_at, sensor, value) VALUES (?1, ?2, ?3) ON CONFLICT (recorded_at, sensor) DO NOTHING",
        quantity.raw_table()
    );

    let mut rows = sqlx::query_as::<_, (Option<String>, Option<String>, Option<f64>)>(&select)
        .fetch(source.pool());
    let mut report = SplitReport::default();
    let mut tx = destination.begin().await?;
    let mut pending = 0u64;
    let mut scanned = 0u64;
    let started = Instant::now();

    while let Some((ts, sensor, value)) = rows.try_next().await? {
        scanned += 1;
        let Some(value) = value else {
            report.skipped_null += 1;
            continue;
        };
        let (Some(ts), Some(sensor)) = (ts.as_deref().and_then(parse_timestamp), sensor) else {
            report.unparsed += 1;
            continue;
        };
        let result = sqlx::query(&insert)
            .bind(ts)
            .bind(&sensor)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            report.skipped_existing += 1;
        } else {
            report.copied += 1;
        }

        pending += 1;
        if pending >= COMMIT_EVERY {
            tx.commit().await?;
            tx = destination.begin().await?;
            pending = 0;

            let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
            let rate = scanned as f64 / elapsed;
            let remaining = (total as f64 - scanned as f64).max(0.0);
            tracing::info!(
                quantity = %quantity,
                scanned,
                total,
                rows_per_sec = rate.round(),
                eta_secs = (remaining / rate).round(),
                "split progress"
            );
        }
    }
    tx.commit().await?;

    sqlx::query(&format!(
        r#"
        INSERT INTO sensor (sensor, last_seen_at)
        SELECT sensor, MAX(recorded_at) FROM {} GROUP BY sensor
        ON CONFLICT (sensor) DO UPDATE SET last_seen_at = MAX(last_seen_at, excluded.last_seen_at)
        "#,
        quantity.raw_table()
    ))
    .execute(destination.pool())
    .await?;

    Ok(report)
}
