use crate::db::RawPoint;
use crate::quantity::{Quantity, HOUR_SECS};
use anyhow::Result;
use sqlx::{Sqlite, Transaction};

/// Compaction rule for dedup ingest.
///
/// `prior` holds the stored points for the sensor/quantity, newest first.
/// The newest prior point is replaced by the incoming reading only when
/// exactly two priors exist, both gaps are under an hour, and the value is
/// within the quantity's relative tolerance of the newest prior.
pub fn should_compact(prior: &[RawPoint], recorded_at: i64, value: f64, rel_tol: f64) -> bool {
    let [latest, second] = prior else {
        return false;
    };
    let between = latest.recorded_at - second.recorded_at;
    let since_latest = recorded_at - latest.recorded_at;
    between < HOUR_SECS && since_latest < HOUR_SECS && is_close(latest.value, value, rel_tol)
}

fn is_close(a: f64, b: f64, rel_tol: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= rel_tol * a.abs().max(b.abs())
}

/// Writes one reading inside `tx`. Returns true when the previous point was
/// compacted away.
pub(in crate::ingest) async fn write_reading(
    tx: &mut Transaction<'static, Sqlite>,
    quantity: Quantity,
    sensor: &str,
    recorded_at: i64,
    value: f64,
) -> Result<bool> {
    let table = quantity.raw_table();
    let prior: Vec<(i64, f64)> = sqlx::query_as(&format!(
        r#"
        SELECT recorded_at, value
        FROM {table}
        WHERE sensor = ?1 AND value IS NOT NULL
        ORDER BY recorded_at DESC
        LIMIT 2
        "#
    ))
    .bind(sensor)
    .fetch_all(&mut **tx)
    .await?;
    let prior: Vec<RawPoint> = prior
        .into_iter()
        .map(|(recorded_at, value)| RawPoint { recorded_at, value })
        .collect();

    let compact = should_compact(&prior, recorded_at, value, quantity.change_threshold());
    if compact {
        let latest = prior[0].recorded_at;
        tracing::debug!(%quantity, sensor, recorded_at = latest, "compacting previous reading");
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE recorded_at = ?1 AND sensor = ?2"
        ))
        .bind(latest)
        .bind(sensor)
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query(&format!(
        "INSERT OR REPLACE INTO {table} (recorded_at, sensor, value) VALUES (?1, ?2, ?3)"
    ))
    .bind(recorded_at)
    .bind(sensor)
    .bind(value)
    .execute(&mut **tx)
    .await?;

    Ok(compact)
}

pub(in crate::ingest) async fn touch_sensor(
    tx: &mut Transaction<'static, Sqlite>,
    sensor: &str,
    seen_at: i64,
) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO sensor (sensor, last_seen_at) VALUES (?1, ?2)")
        .bind(sensor)
        .bind(seen_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Deletes raw rows older than `cutoff` from every quantity table.
pub(in crate::ingest) async fn prune_before(
    tx: &mut Transaction<'static, Sqlite>,
    cutoff: i64,
) -> Result<u64> {
    let mut removed = 0;
    for quantity in Quantity::ALL {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE recorded_at < ?1",
            quantity.raw_table()
        ))
        .bind(cutoff)
        .execute(&mut **tx)
        .await?;
        removed += result.rows_affected();
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(recorded_at: i64, value: f64) -> RawPoint {
        RawPoint { recorded_at, value }
    }

    #[test]
    fn needs_exactly_two_priors() {
        assert!(!should_compact(&[], 100, 20.0, 0.02));
        assert!(!should_compact(&[point(60, 20.0)], 100, 20.0, 0.02));
        assert!(should_compact(&[point(60, 20.0), point(0, 20.0)], 100, 20.1, 0.02));
    }

    #[test]
    fn gaps_of_an_hour_or_more_keep_the_prior() {
        let priors = [point(3_600, 20.0), point(0, 20.0)];
        assert!(!should_compact(&priors, 3_700, 20.0, 0.02));
        let priors = [point(3_599, 20.0), point(0, 20.0)];
        assert!(should_compact(&priors, 7_198, 20.0, 0.02));
        assert!(!should_compact(&priors, 7_199, 20.0, 0.02));
    }

    #[test]
    fn relative_tolerance_is_against_the_larger_magnitude() {
        let priors = [point(60, 100.0), point(0, 100.0)];
        assert!(should_compact(&priors, 120, 102.0, 0.02));
        assert!(!should_compact(&priors, 120, 102.1, 0.02));
        assert!(should_compact(&priors, 120, 98.0, 0.02));

        let zeros = [point(60, 0.0), point(0, 0.0)];
        assert!(should_compact(&zeros, 120, 0.0, 0.02));
        assert!(!should_compact(&zeros, 120, 0.001, 0.02));
    }
}
