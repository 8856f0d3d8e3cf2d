use crate::quantity::{CollectorPeriod, Period, Quantity};
use crate::stats::{NullableStats, SummaryStats};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Handle to one SQLite store file.
///
/// Every access goes through `gate`, so the ingest path and HTTP request
/// handlers never interleave statements on the same store.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    gate: Arc<Mutex<()>>,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPoint {
    pub recorded_at: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorRow {
    pub sensor: String,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub starts_at: i64,
    pub sensor: String,
    pub stats: NullableStats,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(8))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open store {}", path.display()))?;
        Ok(Self {
            pool,
            gate: Arc::new(Mutex::new(())),
            path,
        })
    }

    /// Opens an existing file without creating or migrating it.
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open store {} read-only", path.display()))?;
        Ok(Self {
            pool,
            gate: Arc::new(Mutex::new(())),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Raw per-quantity tables plus the sensor liveness table.
    pub async fn ensure_raw_tables(&self) -> Result<()> {
        let _guard = self.lock().await;
        for quantity in Quantity::ALL {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    recorded_at INTEGER NOT NULL,
                    sensor TEXT NOT NULL,
                    value REAL,
                    CONSTRAINT recorded_at_sensor_pk PRIMARY KEY (recorded_at, sensor)
                ) WITHOUT ROWID
                "#,
                table = quantity.raw_table()
            ))
            .execute(&self.pool)
            .await?;
        }
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensor (
                sensor TEXT NOT NULL,
                last_seen_at INTEGER NOT NULL,
                CONSTRAINT sensor_pk PRIMARY KEY (sensor)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ensure_summary_table(&self, quantity: Quantity, period: Period) -> Result<()> {
        let _guard = self.lock().await;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                starts_at INTEGER NOT NULL,
                sensor TEXT NOT NULL,
                min_value REAL,
                max_value REAL,
                median_value REAL,
                mean_value REAL,
                CONSTRAINT starts_at_sensor_pk PRIMARY KEY (starts_at, sensor)
            ) WITHOUT ROWID
            "#,
            table = period.summary_table(quantity)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ensure_collector_tables(&self) -> Result<()> {
        let _guard = self.lock().await;
        for granularity in CollectorPeriod::ALL {
            for quantity in Quantity::ALL {
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        period_start_at INTEGER NOT NULL,
                        sensor TEXT NOT NULL,
                        minimum REAL,
                        maximum REAL,
                        median REAL,
                        mean REAL,
                        CONSTRAINT period_start_at_sensor_pk PRIMARY KEY (period_start_at, sensor)
                    ) WITHOUT ROWID
                    "#,
                    table = quantity.collector_table(granularity)
                ))
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn table_names(&self) -> Result<Vec<String>> {
        let _guard = self.lock().await;
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    pub async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let _guard = self.lock().await;
        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
                .bind(table)
                .fetch_all(&self.pool)
                .await?;
        Ok(columns)
    }

    pub async fn sensors(&self) -> Result<Vec<SensorRow>> {
        let _guard = self.lock().await;
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT sensor, last_seen_at FROM sensor ORDER BY sensor")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(sensor, last_seen_at)| SensorRow {
                sensor,
                last_seen_at,
            })
            .collect())
    }

    pub async fn raw_sensors(&self, quantity: Quantity) -> Result<Vec<String>> {
        let _guard = self.lock().await;
        let sensors: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT sensor FROM {} ORDER BY sensor",
            quantity.raw_table()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(sensors)
    }

    /// Values for one sensor in `[start, end)`, oldest first.
    pub async fn raw_values(
        &self,
        quantity: Quantity,
        sensor: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<RawPoint>> {
        let _guard = self.lock().await;
        let rows: Vec<(i64, f64)> = sqlx::query_as(&format!(
            r#"
            SELECT recorded_at, value
            FROM {}
            WHERE sensor = ?1 AND recorded_at >= ?2 AND recorded_at < ?3 AND value IS NOT NULL
            ORDER BY recorded_at ASC
            "#,
            quantity.raw_table()
        ))
        .bind(sensor)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(recorded_at, value)| RawPoint { recorded_at, value })
            .collect())
    }

    /// Every raw row in `[start, end)` as `(recorded_at, sensor, value)`.
    pub async fn raw_rows(
        &self,
        quantity: Quantity,
        start: i64,
        end: i64,
    ) -> Result<Vec<(i64, String, f64)>> {
        let _guard = self.lock().await;
        let rows: Vec<(i64, String, f64)> = sqlx::query_as(&format!(
            r#"
            SELECT recorded_at, sensor, value
            FROM {}
            WHERE recorded_at >= ?1 AND recorded_at < ?2 AND value IS NOT NULL
            ORDER BY recorded_at ASC, sensor ASC
            "#,
            quantity.raw_table()
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn raw_row_count(&self, quantity: Quantity) -> Result<i64> {
        let _guard = self.lock().await;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quantity.raw_table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn summary_exists(
        &self,
        quantity: Quantity,
        period: Period,
        starts_at: i64,
        sensor: &str,
    ) -> Result<bool> {
        let _guard = self.lock().await;
        let found: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT 1 FROM {} WHERE starts_at = ?1 AND sensor = ?2",
            period.summary_table(quantity)
        ))
        .bind(starts_at)
        .bind(sensor)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    pub async fn upsert_summary(
        &self,
        quantity: Quantity,
        period: Period,
        starts_at: i64,
        sensor: &str,
        stats: &SummaryStats,
    ) -> Result<()> {
        let _guard = self.lock().await;
        sqlx::query(&format!(
            r#"
            INSERT OR REPLACE INTO {}
                (starts_at, sensor, min_value, max_value, median_value, mean_value)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            period.summary_table(quantity)
        ))
        .bind(starts_at)
        .bind(sensor)
        .bind(stats.minimum)
        .bind(stats.maximum)
        .bind(stats.median)
        .bind(stats.mean)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Batch rollup rows in `[start, end)`, ordered by bucket then sensor.
    pub async fn summaries_in_range(
        &self,
        quantity: Quantity,
        period: Period,
        start: i64,
        end: i64,
    ) -> Result<Vec<SummaryRow>> {
        let _guard = self.lock().await;
        let rows: Vec<(i64, String, Option<f64>, Option<f64>, Option<f64>, Option<f64>)> =
            sqlx::query_as(&format!(
                r#"
                SELECT starts_at, sensor, min_value, max_value, median_value, mean_value
                FROM {}
                WHERE starts_at >= ?1 AND starts_at < ?2
                ORDER BY starts_at ASC, sensor ASC
                "#,
                period.summary_table(quantity)
            ))
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(summary_row).collect())
    }

    pub async fn upsert_collector_summary(
        &self,
        quantity: Quantity,
        granularity: CollectorPeriod,
        period_start_at: i64,
        sensor: &str,
        stats: &NullableStats,
    ) -> Result<()> {
        let _guard = self.lock().await;
        sqlx::query(&format!(
            r#"
            INSERT OR REPLACE INTO {}
                (period_start_at, sensor, minimum, maximum, median, mean)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            quantity.collector_table(granularity)
        ))
        .bind(period_start_at)
        .bind(sensor)
        .bind(stats.minimum)
        .bind(stats.maximum)
        .bind(stats.median)
        .bind(stats.mean)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn collector_summaries_in_range(
        &self,
        quantity: Quantity,
        granularity: CollectorPeriod,
        start: i64,
        end: i64,
    ) -> Result<Vec<SummaryRow>> {
        let _guard = self.lock().await;
        let rows: Vec<(i64, String, Option<f64>, Option<f64>, Option<f64>, Option<f64>)> =
            sqlx::query_as(&format!(
                r#"
                SELECT period_start_at, sensor, minimum, maximum, median, mean
                FROM {}
                WHERE period_start_at >= ?1 AND period_start_at < ?2
                ORDER BY period_start_at ASC, sensor ASC
                "#,
                quantity.collector_table(granularity)
            ))
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(summary_row).collect())
    }

    pub async fn drop_summary_tables(&self) -> Result<Vec<String>> {
        let _guard = self.lock().await;
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'summary\\_%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        for table in &tables {
            // Names come from sqlite_master and are quoted as identifiers.
            sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table.replace('"', "\"\"")))
                .execute(&self.pool)
                .await?;
        }
        Ok(tables)
    }
}

fn summary_row(
    (starts_at, sensor, minimum, maximum, median, mean): (
        i64,
        String,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<f64>,
    ),
) -> SummaryRow {
    SummaryRow {
        starts_at,
        sensor,
        stats: NullableStats {
            minimum,
            maximum,
            median,
            mean,
        },
    }
}
