use crate::db::Store;
use anyhow::Result;
use std::fmt;

const COLLECTOR_TABLES: [&str; 2] = ["hourly_temperature", "daily_temperature"];
const LEGACY_SUMMARY_TABLE: &str = "summary_temperature_3600";
const RAW_TABLE: &str = "measurement_temperature";

/// Known layouts of summary/raw store files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVariant {
    LegacySummary,
    IndividualValue,
    Aggregated,
    SummaryCollector,
    Unknown,
}

impl SchemaVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaVariant::LegacySummary => "legacy_summary",
            SchemaVariant::IndividualValue => "individual_value",
            SchemaVariant::Aggregated => "aggregated",
            SchemaVariant::SummaryCollector => "summary_collector",
            SchemaVariant::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SchemaVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a store from its metadata. Checks run in a fixed order and the
/// first match wins.
pub async fn detect(store: &Store) -> Result<SchemaVariant> {
    let tables = store.table_names().await?;
    let raw_columns = if tables.iter().any(|t| t == RAW_TABLE) {
        Some(store.table_columns(RAW_TABLE).await?)
    } else {
        None
    };
    Ok(classify(&tables, raw_columns.as_deref()))
}

pub fn classify(tables: &[String], raw_columns: Option<&[String]>) -> SchemaVariant {
    let has = |name: &str| tables.iter().any(|t| t == name);

    if COLLECTOR_TABLES.into_iter().any(|t| has(t)) {
        return SchemaVariant::SummaryCollector;
    }
    if has(LEGACY_SUMMARY_TABLE) {
        return SchemaVariant::LegacySummary;
    }
    if let Some(columns) = raw_columns {
        if columns.iter().any(|c| c == "value") {
            return SchemaVariant::IndividualValue;
        }
        if columns.iter().any(|c| c == "median") {
            return SchemaVariant::Aggregated;
        }
    }
    SchemaVariant::Unknown
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn classifies_each_known_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            ("legacy.db", LEGACY_SUMMARY, SchemaVariant::LegacySummary),
            ("individual.db", INDIVIDUAL_VALUE, SchemaVariant::IndividualValue),
            ("aggregated.db", AGGREGATED, SchemaVariant::Aggregated),
            ("collector.db", SUMMARY_COLLECTOR, SchemaVariant::SummaryCollector),
        ];
        for (name, statements, expected) in cases {
            let store = fixture(&dir.path().join(name), statements).await;
            assert_eq!(detect(&store).await.unwrap(), expected, "{name}");
        }
    }

    #[tokio::test]
    async fn empty_store_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixture(&dir.path().join("empty.db"), &["CREATE TABLE other (id INTEGER)"]).await;
        assert_eq!(detect(&store).await.unwrap(), SchemaVariant::Unknown);

        let bare = fixture(&dir.path().join("bare.db"), &[]).await;
        assert_eq!(detect(&bare).await.unwrap(), SchemaVariant::Unknown);
    }

    #[test]
    fn raw_table_without_known_columns_is_unknown() {
        let tables = vec!["measurement_temperature".to_string()];
        let columns = vec!["recorded_at".to_string(), "reading".to_string()];
        assert_eq!(classify(&tables, Some(columns.as_slice())), SchemaVariant::Unknown);
    }
}
