use super::daily::DailyStats;
use crate::quantity::Quantity;
use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};
use std::path::Path;

pub const TSV_COMMENT: &str =
    "# Historical daily summaries - timestamps are Unix epochs (start of day UTC)";
pub const TSV_HEADER: &str = "timestamp\tsensor\tmeasurement_type\tmin\tmax\tmedian";

/// Orders by day, then sensor, then measurement type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DailyKey {
    pub day_start: i64,
    pub sensor: String,
    pub quantity: Quantity,
}

impl Ord for DailyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.day_start
            .cmp(&other.day_start)
            .then_with(|| self.sensor.cmp(&other.sensor))
            .then_with(|| self.quantity.as_str().cmp(other.quantity.as_str()))
    }
}

impl PartialOrd for DailyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Canonical merged daily history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalArchive {
    entries: BTreeMap<DailyKey, DailyStats>,
}

impl HistoricalArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts every entry, replacing whole entries already present.
    pub fn absorb(&mut self, entries: impl IntoIterator<Item = (DailyKey, DailyStats)>) {
        for (key, stats) in entries {
            self.entries.insert(key, stats);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &DailyKey) -> Option<&DailyStats> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DailyKey, &DailyStats)> {
        self.entries.iter()
    }

    /// Entries of `quantity` whose day lies in `[start, end)`.
    pub fn days_in_range(
        &self,
        quantity: Quantity,
        start: i64,
        end: i64,
    ) -> impl Iterator<Item = (&DailyKey, &DailyStats)> {
        self.entries.iter().filter(move |(key, _)| {
            key.quantity == quantity && key.day_start >= start && key.day_start < end
        })
    }

    pub fn sensors(&self) -> BTreeSet<&str> {
        self.entries.keys().map(|key| key.sensor.as_str()).collect()
    }

    pub fn day_range(&self) -> Option<(i64, i64)> {
        let first = self.entries.keys().map(|key| key.day_start).min()?;
        let last = self.entries.keys().map(|key| key.day_start).max()?;
        Some((first, last))
    }

    pub fn write_tsv<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        writeln!(out, "{TSV_COMMENT}")?;
        writeln!(out, "{TSV_HEADER}")?;
        for (key, stats) in &self.entries {
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}",
                key.day_start,
                key.sensor,
                key.quantity,
                format_value(stats.min),
                format_value(stats.max),
                format_value(stats.median)
            )?;
        }
        out.flush()
    }

    pub fn read_tsv<R: BufRead>(input: R) -> Result<Self> {
        let mut archive = Self::new();
        let mut skipped = 0usize;
        for (idx, line) in input.lines().enumerate() {
            let line = line.with_context(|| format!("failed to read archive line {}", idx + 1))?;
            let trimmed = line.trim_end_matches('\r');
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed == TSV_HEADER {
                continue;
            }
            match parse_row(trimmed) {
                Some((key, stats)) => {
                    archive.entries.insert(key, stats);
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(skipped, "skipped malformed archive rows");
        }
        Ok(archive)
    }

    /// Loads a TSV archive. A missing file gives an empty archive.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "historical archive not found; serving live data only");
            return Ok(Self::new());
        }
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open archive {}", path.display()))?;
        let archive = Self::read_tsv(std::io::BufReader::new(file))?;
        tracing::info!(path = %path.display(), rows = archive.len(), "loaded historical archive");
        Ok(archive)
    }
}

fn parse_row(line: &str) -> Option<(DailyKey, DailyStats)> {
    let mut fields = line.split('\t');
    let day_start = fields.next()?.trim().parse::<i64>().ok()?;
    let sensor = fields.next()?.trim().to_string();
    let quantity = Quantity::parse_external(fields.next()?.trim()).ok()?;
    let mut number = || fields.next()?.trim().parse::<f64>().ok();
    let stats = DailyStats {
        min: number()?,
        max: number()?,
        median: number()?,
    };
    if sensor.is_empty() {
        return None;
    }
    Some((
        DailyKey {
            day_start,
            sensor,
            quantity,
        },
        stats,
    ))
}

/// Float rendering of the archive format: integral values keep a `.0`.
pub fn format_value(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(day_start: i64, sensor: &str, quantity: Quantity) -> DailyKey {
        DailyKey {
            day_start,
            sensor: sensor.to_string(),
            quantity,
        }
    }

    fn stats(min: f64, max: f64, median: f64) -> DailyStats {
        DailyStats { min, max, median }
    }

    #[test]
    fn writes_sorted_rows_after_the_header() {
        let mut archive = HistoricalArchive::new();
        archive.absorb([
            (key(86_400, "A", Quantity::Temperature), stats(1.0, 2.5, 2.0)),
            (key(0, "B", Quantity::Temperature), stats(-3.25, 4.0, 0.5)),
            (key(0, "B", Quantity::Humidity), stats(40.0, 41.0, 40.5)),
        ]);

        let mut out = Vec::new();
        archive.write_tsv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], TSV_COMMENT);
        assert_eq!(lines[1], TSV_HEADER);
        assert_eq!(lines[2], "0\tB\thumidity\t40.0\t41.0\t40.5");
        assert_eq!(lines[3], "0\tB\ttemperature\t-3.25\t4.0\t0.5");
        assert_eq!(lines[4], "86400\tA\ttemperature\t1.0\t2.5\t2.0");
    }

    #[test]
    fn reads_back_what_it_writes_and_skips_garbage() {
        let input = format!(
            "{TSV_COMMENT}\n{TSV_HEADER}\n0\tA\ttemperature\t1.0\t2.0\t1.5\nnot a row\n86400\tA\tbogus\t1\t2\t3\n86400\tA\tbattery_voltage\t2.9\t3.0\t2.95\n"
        );
        let archive = HistoricalArchive::read_tsv(input.as_bytes()).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(
            archive.get(&key(0, "A", Quantity::Temperature)),
            Some(&stats(1.0, 2.0, 1.5))
        );
        assert_eq!(
            archive.get(&key(86_400, "A", Quantity::Voltage)).map(|s| s.median),
            Some(2.95)
        );
        assert_eq!(archive.day_range(), Some((0, 86_400)));
    }

    #[test]
    fn missing_archive_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let archive = HistoricalArchive::load(&dir.path().join("none.tsv")).unwrap();
        assert!(archive.is_empty());
    }

    #[test]
    fn formats_floats_like_the_archive_format() {
        assert_eq!(format_value(21.0), "21.0");
        assert_eq!(format_value(21.46), "21.46");
        assert_eq!(format_value(-0.5), "-0.5");
    }
}
