use crate::error::HubError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const HOUR_SECS: i64 = 3_600;
pub const DAY_SECS: i64 = 86_400;

const MAX_QUANTITY_NAME_LEN: usize = 20;

/// Physical quantity carried by a sensor reading.
///
/// Every table or column name that varies per quantity is derived from this
/// enum; externally supplied names reach SQL only after [`Quantity::parse_external`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Temperature,
    Humidity,
    Pressure,
    Voltage,
}

impl Quantity {
    pub const ALL: [Quantity; 4] = [
        Quantity::Temperature,
        Quantity::Humidity,
        Quantity::Pressure,
        Quantity::Voltage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
            Quantity::Pressure => "pressure",
            Quantity::Voltage => "voltage",
        }
    }

    /// Relative tolerance under which a new sample counts as a near-duplicate
    /// of the previous one.
    pub fn change_threshold(self) -> f64 {
        match self {
            Quantity::Temperature => 0.02,
            Quantity::Pressure => 0.03,
            Quantity::Humidity => 0.10,
            Quantity::Voltage => 0.05,
        }
    }

    /// Names the quantity carried in table names across store generations,
    /// current name first.
    pub fn table_names(self) -> &'static [&'static str] {
        match self {
            Quantity::Temperature => &["temperature"],
            Quantity::Humidity => &["humidity"],
            Quantity::Pressure => &["pressure"],
            Quantity::Voltage => &["voltage", "battery_voltage"],
        }
    }

    /// Raw per-reading table.
    pub fn raw_table(self) -> &'static str {
        match self {
            Quantity::Temperature => "measurement_temperature",
            Quantity::Humidity => "measurement_humidity",
            Quantity::Pressure => "measurement_pressure",
            Quantity::Voltage => "measurement_voltage",
        }
    }

    /// Collector/online rollup table for the given granularity.
    pub fn collector_table(self, granularity: CollectorPeriod) -> String {
        format!("{}_{}", granularity.as_str(), self.as_str())
    }

    /// Validates a name coming from outside the process (HTTP parameter,
    /// archive file) against the identifier allow-list before mapping it to a
    /// known quantity.
    pub fn parse_external(raw: &str) -> Result<Self, HubError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_QUANTITY_NAME_LEN
            && raw.bytes().all(|b| b.is_ascii_lowercase() || b == b'_');
        if !valid {
            return Err(HubError::UnknownQuantity(raw.to_string()));
        }
        raw.parse()
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quantity {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(Quantity::Temperature),
            "humidity" => Ok(Quantity::Humidity),
            "pressure" => Ok(Quantity::Pressure),
            // Older stores used the longer column name.
            "voltage" | "battery_voltage" => Ok(Quantity::Voltage),
            other => Err(HubError::UnknownQuantity(other.to_string())),
        }
    }
}

/// Bucket lengths the batch rollup engine maintains tables for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Hour,
    ThreeHours,
    TwelveHours,
    Day,
}

impl Period {
    pub const STANDARD: [Period; 4] = [
        Period::Hour,
        Period::ThreeHours,
        Period::TwelveHours,
        Period::Day,
    ];

    pub fn secs(self) -> i64 {
        match self {
            Period::Hour => HOUR_SECS,
            Period::ThreeHours => 3 * HOUR_SECS,
            Period::TwelveHours => 12 * HOUR_SECS,
            Period::Day => DAY_SECS,
        }
    }

    pub fn from_secs(secs: i64) -> Option<Self> {
        Period::STANDARD.into_iter().find(|p| p.secs() == secs)
    }

    pub fn summary_table(self, quantity: Quantity) -> String {
        format!("summary_{}_{}", quantity.as_str(), self.secs())
    }
}

/// Granularity of the collector-format summary tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorPeriod {
    Hourly,
    Daily,
}

impl CollectorPeriod {
    pub const ALL: [CollectorPeriod; 2] = [CollectorPeriod::Hourly, CollectorPeriod::Daily];

    pub fn as_str(self) -> &'static str {
        match self {
            CollectorPeriod::Hourly => "hourly",
            CollectorPeriod::Daily => "daily",
        }
    }

    pub fn secs(self) -> i64 {
        match self {
            CollectorPeriod::Hourly => HOUR_SECS,
            CollectorPeriod::Daily => DAY_SECS,
        }
    }
}

pub fn align_down(ts: i64, period_secs: i64) -> i64 {
    let period = period_secs.max(1);
    ts - ts.rem_euclid(period)
}

pub fn hour_start(ts: i64) -> i64 {
    align_down(ts, HOUR_SECS)
}

/// UTC day boundary: integer multiple of 86400 containing the instant.
pub fn day_start(ts: i64) -> i64 {
    ts.div_euclid(DAY_SECS) * DAY_SECS
}
