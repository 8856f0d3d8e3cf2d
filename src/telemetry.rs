use crate::error::HubError;
use crate::quantity::Quantity;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub sensor_id: String,
    pub recorded_at: DateTime<Utc>,
    pub readings: Vec<(Quantity, f64)>,
}

impl DecodedMessage {
    pub fn value(&self, quantity: Quantity) -> Option<f64> {
        self.readings
            .iter()
            .find(|(q, _)| *q == quantity)
            .map(|(_, v)| *v)
    }
}

#[derive(Debug, Deserialize)]
struct WireReading {
    mac_address: Vec<u8>,
    #[serde(default)]
    temperature_as_millikelvins: Option<f64>,
    #[serde(default)]
    humidity_as_ppm: Option<f64>,
    #[serde(default)]
    pressure_as_pascals: Option<f64>,
    #[serde(default)]
    battery_potential_as_millivolts: Option<f64>,
}

/// Decodes one NDJSON line of the sensor gateway stream.
///
/// The wire format carries no timestamp, so `received_at` (truncated to whole
/// seconds) becomes the reading time. Quantity fields that are absent or zero
/// are skipped.
pub fn decode_line(line: &[u8], received_at: DateTime<Utc>) -> Result<DecodedMessage, HubError> {
    let mut bytes = line.to_vec();
    let wire: WireReading =
        simd_json::serde::from_slice(&mut bytes).map_err(|err| HubError::Decode(err.to_string()))?;

    if wire.mac_address.is_empty() {
        return Err(HubError::Decode("empty mac_address".to_string()));
    }

    let candidates = [
        (
            Quantity::Temperature,
            wire.temperature_as_millikelvins
                .map(|mk| mk / 1000.0 - 273.15),
            wire.temperature_as_millikelvins,
        ),
        (
            Quantity::Humidity,
            wire.humidity_as_ppm.map(|ppm| ppm / 10_000.0),
            wire.humidity_as_ppm,
        ),
        (
            Quantity::Pressure,
            wire.pressure_as_pascals.map(|pa| pa / 100.0),
            wire.pressure_as_pascals,
        ),
        (
            Quantity::Voltage,
            wire.battery_potential_as_millivolts.map(|mv| mv / 1000.0),
            wire.battery_potential_as_millivolts,
        ),
    ];

    let readings = candidates
        .into_iter()
        .filter_map(|(quantity, converted, raw)| match (converted, raw) {
            (Some(value), Some(raw)) if raw != 0.0 && value.is_finite() => Some((quantity, value)),
            _ => None,
        })
        .collect();

    Ok(DecodedMessage {
        sensor_id: format_mac(&wire.mac_address),
        recorded_at: received_at.trunc_subsecs(0),
        readings,
    })
}

pub fn format_mac(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
