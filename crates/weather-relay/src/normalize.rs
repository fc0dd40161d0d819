//! Unit-normalizing transform from a provider snapshot to the outbound event.
//!
//! Pressure is converted from hPa to Pa and humidity from percent to a
//! 0..1 fraction so consumers can compute air density directly.

use chrono::{DateTime, Utc};

use crate::error::NormalizeError;
use crate::model::{
    CurrentConditions, ForecastPoint, NormalizedEvent, ProviderMain, RawSnapshot,
};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Normalize `snapshot` for `city`, stamping the event with `processed_at`.
pub fn normalize(
    city: &str,
    snapshot: &RawSnapshot,
    processed_at: DateTime<Utc>,
) -> Result<NormalizedEvent, NormalizeError> {
    let current = &snapshot.current;
    let (temp, pressure, humidity) = convert_units(&current.main);
    let observed = utc_from_unix(current.dt)?;

    let forecast = snapshot
        .forecast
        .list
        .iter()
        .map(|entry| {
            let (temp, pressure, humidity) = convert_units(&entry.main);
            Ok(ForecastPoint {
                wind: entry.wind.clone(),
                temp,
                pressure,
                humidity,
                dt: utc_from_unix(entry.dt)?.format(DATETIME_FORMAT).to_string(),
            })
        })
        .collect::<Result<Vec<_>, NormalizeError>>()?;

    Ok(NormalizedEvent {
        timestamp: processed_at.format(DATETIME_FORMAT).to_string(),
        city: city.to_string(),
        current: CurrentConditions {
            wind: current.wind.clone(),
            temp,
            pressure,
            humidity,
            date: observed.format(DATE_FORMAT).to_string(),
        },
        forecast,
    })
}

/// [`normalize`] stamped with the current wall clock.
pub fn normalize_now(city: &str, snapshot: &RawSnapshot) -> Result<NormalizedEvent, NormalizeError> {
    normalize(city, snapshot, Utc::now())
}

/// (°C, Pa, fraction)
fn convert_units(main: &ProviderMain) -> (f64, f64, f64) {
    (main.temp, main.pressure * 100.0, main.humidity / 100.0)
}

fn utc_from_unix(ts: i64) -> Result<DateTime<Utc>, NormalizeError> {
    DateTime::from_timestamp(ts, 0).ok_or(NormalizeError::Timestamp(ts))
}
