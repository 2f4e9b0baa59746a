// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parser for Tasmota SENSOR telemetry messages.

use std::collections::BTreeMap;

use crate::error::ParseError;

/// Sensor readings keyed by sensor name, e.g. `ENERGY`, `SHT3X`, `DS18B20`.
///
/// The set of sensors depends on the firmware build and attached hardware,
/// so readings are kept as open JSON values.
pub type SensorReadings = BTreeMap<String, serde_json::Value>;

/// Field carrying the device local time in sensor payloads.
const TIME_FIELD: &str = "Time";

/// Parses a `tele/<topic>/SENSOR` payload.
///
/// The `Time` field is dropped; it is the device's clock, not a reading.
///
/// # Errors
///
/// Returns `ParseError` if the payload is not a JSON object.
pub(crate) fn parse_sensor(payload: &str) -> Result<SensorReadings, ParseError> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    let serde_json::Value::Object(map) = value else {
        return Err(ParseError::UnexpectedFormat(
            "SENSOR payload is not a JSON object".to_string(),
        ));
    };
    Ok(map
        .into_iter()
        .filter(|(name, _)| name != TIME_FIELD)
        .collect())
}

/// Drops the `Time` field from a discovery sensor announcement.
pub(crate) fn strip_time(mut readings: SensorReadings) -> SensorReadings {
    readings.remove(TIME_FIELD);
    readings
}
