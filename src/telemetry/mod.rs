// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload decoding for Tasmota MQTT messages.
//!
//! Each device subtopic carries a differently shaped payload:
//!
//! - `tele/<topic>/LWT` - plain token (`Online` / `Offline`)
//! - `tele/<topic>/STATE` - relay states, uptime, Wi-Fi
//! - `tele/<topic>/SENSOR` - sensor readings
//! - `tasmota/discovery/<MAC>/config` - identity and firmware
//! - `tasmota/discovery/<MAC>/sensors` - announced sensor readings
//! - `stat/<topic>/RESULT` and `stat/<topic>/<CMD>` - command results
//!
//! [`decode`] dispatches on the [`PayloadKind`] and never fails: a malformed
//! payload yields [`Decoded::Unknown`] so the caller can degrade that one
//! field and carry on.
//!
//! # Examples
//!
//! ```
//! use tasmota_fleet::telemetry::{Decoded, Payload, PayloadKind, decode};
//!
//! let decoded = decode(&PayloadKind::State, br#"{"POWER":"ON"}"#);
//! assert!(matches!(decoded, Decoded::Known(Payload::State(_))));
//!
//! let decoded = decode(&PayloadKind::State, b"{not json");
//! assert!(matches!(decoded, Decoded::Unknown { .. }));
//! ```

mod discovery_parser;
mod sensor_parser;
mod state_parser;

pub use discovery_parser::{DiscoveryConfig, DiscoverySensors, normalize_mac};
pub use sensor_parser::SensorReadings;
pub use state_parser::{StateReport, TelemetryState, WifiInfo};

use crate::error::ParseError;

/// The payload shape expected on a subtopic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// `tele/<topic>/LWT`.
    Lwt,
    /// `tele/<topic>/STATE`.
    State,
    /// `tele/<topic>/SENSOR`.
    Sensor,
    /// `tasmota/discovery/<MAC>/config`.
    DiscoveryConfig,
    /// `tasmota/discovery/<MAC>/sensors`.
    DiscoverySensors,
    /// `stat/<topic>/RESULT`.
    Result,
    /// `stat/<topic>/<CMD>` for any other command name.
    Response(String),
}

/// A successfully decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// LWT token, trimmed.
    Lwt(String),
    /// STATE report.
    State(StateReport),
    /// SENSOR readings.
    Sensor(SensorReadings),
    /// Discovery configuration.
    DiscoveryConfig(Box<DiscoveryConfig>),
    /// Discovery sensor announcement.
    DiscoverySensors(SensorReadings),
    /// A JSON object result such as `{"POWER":"ON"}`.
    Result(serde_json::Map<String, serde_json::Value>),
    /// A non-JSON result such as a bare `ON`.
    Text(String),
}

/// Outcome of decoding one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The payload was understood.
    Known(Payload),
    /// The payload was malformed; the field it covers is unknown.
    Unknown {
        /// Why decoding failed.
        reason: String,
    },
}

impl Decoded {
    /// Returns the payload if it was understood.
    #[must_use]
    pub fn known(&self) -> Option<&Payload> {
        match self {
            Self::Known(payload) => Some(payload),
            Self::Unknown { .. } => None,
        }
    }
}

/// Decodes a payload according to its subtopic kind.
#[must_use]
pub fn decode(kind: &PayloadKind, payload: &[u8]) -> Decoded {
    match try_decode(kind, payload) {
        Ok(payload) => Decoded::Known(payload),
        Err(e) => Decoded::Unknown {
            reason: e.to_string(),
        },
    }
}

fn try_decode(kind: &PayloadKind, payload: &[u8]) -> Result<Payload, ParseError> {
    let text = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;

    Ok(match kind {
        PayloadKind::Lwt => {
            let token = text.trim();
            if token.is_empty() {
                return Err(ParseError::MissingField("LWT token".to_string()));
            }
            Payload::Lwt(token.to_string())
        }
        PayloadKind::State => Payload::State(state_parser::parse_state(text)?.to_report()),
        PayloadKind::Sensor => Payload::Sensor(sensor_parser::parse_sensor(text)?),
        PayloadKind::DiscoveryConfig => {
            Payload::DiscoveryConfig(Box::new(discovery_parser::parse_discovery_config(text)?))
        }
        PayloadKind::DiscoverySensors => Payload::DiscoverySensors(sensor_parser::strip_time(
            discovery_parser::parse_discovery_sensors(text)?.sn,
        )),
        PayloadKind::Result | PayloadKind::Response(_) => decode_result(text),
    })
}

/// Command results are JSON objects when `SetOption4`/`RESULT` reporting is
/// used, but some commands answer with a bare value on `stat/<topic>/<CMD>`.
fn decode_result(text: &str) -> Payload {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => Payload::Result(map),
        _ => Payload::Text(text.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_lwt() {
        assert_eq!(
            decode(&PayloadKind::Lwt, b"Online\n"),
            Decoded::Known(Payload::Lwt("Online".to_string()))
        );
    }

    #[test]
    fn empty_lwt_is_unknown() {
        assert!(matches!(
            decode(&PayloadKind::Lwt, b"  "),
            Decoded::Unknown { .. }
        ));
    }

    #[test]
    fn binary_payload_is_unknown() {
        let decoded = decode(&PayloadKind::State, &[0xff, 0x00]);
        let Decoded::Unknown { reason } = decoded else {
            panic!("expected unknown");
        };
        assert!(reason.contains("UTF-8"));
    }

    #[test]
    fn discovery_config_without_fields() {
        let decoded = decode(&PayloadKind::DiscoveryConfig, b"{}");
        assert!(matches!(
            decoded.known(),
            Some(Payload::DiscoveryConfig(c)) if c.ota_url.is_none()
        ));
    }

    #[test]
    fn discovery_sensors_drop_time() {
        let decoded = decode(
            &PayloadKind::DiscoverySensors,
            br#"{"sn":{"Time":"2024-07-04T13:09:25","ANALOG":{"A0":169}},"ver":1}"#,
        );
        let Some(Payload::DiscoverySensors(readings)) = decoded.known() else {
            panic!("expected sensors");
        };
        assert_eq!(readings.len(), 1);
        assert!(readings.contains_key("ANALOG"));
    }

    #[test]
    fn result_object_and_bare_value() {
        assert!(matches!(
            decode(&PayloadKind::Result, br#"{"POWER":"ON"}"#),
            Decoded::Known(Payload::Result(_))
        ));
        assert_eq!(
            decode(&PayloadKind::Response("POWER".to_string()), b"ON"),
            Decoded::Known(Payload::Text("ON".to_string()))
        );
    }
}
