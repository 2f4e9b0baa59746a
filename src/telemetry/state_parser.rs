// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parser for Tasmota STATE telemetry messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::types::{PowerIndex, PowerState};

/// Parsed payload of a `tele/<topic>/STATE` message.
///
/// Relay states arrive as `POWER` (single relay) or `POWER1`..`POWER8`;
/// they are collected from the remaining fields so any relay count works.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::telemetry::TelemetryState;
/// use tasmota_fleet::types::PowerState;
///
/// let json = r#"{"POWER1":"ON","POWER2":"OFF","UptimeSec":3600}"#;
/// let state: TelemetryState = serde_json::from_str(json).unwrap();
///
/// assert_eq!(state.power(), Some(PowerState::On));
/// assert_eq!(state.uptime_seconds(), Some(3600));
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryState {
    /// Device local time of the report.
    #[serde(rename = "Time", default)]
    time: Option<String>,

    /// Device uptime as string (e.g., "17T04:02:54").
    #[serde(rename = "Uptime", default)]
    uptime: Option<String>,

    /// Device uptime in seconds.
    #[serde(rename = "UptimeSec", default)]
    uptime_sec: Option<u64>,

    /// MQTT reconnect counter.
    #[serde(rename = "MqttCount", default)]
    mqtt_count: Option<u32>,

    /// Wi-Fi information.
    #[serde(rename = "Wifi", default)]
    wifi: Option<WifiInfo>,

    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

/// Wi-Fi connection information from telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiInfo {
    /// SSID of the connected network.
    #[serde(rename = "SSId", default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,

    /// RSSI (signal strength percentage, 0-100).
    #[serde(rename = "RSSI", default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,

    /// Signal strength in dBm.
    #[serde(rename = "Signal", default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,

    /// Wi-Fi channel.
    #[serde(rename = "Channel", default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,

    /// Number of reconnections.
    #[serde(rename = "LinkCount", default, skip_serializing_if = "Option::is_none")]
    pub link_count: Option<u32>,
}

impl TelemetryState {
    /// Returns the power state for the first relay.
    #[must_use]
    pub fn power(&self) -> Option<PowerState> {
        self.power_states().get(&PowerIndex::first()).copied()
    }

    /// Returns every relay state that parsed.
    ///
    /// A bare `POWER` field counts as relay 1 unless `POWER1` is present.
    #[must_use]
    pub fn power_states(&self) -> BTreeMap<PowerIndex, PowerState> {
        let mut states = BTreeMap::new();
        for (field, value) in &self.rest {
            let Some(index) = PowerIndex::from_field(field) else {
                continue;
            };
            let Some(state) = value.as_str().and_then(|s| s.parse().ok()) else {
                continue;
            };
            if field == "POWER" && states.contains_key(&index) {
                continue;
            }
            states.insert(index, state);
        }
        states
    }

    /// Returns the device uptime string.
    #[must_use]
    pub fn uptime(&self) -> Option<&str> {
        self.uptime.as_deref()
    }

    /// Returns the device uptime in seconds.
    #[must_use]
    pub fn uptime_seconds(&self) -> Option<u64> {
        self.uptime_sec
    }

    /// Returns the Wi-Fi information.
    #[must_use]
    pub fn wifi(&self) -> Option<&WifiInfo> {
        self.wifi.as_ref()
    }

    /// Converts the payload into the form stored in device snapshots.
    #[must_use]
    pub fn to_report(&self) -> StateReport {
        StateReport {
            power: self.power_states(),
            time: self.time.clone(),
            uptime: self.uptime.clone(),
            uptime_sec: self.uptime_sec,
            mqtt_count: self.mqtt_count,
            wifi: self.wifi.clone(),
        }
    }
}

/// The last STATE report of a device, as kept in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateReport {
    /// Relay states by relay number.
    pub power: BTreeMap<PowerIndex, PowerState>,
    /// Device local time of the report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Uptime string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    /// Uptime in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_sec: Option<u64>,
    /// MQTT reconnect counter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_count: Option<u32>,
    /// Wi-Fi details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi: Option<WifiInfo>,
}

/// Parses a STATE telemetry JSON payload.
pub(crate) fn parse_state(payload: &str) -> Result<TelemetryState, ParseError> {
    serde_json::from_str(payload).map_err(ParseError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_power_state() {
        let state = parse_state(r#"{"POWER":"ON"}"#).unwrap();
        assert_eq!(state.power(), Some(PowerState::On));
    }

    #[test]
    fn parse_multiple_relays() {
        let state = parse_state(r#"{"POWER1":"ON","POWER2":"OFF","POWER3":"ON"}"#).unwrap();

        let all = state.power_states();
        assert_eq!(all.len(), 3);
        assert_eq!(all[&PowerIndex::new(2).unwrap()], PowerState::Off);
    }

    #[test]
    fn power1_wins_over_bare_power() {
        let state = parse_state(r#"{"POWER":"OFF","POWER1":"ON"}"#).unwrap();
        assert_eq!(state.power(), Some(PowerState::On));
    }

    #[test]
    fn unparsable_relay_value_is_skipped() {
        let state = parse_state(r#"{"POWER":"MAYBE","POWER2":"ON"}"#).unwrap();
        assert_eq!(state.power(), None);
        assert_eq!(state.power_states().len(), 1);
    }

    #[test]
    fn parse_full_tasmota_state() {
        let json = r#"{
            "Time": "2024-07-04T13:09:25",
            "Uptime": "17T04:02:54",
            "UptimeSec": 1483374,
            "Heap": 25,
            "SleepMode": "Dynamic",
            "MqttCount": 3,
            "POWER": "ON",
            "Wifi": {"AP":1,"SSId":"MyNetwork","RSSI":80,"Signal":-60,"Channel":6,"LinkCount":5}
        }"#;
        let report = parse_state(json).unwrap().to_report();

        assert_eq!(report.power[&PowerIndex::first()], PowerState::On);
        assert_eq!(report.uptime_sec, Some(1_483_374));
        assert_eq!(report.mqtt_count, Some(3));
        let wifi = report.wifi.unwrap();
        assert_eq!(wifi.ssid.as_deref(), Some("MyNetwork"));
        assert_eq!(wifi.signal, Some(-60));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(matches!(parse_state("Offline"), Err(ParseError::Json(_))));
    }

    #[test]
    fn report_serializes_relays_by_number() {
        let report = parse_state(r#"{"POWER2":"ON"}"#).unwrap().to_report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["power"]["2"], "ON");

        let back: StateReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
