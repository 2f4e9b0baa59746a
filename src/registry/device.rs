// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::telemetry::{Decoded, DiscoveryConfig, Payload, PayloadKind, SensorReadings, StateReport};
use crate::topic::{ParsedEntry, command_base};
use crate::types::{
    DeviceId, FirmwareVersion, PowerIndex, PowerState, RULE_SET_COUNT, RuleSet, TIMER_COUNT,
    TimerConfig, TimezoneConfig,
};

/// LWT payload Tasmota uses when the device did not announce its own.
pub const DEFAULT_ONLINE_TOKEN: &str = "Online";

/// Offline counterpart of [`DEFAULT_ONLINE_TOKEN`].
pub const DEFAULT_OFFLINE_TOKEN: &str = "Offline";

/// Everything known about one device.
///
/// Fields start unknown and are filled in per subtopic: the discovery config
/// covers identity and firmware, `LWT` the reachability token, `STATE` relay
/// and Wi-Fi state, `SENSOR` the readings, and command results the settings.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::registry::DeviceSnapshot;
///
/// let mut device = DeviceSnapshot::new("plugA".into());
/// device.lwt = Some("Online".to_string());
/// assert!(device.is_online());
///
/// device.offline_token = Some("down".to_string());
/// device.lwt = Some("down".to_string());
/// assert!(!device.is_online());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Device topic.
    pub id: DeviceId,
    /// MAC address, upper case without separators.
    pub mac: Option<String>,
    /// `DeviceName`.
    pub device_name: Option<String>,
    /// First friendly name.
    pub friendly_name: Option<String>,
    /// Network host name.
    pub hostname: Option<String>,
    /// IP address.
    pub ip: Option<String>,
    /// Module or template name.
    pub model: Option<String>,
    /// Last LWT token.
    pub lwt: Option<String>,
    /// LWT token the device announces when online.
    pub online_token: Option<String>,
    /// LWT token the device announces when offline.
    pub offline_token: Option<String>,
    /// Last STATE report.
    pub state: Option<StateReport>,
    /// A STATE message after the last LWT carried the offline token.
    #[serde(default)]
    pub state_offline: bool,
    /// Installed firmware version string.
    pub firmware: Option<String>,
    /// Firmware upgrade URL.
    pub ota_url: Option<String>,
    /// Location and local time settings.
    #[serde(default)]
    pub timezone: TimezoneConfig,
    /// Timers by number (1-4).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub timers: BTreeMap<u8, TimerConfig>,
    /// Rule sets by number (1-3).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rules: BTreeMap<u8, RuleSet>,
    /// Telemetry period in seconds.
    pub tele_period: Option<u32>,
    /// `PowerDelta1` threshold.
    pub power_delta: Option<u32>,
    /// `SetOption4`: results published on `stat/<topic>/<CMD>` instead of
    /// `RESULT`.
    pub set_option4: Option<bool>,
    /// Topic prefixes announced in discovery (`cmnd`, `stat`, `tele`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topic_prefixes: Vec<String>,
    /// Sensor readings by sensor name.
    #[serde(default)]
    pub sensors: SensorReadings,
    /// Receive time of the newest message applied.
    pub last_seen: Option<DateTime<Utc>>,
    /// Only MAC-addressed discovery data is known; the id is the MAC, not a
    /// device topic.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub topic_unresolved: bool,
    /// Fields whose last payload could not be decoded.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub degraded: BTreeSet<String>,
}

impl DeviceSnapshot {
    /// Creates a snapshot where every field is unknown.
    #[must_use]
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            mac: None,
            device_name: None,
            friendly_name: None,
            hostname: None,
            ip: None,
            model: None,
            lwt: None,
            online_token: None,
            offline_token: None,
            state: None,
            state_offline: false,
            firmware: None,
            ota_url: None,
            timezone: TimezoneConfig::default(),
            timers: BTreeMap::new(),
            rules: BTreeMap::new(),
            tele_period: None,
            power_delta: None,
            set_option4: None,
            topic_prefixes: Vec::new(),
            sensors: SensorReadings::new(),
            last_seen: None,
            topic_unresolved: false,
            degraded: BTreeSet::new(),
        }
    }

    /// Device name, friendly name or topic, whichever is known first.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.device_name
            .as_deref()
            .or(self.friendly_name.as_deref())
            .unwrap_or(self.id.as_str())
    }

    /// The device's online token, or Tasmota's default.
    #[must_use]
    pub fn online_token(&self) -> &str {
        self.online_token.as_deref().unwrap_or(DEFAULT_ONLINE_TOKEN)
    }

    /// The device's offline token, or Tasmota's default.
    #[must_use]
    pub fn offline_token(&self) -> &str {
        self.offline_token.as_deref().unwrap_or(DEFAULT_OFFLINE_TOKEN)
    }

    /// Online iff the last LWT equals the online token and no STATE has
    /// since reported shutdown.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.lwt.as_deref() == Some(self.online_token()) && !self.state_offline
    }

    /// True if the device itself announced going offline: its last LWT is
    /// the offline token, or a later STATE reported shutdown. A device with
    /// no LWT at all is unknown, not offline.
    #[must_use]
    pub fn reports_offline(&self) -> bool {
        self.state_offline || self.lwt.as_deref() == Some(self.offline_token())
    }

    /// Fills settings a discovery pass cannot see from an earlier snapshot
    /// of the same device. Values already present win.
    pub fn carry_settings(&mut self, previous: &DeviceSnapshot) {
        let timezone = &mut self.timezone;
        timezone.timezone = timezone.timezone.or(previous.timezone.timezone);
        timezone.latitude = timezone.latitude.or(previous.timezone.latitude);
        timezone.longitude = timezone.longitude.or(previous.timezone.longitude);
        timezone.dst = timezone.dst.or(previous.timezone.dst);
        timezone.std = timezone.std.or(previous.timezone.std);
        if self.timers.is_empty() {
            self.timers.clone_from(&previous.timers);
        }
        if self.rules.is_empty() {
            self.rules.clone_from(&previous.rules);
        }
        self.tele_period = self.tele_period.or(previous.tele_period);
        self.power_delta = self.power_delta.or(previous.power_delta);
        self.set_option4 = self.set_option4.or(previous.set_option4);
        if self.ota_url.is_none() {
            self.ota_url.clone_from(&previous.ota_url);
        }
    }

    /// Parsed firmware version, if the version string is usable.
    #[must_use]
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.firmware.as_deref()?.parse().ok()
    }

    /// Relay state, if a STATE report or command result provided it.
    #[must_use]
    pub fn power(&self, index: PowerIndex) -> Option<PowerState> {
        self.state.as_ref()?.power.get(&index).copied()
    }

    /// Merges one parsed entry. Only the fields covered by the entry's
    /// subtopic change.
    pub fn apply(&mut self, entry: &ParsedEntry) {
        if self.last_seen.is_none_or(|seen| seen < entry.received_at) {
            self.last_seen = Some(entry.received_at);
        }

        let field = field_name(&entry.kind);
        match &entry.decoded {
            Decoded::Known(payload) => {
                self.degraded.remove(&field);
                self.apply_payload(&entry.kind, payload);
            }
            Decoded::Unknown { reason } => {
                if entry.kind == PayloadKind::State && entry.raw.trim() == self.offline_token() {
                    tracing::debug!(device = %self.id, "STATE reports shutdown");
                    self.state_offline = true;
                    return;
                }
                tracing::debug!(device = %self.id, field = %field, %reason, "Field degraded");
                self.degraded.insert(field);
            }
        }
    }

    fn apply_payload(&mut self, kind: &PayloadKind, payload: &Payload) {
        match payload {
            Payload::Lwt(token) => {
                self.lwt = Some(token.clone());
                self.state_offline = false;
            }
            Payload::State(report) => {
                self.state = Some(report.clone());
                self.state_offline = false;
            }
            Payload::Sensor(readings) | Payload::DiscoverySensors(readings) => {
                self.sensors
                    .extend(readings.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Payload::DiscoveryConfig(config) => self.apply_discovery(config),
            Payload::Result(map) => {
                for (key, value) in map {
                    self.apply_result(key, value);
                }
            }
            Payload::Text(text) => {
                if let PayloadKind::Response(command) = kind {
                    self.apply_result(command, &Value::String(text.clone()));
                }
            }
        }
    }

    /// Takes over every field a discovery config announces.
    pub fn apply_discovery(&mut self, config: &DiscoveryConfig) {
        macro_rules! take {
            ($field:ident, $value:expr) => {
                if let Some(v) = $value {
                    self.$field = Some(v.clone());
                }
            };
        }

        if let Some(mac) = config.mac_key() {
            self.mac = Some(mac);
        }
        take!(device_name, &config.device_name);
        take!(hostname, &config.hostname);
        take!(ip, &config.ip);
        take!(model, &config.model);
        take!(online_token, &config.online_token);
        take!(offline_token, &config.offline_token);
        take!(firmware, &config.software_version);
        take!(ota_url, &config.ota_url);
        if let Some(name) = config.friendly_name() {
            self.friendly_name = Some(name.to_string());
        }
        if !config.topic_prefixes.is_empty() {
            self.topic_prefixes.clone_from(&config.topic_prefixes);
        }
        self.degraded.retain(|field| !field.starts_with("discovery."));
        for key in &config.invalid_fields {
            tracing::debug!(device = %self.id, key = %key, "Discovery field degraded");
            self.degraded.insert(format!("discovery.{key}"));
        }
    }

    /// Merges one key of a command result such as `{"TelePeriod":300}`.
    ///
    /// Returns true if the key is a setting tracked in the snapshot. A known
    /// key with an unusable value marks that field degraded.
    pub fn apply_result(&mut self, key: &str, value: &Value) -> bool {
        let lower = key.to_ascii_lowercase();
        let applied = match self.try_apply_result(&lower, value) {
            Ok(applied) => applied,
            Err(message) => {
                tracing::warn!(device = %self.id, key, %value, %message, "Unusable result value");
                self.degraded.insert(lower);
                return false;
            }
        };
        if applied {
            self.degraded.remove(&lower);
        }
        applied
    }

    fn try_apply_result(&mut self, key: &str, value: &Value) -> Result<bool, String> {
        if self
            .timezone
            .apply_field(key, value)
            .map_err(|e| e.to_string())?
        {
            return Ok(true);
        }

        match key {
            "teleperiod" => self.tele_period = Some(as_u32(value)?),
            "otaurl" => self.ota_url = Some(as_text(value)?),
            "powerdelta" | "powerdelta1" => self.power_delta = Some(as_u32(value)?),
            "setoption4" => self.set_option4 = Some(as_on_off(value)?),
            _ => return self.apply_indexed_result(key, value),
        }
        Ok(true)
    }

    fn apply_indexed_result(&mut self, key: &str, value: &Value) -> Result<bool, String> {
        let base = command_base(key);
        let index = &key[base.len()..];

        match base {
            "timer" => {
                let n = parse_index(index, TIMER_COUNT)?;
                let timer = TimerConfig::deserialize(value).map_err(|e| e.to_string())?;
                timer.validate().map_err(|e| e.to_string())?;
                self.timers.insert(n, timer);
            }
            "rule" => {
                let n = parse_index(index, RULE_SET_COUNT)?;
                let rule = RuleSet::deserialize(value).map_err(|e| e.to_string())?;
                self.rules.insert(n, rule);
            }
            "power" => {
                let Some(index) = PowerIndex::from_field(&key.to_ascii_uppercase()) else {
                    return Err(format!("invalid relay `{key}`"));
                };
                let state = as_text(value)?
                    .parse::<PowerState>()
                    .map_err(|e| e.to_string())?;
                self.state
                    .get_or_insert_with(StateReport::default)
                    .power
                    .insert(index, state);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn field_name(kind: &PayloadKind) -> String {
    match kind {
        PayloadKind::Lwt => "lwt".to_string(),
        PayloadKind::State => "state".to_string(),
        PayloadKind::Sensor => "sensors".to_string(),
        PayloadKind::DiscoveryConfig => "discovery".to_string(),
        PayloadKind::DiscoverySensors => "discovery_sensors".to_string(),
        PayloadKind::Result => "result".to_string(),
        PayloadKind::Response(command) => command.to_ascii_lowercase(),
    }
}

fn parse_index(index: &str, max: u8) -> Result<u8, String> {
    match index.parse::<u8>() {
        Ok(n) if (1..=max).contains(&n) => Ok(n),
        _ => Err(format!("index `{index}` outside 1..={max}")),
    }
}

fn as_u32(value: &Value) -> Result<u32, String> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("expected an unsigned number, got {value}"))
}

fn as_text(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(format!("expected text, got {other}")),
    }
}

fn as_on_off(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(false),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("on") || s == "1" => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("off") || s == "0" => Ok(false),
        other => Err(format!("expected ON or OFF, got {other}")),
    }
}
