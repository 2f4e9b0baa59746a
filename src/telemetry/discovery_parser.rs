// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsers for `tasmota/discovery/<MAC>/config` and `.../sensors`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;

/// Discovery configuration a device publishes retained on boot.
///
/// Every field is optional; older firmware and hand-edited retained messages
/// regularly lack some of them. Short Tasmota keys are accepted on input and
/// descriptive names are used on output, so persisted snapshots stay readable
/// and still load back. A field with a value of the wrong type is dropped and
/// listed in [`invalid_fields`](Self::invalid_fields); the rest still parse.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::telemetry::DiscoveryConfig;
///
/// let json = r#"{"ip":"10.0.0.7","dn":"Plug A","fn":["Kitchen",null],"mac":"A4CF12B3C4D5","t":"plugA","sw":"13.1.0"}"#;
/// let config: DiscoveryConfig = serde_json::from_str(json).unwrap();
///
/// assert_eq!(config.topic.as_deref(), Some("plugA"));
/// assert_eq!(config.friendly_name(), Some("Kitchen"));
/// assert_eq!(config.mac_colon().as_deref(), Some("A4:CF:12:B3:C4:D5"));
/// assert!(config.ota_url.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// IP address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Device name (`DeviceName`).
    #[serde(alias = "dn", skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Friendly names per relay (`FriendlyName1..`).
    #[serde(alias = "fn", skip_serializing_if = "Vec::is_empty")]
    pub friendly_names: Vec<Option<String>>,
    /// Network host name.
    #[serde(alias = "hn", skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// MAC address without separators, as announced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Module or template name.
    #[serde(alias = "md", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// LWT payload meaning offline.
    #[serde(alias = "ofln", skip_serializing_if = "Option::is_none")]
    pub offline_token: Option<String>,
    /// LWT payload meaning online.
    #[serde(alias = "onln", skip_serializing_if = "Option::is_none")]
    pub online_token: Option<String>,
    /// Firmware version string.
    #[serde(alias = "sw", skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
    /// The device topic.
    #[serde(alias = "t", skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Prefixes used by this device, in order `cmnd`, `stat`, `tele`.
    #[serde(alias = "tp", skip_serializing_if = "Vec::is_empty")]
    pub topic_prefixes: Vec<String>,
    /// Firmware upgrade URL, announced by builds that include it.
    #[serde(alias = "otaurl", skip_serializing_if = "Option::is_none")]
    pub ota_url: Option<String>,
    /// Keys whose values could not be read.
    #[serde(skip)]
    pub invalid_fields: Vec<String>,
}

impl DiscoveryConfig {
    /// Returns the first friendly name.
    #[must_use]
    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly_names.first()?.as_deref()
    }

    /// Returns the MAC in upper case without separators, the form used in
    /// discovery topics.
    #[must_use]
    pub fn mac_key(&self) -> Option<String> {
        self.mac.as_deref().map(normalize_mac)
    }

    /// Returns the MAC in `AA:BB:CC:DD:EE:FF` form.
    #[must_use]
    pub fn mac_colon(&self) -> Option<String> {
        let bare = self.mac_key()?;
        let pairs: Vec<&str> = bare
            .as_bytes()
            .chunks(2)
            .filter_map(|c| std::str::from_utf8(c).ok())
            .collect();
        Some(pairs.join(":"))
    }
}

/// Upper-cases a MAC and strips `:`/`-` separators.
#[must_use]
pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Sensor snapshot announced on `tasmota/discovery/<MAC>/sensors`:
/// `{"sn":{"Time":"...","SHT3X":{"Temperature":26.1}},"ver":1}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoverySensors {
    /// Readings keyed by sensor name.
    #[serde(default)]
    pub sn: BTreeMap<String, serde_json::Value>,
}

/// Parses a discovery config payload.
///
/// The payload must be a JSON object. Keys whose values do not fit their
/// field are left out one by one instead of failing the whole config.
pub(crate) fn parse_discovery_config(payload: &str) -> Result<DiscoveryConfig, ParseError> {
    let mut fields: Map<String, Value> = serde_json::from_str(payload).map_err(ParseError::Json)?;
    if let Ok(config) = serde_json::from_value(Value::Object(fields.clone())) {
        return Ok(config);
    }

    let mut invalid = Vec::new();
    fields.retain(|key, value| {
        let single = Map::from_iter([(key.clone(), value.clone())]);
        let fits = serde_json::from_value::<DiscoveryConfig>(Value::Object(single)).is_ok();
        if !fits {
            invalid.push(key.clone());
        }
        fits
    });

    let mut config: DiscoveryConfig =
        serde_json::from_value(Value::Object(fields)).map_err(ParseError::Json)?;
    config.invalid_fields = invalid;
    Ok(config)
}

/// Parses a discovery sensors payload.
pub(crate) fn parse_discovery_sensors(payload: &str) -> Result<DiscoverySensors, ParseError> {
    serde_json::from_str(payload).map_err(ParseError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{"ip":"192.168.1.50","dn":"Plug A","fn":["Plug A",null,null],"hn":"plugA-1234","mac":"A4CF12B3C4D5","md":"Sonoff S31","ty":0,"if":0,"ofln":"Offline","onln":"Online","state":["OFF","ON","TOGGLE","HOLD"],"sw":"13.1.0","t":"plugA","ft":"%prefix%/%topic%/","tp":["cmnd","stat","tele"],"rl":[1,0,0],"ver":1}"#;

    #[test]
    fn parse_full_config() {
        let config = parse_discovery_config(FULL).unwrap();
        assert_eq!(config.ip.as_deref(), Some("192.168.1.50"));
        assert_eq!(config.device_name.as_deref(), Some("Plug A"));
        assert_eq!(config.hostname.as_deref(), Some("plugA-1234"));
        assert_eq!(config.model.as_deref(), Some("Sonoff S31"));
        assert_eq!(config.online_token.as_deref(), Some("Online"));
        assert_eq!(config.offline_token.as_deref(), Some("Offline"));
        assert_eq!(config.software_version.as_deref(), Some("13.1.0"));
        assert_eq!(config.topic_prefixes, vec!["cmnd", "stat", "tele"]);
        assert_eq!(config.friendly_name(), Some("Plug A"));
    }

    #[test]
    fn missing_ota_url_is_fine() {
        let config = parse_discovery_config(FULL).unwrap();
        assert!(config.ota_url.is_none());
    }

    #[test]
    fn both_ota_url_spellings() {
        let a = parse_discovery_config(r#"{"ota_url":"http://ota.example/t.bin.gz"}"#).unwrap();
        let b = parse_discovery_config(r#"{"otaurl":"http://ota.example/t.bin.gz"}"#).unwrap();
        assert_eq!(a.ota_url, b.ota_url);
        assert!(a.ota_url.is_some());
    }

    #[test]
    fn empty_object_parses() {
        assert_eq!(parse_discovery_config("{}").unwrap(), DiscoveryConfig::default());
    }

    #[test]
    fn persisted_form_loads_back() {
        let config = parse_discovery_config(FULL).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"device_name\""));
        assert_eq!(parse_discovery_config(&json).unwrap(), config);
    }

    #[test]
    fn mistyped_field_spares_the_rest() {
        let config = parse_discovery_config(
            r#"{"t":"plugA","sw":13,"fn":"Kitchen","mac":"A4CF12B3C4D5","onln":"Online"}"#,
        )
        .unwrap();
        assert_eq!(config.topic.as_deref(), Some("plugA"));
        assert_eq!(config.mac_key().as_deref(), Some("A4CF12B3C4D5"));
        assert_eq!(config.online_token.as_deref(), Some("Online"));
        assert!(config.software_version.is_none());
        assert!(config.friendly_names.is_empty());
        assert_eq!(config.invalid_fields, vec!["fn", "sw"]);
    }

    #[test]
    fn non_object_config_is_an_error() {
        assert!(parse_discovery_config("[1,2]").is_err());
        assert!(parse_discovery_config("Online").is_err());
    }

    #[test]
    fn mac_forms() {
        assert_eq!(normalize_mac("a4:cf:12:b3:c4:d5"), "A4CF12B3C4D5");
        let config = parse_discovery_config(r#"{"mac":"a4cf12b3c4d5"}"#).unwrap();
        assert_eq!(config.mac_colon().as_deref(), Some("A4:CF:12:B3:C4:D5"));
    }

    #[test]
    fn parse_sensors() {
        let sensors = parse_discovery_sensors(
            r#"{"sn":{"Time":"2024-07-04T13:09:25","SHT3X":{"Temperature":26.1,"Humidity":44.5},"TempUnit":"C"},"ver":1}"#,
        )
        .unwrap();
        assert_eq!(sensors.sn["SHT3X"]["Temperature"], 26.1);
        assert_eq!(sensors.sn.len(), 3);
    }
}
