// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic grammar of a Tasmota installation.
//!
//! Device topics follow `<prefix>/<device topic>/<suffix>`, where the prefix
//! is one of the command, status or telemetry prefixes. Discovery topics
//! use a two segment prefix and address devices by MAC:
//! `tasmota/discovery/<MAC>/config`.
//!
//! # Examples
//!
//! ```
//! use tasmota_fleet::bus::Message;
//! use tasmota_fleet::topic::{DeviceKey, ParseOutcome, TopicLayout, parse};
//!
//! let layout = TopicLayout::default();
//! let msg = Message::new("tele/plugA/LWT", "Online", true);
//!
//! let ParseOutcome::Parsed(entry) = parse(&layout, &msg) else {
//!     panic!("expected a device topic");
//! };
//! assert_eq!(entry.key, DeviceKey::Topic("plugA".into()));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::Message;
use crate::telemetry::{self, Decoded, PayloadKind};
use crate::types::DeviceId;

/// Topic prefixes of a Tasmota installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicLayout {
    /// Prefix of discovery announcements (two segments).
    pub discovery_prefix: String,
    /// Telemetry prefix (`%prefix%` 3).
    pub telemetry: String,
    /// Status prefix (`%prefix%` 2).
    pub status: String,
    /// Command prefix (`%prefix%` 1).
    pub command: String,
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            discovery_prefix: "tasmota/discovery".to_string(),
            telemetry: "tele".to_string(),
            status: "stat".to_string(),
            command: "cmnd".to_string(),
        }
    }
}

impl TopicLayout {
    /// `cmnd/<id>/<command>`.
    #[must_use]
    pub fn command_topic(&self, device: &DeviceId, command: &str) -> String {
        device.command_topic(&self.command, command)
    }

    /// `tele/<id>/LWT`.
    #[must_use]
    pub fn lwt_topic(&self, device: &DeviceId) -> String {
        device.command_topic(&self.telemetry, "LWT")
    }

    /// `stat/+/<suffix>` filter across all devices.
    #[must_use]
    pub fn status_filter(&self, suffix: &str) -> String {
        format!("{}/+/{suffix}", self.status)
    }

    /// Default collection filters: every discovery message and every LWT.
    #[must_use]
    pub fn default_filters(&self) -> Vec<String> {
        vec![
            format!("{}/#", self.discovery_prefix),
            format!("{}/+/LWT", self.telemetry),
        ]
    }
}

/// How an entry addresses its device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKey {
    /// By device topic.
    Topic(DeviceId),
    /// By MAC (upper case, no separators); resolved through the discovery
    /// config.
    Mac(String),
}

/// One understood message.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    /// Source topic.
    pub topic: String,
    /// Device the entry belongs to.
    pub key: DeviceKey,
    /// Which subtopic it came from.
    pub kind: PayloadKind,
    /// Decoded payload.
    pub decoded: Decoded,
    /// Payload text, lossily converted.
    pub raw: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
    /// Whether the message was retained.
    pub retained: bool,
}

/// Result of parsing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// The topic belongs to a device.
    Parsed(ParsedEntry),
    /// The topic does not follow the device grammar; kept for diagnostics.
    Unparsed {
        /// The topic as received.
        topic: String,
        /// Why it was not understood.
        reason: String,
    },
}

/// Parses a message according to `layout`.
///
/// Malformed payloads on a recognised topic still produce
/// [`ParseOutcome::Parsed`] with [`Decoded::Unknown`]; they are logged at warn
/// level.
#[must_use]
pub fn parse(layout: &TopicLayout, message: &Message) -> ParseOutcome {
    let (key, kind) = match classify(layout, &message.topic) {
        Ok(found) => found,
        Err(reason) => {
            tracing::trace!(topic = %message.topic, %reason, "Topic not parsed");
            return ParseOutcome::Unparsed {
                topic: message.topic.clone(),
                reason,
            };
        }
    };

    let decoded = telemetry::decode(&kind, &message.payload);
    if let Decoded::Unknown { reason } = &decoded {
        tracing::warn!(
            topic = %message.topic,
            error = %reason,
            "Malformed payload, field degraded to unknown"
        );
    }

    ParseOutcome::Parsed(ParsedEntry {
        topic: message.topic.clone(),
        key,
        kind,
        decoded,
        raw: message.payload_lossy().into_owned(),
        received_at: message.received_at,
        retained: message.retained,
    })
}

fn classify(layout: &TopicLayout, topic: &str) -> Result<(DeviceKey, PayloadKind), String> {
    if let Some(rest) = topic
        .strip_prefix(layout.discovery_prefix.as_str())
        .and_then(|r| r.strip_prefix('/'))
    {
        let parts: Vec<&str> = rest.split('/').collect();
        let &[mac, suffix] = parts.as_slice() else {
            return Err(format!("expected {}/<MAC>/<kind>", layout.discovery_prefix));
        };
        if mac.is_empty() {
            return Err("empty MAC segment".to_string());
        }
        let kind = match suffix {
            "config" => PayloadKind::DiscoveryConfig,
            "sensors" => PayloadKind::DiscoverySensors,
            other => return Err(format!("unsupported discovery kind `{other}`")),
        };
        return Ok((DeviceKey::Mac(telemetry::normalize_mac(mac)), kind));
    }

    let parts: Vec<&str> = topic.split('/').collect();
    let &[prefix, device, suffix] = parts.as_slice() else {
        return Err("expected <prefix>/<device>/<suffix>".to_string());
    };
    if device.is_empty() || suffix.is_empty() {
        return Err("empty topic segment".to_string());
    }

    let kind = if prefix == layout.telemetry {
        match suffix {
            "LWT" => PayloadKind::Lwt,
            "STATE" => PayloadKind::State,
            "SENSOR" => PayloadKind::Sensor,
            other => return Err(format!("unsupported telemetry suffix `{other}`")),
        }
    } else if prefix == layout.status {
        match suffix {
            "RESULT" => PayloadKind::Result,
            other => PayloadKind::Response(other.to_string()),
        }
    } else if prefix == layout.command {
        return Err("command topic".to_string());
    } else {
        return Err(format!("unknown prefix `{prefix}`"));
    };

    Ok((DeviceKey::Topic(DeviceId::new(device)), kind))
}

/// Strips trailing index digits from a command name: `Timer1` becomes
/// `Timer`, `TimeDST` is unchanged. Tasmota reports `stat/<id>/<CMD>` under
/// this base name.
#[must_use]
pub fn command_base(command: &str) -> &str {
    let trimmed = command.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.is_empty() { command } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Payload;

    fn parse_one(topic: &str, payload: &str) -> ParseOutcome {
        parse(&TopicLayout::default(), &Message::new(topic, payload, true))
    }

    fn parsed(topic: &str, payload: &str) -> ParsedEntry {
        match parse_one(topic, payload) {
            ParseOutcome::Parsed(entry) => entry,
            ParseOutcome::Unparsed { reason, .. } => panic!("unparsed: {reason}"),
        }
    }

    #[test]
    fn telemetry_topics() {
        let entry = parsed("tele/plugA/STATE", r#"{"POWER":"ON"}"#);
        assert_eq!(entry.key, DeviceKey::Topic(DeviceId::new("plugA")));
        assert_eq!(entry.kind, PayloadKind::State);
        assert!(matches!(entry.decoded, Decoded::Known(Payload::State(_))));

        assert_eq!(parsed("tele/plugA/LWT", "Offline").kind, PayloadKind::Lwt);
        assert_eq!(parsed("tele/plugA/SENSOR", "{}").kind, PayloadKind::Sensor);
    }

    #[test]
    fn discovery_topics_keyed_by_mac() {
        let entry = parsed("tasmota/discovery/a4cf12b3c4d5/config", r#"{"t":"plugA"}"#);
        assert_eq!(entry.key, DeviceKey::Mac("A4CF12B3C4D5".to_string()));
        assert_eq!(entry.kind, PayloadKind::DiscoveryConfig);

        let entry = parsed("tasmota/discovery/A4CF12B3C4D5/sensors", r#"{"sn":{}}"#);
        assert_eq!(entry.kind, PayloadKind::DiscoverySensors);
    }

    #[test]
    fn status_topics() {
        assert_eq!(parsed("stat/plugA/RESULT", "{}").kind, PayloadKind::Result);
        assert_eq!(
            parsed("stat/plugA/TIMER", "{}").kind,
            PayloadKind::Response("TIMER".to_string())
        );
    }

    #[test]
    fn non_device_topics_unparsed() {
        for topic in [
            "tele/rtl_433/Acurite/1234/temperature",
            "zigbee2mqtt/bridge/state",
            "tele/plugA",
            "tele/plugA/INFO1",
            "cmnd/plugA/Power",
            "tasmota/discovery/AABB",
            "tasmota/discovery/AABB/unknown",
        ] {
            assert!(
                matches!(parse_one(topic, "x"), ParseOutcome::Unparsed { .. }),
                "{topic} should not parse"
            );
        }
    }

    #[test]
    fn malformed_payload_degrades() {
        let entry = parsed("tele/plugA/STATE", "{broken");
        assert!(matches!(entry.decoded, Decoded::Unknown { .. }));
        assert_eq!(entry.raw, "{broken");
    }

    #[test]
    fn custom_layout() {
        let layout = TopicLayout {
            telemetry: "telemetry".to_string(),
            ..TopicLayout::default()
        };
        let msg = Message::new("telemetry/plugA/LWT", "Online", true);
        assert!(matches!(parse(&layout, &msg), ParseOutcome::Parsed(_)));
        assert_eq!(layout.default_filters()[1], "telemetry/+/LWT");
    }

    #[test]
    fn command_base_strips_index() {
        assert_eq!(command_base("Timer1"), "Timer");
        assert_eq!(command_base("PowerDelta1"), "PowerDelta");
        assert_eq!(command_base("TimeDST"), "TimeDST");
        assert_eq!(command_base("42"), "42");
    }
}
