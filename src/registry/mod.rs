// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device registry built from parsed topic entries.
//!
//! [`build`] folds entries into one [`DeviceSnapshot`] per device. Entries are
//! applied in receive order and each one only touches the fields its subtopic
//! covers, so a later `LWT` never wipes what the discovery config announced.
//!
//! Discovery messages are addressed by MAC. They are attached to the device
//! whose discovery config names that MAC; a MAC without a config becomes a
//! device of its own.
//!
//! # Examples
//!
//! ```
//! use tasmota_fleet::bus::Message;
//! use tasmota_fleet::registry::{self, OnlinePolicy};
//! use tasmota_fleet::topic::{ParseOutcome, TopicLayout, parse};
//!
//! let layout = TopicLayout::default();
//! let messages = [
//!     Message::new("tasmota/discovery/AABBCCDDEEFF/config", r#"{"t":"plugA","sw":"13.1.0"}"#, true),
//!     Message::new("tele/plugA/LWT", "Online", true),
//! ];
//! let entries = messages.iter().filter_map(|m| match parse(&layout, m) {
//!     ParseOutcome::Parsed(entry) => Some(entry),
//!     ParseOutcome::Unparsed { .. } => None,
//! });
//!
//! let snapshot = registry::build(entries);
//! assert_eq!(snapshot.devices.len(), 1);
//!
//! let online = registry::filter_online(&snapshot, &OnlinePolicy::default(), chrono::Utc::now());
//! assert_eq!(online.len(), 1);
//! ```

mod device;
mod store;

pub use device::{DEFAULT_OFFLINE_TOKEN, DEFAULT_ONLINE_TOKEN, DeviceSnapshot};
pub use store::{FORMAT_VERSION, load_latest, persist};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::telemetry::Payload;
use crate::topic::{DeviceKey, ParsedEntry};
use crate::types::DeviceId;

/// A point-in-time view of every known device.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySnapshot {
    /// When the snapshot was built.
    pub taken_at: DateTime<Utc>,
    /// Devices by id.
    pub devices: BTreeMap<DeviceId, DeviceSnapshot>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            taken_at: Utc::now(),
            devices: BTreeMap::new(),
        }
    }
}

impl RegistrySnapshot {
    /// Returns a device by id.
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceSnapshot> {
        self.devices.get(id)
    }

    /// Iterates devices in id order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceSnapshot> {
        self.devices.values()
    }

    /// Number of devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns true if no device is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Replaces or inserts devices, keeping `taken_at`.
    pub fn update(&mut self, devices: impl IntoIterator<Item = DeviceSnapshot>) {
        for device in devices {
            self.devices.insert(device.id.clone(), device);
        }
    }
}

/// Which devices count as online.
///
/// With a freshness bound a device must also have reported STATE within
/// that period. The age comes from the report's own `Time` field, read in
/// `device_zone` (UTC when unset): a retained STATE replayed on subscribe
/// arrives now however old it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlinePolicy {
    /// Devices whose last STATE is older than this are excluded.
    pub freshness: Option<Duration>,
    /// IANA zone the devices' clocks run in.
    #[serde(default)]
    pub device_zone: Option<String>,
}

impl OnlinePolicy {
    /// Returns true if `device` counts as online at `now`.
    #[must_use]
    pub fn admits(&self, device: &DeviceSnapshot, now: DateTime<Utc>) -> bool {
        if !device.is_online() {
            return false;
        }
        let Some(freshness) = self.freshness else {
            return true;
        };
        let Some(reported) = self.reported_at(device) else {
            return false;
        };
        (now - reported)
            .to_std()
            .map_or(true, |age| age <= freshness)
    }

    /// When the device's last STATE report was taken, by the device clock.
    #[must_use]
    pub fn reported_at(&self, device: &DeviceSnapshot) -> Option<DateTime<Utc>> {
        let time = device.state.as_ref()?.time.as_deref()?;
        let zone = match self.device_zone.as_deref() {
            Some(name) => jiff::tz::TimeZone::get(name).ok()?,
            None => jiff::tz::TimeZone::UTC,
        };
        let civil: jiff::civil::DateTime = time.parse().ok()?;
        let stamp = civil.to_zoned(zone).ok()?.timestamp();
        DateTime::from_timestamp_millis(stamp.as_millisecond())
    }
}

/// Builds a snapshot from parsed entries.
///
/// Entries are applied in `received_at` order; entries with equal timestamps
/// keep their input order.
#[must_use]
pub fn build(entries: impl IntoIterator<Item = ParsedEntry>) -> RegistrySnapshot {
    let mut entries: Vec<ParsedEntry> = entries.into_iter().collect();
    entries.sort_by_key(|entry| entry.received_at);

    let mac_to_topic = resolve_macs(&entries);
    let mut devices: BTreeMap<DeviceId, DeviceSnapshot> = BTreeMap::new();
    let mut resolved: BTreeSet<DeviceId> = BTreeSet::new();

    for entry in &entries {
        let id = match &entry.key {
            DeviceKey::Topic(id) => Some(id.clone()),
            DeviceKey::Mac(mac) => mac_to_topic.get(mac).cloned(),
        };
        let id = match id {
            Some(id) => {
                resolved.insert(id.clone());
                id
            }
            None => match &entry.key {
                DeviceKey::Mac(mac) => DeviceId::new(mac.as_str()),
                DeviceKey::Topic(id) => id.clone(),
            },
        };
        devices
            .entry(id.clone())
            .or_insert_with(|| DeviceSnapshot::new(id))
            .apply(entry);
    }
    for device in devices.values_mut() {
        device.topic_unresolved = !resolved.contains(&device.id);
    }

    tracing::debug!(
        entries = entries.len(),
        devices = devices.len(),
        "Registry built"
    );

    RegistrySnapshot {
        taken_at: Utc::now(),
        devices,
    }
}

/// Maps discovery MACs to the device topic their config announces. The
/// latest config wins.
fn resolve_macs(entries: &[ParsedEntry]) -> HashMap<String, DeviceId> {
    let mut map = HashMap::new();
    for entry in entries {
        let DeviceKey::Mac(mac) = &entry.key else {
            continue;
        };
        let Some(Payload::DiscoveryConfig(config)) = entry.decoded.known() else {
            continue;
        };
        if let Some(topic) = config.topic.as_deref().filter(|t| !t.is_empty()) {
            map.insert(mac.clone(), DeviceId::new(topic));
        }
    }
    map
}

/// Devices that are online under `policy` at `now`.
#[must_use]
pub fn filter_online(
    snapshot: &RegistrySnapshot,
    policy: &OnlinePolicy,
    now: DateTime<Utc>,
) -> Vec<DeviceSnapshot> {
    snapshot
        .iter()
        .filter(|device| policy.admits(device, now))
        .cloned()
        .collect()
}

/// Devices that announced going offline, regardless of freshness.
///
/// Devices without an LWT, and devices known only by MAC, are left out:
/// there is no topic to address them on.
#[must_use]
pub fn filter_offline(snapshot: &RegistrySnapshot) -> Vec<DeviceSnapshot> {
    snapshot
        .iter()
        .filter(|device| device.reports_offline() && !device.topic_unresolved)
        .cloned()
        .collect()
}

/// Names of the top-level snapshot fields that differ between two versions
/// of one device. Bookkeeping and live readings are not compared.
#[must_use]
pub fn changed_fields(before: &DeviceSnapshot, after: &DeviceSnapshot) -> Vec<String> {
    const VOLATILE: [&str; 4] = ["last_seen", "degraded", "state", "sensors"];

    let (Ok(Value::Object(before)), Ok(Value::Object(after))) =
        (serde_json::to_value(before), serde_json::to_value(after))
    else {
        return Vec::new();
    };
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|key| !VOLATILE.contains(&key.as_str()))
        .filter(|key| before.get(*key) != after.get(*key))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone as _};

    use super::*;
    use crate::bus::Message;
    use crate::topic::{ParseOutcome, TopicLayout, parse};

    fn entries(messages: &[Message]) -> Vec<ParsedEntry> {
        messages
            .iter()
            .filter_map(|m| match parse(&TopicLayout::default(), m) {
                ParseOutcome::Parsed(entry) => Some(entry),
                ParseOutcome::Unparsed { .. } => None,
            })
            .collect()
    }

    #[test]
    fn lwt_and_state_scenario() {
        let snapshot = build(entries(&[
            Message::new("tele/plugA/LWT", "Online", true),
            Message::new("tele/plugA/STATE", r#"{"POWER":"ON"}"#, true),
        ]));

        assert_eq!(snapshot.len(), 1);
        let online = filter_online(&snapshot, &OnlinePolicy::default(), Utc::now());
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, DeviceId::new("plugA"));
    }

    #[test]
    fn discovery_merges_into_topic_device() {
        let now = Utc::now();
        let snapshot = build(entries(&[
            Message::new("tele/plugA/LWT", "Online", true).received_at(now),
            Message::new(
                "tasmota/discovery/A4CF12B3C4D5/config",
                r#"{"t":"plugA","mac":"A4CF12B3C4D5","ip":"10.0.0.7"}"#,
                true,
            )
            .received_at(now + ChronoDuration::milliseconds(5)),
            Message::new(
                "tasmota/discovery/A4CF12B3C4D5/sensors",
                r#"{"sn":{"ANALOG":{"A0":1}}}"#,
                true,
            ),
        ]));

        assert_eq!(snapshot.len(), 1);
        let device = snapshot.get(&DeviceId::new("plugA")).unwrap();
        assert_eq!(device.ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(device.lwt.as_deref(), Some("Online"));
        assert!(device.sensors.contains_key("ANALOG"));
    }

    #[test]
    fn unresolved_mac_is_its_own_device() {
        let snapshot = build(entries(&[Message::new(
            "tasmota/discovery/AABBCCDDEEFF/sensors",
            r#"{"sn":{}}"#,
            true,
        )]));
        assert!(snapshot.get(&DeviceId::new("AABBCCDDEEFF")).is_some());
    }

    #[test]
    fn entries_apply_in_receive_order() {
        let now = Utc::now();
        let snapshot = build(entries(&[
            Message::new("tele/plugA/LWT", "Online", true).received_at(now),
            Message::new("tele/plugA/LWT", "Offline", true)
                .received_at(now - ChronoDuration::seconds(10)),
        ]));
        assert_eq!(
            snapshot.get(&DeviceId::new("plugA")).unwrap().lwt.as_deref(),
            Some("Online")
        );
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    #[test]
    fn freshness_reads_the_report_time_not_the_receive_time() {
        let now = noon();
        // Both replayed from retained state just now.
        let snapshot = build(entries(&[
            Message::new("tele/old/LWT", "Online", true).received_at(now),
            Message::new("tele/old/STATE", r#"{"Time":"2026-10-16T09:45:00","POWER":"ON"}"#, true)
                .received_at(now),
            Message::new("tele/new/LWT", "Online", true).received_at(now),
            Message::new("tele/new/STATE", r#"{"Time":"2026-10-16T11:55:00","POWER":"ON"}"#, true)
                .received_at(now),
            Message::new("tele/silent/LWT", "Online", true).received_at(now),
        ]));
        let policy = OnlinePolicy {
            freshness: Some(Duration::from_secs(3600)),
            device_zone: None,
        };

        let online: Vec<_> = filter_online(&snapshot, &policy, now)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(online, vec![DeviceId::new("new")]);
    }

    #[test]
    fn report_time_is_read_in_the_device_zone() {
        let now = noon();
        let snapshot = build(entries(&[
            Message::new("tele/plugA/LWT", "Online", true),
            // 12:30 in Berlin (CEST) is 10:30 UTC.
            Message::new("tele/plugA/STATE", r#"{"Time":"2026-10-16T12:30:00"}"#, true),
        ]));
        let device = snapshot.get(&DeviceId::new("plugA")).unwrap();
        let policy = OnlinePolicy {
            freshness: Some(Duration::from_secs(3600)),
            device_zone: Some("Europe/Berlin".to_string()),
        };

        assert_eq!(
            policy.reported_at(device),
            Some(Utc.with_ymd_and_hms(2026, 10, 16, 10, 30, 0).unwrap())
        );
        assert!(!policy.admits(device, now));
        assert!(OnlinePolicy::default().admits(device, now));
    }

    #[test]
    fn offline_devices() {
        let snapshot = build(entries(&[
            Message::new("tele/a/LWT", "Online", true),
            Message::new("tele/b/LWT", "Offline", true),
            Message::new("tele/c/STATE", r#"{"POWER":"ON"}"#, true),
        ]));
        let offline: Vec<_> = filter_offline(&snapshot).into_iter().map(|d| d.id).collect();
        assert_eq!(offline, vec![DeviceId::new("b")]);
    }

    #[test]
    fn mac_only_device_is_never_offline() {
        let snapshot = build(entries(&[
            Message::new("tasmota/discovery/A4CF12B3C4D9/sensors", r#"{"sn":{"Time":"2026-10-16T12:00:00"}}"#, true),
            Message::new("tasmota/discovery/A4CF12B3C4D5/config", r#"{"t":"plugA"}"#, true),
            Message::new("tasmota/discovery/A4CF12B3C4D5/sensors", r#"{"sn":{}}"#, true),
            Message::new("tele/plugA/LWT", "Offline", true),
        ]));

        let unresolved = snapshot.get(&DeviceId::new("A4CF12B3C4D9")).unwrap();
        assert!(unresolved.topic_unresolved);
        assert!(!snapshot.get(&DeviceId::new("plugA")).unwrap().topic_unresolved);

        let offline: Vec<_> = filter_offline(&snapshot).into_iter().map(|d| d.id).collect();
        assert_eq!(offline, vec![DeviceId::new("plugA")]);
    }

    #[test]
    fn changed_fields_skip_live_readings() {
        let mut before = DeviceSnapshot::new(DeviceId::new("plugA"));
        before.tele_period = Some(300);
        before.last_seen = Some(noon());

        let mut after = before.clone();
        after.tele_period = Some(60);
        after.last_seen = Some(noon() + ChronoDuration::minutes(5));
        after.degraded.insert("Timer1".to_string());

        assert_eq!(changed_fields(&before, &after), vec!["tele_period".to_string()]);
        assert!(changed_fields(&before, &before).is_empty());
    }

    #[test]
    fn carried_settings_do_not_override_live_ones() {
        let mut previous = DeviceSnapshot::new(DeviceId::new("plugA"));
        previous.tele_period = Some(300);
        previous.power_delta = Some(10);
        previous.timezone.latitude = Some(53.6);

        let mut live = DeviceSnapshot::new(DeviceId::new("plugA"));
        live.tele_period = Some(60);
        live.carry_settings(&previous);

        assert_eq!(live.tele_period, Some(60));
        assert_eq!(live.power_delta, Some(10));
        assert_eq!(live.timezone.latitude, Some(53.6));
    }
}
