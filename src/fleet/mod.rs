// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet-wide workflows.
//!
//! [`Fleet`] ties collection, parsing, the registry and the dispatcher
//! together. A typical invocation discovers the fleet once and then issues
//! one command burst:
//!
//! ```
//! use std::time::Duration;
//! use tasmota_fleet::bus::MemoryBus;
//! use tasmota_fleet::collector::CollectOptions;
//! use tasmota_fleet::command::{Command, CommandOutcome};
//! use tasmota_fleet::fleet::{Fleet, FleetOptions};
//!
//! # async fn example() -> tasmota_fleet::Result<()> {
//! let bus = MemoryBus::new();
//! bus.seed_retained("tasmota/discovery/A4CF12B3C4D5/config", r#"{"t":"plugA","dn":"Desk"}"#);
//! bus.seed_retained("tele/plugA/LWT", "Online");
//!
//! let options = FleetOptions {
//!     collect: CollectOptions::new().with_grace(Duration::from_millis(200)),
//!     command_timeout: Duration::from_millis(500),
//!     ..FleetOptions::default()
//! };
//! let fleet = Fleet::new(&bus, options);
//!
//! let snapshot = fleet.list_tasmotas().await?;
//! let online = fleet.list_online(&snapshot);
//! let results = fleet.send_cmd(&online, &Command::new("Power", vec!["TOGGLE".into()]), true).await?;
//! assert_eq!(results[0].outcome, CommandOutcome::WouldSend);
//! # Ok(())
//! # }
//! ```

mod timezone;

pub use timezone::{current_year, timezone_config};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::bus::{Message, MessageBus};
use crate::collector::{self, CollectOptions, CollectedMessages, NoiseFilter};
use crate::command::{Command, CommandDispatcher, CommandResult, DispatchPlan};
use crate::error::{Error, Result};
use crate::registry::{self, DeviceSnapshot, OnlinePolicy, RegistrySnapshot};
use crate::topic::{ParseOutcome, TopicLayout, parse};
use crate::types::{DeviceId, FirmwareVersion, RULE_SET_COUNT, TIMER_COUNT, TimezoneConfig};

/// Default acknowledgement timeout for fleet commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings shared by every fleet operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetOptions {
    /// Topic prefixes.
    pub layout: TopicLayout,
    /// Discovery filters; empty means [`TopicLayout::default_filters`].
    pub filters: Vec<String>,
    /// Collection window and retained handling.
    pub collect: CollectOptions,
    /// Subtrees kept out of the registry.
    pub noise: NoiseFilter,
    /// Which devices count as online.
    pub online: OnlinePolicy,
    /// Acknowledgement timeout for command bursts.
    pub command_timeout: Duration,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            layout: TopicLayout::default(),
            filters: Vec::new(),
            collect: CollectOptions::default(),
            noise: NoiseFilter::default(),
            online: OnlinePolicy::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl FleetOptions {
    /// The filters discovery subscribes to.
    #[must_use]
    pub fn discovery_filters(&self) -> Vec<String> {
        if self.filters.is_empty() {
            self.layout.default_filters()
        } else {
            self.filters.clone()
        }
    }
}

/// Why a collected topic did not contribute to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum NoiseReason {
    /// The topic lies under a configured noise prefix.
    Filtered,
    /// The topic does not follow the device grammar.
    Unparsed(String),
}

impl fmt::Display for NoiseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filtered => f.write_str("noise filter"),
            Self::Unparsed(reason) => write!(f, "unparsed: {reason}"),
        }
    }
}

/// A collected message kept out of the registry, verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoisyTopic {
    /// Topic as received.
    pub topic: String,
    /// Payload, lossily decoded.
    pub payload: String,
    /// Why it was left out.
    pub reason: NoiseReason,
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// The devices found.
    pub snapshot: RegistrySnapshot,
    /// Everything that was collected but does not describe a device.
    pub noisy: Vec<NoisyTopic>,
}

/// Why a device is not upgraded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UpgradeSkip {
    /// The device is not online.
    Offline,
    /// The device advertises no OTA URL.
    NoOtaUrl,
    /// The OTA URL is not an http(s) URL with a host.
    InvalidOtaUrl(String),
    /// The installed version is unknown or unparsable.
    UnknownVersion(Option<String>),
    /// The installed version is not older than the target.
    UpToDate(String),
}

impl fmt::Display for UpgradeSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => f.write_str("offline"),
            Self::NoOtaUrl => f.write_str("no OTA URL"),
            Self::InvalidOtaUrl(url) => write!(f, "invalid OTA URL `{url}`"),
            Self::UnknownVersion(Some(raw)) => write!(f, "unparsable firmware version `{raw}`"),
            Self::UnknownVersion(None) => f.write_str("unknown firmware version"),
            Self::UpToDate(installed) => write!(f, "up to date ({installed})"),
        }
    }
}

/// What happened to one device during a firmware check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeDecision {
    /// An upgrade was issued (or would be, in a dry run).
    Upgrade(CommandResult),
    /// The device was left alone.
    Skipped(UpgradeSkip),
}

/// Firmware check result for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirmwareReport {
    /// The device.
    pub device: DeviceId,
    /// Installed version as reported.
    pub installed: Option<String>,
    /// The decision taken.
    pub decision: UpgradeDecision,
}

/// Fields of one device that differ from the stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceChange {
    /// The device.
    pub device: DeviceId,
    /// Names of the changed snapshot fields.
    pub fields: Vec<String>,
}

/// Outcome of [`Fleet::update_snapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    /// The refreshed snapshot, ready to persist.
    pub snapshot: RegistrySnapshot,
    /// One result per settings query.
    pub results: Vec<CommandResult>,
    /// Devices whose settings changed.
    pub changes: Vec<DeviceChange>,
    /// Stored devices that are no longer online.
    pub dropped: Vec<DeviceId>,
}

/// Command results together with the snapshots they updated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetReport {
    /// One result per command issued.
    pub results: Vec<CommandResult>,
    /// The input devices, with acknowledged values merged in.
    pub devices: Vec<DeviceSnapshot>,
}

/// Returns true if `url` is an `http` or `https` URL naming a host.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::fleet::is_valid_ota_url;
///
/// assert!(is_valid_ota_url("http://ota.tasmota.com/tasmota/release/tasmota.bin.gz"));
/// assert!(!is_valid_ota_url("ftp://ota.example/fw.bin"));
/// assert!(!is_valid_ota_url("http:///fw.bin"));
/// ```
#[must_use]
pub fn is_valid_ota_url(url: &str) -> bool {
    let Some((scheme, rest)) = url.trim().split_once("://") else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return false;
    }
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = if let Some(bracketed) = host_port.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        host_port.split(':').next().unwrap_or_default()
    };
    !host.is_empty() && !host.contains(char::is_whitespace)
}

/// Decides whether `device` should be upgraded to `target`.
///
/// # Errors
///
/// Returns the reason the device is skipped.
pub fn upgrade_eligibility(
    device: &DeviceSnapshot,
    target: &FirmwareVersion,
) -> std::result::Result<(), UpgradeSkip> {
    let url = device
        .ota_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or(UpgradeSkip::NoOtaUrl)?;
    if !is_valid_ota_url(url) {
        return Err(UpgradeSkip::InvalidOtaUrl(url.to_string()));
    }
    let installed = device
        .firmware_version()
        .ok_or_else(|| UpgradeSkip::UnknownVersion(device.firmware.clone()))?;
    if target.is_newer_than(&installed) {
        Ok(())
    } else {
        Err(UpgradeSkip::UpToDate(installed.to_string()))
    }
}

/// Commands that bring `current` to `desired`, in the order Tasmota should
/// apply them. Fields `desired` leaves unset are not touched.
#[must_use]
pub fn timezone_commands(current: &TimezoneConfig, desired: &TimezoneConfig) -> Vec<Command> {
    let mut commands = Vec::new();
    if let Some(latitude) = desired.latitude
        && !TimezoneConfig::same_coordinate(current.latitude, Some(latitude))
    {
        commands.push(Command::latitude(latitude));
    }
    if let Some(longitude) = desired.longitude
        && !TimezoneConfig::same_coordinate(current.longitude, Some(longitude))
    {
        commands.push(Command::longitude(longitude));
    }
    if let Some(dst) = desired.dst
        && current.dst != Some(dst)
    {
        commands.push(Command::time_dst(&dst));
    }
    if let Some(std) = desired.std
        && current.std != Some(std)
    {
        commands.push(Command::time_std(&std));
    }
    if let Some(setting) = desired.timezone
        && current.timezone != Some(setting)
    {
        commands.push(Command::timezone(setting));
    }
    commands
}

/// Reads back the settings [`timezone_commands`] compares.
#[must_use]
pub fn timezone_queries() -> Vec<Command> {
    TIMEZONE_QUERIES.into_iter().map(Command::query).collect()
}

const TIMEZONE_QUERIES: [&str; 5] = ["Timezone", "Latitude", "Longitude", "TimeDST", "TimeSTD"];

/// Queries issued by [`Fleet::refresh_settings`].
#[must_use]
pub fn settings_queries() -> Vec<Command> {
    let mut queries = timezone_queries();
    queries.extend(
        ["TelePeriod", "OtaUrl", "PowerDelta1", "SetOption4"]
            .into_iter()
            .map(Command::query),
    );
    queries.extend((1..=RULE_SET_COUNT).map(|n| Command::query(format!("Rule{n}"))));
    queries.extend((1..=TIMER_COUNT).map(|n| Command::query(format!("Timer{n}"))));
    queries
}

/// High-level operations over one bus connection.
#[derive(Debug)]
pub struct Fleet<'a, B: MessageBus> {
    bus: &'a B,
    options: FleetOptions,
}

impl<'a, B: MessageBus> Fleet<'a, B> {
    /// Creates a fleet handle on an already connected bus.
    #[must_use]
    pub fn new(bus: &'a B, options: FleetOptions) -> Self {
        Self { bus, options }
    }

    /// Returns the options in use.
    #[must_use]
    pub fn options(&self) -> &FleetOptions {
        &self.options
    }

    fn dispatcher(&self) -> CommandDispatcher<'a, B> {
        CommandDispatcher::new(
            self.bus,
            self.options.layout.clone(),
            self.options.command_timeout,
        )
    }

    fn is_online(&self, device: &DeviceSnapshot) -> bool {
        self.options.online.admits(device, Utc::now())
    }

    /// Collects every retained message under the discovery filters,
    /// including noisy subtrees.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the bus fails.
    pub async fn list_retained(&self, grace: Option<Duration>) -> Result<CollectedMessages> {
        let mut options = self.options.collect.clone();
        if let Some(grace) = grace {
            options = options.with_grace(grace);
        }
        Ok(collector::collect(self.bus, &self.options.discovery_filters(), &options).await?)
    }

    /// Runs one discovery pass and keeps the diagnostics.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the bus fails.
    pub async fn discover(&self) -> Result<Discovery> {
        let collected = self.list_retained(None).await?;
        let (devices, filtered) = collected.partition(&self.options.noise);

        let mut noisy: Vec<NoisyTopic> = filtered
            .iter()
            .map(|message| noisy_topic(message, NoiseReason::Filtered))
            .collect();
        let mut entries = Vec::with_capacity(devices.len());
        for message in &devices {
            match parse(&self.options.layout, message) {
                ParseOutcome::Parsed(entry) => entries.push(entry),
                ParseOutcome::Unparsed { topic, reason } => {
                    tracing::debug!(%topic, %reason, "Topic left out of the registry");
                    noisy.push(noisy_topic(message, NoiseReason::Unparsed(reason)));
                }
            }
        }

        let snapshot = registry::build(entries);
        tracing::info!(
            devices = snapshot.len(),
            noisy = noisy.len(),
            "Discovery finished"
        );
        Ok(Discovery { snapshot, noisy })
    }

    /// Discovers the fleet.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the bus fails.
    pub async fn list_tasmotas(&self) -> Result<RegistrySnapshot> {
        Ok(self.discover().await?.snapshot)
    }

    /// Devices of `snapshot` that are online now.
    #[must_use]
    pub fn list_online(&self, snapshot: &RegistrySnapshot) -> Vec<DeviceSnapshot> {
        registry::filter_online(snapshot, &self.options.online, Utc::now())
    }

    /// Sends `command` to every online device in `devices`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoDevices` if none of `devices` is online, and
    /// `Error::Protocol` if the bus fails.
    pub async fn send_cmd(
        &self,
        devices: &[DeviceSnapshot],
        command: &Command,
        dry_run: bool,
    ) -> Result<Vec<CommandResult>> {
        let mut plan = DispatchPlan::new();
        for device in devices {
            if self.is_online(device) {
                plan.push(device.id.clone(), command.clone());
            } else {
                tracing::debug!(device = %device.id, lwt = ?device.lwt, "Skipping offline device");
            }
        }
        if plan.is_empty() {
            return Err(Error::NoDevices(format!("command {}", command.name)));
        }

        tracing::info!(command = %command, devices = plan.len(), dry_run, "Sending command");
        Ok(self.dispatcher().dispatch(&plan, dry_run).await?)
    }

    /// Issues `Upgrade 1` to every online device running firmware older
    /// than `target` that advertises a usable OTA URL.
    ///
    /// Devices without an upgrade path are skipped with a reason.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the bus fails.
    pub async fn ensure_freshest_firmware(
        &self,
        devices: &[DeviceSnapshot],
        target: &FirmwareVersion,
        dry_run: bool,
    ) -> Result<Vec<FirmwareReport>> {
        let mut plan = DispatchPlan::new();
        let mut skips: HashMap<DeviceId, UpgradeSkip> = HashMap::new();

        for device in devices {
            let eligibility = if self.is_online(device) {
                upgrade_eligibility(device, target)
            } else {
                Err(UpgradeSkip::Offline)
            };
            match eligibility {
                Ok(()) => {
                    tracing::info!(
                        device = %device.id,
                        installed = ?device.firmware,
                        %target,
                        "Upgrade required"
                    );
                    plan.push(device.id.clone(), Command::upgrade());
                }
                Err(skip) => {
                    tracing::debug!(device = %device.id, reason = %skip, "No upgrade");
                    skips.insert(device.id.clone(), skip);
                }
            }
        }

        let mut upgrades: HashMap<DeviceId, CommandResult> = self
            .dispatcher()
            .dispatch(&plan, dry_run)
            .await?
            .into_iter()
            .map(|result| (result.device.clone(), result))
            .collect();

        Ok(devices
            .iter()
            .filter_map(|device| {
                let decision = match upgrades.remove(&device.id) {
                    Some(result) => UpgradeDecision::Upgrade(result),
                    None => UpgradeDecision::Skipped(skips.remove(&device.id)?),
                };
                Some(FirmwareReport {
                    device: device.id.clone(),
                    installed: device.firmware.clone(),
                    decision,
                })
            })
            .collect())
    }

    /// Brings the timezone settings of every online device to `desired`,
    /// commanding only the fields that differ.
    ///
    /// Discovery does not carry these settings, so they are queried first;
    /// the queries go out even in a dry run, only the changes are withheld.
    /// The returned snapshots carry the queried and acknowledged values.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the bus fails.
    pub async fn ensure_correct_timezone_settings(
        &self,
        devices: &[DeviceSnapshot],
        desired: &TimezoneConfig,
        dry_run: bool,
    ) -> Result<FleetReport> {
        let mut devices = devices.to_vec();
        self.query_into(&mut devices, &timezone_queries()).await?;

        let mut plan = DispatchPlan::new();
        for device in devices.iter().filter(|d| self.is_online(d)) {
            let commands = timezone_commands(&device.timezone, desired);
            if commands.is_empty() {
                tracing::debug!(device = %device.id, "Timezone settings already correct");
                continue;
            }
            tracing::info!(
                device = %device.id,
                commands = ?commands.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Timezone settings differ"
            );
            for command in commands {
                plan.push(device.id.clone(), command);
            }
        }

        let results = self.dispatcher().dispatch(&plan, dry_run).await?;
        for device in &mut devices {
            let id = device.id.clone();
            for result in results.iter().filter(|r| r.device == id && r.outcome.is_success()) {
                merge_desired(&mut device.timezone, &result.command, desired);
                merge_response(device, result);
            }
        }
        Ok(FleetReport { results, devices })
    }

    /// Republishes the online token, retained, on the LWT topic of every
    /// device that announced going offline.
    ///
    /// Devices without an LWT or known only by MAC are skipped. Returns the
    /// devices that were triggered.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the bus fails.
    pub async fn trigger_lwt_for_offline(&self, devices: &[DeviceSnapshot]) -> Result<Vec<DeviceId>> {
        let mut triggered = Vec::new();
        for device in devices {
            if !device.reports_offline() || device.topic_unresolved {
                tracing::debug!(
                    device = %device.id,
                    lwt = ?device.lwt,
                    unresolved = device.topic_unresolved,
                    "Not triggering LWT"
                );
                continue;
            }
            let topic = self.options.layout.lwt_topic(&device.id);
            let token = device.online_token();
            tracing::info!(device = %device.id, %topic, token, "Triggering LWT");
            self.bus.publish(&topic, token.as_bytes(), true).await?;
            triggered.push(device.id.clone());
        }
        Ok(triggered)
    }

    /// Queries the current settings of every online device and merges the
    /// answers into the returned snapshots.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the bus fails.
    pub async fn refresh_settings(&self, devices: &[DeviceSnapshot]) -> Result<FleetReport> {
        let mut devices = devices.to_vec();
        let results = self.query_into(&mut devices, &settings_queries()).await?;
        Ok(FleetReport { results, devices })
    }

    /// Brings a stored snapshot up to date.
    ///
    /// Stored devices that are no longer online on the bus are dropped. The
    /// rest take over their live discovery data, keep stored settings the
    /// live pass cannot see, and are refreshed with
    /// [`settings_queries`]. Every changed field is reported per device.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the bus fails.
    pub async fn update_snapshot(&self, stored: &RegistrySnapshot) -> Result<SnapshotUpdate> {
        let live = self.list_tasmotas().await?;

        let mut devices = Vec::new();
        let mut dropped = Vec::new();
        for previous in stored.iter() {
            match live.get(&previous.id).filter(|d| self.is_online(d)) {
                Some(current) => {
                    let mut device = current.clone();
                    device.carry_settings(previous);
                    devices.push(device);
                }
                None => {
                    tracing::info!(device = %previous.id, "No longer online, dropping");
                    dropped.push(previous.id.clone());
                }
            }
        }

        let results = self.query_into(&mut devices, &settings_queries()).await?;

        let changes: Vec<DeviceChange> = devices
            .iter()
            .filter_map(|device| {
                let fields = registry::changed_fields(stored.get(&device.id)?, device);
                if fields.is_empty() {
                    return None;
                }
                tracing::info!(device = %device.id, ?fields, "Device changed");
                Some(DeviceChange {
                    device: device.id.clone(),
                    fields,
                })
            })
            .collect();

        let snapshot = RegistrySnapshot {
            taken_at: Utc::now(),
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
        };
        Ok(SnapshotUpdate {
            snapshot,
            results,
            changes,
            dropped,
        })
    }

    /// Sends `queries` to every online device in `devices` and merges the
    /// acknowledged values in place.
    async fn query_into(
        &self,
        devices: &mut [DeviceSnapshot],
        queries: &[Command],
    ) -> Result<Vec<CommandResult>> {
        let mut plan = DispatchPlan::new();
        for device in devices.iter().filter(|d| self.is_online(d)) {
            for query in queries {
                plan.push(device.id.clone(), query.clone());
            }
        }

        let results = self.dispatcher().dispatch(&plan, false).await?;
        for device in devices.iter_mut() {
            let id = device.id.clone();
            for result in results.iter().filter(|r| r.device == id && r.outcome.is_success()) {
                merge_response(device, result);
            }
        }
        Ok(results)
    }
}

fn noisy_topic(message: &Message, reason: NoiseReason) -> NoisyTopic {
    NoisyTopic {
        topic: message.topic.clone(),
        payload: message.payload_lossy().into_owned(),
        reason,
    }
}

/// Records the value a successful timezone command set.
fn merge_desired(config: &mut TimezoneConfig, command: &str, desired: &TimezoneConfig) {
    match command.to_ascii_lowercase().as_str() {
        "latitude" => config.latitude = desired.latitude,
        "longitude" => config.longitude = desired.longitude,
        "timedst" => config.dst = desired.dst,
        "timestd" => config.std = desired.std,
        "timezone" => config.timezone = desired.timezone,
        _ => {}
    }
}

/// Merges every key of an acknowledgement into the snapshot.
fn merge_response(device: &mut DeviceSnapshot, result: &CommandResult) {
    let Some(response) = result.response_json() else {
        return;
    };
    for (key, value) in &response {
        if !device.apply_result(key, value) {
            tracing::trace!(device = %device.id, key, "Ignoring acknowledgement field");
        }
    }
}
