// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layered settings.
//!
//! Layers, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. `config.yaml`
//! 3. `config.local.yaml`
//! 4. environment variables `TASMOTA_FLEET__<SECTION>__<KEY>`
//!
//! Both files live in `TASMOTA_FLEET_CONFIG_DIR` (default: the working
//! directory) and can be pointed elsewhere individually with
//! `TASMOTA_FLEET_CONFIG_PATH` and `TASMOTA_FLEET_CONFIG_LOCAL_PATH`. Missing
//! files are skipped. Command line flags are applied on top by the binary.
//!
//! ```yaml
//! mqtt:
//!   host: broker.local
//!   username: fleet
//! discovery:
//!   grace_ms: 3000
//!   noise_prefixes: [tele/rtl_433, tele/zigbee]
//! timezone:
//!   zone: Europe/Berlin
//! ```
//!
//! Environment values are read as YAML scalars, except where the default
//! is a string. A purely numeric secret must therefore be quoted
//! (`TASMOTA_FLEET__MQTT__PASSWORD="'1234'"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::collector::{CollectOptions, NoiseFilter, RetainedMode};
use crate::error::{ConfigError, ValueError};
use crate::fleet::{self, DEFAULT_COMMAND_TIMEOUT, FleetOptions};
use crate::registry::OnlinePolicy;
use crate::topic::TopicLayout;
use crate::types::{FirmwareVersion, TimezoneConfig};

/// Prefix of per-key environment overrides.
pub const ENV_PREFIX: &str = "TASMOTA_FLEET__";
/// Directory holding the configuration files.
pub const ENV_CONFIG_DIR: &str = "TASMOTA_FLEET_CONFIG_DIR";
/// Path of the base configuration file.
pub const ENV_CONFIG_PATH: &str = "TASMOTA_FLEET_CONFIG_PATH";
/// Path of the local override file.
pub const ENV_CONFIG_LOCAL_PATH: &str = "TASMOTA_FLEET_CONFIG_LOCAL_PATH";

/// Broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// User name, if the broker requires authentication.
    pub username: Option<String>,
    /// Password for `username`.
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive_s: u64,
    /// Time to wait for the CONNACK in seconds.
    pub connection_timeout_s: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_s: 30,
            connection_timeout_s: 10,
        }
    }
}

/// Discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Topic prefixes.
    pub topics: TopicLayout,
    /// Collection filters; empty selects the discovery and LWT subtrees.
    pub filters: Vec<String>,
    /// Receive window in milliseconds.
    pub grace_ms: u64,
    /// End collection once no new topic arrived for this many milliseconds.
    pub quiet_period_ms: Option<u64>,
    /// Retained flag filter.
    pub retained: RetainedMode,
    /// Subtrees kept out of the registry.
    pub noise_prefixes: Vec<String>,
    /// Devices whose last STATE report is older than this many seconds, by
    /// the device clock in `timezone.zone`, are not online.
    pub state_freshness_s: Option<u64>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        let collect = CollectOptions::default();
        Self {
            topics: TopicLayout::default(),
            filters: Vec::new(),
            grace_ms: u64::try_from(collect.grace.as_millis()).unwrap_or(u64::MAX),
            quiet_period_ms: None,
            retained: collect.retained,
            noise_prefixes: NoiseFilter::default().drop_prefixes,
            state_freshness_s: None,
        }
    }
}

/// Command bursts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    /// Acknowledgement timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_ms: u64::try_from(DEFAULT_COMMAND_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Snapshot files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    /// Directory snapshots are written to and read from.
    pub directory: PathBuf,
    /// Persist a snapshot after every discovery pass.
    pub save_after_discovery: bool,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("tasmotas"),
            save_after_discovery: false,
        }
    }
}

/// Desired local time configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimezoneSettings {
    /// IANA zone name.
    pub zone: String,
    /// Latitude for sunrise and sunset timers.
    pub latitude: Option<f64>,
    /// Longitude for sunrise and sunset timers.
    pub longitude: Option<f64>,
}

impl Default for TimezoneSettings {
    fn default() -> Self {
        Self {
            zone: "Europe/Berlin".to_string(),
            latitude: None,
            longitude: None,
        }
    }
}

/// Firmware policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareSettings {
    /// Version devices should run, e.g. `14.2.0`.
    pub target: Option<String>,
}

/// All settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Broker connection.
    pub mqtt: MqttSettings,
    /// Discovery pass.
    pub discovery: DiscoverySettings,
    /// Command bursts.
    pub commands: CommandSettings,
    /// Snapshot files.
    pub snapshot: SnapshotSettings,
    /// Desired local time configuration.
    pub timezone: TimezoneSettings,
    /// Firmware policy.
    pub firmware: FirmwareSettings,
}

/// Locations of the configuration files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    /// `config.yaml`.
    pub base: PathBuf,
    /// `config.local.yaml`.
    pub local: PathBuf,
}

impl ConfigPaths {
    /// Both files inside `dir`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            base: dir.join("config.yaml"),
            local: dir.join("config.local.yaml"),
        }
    }

    /// Resolves the paths from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let dir = std::env::var_os(ENV_CONFIG_DIR).map_or_else(|| PathBuf::from("."), PathBuf::from);
        let mut paths = Self::in_dir(&dir);
        if let Some(path) = std::env::var_os(ENV_CONFIG_PATH) {
            paths.base = PathBuf::from(path);
        }
        if let Some(path) = std::env::var_os(ENV_CONFIG_LOCAL_PATH) {
            paths.local = PathBuf::from(path);
        }
        paths
    }
}

impl Settings {
    /// Loads settings from the files and variables of this process.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a file exists but cannot be read or parsed,
    /// or if the merged layers do not form valid settings.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&ConfigPaths::from_env(), std::env::vars())
    }

    /// Loads settings from explicit files and environment pairs.
    ///
    /// # Errors
    ///
    /// See [`Settings::load`].
    pub fn load_from(
        paths: &ConfigPaths,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let mut merged = serde_yaml::to_value(Self::default()).map_err(ConfigError::Invalid)?;

        for path in [&paths.base, &paths.local] {
            if let Some(layer) = read_layer(path)? {
                tracing::debug!(path = %path.display(), "Applying configuration file");
                merge(&mut merged, layer);
            }
        }

        for (key, raw) in env {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path: Vec<String> = rest.split("__").map(str::to_ascii_lowercase).collect();
            if path.iter().any(String::is_empty) {
                continue;
            }
            apply_env(&mut merged, &path, &key, &raw)?;
        }

        serde_yaml::from_value(merged).map_err(ConfigError::Invalid)
    }

    /// Options for [`Fleet`](crate::fleet::Fleet).
    #[must_use]
    pub fn fleet_options(&self) -> FleetOptions {
        let discovery = &self.discovery;
        let mut collect = CollectOptions::new()
            .with_retained(discovery.retained)
            .with_grace(Duration::from_millis(discovery.grace_ms));
        if let Some(quiet) = discovery.quiet_period_ms {
            collect = collect.with_quiet_period(Duration::from_millis(quiet));
        }

        FleetOptions {
            layout: discovery.topics.clone(),
            filters: discovery.filters.clone(),
            collect,
            noise: NoiseFilter {
                drop_prefixes: discovery.noise_prefixes.clone(),
            },
            online: OnlinePolicy {
                freshness: discovery.state_freshness_s.map(Duration::from_secs),
                device_zone: Some(self.timezone.zone.clone()),
            },
            command_timeout: Duration::from_millis(self.commands.timeout_ms),
        }
    }

    /// The timezone configuration devices should carry in `year`.
    ///
    /// # Errors
    ///
    /// Returns `ValueError::InvalidTimezone` if the zone is unknown.
    pub fn desired_timezone(&self, year: i16) -> Result<TimezoneConfig, ValueError> {
        fleet::timezone_config(
            &self.timezone.zone,
            year,
            self.timezone.latitude,
            self.timezone.longitude,
        )
    }

    /// The configured firmware target, if any.
    ///
    /// # Errors
    ///
    /// Returns `ValueError::InvalidVersion` if the target is not a version.
    pub fn target_firmware(&self) -> Result<Option<FirmwareVersion>, ValueError> {
        self.firmware.target.as_deref().map(str::parse).transpose()
    }

    /// A connection builder for the configured broker.
    #[cfg(feature = "mqtt")]
    #[must_use]
    pub fn mqtt_builder(&self) -> crate::bus::MqttBusBuilder {
        let mqtt = &self.mqtt;
        let mut builder = crate::bus::MqttBus::builder()
            .host(&mqtt.host)
            .port(mqtt.port)
            .keep_alive(Duration::from_secs(mqtt.keep_alive_s))
            .connection_timeout(Duration::from_secs(mqtt.connection_timeout_s));
        if let Some(username) = &mqtt.username {
            builder = builder.credentials(username, mqtt.password.as_deref().unwrap_or_default());
        }
        builder
    }
}

fn read_layer(path: &Path) -> Result<Option<Value>, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let value: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((!value.is_null()).then_some(value))
}

/// Deep-merges mappings; anything else in `overlay` replaces `base`.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env(root: &mut Value, path: &[String], key: &str, raw: &str) -> Result<(), ConfigError> {
    let Some((leaf, parents)) = path.split_last() else {
        return Ok(());
    };

    let mut node = root;
    for segment in parents {
        let Value::Mapping(map) = node else {
            return Ok(());
        };
        node = map
            .entry(Value::String(segment.clone()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
    let Value::Mapping(map) = node else {
        tracing::warn!(key, "Environment override does not address a section");
        return Ok(());
    };

    let leaf = Value::String(leaf.clone());
    let value = if matches!(map.get(&leaf), Some(Value::String(_))) {
        Value::String(raw.to_string())
    } else {
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Env {
            key: key.to_string(),
            source,
        })?
    };
    tracing::debug!(key, "Applying environment override");
    map.insert(leaf, value);
    Ok(())
}
