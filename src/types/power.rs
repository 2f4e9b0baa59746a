// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Relay power state and relay addressing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValueError;

/// Power state of a relay, as reported in `POWER`/`POWERn` fields or sent
/// with the `Power` command.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::types::PowerState;
///
/// assert_eq!("on".parse::<PowerState>().unwrap(), PowerState::On);
/// assert_eq!(PowerState::Toggle.as_str(), "TOGGLE");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    /// Relay is off.
    Off,
    /// Relay is on.
    On,
    /// Toggle the current state. Only meaningful as a command argument.
    Toggle,
}

impl PowerState {
    /// Returns the Tasmota string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
            Self::Toggle => "TOGGLE",
        }
    }

    /// Returns true for [`PowerState::On`].
    #[must_use]
    pub const fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerState {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "OFF" | "0" | "FALSE" => Ok(Self::Off),
            "ON" | "1" | "TRUE" => Ok(Self::On),
            "TOGGLE" | "2" => Ok(Self::Toggle),
            _ => Err(ValueError::InvalidPowerState(s.to_string())),
        }
    }
}

impl From<bool> for PowerState {
    fn from(value: bool) -> Self {
        if value { Self::On } else { Self::Off }
    }
}

impl Serialize for PowerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PowerState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Index of a relay on a multi-relay device (1-8).
///
/// A bare `POWER` field maps to relay 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PowerIndex(u8);

impl PowerIndex {
    /// Highest relay index Tasmota reports.
    pub const MAX: u8 = 8;

    /// Creates a relay index.
    ///
    /// # Errors
    ///
    /// Returns `ValueError::OutOfRange` unless `1 <= index <= 8`.
    pub fn new(index: u8) -> Result<Self, ValueError> {
        if index == 0 || index > Self::MAX {
            return Err(ValueError::OutOfRange {
                field: "relay index",
                min: 1,
                max: i64::from(Self::MAX),
                actual: i64::from(index),
            });
        }
        Ok(Self(index))
    }

    /// The first relay.
    #[must_use]
    pub const fn first() -> Self {
        Self(1)
    }

    /// Returns the numeric index.
    #[must_use]
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Parses a telemetry field name such as `POWER` or `POWER3`.
    #[must_use]
    pub fn from_field(field: &str) -> Option<Self> {
        let suffix = field.strip_prefix("POWER")?;
        if suffix.is_empty() {
            return Some(Self::first());
        }
        suffix.parse::<u8>().ok().and_then(|n| Self::new(n).ok())
    }
}

impl TryFrom<u8> for PowerIndex {
    type Error = ValueError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PowerIndex> for u8 {
    fn from(index: PowerIndex) -> Self {
        index.0
    }
}

impl fmt::Display for PowerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
