// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware version parsing and comparison.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValueError;

/// A Tasmota firmware version such as `13.1.0(tasmota)` or `14.2.0.1`.
///
/// Only the leading dotted numeric part takes part in comparisons; the build
/// variant in parentheses is kept for display. Missing trailing components
/// compare as zero, so `13.1` equals `13.1.0`.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::types::FirmwareVersion;
///
/// let installed: FirmwareVersion = "13.1.0(tasmota)".parse().unwrap();
/// let target: FirmwareVersion = "13.2".parse().unwrap();
/// assert!(target > installed);
/// assert_eq!(installed.variant(), Some("tasmota"));
/// ```
#[derive(Debug, Clone)]
pub struct FirmwareVersion {
    components: Vec<u32>,
    raw: String,
}

impl FirmwareVersion {
    /// Returns the numeric components.
    #[must_use]
    pub fn components(&self) -> &[u32] {
        &self.components
    }

    /// Returns the build variant, e.g. `tasmota` or `sensors`.
    #[must_use]
    pub fn variant(&self) -> Option<&str> {
        let start = self.raw.find('(')?;
        let end = self.raw[start..].find(')')? + start;
        Some(&self.raw[start + 1..end])
    }

    /// Returns the original string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if `self` is numerically newer than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self > other
    }
}

impl FromStr for FirmwareVersion {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let numeric = trimmed
            .strip_prefix(['v', 'V'])
            .unwrap_or(trimmed)
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()
            .unwrap_or_default()
            .trim_end_matches('.');

        if numeric.is_empty() {
            return Err(ValueError::InvalidVersion(s.to_string()));
        }

        let components = numeric
            .split('.')
            .map(str::parse::<u32>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ValueError::InvalidVersion(s.to_string()))?;

        Ok(Self {
            components,
            raw: trimmed.to_string(),
        })
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| {
                let a = self.components.get(i).copied().unwrap_or(0);
                let b = other.components.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FirmwareVersion {}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for FirmwareVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for FirmwareVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> FirmwareVersion {
        s.parse().unwrap()
    }

    #[test]
    fn parses_variant_suffix() {
        let version = v("13.1.0(tasmota)");
        assert_eq!(version.components(), &[13, 1, 0]);
        assert_eq!(version.variant(), Some("tasmota"));
        assert_eq!(version.to_string(), "13.1.0(tasmota)");
    }

    #[test]
    fn numeric_not_lexical_comparison() {
        assert!(v("13.10.0") > v("13.9.0"));
        assert!(v("9.5.0") < v("10.0.0"));
    }

    #[test]
    fn missing_components_are_zero() {
        assert_eq!(v("13.1"), v("13.1.0"));
        assert!(v("13.1.0.1") > v("13.1"));
    }

    #[test]
    fn equal_is_not_newer() {
        assert!(!v("14.0.0").is_newer_than(&v("14.0.0(sensors)")));
    }

    #[test]
    fn rejects_non_numeric() {
        assert!(matches!(
            "unknown".parse::<FirmwareVersion>(),
            Err(ValueError::InvalidVersion(_))
        ));
        assert!("".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn accepts_leading_v() {
        assert_eq!(v("v14.2.0").components(), &[14, 2, 0]);
    }
}
