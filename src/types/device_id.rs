// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a device: its Tasmota MQTT topic (the `%topic%` segment).
///
/// # Examples
///
/// ```
/// use tasmota_fleet::types::DeviceId;
///
/// let id = DeviceId::new("plugA");
/// assert_eq!(id.command_topic("cmnd", "Power"), "cmnd/plugA/Power");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates an identifier from a device topic.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    /// Returns the device topic.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds `<prefix>/<id>/<suffix>`.
    #[must_use]
    pub fn command_topic(&self, prefix: &str, suffix: &str) -> String {
        format!("{prefix}/{}/{suffix}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
