// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Value types for Tasmota device settings.
//!
//! Each type validates its ranges at construction and converts losslessly to
//! and from the form Tasmota uses on the wire.
//!
//! # Types
//!
//! - [`DeviceId`] - The device's MQTT topic
//! - [`PowerState`] / [`PowerIndex`] - Relay state and relay number (1-8)
//! - [`FirmwareVersion`] - Numerically comparable firmware version
//! - [`DstRule`] / [`TimezoneSetting`] / [`TimezoneConfig`] - Local time configuration
//! - [`TimerConfig`] - `Timer<n>` definition
//! - [`RuleSet`] - `Rule<n>` state

mod device_id;
mod firmware;
mod power;
mod rule;
mod timer;
mod timezone;

pub use device_id::DeviceId;
pub use firmware::FirmwareVersion;
pub use power::{PowerIndex, PowerState};
pub use rule::{RULE_SET_COUNT, RuleSet};
pub use timer::{TIMER_COUNT, TimerConfig};
pub use timezone::{DstRule, TIMEZONE_RULES, TimezoneConfig, TimezoneSetting};
