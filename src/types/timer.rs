// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasmota `Timer<n>` definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// Number of timers tracked per device.
pub const TIMER_COUNT: u8 = 4;

/// One timer, in the JSON shape used by both the `Timer<n>` command and its
/// acknowledgement:
/// `{"Enable":1,"Mode":0,"Time":"22:00","Window":0,"Days":"1111111","Repeat":1,"Output":1,"Action":0}`.
///
/// Fields the device did not report stay `None` and are left out when the
/// timer is sent back, so Tasmota keeps their current values.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::types::TimerConfig;
///
/// let timer: TimerConfig = r#"{"Enable":1,"Time":"06:30","Days":"0111110"}"#.parse().unwrap();
/// assert_eq!(timer.time.as_deref(), Some("06:30"));
/// assert_eq!(timer.to_string(), r#"{"Enable":1,"Time":"06:30","Days":"0111110"}"#);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimerConfig {
    /// 1 arms the timer, 0 disarms it.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "enable")]
    pub enable: Option<u8>,
    /// 0 clock time, 1 sunrise, 2 sunset.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "mode")]
    pub mode: Option<u8>,
    /// `hh:mm`, or `+hh:mm`/`-hh:mm` relative to sunrise/sunset.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "time")]
    pub time: Option<String>,
    /// Random jitter in minutes (0-15).
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "window")]
    pub window: Option<u8>,
    /// Weekday mask starting on Sunday, `0` or `-` meaning off.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "days")]
    pub days: Option<String>,
    /// 1 repeats, 0 fires once.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "repeat")]
    pub repeat: Option<u8>,
    /// Output relay (1-16).
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "output")]
    pub output: Option<u8>,
    /// 0 off, 1 on, 2 toggle, 3 rule/blink.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "action")]
    pub action: Option<u8>,
}

impl TimerConfig {
    /// Checks every present field against Tasmota's accepted ranges.
    ///
    /// # Errors
    ///
    /// Returns `ValueError::InvalidTimer` describing the first bad field.
    pub fn validate(&self) -> Result<(), ValueError> {
        let ranges = [
            ("Enable", self.enable, 0, 1),
            ("Mode", self.mode, 0, 2),
            ("Window", self.window, 0, 15),
            ("Repeat", self.repeat, 0, 1),
            ("Output", self.output, 1, 16),
            ("Action", self.action, 0, 3),
        ];
        for (field, value, min, max) in ranges {
            if let Some(v) = value
                && !(min..=max).contains(&v)
            {
                return Err(ValueError::InvalidTimer(format!(
                    "{field} {v} not in {min}..={max}"
                )));
            }
        }

        if let Some(days) = &self.days
            && (days.chars().count() != 7 || !days.chars().all(|c| matches!(c, '0' | '1' | '-')))
        {
            return Err(ValueError::InvalidTimer(format!(
                "Days `{days}` must be seven of 0, 1 or -"
            )));
        }

        if let Some(time) = &self.time
            && !valid_time(time)
        {
            return Err(ValueError::InvalidTimer(format!("Time `{time}` is not hh:mm")));
        }

        Ok(())
    }
}

fn valid_time(time: &str) -> bool {
    let unsigned = time.trim_start_matches(['+', '-']);
    let Some((hours, minutes)) = unsigned.split_once(':') else {
        return false;
    };
    matches!(
        (hours.parse::<u8>(), minutes.parse::<u8>()),
        (Ok(h), Ok(m)) if h < 24 && m < 60
    )
}

/// Serializes to the compact JSON payload of the `Timer<n>` command.
impl fmt::Display for TimerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl FromStr for TimerConfig {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let timer: Self =
            serde_json::from_str(s).map_err(|e| ValueError::InvalidTimer(e.to_string()))?;
        timer.validate()?;
        Ok(timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{"Enable":1,"Mode":0,"Time":"22:00","Window":0,"Days":"1111111","Repeat":1,"Output":1,"Action":0}"#;

    #[test]
    fn round_trips_tasmota_payload() {
        let timer: TimerConfig = FULL.parse().unwrap();
        assert_eq!(timer.enable, Some(1));
        assert_eq!(timer.days.as_deref(), Some("1111111"));
        assert_eq!(timer.to_string(), FULL);
    }

    #[test]
    fn partial_timer_omits_unknown_fields() {
        let timer = TimerConfig {
            enable: Some(0),
            ..TimerConfig::default()
        };
        assert_eq!(timer.to_string(), r#"{"Enable":0}"#);
    }

    #[test]
    fn rejects_out_of_range_fields() {
        assert!(r#"{"Mode":3}"#.parse::<TimerConfig>().is_err());
        assert!(r#"{"Output":0}"#.parse::<TimerConfig>().is_err());
        assert!(r#"{"Days":"11111"}"#.parse::<TimerConfig>().is_err());
        assert!(r#"{"Time":"25:00"}"#.parse::<TimerConfig>().is_err());
    }

    #[test]
    fn accepts_sun_relative_time() {
        let timer: TimerConfig = r#"{"Mode":2,"Time":"-00:30"}"#.parse().unwrap();
        assert_eq!(timer.time.as_deref(), Some("-00:30"));
    }

    #[test]
    fn ignores_extra_fields() {
        let timer: TimerConfig = r#"{"Enable":1,"Arm":1}"#.parse().unwrap();
        assert_eq!(timer.enable, Some(1));
    }
}
