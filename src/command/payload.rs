// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command names, arguments and their payload serialization.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::topic::command_base;
use crate::types::{DstRule, PowerIndex, PowerState, TimerConfig, TimezoneSetting};

/// One command argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandValue {
    /// Integer argument.
    Integer(i64),
    /// Floating point argument.
    Float(f64),
    /// Verbatim text.
    Text(String),
    /// JSON argument, sent compact.
    Json(serde_json::Value),
}

impl CommandValue {
    /// Interprets a command line argument: integers, then floats, then JSON
    /// objects or arrays, otherwise verbatim text.
    ///
    /// # Examples
    ///
    /// ```
    /// use tasmota_fleet::command::CommandValue;
    ///
    /// assert_eq!(CommandValue::parse_arg("60"), CommandValue::Integer(60));
    /// assert_eq!(CommandValue::parse_arg("53.64"), CommandValue::Float(53.64));
    /// assert_eq!(CommandValue::parse_arg("ON"), CommandValue::Text("ON".into()));
    /// ```
    #[must_use]
    pub fn parse_arg(arg: &str) -> Self {
        if let Ok(n) = arg.parse::<i64>() {
            return Self::Integer(n);
        }
        if let Ok(f) = arg.parse::<f64>()
            && f.is_finite()
        {
            return Self::Float(f);
        }
        if arg.starts_with(['{', '['])
            && let Ok(value) = serde_json::from_str(arg)
        {
            return Self::Json(value);
        }
        Self::Text(arg.to_string())
    }
}

impl fmt::Display for CommandValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
            Self::Json(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for CommandValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for CommandValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for CommandValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// How a command joins its arguments into the MQTT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Space separated (the default).
    Spaced,
    /// Comma separated, used by `TimeDST` and `TimeSTD`.
    CommaList,
    /// A JSON document, used by `Timer<n>`.
    Json,
}

impl PayloadShape {
    /// Returns the shape a command expects.
    #[must_use]
    pub fn for_command(name: &str) -> Self {
        let base = command_base(name);
        if base.eq_ignore_ascii_case("TimeDST") || base.eq_ignore_ascii_case("TimeSTD") {
            Self::CommaList
        } else if base.eq_ignore_ascii_case("Timer") && base.len() < name.len() {
            Self::Json
        } else {
            Self::Spaced
        }
    }
}

/// A command name with its arguments.
///
/// An empty argument list queries the current value.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::command::Command;
/// use tasmota_fleet::types::DstRule;
///
/// let rule: DstRule = "0,0,3,1,2,120".parse().unwrap();
/// assert_eq!(Command::time_dst(&rule).payload(), "0,0,3,1,2,120");
/// assert_eq!(Command::query("TelePeriod").payload(), "");
/// assert_eq!(Command::upgrade().payload(), "1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name, e.g. `Power1` or `TimeDST`.
    pub name: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<CommandValue>,
}

impl Command {
    /// Creates a command.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<CommandValue>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// A query for the current value of a setting.
    #[must_use]
    pub fn query(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// `Power<n> ON|OFF|TOGGLE`.
    #[must_use]
    pub fn power(index: PowerIndex, state: PowerState) -> Self {
        Self::new(format!("Power{index}"), vec![state.as_str().into()])
    }

    /// `Upgrade 1`: fetch and install firmware from the OTA URL.
    #[must_use]
    pub fn upgrade() -> Self {
        Self::new("Upgrade", vec![CommandValue::Integer(1)])
    }

    /// `Timezone 99` or `Timezone +HH:MM`.
    #[must_use]
    pub fn timezone(setting: TimezoneSetting) -> Self {
        Self::new("Timezone", vec![CommandValue::Text(setting.command_value())])
    }

    /// `TimeDST h,w,m,d,h,o`.
    #[must_use]
    pub fn time_dst(rule: &DstRule) -> Self {
        Self::new("TimeDST", rule_args(rule))
    }

    /// `TimeSTD h,w,m,d,h,o`.
    #[must_use]
    pub fn time_std(rule: &DstRule) -> Self {
        Self::new("TimeSTD", rule_args(rule))
    }

    /// `Latitude <degrees>`.
    #[must_use]
    pub fn latitude(degrees: f64) -> Self {
        Self::new("Latitude", vec![CommandValue::Float(degrees)])
    }

    /// `Longitude <degrees>`.
    #[must_use]
    pub fn longitude(degrees: f64) -> Self {
        Self::new("Longitude", vec![CommandValue::Float(degrees)])
    }

    /// `Timer<n> {json}`.
    #[must_use]
    pub fn timer(index: u8, timer: &TimerConfig) -> Self {
        Self::new(
            format!("Timer{index}"),
            vec![CommandValue::Text(timer.to_string())],
        )
    }

    /// Returns true if the command only reads a value.
    #[must_use]
    pub fn is_query(&self) -> bool {
        self.args.is_empty()
    }

    /// Serializes the arguments into the MQTT payload.
    #[must_use]
    pub fn payload(&self) -> String {
        let parts: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        match PayloadShape::for_command(&self.name) {
            PayloadShape::CommaList => parts.join(","),
            PayloadShape::Json | PayloadShape::Spaced => parts.join(" "),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_query() {
            f.write_str(&self.name)
        } else {
            write!(f, "{} {}", self.name, self.payload())
        }
    }
}

fn rule_args(rule: &DstRule) -> Vec<CommandValue> {
    [
        i64::from(rule.hemisphere()),
        i64::from(rule.week()),
        i64::from(rule.month()),
        i64::from(rule.day()),
        i64::from(rule.hour()),
        i64::from(rule.offset()),
    ]
    .into_iter()
    .map(CommandValue::Integer)
    .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn shapes() {
        assert_eq!(PayloadShape::for_command("TimeDST"), PayloadShape::CommaList);
        assert_eq!(PayloadShape::for_command("TIMESTD"), PayloadShape::CommaList);
        assert_eq!(PayloadShape::for_command("Timer3"), PayloadShape::Json);
        assert_eq!(PayloadShape::for_command("Timers"), PayloadShape::Spaced);
        assert_eq!(PayloadShape::for_command("Backlog"), PayloadShape::Spaced);
    }

    #[test]
    fn spaced_payload() {
        let cmd = Command::new("Backlog", vec!["Power1".into(), "ON".into()]);
        assert_eq!(cmd.payload(), "Power1 ON");
        assert_eq!(cmd.to_string(), "Backlog Power1 ON");
    }

    #[test]
    fn timer_payload_is_compact_json() {
        let timer: TimerConfig = r#"{"Enable":1,"Time":"22:00"}"#.parse().unwrap();
        assert_eq!(
            Command::timer(1, &timer).payload(),
            r#"{"Enable":1,"Time":"22:00"}"#
        );

        let raw = Command::new("Timer2", vec![CommandValue::Json(json!({"Enable":0}))]);
        assert_eq!(raw.payload(), r#"{"Enable":0}"#);
    }

    #[test]
    fn power_and_timezone() {
        let cmd = Command::power(PowerIndex::first(), PowerState::Off);
        assert_eq!(cmd.name, "Power1");
        assert_eq!(cmd.payload(), "OFF");

        assert_eq!(Command::timezone(TimezoneSetting::Rules).payload(), "99");
        assert_eq!(
            Command::timezone(TimezoneSetting::Offset(-90)).payload(),
            "-01:30"
        );
    }

    #[test]
    fn coordinates() {
        assert_eq!(Command::latitude(53.643_775).payload(), "53.643775");
    }

    #[test]
    fn parse_args() {
        assert_eq!(CommandValue::parse_arg("-3"), CommandValue::Integer(-3));
        assert_eq!(
            CommandValue::parse_arg(r#"{"Enable":1}"#),
            CommandValue::Json(json!({"Enable":1}))
        );
        assert_eq!(CommandValue::parse_arg("{oops"), CommandValue::Text("{oops".into()));
        assert_eq!(CommandValue::parse_arg("NaN"), CommandValue::Text("NaN".into()));
    }
}
