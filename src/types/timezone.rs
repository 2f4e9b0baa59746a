// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Timezone settings as Tasmota stores them.
//!
//! A device keeps its local time either as a fixed UTC offset
//! (`Timezone +01:00`) or, with `Timezone 99`, by applying a pair of
//! switch rules (`TimeDST` and `TimeSTD`). Each rule has the command form
//! `hemisphere,week,month,day,hour,offset`:
//!
//! | field      | range        | meaning                                   |
//! |------------|--------------|-------------------------------------------|
//! | hemisphere | 0..=1        | 0 north, 1 south                          |
//! | week       | 0..=4        | week of month, 0 = last                   |
//! | month      | 1..=12       | month of the switch                       |
//! | day        | 1..=7        | weekday, 1 = Sunday                       |
//! | hour       | 0..=23       | local hour at which the switch happens    |
//! | offset     | -780..=780   | UTC offset in minutes after the switch    |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ParseError, ValueError};

/// `Timezone` value selecting rule based local time.
pub const TIMEZONE_RULES: i32 = 99;

/// One daylight saving switch rule (`TimeDST` or `TimeSTD`).
///
/// # Examples
///
/// ```
/// use tasmota_fleet::types::DstRule;
///
/// let dst: DstRule = "0,0,3,1,2,120".parse().unwrap();
/// assert_eq!(dst.month(), 3);
/// assert_eq!(dst.to_string(), "0,0,3,1,2,120");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DstRule {
    hemisphere: u8,
    week: u8,
    month: u8,
    day: u8,
    hour: u8,
    offset: i16,
}

impl DstRule {
    /// Creates a rule after checking every field's range.
    ///
    /// # Errors
    ///
    /// Returns `ValueError::OutOfRange` naming the first invalid field.
    pub fn new(
        hemisphere: u8,
        week: u8,
        month: u8,
        day: u8,
        hour: u8,
        offset: i16,
    ) -> Result<Self, ValueError> {
        check_range("hemisphere", i64::from(hemisphere), 0, 1)?;
        check_range("week", i64::from(week), 0, 4)?;
        check_range("month", i64::from(month), 1, 12)?;
        check_range("day", i64::from(day), 1, 7)?;
        check_range("hour", i64::from(hour), 0, 23)?;
        check_range("offset", i64::from(offset), -780, 780)?;
        Ok(Self {
            hemisphere,
            week,
            month,
            day,
            hour,
            offset,
        })
    }

    /// Hemisphere flag (0 north, 1 south).
    #[must_use]
    pub fn hemisphere(&self) -> u8 {
        self.hemisphere
    }

    /// Week of month; 0 means the last one.
    #[must_use]
    pub fn week(&self) -> u8 {
        self.week
    }

    /// Month of the switch.
    #[must_use]
    pub fn month(&self) -> u8 {
        self.month
    }

    /// Weekday of the switch, 1 = Sunday.
    #[must_use]
    pub fn day(&self) -> u8 {
        self.day
    }

    /// Local hour of the switch.
    #[must_use]
    pub fn hour(&self) -> u8 {
        self.hour
    }

    /// UTC offset in minutes once the rule applies.
    #[must_use]
    pub fn offset(&self) -> i16 {
        self.offset
    }
}

fn check_range(field: &'static str, actual: i64, min: i64, max: i64) -> Result<(), ValueError> {
    if (min..=max).contains(&actual) {
        Ok(())
    } else {
        Err(ValueError::OutOfRange {
            field,
            min,
            max,
            actual,
        })
    }
}

impl fmt::Display for DstRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{}",
            self.hemisphere, self.week, self.month, self.day, self.hour, self.offset
        )
    }
}

impl FromStr for DstRule {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValueError::InvalidDstRule(s.to_string());
        let fields = s
            .split(',')
            .map(|f| f.trim().parse::<i64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        let &[hemisphere, week, month, day, hour, offset] = fields.as_slice() else {
            return Err(invalid());
        };
        let narrow = |v: i64| u8::try_from(v).map_err(|_| invalid());

        Self::new(
            narrow(hemisphere)?,
            narrow(week)?,
            narrow(month)?,
            narrow(day)?,
            narrow(hour)?,
            i16::try_from(offset).map_err(|_| invalid())?,
        )
    }
}

/// Accepts the structured response form (`{"Hemisphere":0,...}`, any key
/// case) as well as the command string form.
impl<'de> Deserialize<'de> for DstRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Fields {
            #[serde(alias = "Hemisphere")]
            hemisphere: u8,
            #[serde(alias = "Week")]
            week: u8,
            #[serde(alias = "Month")]
            month: u8,
            #[serde(alias = "Day")]
            day: u8,
            #[serde(alias = "Hour")]
            hour: u8,
            #[serde(alias = "Offset")]
            offset: i16,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Fields(Fields),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Fields(f) => DstRule::new(f.hemisphere, f.week, f.month, f.day, f.hour, f.offset)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// The `Timezone` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimezoneSetting {
    /// `Timezone 99`: local time follows the DST/STD rules.
    Rules,
    /// Fixed offset from UTC in minutes.
    Offset(i16),
}

impl TimezoneSetting {
    /// Returns the command argument (`99` or `+HH:MM`).
    #[must_use]
    pub fn command_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TimezoneSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rules => write!(f, "{TIMEZONE_RULES}"),
            Self::Offset(minutes) => {
                let sign = if *minutes < 0 { '-' } else { '+' };
                let abs = minutes.unsigned_abs();
                write!(f, "{sign}{:02}:{:02}", abs / 60, abs % 60)
            }
        }
    }
}

impl FromStr for TimezoneSetting {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ValueError::InvalidTimezone(s.to_string());

        if let Some((hours, minutes)) = s.split_once(':') {
            let negative = hours.starts_with('-');
            let hours: i16 = hours
                .trim_start_matches(['+', '-'])
                .parse()
                .map_err(|_| invalid())?;
            let minutes: i16 = minutes.parse().map_err(|_| invalid())?;
            if !(0..60).contains(&minutes) || hours > 14 {
                return Err(invalid());
            }
            let total = hours * 60 + minutes;
            return Ok(Self::Offset(if negative { -total } else { total }));
        }

        let value: i32 = s.parse().map_err(|_| invalid())?;
        Self::try_from(value)
    }
}

impl TryFrom<i32> for TimezoneSetting {
    type Error = ValueError;

    /// Interprets the numeric form: `99` or whole hours in `-13..=14`.
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            TIMEZONE_RULES => Ok(Self::Rules),
            -13..=14 => Ok(Self::Offset(i16::try_from(value * 60).unwrap_or_default())),
            _ => Err(ValueError::InvalidTimezone(value.to_string())),
        }
    }
}

impl Serialize for TimezoneSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Rules => serializer.serialize_i32(TIMEZONE_RULES),
            Self::Offset(_) => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for TimezoneSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(i32),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Self::try_from(n).map_err(serde::de::Error::custom),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Location and local time configuration of a device.
///
/// Every field is optional: a snapshot only knows what the device has
/// reported so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimezoneConfig {
    /// Latitude used for sunrise/sunset timers.
    pub latitude: Option<f64>,
    /// Longitude used for sunrise/sunset timers.
    pub longitude: Option<f64>,
    /// Rule switching to daylight saving time.
    pub dst: Option<DstRule>,
    /// Rule switching back to standard time.
    pub std: Option<DstRule>,
    /// The `Timezone` setting.
    pub timezone: Option<TimezoneSetting>,
}

/// Coordinates closer than this are considered equal; Tasmota keeps six
/// decimals.
const COORDINATE_TOLERANCE: f64 = 1e-5;

impl TimezoneConfig {
    /// Returns true if two optional coordinates denote the same location.
    #[must_use]
    pub fn same_coordinate(a: Option<f64>, b: Option<f64>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => (a - b).abs() < COORDINATE_TOLERANCE,
            (None, None) => true,
            _ => false,
        }
    }

    /// Applies one field of a command acknowledgement such as
    /// `{"TimeDST":{...}}` or `{"Latitude":"53.643775"}`.
    ///
    /// Returns `Ok(false)` for keys this config does not cover.
    ///
    /// # Errors
    ///
    /// Returns `ParseError::InvalidValue` if the key is known but the value
    /// cannot be interpreted.
    pub fn apply_field(&mut self, key: &str, value: &serde_json::Value) -> Result<bool, ParseError> {
        let invalid = |message: String| ParseError::InvalidValue {
            field: key.to_string(),
            message,
        };

        match key.to_ascii_lowercase().as_str() {
            "timezone" => {
                self.timezone = Some(
                    TimezoneSetting::deserialize(value).map_err(|e| invalid(e.to_string()))?,
                );
            }
            "timedst" => {
                self.dst = Some(DstRule::deserialize(value).map_err(|e| invalid(e.to_string()))?);
            }
            "timestd" => {
                self.std = Some(DstRule::deserialize(value).map_err(|e| invalid(e.to_string()))?);
            }
            "latitude" => self.latitude = Some(coordinate(value).ok_or_else(|| invalid(value.to_string()))?),
            "longitude" => self.longitude = Some(coordinate(value).ok_or_else(|| invalid(value.to_string()))?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Tasmota reports coordinates either as numbers or as strings.
fn coordinate(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
