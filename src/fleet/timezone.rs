// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Derives Tasmota timezone settings from IANA zone names.
//!
//! A zone that changes its UTC offset during the year maps to
//! `Timezone 99` plus the two switch rules. A zone with a constant offset
//! maps to a fixed `Timezone +HH:MM` and leaves the rules unset.

use jiff::civil::DateTime;
use jiff::tz::{Offset, TimeZone};
use jiff::{Timestamp, Zoned};

use crate::error::ValueError;
use crate::types::{DstRule, TimezoneConfig, TimezoneSetting};

const HOUR: i64 = 3600;
const MINUTE: i64 = 60;

/// One change of UTC offset.
#[derive(Debug, Clone, Copy)]
struct Transition {
    at: Timestamp,
    before: Offset,
    after: Offset,
}

/// Returns the current year in the system timezone.
#[must_use]
pub fn current_year() -> i16 {
    Zoned::now().year()
}

/// Builds the timezone settings a device in `zone` should carry during
/// `year`, with optional coordinates for sunrise and sunset timers.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::fleet::timezone_config;
/// use tasmota_fleet::types::TimezoneSetting;
///
/// let berlin = timezone_config("Europe/Berlin", 2026, None, None).unwrap();
/// assert_eq!(berlin.timezone, Some(TimezoneSetting::Rules));
/// assert_eq!(berlin.dst.unwrap().to_string(), "0,0,3,1,2,120");
/// assert_eq!(berlin.std.unwrap().to_string(), "0,0,10,1,3,60");
/// ```
///
/// # Errors
///
/// Returns `ValueError::InvalidTimezone` if the zone is unknown or its
/// switch times cannot be expressed as Tasmota rules.
pub fn timezone_config(
    zone: &str,
    year: i16,
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> Result<TimezoneConfig, ValueError> {
    let invalid = |reason: String| ValueError::InvalidTimezone(format!("{zone}: {reason}"));

    let tz = TimeZone::get(zone).map_err(|e| invalid(e.to_string()))?;
    let transitions = transitions_in_year(&tz, year).map_err(invalid)?;

    let forward = transitions.iter().find(|t| t.after > t.before);
    let backward = transitions.iter().find(|t| t.after < t.before);

    let mut config = TimezoneConfig {
        latitude,
        longitude,
        ..TimezoneConfig::default()
    };

    match (forward, backward) {
        (Some(forward), Some(backward)) => {
            let southern = month_of(forward) > month_of(backward);
            config.timezone = Some(TimezoneSetting::Rules);
            config.dst = Some(switch_rule(forward, southern).map_err(|e| invalid(e.to_string()))?);
            config.std = Some(switch_rule(backward, southern).map_err(|e| invalid(e.to_string()))?);
        }
        _ => {
            let end = year_start(year + 1).map_err(invalid)?;
            let minutes = tz.to_offset(end).seconds() / 60;
            let minutes = i16::try_from(minutes).map_err(|_| invalid(format!("offset {minutes} min")))?;
            config.timezone = Some(TimezoneSetting::Offset(minutes));
        }
    }

    tracing::debug!(
        zone,
        year,
        timezone = ?config.timezone,
        dst = ?config.dst.map(|r| r.to_string()),
        std = ?config.std.map(|r| r.to_string()),
        "Derived timezone settings"
    );
    Ok(config)
}

fn year_start(year: i16) -> Result<Timestamp, String> {
    jiff::civil::Date::new(year, 1, 1)
        .and_then(|date| date.to_zoned(TimeZone::UTC))
        .map(|zoned| zoned.timestamp())
        .map_err(|e| e.to_string())
}

fn at_second(second: i64) -> Result<Timestamp, String> {
    Timestamp::from_second(second).map_err(|e| e.to_string())
}

/// Scans the year hour by hour and pins every offset change to the minute.
fn transitions_in_year(tz: &TimeZone, year: i16) -> Result<Vec<Transition>, String> {
    let start = year_start(year)?.as_second();
    let end = year_start(year + 1)?.as_second();

    let mut transitions = Vec::new();
    let mut previous = tz.to_offset(at_second(start)?);
    let mut second = start + HOUR;

    while second <= end {
        let offset = tz.to_offset(at_second(second)?);
        if offset != previous {
            let mut at = second - HOUR + MINUTE;
            while tz.to_offset(at_second(at)?) == previous {
                at += MINUTE;
            }
            transitions.push(Transition {
                at: at_second(at)?,
                before: previous,
                after: offset,
            });
            previous = offset;
        }
        second += HOUR;
    }
    Ok(transitions)
}

fn local_before(transition: &Transition) -> DateTime {
    TimeZone::fixed(transition.before).to_datetime(transition.at)
}

fn month_of(transition: &Transition) -> i8 {
    local_before(transition).month()
}

/// Expresses a transition as `hemisphere,week,month,day,hour,offset`, with
/// the local wall clock hour before the switch.
fn switch_rule(transition: &Transition, southern: bool) -> Result<DstRule, ValueError> {
    let local = local_before(transition);
    let day = local.day();
    let week = if day + 7 > local.date().days_in_month() {
        0
    } else {
        (day - 1) / 7 + 1
    };
    let narrow = |field: &'static str, value: i8| {
        u8::try_from(value).map_err(|_| ValueError::OutOfRange {
            field,
            min: 0,
            max: i64::from(u8::MAX),
            actual: i64::from(value),
        })
    };
    let offset = transition.after.seconds() / 60;

    DstRule::new(
        u8::from(southern),
        narrow("week", week)?,
        narrow("month", local.month())?,
        narrow("day", local.weekday().to_sunday_one_offset())?,
        narrow("hour", local.hour())?,
        i16::try_from(offset).map_err(|_| ValueError::OutOfRange {
            field: "offset",
            min: -780,
            max: 780,
            actual: i64::from(offset),
        })?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(zone: &str) -> (String, String) {
        let config = timezone_config(zone, 2026, None, None).unwrap();
        assert_eq!(config.timezone, Some(TimezoneSetting::Rules));
        (
            config.dst.unwrap().to_string(),
            config.std.unwrap().to_string(),
        )
    }

    #[test]
    fn central_europe() {
        assert_eq!(
            rules("Europe/Berlin"),
            ("0,0,3,1,2,120".to_string(), "0,0,10,1,3,60".to_string())
        );
    }

    #[test]
    fn north_america_uses_week_numbers() {
        assert_eq!(
            rules("America/New_York"),
            ("0,2,3,1,2,-240".to_string(), "0,1,11,1,2,-300".to_string())
        );
    }

    #[test]
    fn southern_hemisphere() {
        assert_eq!(
            rules("Australia/Sydney"),
            ("1,1,10,1,2,660".to_string(), "1,1,4,1,3,600".to_string())
        );
    }

    #[test]
    fn fixed_offset_zones() {
        let tokyo = timezone_config("Asia/Tokyo", 2026, None, None).unwrap();
        assert_eq!(tokyo.timezone, Some(TimezoneSetting::Offset(540)));
        assert!(tokyo.dst.is_none() && tokyo.std.is_none());

        let utc = timezone_config("UTC", 2026, None, None).unwrap();
        assert_eq!(utc.timezone, Some(TimezoneSetting::Offset(0)));
    }

    #[test]
    fn coordinates_are_carried() {
        let config = timezone_config("Europe/Berlin", 2026, Some(53.643_775_3), Some(9.894_078_3)).unwrap();
        assert_eq!(config.latitude, Some(53.643_775_3));
        assert_eq!(config.longitude, Some(9.894_078_3));
    }

    #[test]
    fn unknown_zone() {
        assert!(matches!(
            timezone_config("Mars/Olympus_Mons", 2026, None, None),
            Err(ValueError::InvalidTimezone(_))
        ));
    }
}
