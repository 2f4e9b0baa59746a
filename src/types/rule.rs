// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of rule sets Tasmota provides.
pub const RULE_SET_COUNT: u8 = 3;

/// State of one rule set as reported by `Rule<n>`:
/// `{"State":"ON","Once":"OFF","StopOnError":"OFF","Length":42,"Free":469,"Rules":"ON ..."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RuleSet {
    /// Whether the rule set is enabled.
    #[serde(with = "on_off")]
    pub state: Option<bool>,
    /// Whether each rule fires only once until its trigger resets.
    #[serde(with = "on_off")]
    pub once: Option<bool>,
    /// Whether evaluation stops on the first error.
    #[serde(with = "on_off")]
    pub stop_on_error: Option<bool>,
    /// Length of the rule text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    /// The rule text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
}

mod on_off {
    use super::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub(super) fn serialize<S: Serializer>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(true) => serializer.serialize_str("ON"),
            Some(false) => serializer.serialize_str("OFF"),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.and_then(|s| match s.to_ascii_uppercase().as_str() {
            "ON" | "1" => Some(true),
            "OFF" | "0" => Some(false),
            _ => None,
        }))
    }
}
