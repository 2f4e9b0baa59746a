// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the fleet engine.
//!
//! Errors are split by scope. Anything tied to the shared bus connection
//! ([`ProtocolError`]) is fatal for the whole invocation. Failures scoped to a
//! single device never surface here: malformed payloads degrade one field to
//! unknown, and command timeouts or rejections are reported per device through
//! [`CommandOutcome`](crate::command::CommandOutcome).

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error occurred during value validation.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// The bus connection failed. Always fatal.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error occurred while parsing a payload.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Settings could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No persisted snapshot could be found.
    #[error("no device snapshot found in {}", directory.display())]
    SnapshotNotFound {
        /// Directory that was searched.
        directory: PathBuf,
    },

    /// A snapshot file could not be read or written.
    #[error("snapshot I/O failed for {}", path.display())]
    SnapshotIo {
        /// The file or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A snapshot could not be serialized.
    #[error("snapshot serialization failed for {}", path.display())]
    SnapshotFormat {
        /// The file involved.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The operation needs at least one device and none were found.
    #[error("no devices available for {0}")]
    NoDevices(String),
}

/// Errors related to value validation and constraints.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// A numeric value is outside the allowed range.
    #[error("{field} value {actual} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Name of the constrained field.
        field: &'static str,
        /// Minimum allowed value.
        min: i64,
        /// Maximum allowed value.
        max: i64,
        /// The actual value that was provided.
        actual: i64,
    },

    /// An invalid power state string was provided.
    #[error("invalid power state: {0}")]
    InvalidPowerState(String),

    /// A firmware version string has no numeric component.
    #[error("invalid firmware version: {0}")]
    InvalidVersion(String),

    /// A timezone name or rule could not be interpreted.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// A DST/STD rule string is malformed.
    #[error("invalid DST rule `{0}`: expected six comma separated integers")]
    InvalidDstRule(String),

    /// A timer definition is malformed.
    #[error("invalid timer: {0}")]
    InvalidTimer(String),
}

/// Errors related to the bus connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// MQTT connection or communication failed.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Connection to the broker failed or was lost.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid broker address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors related to decoding Tasmota payloads.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    /// Expected field is missing from the payload.
    #[error("missing field in payload: {0}")]
    MissingField(String),

    /// Unexpected payload or topic format.
    #[error("unexpected format: {0}")]
    UnexpectedFormat(String),

    /// Failed to parse a specific value.
    #[error("failed to parse {field}: {message}")]
    InvalidValue {
        /// The field that failed to parse.
        field: String,
        /// Description of the parsing failure.
        message: String,
    },
}

/// Errors raised while loading [`Settings`](crate::config::Settings).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file exists but could not be read.
    #[error("could not read configuration file {}", path.display())]
    Read {
        /// The configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file is not valid YAML.
    #[error("could not parse configuration file {}", path.display())]
    Yaml {
        /// The configuration file.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The merged layers do not form valid settings.
    #[error("invalid settings: {0}")]
    Invalid(#[source] serde_yaml::Error),

    /// A setting the operation needs has no value.
    #[error("required setting `{0}` is not set")]
    Missing(&'static str),

    /// An environment override has an unusable value.
    #[error("environment variable {key} has an invalid value")]
    Env {
        /// The offending variable.
        key: String,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
