// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command dispatch with per-device acknowledgement tracking.
//!
//! Commands are published on `cmnd/<topic>/<Command>`. Tasmota answers on
//! `stat/<topic>/RESULT`, or on `stat/<topic>/<COMMAND>` when `SetOption4` is
//! enabled, where indexed commands report under their base name (`Timer1`
//! answers on `stat/<topic>/TIMER`).
//!
//! | Payload shape | Commands | Example |
//! |---------------|----------|---------|
//! | space list | most | `Backlog Power1 ON` |
//! | comma list | `TimeDST`, `TimeSTD` | `0,0,3,1,2,120` |
//! | JSON | `Timer<n>` | `{"Enable":1,"Time":"22:00"}` |
//! | empty | any query | `TelePeriod` |
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use tasmota_fleet::bus::{MemoryBus, Message};
//! use tasmota_fleet::command::{Command, CommandDispatcher, CommandOutcome, CommandRequest};
//! use tasmota_fleet::topic::TopicLayout;
//! use tasmota_fleet::types::DeviceId;
//!
//! # async fn example() -> tasmota_fleet::Result<()> {
//! let bus = MemoryBus::new();
//! bus.respond("cmnd/plugA/TelePeriod", Duration::ZERO, |_| {
//!     vec![Message::new("stat/plugA/RESULT", r#"{"TelePeriod":300}"#, false)]
//! });
//!
//! let dispatcher = CommandDispatcher::new(&bus, TopicLayout::default(), Duration::from_secs(2));
//! let request = CommandRequest::new(vec!["plugA".into()], Command::query("TelePeriod"));
//! let results = dispatcher.send(&request).await?;
//!
//! assert_eq!(results[&DeviceId::new("plugA")].outcome, CommandOutcome::Success);
//! # Ok(())
//! # }
//! ```

mod dispatcher;
mod payload;

pub use dispatcher::CommandDispatcher;
pub use payload::{Command, CommandValue, PayloadShape};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::DeviceId;

/// The same command for one or more devices.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Devices to address.
    pub targets: Vec<DeviceId>,
    /// The command.
    pub command: Command,
    /// Overrides the dispatcher's default acknowledgement timeout.
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    /// Creates a request using the default timeout.
    #[must_use]
    pub fn new(targets: Vec<DeviceId>, command: Command) -> Self {
        Self {
            targets,
            command,
            timeout: None,
        }
    }

    /// Sets the acknowledgement timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An ordered list of `(device, command)` pairs sharing one deadline.
///
/// Commands are published in plan order; per device, that order is what the
/// device executes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchPlan {
    /// Commands in publish order.
    pub steps: Vec<(DeviceId, Command)>,
    /// Overrides the dispatcher's default acknowledgement timeout.
    pub timeout: Option<Duration>,
}

impl DispatchPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one command.
    pub fn push(&mut self, device: DeviceId, command: Command) {
        self.steps.push((device, command));
    }

    /// Sets the acknowledgement timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the plan has no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl From<&CommandRequest> for DispatchPlan {
    fn from(request: &CommandRequest) -> Self {
        Self {
            steps: request
                .targets
                .iter()
                .map(|device| (device.clone(), request.command.clone()))
                .collect(),
            timeout: request.timeout,
        }
    }
}

/// How a single command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The device acknowledged the command.
    Success,
    /// No acknowledgement arrived before the deadline.
    Timeout,
    /// The device answered that it cannot execute the command.
    Rejected(String),
    /// Dry run: the command was not published.
    WouldSend,
}

impl CommandOutcome {
    /// Returns true for [`CommandOutcome::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Timeout => f.write_str("timeout"),
            Self::Rejected(reason) => write!(f, "rejected ({reason})"),
            Self::WouldSend => f.write_str("would send"),
        }
    }
}

/// Result of one command on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The addressed device.
    pub device: DeviceId,
    /// Command name.
    pub command: String,
    /// Payload that was (or would have been) published.
    pub payload: String,
    /// How it ended.
    pub outcome: CommandOutcome,
    /// The acknowledgement payload, if one arrived.
    pub response: Option<String>,
}

impl CommandResult {
    /// Parses the acknowledgement as a JSON object.
    #[must_use]
    pub fn response_json(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        match serde_json::from_str(self.response.as_deref()?) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}
