// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `tasmota_fleet` - Discover and command fleets of Tasmota devices.
//!
//! Tasmota devices publish their discovery config and their last will
//! (`LWT`) as retained MQTT messages. Subscribing to those subtrees makes the
//! broker replay the state of the whole fleet, which this crate turns into a
//! device registry and then drives bulk commands against.
//!
//! # Supported Features
//!
//! - **Discovery**: time-bounded collection of retained state into one
//!   snapshot per device
//! - **Online filtering**: LWT tokens, shutdown STATE reports and an optional
//!   freshness bound
//! - **Bulk commands**: one command to many devices or many commands to one,
//!   with per-device acknowledgement and a shared deadline
//! - **Fleet workflows**: firmware upgrades, timezone reconciliation, LWT
//!   triggering and settings refresh
//! - **Snapshots**: timestamped JSON files for offline inspection
//!
//! # Quick Start
//!
//! ```no_run
//! use tasmota_fleet::bus::MqttBus;
//! use tasmota_fleet::command::Command;
//! use tasmota_fleet::fleet::{Fleet, FleetOptions};
//!
//! #[tokio::main]
//! async fn main() -> tasmota_fleet::Result<()> {
//!     let bus = MqttBus::builder()
//!         .host("192.168.1.50")
//!         .credentials("user", "password")
//!         .build()
//!         .await?;
//!
//!     let fleet = Fleet::new(&bus, FleetOptions::default());
//!     let snapshot = fleet.list_tasmotas().await?;
//!     let online = fleet.list_online(&snapshot);
//!
//!     for result in fleet.send_cmd(&online, &Command::query("TelePeriod"), false).await? {
//!         println!("{}: {}", result.device, result.outcome);
//!     }
//!
//!     bus.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Offline use
//!
//! [`bus::MemoryBus`] implements the same [`bus::MessageBus`] trait without a
//! broker. It is what the tests run against and what dry runs can use.

pub mod bus;
pub mod collector;
pub mod command;
pub mod config;
pub mod error;
pub mod fleet;
pub mod registry;
pub mod telemetry;
pub mod topic;
pub mod types;

pub use error::{ConfigError, Error, ParseError, ProtocolError, Result, ValueError};
