// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `tasmota-fleet`: discover and command Tasmota devices from the shell.
//!
//! Settings come from `config.yaml`, `config.local.yaml` and
//! `TASMOTA_FLEET__*` variables (see [`tasmota_fleet::config`]); the flags
//! below override them. Logging is configured with `TASMOTA_FLEET_LOG`, a
//! `tracing` target list such as `info` or `tasmota_fleet=debug`.
//!
//! ```bash
//! tasmota-fleet --host 192.168.1.50 list-online
//! tasmota-fleet send-cmd --command Power --values TOGGLE --dry-run
//! tasmota-fleet upgrade-online --target 14.2.0
//! tasmota-fleet update-from-file --dir ./snapshots
//! ```

use std::error::Error as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser as _;
use tasmota_fleet::bus::{MessageBus, MqttBus};
use tasmota_fleet::command::{Command, CommandResult, CommandValue};
use tasmota_fleet::config::Settings;
use tasmota_fleet::fleet::{self, Discovery, Fleet, UpgradeDecision};
use tasmota_fleet::registry::{self, RegistrySnapshot};
use tasmota_fleet::types::FirmwareVersion;
use tasmota_fleet::{ConfigError, Error, Result, ValueError};
use tracing_subscriber::filter::{LevelFilter, targets::Targets};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_ENV: &str = "TASMOTA_FLEET_LOG";

#[derive(clap::Parser)]
#[command(version, about)]
struct Cli {
    /// MQTT broker host.
    #[arg(long, global = true)]
    host: Option<String>,
    /// MQTT broker port.
    #[arg(long, global = true)]
    port: Option<u16>,
    /// MQTT user name.
    #[arg(long, global = true)]
    username: Option<String>,
    /// MQTT password.
    #[arg(long, global = true, env = "TASMOTA_FLEET_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Acknowledgement timeout in milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// Write a snapshot after discovery.
    #[arg(long, global = true)]
    save: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Count and list the retained messages under the discovery filters.
    ListRetained {
        /// Receive window in seconds.
        #[arg(long)]
        grace_s: Option<u64>,
        /// Include topics under the noise prefixes.
        #[arg(long)]
        noisy: bool,
    },
    /// Build the device list from retained state.
    ListTasmotas {
        /// Also list collected topics that are not part of any device.
        #[arg(long)]
        noisy: bool,
    },
    /// List the devices that are online.
    ListOnline,
    /// Send one command to every online device.
    SendCmd {
        /// Command name, e.g. `Power`.
        #[arg(long)]
        command: String,
        /// Arguments, e.g. `TOGGLE`.
        #[arg(long, num_args = 0..)]
        values: Vec<String>,
        /// Report what would be sent without publishing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Upgrade online devices running firmware older than the target.
    UpgradeOnline {
        /// Target version; defaults to `firmware.target`.
        #[arg(long)]
        target: Option<String>,
        /// Report what would be sent without publishing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Republish the online LWT for devices that look offline.
    TriggerLwt,
    /// Load the newest snapshot file.
    ReadFromFile {
        /// Snapshot directory; defaults to `snapshot.directory`.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// IANA zone used to display the snapshot time.
        #[arg(long)]
        timezone: Option<String>,
    },
    /// Align timezone, DST rules and location of online devices.
    EnsureTimezone {
        /// IANA zone; defaults to `timezone.zone`.
        #[arg(long)]
        zone: Option<String>,
        /// Report what would be sent without publishing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Query the settings of online devices and write a snapshot.
    RefreshSettings,
    /// Refresh the devices of the newest snapshot that are still online,
    /// report what changed and write a new snapshot.
    UpdateFromFile {
        /// Snapshot directory; defaults to `snapshot.directory`.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn init_logging() {
    let targets = match std::env::var(LOG_ENV) {
        Ok(description) => description.parse::<Targets>().unwrap_or_else(|e| {
            eprintln!("warning: ignoring {LOG_ENV}: {e}");
            Targets::new().with_default(LevelFilter::INFO)
        }),
        Err(_) => Targets::new().with_default(LevelFilter::INFO),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(targets)
        .init();
}

fn end(result: Result<()>) -> ! {
    std::process::exit(match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    end(run(cli).await);
}

fn settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load()?;
    if let Some(host) = &cli.host {
        settings.mqtt.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.mqtt.port = port;
    }
    if let Some(username) = &cli.username {
        settings.mqtt.username = Some(username.clone());
    }
    if let Some(password) = &cli.password {
        settings.mqtt.password = Some(password.clone());
    }
    if let Some(timeout) = cli.timeout_ms {
        settings.commands.timeout_ms = timeout;
    }
    if cli.save {
        settings.snapshot.save_after_discovery = true;
    }
    Ok(settings)
}

async fn run(cli: Cli) -> Result<()> {
    let settings = settings(&cli)?;

    if let Commands::ReadFromFile { dir, timezone } = &cli.command {
        let dir = dir.as_ref().unwrap_or(&settings.snapshot.directory);
        let zone = timezone.as_deref().unwrap_or(&settings.timezone.zone);
        return read_from_file(dir, zone);
    }

    let bus = settings.mqtt_builder().build().await?;
    let result = run_on_bus(&bus, &settings, cli.command).await;
    if let Err(e) = bus.disconnect().await {
        tracing::debug!(error = %e, "Disconnect failed");
    }
    result
}

async fn run_on_bus(bus: &MqttBus, settings: &Settings, command: Commands) -> Result<()> {
    let fleet = Fleet::new(bus, settings.fleet_options());

    match command {
        Commands::ListRetained { grace_s, noisy } => {
            let collected = fleet.list_retained(grace_s.map(Duration::from_secs)).await?;
            let noise = &fleet.options().noise;
            let topics: Vec<&str> = collected
                .iter()
                .map(|m| m.topic.as_str())
                .filter(|topic| noisy || !noise.is_noisy(topic))
                .collect();
            println!(
                "Retained messages matching {:?}: {}",
                fleet.options().discovery_filters(),
                topics.len()
            );
            for topic in topics {
                println!("- {topic}");
            }
        }
        Commands::ListTasmotas { noisy } => {
            let discovery = discover(&fleet, settings).await?;
            println!("Found {} tasmota devices", discovery.snapshot.len());
            for device in discovery.snapshot.iter() {
                println!(
                    "- {} ({}) firmware={}",
                    device.display_name(),
                    device.id,
                    device.firmware.as_deref().unwrap_or("?")
                );
            }
            if noisy {
                println!("Not part of any device: {}", discovery.noisy.len());
                for topic in &discovery.noisy {
                    println!("- {} [{}]", topic.topic, topic.reason);
                }
            }
        }
        Commands::ListOnline => {
            let snapshot = discover(&fleet, settings).await?.snapshot;
            let online = fleet.list_online(&snapshot);
            println!("Online devices: {} / {}", online.len(), snapshot.len());
            for device in &online {
                println!(
                    "- {} online={}",
                    device.display_name(),
                    device.lwt.as_deref().unwrap_or("?")
                );
            }
        }
        Commands::SendCmd {
            command,
            values,
            dry_run,
        } => {
            let command = Command::new(
                command,
                values.iter().map(String::as_str).map(CommandValue::parse_arg).collect(),
            );
            let snapshot = discover(&fleet, settings).await?.snapshot;
            let online = fleet.list_online(&snapshot);
            print_results(&fleet.send_cmd(&online, &command, dry_run).await?);
        }
        Commands::UpgradeOnline { target, dry_run } => {
            let target = match target {
                Some(raw) => raw.parse::<FirmwareVersion>()?,
                None => settings
                    .target_firmware()?
                    .ok_or(ConfigError::Missing("firmware.target"))?,
            };
            let snapshot = discover(&fleet, settings).await?.snapshot;
            let devices: Vec<_> = snapshot.iter().cloned().collect();
            for report in fleet.ensure_freshest_firmware(&devices, &target, dry_run).await? {
                let installed = report.installed.as_deref().unwrap_or("?");
                match report.decision {
                    UpgradeDecision::Upgrade(result) => {
                        println!("- {} {installed} -> {target}: {}", report.device, result.outcome);
                    }
                    UpgradeDecision::Skipped(reason) => {
                        println!("- {} {installed}: skipped, {reason}", report.device);
                    }
                }
            }
        }
        Commands::TriggerLwt => {
            let snapshot = discover(&fleet, settings).await?.snapshot;
            let offline = registry::filter_offline(&snapshot);
            let triggered = fleet.trigger_lwt_for_offline(&offline).await?;
            println!("Triggered LWT for {} offline devices", triggered.len());
            for id in triggered {
                println!("- {id}");
            }
        }
        Commands::EnsureTimezone { zone, dry_run } => {
            let mut tz = settings.timezone.clone();
            if let Some(zone) = zone {
                tz.zone = zone;
            }
            let desired = fleet::timezone_config(
                &tz.zone,
                fleet::current_year(),
                tz.latitude,
                tz.longitude,
            )?;
            let mut snapshot = discover(&fleet, settings).await?.snapshot;
            let online = fleet.list_online(&snapshot);
            let report = fleet
                .ensure_correct_timezone_settings(&online, &desired, dry_run)
                .await?;
            print_results(&report.results);
            if !dry_run && settings.snapshot.save_after_discovery {
                snapshot.update(report.devices);
                registry::persist(&snapshot, &settings.snapshot.directory)?;
            }
        }
        Commands::RefreshSettings => {
            let mut snapshot = discover(&fleet, settings).await?.snapshot;
            let online = fleet.list_online(&snapshot);
            let report = fleet.refresh_settings(&online).await?;
            let answered = report.results.iter().filter(|r| r.outcome.is_success()).count();
            println!(
                "Refreshed {} devices ({answered}/{} queries answered)",
                online.len(),
                report.results.len()
            );
            snapshot.update(report.devices);
            let path = registry::persist(&snapshot, &settings.snapshot.directory)?;
            println!("Snapshot written to {}", path.display());
        }
        Commands::UpdateFromFile { dir } => {
            let dir = dir.unwrap_or_else(|| settings.snapshot.directory.clone());
            let stored = registry::load_latest(&dir)?;
            let update = fleet.update_snapshot(&stored).await?;
            println!(
                "Updated {} of {} stored devices",
                update.snapshot.len(),
                stored.len()
            );
            for change in &update.changes {
                println!("- {} changed: {}", change.device, change.fields.join(", "));
            }
            for id in &update.dropped {
                println!("- {id} dropped, not online");
            }
            let path = registry::persist(&update.snapshot, &dir)?;
            println!("Snapshot written to {}", path.display());
        }
        Commands::ReadFromFile { .. } => {}
    }
    Ok(())
}

async fn discover<B: MessageBus>(fleet: &Fleet<'_, B>, settings: &Settings) -> Result<Discovery> {
    let discovery = fleet.discover().await?;
    if settings.snapshot.save_after_discovery {
        registry::persist(&discovery.snapshot, &settings.snapshot.directory)?;
    }
    Ok(discovery)
}

fn read_from_file(dir: &Path, zone: &str) -> Result<()> {
    let snapshot: RegistrySnapshot = registry::load_latest(dir)?;
    let tz = jiff::tz::TimeZone::get(zone)
        .map_err(|e| ValueError::InvalidTimezone(format!("{zone}: {e}")))?;
    let taken_at = jiff::Timestamp::from_millisecond(snapshot.taken_at.timestamp_millis())
        .map_err(|e| Error::Value(ValueError::InvalidTimezone(e.to_string())))?
        .to_zoned(tz);

    println!(
        "Loaded {} tasmota devices from snapshot taken {}",
        snapshot.len(),
        taken_at.strftime("%Y-%m-%d %H:%M:%S %Z")
    );
    for device in snapshot.iter() {
        println!(
            "- {} ({}) {}",
            device.display_name(),
            device.id,
            if device.is_online() { "online" } else { "offline" }
        );
    }
    Ok(())
}

fn print_results(results: &[CommandResult]) {
    let succeeded = results.iter().filter(|r| r.outcome.is_success()).count();
    println!("Commands: {} sent, {succeeded} acknowledged", results.len());
    for result in results {
        match &result.response {
            Some(response) => println!(
                "- {} {} {}: {} {response}",
                result.device, result.command, result.payload, result.outcome
            ),
            None => println!(
                "- {} {} {}: {}",
                result.device, result.command, result.payload, result.outcome
            ),
        }
    }
}
