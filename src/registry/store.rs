// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Snapshot files.
//!
//! Files are named `tasmota_devices_<UTC stamp>_<seq>.json`. The stamp has
//! millisecond precision and the sequence number disambiguates files written
//! within the same millisecond. Files are ordered by stamp, then by the
//! sequence number read as a number, so `_1000` sorts after `_999`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeviceSnapshot, RegistrySnapshot};
use crate::error::{Error, Result};

/// Current snapshot file format.
pub const FORMAT_VERSION: u32 = 1;

const FILE_PREFIX: &str = "tasmota_devices_";
const FILE_SUFFIX: &str = ".json";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

#[derive(Serialize)]
struct SnapshotFileRef<'a> {
    format_version: u32,
    taken_at: DateTime<Utc>,
    devices: Vec<&'a DeviceSnapshot>,
}

#[derive(Deserialize)]
struct SnapshotFile {
    format_version: u32,
    taken_at: DateTime<Utc>,
    devices: Vec<DeviceSnapshot>,
}

/// Writes `snapshot` into `dir`, creating the directory if needed, and
/// returns the path of the new file.
///
/// Devices are written sorted by id.
///
/// # Errors
///
/// Returns [`Error::SnapshotIo`] if the directory or file cannot be written
/// and [`Error::SnapshotFormat`] if serialization fails.
pub fn persist(snapshot: &RegistrySnapshot, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|source| Error::SnapshotIo {
        path: dir.to_path_buf(),
        source,
    })?;

    let stamp = Utc::now().format(STAMP_FORMAT).to_string();
    let mut seq = next_sequence(dir, &stamp)?;

    let body = SnapshotFileRef {
        format_version: FORMAT_VERSION,
        taken_at: snapshot.taken_at,
        devices: snapshot.devices.values().collect(),
    };

    loop {
        let path = dir.join(format!("{FILE_PREFIX}{stamp}_{seq:03}{FILE_SUFFIX}"));
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                seq += 1;
                continue;
            }
            Err(source) => return Err(Error::SnapshotIo { path, source }),
        };

        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &body).map_err(|source| {
            Error::SnapshotFormat {
                path: path.clone(),
                source,
            }
        })?;
        writer
            .write_all(b"\n")
            .and_then(|()| writer.flush())
            .map_err(|source| Error::SnapshotIo {
                path: path.clone(),
                source,
            })?;

        tracing::info!(
            path = %path.display(),
            devices = snapshot.devices.len(),
            "Snapshot written"
        );
        return Ok(path);
    }
}

/// Loads the newest snapshot in `dir` that parses.
///
/// Unreadable or malformed files are skipped with a warning.
///
/// # Errors
///
/// Returns [`Error::SnapshotNotFound`] if the directory is missing or holds
/// no usable snapshot, and [`Error::SnapshotIo`] if it cannot be listed.
pub fn load_latest(dir: &Path) -> Result<RegistrySnapshot> {
    let not_found = || Error::SnapshotNotFound {
        directory: dir.to_path_buf(),
    };

    let mut names = match snapshot_names(dir) {
        Ok(names) => names,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
        Err(source) => {
            return Err(Error::SnapshotIo {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    names.sort_unstable_by(|a, b| write_order(b).cmp(&write_order(a)));

    for name in names {
        let path = dir.join(&name);
        match read_snapshot(&path) {
            Ok(snapshot) => {
                tracing::debug!(
                    path = %path.display(),
                    devices = snapshot.devices.len(),
                    "Snapshot loaded"
                );
                return Ok(snapshot);
            }
            Err(reason) => {
                tracing::warn!(path = %path.display(), %reason, "Skipping unusable snapshot");
            }
        }
    }

    Err(not_found())
}

fn read_snapshot(path: &Path) -> std::result::Result<RegistrySnapshot, String> {
    let data = fs::read(path).map_err(|e| e.to_string())?;
    let file: SnapshotFile = serde_json::from_slice(&data).map_err(|e| e.to_string())?;
    if file.format_version != FORMAT_VERSION {
        return Err(format!("unsupported format version {}", file.format_version));
    }

    Ok(RegistrySnapshot {
        taken_at: file.taken_at,
        devices: file
            .devices
            .into_iter()
            .map(|device| (device.id.clone(), device))
            .collect(),
    })
}

fn snapshot_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
            names.push(name);
        }
    }
    Ok(names)
}

/// Sort key of a snapshot file name: stamp, then numeric sequence. Names
/// without a readable sequence sort before numbered ones of the same stamp.
fn write_order(name: &str) -> (&str, Option<u64>) {
    let stem = name
        .strip_prefix(FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
        .unwrap_or(name);
    match stem.rsplit_once('_') {
        Some((stamp, seq)) => (stamp, seq.parse().ok()),
        None => (stem, None),
    }
}

fn next_sequence(dir: &Path, stamp: &str) -> Result<u32> {
    let prefix = format!("{FILE_PREFIX}{stamp}_");
    let names = snapshot_names(dir).map_err(|source| Error::SnapshotIo {
        path: dir.to_path_buf(),
        source,
    })?;

    Ok(names
        .iter()
        .filter_map(|name| {
            name.strip_prefix(&prefix)?
                .strip_suffix(FILE_SUFFIX)?
                .parse::<u32>()
                .ok()
        })
        .max()
        .map_or(0, |max| max + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;

    fn snapshot(ids: &[&str]) -> RegistrySnapshot {
        RegistrySnapshot {
            taken_at: Utc::now(),
            devices: ids
                .iter()
                .map(|id| (DeviceId::new(*id), DeviceSnapshot::new(DeviceId::new(*id))))
                .collect(),
        }
    }

    #[test]
    fn empty_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_latest(dir.path()),
            Err(Error::SnapshotNotFound { .. })
        ));
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_latest(&dir.path().join("absent")),
            Err(Error::SnapshotNotFound { .. })
        ));
    }

    #[test]
    fn persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let original = snapshot(&["plugB", "plugA"]);
        let path = persist(&original, dir.path()).unwrap();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("tasmota_devices_"));
        assert!(name.ends_with("_000.json"));

        let loaded = load_latest(dir.path()).unwrap();
        assert_eq!(loaded, original);

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["format_version"], 1);
        assert_eq!(raw["devices"][0]["id"], "plugA");
    }

    #[test]
    fn names_are_monotonic_and_latest_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = persist(&snapshot(&["a"]), dir.path()).unwrap();
        let second = persist(&snapshot(&["a", "b"]), dir.path()).unwrap();
        assert!(second.file_name() > first.file_name());

        assert_eq!(load_latest(dir.path()).unwrap().devices.len(), 2);
    }

    #[test]
    fn corrupt_newest_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        persist(&snapshot(&["a"]), dir.path()).unwrap();
        fs::write(
            dir.path().join("tasmota_devices_99991231T235959999Z_000.json"),
            "{ not json",
        )
        .unwrap();

        assert_eq!(load_latest(dir.path()).unwrap().devices.len(), 1);
    }

    #[test]
    fn sequence_past_999_is_newest() {
        let dir = tempfile::tempdir().unwrap();
        persist(&snapshot(&["a"]), dir.path()).unwrap();
        let body = |ids: &[&str]| {
            let devices: Vec<_> = ids.iter().map(|id| DeviceSnapshot::new(DeviceId::new(*id))).collect();
            serde_json::json!({
                "format_version": FORMAT_VERSION,
                "taken_at": Utc::now(),
                "devices": devices,
            })
            .to_string()
        };
        let stamp = "99991231T235959999Z";
        fs::write(
            dir.path().join(format!("tasmota_devices_{stamp}_999.json")),
            body(&["a", "b"]),
        )
        .unwrap();
        fs::write(
            dir.path().join(format!("tasmota_devices_{stamp}_1000.json")),
            body(&["a", "b", "c"]),
        )
        .unwrap();

        assert_eq!(load_latest(dir.path()).unwrap().devices.len(), 3);
        assert_eq!(next_sequence(dir.path(), stamp).unwrap(), 1001);
    }

    #[test]
    fn unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.json"), "{}").unwrap();
        assert!(matches!(
            load_latest(dir.path()),
            Err(Error::SnapshotNotFound { .. })
        ));
    }
}
