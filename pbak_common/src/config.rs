// pbak_common is the main pbak library implementing the backup core logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::LocalError;

use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// The weekday tokens accepted by [`Settings::backup_schedule_days`],
/// in schedule order.
pub const DAY_TOKENS: [(&str, Weekday); 7] = [
    ("mon", Weekday::Mon),
    ("tue", Weekday::Tue),
    ("wed", Weekday::Wed),
    ("thu", Weekday::Thu),
    ("fri", Weekday::Fri),
    ("sat", Weekday::Sat),
    ("sun", Weekday::Sun),
];

/// A `Settings` contains the full configuration of the service:
/// client identity, retention windows, remote host parameters
/// and the backup schedule.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The name this client stores its backups under on the remote host.
    pub client_name: String,
    /// The directory read-only snapshots are created in.
    pub snapshot_dir: PathBuf,
    /// The file the symmetric encryption passphrase is read from.
    /// Must be owned by root with mode 0600.
    pub encryption_key_path: PathBuf,
    /// The SSH private key used to authenticate against the remote host.
    /// Must be owned by root with mode 0600.
    pub ssh_key_path: PathBuf,

    /// How many month directories to keep on the remote host.
    pub months_to_keep: u32,
    /// How many days incremental artifacts of the current month are kept.
    pub daily_incremental_days: u32,
    /// How many days local snapshots are kept once recorded as sent.
    /// Snapshots that were never sent are kept for double this window.
    pub local_snapshot_days: u32,

    /// The name of the remote host on the mesh VPN.
    pub unraid_tailscale_name: String,
    /// The user to authenticate as on the remote host.
    pub unraid_user: String,
    /// The directory on the remote host all clients store their backups under.
    pub unraid_base_path: String,
    /// The SSH port of the remote host.
    pub unraid_ssh_port: u16,
    /// Whether to resolve the remote host via the mesh VPN status.
    /// If unset, `unraid_tailscale_name` is used as a plain hostname.
    pub use_tailscale: bool,
    /// The deadline in seconds applied to every remote command.
    pub tailscale_timeout: u64,

    /// Whether scheduled backups are enabled.
    pub backup_schedule_enabled: bool,
    /// The local time scheduled backups start at, in 24-hour `HH:MM` format.
    pub backup_schedule_time: String,
    /// The weekdays scheduled backups run on, as a subset of
    /// `mon tue wed thu fri sat sun`.
    pub backup_schedule_days: Vec<String>,

    /// The mount point of the root subvolume (`@`).
    pub host_root: PathBuf,
    /// The mount point of the home subvolume (`@home`).
    pub host_home: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_name: "pbak-client".to_string(),
            snapshot_dir: PathBuf::from("/.snapshots"),
            encryption_key_path: Path::new(Settings::DATA_DIR).join("backup-encryption.key"),
            ssh_key_path: PathBuf::from("/root/.ssh/unraid_backup"),
            months_to_keep: 2,
            daily_incremental_days: 31,
            local_snapshot_days: 3,
            unraid_tailscale_name: String::new(),
            unraid_user: "root".to_string(),
            unraid_base_path: "/mnt/user/backups".to_string(),
            unraid_ssh_port: 22,
            use_tailscale: true,
            tailscale_timeout: 30,
            backup_schedule_enabled: true,
            backup_schedule_time: "02:00".to_string(),
            backup_schedule_days: DAY_TOKENS.iter().map(|(token, _)| token.to_string()).collect(),
            host_root: PathBuf::from("/"),
            host_home: PathBuf::from("/home"),
        }
    }
}

impl Settings {
    /// The data directory holding the settings file, the ledger database
    /// and the daemon log files.
    pub const DATA_DIR: &'static str = "/var/lib/pbak";
    /// The settings file of the current machine.
    pub const PATH: &'static str = "/var/lib/pbak/settings.json";

    /// Loads the settings file of the current machine,
    /// creating it with default values if it does not exist.
    pub fn load() -> Result<Self, LocalError> {
        if !Path::new(Self::PATH).exists() {
            let settings = Self::default();
            settings.save()?;
            return Ok(settings);
        }

        Self::load_from(Path::new(Self::PATH))
    }

    /// Loads and validates settings from the specified file.
    pub fn load_from(path: &Path) -> Result<Self, LocalError> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;

        let settings: Self = serde_json::from_str(&s)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Saves the settings to the settings file of the current machine.
    pub fn save(&self) -> Result<(), LocalError> {
        self.save_to(Path::new(Self::PATH))
    }

    /// Validates and saves the settings to the specified file.
    pub fn save_to(&self, path: &Path) -> Result<(), LocalError> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Checks the settings for internal consistency.
    pub fn validate(&self) -> Result<(), LocalError> {
        if self.client_name.is_empty() {
            return Err(LocalError::ConfigInvalid(
                "client_name must not be empty".to_string(),
            ));
        }
        if self.months_to_keep < 1 || self.months_to_keep > 24 {
            return Err(LocalError::ConfigInvalid(
                "months_to_keep must be between 1 and 24".to_string(),
            ));
        }
        if self.daily_incremental_days < 1 || self.daily_incremental_days > 365 {
            return Err(LocalError::ConfigInvalid(
                "daily_incremental_days must be between 1 and 365".to_string(),
            ));
        }
        if self.local_snapshot_days < 1 || self.local_snapshot_days > 30 {
            return Err(LocalError::ConfigInvalid(
                "local_snapshot_days must be between 1 and 30".to_string(),
            ));
        }

        self.schedule_time()?;
        self.schedule_days()?;

        Ok(())
    }

    /// Returns the configured subvolume bindings in backup order.
    pub fn subvolumes(&self) -> Vec<(String, PathBuf)> {
        vec![
            ("@".to_string(), self.host_root.clone()),
            ("@home".to_string(), self.host_home.clone()),
        ]
    }

    /// Returns the path of the ledger and history database.
    pub fn database_path(&self) -> PathBuf {
        Path::new(Self::DATA_DIR).join("pbak.db")
    }

    /// Returns the directory the daemon writes its log files to.
    pub fn log_dir(&self) -> PathBuf {
        Path::new(Self::DATA_DIR).join("logs")
    }

    /// Returns the remote directory all artifacts of this client live under.
    pub fn remote_client_dir(&self) -> String {
        format!("{}/{}", self.unraid_base_path, self.client_name)
    }

    /// Parses the configured schedule time.
    pub fn schedule_time(&self) -> Result<NaiveTime, LocalError> {
        NaiveTime::parse_from_str(&self.backup_schedule_time, "%H:%M").map_err(|_| {
            LocalError::ConfigInvalid(format!(
                "backup_schedule_time \"{}\" is not in HH:MM format",
                self.backup_schedule_time
            ))
        })
    }

    /// Parses the configured schedule weekdays, preserving order
    /// and removing duplicates.
    pub fn schedule_days(&self) -> Result<Vec<Weekday>, LocalError> {
        let mut days = Vec::new();

        for token in &self.backup_schedule_days {
            let day = DAY_TOKENS
                .iter()
                .find(|(name, _)| *name == token.as_str())
                .map(|(_, day)| *day)
                .ok_or_else(|| {
                    LocalError::ConfigInvalid(format!("unknown schedule day \"{}\"", token))
                })?;

            if !days.contains(&day) {
                days.push(day);
            }
        }

        Ok(days)
    }
}

/// Ensures that the specified secret file is inaccessible
/// to anyone but its owner.
pub fn check_secret_perms(path: &Path) -> Result<(), LocalError> {
    let metadata = fs::metadata(path)?;

    if metadata.permissions().mode() & 0o7077 > 0 {
        return Err(LocalError::InsecurePerms(path.to_path_buf()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn rejects_malformed_schedule_time() {
        let mut settings = Settings::default();
        settings.backup_schedule_time = "24:60".to_string();

        assert!(matches!(
            settings.validate(),
            Err(LocalError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_unknown_schedule_day() {
        let mut settings = Settings::default();
        settings.backup_schedule_days = vec!["mon".to_string(), "noday".to_string()];

        assert!(matches!(
            settings.validate(),
            Err(LocalError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_retention() {
        let mut settings = Settings::default();
        settings.months_to_keep = 0;

        assert!(matches!(
            settings.validate(),
            Err(LocalError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn schedule_days_deduplicate() {
        let mut settings = Settings::default();
        settings.backup_schedule_days =
            vec!["mon".to_string(), "mon".to_string(), "fri".to_string()];

        assert_eq!(
            settings.schedule_days().unwrap(),
            vec![Weekday::Mon, Weekday::Fri]
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.client_name = "testbox".to_string();
        settings.months_to_keep = 3;
        settings.save_to(&path).unwrap();

        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"client_name":"partial"}"#).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.client_name, "partial");
        assert_eq!(settings.months_to_keep, Settings::default().months_to_keep);
    }
}
