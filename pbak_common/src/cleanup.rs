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

use crate::config::Settings;
use crate::ledger::Ledger;
use crate::remote::RemoteExec;
use crate::snapshot::SnapshotManager;
use crate::EngineError;

use chrono::{Duration, Local, Utc};
use log::{debug, info, warn};

/// How old an unledgered remote artifact must be before the orphan
/// sweep may delete it. Protects in-flight uploads of another process
/// instance from being swept away.
const ORPHAN_SAFETY_WINDOW_SECS: i64 = 3600;

/// The outcome of an orphan sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OrphanSweep {
    /// How many remote artifacts were not referenced by the ledger.
    pub orphans: usize,
    /// How many of them were old enough to be deleted.
    pub deleted: usize,
}

/// The outcome of a monthly purge.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MonthlyPurge {
    /// How many month directories exist on the remote host.
    pub total_months: usize,
    /// The month directories that were deleted, oldest first.
    pub deleted_months: Vec<String>,
    /// How many ledger rows were removed along with them.
    pub ledger_rows: usize,
}

/// The outcome of an incremental purge.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IncrementalPurge {
    /// How many ledger rows were removed.
    pub ledger_rows: usize,
}

/// Reports whether a directory entry is a remote month directory.
/// Month directory names are exactly six ASCII digits.
pub(crate) fn is_month_name(name: &str) -> bool {
    name.len() == 6 && name.bytes().all(|b| b.is_ascii_digit())
}

/// A `CleanupManager` prunes failed-upload orphans, expired monthly
/// chains, expired incrementals and aged local snapshots, in that
/// dependency order. All of its failures are logged by the caller
/// and never fail a backup run.
pub struct CleanupManager<'a> {
    settings: &'a Settings,
    remote: &'a dyn RemoteExec,
    ledger: &'a Ledger,
    snapshots: &'a SnapshotManager,
}

impl<'a> CleanupManager<'a> {
    /// Returns a new `CleanupManager` over the provided collaborators.
    pub fn new(
        settings: &'a Settings,
        remote: &'a dyn RemoteExec,
        ledger: &'a Ledger,
        snapshots: &'a SnapshotManager,
    ) -> Self {
        Self {
            settings,
            remote,
            ledger,
            snapshots,
        }
    }

    /// Deletes remote artifacts that are not referenced by the ledger
    /// and older than the safety window. Runs before any new upload so
    /// that stale bytes never collide with new artifact names.
    pub fn sweep_orphans(&self, host: &str) -> Result<OrphanSweep, EngineError> {
        let base = self.settings.remote_client_dir();

        let output = self.remote.exec_checked(
            host,
            &format!(
                "find '{}' -name '*.btrfs.gpg' -type f 2>/dev/null || true",
                base
            ),
        )?;

        let known = self.ledger.remote_paths()?;
        let now = Utc::now().timestamp();

        let mut sweep = OrphanSweep::default();

        for file in output.stdout_text().lines().filter(|l| !l.is_empty()) {
            if known.contains(file) {
                continue;
            }

            sweep.orphans += 1;

            let mtime = match self
                .remote
                .exec_checked(host, &format!("stat -c %Y '{}'", file))
            {
                Ok(output) => match output.stdout_text().parse::<i64>() {
                    Ok(mtime) => mtime,
                    Err(_) => {
                        warn!("unreadable modification time for orphan {}", file);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("unable to stat orphan {}: {}", file, e);
                    continue;
                }
            };

            if now - mtime <= ORPHAN_SAFETY_WINDOW_SECS {
                debug!("keeping recent orphan {} (may be in flight)", file);
                continue;
            }

            match self.remote.remove_file(host, file) {
                Ok(()) => {
                    info!("deleted orphaned artifact {}", file);
                    sweep.deleted += 1;
                }
                Err(e) => warn!("unable to delete orphan {}: {}", file, e),
            }
        }

        Ok(sweep)
    }

    /// Deletes the oldest remote month directories beyond the retention
    /// count, removing their ledger rows first so the ledger never points
    /// at a deleted directory.
    pub fn purge_months(&self, host: &str) -> Result<MonthlyPurge, EngineError> {
        let base = self.settings.remote_client_dir();

        let output = self
            .remote
            .exec_checked(host, &format!("ls -1 '{}' 2>/dev/null || true", base))?;

        let listing = output.stdout_text();
        let mut months: Vec<&str> = listing
            .lines()
            .filter(|name| is_month_name(name))
            .collect();
        months.sort_unstable();
        months.reverse();

        let mut purge = MonthlyPurge {
            total_months: months.len(),
            ..MonthlyPurge::default()
        };

        for month in months.iter().skip(self.settings.months_to_keep as usize) {
            let dir = format!("{}/{}", base, month);

            purge.ledger_rows += self.ledger.delete_under(&dir)?;

            match self
                .remote
                .exec_checked(host, &format!("rm -rf '{}'", dir))
            {
                Ok(_) => {
                    info!("deleted expired month directory {}", dir);
                    purge.deleted_months.push(month.to_string());
                }
                Err(e) => warn!("unable to delete month directory {}: {}", dir, e),
            }
        }

        purge.deleted_months.reverse();
        Ok(purge)
    }

    /// Deletes incremental artifacts of the current month older than the
    /// configured window, along with their ledger rows. Full artifacts
    /// are never touched here.
    pub fn purge_incrementals(&self, host: &str) -> Result<IncrementalPurge, EngineError> {
        let days = self.settings.daily_incremental_days;
        let dir = format!(
            "{}/{}/incremental",
            self.settings.remote_client_dir(),
            Local::now().format("%Y%m")
        );

        self.remote.exec_checked(
            host,
            &format!(
                "find '{}' -name '*.btrfs.gpg' -mtime +{} -delete 2>/dev/null || true",
                dir, days
            ),
        )?;

        let cutoff = Local::now().naive_local() - Duration::days(i64::from(days));
        let ledger_rows = self.ledger.delete_incremental_before(cutoff)?;

        Ok(IncrementalPurge { ledger_rows })
    }

    /// Ages out local snapshots, returning the number of deleted
    /// snapshots. See [`SnapshotManager::age_out`] for the rules.
    pub fn age_local_snapshots(&self) -> Result<usize, EngineError> {
        self.snapshots
            .age_out(self.ledger, self.settings.local_snapshot_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ledger::SentRow;
    use crate::remote::testing::RemoteScript;
    use crate::report::BackupKind;

    use std::path::PathBuf;

    use chrono::NaiveDateTime;

    const HOST: &str = "100.64.0.7";

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.client_name = "box".to_string();
        settings.unraid_base_path = "/backups".to_string();
        settings.months_to_keep = 2;
        settings
    }

    fn manager_parts() -> (Settings, Ledger, SnapshotManager) {
        (
            settings(),
            Ledger::open_in_memory().unwrap(),
            SnapshotManager::new(PathBuf::from("/nonexistent"), Vec::new()),
        )
    }

    fn sent(remote_path: &str) -> SentRow {
        SentRow {
            snapshot_path: format!("/.snapshots{}", remote_path),
            remote_path: remote_path.to_string(),
            sent_at: NaiveDateTime::parse_from_str("2026-07-07 02:00:00", "%Y-%m-%d %H:%M:%S")
                .unwrap(),
            size_bytes: 1,
            kind: BackupKind::Full,
            parent: None,
        }
    }

    #[test]
    fn month_names_are_six_digits() {
        assert!(is_month_name("202607"));
        assert!(!is_month_name("2026"));
        assert!(!is_month_name("2026-07"));
        assert!(!is_month_name("full"));
    }

    #[test]
    fn orphan_sweep_respects_ledger_and_safety_window() {
        let (settings, ledger, snapshots) = manager_parts();

        let ledgered = "/backups/box/202607/full/@_20260707_full.btrfs.gpg";
        let recent = "/backups/box/202607/full/@home_20260801_full.btrfs.gpg";
        let stale = "/backups/box/202607/incremental/@_20260708_incremental.btrfs.gpg";
        ledger.record(&sent(ledgered)).unwrap();

        let now = Utc::now().timestamp();
        let script = RemoteScript::new()
            .expect_exec(
                "find '/backups/box' -name '*.btrfs.gpg' -type f 2>/dev/null || true",
                0,
                &format!("{}\n{}\n{}\n", ledgered, recent, stale),
            )
            .expect_exec(
                &format!("stat -c %Y '{}'", recent),
                0,
                &format!("{}\n", now - 60),
            )
            .expect_exec(&format!("stat -c %Y '{}'", stale), 0, "1000000\n")
            .expect_exec(&format!("rm -f '{}'", stale), 0, "");

        let cleanup = CleanupManager::new(&settings, &script, &ledger, &snapshots);
        let sweep = cleanup.sweep_orphans(HOST).unwrap();

        assert_eq!(sweep, OrphanSweep { orphans: 2, deleted: 1 });
        script.finish();
    }

    #[test]
    fn monthly_purge_deletes_oldest_beyond_retention() {
        let (settings, ledger, snapshots) = manager_parts();

        ledger
            .record(&sent("/backups/box/202605/full/@_20260507_full.btrfs.gpg"))
            .unwrap();
        ledger
            .record(&sent("/backups/box/202607/full/@_20260707_full.btrfs.gpg"))
            .unwrap();

        let script = RemoteScript::new()
            .expect_exec(
                "ls -1 '/backups/box' 2>/dev/null || true",
                0,
                "202605\n202606\n202607\nstray\n",
            )
            .expect_exec("rm -rf '/backups/box/202605'", 0, "");

        let cleanup = CleanupManager::new(&settings, &script, &ledger, &snapshots);
        let purge = cleanup.purge_months(HOST).unwrap();

        assert_eq!(purge.total_months, 3);
        assert_eq!(purge.deleted_months, vec!["202605".to_string()]);
        assert_eq!(purge.ledger_rows, 1);
        assert!(ledger
            .remote_paths()
            .unwrap()
            .contains("/backups/box/202607/full/@_20260707_full.btrfs.gpg"));
        script.finish();
    }

    #[test]
    fn monthly_purge_keeps_everything_within_retention() {
        let (settings, ledger, snapshots) = manager_parts();

        let script = RemoteScript::new().expect_exec(
            "ls -1 '/backups/box' 2>/dev/null || true",
            0,
            "202606\n202607\n",
        );

        let cleanup = CleanupManager::new(&settings, &script, &ledger, &snapshots);
        let purge = cleanup.purge_months(HOST).unwrap();

        assert!(purge.deleted_months.is_empty());
        script.finish();
    }

    #[test]
    fn incremental_purge_targets_the_current_month() {
        let (settings, ledger, snapshots) = manager_parts();

        ledger
            .record(&SentRow {
                kind: BackupKind::Incremental,
                // Far enough in the past to be beyond any cutoff.
                sent_at: NaiveDateTime::parse_from_str(
                    "2020-01-01 00:00:00",
                    "%Y-%m-%d %H:%M:%S",
                )
                .unwrap(),
                ..sent("/backups/box/202607/incremental/@_20200101_incremental.btrfs.gpg")
            })
            .unwrap();

        let month = Local::now().format("%Y%m");
        let script = RemoteScript::new().expect_exec(
            &format!(
                "find '/backups/box/{}/incremental' -name '*.btrfs.gpg' -mtime +31 -delete 2>/dev/null || true",
                month
            ),
            0,
            "",
        );

        let cleanup = CleanupManager::new(&settings, &script, &ledger, &snapshots);
        let purge = cleanup.purge_incrementals(HOST).unwrap();

        assert_eq!(purge.ledger_rows, 1);
        script.finish();
    }
}
