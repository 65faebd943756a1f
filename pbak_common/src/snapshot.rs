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

use crate::ledger::Ledger;
use crate::{EngineError, LocalError, SnapshotParseError};

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{Duration, Local, NaiveDateTime, Timelike};
use log::{debug, info, warn};

/// A `Snapshot` is a read-only point-in-time reference to a subvolume,
/// identified by the subvolume's logical name and its creation timestamp.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Snapshot {
    subvol: String,
    path: PathBuf,
    taken: NaiveDateTime,
    mount_point: Option<PathBuf>,
}

impl Snapshot {
    pub(crate) const TIMESTAMP_FMT: &'static str = "%Y%m%d_%H%M%S";

    /// Returns the logical name of the subvolume the `Snapshot` captures.
    pub fn subvol(&self) -> &str {
        &self.subvol
    }

    /// Returns the absolute local path of the `Snapshot`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the timestamp of when the `Snapshot` was taken,
    /// at second precision.
    pub fn taken(&self) -> NaiveDateTime {
        self.taken
    }

    /// Returns the mount point the `Snapshot` was taken from.
    /// Only known for snapshots created by this process;
    /// snapshots enumerated from disk do not carry it.
    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}",
            self.subvol,
            self.taken.format(Self::TIMESTAMP_FMT)
        )
    }
}

impl TryFrom<&Path> for Snapshot {
    type Error = SnapshotParseError;

    fn try_from(value: &Path) -> Result<Self, Self::Error> {
        let name = value
            .file_name()
            .ok_or(SnapshotParseError::NoFileName)?
            .to_str()
            .ok_or(SnapshotParseError::InvalidUnicode)?;

        // Name format is `{subvol}_{%Y%m%d_%H%M%S}`; the subvolume name
        // may itself contain underscores, the timestamp always holds
        // the last two tokens.
        let mut tokens = name.rsplitn(3, '_');

        let time = tokens.next().ok_or(SnapshotParseError::MissingTimestamp)?;
        let date = tokens.next().ok_or(SnapshotParseError::MissingTimestamp)?;
        let subvol = tokens.next().ok_or(SnapshotParseError::MissingTimestamp)?;

        if subvol.is_empty() {
            return Err(SnapshotParseError::MissingTimestamp);
        }

        let taken =
            NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), Self::TIMESTAMP_FMT)?;

        Ok(Self {
            subvol: subvol.to_string(),
            path: value.to_path_buf(),
            taken,
            mount_point: None,
        })
    }
}

/// What local snapshot aging should do with a single snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AgeDecision {
    Keep,
    Delete,
    DeleteWithWarning,
}

/// Decides the fate of an aged snapshot. Snapshots recorded as sent are
/// deleted once older than the retention window, unless they are the
/// newest sent snapshot of their subvolume (the only usable incremental
/// parent). Snapshots never recorded as sent survive double the window
/// and are then deleted with a warning.
fn age_decision(
    taken: NaiveDateTime,
    now: NaiveDateTime,
    days: u32,
    sent: bool,
    newest_sent: bool,
) -> AgeDecision {
    if sent && newest_sent {
        return AgeDecision::Keep;
    }

    let window = Duration::days(i64::from(days));

    if sent {
        if now - taken > window {
            AgeDecision::Delete
        } else {
            AgeDecision::Keep
        }
    } else if now - taken > window * 2 {
        AgeDecision::DeleteWithWarning
    } else {
        AgeDecision::Keep
    }
}

/// A `SnapshotManager` creates, enumerates, ages and deletes the
/// read-only snapshots of the configured subvolumes.
pub struct SnapshotManager {
    snapshot_dir: PathBuf,
    subvolumes: Vec<(String, PathBuf)>,
}

impl SnapshotManager {
    /// Returns a new `SnapshotManager` over the specified snapshot
    /// directory and (logical name, mount point) bindings.
    pub fn new(snapshot_dir: PathBuf, subvolumes: Vec<(String, PathBuf)>) -> Self {
        Self {
            snapshot_dir,
            subvolumes,
        }
    }

    /// Returns the configured subvolume bindings in backup order.
    pub fn subvolumes(&self) -> &[(String, PathBuf)] {
        &self.subvolumes
    }

    /// Creates a read-only snapshot of every configured subvolume,
    /// all sharing the wall-clock second the run started at.
    /// If any snapshot fails, the ones already created by this call
    /// are deleted again before the error is returned.
    pub fn create_all(&self) -> Result<Vec<Snapshot>, LocalError> {
        fs::create_dir_all(&self.snapshot_dir)?;

        let taken = Local::now().naive_local();
        let taken = taken.with_nanosecond(0).unwrap_or(taken);

        let mut created = Vec::new();

        for (subvol, mount_point) in &self.subvolumes {
            match self.create_one(subvol, mount_point, taken) {
                Ok(snapshot) => created.push(snapshot),
                Err(e) => {
                    for snapshot in &created {
                        if let Err(del) = self.delete(snapshot.path()) {
                            warn!("unable to roll back {}: {}", snapshot, del);
                        }
                    }

                    return Err(e);
                }
            }
        }

        Ok(created)
    }

    fn create_one(
        &self,
        subvol: &str,
        mount_point: &Path,
        taken: NaiveDateTime,
    ) -> Result<Snapshot, LocalError> {
        let snapshot = Snapshot {
            subvol: subvol.to_string(),
            path: self.snapshot_dir.join(format!(
                "{}_{}",
                subvol,
                taken.format(Snapshot::TIMESTAMP_FMT)
            )),
            taken,
            mount_point: Some(mount_point.to_path_buf()),
        };

        if snapshot.path.exists() {
            return Err(LocalError::SnapshotExists(snapshot.path));
        }

        let output = Command::new("btrfs")
            .arg("subvolume")
            .arg("snapshot")
            .arg("-r")
            .arg(mount_point)
            .arg(&snapshot.path)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(LocalError::BtrfsCmd(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        info!("created snapshot {}", snapshot.path.display());
        Ok(snapshot)
    }

    /// Returns all local snapshots, newest first.
    /// Directory entries that do not follow the snapshot naming scheme
    /// are ignored.
    pub fn list(&self) -> Result<Vec<Snapshot>, LocalError> {
        if !self.snapshot_dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();

        for entry in fs::read_dir(&self.snapshot_dir)? {
            let path = entry?.path();

            match Snapshot::try_from(&*path) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => debug!("skipping foreign entry {}: {}", path.display(), e),
            }
        }

        snapshots.sort_by(|a, b| b.taken().cmp(&a.taken()));
        Ok(snapshots)
    }

    /// Returns the newest local snapshot of the specified subvolume that
    /// the ledger records as successfully sent, or `None` if no sent
    /// predecessor exists. Name ordering equals creation ordering because
    /// of the fixed timestamp format.
    pub fn find_parent(
        &self,
        subvol: &str,
        ledger: &Ledger,
    ) -> Result<Option<Snapshot>, EngineError> {
        for snapshot in self.list()? {
            if snapshot.subvol() != subvol {
                continue;
            }

            if ledger.was_sent(snapshot.path())? {
                return Ok(Some(snapshot));
            }
        }

        Ok(None)
    }

    /// Returns the size of a snapshot in bytes. Best-effort and
    /// informational only; failures yield zero.
    pub fn size_of(&self, path: &Path) -> u64 {
        let output = Command::new("du")
            .arg("-sb")
            .arg(path)
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .next()
                .and_then(|size| size.parse().ok())
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Deletes the specified snapshot.
    pub fn delete(&self, path: &Path) -> Result<(), LocalError> {
        let output = Command::new("btrfs")
            .arg("subvolume")
            .arg("delete")
            .arg(path)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(LocalError::BtrfsCmd(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        info!("deleted snapshot {}", path.display());
        Ok(())
    }

    /// Ages out local snapshots older than the retention window,
    /// returning the number of deleted snapshots. See [`age_decision`]
    /// for the rules; failures to delete individual snapshots are logged
    /// and do not abort the pass.
    pub fn age_out(&self, ledger: &Ledger, days: u32) -> Result<usize, EngineError> {
        let now = Local::now().naive_local();
        let snapshots = self.list()?;

        // The newest sent snapshot per subvolume stays: it is the only
        // parent candidate the next incremental run can use.
        let mut newest_sent: Vec<&Snapshot> = Vec::new();
        for snapshot in &snapshots {
            if newest_sent.iter().any(|s| s.subvol() == snapshot.subvol()) {
                continue;
            }

            if ledger.was_sent(snapshot.path())? {
                newest_sent.push(snapshot);
            }
        }

        let mut deleted = 0;

        for snapshot in &snapshots {
            let sent = ledger.was_sent(snapshot.path())?;
            let pinned = newest_sent.iter().any(|s| *s == snapshot);

            match age_decision(snapshot.taken(), now, days, sent, pinned) {
                AgeDecision::Keep => {}
                AgeDecision::Delete => match self.delete(snapshot.path()) {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!("unable to age out {}: {}", snapshot, e),
                },
                AgeDecision::DeleteWithWarning => {
                    warn!("deleting snapshot {} that was never sent", snapshot);

                    match self.delete(snapshot.path()) {
                        Ok(()) => deleted += 1,
                        Err(e) => warn!("unable to age out {}: {}", snapshot, e),
                    }
                }
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ledger::SentRow;
    use crate::report::BackupKind;

    use chrono::NaiveDate;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y%m%d_%H%M%S").unwrap()
    }

    fn sent_row(path: &Path) -> SentRow {
        SentRow {
            snapshot_path: path.to_string_lossy().to_string(),
            remote_path: format!("/remote{}", path.display()),
            sent_at: ts("20260710_020000"),
            size_bytes: 1,
            kind: BackupKind::Full,
            parent: None,
        }
    }

    #[test]
    fn parses_snapshot_name() {
        let snapshot = Snapshot::try_from(Path::new("/.snapshots/@home_20260708_021504")).unwrap();

        assert_eq!(snapshot.subvol(), "@home");
        assert_eq!(snapshot.taken(), ts("20260708_021504"));
        assert_eq!(snapshot.to_string(), "@home_20260708_021504");
    }

    #[test]
    fn parses_subvolume_with_underscore() {
        let snapshot = Snapshot::try_from(Path::new("/.snapshots/@var_log_20260708_021504"))
            .unwrap();

        assert_eq!(snapshot.subvol(), "@var_log");
    }

    #[test]
    fn rejects_nameless_and_malformed_entries() {
        assert!(Snapshot::try_from(Path::new("/.snapshots/@")).is_err());
        assert!(Snapshot::try_from(Path::new("/.snapshots/@_2026_9999")).is_err());
    }

    #[test]
    fn find_parent_prefers_newest_sent() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("@_20260706_020000");
        let sent = dir.path().join("@_20260707_020000");
        let unsent = dir.path().join("@_20260708_020000");
        for path in [&old, &sent, &unsent] {
            fs::create_dir(path).unwrap();
        }

        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record(&sent_row(&old)).unwrap();
        ledger.record(&sent_row(&sent)).unwrap();

        let manager = SnapshotManager::new(dir.path().to_path_buf(), Vec::new());
        let parent = manager.find_parent("@", &ledger).unwrap().unwrap();

        assert_eq!(parent.path(), sent);
    }

    #[test]
    fn find_parent_without_sent_predecessor() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("@_20260708_020000")).unwrap();

        let ledger = Ledger::open_in_memory().unwrap();
        let manager = SnapshotManager::new(dir.path().to_path_buf(), Vec::new());

        assert!(manager.find_parent("@", &ledger).unwrap().is_none());
    }

    #[test]
    fn aging_keeps_newest_sent_predecessor() {
        let now = ts("20260801_120000");
        let taken = ts("20260701_120000");

        assert_eq!(age_decision(taken, now, 3, true, true), AgeDecision::Keep);
        assert_eq!(age_decision(taken, now, 3, true, false), AgeDecision::Delete);
    }

    #[test]
    fn aging_gives_unsent_snapshots_double_the_window() {
        let now = NaiveDate::from_ymd_opt(2026, 8, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();

        let recent = ts("20260728_120000"); // 4 days
        let stale = ts("20260720_120000"); // 12 days

        assert_eq!(age_decision(recent, now, 3, false, false), AgeDecision::Keep);
        assert_eq!(
            age_decision(stale, now, 3, false, false),
            AgeDecision::DeleteWithWarning
        );
    }

    #[test]
    fn aging_keeps_snapshots_inside_the_window() {
        let now = ts("20260801_120000");
        let taken = ts("20260731_120000");

        assert_eq!(age_decision(taken, now, 3, true, false), AgeDecision::Keep);
        assert_eq!(age_decision(taken, now, 3, false, false), AgeDecision::Keep);
    }
}
