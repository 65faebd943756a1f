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

use crate::report::{BackupKind, HistoryEntry, RunResult, RunStatus, SubvolResult};
use crate::LedgerError;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};

/// The timestamp format stored in the database. Lexicographic order
/// equals chronological order, which the cutoff queries rely on.
const TS_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// A `SentRow` records one successful delivery of a local snapshot
/// to a remote artifact path. Rows are unique by local snapshot path
/// and are the single source of truth for incremental parent selection
/// and orphan detection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SentRow {
    /// The absolute local path of the delivered snapshot.
    pub snapshot_path: String,
    /// The remote artifact path the snapshot was delivered to.
    pub remote_path: String,
    /// When the delivery completed.
    pub sent_at: NaiveDateTime,
    /// The size of the delivered envelope in bytes.
    pub size_bytes: u64,
    /// Whether the artifact is a full or an incremental stream.
    pub kind: BackupKind,
    /// The local snapshot path of the incremental parent.
    /// Always `None` for full artifacts.
    pub parent: Option<String>,
}

/// A `Ledger` is the durable record of successful deliveries plus the
/// append-only backup history, backed by a single SQLite database file.
/// Writes are durable before they are acknowledged. Concurrent writers
/// are not supported; the single-flight run discipline is relied upon.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Opens the ledger database at the specified path,
    /// creating the file and its schema as needed.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init(&conn)?;

        Ok(Self { conn })
    }

    /// Opens a transient in-memory ledger. Mainly useful for tests.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;

        Ok(Self { conn })
    }

    fn init(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sent_snapshots (
                id INTEGER PRIMARY KEY,
                snapshot_path TEXT NOT NULL UNIQUE,
                remote_path TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                kind TEXT NOT NULL,
                parent_snapshot TEXT
            );
            CREATE TABLE IF NOT EXISTS backup_history (
                id INTEGER PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                duration_seconds INTEGER NOT NULL,
                error_message TEXT,
                subvolumes TEXT NOT NULL
            );",
        )?;

        Ok(())
    }

    /// Reports whether the specified local snapshot was successfully
    /// delivered.
    pub fn was_sent(&self, snapshot_path: &Path) -> Result<bool, LedgerError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sent_snapshots WHERE snapshot_path = ?1",
            params![snapshot_path.to_string_lossy().into_owned()],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    /// Reports whether no delivery has ever been recorded.
    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM sent_snapshots", [], |row| row.get(0))?;

        Ok(count == 0)
    }

    /// Records a successful delivery. Recording the same snapshot path
    /// again replaces the previous row, keeping replays idempotent.
    pub fn record(&self, row: &SentRow) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sent_snapshots
                (snapshot_path, remote_path, sent_at, size_bytes, kind, parent_snapshot)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.snapshot_path,
                row.remote_path,
                row.sent_at.format(TS_FMT).to_string(),
                row.size_bytes as i64,
                row.kind.as_str(),
                row.parent,
            ],
        )?;

        Ok(())
    }

    /// Returns the delivery record of the specified local snapshot,
    /// if one exists.
    pub fn lookup(&self, snapshot_path: &Path) -> Result<Option<SentRow>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_path, remote_path, sent_at, size_bytes, kind, parent_snapshot
                FROM sent_snapshots WHERE snapshot_path = ?1",
        )?;

        let mut rows = stmt.query(params![snapshot_path.to_string_lossy().into_owned()])?;

        match rows.next()? {
            Some(row) => Ok(Some(Self::to_sent_row(row)?)),
            None => Ok(None),
        }
    }

    /// Returns all delivery records, oldest first.
    pub fn rows(&self) -> Result<Vec<SentRow>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_path, remote_path, sent_at, size_bytes, kind, parent_snapshot
                FROM sent_snapshots ORDER BY id",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            out.push(Self::to_sent_row(row)?);
        }

        Ok(out)
    }

    /// Returns the set of all remote artifact paths the ledger references.
    pub fn remote_paths(&self) -> Result<HashSet<String>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT remote_path FROM sent_snapshots")?;

        let mut rows = stmt.query([])?;
        let mut out = HashSet::new();

        while let Some(row) = rows.next()? {
            out.insert(row.get(0)?);
        }

        Ok(out)
    }

    /// Deletes all delivery records whose remote path lies under the
    /// specified directory, returning the number of deleted rows.
    pub fn delete_under(&self, remote_dir: &str) -> Result<usize, LedgerError> {
        let n = self.conn.execute(
            "DELETE FROM sent_snapshots WHERE remote_path LIKE ?1",
            params![format!("{}/%", remote_dir.trim_end_matches('/'))],
        )?;

        Ok(n)
    }

    /// Deletes all incremental delivery records sent before the cutoff,
    /// returning the number of deleted rows. Full records are never
    /// touched here.
    pub fn delete_incremental_before(&self, cutoff: NaiveDateTime) -> Result<usize, LedgerError> {
        let n = self.conn.execute(
            "DELETE FROM sent_snapshots WHERE kind = 'incremental' AND sent_at < ?1",
            params![cutoff.format(TS_FMT).to_string()],
        )?;

        Ok(n)
    }

    fn to_sent_row(row: &rusqlite::Row<'_>) -> Result<SentRow, LedgerError> {
        let sent_at: String = row.get(2)?;
        let size_bytes: i64 = row.get(3)?;
        let kind: String = row.get(4)?;

        Ok(SentRow {
            snapshot_path: row.get(0)?,
            remote_path: row.get(1)?,
            sent_at: NaiveDateTime::parse_from_str(&sent_at, TS_FMT)?,
            size_bytes: size_bytes as u64,
            kind: BackupKind::try_from(kind.as_str())?,
            parent: row.get(5)?,
        })
    }

    /// Appends a run outcome to the backup history,
    /// returning its database identity.
    pub fn record_history(&self, result: &RunResult) -> Result<i64, LedgerError> {
        self.conn.execute(
            "INSERT INTO backup_history
                (started_at, finished_at, kind, status, size_bytes,
                 duration_seconds, error_message, subvolumes)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                result.started.format(TS_FMT).to_string(),
                result.finished.map(|t| t.format(TS_FMT).to_string()),
                result.kind.as_str(),
                result.status.to_string(),
                result.total_bytes as i64,
                result.duration_seconds,
                result.error,
                serde_json::to_string(&result.subvolumes)?,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Returns the most recent history entries, newest first.
    pub fn history(&self, limit: u32) -> Result<Vec<HistoryEntry>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, kind, status, size_bytes,
                duration_seconds, error_message, subvolumes
                FROM backup_history ORDER BY id DESC LIMIT ?1",
        )?;

        let mut rows = stmt.query(params![limit])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            out.push(Self::to_history_entry(row)?);
        }

        Ok(out)
    }

    /// Returns the history entry with the specified identity,
    /// if one exists.
    pub fn history_entry(&self, id: i64) -> Result<Option<HistoryEntry>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, kind, status, size_bytes,
                duration_seconds, error_message, subvolumes
                FROM backup_history WHERE id = ?1",
        )?;

        let mut rows = stmt.query(params![id])?;

        match rows.next()? {
            Some(row) => Ok(Some(Self::to_history_entry(row)?)),
            None => Ok(None),
        }
    }

    fn to_history_entry(row: &rusqlite::Row<'_>) -> Result<HistoryEntry, LedgerError> {
        let started: String = row.get(1)?;
        let finished: Option<String> = row.get(2)?;
        let kind: String = row.get(3)?;
        let status: String = row.get(4)?;
        let size_bytes: i64 = row.get(5)?;
        let subvolumes: String = row.get(8)?;

        Ok(HistoryEntry {
            id: row.get(0)?,
            result: RunResult {
                status: RunStatus::try_from(status.as_str())?,
                kind: BackupKind::try_from(kind.as_str())?,
                started: NaiveDateTime::parse_from_str(&started, TS_FMT)?,
                finished: finished
                    .map(|t| NaiveDateTime::parse_from_str(&t, TS_FMT))
                    .transpose()?,
                duration_seconds: row.get(6)?,
                total_bytes: size_bytes as u64,
                error: row.get(7)?,
                subvolumes: serde_json::from_str::<Vec<SubvolResult>>(&subvolumes)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TS_FMT).unwrap()
    }

    fn row(local: &str, remote: &str, kind: BackupKind, sent_at: &str) -> SentRow {
        SentRow {
            snapshot_path: local.to_string(),
            remote_path: remote.to_string(),
            sent_at: ts(sent_at),
            size_bytes: 4096,
            kind,
            parent: None,
        }
    }

    #[test]
    fn records_and_looks_up_deliveries() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(ledger.is_empty().unwrap());

        let mut sent = row(
            "/.snapshots/@_20260707_020000",
            "/backups/box/202607/full/@_20260707_full.btrfs.gpg",
            BackupKind::Full,
            "2026-07-07 02:00:31",
        );
        sent.parent = None;
        ledger.record(&sent).unwrap();

        assert!(!ledger.is_empty().unwrap());
        assert!(ledger
            .was_sent(&PathBuf::from("/.snapshots/@_20260707_020000"))
            .unwrap());
        assert_eq!(
            ledger
                .lookup(&PathBuf::from("/.snapshots/@_20260707_020000"))
                .unwrap()
                .unwrap(),
            sent
        );
    }

    #[test]
    fn recording_twice_keeps_a_single_row() {
        let ledger = Ledger::open_in_memory().unwrap();

        let sent = row(
            "/.snapshots/@_20260707_020000",
            "/backups/box/202607/full/@_20260707_full.btrfs.gpg",
            BackupKind::Full,
            "2026-07-07 02:00:31",
        );
        ledger.record(&sent).unwrap();
        ledger.record(&sent).unwrap();

        assert_eq!(ledger.rows().unwrap().len(), 1);
    }

    #[test]
    fn keeps_parent_linkage() {
        let ledger = Ledger::open_in_memory().unwrap();

        let full = row(
            "/.snapshots/@_20260707_020000",
            "/backups/box/202607/full/@_20260707_full.btrfs.gpg",
            BackupKind::Full,
            "2026-07-07 02:00:31",
        );
        let mut incr = row(
            "/.snapshots/@_20260708_020000",
            "/backups/box/202607/incremental/@_20260708_incremental.btrfs.gpg",
            BackupKind::Incremental,
            "2026-07-08 02:00:12",
        );
        incr.parent = Some(full.snapshot_path.clone());

        ledger.record(&full).unwrap();
        ledger.record(&incr).unwrap();

        let stored = ledger
            .lookup(&PathBuf::from(&incr.snapshot_path))
            .unwrap()
            .unwrap();
        assert_eq!(stored.parent.as_deref(), Some(full.snapshot_path.as_str()));
        assert!(ledger
            .remote_paths()
            .unwrap()
            .contains(&full.remote_path));
    }

    #[test]
    fn deletes_rows_under_a_month_directory() {
        let ledger = Ledger::open_in_memory().unwrap();

        ledger
            .record(&row(
                "/.snapshots/@_20260607_020000",
                "/backups/box/202606/full/@_20260607_full.btrfs.gpg",
                BackupKind::Full,
                "2026-06-07 02:00:31",
            ))
            .unwrap();
        ledger
            .record(&row(
                "/.snapshots/@_20260707_020000",
                "/backups/box/202607/full/@_20260707_full.btrfs.gpg",
                BackupKind::Full,
                "2026-07-07 02:00:31",
            ))
            .unwrap();

        assert_eq!(ledger.delete_under("/backups/box/202606").unwrap(), 1);

        let remaining = ledger.rows().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].remote_path.contains("202607"));
    }

    #[test]
    fn incremental_cutoff_spares_full_rows() {
        let ledger = Ledger::open_in_memory().unwrap();

        ledger
            .record(&row(
                "/.snapshots/@_20260701_020000",
                "/backups/box/202607/full/@_20260701_full.btrfs.gpg",
                BackupKind::Full,
                "2026-07-01 02:00:31",
            ))
            .unwrap();
        ledger
            .record(&row(
                "/.snapshots/@_20260702_020000",
                "/backups/box/202607/incremental/@_20260702_incremental.btrfs.gpg",
                BackupKind::Incremental,
                "2026-07-02 02:00:12",
            ))
            .unwrap();
        ledger
            .record(&row(
                "/.snapshots/@_20260730_020000",
                "/backups/box/202607/incremental/@_20260730_incremental.btrfs.gpg",
                BackupKind::Incremental,
                "2026-07-30 02:00:12",
            ))
            .unwrap();

        let deleted = ledger
            .delete_incremental_before(ts("2026-07-14 00:00:00"))
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(ledger.rows().unwrap().len(), 2);
    }

    #[test]
    fn history_round_trip() {
        let ledger = Ledger::open_in_memory().unwrap();

        let result = RunResult {
            status: RunStatus::Partial,
            kind: BackupKind::Incremental,
            started: ts("2026-07-08 02:00:00"),
            finished: Some(ts("2026-07-08 02:11:42")),
            duration_seconds: 702,
            total_bytes: 1_234_567,
            error: None,
            subvolumes: vec![SubvolResult {
                subvol: "@".to_string(),
                kind: BackupKind::Incremental,
                remote_path: Some(
                    "/backups/box/202607/incremental/@_20260708_incremental.btrfs.gpg".to_string(),
                ),
                size_bytes: 1_234_567,
                verified: true,
                error: None,
            }],
        };

        let id = ledger.record_history(&result).unwrap();

        let entry = ledger.history_entry(id).unwrap().unwrap();
        assert_eq!(entry.result, result);

        let recent = ledger.history(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, id);
    }
}
