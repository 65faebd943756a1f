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

use crate::cleanup::CleanupManager;
use crate::config::Settings;
use crate::ledger::{Ledger, SentRow};
use crate::progress::{ProgressHub, Subscription};
use crate::remote::{self, RemoteExec, ResolveHost};
use crate::report::{BackupKind, Progress, RunResult, RunStatus, SubvolResult};
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::stream::{read_passphrase, SealingStream, CHUNKSIZE};
use crate::verify::Verifier;
use crate::{EngineError, LocalError};

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{Datelike, Local, NaiveDate};
use flate2::bufread::GzEncoder;
use flate2::Compression;
use log::{error, info, warn};
use tempfile::NamedTempFile;

/// The number of steps a backup run progresses through.
const TOTAL_STEPS: u32 = 7;

/// Decides whether a run is full or incremental. A forced request,
/// the first day of a month and an empty ledger all force a full run;
/// everything else is incremental with a per-subvolume fall-back.
fn decide_kind(force_full: bool, today: NaiveDate, ledger_empty: bool) -> BackupKind {
    if force_full || today.day() == 1 || ledger_empty {
        BackupKind::Full
    } else {
        BackupKind::Incremental
    }
}

/// Aggregates per-subvolume outcomes into the final run status.
fn aggregate_status(subvolumes: &[SubvolResult]) -> RunStatus {
    if subvolumes.iter().all(|sub| sub.success()) {
        RunStatus::Success
    } else if subvolumes.iter().any(|sub| sub.success()) {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    }
}

/// Returns the remote directory and artifact path of a subvolume backup
/// taken on the specified day.
fn artifact_location(
    client_dir: &str,
    subvol: &str,
    kind: BackupKind,
    day: NaiveDate,
) -> (String, String) {
    let dir = format!("{}/{}/{}", client_dir, day.format("%Y%m"), kind.as_str());
    let file = format!(
        "{}/{}_{}_{}.btrfs.gpg",
        dir,
        subvol,
        day.format("%Y%m%d"),
        kind.as_str()
    );

    (dir, file)
}

/// Why a run ended before reaching its natural end.
enum RunAbort {
    /// The cancel flag was observed at a state boundary.
    Cancelled,
    /// A failure that invalidates the run as a whole.
    Failed(EngineError),
}

impl From<EngineError> for RunAbort {
    fn from(e: EngineError) -> Self {
        Self::Failed(e)
    }
}

/// A `BackupEngine` drives complete backup runs: orphan cleanup,
/// kind decision, snapshot creation, per-subvolume encrypted delivery
/// with verification and ledger recording, and retention.
///
/// At most one run is active per engine at any time; a second start
/// observes [`EngineError::Busy`] and does not queue. Cancellation is
/// cooperative and checked at every state boundary.
pub struct BackupEngine {
    settings: Settings,
    remote: Box<dyn RemoteExec>,
    resolver: Box<dyn ResolveHost>,
    snapshots: SnapshotManager,
    ledger: Mutex<Ledger>,
    hub: ProgressHub,
    current: Mutex<Option<Progress>>,
    active: AtomicBool,
    cancel: AtomicBool,
}

/// Releases the single-flight slot and clears the progress snapshot
/// when a run ends, no matter how.
struct RunGuard<'a> {
    engine: &'a BackupEngine,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.engine.current.lock().unwrap() = None;
        self.engine.active.store(false, Ordering::SeqCst);
    }
}

impl BackupEngine {
    /// Returns a new `BackupEngine` over the provided collaborators.
    pub fn new(
        settings: Settings,
        remote: Box<dyn RemoteExec>,
        resolver: Box<dyn ResolveHost>,
        ledger: Ledger,
    ) -> Self {
        let snapshots = SnapshotManager::new(settings.snapshot_dir.clone(), settings.subvolumes());

        Self {
            settings,
            remote,
            resolver,
            snapshots,
            ledger: Mutex::new(ledger),
            hub: ProgressHub::new(),
            current: Mutex::new(None),
            active: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        }
    }

    /// Returns the snapshot manager of this engine.
    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Reports whether a run is currently active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns the latest progress snapshot of the active run, if any.
    pub fn status(&self) -> Option<Progress> {
        self.current.lock().unwrap().clone()
    }

    /// Subscribes to the progress snapshots of this engine's runs.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Requests cooperative cancellation of the active run.
    /// Returns whether a run was active. In-flight subprocesses are not
    /// killed; the current subvolume completes or fails by natural means.
    pub fn request_cancel(&self) -> bool {
        if !self.is_active() {
            return false;
        }

        info!("backup cancellation requested");
        self.cancel.store(true, Ordering::SeqCst);
        true
    }

    fn acquire(&self) -> Result<RunGuard, EngineError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }

        self.cancel.store(false, Ordering::SeqCst);
        Ok(RunGuard { engine: self })
    }

    fn check_cancel(&self) -> Result<(), RunAbort> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(RunAbort::Cancelled)
        } else {
            Ok(())
        }
    }

    fn publish(
        &self,
        step: &str,
        step_num: u32,
        percentage: f32,
        current_file: Option<String>,
        speed_mbps: Option<f64>,
    ) {
        let progress = Progress {
            step: step.to_string(),
            step_num,
            total_steps: TOTAL_STEPS,
            percentage,
            current_file,
            speed_mbps,
        };

        *self.current.lock().unwrap() = Some(progress.clone());
        self.hub.publish(&progress);
    }

    /// Performs a complete backup run and records it to the history.
    /// Fails immediately with [`EngineError::Busy`] if a run is already
    /// active; every other failure is reported in the returned
    /// [`RunResult`].
    pub fn perform_backup(
        &self,
        kind: Option<BackupKind>,
        force_full: bool,
    ) -> Result<RunResult, EngineError> {
        let _guard = self.acquire()?;

        let timer = Instant::now();
        let mut result = RunResult {
            status: RunStatus::Running,
            kind: kind.unwrap_or(BackupKind::Full),
            started: Local::now().naive_local(),
            finished: None,
            duration_seconds: 0,
            total_bytes: 0,
            error: None,
            subvolumes: Vec::new(),
        };

        match self.run(kind, force_full, &mut result) {
            Ok(()) => {}
            Err(RunAbort::Cancelled) => {
                info!("backup run cancelled");
                result.status = RunStatus::Cancelled;
            }
            Err(RunAbort::Failed(e)) => {
                error!("backup run failed: {}", e);
                result.status = RunStatus::Failed;
                result.error = Some(e.to_string());
            }
        }

        result.finished = Some(Local::now().naive_local());
        result.duration_seconds = timer.elapsed().as_secs() as i64;

        if let Err(e) = self.ledger.lock().unwrap().record_history(&result) {
            error!("unable to record backup history: {}", e);
        }

        Ok(result)
    }

    fn run(
        &self,
        kind: Option<BackupKind>,
        force_full: bool,
        result: &mut RunResult,
    ) -> Result<(), RunAbort> {
        // Step 1: sweep orphans left behind by earlier failed uploads.
        self.publish("Cleaning up failed uploads", 1, 10.0, None, None);
        let host = self.resolver.resolve(&self.settings.unraid_tailscale_name);
        {
            let ledger = self.ledger.lock().unwrap();
            let cleanup = CleanupManager::new(&self.settings, &*self.remote, &ledger, &self.snapshots);

            match cleanup.sweep_orphans(&host) {
                Ok(sweep) => info!(
                    "orphan sweep: {} orphaned, {} deleted",
                    sweep.orphans, sweep.deleted
                ),
                Err(e) => warn!("orphan sweep failed: {}", e),
            }
        }
        self.check_cancel()?;

        // Step 2: full or incremental.
        self.publish("Determining backup type", 2, 20.0, None, None);
        let kind = match kind {
            Some(kind) => kind,
            None => {
                let ledger_empty = self
                    .ledger
                    .lock()
                    .unwrap()
                    .is_empty()
                    .map_err(EngineError::from)?;

                decide_kind(force_full, Local::now().date_naive(), ledger_empty)
            }
        };
        result.kind = kind;
        info!("backup kind: {}", kind);
        self.check_cancel()?;

        // Step 3: snapshot all subvolumes with one shared timestamp.
        self.publish("Creating snapshots", 3, 30.0, None, None);
        let snapshots = self.snapshots.create_all().map_err(EngineError::from)?;
        self.check_cancel()?;

        // Step 4: the address may have changed since the sweep.
        self.publish("Resolving remote host", 4, 40.0, None, None);
        let host = self.resolver.resolve(&self.settings.unraid_tailscale_name);
        info!("remote host resolved to {}", host);
        self.check_cancel()?;

        // Step 5: deliver each subvolume. One failure does not abort the
        // run; the next subvolume is still attempted.
        let passphrase =
            read_passphrase(&self.settings.encryption_key_path).map_err(EngineError::from)?;

        let count = snapshots.len();
        for (i, snapshot) in snapshots.iter().enumerate() {
            self.check_cancel()?;

            let percentage = 50.0 + (i as f32 * 30.0 / count as f32);
            self.publish(
                &format!("Backing up {}", snapshot.subvol()),
                5,
                percentage,
                Some(snapshot.subvol().to_string()),
                None,
            );

            let sub = self.backup_subvol(snapshot, kind, &host, &passphrase, percentage)?;
            if sub.success() {
                result.total_bytes += sub.size_bytes;
            }
            result.subvolumes.push(sub);
        }

        // Step 6: aggregate verification outcome.
        self.check_cancel()?;
        self.publish("Verifying backups", 6, 85.0, None, None);
        let unverified = result
            .subvolumes
            .iter()
            .filter(|sub| !sub.verified)
            .count();
        if unverified > 0 {
            warn!(
                "{} of {} subvolume backups missing verification",
                unverified,
                result.subvolumes.len()
            );
        }

        // Step 7: retention. Failures here never fail the run.
        self.check_cancel()?;
        self.publish("Cleaning up old backups", 7, 95.0, None, None);
        {
            let ledger = self.ledger.lock().unwrap();
            let cleanup = CleanupManager::new(&self.settings, &*self.remote, &ledger, &self.snapshots);

            if kind == BackupKind::Full && Local::now().day() == 1 {
                match cleanup.purge_months(&host) {
                    Ok(purge) => info!(
                        "monthly purge: {} directories deleted, {} ledger rows",
                        purge.deleted_months.len(),
                        purge.ledger_rows
                    ),
                    Err(e) => warn!("monthly purge failed: {}", e),
                }
            }

            match cleanup.purge_incrementals(&host) {
                Ok(purge) => info!("incremental purge: {} ledger rows", purge.ledger_rows),
                Err(e) => warn!("incremental purge failed: {}", e),
            }

            match cleanup.age_local_snapshots() {
                Ok(deleted) => info!("local snapshot aging: {} deleted", deleted),
                Err(e) => warn!("local snapshot aging failed: {}", e),
            }
        }

        result.status = aggregate_status(&result.subvolumes);
        self.publish("Backup complete", 7, 100.0, None, None);

        Ok(())
    }

    /// Backs up a single subvolume: stage the envelope, transfer it,
    /// verify the remote size and record the delivery. Only a ledger
    /// write failure is fatal for the run; everything else is reported
    /// as a per-subvolume failure.
    fn backup_subvol(
        &self,
        snapshot: &Snapshot,
        run_kind: BackupKind,
        host: &str,
        passphrase: &[u8],
        percentage: f32,
    ) -> Result<SubvolResult, EngineError> {
        let (kind, parent) = match run_kind {
            BackupKind::Full => (BackupKind::Full, None),
            BackupKind::Incremental => {
                let ledger = self.ledger.lock().unwrap();

                match self.snapshots.find_parent(snapshot.subvol(), &ledger) {
                    Ok(Some(parent)) => (BackupKind::Incremental, Some(parent)),
                    Ok(None) => {
                        info!(
                            "no sent parent for {}, falling back to full",
                            snapshot.subvol()
                        );
                        (BackupKind::Full, None)
                    }
                    Err(e) => {
                        warn!("parent lookup for {} failed: {}", snapshot.subvol(), e);

                        return Ok(SubvolResult {
                            subvol: snapshot.subvol().to_string(),
                            kind: run_kind,
                            remote_path: None,
                            size_bytes: 0,
                            verified: false,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
        };

        let (remote_dir, remote_file) = artifact_location(
            &self.settings.remote_client_dir(),
            snapshot.subvol(),
            kind,
            Local::now().date_naive(),
        );

        let mut sub = SubvolResult {
            subvol: snapshot.subvol().to_string(),
            kind,
            remote_path: Some(remote_file.clone()),
            size_bytes: 0,
            verified: false,
            error: None,
        };

        match self.deliver(
            snapshot,
            parent.as_ref(),
            host,
            &remote_dir,
            &remote_file,
            passphrase,
            percentage,
        ) {
            Ok(size) => {
                sub.size_bytes = size;
                sub.verified = true;
            }
            Err(e) => {
                warn!("backup of {} failed: {}", snapshot.subvol(), e);
                sub.error = Some(e.to_string());
                return Ok(sub);
            }
        }

        let row = SentRow {
            snapshot_path: snapshot.path().to_string_lossy().into_owned(),
            remote_path: remote_file,
            sent_at: Local::now().naive_local(),
            size_bytes: sub.size_bytes,
            kind,
            parent: parent.map(|p| p.path().to_string_lossy().into_owned()),
        };

        // A ledger that cannot be written invalidates the whole run:
        // without the row the artifact is an orphan and later runs
        // could not chain off this snapshot.
        self.ledger.lock().unwrap().record(&row)?;

        info!("recorded {} as sent", snapshot);
        Ok(sub)
    }

    fn deliver(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        host: &str,
        remote_dir: &str,
        remote_file: &str,
        passphrase: &[u8],
        percentage: f32,
    ) -> Result<u64, EngineError> {
        self.remote.mkdir_p(host, remote_dir)?;

        let mut scratch = NamedTempFile::new()?;
        let size = self.stage_envelope(snapshot, parent, passphrase, scratch.as_file_mut())?;

        let timer = Instant::now();
        let sent = self.remote.upload(host, scratch.path(), remote_file)?;
        let elapsed = timer.elapsed().as_secs_f64();

        let speed = if elapsed > 0.0 {
            Some(sent as f64 / 1_000_000.0 / elapsed)
        } else {
            None
        };
        self.publish(
            "Transferring to remote host",
            5,
            percentage,
            Some(remote_file.to_string()),
            speed,
        );

        Verifier::new(&*self.remote).verify_size(host, remote_file, size)?;

        Ok(size)
    }

    /// Stages the encrypted envelope of a snapshot to a scratch file:
    /// `btrfs send [-p parent]` piped through gzip compression and the
    /// sealing stream. Staging makes the final size known before the
    /// transfer and separates producer failures from transfer failures.
    fn stage_envelope(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        passphrase: &[u8],
        out: &mut File,
    ) -> Result<u64, EngineError> {
        let mut cmd = Command::new("btrfs");
        let cmd = cmd.arg("send");
        let cmd = if let Some(parent) = parent {
            cmd.arg("-p").arg(parent.path())
        } else {
            cmd
        };

        let mut child = cmd
            .arg(snapshot.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(LocalError::Io)?;

        let stderr = child.stderr.take().map(remote::spawn_reader);
        let stdout = child.stdout.take().ok_or(LocalError::NoBtrfsOutput)?;

        let gz = GzEncoder::new(
            BufReader::with_capacity(2 * CHUNKSIZE, stdout),
            Compression::default(),
        );
        let mut sealing = SealingStream::new(BufReader::with_capacity(2 * CHUNKSIZE, gz), passphrase)?;

        let mut writer = BufWriter::with_capacity(2 * CHUNKSIZE, out);
        let size = io::copy(&mut sealing, &mut writer)?;
        writer.flush()?;
        drop(writer);
        drop(sealing);

        let status = child.wait().map_err(LocalError::Io)?;
        if !status.success() {
            let stderr = stderr
                .and_then(|handle| handle.join().ok())
                .unwrap_or_default();

            return Err(LocalError::BtrfsCmd(
                String::from_utf8_lossy(&stderr).trim().to_string(),
            )
            .into());
        }

        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::remote::testing::RemoteScript;

    struct FixedResolver;

    impl ResolveHost for FixedResolver {
        fn resolve(&self, name: &str) -> String {
            name.to_string()
        }
    }

    fn engine() -> BackupEngine {
        BackupEngine::new(
            Settings::default(),
            Box::new(RemoteScript::new()),
            Box::new(FixedResolver),
            Ledger::open_in_memory().unwrap(),
        )
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sub(subvol: &str, error: Option<&str>) -> SubvolResult {
        SubvolResult {
            subvol: subvol.to_string(),
            kind: BackupKind::Full,
            remote_path: None,
            size_bytes: 0,
            verified: error.is_none(),
            error: error.map(|e| e.to_string()),
        }
    }

    #[test]
    fn forced_and_day_one_and_empty_ledger_mean_full() {
        assert_eq!(
            decide_kind(true, day(2026, 7, 15), false),
            BackupKind::Full
        );
        assert_eq!(
            decide_kind(false, day(2026, 7, 1), false),
            BackupKind::Full
        );
        assert_eq!(decide_kind(false, day(2026, 7, 15), true), BackupKind::Full);
        assert_eq!(
            decide_kind(false, day(2026, 7, 15), false),
            BackupKind::Incremental
        );
    }

    #[test]
    fn status_aggregation() {
        assert_eq!(
            aggregate_status(&[sub("@", None), sub("@home", None)]),
            RunStatus::Success
        );
        assert_eq!(
            aggregate_status(&[sub("@", None), sub("@home", Some("transfer failed"))]),
            RunStatus::Partial
        );
        assert_eq!(
            aggregate_status(&[sub("@", Some("boom")), sub("@home", Some("boom"))]),
            RunStatus::Failed
        );
    }

    #[test]
    fn artifact_paths_follow_the_remote_layout() {
        let (dir, file) = artifact_location("/backups/box", "@", BackupKind::Full, day(2026, 7, 15));
        assert_eq!(dir, "/backups/box/202607/full");
        assert_eq!(file, "/backups/box/202607/full/@_20260715_full.btrfs.gpg");

        let (dir, file) =
            artifact_location("/backups/box", "@home", BackupKind::Incremental, day(2026, 7, 16));
        assert_eq!(dir, "/backups/box/202607/incremental");
        assert_eq!(
            file,
            "/backups/box/202607/incremental/@home_20260716_incremental.btrfs.gpg"
        );
    }

    #[test]
    fn second_start_observes_busy() {
        let engine = engine();

        let guard = engine.acquire().unwrap();
        assert!(engine.is_active());
        assert!(matches!(engine.acquire(), Err(EngineError::Busy)));

        drop(guard);
        assert!(!engine.is_active());
        engine.acquire().unwrap();
    }

    #[test]
    fn cancel_requires_an_active_run() {
        let engine = engine();
        assert!(!engine.request_cancel());

        let _guard = engine.acquire().unwrap();
        assert!(engine.request_cancel());
        assert!(engine.check_cancel().is_err());
    }

    #[test]
    fn run_guard_clears_the_progress_slot() {
        let engine = engine();

        let guard = engine.acquire().unwrap();
        engine.publish("Creating snapshots", 3, 30.0, None, None);
        assert!(engine.status().is_some());

        drop(guard);
        assert!(engine.status().is_none());
    }
}
