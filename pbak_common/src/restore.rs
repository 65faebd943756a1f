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

use crate::cleanup::is_month_name;
use crate::config::Settings;
use crate::remote::{self, RemoteExec, ResolveHost};
use crate::report::BackupKind;
use crate::stream::{read_passphrase, OpeningStream, CHUNKSIZE};
use crate::verify::Verifier;
use crate::{EngineError, LocalError};

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::NaiveDate;
use flate2::write::GzDecoder;
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// A `RestoreRequest` describes which artifacts to restore and where to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// The backup day in `YYYYMMDD` format.
    pub date: String,
    /// Whether to restore full or incremental artifacts of that day.
    pub kind: BackupKind,
    /// The logical subvolume names to restore.
    pub subvolumes: Vec<String>,
    /// Where to receive the streams. Defaults to a scratch location
    /// under the system temporary directory.
    pub target_path: Option<PathBuf>,
    /// Only inspect the remote artifacts instead of downloading them.
    pub verify_only: bool,
}

/// A `RestoreStatus` is a point-in-time snapshot of a running restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestoreStatus {
    /// A human-readable label of the current step.
    pub step: String,
    /// The overall completion percentage.
    pub progress: f32,
    /// The subvolume currently being restored, if any.
    pub subvolume: Option<String>,
}

/// A `RestoreOutcome` is the result of restoring or verifying
/// a single subvolume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    /// The logical name of the subvolume.
    pub subvol: String,
    /// Whether the restore or verification succeeded.
    pub success: bool,
    /// Whether only the envelope was verified (no data restored).
    pub verified_only: bool,
    /// The size of the remote artifact in bytes.
    pub size_bytes: u64,
    /// The directory the stream was received into, if any.
    pub restored_to: Option<PathBuf>,
    /// The failure message, if the subvolume failed.
    pub error: Option<String>,
}

/// A `RestoreReport` is the aggregate outcome of one restore run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Whether every requested subvolume succeeded.
    pub success: bool,
    /// The per-subvolume outcomes in request order.
    pub outcomes: Vec<RestoreOutcome>,
}

/// Extracts the `YYYYMMDD` date from an artifact file name of the form
/// `{subvol}_{date}_{kind}.btrfs.gpg`.
fn artifact_date(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".btrfs.gpg")?;

    let mut tokens = stem.rsplitn(3, '_');
    let _kind = tokens.next()?;
    let date = tokens.next()?;
    tokens.next()?;

    if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) {
        Some(date.to_string())
    } else {
        None
    }
}

/// Releases the single-flight slot and clears the status snapshot
/// when a restore ends, no matter how.
struct RestoreGuard<'a> {
    engine: &'a RestoreEngine,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        *self.engine.current.lock().unwrap() = None;
        self.engine.active.store(false, Ordering::SeqCst);
    }
}

/// A `RestoreEngine` reverses the backup pipeline: fetch the remote
/// artifact, decrypt and decompress it, and receive the stream into a
/// target subvolume directory.
///
/// At most one restore is active per engine at any time; a second start
/// observes [`EngineError::Busy`]. Restoring an incremental requires
/// that its parent snapshot has already been received into the same
/// target; this is the caller's responsibility and is not enforced here.
pub struct RestoreEngine {
    settings: Settings,
    remote: Box<dyn RemoteExec>,
    resolver: Box<dyn ResolveHost>,
    active: AtomicBool,
    current: Mutex<Option<RestoreStatus>>,
}

impl RestoreEngine {
    /// Returns a new `RestoreEngine` over the provided collaborators.
    pub fn new(
        settings: Settings,
        remote: Box<dyn RemoteExec>,
        resolver: Box<dyn ResolveHost>,
    ) -> Self {
        Self {
            settings,
            remote,
            resolver,
            active: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    /// Reports whether a restore is currently active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns the latest status snapshot of the active restore, if any.
    pub fn status(&self) -> Option<RestoreStatus> {
        self.current.lock().unwrap().clone()
    }

    fn acquire(&self) -> Result<RestoreGuard, EngineError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }

        Ok(RestoreGuard { engine: self })
    }

    fn set_status(&self, step: &str, progress: f32, subvolume: Option<&str>) {
        *self.current.lock().unwrap() = Some(RestoreStatus {
            step: step.to_string(),
            progress,
            subvolume: subvolume.map(|s| s.to_string()),
        });
    }

    fn validate(request: &RestoreRequest) -> Result<(), EngineError> {
        if request.date.len() != 8
            || !request.date.bytes().all(|b| b.is_ascii_digit())
            || NaiveDate::parse_from_str(&request.date, "%Y%m%d").is_err()
        {
            return Err(EngineError::InvalidRequest(format!(
                "\"{}\" is not a YYYYMMDD date",
                request.date
            )));
        }

        if request.subvolumes.is_empty() {
            return Err(EngineError::InvalidRequest(
                "no subvolumes requested".to_string(),
            ));
        }

        Ok(())
    }

    /// Performs a restore or verify-only run over the requested
    /// subvolumes. Per-subvolume failures are reported in the outcomes;
    /// the remaining subvolumes are still attempted.
    pub fn perform_restore(
        &self,
        request: &RestoreRequest,
    ) -> Result<RestoreReport, EngineError> {
        Self::validate(request)?;
        let _guard = self.acquire()?;

        let host = self.resolver.resolve(&self.settings.unraid_tailscale_name);
        let base = format!(
            "{}/{}/{}",
            self.settings.remote_client_dir(),
            &request.date[..6],
            request.kind.as_str()
        );

        let passphrase = if request.verify_only {
            Vec::new()
        } else {
            read_passphrase(&self.settings.encryption_key_path)?
        };

        let mut outcomes = Vec::new();

        for (i, subvol) in request.subvolumes.iter().enumerate() {
            let progress = i as f32 * 100.0 / request.subvolumes.len() as f32;
            self.set_status(&format!("Restoring {}", subvol), progress, Some(subvol));

            let remote_file = format!(
                "{}/{}_{}_{}.btrfs.gpg",
                base,
                subvol,
                request.date,
                request.kind.as_str()
            );

            let outcome = if request.verify_only {
                self.verify_one(&host, subvol, &remote_file)
            } else {
                self.restore_one(
                    &host,
                    subvol,
                    &remote_file,
                    request.target_path.as_deref(),
                    &passphrase,
                )
            };

            outcomes.push(outcome);
        }

        self.set_status("Restore complete", 100.0, None);

        Ok(RestoreReport {
            success: outcomes.iter().all(|outcome| outcome.success),
            outcomes,
        })
    }

    fn verify_one(&self, host: &str, subvol: &str, remote_file: &str) -> RestoreOutcome {
        let mut outcome = RestoreOutcome {
            subvol: subvol.to_string(),
            success: false,
            verified_only: true,
            size_bytes: 0,
            restored_to: None,
            error: None,
        };

        match Verifier::new(&*self.remote).inspect_envelope(host, remote_file) {
            Ok(check) => {
                outcome.success = check.valid;
                outcome.size_bytes = check.size;

                if !check.valid {
                    outcome.error = Some("artifact is missing the envelope signature".to_string());
                }
            }
            Err(e) => outcome.error = Some(e.to_string()),
        }

        outcome
    }

    fn restore_one(
        &self,
        host: &str,
        subvol: &str,
        remote_file: &str,
        target: Option<&Path>,
        passphrase: &[u8],
    ) -> RestoreOutcome {
        let mut outcome = RestoreOutcome {
            subvol: subvol.to_string(),
            success: false,
            verified_only: false,
            size_bytes: 0,
            restored_to: None,
            error: None,
        };

        match Verifier::new(&*self.remote).check_remote(host, remote_file) {
            Ok(check) if !check.exists => {
                outcome.error = Some("artifact not found on remote host".to_string());
                return outcome;
            }
            Ok(_) => {}
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }

        match self.receive(host, remote_file, target, passphrase) {
            Ok((restored_to, size)) => {
                info!("restored {} to {}", subvol, restored_to.display());
                outcome.success = true;
                outcome.size_bytes = size;
                outcome.restored_to = Some(restored_to);
            }
            Err(e) => {
                warn!("restore of {} failed: {}", subvol, e);
                outcome.error = Some(e.to_string());
            }
        }

        outcome
    }

    /// Downloads the artifact to scratch, then feeds it through the
    /// opening stream and gzip into `btrfs receive`. Scratch state is
    /// removed on all exits; the receive child is killed on stream
    /// errors so it can never wait on a dead pipe.
    fn receive(
        &self,
        host: &str,
        remote_file: &str,
        target: Option<&Path>,
        passphrase: &[u8],
    ) -> Result<(PathBuf, u64), EngineError> {
        let scratch = tempfile::Builder::new().prefix("pbak_restore_").tempdir()?;
        let artifact = scratch.path().join("artifact.btrfs.gpg");

        let size = self.remote.download(host, remote_file, &artifact)?;

        let target_dir = match target {
            Some(target) => target.to_path_buf(),
            None => std::env::temp_dir().join("pbak_restore"),
        };
        fs::create_dir_all(&target_dir)?;

        let mut child = Command::new("btrfs")
            .arg("receive")
            .arg(&target_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(LocalError::Io)?;

        let stderr = child.stderr.take().map(remote::spawn_reader);
        let stdin = child.stdin.take().ok_or(LocalError::NoBtrfsInput)?;

        let gz = GzDecoder::new(BufWriter::with_capacity(2 * CHUNKSIZE, stdin));
        let mut opening = OpeningStream::new(gz, passphrase);

        let streamed: Result<(), EngineError> = (|| {
            let mut file = BufReader::with_capacity(2 * CHUNKSIZE, File::open(&artifact)?);
            io::copy(&mut file, &mut opening)?;
            opening.close()?;
            Ok(())
        })();

        // Dropping the stream flushes the decoder and closes the pipe;
        // only then may the child be waited on.
        drop(opening);

        if let Err(e) = streamed {
            child.kill().ok();
            child.wait().ok();
            return Err(e);
        }

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

        Ok((target_dir, size))
    }

    /// Scans the remote month directories and returns every backup day
    /// at least one artifact exists for, oldest first.
    pub fn available_dates(&self) -> Result<Vec<String>, EngineError> {
        let host = self.resolver.resolve(&self.settings.unraid_tailscale_name);
        let base = self.settings.remote_client_dir();

        let output = self
            .remote
            .exec_checked(&host, &format!("ls -1 '{}' 2>/dev/null || true", base))?;

        let mut dates = BTreeSet::new();

        for month in output
            .stdout_text()
            .lines()
            .filter(|name| is_month_name(name))
        {
            for kind in [BackupKind::Full, BackupKind::Incremental] {
                let listing = self.remote.exec_checked(
                    &host,
                    &format!(
                        "ls -1 '{}/{}/{}' 2>/dev/null || true",
                        base,
                        month,
                        kind.as_str()
                    ),
                )?;

                for name in listing.stdout_text().lines() {
                    if let Some(date) = artifact_date(name) {
                        dates.insert(date);
                    }
                }
            }
        }

        Ok(dates.into_iter().collect())
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

    fn engine(script: RemoteScript) -> RestoreEngine {
        let mut settings = Settings::default();
        settings.client_name = "box".to_string();
        settings.unraid_base_path = "/backups".to_string();
        settings.unraid_tailscale_name = "tower".to_string();

        RestoreEngine::new(settings, Box::new(script), Box::new(FixedResolver))
    }

    fn request(verify_only: bool) -> RestoreRequest {
        RestoreRequest {
            date: "20260707".to_string(),
            kind: BackupKind::Full,
            subvolumes: vec!["@".to_string()],
            target_path: None,
            verify_only,
        }
    }

    #[test]
    fn rejects_malformed_requests() {
        let engine = engine(RemoteScript::new());

        let mut bad_date = request(true);
        bad_date.date = "2026-07-07".to_string();
        assert!(matches!(
            engine.perform_restore(&bad_date),
            Err(EngineError::InvalidRequest(_))
        ));

        let mut no_subvols = request(true);
        no_subvols.subvolumes.clear();
        assert!(matches!(
            engine.perform_restore(&no_subvols),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn verify_only_reads_size_and_signature() {
        let path = "/backups/box/202607/full/@_20260707_full.btrfs.gpg";
        let script = RemoteScript::new()
            .expect_exec(
                &format!(
                    "if [ -f '{}' ]; then stat -c %s '{}'; else echo NOT_FOUND; fi",
                    path, path
                ),
                0,
                "4096\n",
            )
            .expect_exec(&format!("head -c 5 '{}'", path), 0, "PBAK\x01");

        let engine = engine(script);
        let report = engine.perform_restore(&request(true)).unwrap();

        assert!(report.success);
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.outcomes[0].verified_only);
        assert_eq!(report.outcomes[0].size_bytes, 4096);
        assert!(!engine.is_active());
    }

    #[test]
    fn missing_artifact_fails_that_subvolume() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("key");
        fs::write(&key, "secret").unwrap();
        fs::set_permissions(&key, fs::Permissions::from_mode(0o600)).unwrap();

        let path = "/backups/box/202607/full/@_20260707_full.btrfs.gpg";
        let script = RemoteScript::new().expect_exec(
            &format!(
                "if [ -f '{}' ]; then stat -c %s '{}'; else echo NOT_FOUND; fi",
                path, path
            ),
            0,
            "NOT_FOUND\n",
        );

        let mut settings = Settings::default();
        settings.client_name = "box".to_string();
        settings.unraid_base_path = "/backups".to_string();
        settings.encryption_key_path = key;
        let engine = RestoreEngine::new(settings, Box::new(script), Box::new(FixedResolver));

        let report = engine.perform_restore(&request(false)).unwrap();
        assert!(!report.success);
        assert_eq!(
            report.outcomes[0].error.as_deref(),
            Some("artifact not found on remote host")
        );
    }

    #[test]
    fn second_restore_observes_busy() {
        let engine = engine(RemoteScript::new());

        let guard = engine.acquire().unwrap();
        assert!(matches!(engine.acquire(), Err(EngineError::Busy)));
        drop(guard);
        engine.acquire().unwrap();
    }

    #[test]
    fn parses_artifact_dates() {
        assert_eq!(
            artifact_date("@_20260707_full.btrfs.gpg").as_deref(),
            Some("20260707")
        );
        assert_eq!(
            artifact_date("@home_20260708_incremental.btrfs.gpg").as_deref(),
            Some("20260708")
        );
        assert!(artifact_date("@_baddate_full.btrfs.gpg").is_none());
        assert!(artifact_date("notes.txt").is_none());
    }

    #[test]
    fn available_dates_scans_months_and_kinds() {
        let script = RemoteScript::new()
            .expect_exec("ls -1 '/backups/box' 2>/dev/null || true", 0, "202607\n")
            .expect_exec(
                "ls -1 '/backups/box/202607/full' 2>/dev/null || true",
                0,
                "@_20260707_full.btrfs.gpg\n@home_20260707_full.btrfs.gpg\n",
            )
            .expect_exec(
                "ls -1 '/backups/box/202607/incremental' 2>/dev/null || true",
                0,
                "@_20260708_incremental.btrfs.gpg\n",
            );

        let engine = engine(script);
        assert_eq!(
            engine.available_dates().unwrap(),
            vec!["20260707".to_string(), "20260708".to_string()]
        );
    }
}
