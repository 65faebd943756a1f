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

use crate::LedgerError;

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A `BackupKind` distinguishes full snapshot streams from incremental
/// streams relative to a parent snapshot.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// A self-contained stream of the entire subvolume.
    Full,
    /// A delta stream relative to the last successfully sent snapshot.
    Incremental,
}

impl BackupKind {
    /// Returns the canonical lowercase name of the `BackupKind`.
    /// This name is used in artifact file names, remote directory names
    /// and the sent-ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for BackupKind {
    type Error = LedgerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            _ => Err(LedgerError::UnknownKind(value.to_string())),
        }
    }
}

/// A `RunStatus` is the aggregate outcome of a backup run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// The run is still in progress.
    Running,
    /// All subvolumes were delivered and verified.
    Success,
    /// At least one but not all subvolumes succeeded.
    Partial,
    /// No subvolume succeeded, or the run aborted as a whole.
    Failed,
    /// The run was cancelled cooperatively.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };

        write!(f, "{}", s)
    }
}

impl TryFrom<&str> for RunStatus {
    type Error = LedgerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(LedgerError::UnknownStatus(value.to_string())),
        }
    }
}

/// A `Progress` is a point-in-time snapshot of a running backup,
/// published after every state entry. Subscribers that miss a snapshot
/// do not get it replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// A human-readable label of the current step.
    pub step: String,
    /// The index of the current step, starting at 1.
    pub step_num: u32,
    /// The total number of steps of a run.
    pub total_steps: u32,
    /// The overall completion percentage, monotonic within a run.
    pub percentage: f32,
    /// The artifact currently being produced or transferred, if any.
    pub current_file: Option<String>,
    /// The most recently measured transfer throughput in MB/s, if any.
    pub speed_mbps: Option<f64>,
}

/// A `SubvolResult` is the outcome of backing up a single subvolume
/// within a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubvolResult {
    /// The logical name of the subvolume.
    pub subvol: String,
    /// The kind of stream that was produced for this subvolume.
    /// May differ from the run kind when no sent parent existed.
    pub kind: BackupKind,
    /// The remote artifact path, if an upload was attempted.
    pub remote_path: Option<String>,
    /// The size of the produced envelope in bytes.
    pub size_bytes: u64,
    /// Whether the remote artifact passed post-transfer verification.
    pub verified: bool,
    /// The failure message, if the subvolume failed.
    pub error: Option<String>,
}

impl SubvolResult {
    /// Reports whether this subvolume was delivered and recorded.
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// A `RunResult` is the aggregate outcome of one backup run.
/// It is recorded to the backup history for reporting
/// and never read back to decide orchestration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// The aggregate status of the run.
    pub status: RunStatus,
    /// The kind that was decided for the run.
    pub kind: BackupKind,
    /// When the run started.
    pub started: NaiveDateTime,
    /// When the run finished, if it did.
    pub finished: Option<NaiveDateTime>,
    /// The wall-clock duration of the run in seconds.
    pub duration_seconds: i64,
    /// The total size of all successfully delivered envelopes in bytes.
    pub total_bytes: u64,
    /// The failure message if the run aborted as a whole.
    pub error: Option<String>,
    /// The per-subvolume outcomes in configured order.
    pub subvolumes: Vec<SubvolResult>,
}

/// A `RemoteCheck` is the result of probing a remote artifact path.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteCheck {
    /// Whether a regular file exists at the path.
    pub exists: bool,
    /// The size of the file in bytes, if it exists.
    pub size: Option<u64>,
}

/// An `EnvelopeCheck` is the result of inspecting a remote artifact's
/// leading bytes against the encryption envelope signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeCheck {
    /// Whether the artifact starts with the envelope signature.
    pub valid: bool,
    /// The size of the artifact in bytes.
    pub size: u64,
}

/// A `HistoryEntry` is a stored [`RunResult`] with its database identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The database identity of the entry.
    pub id: i64,
    /// The stored run outcome.
    pub result: RunResult,
}
