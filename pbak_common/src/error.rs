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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A `SnapshotParseError` indicates a failure parsing a snapshot name.
#[derive(Debug, Error)]
pub enum SnapshotParseError {
    /// When parsing from a [`std::path::Path`] this error indicates
    /// that [`std::path::Path::file_name`] returned `None`
    /// which happens when the last part of the path is the double dot.
    #[error("Snapshot path ends in ..")]
    NoFileName,

    /// When parsing from a [`std::path::Path`] this error indicates
    /// that the return value of [`std::path::Path::file_name`]
    /// could not be converted to a regular string
    /// due to it containing invalid Unicode.
    #[error("Snapshot path contains invalid unicode")]
    InvalidUnicode,

    /// The name is missing the timestamp of when the snapshot was taken.
    #[error("Incomplete snapshot name: Missing creation timestamp")]
    MissingTimestamp,

    /// The timestamp of when the snapshot was taken
    /// does not follow the `%Y%m%d_%H%M%S` format.
    #[error("Unable to parse creation timestamp: {0}")]
    MalformedTimestamp(#[from] chrono::ParseError),
}

/// A `LocalError` indicates an error condition on the local machine.
#[derive(Debug, Error)]
pub enum LocalError {
    /// A btrfs command failed to execute correctly.
    #[error("Btrfs command execution failed: {0}")]
    BtrfsCmd(String),
    /// A btrfs command did not provide a stdin file.
    #[error("Btrfs command does not have stdin")]
    NoBtrfsInput,
    /// A btrfs command did not provide a stdout file.
    #[error("Btrfs command does not have stdout")]
    NoBtrfsOutput,

    /// A snapshot with the same name already exists.
    #[error("A snapshot at \"{0}\" already exists")]
    SnapshotExists(PathBuf),
    /// There was a failure parsing a snapshot name.
    #[error("Failed to parse snapshot name: {0}")]
    SnapshotParse(#[from] SnapshotParseError),

    /// The settings file or an updated value failed validation.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    /// The permissions on a secret file are insecure.
    #[error("Insecure permissions on \"{0}\" (limit access to root user!)")]
    InsecurePerms(PathBuf),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A JSON (de)serialization error occured.
    #[error("JSON (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Password-based key derivation using Argon2id failed.
    #[error("Password-based key derivation using Argon2id failed: {0}")]
    Argon2(#[from] argon2::Error),
    /// The encryption or decryption of some data failed.
    #[error("Encryption or decryption failure")]
    AesGcm(#[from] aes_gcm::Error),
}

/// A `RemoteError` indicates a failure executing a command on
/// or streaming bytes to or from the remote storage host.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote host could not be reached at the transport level.
    #[error("Remote host unreachable: {0}")]
    Unreachable(String),
    /// The remote host rejected the public-key authentication.
    #[error("Access denied by remote host")]
    AuthDenied,
    /// The remote command exited with a non-zero status.
    #[error("Remote command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
    /// The call did not complete within its deadline.
    #[error("Remote call exceeded its {0} second deadline")]
    Timeout(u64),
    /// The remote command produced output that could not be interpreted.
    #[error("Unexpected remote command output: {0}")]
    BadOutput(String),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A `LedgerError` indicates a failure reading or durably writing
/// the sent-ledger or the backup history.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The underlying database reported an error.
    #[error("Ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored timestamp does not follow the `%Y-%m-%d %H:%M:%S` format.
    #[error("Malformed ledger timestamp: {0}")]
    BadTimestamp(#[from] chrono::ParseError),
    /// A stored backup kind is neither "full" nor "incremental".
    #[error("Unknown backup kind \"{0}\" in ledger")]
    UnknownKind(String),
    /// A stored run status is not one of the known states.
    #[error("Unknown run status \"{0}\" in history")]
    UnknownStatus(String),
    /// A stored per-subvolume result document could not be (de)serialized.
    #[error("Malformed history document: {0}")]
    Json(#[from] serde_json::Error),
    /// The database directory could not be created.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// An `EngineError` indicates a failure of a backup or restore run
/// as a whole. Per-subvolume failures are reported in the run result
/// instead and do not abort the run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another run is already active. Requests do not queue.
    #[error("Another run is already active")]
    Busy,
    /// The request is malformed (bad date, empty subvolume list, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The remote artifact does not match the locally produced envelope.
    #[error("Verification failed: expected {expected} bytes, remote has {actual}")]
    VerifyFailed { expected: u64, actual: u64 },

    /// An error occured on the local machine.
    #[error("Local error: {0}")]
    Local(#[from] LocalError),
    /// An error occured on the connection to or on the remote host.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    /// The sent-ledger or history could not be read or written.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
