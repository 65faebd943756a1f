// pbak is a tool for driving and inspecting encrypted btrfs backups.
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

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid month \"{0}\", expected YYYYMM")]
    InvalidMonth(String),
    #[error("The encryption key file \"{0}\" already exists")]
    KeyExists(PathBuf),

    #[error("An error occured on the local machine: {0}")]
    PbakLocal(#[from] pbak_common::LocalError),
    #[error("An engine error occured: {0}")]
    PbakEngine(#[from] pbak_common::EngineError),
    #[error("A ledger error occured: {0}")]
    PbakLedger(#[from] pbak_common::LedgerError),
    #[error("A remote error occured: {0}")]
    PbakRemote(#[from] pbak_common::RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
