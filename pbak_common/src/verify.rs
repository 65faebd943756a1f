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

use crate::remote::RemoteExec;
use crate::report::{EnvelopeCheck, RemoteCheck};
use crate::stream::ENVELOPE_MAGIC;
use crate::{EngineError, RemoteError};

use log::warn;

/// A `Verifier` checks remote artifacts after upload and before restore.
/// It never verifies plaintext equality; integrity rests on the
/// encryption layer's authenticator.
pub struct Verifier<'a> {
    remote: &'a dyn RemoteExec,
}

impl<'a> Verifier<'a> {
    /// Returns a new `Verifier` using the provided executor.
    pub fn new(remote: &'a dyn RemoteExec) -> Self {
        Self { remote }
    }

    /// Probes whether a regular file exists at the remote path
    /// and reads its size.
    pub fn check_remote(&self, host: &str, path: &str) -> Result<RemoteCheck, RemoteError> {
        let output = self.remote.exec_checked(
            host,
            &format!(
                "if [ -f '{}' ]; then stat -c %s '{}'; else echo NOT_FOUND; fi",
                path, path
            ),
        )?;

        let text = output.stdout_text();
        if text == "NOT_FOUND" {
            return Ok(RemoteCheck {
                exists: false,
                size: None,
            });
        }

        let size = text
            .parse()
            .map_err(|_| RemoteError::BadOutput(format!("invalid file size \"{}\"", text)))?;

        Ok(RemoteCheck {
            exists: true,
            size: Some(size),
        })
    }

    /// Compares the size of a freshly uploaded artifact against the
    /// locally known envelope size. Any difference fails the check,
    /// as does a missing file.
    pub fn verify_size(&self, host: &str, path: &str, expected: u64) -> Result<(), EngineError> {
        let check = self.check_remote(host, path)?;
        let actual = check.size.unwrap_or(0);

        if !check.exists || actual != expected {
            warn!(
                "size mismatch for {}: expected {}, got {}",
                path, expected, actual
            );

            return Err(EngineError::VerifyFailed { expected, actual });
        }

        Ok(())
    }

    /// Inspects the leading bytes of a remote artifact against the
    /// envelope signature. Used for explicit verify requests and for
    /// restore preflight; only the signature bytes are transferred.
    pub fn inspect_envelope(&self, host: &str, path: &str) -> Result<EnvelopeCheck, RemoteError> {
        let check = self.check_remote(host, path)?;

        let size = match check.size {
            Some(size) if check.exists => size,
            _ => {
                return Ok(EnvelopeCheck {
                    valid: false,
                    size: 0,
                })
            }
        };

        let head = self
            .remote
            .exec_checked(host, &format!("head -c {} '{}'", ENVELOPE_MAGIC.len(), path))?;

        Ok(EnvelopeCheck {
            valid: head.stdout == ENVELOPE_MAGIC,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::remote::testing::RemoteScript;

    const PATH: &str = "/backups/box/202607/full/@_20260707_full.btrfs.gpg";

    fn stat_cmd() -> String {
        format!(
            "if [ -f '{}' ]; then stat -c %s '{}'; else echo NOT_FOUND; fi",
            PATH, PATH
        )
    }

    #[test]
    fn reads_existing_file_size() {
        let script = RemoteScript::new().expect_exec(&stat_cmd(), 0, "1048576\n");

        let check = Verifier::new(&script).check_remote("host", PATH).unwrap();
        assert_eq!(
            check,
            RemoteCheck {
                exists: true,
                size: Some(1048576)
            }
        );
        script.finish();
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let script = RemoteScript::new().expect_exec(&stat_cmd(), 0, "NOT_FOUND\n");

        let check = Verifier::new(&script).check_remote("host", PATH).unwrap();
        assert!(!check.exists);
        script.finish();
    }

    #[test]
    fn size_mismatch_fails_verification() {
        let script = RemoteScript::new().expect_exec(&stat_cmd(), 0, "100\n");

        assert!(matches!(
            Verifier::new(&script).verify_size("host", PATH, 200),
            Err(EngineError::VerifyFailed {
                expected: 200,
                actual: 100
            })
        ));
        script.finish();
    }

    #[test]
    fn matching_size_passes_verification() {
        let script = RemoteScript::new().expect_exec(&stat_cmd(), 0, "200\n");

        Verifier::new(&script).verify_size("host", PATH, 200).unwrap();
        script.finish();
    }

    #[test]
    fn envelope_inspection_reads_the_signature() {
        let script = RemoteScript::new()
            .expect_exec(&stat_cmd(), 0, "512\n")
            .expect_exec(&format!("head -c 5 '{}'", PATH), 0, "PBAK\x01");

        let check = Verifier::new(&script).inspect_envelope("host", PATH).unwrap();
        assert_eq!(check, EnvelopeCheck { valid: true, size: 512 });
        script.finish();
    }

    #[test]
    fn foreign_signature_is_invalid() {
        let script = RemoteScript::new()
            .expect_exec(&stat_cmd(), 0, "512\n")
            .expect_exec(&format!("head -c 5 '{}'", PATH), 0, "GPGAA");

        let check = Verifier::new(&script).inspect_envelope("host", PATH).unwrap();
        assert!(!check.valid);
        script.finish();
    }
}
