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

use crate::config::{self, Settings};
use crate::{LocalError, RemoteError};

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Deserialize;

/// How often a running remote command is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The interval in seconds of the SSH keep-alive probes that detect
/// dead connections on deadline-less transfers.
const KEEPALIVE_SECS: u32 = 15;

/// A `CmdOutput` is the captured result of a completed remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CmdOutput {
    /// The exit status of the remote command.
    pub status: i32,
    /// The raw standard output of the remote command.
    pub stdout: Vec<u8>,
    /// The raw standard error of the remote command.
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    /// Reports whether the remote command exited with status zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Returns the standard output as trimmed text,
    /// replacing invalid Unicode.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Returns the standard error as trimmed text,
    /// replacing invalid Unicode.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// A `RemoteExec` runs commands and streams bytes to or from
/// the remote storage host.
///
/// Implementations never retry; retry is a policy of callers.
/// The transport failure modes all implementations share are
/// [`RemoteError::Unreachable`], [`RemoteError::AuthDenied`],
/// [`RemoteError::Timeout`] and [`RemoteError::Io`]. Non-zero exits
/// of the remote command itself are reported in the [`CmdOutput`].
pub trait RemoteExec: Send + Sync {
    /// Executes a shell command on the remote host
    /// and captures its output.
    fn exec(&self, host: &str, command: &str) -> Result<CmdOutput, RemoteError>;

    /// Streams a local file to the specified remote path,
    /// returning the number of bytes transferred.
    fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<u64, RemoteError>;

    /// Streams a remote file to the specified local path,
    /// returning the number of bytes transferred.
    fn download(&self, host: &str, remote: &str, local: &Path) -> Result<u64, RemoteError>;

    /// Executes a shell command on the remote host, converting
    /// a non-zero exit status into [`RemoteError::CommandFailed`].
    fn exec_checked(&self, host: &str, command: &str) -> Result<CmdOutput, RemoteError> {
        let output = self.exec(host, command)?;

        if output.success() {
            Ok(output)
        } else {
            Err(RemoteError::CommandFailed {
                status: output.status,
                stderr: output.stderr_text(),
            })
        }
    }

    /// Creates a directory and all of its parents on the remote host.
    fn mkdir_p(&self, host: &str, dir: &str) -> Result<(), RemoteError> {
        self.exec_checked(host, &format!("mkdir -p '{}'", dir))
            .map(|_| ())
    }

    /// Deletes a file on the remote host. Missing files are not an error.
    fn remove_file(&self, host: &str, path: &str) -> Result<(), RemoteError> {
        self.exec_checked(host, &format!("rm -f '{}'", path))
            .map(|_| ())
    }

    /// Probes the connection and authentication to the remote host.
    fn test_connection(&self, host: &str) -> Result<(), RemoteError> {
        self.exec_checked(host, "echo ok").map(|_| ())
    }
}

/// An `SshExec` executes remote operations through the `ssh` binary
/// using public-key authentication. Host-key checking is advisory
/// (`accept-new`), and every command carries the configured deadline.
/// Transfers have no overall deadline; dead connections surface
/// as I/O errors through the keep-alive probes.
pub struct SshExec {
    user: String,
    port: u16,
    key_path: PathBuf,
    timeout: Duration,
}

impl SshExec {
    /// Returns a new `SshExec` for the configured remote host,
    /// verifying that the private key file is protected.
    pub fn new(settings: &Settings) -> Result<Self, LocalError> {
        config::check_secret_perms(&settings.ssh_key_path)?;

        Ok(Self {
            user: settings.unraid_user.clone(),
            port: settings.unraid_ssh_port,
            key_path: settings.ssh_key_path.clone(),
            timeout: Duration::from_secs(settings.tailscale_timeout),
        })
    }

    fn ssh_command(&self, host: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.key_path)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.timeout.as_secs()))
            .arg("-o")
            .arg(format!("ServerAliveInterval={}", KEEPALIVE_SECS))
            .arg("-o")
            .arg("ServerAliveCountMax=4")
            .arg(format!("{}@{}", self.user, host));

        cmd
    }

    /// Converts a finished `ssh` invocation into a [`CmdOutput`]
    /// or a transport error. Exit status 255 is `ssh` itself failing;
    /// everything else is the remote command's own status.
    fn classify(
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    ) -> Result<CmdOutput, RemoteError> {
        let code = match status.code() {
            Some(code) => code,
            None => return Err(RemoteError::Unreachable("ssh terminated by signal".into())),
        };

        if code == 255 {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();

            if stderr.contains("Permission denied") || stderr.contains("publickey") {
                return Err(RemoteError::AuthDenied);
            }

            return Err(RemoteError::Unreachable(stderr));
        }

        Ok(CmdOutput {
            status: code,
            stdout,
            stderr,
        })
    }
}

impl RemoteExec for SshExec {
    fn exec(&self, host: &str, command: &str) -> Result<CmdOutput, RemoteError> {
        debug!("remote {}: {}", host, command);

        let mut child = self
            .ssh_command(host)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = drain_stdout(&mut child);
        let stderr = drain_stderr(&mut child);

        let status = wait_deadline(&mut child, self.timeout)?;

        Self::classify(status, join_reader(stdout), join_reader(stderr))
    }

    fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<u64, RemoteError> {
        debug!("uploading {} to {}:{}", local.display(), host, remote);

        let mut child = self
            .ssh_command(host)
            .arg(format!("cat > '{}'", remote))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = drain_stderr(&mut child);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("ssh does not have stdin"))?;
        let mut file = BufReader::new(File::open(local)?);

        let n = match io::copy(&mut file, &mut stdin) {
            Ok(n) => n,
            Err(e) => {
                // The transfer is already broken; the exit status decides
                // whether this was a connection or an authentication failure.
                drop(stdin);
                let status = child.wait()?;
                Self::classify(status, Vec::new(), join_reader(stderr))?;
                return Err(e.into());
            }
        };
        drop(stdin);

        let status = child.wait()?;
        let output = Self::classify(status, Vec::new(), join_reader(stderr))?;

        if !output.success() {
            return Err(RemoteError::CommandFailed {
                status: output.status,
                stderr: output.stderr_text(),
            });
        }

        Ok(n)
    }

    fn download(&self, host: &str, remote: &str, local: &Path) -> Result<u64, RemoteError> {
        debug!("downloading {}:{} to {}", host, remote, local.display());

        let mut child = self
            .ssh_command(host)
            .arg(format!("cat '{}'", remote))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = drain_stderr(&mut child);

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("ssh does not have stdout"))?;
        let mut file = File::create(local)?;

        let copied = io::copy(&mut stdout, &mut file);

        let status = child.wait()?;
        let output = Self::classify(status, Vec::new(), join_reader(stderr))?;

        if !output.success() {
            return Err(RemoteError::CommandFailed {
                status: output.status,
                stderr: output.stderr_text(),
            });
        }

        Ok(copied?)
    }
}

fn drain_stdout(child: &mut Child) -> Option<JoinHandle<Vec<u8>>> {
    child.stdout.take().map(spawn_reader::<ChildStdout>)
}

fn drain_stderr(child: &mut Child) -> Option<JoinHandle<Vec<u8>>> {
    child.stderr.take().map(spawn_reader::<ChildStderr>)
}

/// Collects a child output pipe on a separate thread so that
/// waiting on the child can never deadlock on a full pipe buffer.
pub(crate) fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).ok();
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Waits for a child process to exit, killing it once the deadline
/// has passed.
fn wait_deadline(child: &mut Child, timeout: Duration) -> Result<ExitStatus, RemoteError> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait().ok();

            return Err(RemoteError::Timeout(timeout.as_secs()));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// A `ResolveHost` maps the configured remote host name
/// to a connectable address.
pub trait ResolveHost: Send + Sync {
    /// Resolves the specified host name, falling back to the name itself
    /// if no better address is known.
    fn resolve(&self, name: &str) -> String;
}

/// A `TailscaleResolver` resolves the remote host through the local
/// `tailscale status --json` document, using the first address of the
/// peer whose host name matches case-insensitively. Any failure falls
/// back to the plain name.
pub struct TailscaleResolver {
    enabled: bool,
}

impl TailscaleResolver {
    /// Returns a new `TailscaleResolver` honoring the `use_tailscale`
    /// setting.
    pub fn new(settings: &Settings) -> Self {
        Self {
            enabled: settings.use_tailscale,
        }
    }
}

impl ResolveHost for TailscaleResolver {
    fn resolve(&self, name: &str) -> String {
        if !self.enabled {
            return name.to_string();
        }

        match tailscale_status() {
            Ok(status) => match status.address_of(name) {
                Some(address) => address,
                None => {
                    warn!("peer \"{}\" not found in mesh status, using name", name);
                    name.to_string()
                }
            },
            Err(e) => {
                warn!("unable to read mesh status ({}), using name", e);
                name.to_string()
            }
        }
    }
}

/// The subset of the `tailscale status --json` document
/// needed for peer resolution.
#[derive(Debug, Deserialize)]
pub(crate) struct TailscaleStatus {
    #[serde(rename = "Peer", default)]
    peers: HashMap<String, TailscalePeer>,
}

#[derive(Debug, Deserialize)]
struct TailscalePeer {
    #[serde(rename = "HostName", default)]
    host_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    addresses: Vec<String>,
}

impl TailscaleStatus {
    pub(crate) fn address_of(&self, name: &str) -> Option<String> {
        self.peers
            .values()
            .find(|peer| peer.host_name.eq_ignore_ascii_case(name))
            .and_then(|peer| peer.addresses.first().cloned())
    }
}

fn tailscale_status() -> Result<TailscaleStatus, LocalError> {
    let output = Command::new("tailscale")
        .arg("status")
        .arg("--json")
        .stdin(Stdio::null())
        .output()?;

    if !output.status.success() {
        return Err(LocalError::ConfigInvalid(
            "tailscale status exited with a non-zero status".to_string(),
        ));
    }

    Ok(serde_json::from_slice(&output.stdout)?)
}


#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_JSON: &str = r#"{
        "BackendState": "Running",
        "Peer": {
            "nodekey:aa": {
                "HostName": "Tower",
                "TailscaleIPs": ["100.64.0.7", "fd7a::7"]
            },
            "nodekey:bb": {
                "HostName": "laptop",
                "TailscaleIPs": ["100.64.0.9"]
            }
        }
    }"#;

    #[test]
    fn resolves_peer_case_insensitively() {
        let status: TailscaleStatus = serde_json::from_str(STATUS_JSON).unwrap();

        assert_eq!(status.address_of("tower").unwrap(), "100.64.0.7");
    }

    #[test]
    fn unknown_peer_resolves_to_none() {
        let status: TailscaleStatus = serde_json::from_str(STATUS_JSON).unwrap();

        assert!(status.address_of("nas").is_none());
    }

    #[test]
    fn peerless_status_parses() {
        let status: TailscaleStatus = serde_json::from_str(r#"{"BackendState":"Stopped"}"#).unwrap();

        assert!(status.address_of("tower").is_none());
    }

    #[test]
    fn checked_exec_surfaces_remote_exit() {
        let script = testing::RemoteScript::new().expect_exec("false", 1, "");

        assert!(matches!(
            script.exec_checked("host", "false"),
            Err(RemoteError::CommandFailed { status: 1, .. })
        ));
        script.finish();
    }
}
