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

mod error;
use error::*;

use pbak_common::config::Settings;
use pbak_common::engine::BackupEngine;
use pbak_common::ledger::Ledger;
use pbak_common::remote::{RemoteExec, ResolveHost, SshExec, TailscaleResolver};
use pbak_common::report::{BackupKind, RunStatus};
use pbak_common::restore::{RestoreEngine, RestoreRequest};
use pbak_common::snapshot::SnapshotManager;

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::{process, thread};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Perform basic initialization of the settings and encryption key.
    Init,
    /// Run a backup now.
    Backup {
        /// Force a full backup regardless of the usual rules.
        #[arg(short, long)]
        full: bool,
    },
    /// Restore subvolumes from a backup day.
    ///
    /// Restoring an incremental requires its parent snapshot to have
    /// been received into the same target beforehand.
    Restore {
        /// The backup day in YYYYMMDD format.
        date: String,
        /// The artifact kind to restore ("full" or "incremental").
        kind: String,
        /// The subvolumes to restore.
        subvols: Vec<String>,
        /// Receive into this directory instead of the scratch location.
        #[arg(short, long)]
        target: Option<PathBuf>,
    },
    /// Inspect remote artifacts of a backup day without downloading them.
    Verify {
        /// The backup day in YYYYMMDD format.
        date: String,
        /// The artifact kind to inspect ("full" or "incremental").
        kind: String,
        /// The subvolumes to inspect.
        subvols: Vec<String>,
    },
    /// List local snapshots.
    Snapshots,
    /// Show recent backup runs.
    History {
        /// The maximum number of entries to show.
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// List the backup days available for restore.
    Dates,
    /// List the remote artifacts of a month (YYYYMM).
    Browse {
        /// The month to browse in YYYYMM format.
        month: String,
    },
    /// Check connectivity and authentication to the remote host.
    Check,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match logic() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn logic() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => init(),
        Commands::Backup { full } => backup(full),
        Commands::Restore {
            date,
            kind,
            subvols,
            target,
        } => restore(date, kind, subvols, target, false),
        Commands::Verify {
            date,
            kind,
            subvols,
        } => restore(date, kind, subvols, None, true),
        Commands::Snapshots => snapshots(),
        Commands::History { limit } => history(limit),
        Commands::Dates => dates(),
        Commands::Browse { month } => browse(month),
        Commands::Check => check(),
    }
}

fn init() -> Result<()> {
    let settings = Settings::load()?;
    println!("Settings file at {}", Settings::PATH);

    if settings.encryption_key_path.exists() {
        return Err(Error::KeyExists(settings.encryption_key_path));
    }

    let passphrase = rpassword::prompt_password("Enter new encryption passphrase: ")?;

    let mut f = OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(&settings.encryption_key_path)?;
    writeln!(f, "{}", passphrase)?;

    println!(
        "Encryption key written to {}",
        settings.encryption_key_path.display()
    );
    println!("Losing this passphrase makes every backup unrecoverable. Keep a copy!");

    Ok(())
}

fn backup(full: bool) -> Result<()> {
    let settings = Settings::load()?;

    let ledger = Ledger::open(&settings.database_path())?;
    let engine = Arc::new(BackupEngine::new(
        settings.clone(),
        Box::new(SshExec::new(&settings)?),
        Box::new(TailscaleResolver::new(&settings)),
        ledger,
    ));

    let subscription = engine.subscribe();
    let printer = thread::spawn(move || {
        while let Some(progress) = subscription.recv() {
            match &progress.current_file {
                Some(file) => println!(
                    "[{}/{}] {} ({:.0}%) {}",
                    progress.step_num, progress.total_steps, progress.step, progress.percentage, file
                ),
                None => println!(
                    "[{}/{}] {} ({:.0}%)",
                    progress.step_num, progress.total_steps, progress.step, progress.percentage
                ),
            }
        }
    });

    let result = engine.perform_backup(None, full)?;

    drop(engine);
    printer.join().ok();

    println!(
        "Backup {}: kind={}, {} bytes, {} seconds",
        result.status, result.kind, result.total_bytes, result.duration_seconds
    );
    for sub in &result.subvolumes {
        match &sub.error {
            None => println!("  {}: {} ({} bytes)", sub.subvol, sub.kind, sub.size_bytes),
            Some(e) => println!("  {}: failed: {}", sub.subvol, e),
        }
    }

    if result.status == RunStatus::Failed {
        process::exit(1);
    }

    Ok(())
}

fn restore(
    date: String,
    kind: String,
    subvols: Vec<String>,
    target: Option<PathBuf>,
    verify_only: bool,
) -> Result<()> {
    let settings = Settings::load()?;

    let engine = RestoreEngine::new(
        settings.clone(),
        Box::new(SshExec::new(&settings)?),
        Box::new(TailscaleResolver::new(&settings)),
    );

    let request = RestoreRequest {
        date,
        kind: BackupKind::try_from(kind.as_str())?,
        subvolumes: subvols,
        target_path: target,
        verify_only,
    };

    let report = engine.perform_restore(&request)?;

    for outcome in &report.outcomes {
        match (&outcome.error, outcome.verified_only) {
            (None, true) => println!(
                "  {}: valid envelope, {} bytes",
                outcome.subvol, outcome.size_bytes
            ),
            (None, false) => println!(
                "  {}: restored to {} ({} bytes)",
                outcome.subvol,
                outcome
                    .restored_to
                    .as_deref()
                    .unwrap_or_else(|| std::path::Path::new("?"))
                    .display(),
                outcome.size_bytes
            ),
            (Some(e), _) => println!("  {}: failed: {}", outcome.subvol, e),
        }
    }

    if !report.success {
        process::exit(1);
    }

    Ok(())
}

fn snapshots() -> Result<()> {
    let settings = Settings::load()?;
    let manager = SnapshotManager::new(settings.snapshot_dir.clone(), settings.subvolumes());

    for snapshot in manager.list()? {
        println!(
            "{}\t{}\t{} bytes",
            snapshot,
            snapshot.taken(),
            manager.size_of(snapshot.path())
        );
    }

    Ok(())
}

fn history(limit: u32) -> Result<()> {
    let settings = Settings::load()?;
    let ledger = Ledger::open(&settings.database_path())?;

    for entry in ledger.history(limit)? {
        let result = &entry.result;

        println!(
            "#{} {} {} {} {} bytes, {} seconds",
            entry.id, result.started, result.kind, result.status, result.total_bytes,
            result.duration_seconds
        );

        if let Some(error) = &result.error {
            println!("  error: {}", error);
        }
    }

    Ok(())
}

fn dates() -> Result<()> {
    let settings = Settings::load()?;

    let engine = RestoreEngine::new(
        settings.clone(),
        Box::new(SshExec::new(&settings)?),
        Box::new(TailscaleResolver::new(&settings)),
    );

    for date in engine.available_dates()? {
        println!("{}", date);
    }

    Ok(())
}

fn browse(month: String) -> Result<()> {
    if month.len() != 6 || !month.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidMonth(month));
    }

    let settings = Settings::load()?;
    let remote = SshExec::new(&settings)?;
    let host = TailscaleResolver::new(&settings).resolve(&settings.unraid_tailscale_name);

    for kind in [BackupKind::Full, BackupKind::Incremental] {
        let listing = remote.exec_checked(
            &host,
            &format!(
                "ls -1 '{}/{}/{}' 2>/dev/null || true",
                settings.remote_client_dir(),
                month,
                kind.as_str()
            ),
        )?;

        for name in listing.stdout_text().lines().filter(|l| !l.is_empty()) {
            println!("{}/{}", kind, name);
        }
    }

    Ok(())
}

fn check() -> Result<()> {
    let settings = Settings::load()?;
    let remote = SshExec::new(&settings)?;
    let host = TailscaleResolver::new(&settings).resolve(&settings.unraid_tailscale_name);

    remote.test_connection(&host)?;
    println!("Connection to {} successful", host);

    Ok(())
}
