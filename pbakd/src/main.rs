// pbakd is the pbak daemon running scheduled encrypted backups.
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
use pbak_common::remote::{SshExec, TailscaleResolver};
use pbak_common::schedule::Scheduler;

use std::fs::{self, File};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use fork::Fork;
use log::{error, info};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Background process running scheduled encrypted backups.
struct Args {
    /// Stay attached to the terminal instead of daemonizing.
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    if !args.debug {
        match fork::daemon(false, false) {
            Ok(Fork::Child) => {}
            Ok(Fork::Parent(_)) => process::exit(0),
            Err(e) => {
                eprintln!("Daemonization error: {}", e);
                process::exit(1);
            }
        }
    }

    if let Err(e) = init_logging(args.debug) {
        eprintln!("Logging setup error: {}", e);
        process::exit(1);
    }

    match serve() {
        Ok(_) => {}
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

/// Logs to stderr in debug mode and to a dated file under the data
/// directory when daemonized.
fn init_logging(debug: bool) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if !debug {
        let log_dir = Path::new(Settings::DATA_DIR).join("logs");
        fs::create_dir_all(&log_dir)?;

        let file = File::create(log_dir.join(format!("pbakd_{}.log", Local::now().format("%Y%m%d"))))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn serve() -> Result<()> {
    let should_exit = Arc::new(AtomicBool::new(false));
    let should_exit2 = Arc::clone(&should_exit);

    ctrlc::set_handler(move || {
        should_exit2.store(true, Ordering::SeqCst);
    })?;

    let settings = Settings::load()?;
    let ledger = Ledger::open(&settings.database_path())?;
    let remote = SshExec::new(&settings)?;
    let resolver = TailscaleResolver::new(&settings);

    let engine = Arc::new(BackupEngine::new(
        settings.clone(),
        Box::new(remote),
        Box::new(resolver),
        ledger,
    ));

    let mut scheduler = Scheduler::new(Arc::clone(&engine));
    scheduler.start(&settings)?;

    info!("pbakd running as client \"{}\"", settings.client_name);

    while !should_exit.load(Ordering::SeqCst) {
        thread::sleep(TICK);
    }

    info!("caught SIGINT, SIGTERM or SIGHUP, exiting");

    // The active run (if any) observes the cancel flag at its next
    // state boundary; stopping the scheduler joins its thread.
    engine.request_cancel();
    scheduler.stop();

    Ok(())
}
