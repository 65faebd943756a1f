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

use crate::config::Settings;
use crate::engine::BackupEngine;
use crate::report::RunStatus;
use crate::{EngineError, LocalError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, Local, LocalResult, NaiveTime, TimeZone, Weekday};
use log::{error, info, warn};

/// How often the scheduler thread checks for its trigger time
/// and the stop flag.
const TICK: StdDuration = StdDuration::from_secs(1);

/// Computes the next trigger instant strictly after `now` for the
/// specified weekday set and local wall-clock time.
///
/// Days skipped by a DST gap fall through to the next valid occurrence;
/// an ambiguous local time resolves to its earlier instant.
pub fn next_occurrence<Tz: TimeZone>(
    now: DateTime<Tz>,
    days: &[Weekday],
    time: NaiveTime,
) -> Option<DateTime<Tz>> {
    if days.is_empty() {
        return None;
    }

    for offset in 0..=7 {
        let date = now.date_naive() + Duration::days(offset);
        if !days.contains(&date.weekday()) {
            continue;
        }

        let candidate = date.and_time(time);
        if offset == 0 && candidate <= now.naive_local() {
            continue;
        }

        match candidate.and_local_timezone(now.timezone()) {
            LocalResult::Single(at) => return Some(at),
            LocalResult::Ambiguous(early, _) => return Some(early),
            LocalResult::None => continue,
        }
    }

    None
}

/// A `Scheduler` triggers backup runs on the configured weekdays at the
/// configured local time. If a run is already active when the trigger
/// fires, the trigger is a logged no-op. Reloading applies fresh
/// settings by stopping and restarting the trigger thread.
pub struct Scheduler {
    engine: Arc<BackupEngine>,
    stop: Arc<AtomicBool>,
    next_run: Arc<Mutex<Option<DateTime<Local>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Returns a new, stopped `Scheduler` driving the provided engine.
    pub fn new(engine: Arc<BackupEngine>) -> Self {
        Self {
            engine,
            stop: Arc::new(AtomicBool::new(false)),
            next_run: Arc::new(Mutex::new(None)),
            handle: None,
        }
    }

    /// Starts the trigger thread for the provided settings.
    /// Does nothing beyond logging when scheduling is disabled
    /// or no weekdays are selected.
    pub fn start(&mut self, settings: &Settings) -> Result<(), LocalError> {
        self.stop();

        if !settings.backup_schedule_enabled {
            info!("backup scheduling is disabled");
            return Ok(());
        }

        let time = settings.schedule_time()?;
        let days = settings.schedule_days()?;

        if days.is_empty() {
            warn!("no backup days selected, scheduling disabled");
            return Ok(());
        }

        info!(
            "backup scheduler started: {} on {}",
            settings.backup_schedule_time,
            settings.backup_schedule_days.join(", ")
        );

        let stop = Arc::new(AtomicBool::new(false));
        self.stop = Arc::clone(&stop);

        let engine = Arc::clone(&self.engine);
        let next_run = Arc::clone(&self.next_run);

        self.handle = Some(thread::spawn(move || {
            run_loop(engine, stop, next_run, days, time)
        }));

        Ok(())
    }

    /// Stops the trigger thread. A run that is already in progress
    /// is not interrupted.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            handle.join().ok();
            info!("backup scheduler stopped");
        }

        *self.next_run.lock().unwrap() = None;
    }

    /// Applies fresh settings by stopping and restarting the trigger.
    pub fn reload(&mut self, settings: &Settings) -> Result<(), LocalError> {
        self.stop();
        self.start(settings)
    }

    /// Returns the next scheduled trigger time, if any.
    pub fn next_run_time(&self) -> Option<DateTime<Local>> {
        *self.next_run.lock().unwrap()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    engine: Arc<BackupEngine>,
    stop: Arc<AtomicBool>,
    next_run: Arc<Mutex<Option<DateTime<Local>>>>,
    days: Vec<Weekday>,
    time: NaiveTime,
) {
    loop {
        let next = match next_occurrence(Local::now(), &days, time) {
            Some(next) => next,
            None => {
                warn!("no next trigger time, scheduler exiting");
                return;
            }
        };

        *next_run.lock().unwrap() = Some(next);
        info!("next scheduled backup at {}", next);

        while Local::now() < next {
            if stop.load(Ordering::SeqCst) {
                return;
            }

            thread::sleep(TICK);
        }

        if stop.load(Ordering::SeqCst) {
            return;
        }

        info!("starting scheduled backup");

        match engine.perform_backup(None, false) {
            Ok(result) => {
                if result.status == RunStatus::Success {
                    info!("scheduled backup completed successfully");
                } else {
                    warn!("scheduled backup finished with status {}", result.status);
                }
            }
            Err(EngineError::Busy) => {
                warn!("a run is already active, skipping scheduled backup");
            }
            Err(e) => error!("scheduled backup failed to start: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn two_am() -> NaiveTime {
        NaiveTime::from_hms_opt(2, 0, 0).unwrap()
    }

    #[test]
    fn fires_later_the_same_day() {
        let now = at(2026, 7, 14, 1, 0);
        let days = vec![now.weekday()];

        assert_eq!(
            next_occurrence(now, &days, two_am()).unwrap(),
            at(2026, 7, 14, 2, 0)
        );
    }

    #[test]
    fn wraps_to_next_week_once_the_time_has_passed() {
        let now = at(2026, 7, 14, 3, 0);
        let days = vec![now.weekday()];

        assert_eq!(
            next_occurrence(now, &days, two_am()).unwrap(),
            at(2026, 7, 21, 2, 0)
        );
    }

    #[test]
    fn skips_to_the_next_selected_weekday() {
        let now = at(2026, 7, 14, 3, 0);
        let days = vec![now.weekday().succ()];

        assert_eq!(
            next_occurrence(now, &days, two_am()).unwrap(),
            at(2026, 7, 15, 2, 0)
        );
    }

    #[test]
    fn no_days_means_no_trigger() {
        let now = at(2026, 7, 14, 1, 0);

        assert!(next_occurrence(now, &[], two_am()).is_none());
    }

    #[test]
    fn exact_trigger_time_moves_to_the_next_occurrence() {
        let now = at(2026, 7, 14, 2, 0);
        let days = vec![now.weekday()];

        assert_eq!(
            next_occurrence(now, &days, two_am()).unwrap(),
            at(2026, 7, 21, 2, 0)
        );
    }
}
