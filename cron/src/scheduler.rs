//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Minute-by-minute reconciliation of the wall clock with the schedule.
//!
//! The scheduler keeps a *virtual* minute counter that normally advances
//! in step with the wall clock. When the two disagree on wakeup, the gap
//! decides what runs:
//!
//! | minutes elapsed       | action                                           |
//! |-----------------------|--------------------------------------------------|
//! | exactly 1             | run the minute                                   |
//! | 2 ..= drift           | replay every missed minute                       |
//! | drift+1 ..= jump      | wildcard jobs now, fixed-time jobs caught up     |
//! | -jump ..= 0           | wildcard jobs only, keep the virtual clock       |
//! | anything else         | resynchronize and run the current minute         |

use crate::atjob::{self, AtDatabase};
use crate::config::Config;
use crate::daemon::{self, SignalFlags};
use crate::database::{load_database, Database, LoadReport};
use crate::entry::CalendarTime;
use crate::error::CronError;
use crate::passwd::PasswdLookup;
use crate::queue::{Dispatch, Job, JobQueue};
use chrono::Local;
use log::{debug, info, warn};
use std::rc::Rc;

/// One sample of the wall clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockReading {
    /// Seconds since the epoch.
    pub epoch: i64,
    /// Local offset from UTC in seconds, DST included.
    pub gmtoff: i64,
}

impl ClockReading {
    /// Local wall-clock minutes since the epoch.
    pub fn minute(&self) -> i64 {
        (self.epoch + self.gmtoff).div_euclid(60)
    }
}

pub trait Clock {
    fn now(&self) -> ClockReading;
    fn sleep(&mut self, secs: u32);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> ClockReading {
        let now = Local::now();
        ClockReading {
            epoch: now.timestamp(),
            gmtoff: now.offset().local_minus_utc() as i64,
        }
    }

    fn sleep(&mut self, secs: u32) {
        // SAFETY: sleep() is safe with any value; a signal cuts it short.
        unsafe { libc::sleep(secs) };
    }
}

/// How the wall clock moved since the last processed minute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    OnTime,
    RunningLate,
    ClockForward,
    ClockBackward,
    ClockJump,
}

/// Classify a wakeup from the number of minutes between the virtual clock
/// and the wall clock.
pub fn classify(diff: i64, config: &Config) -> Wakeup {
    if diff == 1 {
        Wakeup::OnTime
    } else if diff > config.jump_threshold || diff < -config.jump_threshold {
        Wakeup::ClockJump
    } else if diff > config.drift_threshold {
        Wakeup::ClockForward
    } else if diff > 0 {
        Wakeup::RunningLate
    } else {
        Wakeup::ClockBackward
    }
}

pub struct Scheduler<C, D, P> {
    config: Config,
    clock: C,
    dispatcher: D,
    passwd: P,
    pub database: Database,
    pub at_database: AtDatabase,
    queue: JobQueue,
    virtual_time: i64,
    time_running: i64,
    clock_time: i64,
    gmtoff: i64,
}

impl<C: Clock, D: Dispatch, P: PasswdLookup> Scheduler<C, D, P> {
    /// A scheduler whose virtual clock starts at the current minute.
    pub fn new(config: Config, clock: C, dispatcher: D, passwd: P) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            dispatcher,
            passwd,
            database: Database::default(),
            at_database: AtDatabase::default(),
            queue: JobQueue::new(),
            virtual_time: now.minute(),
            time_running: now.minute(),
            clock_time: now.minute(),
            gmtoff: now.gmtoff,
        }
    }

    pub fn virtual_time(&self) -> i64 {
        self.virtual_time
    }

    /// The wall-clock minute being processed.
    pub fn time_running(&self) -> i64 {
        self.time_running
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn sample_clock(&mut self) -> ClockReading {
        let now = self.clock.now();
        self.clock_time = now.minute();
        self.gmtoff = now.gmtoff;
        now
    }

    /// Epoch seconds of the start of the minute being processed.
    fn now_epoch(&self) -> i64 {
        self.time_running * 60 - self.gmtoff
    }

    /// Reload crontabs if they changed, and rescan the at spool.
    pub fn load(&mut self) -> Result<LoadReport, CronError> {
        let report = load_database(&mut self.database, &self.config, &self.passwd)?;
        if report.changed {
            debug!(
                "database: {} parsed, {} reused, {} removed",
                report.parsed.len(),
                report.reused.len(),
                report.removed.len()
            );
        }
        self.scan_atjobs(self.now_epoch());
        Ok(report)
    }

    fn scan_atjobs(&mut self, now: i64) -> bool {
        match atjob::scan_atjobs(&mut self.at_database, &self.config.at_dir, now) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("CAN'T SCAN ({}: {})", self.config.at_dir.display(), e);
                false
            }
        }
    }

    /// Start every `@reboot` entry once.
    pub fn run_reboot_jobs(&mut self) -> usize {
        for (user, entry) in self.database.reboot_jobs() {
            self.queue.enqueue(Job::Cron {
                user: Rc::clone(user),
                entry,
            });
        }
        self.run_queue()
    }

    /// Queue the entries matching minute `vtime`, restricted to wildcard
    /// and/or fixed-time entries.
    pub fn find_jobs(&mut self, vtime: i64, do_wild: bool, do_nonwild: bool) {
        let Some(t) = CalendarTime::from_minute(vtime) else {
            return;
        };
        debug!(
            "find_jobs({:02}:{:02} dom {} mon {} dow {}, wild {}, nonwild {})",
            t.hour, t.minute, t.dom, t.month, t.dow, do_wild, do_nonwild
        );

        for user in &self.database.users {
            for (i, entry) in user.entries.iter().enumerate() {
                let wanted = if entry.is_wild() { do_wild } else { do_nonwild };
                if wanted && !entry.is_reboot() && entry.matches(&t) {
                    self.queue.enqueue(Job::Cron {
                        user: Rc::clone(user),
                        entry: i,
                    });
                }
            }
        }
    }

    pub fn run_queue(&mut self) -> usize {
        self.queue.drain(&mut self.dispatcher)
    }

    /// Start queued jobs; pause a little if any were started.
    fn run_queue_and_pause(&mut self) {
        if self.run_queue() > 0 && self.config.catchup_pause > 0 {
            self.clock.sleep(self.config.catchup_pause);
        }
    }

    /// Queue the jobs owed for the move of the wall clock to
    /// `time_running`, and advance the virtual clock.
    pub fn reconcile(&mut self) -> Wakeup {
        let diff = self.time_running - self.virtual_time;
        let wakeup = classify(diff, &self.config);
        debug!("wakeup {:?}, dt={}", wakeup, diff);

        match wakeup {
            Wakeup::OnTime => {
                self.virtual_time += 1;
                self.find_jobs(self.virtual_time, true, true);
            }
            Wakeup::RunningLate => loop {
                self.run_queue_and_pause();
                self.virtual_time += 1;
                self.find_jobs(self.virtual_time, true, true);
                if self.virtual_time >= self.time_running {
                    break;
                }
            },
            Wakeup::ClockForward => {
                self.find_jobs(self.time_running, true, false);
                loop {
                    self.run_queue_and_pause();
                    self.virtual_time += 1;
                    self.find_jobs(self.virtual_time, false, true);
                    self.sample_clock();
                    if self.virtual_time >= self.time_running
                        || self.clock_time != self.time_running
                    {
                        break;
                    }
                }
            }
            Wakeup::ClockBackward => {
                self.find_jobs(self.time_running, true, false);
            }
            Wakeup::ClockJump => {
                info!("time jump of {} minutes, resynchronizing", diff);
                self.virtual_time = self.time_running;
                self.find_jobs(self.time_running, true, true);
            }
        }
        wakeup
    }

    /// Queue and start due at jobs.
    pub fn atrun(&mut self) -> usize {
        let now = self.clock.now().epoch;
        atjob::atrun(
            &mut self.at_database,
            &self.config.at_dir,
            self.config.batch_max_load,
            now,
            daemon::load_average,
            &mut self.queue,
        );
        self.run_queue()
    }

    /// Forget the database fingerprints so the next load rereads
    /// everything.
    pub fn on_reload_signal(&mut self) {
        info!("RELOAD (signal)");
        self.database.mtime = None;
        self.at_database.mtime = None;
    }

    pub fn on_child_exited(&mut self) {
        let n = daemon::reap_children();
        debug!("reaped {} children", n);
    }

    fn handle_signals(&mut self, signals: &SignalFlags) {
        if signals.take_child() {
            self.on_child_exited();
        }
        if signals.take_reload() {
            self.on_reload_signal();
        }
    }

    /// Sleep until the minute after `time_running` begins.
    ///
    /// Sleeps in bursts so signals and new at jobs are noticed; a due at
    /// job found while sleeping is started at once.
    pub fn sleep_until_next_minute(&mut self, signals: &SignalFlags) {
        let target = (self.time_running + 1) * 60 - self.gmtoff;
        let max = i64::from(self.config.max_sleep);

        loop {
            let now = self.sample_clock();
            let wait = target - now.epoch + 1;
            if wait <= 0 || wait > max {
                break;
            }

            self.clock.sleep(wait as u32);
            self.handle_signals(signals);
            if signals.shutdown() {
                break;
            }

            let now = self.clock.now().epoch;
            if self.scan_atjobs(now) {
                atjob::atrun(
                    &mut self.at_database,
                    &self.config.at_dir,
                    self.config.batch_max_load,
                    now,
                    daemon::load_average,
                    &mut self.queue,
                );
                self.run_queue();
            }
        }
    }

    /// Process one wall-clock minute.
    ///
    /// Returns `Ok(false)` once shutdown was requested.
    pub fn tick(&mut self, signals: &SignalFlags) -> Result<bool, CronError> {
        loop {
            self.sleep_until_next_minute(signals);
            if signals.shutdown() {
                return Ok(false);
            }
            self.sample_clock();
            if self.clock_time != self.time_running {
                break;
            }
        }
        self.time_running = self.clock_time;

        self.reconcile();
        self.run_queue();
        self.atrun();
        self.load()?;
        Ok(true)
    }
}
