//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::fixture::{mode, set_mtime, Spool};
use cron::daemon::SignalFlags;
use cron::passwd::Passwd;
use cron::queue::{Dispatch, Job};
use cron::scheduler::{Clock, ClockReading, Scheduler, Wakeup};
use std::cell::Cell;
use std::rc::Rc;

/// Wall clock that only moves when slept on or set by the test.
#[derive(Clone)]
struct FakeClock {
    epoch: Rc<Cell<i64>>,
}

impl FakeClock {
    fn at_minute(minute: i64) -> FakeClock {
        FakeClock {
            epoch: Rc::new(Cell::new(minute * 60)),
        }
    }

    fn set_minute(&self, minute: i64) {
        self.epoch.set(minute * 60);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> ClockReading {
        ClockReading {
            epoch: self.epoch.get(),
            gmtoff: 0,
        }
    }

    fn sleep(&mut self, secs: u32) {
        self.epoch.set(self.epoch.get() + i64::from(secs));
    }
}

#[derive(Default)]
struct Recorder(Vec<String>);

impl Dispatch for Recorder {
    fn dispatch(&mut self, job: &Job) {
        let name = match job {
            Job::Cron { .. } => job.entry().map(|e| e.cmd.clone()).unwrap_or_default(),
            Job::At(at) => at.file_name(),
        };
        self.0.push(name);
    }
}

// Minute 100 is 01:40 on Thursday 1970-01-01 (UTC, no offset).
const START: i64 = 100;

const CRONTAB: &str = "\
* * * * * every
41 0 * * * at0041
41 1 * * * at0141
42 1 * * * at0142
43 1 * * * at0143
";

fn scheduler(spool: &Spool, clock: &FakeClock) -> Scheduler<FakeClock, Recorder, Vec<Passwd>> {
    let passwd = vec![spool.user("alice")];
    spool.write_crontab("alice", CRONTAB);

    let mut s = Scheduler::new(
        spool.config.clone(),
        clock.clone(),
        Recorder::default(),
        passwd,
    );
    s.load().unwrap();
    s
}

fn ran(s: &Scheduler<FakeClock, Recorder, Vec<Passwd>>) -> Vec<&str> {
    s.dispatcher().0.iter().map(String::as_str).collect()
}

#[test]
fn test_on_time() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);
    let flags = SignalFlags::new();

    assert!(s.tick(&flags).unwrap());
    assert_eq!(s.time_running(), START + 1);
    assert_eq!(s.virtual_time(), START + 1);
    assert_eq!(ran(&s), vec!["every", "at0141"]);

    assert!(s.tick(&flags).unwrap());
    assert_eq!(ran(&s), vec!["every", "at0141", "every", "at0142"]);
}

#[test]
fn test_running_late_replays_each_minute() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);

    clock.set_minute(START + 3);
    assert!(s.tick(&SignalFlags::new()).unwrap());
    assert_eq!(s.virtual_time(), START + 3);
    assert_eq!(
        ran(&s),
        vec!["every", "at0141", "every", "at0142", "every", "at0143"]
    );
}

#[test]
fn test_clock_forward_runs_wildcards_once() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);

    // an hour lost, as at the start of daylight saving time
    clock.set_minute(START + 60);
    assert!(s.tick(&SignalFlags::new()).unwrap());
    assert_eq!(s.virtual_time(), START + 60);
    assert_eq!(ran(&s), vec!["every", "at0141", "at0142", "at0143"]);
}

#[test]
fn test_clock_forward_stops_when_clock_moves() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut config = spool.config.clone();
    config.catchup_pause = 60;
    spool.write_crontab("alice", CRONTAB);
    let mut s = Scheduler::new(
        config,
        clock.clone(),
        Recorder::default(),
        vec![spool.user("alice")],
    );
    s.load().unwrap();

    clock.set_minute(START + 60);
    assert!(s.tick(&SignalFlags::new()).unwrap());

    // the pause after the first dispatch ran into the next minute
    assert!(s.virtual_time() < START + 60);
    assert_eq!(ran(&s), vec!["every", "at0141"]);
}

#[test]
fn test_clock_backward_runs_only_wildcards() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);
    let flags = SignalFlags::new();

    // an hour gained, as at the end of daylight saving time
    clock.set_minute(START - 60);
    assert!(s.tick(&flags).unwrap());
    assert_eq!(s.time_running(), START - 60);
    assert_eq!(s.virtual_time(), START);
    assert_eq!(ran(&s), vec!["every"]);

    // 00:41 comes round again; its fixed-time job already ran
    assert!(s.tick(&flags).unwrap());
    assert_eq!(s.time_running(), START - 59);
    assert_eq!(ran(&s), vec!["every", "every"]);
}

#[test]
fn test_clock_jump_resynchronizes() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);

    clock.set_minute(START + 5000);
    assert!(s.tick(&SignalFlags::new()).unwrap());
    assert_eq!(s.virtual_time(), START + 5000);
    assert_eq!(ran(&s), vec!["every"]);

    // exactly three days back still counts as the clock going backward
    clock.set_minute(START + 5000);
    let mut s = scheduler(&spool, &clock);
    clock.set_minute(START + 5000 - 4320);
    assert!(s.tick(&SignalFlags::new()).unwrap());
    assert_eq!(s.virtual_time(), START + 5000);
    assert_eq!(ran(&s), vec!["every"]);

    // one minute more is a jump
    clock.set_minute(START + 5000);
    let mut s = scheduler(&spool, &clock);
    clock.set_minute(START + 5000 - 4321);
    assert!(s.tick(&SignalFlags::new()).unwrap());
    assert_eq!(s.virtual_time(), START + 5000 - 4321);
    assert_eq!(ran(&s), vec!["every"]);
}

#[test]
fn test_reconcile_classification() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);

    s.find_jobs(START + 1, false, true);
    assert_eq!(s.run_queue(), 1);
    s.find_jobs(START + 1, true, false);
    assert_eq!(s.run_queue(), 1);
    assert_eq!(ran(&s), vec!["at0141", "every"]);

    assert_eq!(s.reconcile(), Wakeup::ClockBackward);
}

#[test]
fn test_shutdown() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);

    let flags = SignalFlags::new();
    flags.request_shutdown();
    assert!(!s.tick(&flags).unwrap());
    assert!(ran(&s).is_empty());
}

#[test]
fn test_reload_signal() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);
    let before = Rc::clone(&s.database.users[0]);

    assert!(!s.load().unwrap().changed);
    s.on_reload_signal();
    let report = s.load().unwrap();
    assert!(report.changed);
    assert_eq!(report.reused, vec!["alice"]);
    assert!(Rc::ptr_eq(&before, &s.database.users[0]));
}

#[test]
fn test_reboot_jobs() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    spool.write_crontab("alice", "@reboot first\n* * * * * every\n@reboot second\n");
    let mut s = Scheduler::new(
        spool.config.clone(),
        clock.clone(),
        Recorder::default(),
        vec![spool.user("alice")],
    );
    s.load().unwrap();

    assert_eq!(s.run_reboot_jobs(), 2);
    assert_eq!(ran(&s), vec!["first", "second"]);

    // reboot entries never match a minute
    s.find_jobs(START, true, true);
    s.run_queue();
    assert_eq!(ran(&s), vec!["first", "second", "every"]);
}

#[test]
fn test_at_jobs() {
    let spool = Spool::new();
    let due = spool.write_atjob("6000.a", "echo due\n");
    let batch = spool.write_atjob("6000.B", "echo batch\n");
    let later = spool.write_atjob("999999.a", "echo later\n");
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);
    assert_eq!(s.at_database.jobs.len(), 3);

    assert!(s.tick(&SignalFlags::new()).unwrap());
    assert_eq!(ran(&s), vec!["every", "at0141", "6000.B", "6000.a"]);

    // claimed jobs lose their execute bits
    assert_eq!(mode(&due), 0o600);
    assert_eq!(mode(&batch), 0o600);
    assert_eq!(mode(&later), 0o700);
    assert_eq!(s.at_database.jobs.len(), 1);
}

#[test]
fn test_at_job_due_within_the_minute() {
    let spool = Spool::new();
    spool.write_atjob("6061.a", "echo just due\n");
    spool.write_atjob("6062.a", "echo not yet\n");
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);

    // the tick wakes up one second into minute 101
    assert!(s.tick(&SignalFlags::new()).unwrap());
    assert_eq!(clock.now().epoch, 6061);
    assert_eq!(ran(&s), vec!["every", "at0141", "6061.a"]);
    assert_eq!(s.at_database.jobs.len(), 1);
}

#[test]
fn test_at_job_found_while_sleeping() {
    let spool = Spool::new();
    let clock = FakeClock::at_minute(START);
    let mut s = scheduler(&spool, &clock);

    spool.write_atjob("6030.c", "echo soon\n");
    set_mtime(&spool.config.at_dir, 1_000);

    assert!(s.tick(&SignalFlags::new()).unwrap());
    assert_eq!(ran(&s), vec!["6030.c", "every", "at0141"]);
}
