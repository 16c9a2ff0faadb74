//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::{AT_SPOOL_DIR, CRON_SPOOL_DIR, PID_FILE, SENDMAIL, SYSTEM_CRONTAB};
use std::path::PathBuf;

/// Runtime settings of the daemon.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub spool_dir: PathBuf,
    pub system_crontab: PathBuf,
    pub at_dir: PathBuf,
    pub pid_file: PathBuf,

    /// Mail transport agent; the message is written to its stdin.
    pub mailer: PathBuf,
    pub mailer_args: Vec<String>,

    /// Batch jobs start only while the 1-minute load average is at or
    /// below this value. Zero disables the check.
    pub batch_max_load: f64,

    /// Largest forward clock step, in minutes, that is treated as a late
    /// wakeup and replayed minute by minute.
    pub drift_threshold: i64,

    /// Clock steps beyond this many minutes, in either direction, are not
    /// caught up at all.
    pub jump_threshold: i64,

    /// Longest single sleep, in seconds, while waiting for the next minute.
    pub max_sleep: u32,

    /// Pause, in seconds, after dispatching jobs in the middle of a
    /// catch-up run.
    pub catchup_pause: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from(CRON_SPOOL_DIR),
            system_crontab: PathBuf::from(SYSTEM_CRONTAB),
            at_dir: PathBuf::from(AT_SPOOL_DIR),
            pid_file: PathBuf::from(PID_FILE),
            mailer: PathBuf::from(SENDMAIL),
            mailer_args: ["-FCronDaemon", "-odi", "-oem", "-oi", "-t"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            batch_max_load: 1.5,
            drift_threshold: 5,
            jump_threshold: 3 * 1440,
            max_sleep: 64,
            catchup_pause: 10,
        }
    }
}
