//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

pub mod atjob;
pub mod command;
pub mod config;
pub mod daemon;
pub mod database;
pub mod entry;
pub mod env;
pub mod error;
pub mod executor;
pub mod field;
pub mod mail;
pub mod passwd;
pub mod queue;
pub mod scheduler;

pub use config::Config;
pub use database::{Database, User};
pub use entry::Entry;
pub use error::{AtError, CheckError, CronError, EntryError, FieldError};
pub use scheduler::Scheduler;

// Path constants for cron system files
#[cfg(target_os = "linux")]
pub const CRON_SPOOL_DIR: &str = "/var/spool/cron";
#[cfg(not(target_os = "linux"))]
pub const CRON_SPOOL_DIR: &str = "/var/at/tabs";

#[cfg(target_os = "linux")]
pub const AT_SPOOL_DIR: &str = "/var/spool/atjobs";
#[cfg(not(target_os = "linux"))]
pub const AT_SPOOL_DIR: &str = "/var/at/jobs";

pub const SYSTEM_CRONTAB: &str = "/etc/crontab";
pub const PID_FILE: &str = "/var/run/crond.pid";
pub const SENDMAIL: &str = "/usr/sbin/sendmail";

pub const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_PATH: &str = "/usr/bin:/bin";

/// Name of the pseudo-user owning the system crontab.
pub const SYSTEM_USER: &str = "*system*";

pub const BUFSZ: usize = 8 * 1024;
