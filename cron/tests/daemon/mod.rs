//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::fixture::Spool;
use cron::daemon::{acquire_lock, ensure_dirs};
use cron::CronError;
use std::fs;

#[test]
fn test_lock_is_exclusive() {
    let spool = Spool::new();
    let pid_file = &spool.config.pid_file;

    let lock = acquire_lock(pid_file).unwrap();
    let pid = fs::read_to_string(pid_file).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());

    assert!(matches!(
        acquire_lock(pid_file),
        Err(CronError::AlreadyRunning)
    ));
    // a refused attempt leaves the recorded PID alone
    assert_eq!(fs::read_to_string(pid_file).unwrap(), pid);

    drop(lock);
    assert!(acquire_lock(pid_file).is_ok());
}

#[test]
fn test_lock_in_missing_directory() {
    let spool = Spool::new();
    let path = spool.root.path().join("no/such/dir/crond.pid");
    assert!(matches!(acquire_lock(&path), Err(CronError::PidFile(..))));
}

#[test]
fn test_ensure_dirs() {
    let spool = Spool::new();
    let mut config = spool.config.clone();
    config.spool_dir = spool.root.path().join("var/spool/cron");
    config.at_dir = spool.root.path().join("var/spool/atjobs");

    ensure_dirs(&config).unwrap();
    assert!(config.spool_dir.is_dir());
    assert!(config.at_dir.is_dir());

    // existing directories are left as they are
    ensure_dirs(&config).unwrap();
}
