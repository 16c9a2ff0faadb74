//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::config::Config;
use crate::error::CronError;
use log::info;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive lock on the PID file, held for the daemon's lifetime.
///
/// The descriptor is close-on-exec: launcher processes forked from the
/// daemon keep it, exec'd jobs do not.
#[derive(Debug)]
pub struct DaemonLock {
    _file: File,
}

/// Acquire the PID file lock and record our PID in it.
pub fn acquire_lock(path: &Path) -> Result<DaemonLock, CronError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| CronError::PidFile(path.to_path_buf(), e))?;

    // SAFETY: flock() on a valid descriptor from an open File with
    // LOCK_EX | LOCK_NB; the return value is checked.
    unsafe {
        if libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) != 0 {
            return Err(CronError::AlreadyRunning);
        }
    }

    // only the lock holder may clobber the previous PID
    file.set_len(0)
        .and_then(|_| writeln!(file, "{}", std::process::id()))
        .and_then(|_| file.flush())
        .map_err(|e| CronError::PidFile(path.to_path_buf(), e))?;

    Ok(DaemonLock { _file: file })
}

/// Detach from the controlling terminal.
///
/// Returns the child's PID in the parent and 0 in the daemon.
pub fn daemonize() -> Result<libc::pid_t, CronError> {
    // SAFETY: the standard Unix daemon pattern, run before any other
    // thread exists. fork()'s result is checked, setsid() and chdir("/")
    // cannot break the process, and /dev/null is dup'ed over the standard
    // descriptors so later pipes never land on them.
    unsafe {
        use libc::*;

        let pid = fork();
        if pid != 0 {
            if pid < 0 {
                return Err(CronError::Fork(io::Error::last_os_error()));
            }
            return Ok(pid);
        }

        setsid();
        chdir(c"/".as_ptr());

        let null = open(c"/dev/null".as_ptr(), O_RDWR);
        if null >= 0 {
            dup2(null, STDIN_FILENO);
            dup2(null, STDOUT_FILENO);
            dup2(null, STDERR_FILENO);
            if null > STDERR_FILENO {
                close(null);
            }
        }

        Ok(0)
    }
}

/// Create the cron and at spool directories if they do not exist yet.
pub fn ensure_dirs(config: &Config) -> Result<(), CronError> {
    for dir in [&config.spool_dir, &config.at_dir] {
        match fs::metadata(dir) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(dir)
                    .map_err(|e| CronError::CreateDir(dir.clone(), e))?;
                info!("created {}", dir.display());
            }
            Err(e) => return Err(CronError::SpoolStat(dir.clone(), e)),
        }
    }
    Ok(())
}

/// Collect every exited child without blocking.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    // SAFETY: waitpid() with WNOHANG and a null status pointer.
    while unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) } > 0 {
        reaped += 1;
    }
    reaped
}

/// One-minute load average, if the system reports one.
pub fn load_average() -> Option<f64> {
    let mut loads = [0f64; 3];
    // SAFETY: loads has room for the single sample requested.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 1) };
    (n >= 1).then_some(loads[0])
}

/// Events recorded by signal handlers, polled by the main loop.
#[derive(Debug, Default)]
pub struct SignalFlags {
    reload: AtomicBool,
    child: AtomicBool,
    shutdown: AtomicBool,
}

impl SignalFlags {
    pub const fn new() -> Self {
        Self {
            reload: AtomicBool::new(false),
            child: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    // The setters only do atomic stores and may be called from handlers.

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn child_exited(&self) {
        self.child.store(true, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    pub fn take_child(&self) -> bool {
        self.child.swap(false, Ordering::SeqCst)
    }

    pub fn shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
