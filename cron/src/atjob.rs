//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::error::AtError;
use crate::mail::is_safe_address;
use crate::queue::{Job, JobQueue};
use chrono::DateTime;
use log::{debug, info, warn};
use std::fs;
use std::io::{self, BufRead};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::SystemTime;

/// One deferred job in the at spool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtJob {
    pub run_time: i64,
    pub queue: char,
    pub uid: u32,
    pub gid: u32,
}

impl AtJob {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.run_time, self.queue)
    }

    /// Upper-case queues hold batch jobs.
    pub fn is_batch(&self) -> bool {
        self.queue.is_ascii_uppercase()
    }

    /// Niceness increment for the job's queue: `a` and `b` run at normal
    /// priority, each later letter one step lower.
    pub fn niceness(&self) -> i32 {
        let queue = self.queue.to_ascii_lowercase();
        if queue > 'b' {
            queue as i32 - 'b' as i32
        } else {
            0
        }
    }
}

impl std::fmt::Display for AtJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match DateTime::from_timestamp(self.run_time, 0) {
            Some(dt) => write!(
                f,
                "{} ({})",
                self.file_name(),
                dt.format("%a %b %d %H:%M:%S %Y")
            ),
            None => write!(f, "{}", self.file_name()),
        }
    }
}

/// Pending at jobs, in (run time, queue) order.
#[derive(Debug, Default)]
pub struct AtDatabase {
    pub mtime: Option<SystemTime>,
    pub jobs: Vec<AtJob>,
}

/// Decode `<seconds>.<queue>`.
pub fn parse_file_name(name: &str) -> Option<(i64, char)> {
    let (secs, queue) = name.split_once('.')?;
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let run_time = secs.parse::<i64>().ok()?;

    let mut chars = queue.chars();
    match (chars.next(), chars.next()) {
        (Some(q), None) if q.is_ascii_alphabetic() => Some((run_time, q)),
        _ => None,
    }
}

/// Rescan the at spool if its mtime changed.
///
/// Returns `true` when the spool was rescanned and at least one job is
/// due at `now`.
pub fn scan_atjobs(db: &mut AtDatabase, dir: &Path, now: i64) -> io::Result<bool> {
    let mtime = fs::metadata(dir)?.modified()?;
    if db.mtime == Some(mtime) {
        return Ok(false);
    }

    let mut jobs = Vec::new();
    for dirent in fs::read_dir(dir)?.flatten() {
        let Some((run_time, queue)) = dirent.file_name().to_str().and_then(parse_file_name)
        else {
            continue;
        };
        let Ok(meta) = dirent.metadata() else {
            continue;
        };
        // a cleared execute bit marks a job that was already started
        if !meta.file_type().is_file() || meta.mode() & 0o100 == 0 {
            continue;
        }

        jobs.push(AtJob {
            run_time,
            queue,
            uid: meta.uid(),
            gid: meta.gid(),
        });
    }
    jobs.sort_by_key(|job| (job.run_time, job.queue));

    let pending = jobs.iter().any(|job| job.run_time <= now);
    debug!("at spool: {} jobs, due now: {}", jobs.len(), pending);

    db.mtime = Some(mtime);
    db.jobs = jobs;
    Ok(pending)
}

/// Queue every due at job, plus the earliest due batch job if the load
/// average allows it.
///
/// Queued jobs are claimed by clearing their execute bit and leave the
/// in-memory list. `load_average` is only consulted when a batch job is
/// waiting.
pub fn atrun(
    db: &mut AtDatabase,
    dir: &Path,
    batch_max_load: f64,
    now: i64,
    load_average: impl Fn() -> Option<f64>,
    queue: &mut JobQueue,
) {
    let mut batch: Option<usize> = None;
    let mut launch = Vec::new();

    for (i, job) in db.jobs.iter().enumerate() {
        if job.run_time > now {
            continue;
        }
        if job.is_batch() {
            if batch.map_or(true, |b| job.run_time < db.jobs[b].run_time) {
                batch = Some(i);
            }
            continue;
        }
        launch.push(i);
    }

    if let Some(b) = batch {
        let allowed = batch_max_load == 0.0
            || load_average().is_some_and(|load| load <= batch_max_load);
        if allowed {
            launch.push(b);
        } else {
            debug!("batch job {} deferred: load too high", db.jobs[b]);
        }
    }

    launch.sort_unstable();
    let mut due = Vec::with_capacity(launch.len());
    for i in launch.into_iter().rev() {
        due.push(db.jobs.remove(i));
    }

    for job in due.into_iter().rev() {
        match claim(dir, &job) {
            Ok(()) => {
                info!("({}) AT ({})", job.uid, job);
                queue.enqueue(Job::At(job));
            }
            // already gone, or someone else owns it now
            Err(e) => warn!("({}) AT STALE ({}: {})", job.uid, job.file_name(), e),
        }
    }
}

fn claim(dir: &Path, job: &AtJob) -> io::Result<()> {
    let path = dir.join(job.file_name());
    let mut perms = fs::symlink_metadata(&path)?.permissions();
    perms.set_mode(perms.mode() & !0o111);
    fs::set_permissions(&path, perms)
}

/// The three fixed header lines of an at job file.
#[derive(Debug, PartialEq, Eq)]
pub struct AtHeader {
    pub uid: u32,
    pub gid: u32,
    pub mailto: String,
    pub always_mail: bool,
}

impl AtHeader {
    /// Read and validate the header.
    ///
    /// ```text
    /// #!/bin/sh
    /// # atrun uid=<uid> gid=<gid>
    /// # mail <address> <0|1>
    /// ```
    pub fn read<R: BufRead>(reader: &mut R) -> Result<AtHeader, AtError> {
        let mut line = String::new();

        next_line(reader, &mut line)?;
        if line != "#!/bin/sh" {
            return Err(AtError::Format("missing #!/bin/sh"));
        }

        next_line(reader, &mut line)?;
        let ids = line
            .strip_prefix("# atrun uid=")
            .ok_or(AtError::Format("missing atrun line"))?;
        let (uid, gid) = ids
            .split_once(" gid=")
            .ok_or(AtError::Format("missing gid"))?;
        let uid = parse_id(uid).ok_or(AtError::Format("bad uid"))?;
        let gid = parse_id(gid).ok_or(AtError::Format("bad gid"))?;

        next_line(reader, &mut line)?;
        let mail = line
            .strip_prefix("# mail ")
            .ok_or(AtError::Format("missing mail line"))?;
        let (mailto, flag) = mail
            .rsplit_once(' ')
            .ok_or(AtError::Format("missing mail flag"))?;
        let mailto = mailto.trim();
        let always_mail = match flag {
            "0" => false,
            "1" => true,
            _ => return Err(AtError::Format("bad mail flag")),
        };
        if mailto.is_empty() {
            return Err(AtError::Format("missing mail address"));
        }
        if !is_safe_address(mailto) {
            return Err(AtError::UnsafeMailto(mailto.to_string()));
        }

        Ok(AtHeader {
            uid,
            gid,
            mailto: mailto.to_string(),
            always_mail,
        })
    }
}

fn next_line<R: BufRead>(reader: &mut R, line: &mut String) -> Result<(), AtError> {
    line.clear();
    if reader.read_line(line)? == 0 || !line.ends_with('\n') {
        return Err(AtError::Format("short header"));
    }
    line.pop();
    Ok(())
}

fn parse_id(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
