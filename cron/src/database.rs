//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::config::Config;
use crate::entry::{load_entry, Entry};
use crate::env::{parse_env_line, Env};
use crate::error::{CheckError, CronError, EntryError};
use crate::passwd::{Passwd, PasswdLookup};
use crate::SYSTEM_USER;
use log::{debug, info, warn};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, Metadata, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::rc::Rc;
use std::time::SystemTime;

/// The owner of one crontab file's worth of entries.
#[derive(Debug)]
pub struct User {
    pub name: String,
    pub mtime: SystemTime,
    pub entries: Vec<Entry>,
}

impl User {
    /// Read a crontab stream.
    ///
    /// `NAME=value` lines update the environment seen by the entries that
    /// follow them. Lines that fail to parse are passed to `report` with
    /// their 1-based line number and dropped.
    pub fn load<R: BufRead>(
        reader: R,
        name: &str,
        pw: Option<&Passwd>,
        passwd: &dyn PasswdLookup,
        mtime: SystemTime,
        report: &mut dyn FnMut(usize, &EntryError),
    ) -> std::io::Result<User> {
        let mut env = Env::new();
        let mut entries = Vec::new();

        for (index, line) in reader.split(b'\n').enumerate() {
            let line = line?;
            let line = String::from_utf8_lossy(&line);

            if let Some((key, value)) = parse_env_line(&line) {
                env.set(&key, &value);
                continue;
            }

            match load_entry(&line, pw, &env, passwd) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => report(index + 1, &e),
            }
        }

        Ok(User {
            name: name.to_string(),
            mtime,
            entries,
        })
    }
}

/// Every loaded crontab, rebuilt as a whole when the spool changes.
#[derive(Debug, Default)]
pub struct Database {
    /// Combined fingerprint of the spool directory and system crontab
    /// modification times. `None` forces the next load.
    pub mtime: Option<u64>,
    pub users: Vec<Rc<User>>,
}

impl Database {
    pub fn find_user(&self, name: &str) -> Option<&Rc<User>> {
        self.users.iter().find(|u| u.name == name)
    }

    /// All `@reboot` entries, paired with their owner.
    pub fn reboot_jobs(&self) -> impl Iterator<Item = (&Rc<User>, usize)> {
        self.users.iter().flat_map(|u| {
            u.entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_reboot())
                .map(move |(i, _)| (u, i))
        })
    }
}

/// What one call to [`load_database`] did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub changed: bool,
    pub parsed: Vec<String>,
    pub reused: Vec<String>,
    pub removed: Vec<String>,
}

fn fingerprint(spool: &Metadata, system: Option<&Metadata>) -> u64 {
    let mut hasher = DefaultHasher::new();
    (spool.mtime(), spool.mtime_nsec()).hash(&mut hasher);
    system
        .map(|m| (m.mtime(), m.mtime_nsec()))
        .hash(&mut hasher);
    hasher.finish()
}

/// Bring `db` up to date with the spool directory and system crontab.
///
/// Cheap when nothing changed. Otherwise a new database is built, reusing
/// users whose file mtime is unchanged, and swapped in for the old one.
pub fn load_database(
    db: &mut Database,
    config: &Config,
    passwd: &dyn PasswdLookup,
) -> Result<LoadReport, CronError> {
    let spool = fs::metadata(&config.spool_dir)
        .map_err(|e| CronError::SpoolStat(config.spool_dir.clone(), e))?;
    let system = fs::metadata(&config.system_crontab).ok();

    let mtime = fingerprint(&spool, system.as_ref());
    if db.mtime == Some(mtime) {
        return Ok(LoadReport::default());
    }

    let mut report = LoadReport {
        changed: true,
        ..Default::default()
    };
    let mut old = std::mem::take(&mut db.users);
    let mut new_db = Database {
        mtime: Some(mtime),
        users: Vec::new(),
    };

    if system.is_some() {
        process_crontab(
            SYSTEM_USER,
            None,
            &config.system_crontab,
            &mut old,
            &mut new_db,
            &mut report,
            passwd,
        );
    }

    let dir = fs::read_dir(&config.spool_dir)
        .map_err(|e| CronError::SpoolStat(config.spool_dir.clone(), e))?;
    for dirent in dir.flatten() {
        let Ok(fname) = dirent.file_name().into_string() else {
            continue;
        };
        if fname.starts_with('.') {
            continue;
        }

        let Some(pw) = passwd.get_by_name(&fname) else {
            warn!("({}) {} (tabs/{})", fname, CheckError::Orphan, fname);
            continue;
        };

        process_crontab(
            &fname,
            Some(&pw),
            &dirent.path(),
            &mut old,
            &mut new_db,
            &mut report,
            passwd,
        );
    }

    // whatever is left in the old database has lost its file
    for user in old {
        debug!("({}) REMOVED", user.name);
        report.removed.push(user.name.clone());
    }

    *db = new_db;
    Ok(report)
}

fn process_crontab(
    uname: &str,
    pw: Option<&Passwd>,
    path: &Path,
    old: &mut Vec<Rc<User>>,
    new_db: &mut Database,
    report: &mut LoadReport,
    passwd: &dyn PasswdLookup,
) {
    let fname = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (file, meta) = match open_crontab(uname, pw, path) {
        Ok(opened) => opened,
        Err(e) => {
            warn!("({}) {} ({})", uname, e, fname);
            return;
        }
    };
    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    let previous = old
        .iter()
        .position(|u| u.name == uname)
        .map(|i| old.remove(i));

    if let Some(user) = previous.as_ref() {
        if user.mtime == mtime {
            report.reused.push(uname.to_string());
            new_db.users.push(Rc::clone(user));
            return;
        }
    }

    if previous.is_some() {
        info!("({}) RELOAD ({})", uname, fname);
    } else {
        info!("({}) NEW ({})", uname, fname);
    }

    let mut log_error = |line: usize, e: &EntryError| {
        warn!("({}) ERROR ({} line {}: {})", uname, fname, line, e);
    };
    match User::load(
        BufReader::new(file),
        uname,
        pw,
        passwd,
        mtime,
        &mut log_error,
    ) {
        Ok(user) => {
            report.parsed.push(uname.to_string());
            new_db.users.push(Rc::new(user));
        }
        Err(e) => warn!("({}) {} ({})", uname, CheckError::Read(e), fname),
    }
}

/// Open a spool file and check it may be trusted.
fn open_crontab(
    uname: &str,
    pw: Option<&Passwd>,
    path: &Path,
) -> Result<(File, Metadata), CheckError> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(path)
        .map_err(CheckError::Open)?;
    let meta = file.metadata().map_err(CheckError::Stat)?;

    if !meta.file_type().is_file() {
        return Err(CheckError::NotRegular);
    }

    let mode = meta.mode() & 0o7777;
    let bad_bits = match pw {
        // the system crontab may be group/other readable
        None => mode & 0o7022,
        Some(_) => mode & !0o600,
    };
    if bad_bits != 0 {
        return Err(CheckError::Mode(mode));
    }

    let owner = meta.uid();
    let trusted = match pw {
        None => owner == 0,
        Some(pw) => owner == 0 || (owner == pw.uid && pw.name == uname),
    };
    if !trusted {
        return Err(CheckError::Owner(owner));
    }

    if meta.nlink() != 1 {
        return Err(CheckError::LinkCount(meta.nlink()));
    }

    Ok((file, meta))
}
