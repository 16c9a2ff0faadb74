//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Error types for crontab parsing, spool validation and the daemon.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A malformed calendar field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("empty field")]
    Empty,

    #[error("bad number \"{0}\"")]
    BadNumber(String),

    #[error("{value} is out of range {low}-{high}")]
    OutOfRange { value: u32, low: u8, high: u8 },

    #[error("unknown name \"{0}\"")]
    UnknownName(String),

    #[error("range {start}-{end} is reversed")]
    Reversed { start: u8, end: u8 },

    #[error("bad step \"{0}\"")]
    BadStep(String),

    #[error("unexpected character '{0}'")]
    Unexpected(char),
}

/// A crontab line that could not be turned into an entry.
///
/// Scoped to one line: the rest of the file is still loaded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntryError {
    #[error("bad minute: {0}")]
    Minute(FieldError),

    #[error("bad hour: {0}")]
    Hour(FieldError),

    #[error("bad day-of-month: {0}")]
    DayOfMonth(FieldError),

    #[error("bad month: {0}")]
    Month(FieldError),

    #[error("bad day-of-week: {0}")]
    DayOfWeek(FieldError),

    #[error("bad time specifier \"@{0}\"")]
    TimeSpec(String),

    #[error("missing username")]
    MissingUsername,

    #[error("bad username \"{0}\"")]
    Username(String),

    #[error("bad option \"{0}\"")]
    Option(String),

    #[error("option -{0} given more than once")]
    DuplicateOption(char),

    #[error("missing command")]
    Command,
}

/// Why a spool file was skipped.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("ORPHAN (no passwd entry)")]
    Orphan,

    #[error("CAN'T OPEN ({0})")]
    Open(io::Error),

    #[error("FSTAT FAILED ({0})")]
    Stat(io::Error),

    #[error("NOT REGULAR")]
    NotRegular,

    #[error("BAD FILE MODE ({0:o})")]
    Mode(u32),

    #[error("WRONG FILE OWNER (uid {0})")]
    Owner(u32),

    #[error("BAD LINK COUNT ({0})")]
    LinkCount(u64),

    #[error("READ FAILED ({0})")]
    Read(io::Error),
}

/// A rejected at job. The job file is already gone when these occur.
#[derive(Error, Debug)]
pub enum AtError {
    #[error("bad file format: {0}")]
    Format(&'static str),

    #[error("uid/gid mismatch (header {header_uid}/{header_gid}, file {file_uid}/{file_gid})")]
    Mismatch {
        header_uid: u32,
        header_gid: u32,
        file_uid: u32,
        file_gid: u32,
    },

    #[error("no passwd entry for uid {0}")]
    UnknownUser(u32),

    #[error("unsafe mail address \"{0}\"")]
    UnsafeMailto(String),

    #[error("not a regular file")]
    NotRegular,

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Conditions that stop the daemon.
#[derive(Error, Debug)]
pub enum CronError {
    #[error("another crond instance is already running")]
    AlreadyRunning,

    #[error("could not create PID file {0}: {1}")]
    PidFile(PathBuf, io::Error),

    #[error("could not create directory {0}: {1}")]
    CreateDir(PathBuf, io::Error),

    #[error("cannot stat spool directory {0}: {1}")]
    SpoolStat(PathBuf, io::Error),

    #[error("could not create child process: {0}")]
    Fork(io::Error),

    #[error("logging: {0}")]
    Logging(String),
}
