//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::env::Env;
use crate::error::EntryError;
use crate::field::{DayOfMonth, DayOfWeek, Hour, Minute, Month};
use crate::passwd::{Passwd, PasswdLookup};
use crate::{DEFAULT_PATH, DEFAULT_SHELL};
use chrono::{DateTime, Datelike, Timelike};
use std::ops::BitOr;

#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub struct EntryFlags(u8);

impl EntryFlags {
    pub const MIN_STAR: Self = Self(0x01);
    pub const HR_STAR: Self = Self(0x02);
    pub const DOM_STAR: Self = Self(0x04);
    pub const DOW_STAR: Self = Self(0x08);
    pub const WHEN_REBOOT: Self = Self(0x10);
    pub const DONT_LOG: Self = Self(0x20);
    pub const MAIL_WHEN_ERR: Self = Self(0x40);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for EntryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Broken-down calendar time of one virtual minute.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct CalendarTime {
    pub minute: u32,
    pub hour: u32,
    pub dom: u32,
    pub month: u32,
    pub dow: u32,
}

impl CalendarTime {
    /// Decode a minute count. Minutes are local wall-clock minutes since
    /// the epoch, so they are broken down without any further offset.
    pub fn from_minute(minute: i64) -> Option<Self> {
        let t = DateTime::from_timestamp(minute.checked_mul(60)?, 0)?.naive_utc();

        Some(Self {
            minute: t.minute(),
            hour: t.hour(),
            dom: t.day(),
            month: t.month(),
            dow: t.weekday().num_days_from_sunday(),
        })
    }
}

/// One parsed crontab line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub minute: Minute,
    pub hour: Hour,
    pub dom: DayOfMonth,
    pub month: Month,
    pub dow: DayOfWeek,
    pub flags: EntryFlags,
    pub cmd: String,
    pub pwd: Passwd,
    pub env: Env,
}

impl Entry {
    /// Does this entry fire at `t`?
    ///
    /// When neither day field was written as `*` the two are OR'ed (the 1st
    /// of the month or any Sunday); otherwise both must match, which for the
    /// starred field is always true.
    pub fn matches(&self, t: &CalendarTime) -> bool {
        let dom = self.dom.contains(t.dom);
        let dow = self.dow.contains(t.dow);

        let day = if self
            .flags
            .intersects(EntryFlags::DOM_STAR | EntryFlags::DOW_STAR)
        {
            dom && dow
        } else {
            dom || dow
        };

        self.minute.contains(t.minute)
            && self.hour.contains(t.hour)
            && self.month.contains(t.month)
            && day
    }

    /// Wildcard entries run every minute or every hour; fixed-time entries
    /// are the rest.
    pub fn is_wild(&self) -> bool {
        self.flags
            .intersects(EntryFlags::MIN_STAR | EntryFlags::HR_STAR)
    }

    pub fn is_reboot(&self) -> bool {
        self.flags.contains(EntryFlags::WHEN_REBOOT)
    }
}

/// Represents time specification parsed from @-prefix or 5-field format
struct TimeSpec {
    minute: Minute,
    hour: Hour,
    dom: DayOfMonth,
    month: Month,
    dow: DayOfWeek,
    flags: EntryFlags,
}

/// Parse @-prefix special time specifications
fn parse_at_spec(spec: &str) -> Option<TimeSpec> {
    let spec = match spec.to_lowercase().as_str() {
        "reboot" => TimeSpec {
            minute: Minute::empty(),
            hour: Hour::empty(),
            dom: DayOfMonth::empty(),
            month: Month::empty(),
            dow: DayOfWeek::empty(),
            flags: EntryFlags::WHEN_REBOOT,
        },
        "yearly" | "annually" => TimeSpec {
            // 0 0 1 1 *
            minute: Minute::single(0),
            hour: Hour::single(0),
            dom: DayOfMonth::single(1),
            month: Month::single(1),
            dow: DayOfWeek::full(),
            flags: EntryFlags::DOW_STAR,
        },
        "monthly" => TimeSpec {
            // 0 0 1 * *
            minute: Minute::single(0),
            hour: Hour::single(0),
            dom: DayOfMonth::single(1),
            month: Month::full(),
            dow: DayOfWeek::full(),
            flags: EntryFlags::DOW_STAR,
        },
        "weekly" => TimeSpec {
            // 0 0 * * 0
            minute: Minute::single(0),
            hour: Hour::single(0),
            dom: DayOfMonth::full(),
            month: Month::full(),
            dow: DayOfWeek::single(0),
            flags: EntryFlags::DOM_STAR,
        },
        "daily" | "midnight" => TimeSpec {
            // 0 0 * * *
            minute: Minute::single(0),
            hour: Hour::single(0),
            dom: DayOfMonth::full(),
            month: Month::full(),
            dow: DayOfWeek::full(),
            flags: EntryFlags::DOM_STAR | EntryFlags::DOW_STAR,
        },
        "hourly" => TimeSpec {
            // 0 * * * *
            minute: Minute::single(0),
            hour: Hour::full(),
            dom: DayOfMonth::full(),
            month: Month::full(),
            dow: DayOfWeek::full(),
            flags: EntryFlags::HR_STAR | EntryFlags::DOM_STAR | EntryFlags::DOW_STAR,
        },
        _ => return None,
    };
    Some(spec)
}

/// Split off the first whitespace-delimited token.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

fn parse_fields<'a>(first: &str, rest: &'a str) -> Result<(TimeSpec, &'a str), EntryError> {
    let mut flags = EntryFlags::empty();
    let mut rest = rest;
    let mut tokens = [first, "", "", "", ""];
    for token in tokens.iter_mut().skip(1) {
        let (t, r) = next_token(rest).ok_or(EntryError::Command)?;
        *token = t;
        rest = r;
    }
    let [min, hour, dom, month, dow] = tokens;

    for (token, flag) in [
        (min, EntryFlags::MIN_STAR),
        (hour, EntryFlags::HR_STAR),
        (dom, EntryFlags::DOM_STAR),
        (dow, EntryFlags::DOW_STAR),
    ] {
        if token == "*" {
            flags.insert(flag);
        }
    }

    let spec = TimeSpec {
        minute: Minute::parse(min).map_err(EntryError::Minute)?,
        hour: Hour::parse(hour).map_err(EntryError::Hour)?,
        dom: DayOfMonth::parse(dom).map_err(EntryError::DayOfMonth)?,
        month: Month::parse(month).map_err(EntryError::Month)?,
        dow: DayOfWeek::parse(dow).map_err(EntryError::DayOfWeek)?,
        flags,
    };
    Ok((spec, rest))
}

/// Parse one crontab line into an [`Entry`].
///
/// `pw` is the owner of a per-user crontab. When it is `None` the line is
/// from the system crontab and names its user after the time fields.
/// `base_env` holds the `NAME=value` lines seen so far in the same file.
/// Blank and comment lines give `Ok(None)`.
pub fn load_entry(
    line: &str,
    pw: Option<&Passwd>,
    base_env: &Env,
    passwd: &dyn PasswdLookup,
) -> Result<Option<Entry>, EntryError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let Some((first, rest)) = next_token(line) else {
        return Ok(None);
    };
    if first.starts_with('#') {
        return Ok(None);
    }

    let (spec, mut rest) = match first.strip_prefix('@') {
        Some(name) => {
            let spec =
                parse_at_spec(name).ok_or_else(|| EntryError::TimeSpec(name.to_string()))?;
            (spec, rest)
        }
        None => parse_fields(first, rest)?,
    };

    let pwd = match pw {
        Some(pw) => pw.scrubbed(),
        None => {
            let (username, r) = next_token(rest).ok_or(EntryError::MissingUsername)?;
            rest = r;
            passwd
                .get_by_name(username)
                .ok_or_else(|| EntryError::Username(username.to_string()))?
                .scrubbed()
        }
    };

    let mut env = base_env.clone();
    env.set_default("SHELL", DEFAULT_SHELL);
    env.set_default("HOME", &pwd.home);
    env.set_default("PATH", DEFAULT_PATH);
    env.set("LOGNAME", &pwd.name);
    env.set("USER", &pwd.name);

    let mut flags = spec.flags;
    let mut rest = rest.trim_start();
    while let Some(option) = rest.strip_prefix('-') {
        let (token, r) = next_token(option).unwrap_or((option, ""));
        let flag = match token {
            "n" => EntryFlags::MAIL_WHEN_ERR,
            "q" => EntryFlags::DONT_LOG,
            _ => return Err(EntryError::Option(format!("-{token}"))),
        };
        if flags.contains(flag) {
            return Err(EntryError::DuplicateOption(token.chars().next().unwrap_or('?')));
        }
        flags.insert(flag);
        rest = r.trim_start();
    }

    if rest.is_empty() {
        return Err(EntryError::Command);
    }

    Ok(Some(Entry {
        minute: spec.minute,
        hour: spec.hour,
        dom: spec.dom,
        month: spec.month,
        dow: spec.dow,
        flags,
        cmd: rest.to_string(),
        pwd,
        env,
    }))
}
