//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::error::FieldError;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

macro_rules! time_unit {
    ($name:ident from $min:literal to $max:literal, names $names:expr, sunday $sunday:literal) => {
        /// Calendar field stored as a bitmask, bit `n` meaning value `n`.
        #[derive(Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, Default)]
        pub struct $name(u64);

        impl $name {
            pub const LOW: u8 = $min;
            pub const HIGH: u8 = $max;
            const NAMES: &'static [&'static str] = $names;
            const SUNDAY_ALIAS: bool = $sunday;

            const fn range() -> std::ops::RangeInclusive<u8> {
                $min..=$max
            }

            pub const fn empty() -> Self {
                Self(0)
            }

            pub fn full() -> Self {
                Self::from_bits(range_mask($min, $max, 1))
            }

            pub fn single(n: u8) -> Self {
                debug_assert!(Self::range().contains(&n));
                Self::from_bits(1 << n)
            }

            fn from_bits(mut bits: u64) -> Self {
                if Self::SUNDAY_ALIAS && bits & (1 | 1 << 7) != 0 {
                    bits |= 1 | 1 << 7;
                }
                Self(bits)
            }

            pub fn contains(&self, n: u32) -> bool {
                n < 64 && self.0 & (1 << n) != 0
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn values(&self) -> impl Iterator<Item = u8> + '_ {
                Self::range().filter(|n| self.contains(*n as u32))
            }

            pub fn parse(s: impl AsRef<str>) -> Result<Self, FieldError> {
                parse_list(s.as_ref(), $min, $max, Self::NAMES).map(Self::from_bits)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&self.values().collect::<Vec<_>>())
                    .finish()
            }
        }
    };
}

time_unit!(Minute from 0 to 59, names &[], sunday false);
time_unit!(Hour from 0 to 23, names &[], sunday false);
time_unit!(DayOfMonth from 1 to 31, names &[], sunday false);
time_unit!(Month from 1 to 12, names MONTH_NAMES, sunday false);
time_unit!(DayOfWeek from 0 to 7, names DAY_NAMES, sunday true);

fn range_mask(first: u8, last: u8, step: usize) -> u64 {
    (first..=last).step_by(step).fold(0, |bits, n| bits | 1 << n)
}

/// Parse a whole field token: `range (',' range)*`.
fn parse_list(s: &str, low: u8, high: u8, names: &[&str]) -> Result<u64, FieldError> {
    let mut src = s.chars().peekable();
    if src.peek().is_none() {
        return Err(FieldError::Empty);
    }

    let mut bits = 0;
    loop {
        bits |= parse_range(&mut src, low, high, names)?;
        if !expect(&mut src, ',') {
            break;
        }
    }

    match src.next() {
        None => Ok(bits),
        Some(c) => Err(FieldError::Unexpected(c)),
    }
}

fn parse_range(
    src: &mut Peekable<Chars<'_>>,
    low: u8,
    high: u8,
    names: &[&str],
) -> Result<u64, FieldError> {
    let (first, last) = if expect(src, '*') {
        (low, high)
    } else {
        let first = get_value(src, low, high, names)?;
        if expect(src, '-') {
            let last = get_value(src, low, high, names)?;
            if first > last {
                return Err(FieldError::Reversed {
                    start: first,
                    end: last,
                });
            }
            (first, last)
        } else if let Some('/') = src.peek() {
            // N/step runs from N to the top of the field
            (first, high)
        } else {
            return Ok(1 << first);
        }
    };

    let step = if expect(src, '/') {
        let digits = take_while(src, |c| c.is_ascii_digit());
        match digits.parse::<u32>() {
            Ok(step) if (1..=high as u32).contains(&step) => step as usize,
            _ => return Err(FieldError::BadStep(digits)),
        }
    } else {
        1
    };

    Ok(range_mask(first, last, step))
}

/// Read one number or name and check it against the field bounds.
fn get_value(
    src: &mut Peekable<Chars<'_>>,
    low: u8,
    high: u8,
    names: &[&str],
) -> Result<u8, FieldError> {
    match src.peek() {
        Some(c) if c.is_ascii_digit() => {
            let digits = take_while(src, |c| c.is_ascii_digit());
            let value = digits
                .parse::<u32>()
                .map_err(|_| FieldError::BadNumber(digits.clone()))?;
            if value < low as u32 || value > high as u32 {
                return Err(FieldError::OutOfRange { value, low, high });
            }
            Ok(value as u8)
        }
        Some(c) if c.is_ascii_alphabetic() => {
            let word = take_while(src, |c| c.is_ascii_alphabetic());
            names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(&word))
                .map(|index| index as u8 + low)
                .ok_or(FieldError::UnknownName(word))
        }
        Some(&c) => Err(FieldError::Unexpected(c)),
        None => Err(FieldError::Empty),
    }
}

fn take_while(src: &mut Peekable<Chars<'_>>, pred: impl Fn(char) -> bool) -> String {
    let mut word = String::new();

    while let Some(&c) = src.peek() {
        if pred(c) {
            word.push(c);
            src.next();
        } else {
            break;
        }
    }

    word
}

fn expect(src: &mut Peekable<Chars<'_>>, expected: char) -> bool {
    let Some(&c) = src.peek() else { return false };
    if c == expected {
        src.next();
        true
    } else {
        false
    }
}
