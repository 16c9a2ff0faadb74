//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

/// Ordered list of environment variables handed to a job.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Env(Vec<(String, String)>);

impl Env {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Set `name`, replacing an earlier value in place.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|(key, _)| key == name) {
            Some((_, old)) => *old = value.to_string(),
            None => self.0.push((name.to_string(), value.to_string())),
        }
    }

    /// Set `name` only if it has no value yet.
    pub fn set_default(&mut self, name: &str, value: &str) {
        if self.get(name).is_none() {
            self.0.push((name.to_string(), value.to_string()));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Recognize a `NAME=value` crontab line.
///
/// Whitespace around `=` is allowed, and the name or value may be quoted
/// with matching single or double quotes. Returns `None` for anything that
/// should be handed to the entry parser instead.
pub fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (name, value) = line.split_once('=')?;
    let name = unquote(name.trim())?;
    if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
        return None;
    }

    let value = unquote(value.trim())?;
    Some((name.to_string(), value.to_string()))
}

fn unquote(s: &str) -> Option<&str> {
    match s.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let inner = s[1..].strip_suffix(q)?;
            // a quote in the middle means the token does not end here
            if inner.contains(q) {
                None
            } else {
                Some(inner)
            }
        }
        _ => Some(s),
    }
}
