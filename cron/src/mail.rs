//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::config::Config;
use crate::env::Env;
use log::{info, warn};
use std::ffi::CStr;
use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};

const SAFE_DELIMITERS: &str = "@!:%+-.,_";

/// Check that a mail address cannot be mistaken for a mailer option or
/// smuggle in shell or header syntax.
pub fn is_safe_address(s: &str) -> bool {
    !s.is_empty()
        && s.chars().enumerate().all(|(i, c)| {
            c.is_ascii_alphanumeric() || c == '_' || (i > 0 && SAFE_DELIMITERS.contains(c))
        })
}

/// Where output of an entry owned by `owner` should be mailed.
///
/// `MAILTO=""` turns mail off; an unsafe address falls back to the owner.
pub fn resolve_mailto(env: &Env, owner: &str) -> Option<String> {
    match env.get("MAILTO") {
        Some("") => None,
        Some(addr) if is_safe_address(addr) => Some(addr.to_string()),
        Some(addr) => {
            warn!("({}) UNSAFE ({})", owner, addr);
            Some(owner.to_string())
        }
        None => Some(owner.to_string()),
    }
}

pub fn hostname() -> String {
    let mut buf = [0 as libc::c_char; 256];

    // SAFETY: buf is writable for its full length and gethostname()
    // NUL-terminates on success; we force a terminator regardless.
    unsafe {
        if libc::gethostname(buf.as_mut_ptr(), buf.len()) != 0 {
            return String::from("localhost");
        }
        buf[buf.len() - 1] = 0;
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}

/// Headers of a job-output message, ending with the blank separator line.
pub fn compose_headers(to: &str, subject: &str, env: Option<&Env>) -> String {
    let mut headers = String::new();
    let _ = writeln!(headers, "From: root (Cron Daemon)");
    let _ = writeln!(headers, "To: {}", to);
    let _ = writeln!(headers, "Subject: {}", subject.replace('\n', " "));
    let _ = writeln!(headers, "Auto-Submitted: auto-generated");
    if let Some(env) = env {
        for (name, value) in env.iter() {
            let _ = writeln!(headers, "X-Cron-Env: <{}={}>", name, value.replace('\n', " "));
        }
    }
    headers.push('\n');
    headers
}

/// A running mail transport agent reading a message on stdin.
pub struct Mailer {
    child: Child,
    owner: String,
    bytes: usize,
}

impl Mailer {
    pub fn open(config: &Config, owner: &str, headers: &str) -> io::Result<Mailer> {
        let child = Command::new(&config.mailer)
            .args(&config.mailer_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let mut mailer = Mailer {
            child,
            owner: owner.to_string(),
            bytes: 0,
        };
        mailer.stdin()?.write_all(headers.as_bytes())?;
        Ok(mailer)
    }

    fn stdin(&mut self) -> io::Result<&mut std::process::ChildStdin> {
        self.child
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "mailer stdin closed"))
    }

    pub fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stdin()?.write_all(buf)?;
        self.bytes += buf.len();
        Ok(())
    }

    /// Copy the rest of `reader` into the message body.
    pub fn copy_from(&mut self, reader: &mut dyn Read) -> io::Result<()> {
        let n = io::copy(reader, self.stdin()?)?;
        self.bytes += n as usize;
        Ok(())
    }

    /// Close the message and wait for the mailer; a failed delivery is
    /// only logged.
    pub fn finish(mut self) -> io::Result<ExitStatus> {
        drop(self.child.stdin.take());
        let status = self.child.wait()?;
        if status.success() {
            info!("({}) MAIL ({} bytes)", self.owner, self.bytes);
        } else {
            warn!(
                "({}) MAIL (mailed {} byte{} of output but got status {})",
                self.owner,
                self.bytes,
                if self.bytes == 1 { "" } else { "s" },
                status
            );
        }
        Ok(status)
    }
}
