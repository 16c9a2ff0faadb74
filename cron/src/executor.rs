//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Job execution.
//!
//! A job runs in three kinds of process:
//!
//! * the detached launcher, forked from the daemon, which owns the job's
//!   pipes, relays its output to the mailer and reaps the other two;
//! * the command runner, which drops privileges and execs the shell;
//! * the stdin feeder, which writes the `%` input of a crontab command so a
//!   job that never reads stdin cannot wedge the launcher.

use crate::atjob::{AtHeader, AtJob};
use crate::command::split_command;
use crate::config::Config;
use crate::entry::{Entry, EntryFlags};
use crate::env::Env;
use crate::error::AtError;
use crate::mail::{compose_headers, hostname, resolve_mailto, Mailer};
use crate::passwd::{Passwd, PasswdLookup, SystemPasswd};
use crate::queue::{Dispatch, Job};
use crate::{BUFSZ, DEFAULT_PATH, DEFAULT_SHELL};
use log::{error, info, warn};
use std::ffi::CString;
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};

/// Starts queued jobs in detached child processes.
pub struct Executor {
    config: Config,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Dispatch for Executor {
    fn dispatch(&mut self, job: &Job) {
        let config = &self.config;
        let result = match job {
            Job::Cron { user, entry } => match user.entries.get(*entry) {
                Some(entry) => launch(&entry.pwd.name, || run_cron_job(entry, config)),
                None => Ok(()),
            },
            Job::At(at) => launch(&at.uid.to_string(), || {
                run_at_job(at, config, &SystemPasswd)
            }),
        };

        // the job simply does not run this time
        if let Err(e) = result {
            error!("CAN'T FORK ({})", e);
        }
    }
}

/// Run `job` in a forked child; the caller returns at once.
fn launch<T, E: Display>(owner: &str, job: impl FnOnce() -> Result<T, E>) -> io::Result<()> {
    // SAFETY: the daemon is single-threaded, so the child may keep using
    // the heap and std I/O after fork(). The child never returns into the
    // scheduler: it leaves through _exit().
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            reset_signals();
            let code = match job() {
                Ok(_) => 0,
                Err(e) => {
                    error!("({}) {}", owner, e);
                    1
                }
            };
            // SAFETY: _exit() is always safe; it skips the daemon's exit
            // handlers, which belong to the parent.
            unsafe { libc::_exit(code) }
        }
        _ => Ok(()),
    }
}

/// Give a launcher the default signal handling the daemon replaced.
fn reset_signals() {
    // SAFETY: restoring SIG_DFL for valid signal numbers.
    unsafe {
        for sig in [libc::SIGCHLD, libc::SIGHUP, libc::SIGTERM, libc::SIGINT] {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

/// Run one crontab entry to completion and mail its output.
///
/// This is the body of the detached launcher; it blocks until the command
/// and its stdin feeder have exited.
pub fn run_cron_job(entry: &Entry, config: &Config) -> io::Result<ExitStatus> {
    let owner = entry.pwd.name.as_str();
    let (cmd, input) = split_command(&entry.cmd);
    if !entry.flags.contains(EntryFlags::DONT_LOG) {
        info!("({}) CMD ({})", owner, cmd);
    }

    let shell = entry.env.get("SHELL").unwrap_or(DEFAULT_SHELL);
    let home = entry.env.get("HOME").unwrap_or(entry.pwd.home.as_str());

    let mut command = Command::new(shell);
    command.arg("-c").arg(&cmd).env_clear().envs(entry.env.iter());
    let stdin = match input {
        Some(_) => Stdio::piped(),
        None => Stdio::null(),
    };
    let privileges = Privileges::new(&entry.pwd, home, 0)?;
    let (output, mut child) = spawn_runner(command, stdin, privileges)?;

    let feeder = match (input, child.stdin.take()) {
        (Some(data), Some(stdin)) => Some(feed_stdin(stdin, data.as_bytes())?),
        _ => None,
    };

    let relay = Relay {
        config,
        owner,
        mailto: resolve_mailto(&entry.env, owner),
        subject: format!("Cron <{}@{}> {}", owner, hostname(), cmd),
        env: Some(&entry.env),
        always_mail: false,
        only_on_error: entry.flags.contains(EntryFlags::MAIL_WHEN_ERR),
    };
    let status = relay.run(output, &mut child);

    if let Some(pid) = feeder {
        wait_pid(pid);
    }
    status
}

/// Run one at job to completion and mail its output.
///
/// The job file is unlinked as soon as it is open, before its header is
/// checked, so a rejected or interrupted job is never retried.
pub fn run_at_job(
    job: &AtJob,
    config: &Config,
    passwd: &dyn PasswdLookup,
) -> Result<ExitStatus, AtError> {
    let path = config.at_dir.join(job.file_name());
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(&path)?;
    fs::remove_file(&path)?;

    let meta = file.metadata()?;
    if !meta.file_type().is_file() {
        return Err(AtError::NotRegular);
    }

    let mut reader = BufReader::new(file);
    let header = AtHeader::read(&mut reader)?;
    if header.uid != job.uid
        || header.gid != job.gid
        || meta.uid() != job.uid
        || meta.gid() != job.gid
    {
        return Err(AtError::Mismatch {
            header_uid: header.uid,
            header_gid: header.gid,
            file_uid: meta.uid(),
            file_gid: meta.gid(),
        });
    }
    let pw = passwd
        .get_by_uid(header.uid)
        .ok_or(AtError::UnknownUser(header.uid))?;

    info!("({}) ATRUN ({})", pw.name, job);

    let mut script = reader.into_inner();
    script.seek(SeekFrom::Start(0))?;

    let mut command = Command::new(DEFAULT_SHELL);
    command.env_clear().envs(at_env(&pw).iter());
    let privileges = Privileges::new(&pw, &pw.home, job.niceness())?;
    let (output, mut child) = spawn_runner(command, Stdio::from(script), privileges)?;

    let relay = Relay {
        config,
        owner: &pw.name,
        mailto: Some(header.mailto),
        subject: String::from("Output from \"at\" job"),
        env: None,
        always_mail: header.always_mail,
        only_on_error: false,
    };
    Ok(relay.run(output, &mut child)?)
}

fn at_env(pw: &Passwd) -> Env {
    let mut env = Env::new();
    env.set("PATH", DEFAULT_PATH);
    env.set("SHELL", DEFAULT_SHELL);
    env.set("HOME", &pw.home);
    env.set("LOGNAME", &pw.name);
    env.set("USER", &pw.name);
    env
}

/// Identity and context applied in the command runner just before exec.
struct Privileges {
    uid: libc::uid_t,
    gid: libc::gid_t,
    name: CString,
    home: CString,
    niceness: i32,
    change_ids: bool,
}

impl Privileges {
    fn new(pw: &Passwd, home: &str, niceness: i32) -> io::Result<Self> {
        // SAFETY: geteuid() cannot fail.
        let euid = unsafe { libc::geteuid() };
        if euid != 0 && euid != pw.uid {
            return Err(io::Error::new(
                ErrorKind::PermissionDenied,
                format!("cannot run a job as {} without root", pw.name),
            ));
        }

        Ok(Self {
            uid: pw.uid,
            gid: pw.gid,
            name: CString::new(pw.name.as_str())?,
            home: CString::new(home)?,
            niceness,
            change_ids: euid == 0,
        })
    }

    /// Runs between fork and exec: only async-signal-safe calls on data
    /// prepared beforehand.
    fn apply(&self) -> io::Result<()> {
        // SAFETY: plain libc calls on owned, NUL-terminated strings.
        unsafe {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }

            if self.niceness > 0 {
                errno::set_errno(errno::Errno(0));
                if libc::nice(self.niceness) == -1 && errno::errno().0 != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            if self.change_ids {
                // the group must be set while we are still root
                if libc::setgid(self.gid) != 0 {
                    return Err(io::Error::last_os_error());
                }

                // Note: initgroups takes c_int on macOS, gid_t on Linux
                #[cfg(target_os = "macos")]
                let initgroups_gid = self.gid as libc::c_int;
                #[cfg(not(target_os = "macos"))]
                let initgroups_gid = self.gid;

                if libc::initgroups(self.name.as_ptr(), initgroups_gid) != 0 {
                    return Err(io::Error::last_os_error());
                }

                // the session is new, and setlogin needs root
                #[cfg(any(
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "openbsd",
                    target_os = "netbsd"
                ))]
                if libc::setlogin(self.name.as_ptr()) != 0 {
                    return Err(io::Error::last_os_error());
                }

                if libc::setuid(self.uid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            if libc::chdir(self.home.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }
        Ok(())
    }
}

/// Start the command runner with stdout and stderr on one pipe.
///
/// Returns the read end of that pipe and the child.
fn spawn_runner(
    mut command: Command,
    stdin: Stdio,
    privileges: Privileges,
) -> io::Result<(File, Child)> {
    let (read, write) = pipe()?;
    command
        .stdin(stdin)
        .stdout(write.try_clone()?)
        .stderr(write);

    // SAFETY: Privileges::apply only makes async-signal-safe libc calls.
    unsafe {
        command.pre_exec(move || privileges.apply());
    }
    let child = command.spawn()?;

    // dropping `command` closes our copies of the write end
    drop(command);
    Ok((File::from(read), child))
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];

    // SAFETY: fds has room for the two descriptors pipe() fills in, and
    // both are owned by nobody else once it returns.
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let read = OwnedFd::from_raw_fd(fds[0]);
        let write = OwnedFd::from_raw_fd(fds[1]);
        for fd in fds {
            if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok((read, write))
    }
}

/// Fork the stdin feeder. The returned pid must be waited for.
fn feed_stdin(mut stdin: ChildStdin, data: &[u8]) -> io::Result<libc::pid_t> {
    // SAFETY: single-threaded caller; the feeder only writes to the pipe
    // and leaves through _exit().
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            let code = match stdin.write_all(data) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            drop(stdin);
            // SAFETY: see above.
            unsafe { libc::_exit(code) }
        }
        // our copy of the write end closes when `stdin` drops here
        pid => Ok(pid),
    }
}

fn wait_pid(pid: libc::pid_t) {
    let mut status = 0;
    loop {
        // SAFETY: waiting on our own child with a valid status pointer.
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r >= 0 || io::Error::last_os_error().kind() != ErrorKind::Interrupted {
            break;
        }
    }
}

/// Where a job's output goes once the command is running.
struct Relay<'a> {
    config: &'a Config,
    owner: &'a str,
    mailto: Option<String>,
    subject: String,
    env: Option<&'a Env>,
    always_mail: bool,
    only_on_error: bool,
}

impl Relay<'_> {
    /// Read the command's output to EOF, mail it if needed, and reap the
    /// command.
    fn run(&self, mut output: File, child: &mut Child) -> io::Result<ExitStatus> {
        let mut first = vec![0u8; BUFSZ];
        let n = read_some(&mut output, &mut first)?;
        first.truncate(n);

        let Some(mailto) = self.mailto.as_deref() else {
            io::copy(&mut output, &mut io::sink())?;
            return child.wait();
        };

        if n == 0 && !self.always_mail {
            return child.wait();
        }

        if self.only_on_error {
            output.read_to_end(&mut first)?;
            let status = child.wait()?;
            if !status.success() {
                if let Err(e) = self.deliver(mailto, &first, &mut io::empty()) {
                    warn!("({}) MAIL ({})", self.owner, e);
                }
            }
            return Ok(status);
        }

        if let Err(e) = self.deliver(mailto, &first, &mut output) {
            warn!("({}) MAIL ({})", self.owner, e);
        }
        // whatever the mailer did not take still has to be read
        io::copy(&mut output, &mut io::sink())?;
        child.wait()
    }

    fn deliver(&self, mailto: &str, first: &[u8], rest: &mut dyn Read) -> io::Result<()> {
        let headers = compose_headers(mailto, &self.subject, self.env);
        let mut mailer = Mailer::open(self.config, self.owner, &headers)?;
        mailer.write_body(first)?;
        mailer.copy_from(rest)?;
        mailer.finish()?;
        Ok(())
    }
}

fn read_some(reader: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}
