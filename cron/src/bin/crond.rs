//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use clap::Parser;
use cron::daemon::{self, SignalFlags};
use cron::executor::Executor;
use cron::passwd::SystemPasswd;
use cron::scheduler::{Scheduler, SystemClock};
use cron::{Config, CronError};
use gettextrs::{bind_textdomain_codeset, gettext, setlocale, textdomain, LocaleCategory};
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::process::ExitCode;
use syslog::{BasicLogger, Facility, Formatter3164};

static SIGNALS: SignalFlags = SignalFlags::new();

/// crond - run scheduled commands
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = gettext("crond - run scheduled commands"),
    long_about = gettext("The 'crond' daemon runs the commands listed in user and system crontabs \
                  at the times they name, and the jobs queued by 'at' and 'batch'.")
)]
struct Args {
    #[arg(short = 'n', long = "foreground", help = gettext("Stay in the foreground and log to standard error"))]
    foreground: bool,

    #[arg(short = 'l', long = "load-average", value_name = "LOAD", help = gettext("Start batch jobs only while the load average is at or below LOAD (0 disables the check)"))]
    load_average: Option<f64>,

    #[arg(long, value_name = "DIR", help = gettext("Directory holding user crontabs"))]
    spool_dir: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = gettext("System crontab"))]
    system_crontab: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = gettext("Directory holding at jobs"))]
    at_dir: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = gettext("PID and lock file"))]
    pid_file: Option<PathBuf>,

    #[arg(long, value_name = "PROGRAM", help = gettext("Mail transport agent that delivers job output"))]
    mailer: Option<PathBuf>,

    #[arg(long, value_name = "MINUTES", help = gettext("Largest clock step replayed minute by minute"))]
    drift_threshold: Option<i64>,

    #[arg(long, value_name = "MINUTES", help = gettext("Clock steps beyond this are not caught up"))]
    jump_threshold: Option<i64>,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::default();
        if let Some(load) = self.load_average {
            config.batch_max_load = load;
        }
        if let Some(dir) = &self.spool_dir {
            config.spool_dir = dir.clone();
        }
        if let Some(file) = &self.system_crontab {
            config.system_crontab = file.clone();
        }
        if let Some(dir) = &self.at_dir {
            config.at_dir = dir.clone();
        }
        if let Some(file) = &self.pid_file {
            config.pid_file = file.clone();
        }
        if let Some(mailer) = &self.mailer {
            config.mailer = mailer.clone();
        }
        if let Some(n) = self.drift_threshold {
            config.drift_threshold = n;
        }
        if let Some(n) = self.jump_threshold {
            config.jump_threshold = n;
        }
        config
    }
}

fn init_logging(foreground: bool) -> Result<(), CronError> {
    if foreground {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Info)
            .parse_default_env()
            .init();
        return Ok(());
    }

    let formatter = Formatter3164 {
        facility: Facility::LOG_CRON,
        hostname: None,
        process: "crond".into(),
        pid: std::process::id(),
    };
    let logger = syslog::unix(formatter).map_err(|e| CronError::Logging(e.to_string()))?;
    log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
        .map(|()| log::set_max_level(LevelFilter::Info))
        .map_err(|e| CronError::Logging(e.to_string()))
}

/// Handles SIGHUP: reload every crontab on the next wakeup.
extern "C" fn handle_sighup(_: libc::c_int) {
    SIGNALS.request_reload();
}

/// Handles SIGCHLD: the main loop reaps.
extern "C" fn handle_sigchld(_: libc::c_int) {
    SIGNALS.child_exited();
}

/// Handles SIGTERM/SIGINT.
extern "C" fn handle_shutdown(_: libc::c_int) {
    SIGNALS.request_shutdown();
}

fn install_signal_handlers() {
    // SAFETY: signal() with valid signal numbers and extern "C" handlers
    // that only perform atomic stores.
    unsafe {
        libc::signal(libc::SIGHUP, handle_sighup as *const () as usize);
        libc::signal(libc::SIGCHLD, handle_sigchld as *const () as usize);
        libc::signal(libc::SIGTERM, handle_shutdown as *const () as usize);
        libc::signal(libc::SIGINT, handle_shutdown as *const () as usize);
    }
}

fn run(args: &Args) -> Result<(), CronError> {
    let config = args.config();

    if !args.foreground && daemon::daemonize()? > 0 {
        return Ok(());
    }
    init_logging(args.foreground)?;

    // keep the handle alive for the daemon's lifetime
    let _pid_lock = daemon::acquire_lock(&config.pid_file)?;
    daemon::ensure_dirs(&config)?;
    install_signal_handlers();

    info!("(CRON) STARTUP ({})", env!("CARGO_PKG_VERSION"));

    let executor = Executor::new(config.clone());
    let mut scheduler = Scheduler::new(config, SystemClock, executor, SystemPasswd);
    scheduler.load()?;
    scheduler.run_reboot_jobs();

    while scheduler.tick(&SIGNALS)? {}

    info!("(CRON) SHUTDOWN");
    Ok(())
}

fn main() -> ExitCode {
    setlocale(LocaleCategory::LcAll, "");
    if textdomain("posixutils-rs").is_err()
        || bind_textdomain_codeset("posixutils-rs", "UTF-8").is_err()
    {
        eprintln!("crond: cannot set up localization");
    }

    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("(CRON) DEATH ({})", e);
            eprintln!("crond: {}", e);
            ExitCode::FAILURE
        }
    }
}
