//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::fixture::{at_header, Spool};
use cron::atjob::{parse_file_name, AtJob};
use cron::entry::load_entry;
use cron::env::Env;
use cron::executor::{run_at_job, run_cron_job};
use cron::mail::hostname;
use cron::passwd::Passwd;
use cron::{AtError, Config, Entry};
use std::fs;
use std::path::{Path, PathBuf};

/// A config whose mailer appends each message to `mail.txt`.
fn mail_config(spool: &Spool) -> (Config, PathBuf) {
    let mbox = spool.root.path().join("mail.txt");
    let mut config = spool.config.clone();
    config.mailer = PathBuf::from("/bin/sh");
    config.mailer_args = vec![
        "-c".to_string(),
        format!("cat >> '{}'", mbox.display()),
    ];
    (config, mbox)
}

fn entry(spool: &Spool, env: &Env, line: &str) -> Entry {
    let pw = spool.real_user();
    load_entry(line, Some(&pw), env, &Vec::<Passwd>::new())
        .unwrap()
        .unwrap()
}

fn mail(mbox: &Path) -> Option<String> {
    fs::read_to_string(mbox).ok()
}

#[test]
fn test_output_is_mailed() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let e = entry(&spool, &Env::new(), "* * * * * echo hello; pwd");
    let owner = e.pwd.name.clone();

    let status = run_cron_job(&e, &config).unwrap();
    assert!(status.success());

    let text = mail(&mbox).unwrap();
    assert!(text.contains(&format!("To: {}\n", owner)));
    assert!(text.contains(&format!(
        "Subject: Cron <{}@{}> echo hello; pwd\n",
        owner,
        hostname()
    )));
    assert!(text.contains("Auto-Submitted: auto-generated\n"));
    assert!(text.contains(&format!("X-Cron-Env: <LOGNAME={}>\n", owner)));

    // the job runs in its home directory
    let home = spool.home().canonicalize().unwrap();
    assert!(text.ends_with(&format!("\n\nhello\n{}\n", home.display())));
}

#[test]
fn test_no_output_no_mail() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let e = entry(&spool, &Env::new(), "* * * * * exit 4");

    let status = run_cron_job(&e, &config).unwrap();
    assert_eq!(status.code(), Some(4));
    assert!(mail(&mbox).is_none());
}

#[test]
fn test_percent_input() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let e = entry(&spool, &Env::new(), "* * * * * tr a-z A-Z%line one%line\\%two");

    run_cron_job(&e, &config).unwrap();
    let text = mail(&mbox).unwrap();
    assert!(text.contains("Subject: Cron <"));
    assert!(text.ends_with("\n\nLINE ONE\nLINE%TWO"));
}

#[test]
fn test_unread_input_does_not_block() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let input = "x".repeat(300 * 1024);

    // far more input than a pipe holds, and nobody reads it
    let e = entry(&spool, &Env::new(), &format!("* * * * * true%{}", input));
    assert!(run_cron_job(&e, &config).unwrap().success());
    assert!(mail(&mbox).is_none());

    let e = entry(&spool, &Env::new(), &format!("* * * * * head -c 5%{}", input));
    assert!(run_cron_job(&e, &config).unwrap().success());
    assert!(mail(&mbox).unwrap().ends_with("\n\nxxxxx"));
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
#[test]
fn test_login_name_is_set() {
    if unsafe { libc::geteuid() } != 0 {
        return;
    }
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let e = entry(&spool, &Env::new(), "* * * * * logname");
    let owner = e.pwd.name.clone();

    assert!(run_cron_job(&e, &config).unwrap().success());
    assert!(mail(&mbox).unwrap().ends_with(&format!("\n\n{}\n", owner)));
}

#[test]
fn test_stderr_is_captured() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let e = entry(&spool, &Env::new(), "* * * * * echo oops >&2");

    run_cron_job(&e, &config).unwrap();
    assert!(mail(&mbox).unwrap().ends_with("\n\noops\n"));
}

#[test]
fn test_mail_only_on_error() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);

    let quiet = entry(&spool, &Env::new(), "* * * * * -n echo fine");
    assert!(run_cron_job(&quiet, &config).unwrap().success());
    assert!(mail(&mbox).is_none());

    let failing = entry(&spool, &Env::new(), "* * * * * -n echo broken; exit 3");
    assert_eq!(run_cron_job(&failing, &config).unwrap().code(), Some(3));
    assert!(mail(&mbox).unwrap().ends_with("\n\nbroken\n"));
}

#[test]
fn test_empty_mailto_disables_mail() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let mut env = Env::new();
    env.set("MAILTO", "");
    let e = entry(&spool, &env, "* * * * * echo unread");

    assert!(run_cron_job(&e, &config).unwrap().success());
    assert!(mail(&mbox).is_none());
}

#[test]
fn test_job_environment() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let mut env = Env::new();
    env.set("GREETING", "hi there");
    let e = entry(&spool, &env, "* * * * * echo \"$GREETING:$PATH:$LOGNAME\"");
    let owner = e.pwd.name.clone();

    run_cron_job(&e, &config).unwrap();
    let expected = format!("\n\nhi there:/usr/bin:/bin:{}\n", owner);
    assert!(mail(&mbox).unwrap().ends_with(&expected));
}

fn at_job(spool: &Spool, name: &str, body: &str) -> AtJob {
    let pw = spool.real_user();
    spool.write_atjob(name, &format!("{}{}", at_header(&pw.name, false), body));
    let (run_time, queue) = parse_file_name(name).unwrap();
    AtJob {
        run_time,
        queue,
        uid: pw.uid,
        gid: pw.gid,
    }
}

#[test]
fn test_at_job_runs_once() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let passwd = vec![spool.real_user()];
    let job = at_job(&spool, "1000.a", "echo from at\n");

    let status = run_at_job(&job, &config, &passwd).unwrap();
    assert!(status.success());
    assert!(!config.at_dir.join("1000.a").exists());

    let text = mail(&mbox).unwrap();
    assert!(text.contains("Subject: Output from \"at\" job\n"));
    assert!(text.ends_with("\n\nfrom at\n"));

    // the file is gone, so a second run fails
    assert!(matches!(
        run_at_job(&job, &config, &passwd),
        Err(AtError::Io(_))
    ));
}

#[test]
fn test_at_job_silent() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let passwd = vec![spool.real_user()];
    let job = at_job(&spool, "1000.b", "true\n");

    assert!(run_at_job(&job, &config, &passwd).unwrap().success());
    assert!(mail(&mbox).is_none());
}

#[test]
fn test_at_job_owner_mismatch() {
    let spool = Spool::new();
    let (config, mbox) = mail_config(&spool);
    let passwd = vec![spool.real_user()];
    let mut job = at_job(&spool, "1000.c", "echo never\n");
    job.uid += 1;

    let err = run_at_job(&job, &config, &passwd).unwrap_err();
    assert!(matches!(err, AtError::Mismatch { .. }));
    // rejected jobs are still removed
    assert!(!config.at_dir.join("1000.c").exists());
    assert!(mail(&mbox).is_none());
}

#[test]
fn test_at_job_bad_header() {
    let spool = Spool::new();
    let (config, _) = mail_config(&spool);
    let passwd = vec![spool.real_user()];
    let pw = spool.real_user();
    spool.write_atjob("1000.d", "echo no header\n");
    let job = AtJob {
        run_time: 1000,
        queue: 'd',
        uid: pw.uid,
        gid: pw.gid,
    };

    let err = run_at_job(&job, &config, &passwd).unwrap_err();
    assert!(matches!(err, AtError::Format(_)));
}
