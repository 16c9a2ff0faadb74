//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use std::ffi::{CStr, CString};

/// Identity a job runs as, copied out of the password database.
///
/// The password hash is never kept: `passwd` is always empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Passwd {
    pub name: String,
    pub passwd: String,
    pub uid: u32,
    pub gid: u32,
    pub class: Option<String>,
    pub home: String,
    pub shell: String,
}

impl Passwd {
    /// Copy of this record with the password field wiped.
    pub fn scrubbed(&self) -> Self {
        Self {
            passwd: String::new(),
            ..self.clone()
        }
    }
}

/// Lookup seam over the system password database.
pub trait PasswdLookup {
    fn get_by_name(&self, name: &str) -> Option<Passwd>;
    fn get_by_uid(&self, uid: u32) -> Option<Passwd>;
}

/// `getpwnam`/`getpwuid` backed lookup.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPasswd;

impl PasswdLookup for SystemPasswd {
    fn get_by_name(&self, name: &str) -> Option<Passwd> {
        let c_name = CString::new(name).ok()?;

        // SAFETY: getpwnam() returns a pointer to static storage or NULL.
        // The daemon is single-threaded and every field is copied out
        // before the next lookup can overwrite it.
        unsafe { from_raw(libc::getpwnam(c_name.as_ptr())) }
    }

    fn get_by_uid(&self, uid: u32) -> Option<Passwd> {
        // SAFETY: as above, for getpwuid().
        unsafe { from_raw(libc::getpwuid(uid)) }
    }
}

/// Test and tooling lookup over an in-memory table.
impl PasswdLookup for Vec<Passwd> {
    fn get_by_name(&self, name: &str) -> Option<Passwd> {
        self.iter().find(|pw| pw.name == name).map(Passwd::scrubbed)
    }

    fn get_by_uid(&self, uid: u32) -> Option<Passwd> {
        self.iter().find(|pw| pw.uid == uid).map(Passwd::scrubbed)
    }
}

unsafe fn from_raw(pwd: *const libc::passwd) -> Option<Passwd> {
    if pwd.is_null() {
        return None;
    }
    let pw = &*pwd;

    Some(Passwd {
        name: cstr_field(pw.pw_name),
        passwd: String::new(),
        uid: pw.pw_uid,
        gid: pw.pw_gid,
        class: login_class(pw),
        home: cstr_field(pw.pw_dir),
        shell: cstr_field(pw.pw_shell),
    })
}

unsafe fn cstr_field(ptr: *const libc::c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
unsafe fn login_class(pw: &libc::passwd) -> Option<String> {
    let class = cstr_field(pw.pw_class);
    (!class.is_empty()).then_some(class)
}

#[cfg(not(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd")))]
unsafe fn login_class(_pw: &libc::passwd) -> Option<String> {
    None
}
