//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

/// Split a crontab command at its first unescaped `%`.
///
/// The part before it is the shell command, with `\%` turned into `%`.
/// The part after it becomes the job's standard input: each further
/// unescaped `%` is a newline and `\%` is a literal `%`. Other backslashes
/// are passed through untouched in both parts.
pub fn split_command(cmd: &str) -> (String, Option<String>) {
    let mut command = String::with_capacity(cmd.len());
    let mut chars = cmd.chars();
    let mut escaped = false;

    for ch in chars.by_ref() {
        if escaped {
            if ch != '%' {
                command.push('\\');
            }
            command.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '%' {
            return (command, Some(unescape_input(chars.as_str())));
        } else {
            command.push(ch);
        }
    }
    if escaped {
        command.push('\\');
    }

    (command, None)
}

fn unescape_input(data: &str) -> String {
    let mut input = String::with_capacity(data.len());
    let mut escaped = false;

    for ch in data.chars() {
        if escaped {
            if ch != '%' {
                input.push('\\');
            }
            escaped = false;
            if ch == '\\' {
                escaped = true;
                continue;
            }
            input.push(ch);
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '%' {
            input.push('\n');
        } else {
            input.push(ch);
        }
    }
    if escaped {
        input.push('\\');
    }

    input
}
