// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! utmp/wtmp login accounting.
//!
//! The login record is written while still root (from the shell child);
//! the logout record is written after privilege drop, through a wtmp fd
//! that was opened privileged and deliberately retained across the drop.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use tracing::warn;

use crate::{consts, pty};

// Not exposed by the `libc` crate for Linux; glibc provides the symbol.
extern "C" {
    fn updwtmpx(file: *const libc::c_char, ut: *const libc::utmpx);
}

fn copy_chars(dst: &mut [libc::c_char], src: &str) {
    let max = dst.len() - 1;
    for (d, s) in dst.iter_mut().zip(src.bytes().take(max)) {
        *d = s as libc::c_char;
    }
}

fn stamp(ut: &mut libc::utmpx) {
    if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
        ut.ut_tv.tv_sec = now.as_secs() as _;
        ut.ut_tv.tv_usec = now.subsec_micros() as _;
    }
}

/// Record the login in utmp (who/w) and wtmp (last). Run as root, from
/// the shell child, before privileges drop.
pub fn log_login(username: &str, tty_name: &str, peer_addr: &str) -> anyhow::Result<()> {
    // Safety: utmpx is plain-old-data; all-zeroes is the conventional
    //         starting point.
    let mut ut: libc::utmpx = unsafe { std::mem::zeroed() };
    ut.ut_type = libc::USER_PROCESS;
    ut.ut_pid = std::process::id() as libc::pid_t;
    copy_chars(&mut ut.ut_line, pty::short_tty_name(tty_name));
    copy_chars(&mut ut.ut_id, pty::tty_id(tty_name));
    copy_chars(&mut ut.ut_user, username);
    copy_chars(&mut ut.ut_host, peer_addr);
    stamp(&mut ut);

    // Safety: ut is live across all three calls; this process is single
    //         threaded at this point.
    unsafe {
        libc::setutxent();
        let written = libc::pututxline(&ut);
        libc::endutxent();
        if written.is_null() {
            return Err(std::io::Error::last_os_error()).context("pututxline");
        }

        let path = std::ffi::CString::new(consts::WTMP_FILE).expect("static path");
        updwtmpx(path.as_ptr(), &ut);
    }
    Ok(())
}

/// Open the wtmp file for the eventual logout record. Must happen while
/// still privileged (and before any chroot); the fd is the one privileged
/// resource the session keeps. Best-effort: a missing wtmp just means no
/// accounting.
pub fn open_wtmp() -> Option<File> {
    match OpenOptions::new().append(true).open(consts::WTMP_FILE) {
        Ok(f) => Some(f),
        Err(err) => {
            warn!("cannot open {} for logout accounting: {}", consts::WTMP_FILE, err);
            None
        }
    }
}

/// Append the logout record through the retained fd. Run as the logged-in
/// user; failures are logged and swallowed since the session itself is
/// already over.
pub fn log_logout(wtmp: &mut File, tty_name: &str) {
    // Safety: utmpx is plain-old-data.
    let mut ut: libc::utmpx = unsafe { std::mem::zeroed() };
    ut.ut_type = libc::DEAD_PROCESS;
    copy_chars(&mut ut.ut_line, pty::short_tty_name(tty_name));
    stamp(&mut ut);

    // wtmp is a flat array of records appended in whole
    // Safety: reading the raw bytes of plain-old-data.
    let bytes = unsafe {
        std::slice::from_raw_parts(
            &ut as *const libc::utmpx as *const u8,
            std::mem::size_of::<libc::utmpx>(),
        )
    };
    if let Err(err) = wtmp.write_all(bytes) {
        warn!("writing logout record: {}", err);
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Seek};

    use super::*;

    #[test]
    fn logout_record_is_one_whole_utmpx() -> anyhow::Result<()> {
        let mut file = tempfile::tempfile()?;
        log_logout(&mut file, "/dev/pts/7");

        file.rewind()?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        assert_eq!(bytes.len(), std::mem::size_of::<libc::utmpx>());

        // ut_line must carry the short tty name
        let line: Vec<u8> = bytes
            .iter()
            .skip(std::mem::offset_of!(libc::utmpx, ut_line))
            .take(5)
            .copied()
            .collect();
        assert_eq!(&line, b"pts/7");
        Ok(())
    }
}
