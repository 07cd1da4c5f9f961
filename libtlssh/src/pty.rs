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

use std::{
    ffi::CStr,
    os::fd::{AsRawFd, OwnedFd},
};

use anyhow::{anyhow, Context};
use nix::{
    pty::{forkpty, ForkptyResult},
    unistd::Pid,
};

/// Outcome of [`fork_with_pty`]. The parent keeps the master; the child
/// has the slave as fds 0/1/2 and a fresh controlling terminal.
pub enum PtyFork {
    Parent { master: OwnedFd, child: Pid, tty_name: String },
    Child,
}

/// forkpty(3) wrapper. In the parent, also resolves the slave tty name
/// (needed for login accounting).
pub fn fork_with_pty() -> anyhow::Result<PtyFork> {
    // Safety: the child only calls async-signal-safe things before exec
    //         (the caller contract).
    match unsafe { forkpty(None, None) }.context("forkpty")? {
        ForkptyResult::Parent { master, child } => {
            let tty_name = slave_name(&master)?;
            Ok(PtyFork::Parent { master, child, tty_name })
        }
        ForkptyResult::Child => Ok(PtyFork::Child),
    }
}

fn slave_name(master: &OwnedFd) -> anyhow::Result<String> {
    let mut buf = [0 as libc::c_char; 128];
    // Safety: buf is stack allocated and ptsname_r writes at most
    //         buf.len() bytes including the NUL.
    let rc = unsafe { libc::ptsname_r(master.as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(anyhow!("ptsname_r: {}", std::io::Error::from_raw_os_error(rc)));
    }
    // Safety: ptsname_r NUL-terminated the buffer
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(String::from(String::from_utf8_lossy(name.to_bytes())))
}

/// `/dev/pts/3` -> `pts/3`, the form utmp's `ut_line` wants.
pub fn short_tty_name(name: &str) -> &str {
    name.strip_prefix("/dev/").unwrap_or(name)
}

/// The utmp `ut_id` form: basename with any `tty` prefix dropped
/// (`/dev/ttyp4` -> `p4`, `/dev/pts/3` -> `3`).
pub fn tty_id(name: &str) -> &str {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.strip_prefix("tty").unwrap_or(base)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tty_name_forms() {
        assert_eq!(short_tty_name("/dev/pts/3"), "pts/3");
        assert_eq!(short_tty_name("pts/3"), "pts/3");
        assert_eq!(tty_id("/dev/pts/3"), "3");
        assert_eq!(tty_id("/dev/ttyp4"), "p4");
        assert_eq!(tty_id("ttyS0"), "S0");
    }
}
