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

use std::os::{fd::BorrowedFd, unix::io::RawFd};

use anyhow::Context;
use nix::{
    sys::termios,
    sys::termios::SetArg,
    unistd::isatty,
};
use tracing::error;

use crate::consts;

// see `man ioctl_tty` for info on these ioctl commands
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

/// The terminal size the client reports to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    /// Fetch the size of the terminal behind `fd`.
    pub fn from_fd(fd: RawFd) -> anyhow::Result<Size> {
        let mut term_size = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };

        // Safety: term_size is stack allocated and live for the whole
        //         call.
        unsafe {
            tiocgwinsz(fd, &mut term_size).context("fetching term size")?;
        }

        Ok(Size { rows: term_size.ws_row, cols: term_size.ws_col })
    }

    /// Resize the tty behind `fd` (the server applies this to the PTY
    /// master, which resizes the whole session).
    pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
        let term_size =
            libc::winsize { ws_row: self.rows, ws_col: self.cols, ws_xpixel: 0, ws_ypixel: 0 };

        // Safety: term_size is live for the whole call.
        unsafe {
            tiocswinsz(fd, &term_size).context("setting term size")?;
        }

        Ok(())
    }
}

/// Switch the controlling terminal to raw mode, restoring the saved flags
/// when the guard drops. Dropping on every exit path (including unwind) is
/// what keeps a dead session from leaving the user's terminal wedged.
pub fn set_raw_mode() -> anyhow::Result<RawModeGuard<'static>> {
    // Safety: stdin is live for the whole program duration
    let fd = unsafe { BorrowedFd::borrow_raw(consts::STDIN_FD) };

    if !isatty(consts::STDIN_FD)? || !isatty(1)? {
        // Not attached to a terminal, so don't futz with its flags.
        return Ok(RawModeGuard { fd, old: None });
    }

    let old = termios::tcgetattr(fd).context("grabbing term flags")?;

    let mut raw = old.clone();
    termios::cfmakeraw(&mut raw);
    termios::tcsetattr(fd, SetArg::TCSADRAIN, &raw).context("setting raw mode")?;

    Ok(RawModeGuard { fd, old: Some(old) })
}

pub struct RawModeGuard<'fd> {
    fd: BorrowedFd<'fd>,
    old: Option<termios::Termios>,
}

impl std::ops::Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if let Some(old) = &self.old {
            if let Err(e) = termios::tcsetattr(self.fd, SetArg::TCSADRAIN, old) {
                error!("error restoring terminal settings: {:?}", e);
            }
        }
    }
}
