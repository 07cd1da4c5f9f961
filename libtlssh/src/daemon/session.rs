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

//! The per-connection session process. Entered as root with a freshly
//! accepted socket; ends with the user's shell gone and a logout record
//! written.
//!
//! Process topology: this process terminates TLS and pumps bytes; a
//! forked child owns the PTY slave and becomes the user's shell. Both
//! drop privileges to the authenticated user, the child just before
//! reading the preamble off the control pipe, the parent right after
//! opening wtmp (and chrooting, if configured).

use std::{
    ffi::CString,
    fs::File,
    net::TcpStream,
    os::fd::{AsFd, AsRawFd, OwnedFd},
};

use anyhow::{anyhow, bail, Context};
use nix::{
    sys::signal::{signal, SigHandler, Signal},
    unistd,
    unistd::{Gid, Uid},
};
use tracing::{debug, info};

use crate::{
    config::Config,
    consts, iac,
    daemon::{records, user, user::Passwd},
    preamble,
    pty::{self, PtyFork},
    pump::Pump,
    tls::TlsSession,
    tty,
};

/// Applies decoded window-size commands to the PTY, which resizes the
/// whole session.
struct WinsizeSink {
    pty_master: i32,
}

impl iac::CommandSink for WinsizeSink {
    fn set_window_size(&mut self, rows: u16, cols: u16) -> anyhow::Result<()> {
        debug!("resizing pty to {}x{}", rows, cols);
        tty::Size { rows, cols }.set_fd(self.pty_master)
    }
}

/// Run one session on an accepted socket. Root until the privilege drop
/// inside; never returns to privileged code.
pub fn run(config: &Config, sock: TcpStream, peer_addr: String) -> anyhow::Result<()> {
    // Operators signal the listener; established sessions ride out ^C.
    // Safety: SigIgn installs no handler code.
    unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }.context("ignoring SIGINT")?;

    unistd::chdir("/").context("chdir(/)")?;

    crate::net::apply_socket_options(&sock, config)?;
    let mut sess = TlsSession::accept(config, sock)
        .map_err(|e| anyhow!("TLS accept from {}: {}", peer_addr, e))?;

    // The verifier guarantees the chain; identity comes from the CN.
    let cert = match sess.peer_cert() {
        Some(cert) => cert,
        None => {
            let _ = sess.full_write(b"You are the no-cert client. Goodbye.\r\n");
            bail!("client provided no cert");
        }
    };
    debug!("client cert: {}", cert.subject().unwrap_or_default());

    let cn = cert.common_name()?;
    let (username, domain) =
        cn.split_once('.').ok_or_else(|| anyhow!("cert CN '{}' had no dot", cn))?;
    let client_domain = config
        .client_domain
        .as_deref()
        .ok_or_else(|| anyhow!("no ClientDomain configured"))?;
    if domain != client_domain {
        bail!("client is in wrong domain '{}'", domain);
    }
    info!("logged in using cert: user=<{}>, domain=<{}>", username, domain);

    let pw = user::by_name(username)?;

    // parent writes preamble bytes, shell child reads them
    let (control_rx, control_tx) = unistd::pipe().context("creating control pipe")?;

    match pty::fork_with_pty()? {
        PtyFork::Child => {
            drop(control_tx);
            shell_child(&pw, control_rx, &peer_addr);
        }
        PtyFork::Parent { master, child, tty_name } => {
            drop(control_rx);
            debug!("shell process {} on {}", child, tty_name);

            // The only privileged resource we keep: wtmp, for the logout
            // record at the end.
            let mut wtmp = records::open_wtmp();

            if let Some(dir) = &config.chroot {
                unistd::chroot(dir.as_str()).with_context(|| format!("chroot({dir})"))?;
                unistd::chdir("/").context("chdir(/) after chroot")?;
            }
            drop_privs(&pw)?;

            let mut control = File::from(control_tx);
            preamble::forward(&mut sess, &mut control).context("forwarding preamble")?;
            drop(control);

            let mut sink = WinsizeSink { pty_master: master.as_raw_fd() };
            let mut pump = Pump::server(&mut sess, master.as_fd(), &mut sink);
            let pump_res = pump.run();

            if let Some(wtmp) = wtmp.as_mut() {
                records::log_logout(wtmp, &tty_name);
            }
            sess.close();
            info!("session for {} over", pw.name);
            pump_res
        }
    }
}

/// The forked shell process: fds 0/1/2 are the PTY slave. Briefly root to
/// fix up the slave's ownership and write login accounting, then strictly
/// the authenticated user.
fn shell_child(pw: &Passwd, control: OwnedFd, peer_addr: &str) -> ! {
    match exec_shell(pw, control, peer_addr) {
        Ok(never) => match never {},
        Err(err) => {
            eprintln!("tlsshd: starting shell: {err:#}");
            std::process::exit(1);
        }
    }
}

fn exec_shell(
    pw: &Passwd,
    control: OwnedFd,
    peer_addr: &str,
) -> anyhow::Result<std::convert::Infallible> {
    // the slave is our stdin; make it the user's tty and nobody else's
    // Safety: plain ffi on fd 0.
    unsafe {
        if libc::fchmod(0, 0o600) != 0 {
            return Err(std::io::Error::last_os_error()).context("fchmod(slave, 0600)");
        }
        if libc::fchown(0, pw.uid, !0) != 0 {
            return Err(std::io::Error::last_os_error()).context("fchown(slave)");
        }
    }

    let tty_name = unistd::ttyname(std::io::stdin().as_fd())
        .context("resolving slave tty name")?
        .to_string_lossy()
        .into_owned();
    records::log_login(&pw.name, &tty_name, peer_addr).context("writing login record")?;

    drop_privs(pw)?;

    // The preamble arrives through the control pipe; the closed pipe is
    // the signal that the session proper has begun.
    let mut control = File::from(control);
    let preamble = preamble::parse(&mut control).context("reading preamble")?;
    drop(control);

    let _ = unistd::chdir(pw.home_dir.as_str());

    let shell_basename = pw.shell.rsplit('/').next().unwrap_or(&pw.shell);
    let arg0 = if preamble.want_pty {
        // a leading dash makes it a login shell, same trick as sshd
        format!("-{shell_basename}")
    } else {
        String::from(shell_basename)
    };

    let env: Vec<CString> = [
        format!("TERM={}", preamble.term.as_deref().unwrap_or("dumb")),
        format!("HOME={}", pw.home_dir),
        format!("USER={}", pw.name),
        format!("LOGNAME={}", pw.name),
        format!("SHELL={}", pw.shell),
        String::from("PATH=/usr/bin:/bin:/usr/sbin:/sbin"),
    ]
    .iter()
    .map(|s| CString::new(s.as_str()))
    .collect::<Result<_, _>>()
    .context("building environment")?;

    let path = CString::new(pw.shell.as_str()).context("shell path")?;
    let arg0 = CString::new(arg0).context("arg0")?;

    // nothing beyond the tty fds leaks into the user's shell
    let open_max = unistd::sysconf(unistd::SysconfVar::OPEN_MAX)
        .ok()
        .flatten()
        .unwrap_or(1024) as i32;
    for fd in consts::STDERR_FD + 1..open_max {
        let _ = unistd::close(fd);
    }

    unistd::execve(&path, &[arg0.as_c_str()], &env).context("exec shell")?;
    unreachable!("execve returned without error");
}

/// Drop to the authenticated user. The order is load-bearing: the
/// supplementary group list has to be set while we can still call
/// initgroups, and the gid triplet while uid 0 can still switch groups.
/// Any failure aborts the spawn.
fn drop_privs(pw: &Passwd) -> anyhow::Result<()> {
    let name = CString::new(pw.name.as_str()).context("username")?;
    let gid = Gid::from_raw(pw.gid);
    let uid = Uid::from_raw(pw.uid);

    unistd::initgroups(&name, gid).context("initgroups")?;
    unistd::setresgid(gid, gid, gid).context("setresgid")?;
    unistd::setresuid(uid, uid, uid).context("setresuid")?;
    Ok(())
}
