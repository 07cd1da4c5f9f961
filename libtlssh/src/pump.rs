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

//! The I/O pump: a readiness-driven loop shuttling bytes between the TLS
//! link and a local file descriptor (the terminal on the client, the PTY
//! master on the server), with one byte queue per direction.
//!
//! POLLOUT is only requested for a side whose queue is non-empty, so a
//! slow peer gates local reads through the socket buffer.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use tracing::{debug, trace};

use crate::{
    consts, iac,
    iac::CommandSink,
    tls::{TlsError, TlsSession},
    tty,
};

/// The decrypting side of the pump. `TlsSession` is the production
/// implementation; tests drive the pump over plain sockets.
pub trait Link: AsFd {
    /// One decrypted read. Empty means a record decoded to no plaintext.
    fn read_chunk(&mut self) -> Result<Vec<u8>, TlsError>;
    /// More decrypted bytes buffered inside the link, readable without
    /// touching the socket?
    fn pending(&mut self) -> bool;
    /// One write; may take a prefix.
    fn write_chunk(&mut self, buf: &[u8]) -> Result<usize, TlsError>;
}

impl Link for TlsSession {
    fn read_chunk(&mut self) -> Result<Vec<u8>, TlsError> {
        self.read(None)
    }

    fn pending(&mut self) -> bool {
        TlsSession::pending(self)
    }

    fn write_chunk(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        self.write(buf)
    }
}

enum Role<'a> {
    /// Terminal side: IAC-escape outbound bytes, pass inbound through,
    /// turn SIGWINCH into window-size frames. Blocks in poll forever.
    Client { winch: &'a AtomicBool },
    /// PTY side: interpret inbound IAC, pass outbound through. Wakes up
    /// once a second to re-check termination.
    Server { decoder: iac::Decoder, sink: &'a mut dyn CommandSink },
}

pub struct Pump<'a, L: Link> {
    link: &'a mut L,
    local: BorrowedFd<'a>,
    role: Role<'a>,

    to_peer: Vec<u8>,
    to_local: Vec<u8>,
    /// Inbound ciphertext-side bytes not yet run through the IAC decoder
    /// (a frame can straddle reads).
    inbound_raw: Vec<u8>,

    tls_closed: bool,
    local_closed: bool,
}

impl<'a, L: Link> Pump<'a, L> {
    pub fn client(link: &'a mut L, terminal: BorrowedFd<'a>, winch: &'a AtomicBool) -> Self {
        Pump::new(link, terminal, Role::Client { winch })
    }

    pub fn server(
        link: &'a mut L,
        pty_master: BorrowedFd<'a>,
        sink: &'a mut dyn CommandSink,
    ) -> Self {
        Pump::new(link, pty_master, Role::Server { decoder: iac::Decoder::new(), sink })
    }

    fn new(link: &'a mut L, local: BorrowedFd<'a>, role: Role<'a>) -> Self {
        Pump {
            link,
            local,
            role,
            to_peer: Vec::new(),
            to_local: Vec::new(),
            inbound_raw: Vec::new(),
            tls_closed: false,
            local_closed: false,
        }
    }

    /// Queue a window-size command at the current tail of the outbound
    /// queue: after everything already buffered, before any input not yet
    /// read.
    fn queue_window_size(&mut self, rows: u16, cols: u16) {
        self.to_peer.extend_from_slice(&iac::window_size_frame(rows, cols));
    }

    fn done(&self) -> bool {
        if self.tls_closed && self.local_closed {
            return true;
        }
        match self.role {
            // the peer hanging up ends the session once its remaining
            // output has reached the terminal
            Role::Client { .. } => self.tls_closed && self.to_local.is_empty(),
            // the server outlives a dropped link; only the shell exiting
            // (with its last output delivered) ends the session
            Role::Server { .. } => self.local_closed && self.to_peer.is_empty(),
        }
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            if self.done() {
                debug!("pump done (tls_closed={} local_closed={})", self.tls_closed, self.local_closed);
                return Ok(());
            }

            let winch = match &self.role {
                Role::Client { winch } => Some(*winch),
                Role::Server { .. } => None,
            };
            if let Some(winch) = winch {
                if winch.swap(false, Ordering::Relaxed) {
                    if let Ok(size) = tty::Size::from_fd(self.local.as_raw_fd()) {
                        debug!("window size now {}x{}", size.rows, size.cols);
                        self.queue_window_size(size.rows, size.cols);
                    }
                }
            }

            let timeout = match self.role {
                Role::Client { .. } => PollTimeout::NONE,
                Role::Server { .. } => PollTimeout::try_from(consts::SERVER_POLL_TIMEOUT)
                    .unwrap_or(PollTimeout::MAX),
            };

            let (tls_in, tls_out, local_in, local_out, local_hup) = {
                let mut fds = Vec::with_capacity(2);
                let mut tls_idx = None;
                let mut local_idx = None;

                if !self.tls_closed {
                    let mut events = PollFlags::POLLIN;
                    if !self.to_peer.is_empty() {
                        events |= PollFlags::POLLOUT;
                    }
                    tls_idx = Some(fds.len());
                    fds.push(PollFd::new(self.link.as_fd(), events));
                }
                if !self.local_closed {
                    let mut events = PollFlags::POLLIN;
                    if !self.to_local.is_empty() {
                        events |= PollFlags::POLLOUT;
                    }
                    local_idx = Some(fds.len());
                    fds.push(PollFd::new(self.local, events));
                }

                match poll(&mut fds, timeout) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e).context("polling session fds"),
                }

                let revents = |idx: Option<usize>| {
                    idx.and_then(|i| fds[i].revents()).unwrap_or(PollFlags::empty())
                };
                let tls_ev = revents(tls_idx);
                let local_ev = revents(local_idx);
                (
                    tls_ev.intersects(PollFlags::POLLIN | PollFlags::POLLHUP),
                    tls_ev.contains(PollFlags::POLLOUT),
                    local_ev.contains(PollFlags::POLLIN),
                    local_ev.contains(PollFlags::POLLOUT),
                    local_ev.contains(PollFlags::POLLHUP),
                )
            };

            if tls_in {
                self.drain_link()?;
            }
            self.deliver_inbound()?;

            if local_in {
                self.read_local()?;
            }
            if local_hup && !local_in && !self.local_closed {
                debug!("local side hung up");
                self.local_closed = true;
            }

            if tls_out && !self.to_peer.is_empty() {
                let n = self
                    .link
                    .write_chunk(&self.to_peer)
                    .context("writing to peer")?;
                self.to_peer.drain(..n);
            }
            if local_out && !self.to_local.is_empty() {
                self.write_local()?;
            }
        }
    }

    /// Pull everything the link has: one socket read, then keep going
    /// while decrypted bytes sit buffered inside the library (poll cannot
    /// see those).
    fn drain_link(&mut self) -> anyhow::Result<()> {
        loop {
            match self.link.read_chunk() {
                Ok(chunk) => {
                    trace!("link gave {} bytes", chunk.len());
                    self.inbound_raw.extend_from_slice(&chunk);
                }
                Err(TlsError::PeerClosed) => {
                    debug!("peer closed");
                    self.tls_closed = true;
                    return Ok(());
                }
                Err(TlsError::WouldBlock) => return Ok(()),
                Err(err) => return Err(err).context("reading from peer"),
            }
            if !self.link.pending() {
                return Ok(());
            }
        }
    }

    fn deliver_inbound(&mut self) -> anyhow::Result<()> {
        if self.inbound_raw.is_empty() {
            return Ok(());
        }
        match &mut self.role {
            Role::Server { decoder, sink } => decoder
                .decode(&mut self.inbound_raw, &mut self.to_local, &mut **sink)
                .context("decoding session stream")?,
            Role::Client { .. } => {
                // the server sends no commands; bytes pass through
                self.to_local.append(&mut self.inbound_raw);
            }
        }
        Ok(())
    }

    fn read_local(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; consts::BUF_SIZE];
        match nix::unistd::read(self.local.as_raw_fd(), &mut buf) {
            Ok(0) => {
                debug!("local eof");
                self.local_closed = true;
            }
            Ok(n) => match self.role {
                Role::Client { .. } => self.to_peer.extend_from_slice(&iac::encode(&buf[..n])),
                Role::Server { .. } => self.to_peer.extend_from_slice(&buf[..n]),
            },
            // EIO is how a pty master reports that the slave side is gone
            Err(Errno::EIO) => {
                debug!("local EIO, treating as hangup");
                self.local_closed = true;
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            Err(e) => return Err(e).context("reading local fd"),
        }
        Ok(())
    }

    fn write_local(&mut self) -> anyhow::Result<()> {
        match nix::unistd::write(self.local, &self.to_local) {
            Ok(n) => {
                self.to_local.drain(..n);
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            Err(Errno::EIO) | Err(Errno::EPIPE) => {
                debug!("local write failed, treating as hangup");
                self.local_closed = true;
            }
            Err(e) => return Err(e).context("writing local fd"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::{Read, Write},
        os::unix::net::UnixStream,
        sync::atomic::AtomicBool,
        thread,
    };

    use super::*;
    use crate::iac::window_size_frame;

    /// A cleartext stand-in for the TLS session so the pump can be
    /// exercised over socketpairs.
    struct PlainLink(UnixStream);

    impl AsFd for PlainLink {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.0.as_fd()
        }
    }

    impl Link for PlainLink {
        fn read_chunk(&mut self) -> Result<Vec<u8>, TlsError> {
            let mut buf = vec![0u8; consts::BUF_SIZE];
            let n = self.0.read(&mut buf)?;
            if n == 0 {
                return Err(TlsError::PeerClosed);
            }
            buf.truncate(n);
            Ok(buf)
        }

        fn pending(&mut self) -> bool {
            false
        }

        fn write_chunk(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
            Ok(self.0.write(buf)?)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        resizes: Vec<(u16, u16)>,
    }

    impl CommandSink for RecordingSink {
        fn set_window_size(&mut self, rows: u16, cols: u16) -> anyhow::Result<()> {
            self.resizes.push((rows, cols));
            Ok(())
        }
    }

    #[test]
    #[ntest::timeout(30000)]
    fn server_pump_decodes_and_shuttles() -> anyhow::Result<()> {
        let (net_near, mut net_far) = UnixStream::pair()?;
        let (pty_near, mut pty_far) = UnixStream::pair()?;

        let pump_thread = thread::spawn(move || -> anyhow::Result<Vec<(u16, u16)>> {
            let mut link = PlainLink(net_near);
            let mut sink = RecordingSink::default();
            let mut pump = Pump::server(&mut link, pty_near.as_fd(), &mut sink);
            pump.run()?;
            Ok(sink.resizes)
        });

        // client sends "AB", a resize, an escaped literal 0xff, then "CD"
        let mut wire = b"AB".to_vec();
        wire.extend_from_slice(&window_size_frame(40, 132));
        wire.extend_from_slice(&[0xff, 0xff]);
        wire.extend_from_slice(b"CD");
        net_far.write_all(&wire)?;

        let mut delivered = [0u8; 5];
        pty_far.read_exact(&mut delivered)?;
        assert_eq!(&delivered, &[b'A', b'B', 0xff, b'C', b'D']);

        // shell produces output, which travels back raw
        pty_far.write_all(b"hi\n")?;
        let mut echoed = [0u8; 3];
        net_far.read_exact(&mut echoed)?;
        assert_eq!(&echoed, b"hi\n");

        // shell exits: pump should finish once output has drained
        drop(pty_far);
        let resizes = pump_thread.join().expect("pump thread")?;
        assert_eq!(resizes, vec![(40, 132)]);
        Ok(())
    }

    #[test]
    #[ntest::timeout(30000)]
    fn server_pump_outlives_a_dropped_link() -> anyhow::Result<()> {
        let (net_near, net_far) = UnixStream::pair()?;
        let (pty_near, mut pty_far) = UnixStream::pair()?;

        let pump_thread = thread::spawn(move || {
            let mut link = PlainLink(net_near);
            let mut sink = RecordingSink::default();
            let mut pump = Pump::server(&mut link, pty_near.as_fd(), &mut sink);
            pump.run()
        });

        // the client vanishes while the shell is still running; the
        // session must keep going until the shell itself exits
        drop(net_far);
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(!pump_thread.is_finished());

        // late shell output with no link to carry it must not error
        pty_far.write_all(b"late output")?;
        drop(pty_far);
        pump_thread.join().expect("pump thread")?;
        Ok(())
    }

    #[test]
    #[ntest::timeout(30000)]
    fn server_pump_rejects_bad_commands() -> anyhow::Result<()> {
        let (net_near, mut net_far) = UnixStream::pair()?;
        let (pty_near, _pty_far) = UnixStream::pair()?;

        let pump_thread = thread::spawn(move || {
            let mut link = PlainLink(net_near);
            let mut sink = RecordingSink::default();
            let mut pump = Pump::server(&mut link, pty_near.as_fd(), &mut sink);
            pump.run()
        });

        net_far.write_all(&[0xff, 0x02])?;
        let err = pump_thread.join().expect("pump thread").expect_err("must fail");
        assert!(err.to_string().contains("decoding session stream"));
        Ok(())
    }

    #[test]
    #[ntest::timeout(30000)]
    fn client_pump_escapes_outbound_and_passes_inbound() -> anyhow::Result<()> {
        let (net_near, mut net_far) = UnixStream::pair()?;
        let (term_near, mut term_far) = UnixStream::pair()?;
        static WINCH: AtomicBool = AtomicBool::new(false);

        let pump_thread = thread::spawn(move || -> anyhow::Result<()> {
            let mut link = PlainLink(net_near);
            let mut pump = Pump::client(&mut link, term_near.as_fd(), &WINCH);
            pump.run()
        });

        // typing a literal 0xff gets escaped on the wire
        term_far.write_all(&[b'x', 0xff, b'y'])?;
        let mut wire = [0u8; 4];
        net_far.read_exact(&mut wire)?;
        assert_eq!(&wire, &[b'x', 0xff, 0xff, b'y']);

        // server output reaches the terminal unmodified
        net_far.write_all(b"out\xffput")?;
        let mut shown = [0u8; 7];
        term_far.read_exact(&mut shown)?;
        assert_eq!(&shown, b"out\xffput");

        // peer close terminates the client pump
        drop(net_far);
        pump_thread.join().expect("pump thread")?;
        Ok(())
    }

    #[test]
    fn window_size_frames_queue_behind_buffered_bytes() {
        let (net, _keep) = UnixStream::pair().expect("pair");
        let (term, _keep2) = UnixStream::pair().expect("pair");
        static WINCH: AtomicBool = AtomicBool::new(false);

        let mut link = PlainLink(net);
        let mut pump = Pump::client(&mut link, term.as_fd(), &WINCH);
        pump.to_peer.extend_from_slice(b"queued");
        pump.queue_window_size(24, 80);

        let mut want = b"queued".to_vec();
        want.extend_from_slice(&window_size_frame(24, 80));
        assert_eq!(pump.to_peer, want);
    }
}
