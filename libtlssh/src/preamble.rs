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

//! The session preamble: a few ASCII lines exchanged right after the TLS
//! handshake, terminated by an empty line. The preamble shares the TLS
//! stream with the raw session bytes that follow, so the server-side
//! forwarder reads one byte at a time and stops exactly at the boundary;
//! everything after it belongs to the pump.

use std::io::{Read, Write};

use anyhow::{bail, Context};

use crate::consts;

/// Client side: write the preamble lines.
pub fn send<W: Write>(w: &mut W, term: &str, want_pty: bool) -> anyhow::Result<()> {
    let mut lines = format!("version {}\nenv TERM {}\n", consts::PROTO_VERSION, term);
    if !want_pty {
        lines.push_str("terminal off\n");
    }
    lines.push('\n');
    w.write_all(lines.as_bytes()).context("writing preamble")?;
    w.flush().context("flushing preamble")?;
    Ok(())
}

/// Server side: copy preamble bytes from the TLS stream into the control
/// pipe, stopping after the second consecutive `\n` and not one byte
/// later. Errors out past [`consts::PREAMBLE_MAX`] bytes.
pub fn forward<R: Read, W: Write>(r: &mut R, w: &mut W) -> anyhow::Result<()> {
    let mut byte = [0u8; 1];
    let mut newlines = 0u32;
    let mut forwarded = 0usize;

    loop {
        r.read_exact(&mut byte).context("reading preamble byte")?;
        if byte[0] == b'\n' {
            newlines += 1;
        } else {
            newlines = 0;
        }
        w.write_all(&byte).context("forwarding preamble byte")?;
        forwarded += 1;

        if newlines == 2 {
            w.flush().context("flushing preamble")?;
            return Ok(());
        }
        if forwarded >= consts::PREAMBLE_MAX {
            bail!("preamble exceeded {} bytes", consts::PREAMBLE_MAX);
        }
    }
}

/// The parsed preamble, as seen by the shell process on the far end of
/// the control pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub term: Option<String>,
    pub want_pty: bool,
}

/// Parse the preamble from a reader (the shell child's end of the control
/// pipe). Deviating lines are fatal.
pub fn parse<R: Read>(r: &mut R) -> anyhow::Result<Preamble> {
    let mut raw = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte).context("reading preamble")? {
            0 => break, // pipe closed right at the boundary
            _ => raw.push(byte[0]),
        }
        if raw.len() >= consts::PREAMBLE_MAX {
            bail!("preamble exceeded {} bytes", consts::PREAMBLE_MAX);
        }
        if raw.ends_with(b"\n\n") {
            break;
        }
    }

    let text = std::str::from_utf8(&raw).context("preamble is not ASCII")?;
    let mut version_seen = false;
    let mut preamble = Preamble { term: None, want_pty: true };

    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if let Some(version) = line.strip_prefix("version ") {
            if version != consts::PROTO_VERSION {
                bail!("unsupported protocol version '{}'", version);
            }
            version_seen = true;
        } else if let Some(env) = line.strip_prefix("env ") {
            match env.split_once(' ') {
                Some(("TERM", value)) => preamble.term = Some(String::from(value)),
                _ => bail!("unsupported env line '{}'", line),
            }
        } else if line == "terminal off" {
            preamble.want_pty = false;
        } else {
            bail!("unexpected preamble line '{}'", line);
        }
    }

    if !version_seen {
        bail!("preamble is missing the version line");
    }
    Ok(preamble)
}
