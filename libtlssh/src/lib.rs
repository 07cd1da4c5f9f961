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

use std::{fs, io, io::Write, sync::Mutex};

use anyhow::Context;
use tracing_subscriber::prelude::*;

pub mod certdb;
pub mod client;
pub mod config;
pub mod consts;
pub mod daemon;
pub mod iac;
pub mod net;
pub mod preamble;
pub mod pty;
pub mod pump;
pub mod tls;
pub mod tokenize;
pub mod tty;

#[cfg(test)]
mod testutil;

/// Where log lines go. The client's stderr shares the raw-mode terminal,
/// so without an explicit log file it gets no logs at all.
enum LogSink {
    File(Mutex<fs::File>),
    Stderr,
    Discard,
}

/// Writes one log line at a time through the sink's mutex, so concurrent
/// lines never interleave mid-record.
struct SharedFile<'a>(&'a Mutex<fs::File>);

impl io::Write for SharedFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut file) => file.write(buf),
            // a panicked logger is not worth more panicking
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut file) => file.flush(),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogSink {
    type Writer = Box<dyn io::Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            LogSink::File(file) => Box::new(SharedFile(file)),
            LogSink::Stderr => Box::new(io::stderr()),
            LogSink::Discard => Box::new(io::sink()),
        }
    }
}

/// Set up tracing. Verbosity maps repeated `-v` flags to levels; the
/// daemon logs to stderr by default while the client discards logs
/// unless given a log file.
pub fn init_logging(verbose: u8, log_file: Option<&str>, is_daemon: bool) -> anyhow::Result<()> {
    let level = match verbose {
        0 => tracing_subscriber::filter::LevelFilter::INFO,
        1 => tracing_subscriber::filter::LevelFilter::DEBUG,
        _ => tracing_subscriber::filter::LevelFilter::TRACE,
    };

    let sink = match (log_file, is_daemon) {
        (Some(path), _) => LogSink::File(Mutex::new(
            fs::File::create(path).context("unable to create log file")?,
        )),
        (None, true) => LogSink::Stderr,
        (None, false) => LogSink::Discard,
    };

    tracing_subscriber::registry::Registry::default()
        .with(level)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(sink),
        )
        .init();

    Ok(())
}
