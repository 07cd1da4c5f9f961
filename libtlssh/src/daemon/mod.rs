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
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener},
    os::fd::AsRawFd,
};

use anyhow::Context;
use clap::Parser;
use nix::{
    sys::signal::{signal, SigHandler, Signal},
    unistd,
    unistd::ForkResult,
};
use tracing::{debug, error, info};

use crate::{
    config::{AddressFamily, Config},
    consts,
};

pub mod records;
pub mod session;
pub mod user;

/// The command line arguments that tlsshd expects.
#[derive(Parser, Debug)]
#[clap(name = "tlsshd", author, version, about = "tlssh session server")]
pub struct Args {
    #[clap(short = '4', long = "ipv4", action, help = "Listen on IPv4 only")]
    pub ipv4: bool,

    #[clap(short = '6', long = "ipv6", action, help = "Listen on IPv6 only")]
    pub ipv6: bool,

    #[clap(short, long, help = "a config file to read instead of /etc/tlssh/tlsshd.conf")]
    pub config_file: Option<String>,

    #[clap(short, long, help = "Listen port, overriding the config file")]
    pub port: Option<u16>,

    #[clap(long, help = "The file to write logs to, instead of stderr")]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,
}

/// The listener: accept, fork, and let the child run the session
/// lifecycle. One process per connection; a crashed session takes down
/// nobody else.
pub fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::server_default();
    config.load_file(
        args.config_file.as_deref().unwrap_or(consts::DEFAULT_SERVER_CONFIG),
        args.config_file.is_some(),
    )?;
    if args.ipv4 || args.ipv6 {
        config.af = crate::config::resolve_af(args.ipv4, args.ipv6)?;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.verbose = args.verbose;

    // session processes exit on their own; don't collect zombies
    // Safety: SigIgn installs no handler code.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }.context("ignoring SIGCHLD")?;

    let bind_addr: SocketAddr = match config.af {
        AddressFamily::V4 => (Ipv4Addr::UNSPECIFIED, config.port).into(),
        AddressFamily::V6 | AddressFamily::Unspec => (Ipv6Addr::UNSPECIFIED, config.port).into(),
    };
    let listener = TcpListener::bind(bind_addr)
        .with_context(|| format!("binding to {bind_addr}"))?;
    info!("listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(err) => {
                error!("accepting connection: {:?}", err);
                continue;
            }
        };
        let peer = peer.to_string();
        info!("connection from {}", peer);

        // Safety: the child immediately takes over with its own control
        //         flow and exits; no locks are held across the fork.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                let _ = unistd::close(listener.as_raw_fd());
                let code = match session::run(&config, stream, peer) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!("session: {:?}", err);
                        1
                    }
                };
                std::process::exit(code);
            }
            Ok(ForkResult::Parent { child }) => {
                debug!("session process {} for {}", child, peer);
                drop(stream);
            }
            Err(err) => {
                error!("fork: {}", err);
            }
        }
    }
}
