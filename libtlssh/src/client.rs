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
    env,
    os::fd::BorrowedFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{debug, info};

use crate::{
    certdb::{CertDb, Check},
    config,
    config::Config,
    consts, net, preamble,
    pump::Pump,
    tls::TlsSession,
    tty,
};

/// The command line arguments that tlssh expects.
#[derive(Parser, Debug)]
#[clap(name = "tlssh", author, version, about = "Remote shell over mutually-authenticated TLS")]
pub struct Args {
    #[clap(short = '4', long = "ipv4", action, help = "Connect over IPv4 only")]
    pub ipv4: bool,

    #[clap(short = '6', long = "ipv6", action, help = "Connect over IPv6 only")]
    pub ipv6: bool,

    #[clap(short, long, help = "a config file to read instead of /etc/tlssh/tlssh.conf")]
    pub config_file: Option<String>,

    #[clap(short = 'C', long, help = "Colon-separated TLS cipher suite list")]
    pub cipher_list: Option<String>,

    #[clap(
        short = 'p',
        long,
        help = "PEM file holding both the client certificate and its key"
    )]
    pub identity: Option<String>,

    #[clap(short = 's', long, action, help = "Skip the certificate pin database (TOFU) check")]
    pub skip_certdb: bool,

    #[clap(long, help = "The file to write logs to (discarded by default)")]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(help = "The host to connect to")]
    pub host: String,

    #[clap(
        trailing_var_arg = true,
        help = "A command to run instead of a login shell (implies no PTY)"
    )]
    pub command: Vec<String>,
}

/// Layer the command line over the config-file options.
fn assemble_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = Config::client_default();
    config.load_file(
        args.config_file.as_deref().unwrap_or(consts::DEFAULT_CLIENT_CONFIG),
        args.config_file.is_some(),
    )?;

    if args.ipv4 || args.ipv6 {
        config.af = config::resolve_af(args.ipv4, args.ipv6)?;
    }
    if let Some(cipher_list) = &args.cipher_list {
        config.cipher_list = cipher_list.clone();
    }
    if let Some(identity) = &args.identity {
        // one file carrying both halves of the identity
        config.cert_file = identity.clone();
        config.key_file = identity.clone();
    }
    config.skip_certdb = args.skip_certdb;
    config.verbose = args.verbose;
    config.host = Some(args.host.clone());
    if !args.command.is_empty() {
        config.command = Some(shell_words::join(&args.command));
        config.want_pty = false;
    }
    config.expand_paths()?;
    Ok(config)
}

pub fn run(args: Args) -> anyhow::Result<()> {
    let config = assemble_config(&args)?;

    // SIGWINCH does nothing but set this flag; the pump notices it at
    // the top of its loop (poll wakes with EINTR).
    let winch = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGWINCH, Arc::clone(&winch))
        .context("registering SIGWINCH")?;

    let sock = net::connect(&args.host, config.port, config.af)?;
    net::apply_socket_options(&sock, &config)?;

    let mut sess = TlsSession::connect(&config, sock, &args.host)
        .map_err(|e| anyhow!("TLS connect to {}: {}", args.host, e))?;

    if !config.skip_certdb {
        check_tofu(&mut sess, &args.host)?;
    }

    // Raw mode from here on; the guard restores the terminal on every
    // exit path, including unwinds.
    let raw_guard = if config.want_pty { Some(tty::set_raw_mode()?) } else { None };

    let session_result = (|| -> anyhow::Result<()> {
        let term = env::var("TERM").unwrap_or_else(|_| String::from("vt100"));
        preamble::send(&mut sess, &term, config.want_pty)?;

        if let Some(command) = &config.command {
            // the no-PTY shell reads the command off its stdin
            sess.full_write(format!("{command}\n").as_bytes())
                .context("sending command")?;
        }

        // announce the starting window size through the same channel
        // later resizes will use
        if config.want_pty {
            winch.store(true, Ordering::Relaxed);
        }

        // Safety: stdin is live for the whole program duration
        let terminal = unsafe { BorrowedFd::borrow_raw(consts::STDIN_FD) };
        let mut pump = Pump::client(&mut sess, terminal, &winch);
        pump.run()
    })();

    drop(raw_guard);
    sess.close();
    if session_result.is_ok() {
        info!("session closed by server");
    }
    session_result
}

fn check_tofu(sess: &mut TlsSession, host: &str) -> anyhow::Result<()> {
    let cert = sess
        .peer_cert()
        .ok_or_else(|| anyhow!("server presented no certificate"))?;
    let fingerprint = cert.fingerprint();
    debug!("server fingerprint {}", fingerprint);

    let db = CertDb::new(config::certdb_path()?);
    match db.check(host, &fingerprint)? {
        Check::Match => Ok(()),
        Check::NoMatch => {
            let issuer = cert
                .issuer_common_name()
                .unwrap_or_else(|_| String::from("<unknown issuer>"));
            db.prompt_and_insert(host, &fingerprint, &issuer)
        }
    }
}
