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

use std::{env, fs, path::Path};

use anyhow::{anyhow, bail, Context};
use tracing::warn;

use crate::{consts, tokenize::tokenize};

/// Which L3 protocol to use when resolving and connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Unspec,
    V4,
    V6,
}

/// Session configuration, assembled once per process from the config file
/// and command line, and read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub af: AddressFamily,
    pub port: u16,

    /// Colon-separated list of TLS cipher suite names. Empty means the
    /// provider default.
    pub cipher_list: String,

    /// Trust roots for verifying the peer. On the client these are the
    /// server CAs; on the server the client CAs.
    pub ca_file: Option<String>,
    pub ca_path: Option<String>,
    pub crl_file: Option<String>,

    /// Our own identity.
    pub cert_file: String,
    pub key_file: String,

    /// Server only: directory to chroot into after forking the shell.
    pub chroot: Option<String>,

    /// Server only: required right-hand side of the client cert CN.
    pub client_domain: Option<String>,

    /// Optional TCP-MD5 signature secret (RFC 2385).
    pub tcp_md5: Option<String>,

    /// Client only: host to connect to.
    pub host: Option<String>,

    /// Whether the session gets a PTY. Running a remote command turns
    /// this off.
    pub want_pty: bool,

    /// Client only: remote command to run instead of a login shell.
    pub command: Option<String>,

    /// Client only: skip the certificate pin database check.
    pub skip_certdb: bool,

    pub verbose: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            af: AddressFamily::Unspec,
            port: consts::DEFAULT_PORT,
            cipher_list: String::new(),
            ca_file: None,
            ca_path: None,
            crl_file: None,
            cert_file: String::from(consts::DEFAULT_CERTFILE),
            key_file: String::from(consts::DEFAULT_KEYFILE),
            chroot: None,
            client_domain: None,
            tcp_md5: None,
            host: None,
            want_pty: true,
            command: None,
            skip_certdb: false,
            verbose: 0,
        }
    }
}

impl Config {
    /// Client defaults: trust the server CA bundle, identity under
    /// ~/.tlssh/keys.
    pub fn client_default() -> Self {
        Config { ca_file: Some(String::from(consts::DEFAULT_SERVER_CAFILE)), ..Config::default() }
    }

    /// Server defaults: trust the client CA bundle, host identity under
    /// /etc/tlssh.
    pub fn server_default() -> Self {
        Config {
            ca_file: Some(String::from(consts::DEFAULT_CLIENT_CAFILE)),
            cert_file: String::from(consts::DEFAULT_SERVERD_CERTFILE),
            key_file: String::from(consts::DEFAULT_SERVERD_KEYFILE),
            ..Config::default()
        }
    }

    /// Layer a config file over `self`. A missing file is only an error
    /// when it was `explicit`ly requested on the command line.
    pub fn load_file(&mut self, path: &str, explicit: bool) -> anyhow::Result<()> {
        if !Path::new(path).exists() {
            if explicit {
                bail!("config file {} does not exist", path);
            }
            return Ok(());
        }
        let text = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        for (lineno, line) in text.lines().enumerate() {
            self.apply_line(line)
                .with_context(|| format!("{}:{}", path, lineno + 1))?;
        }
        Ok(())
    }

    fn apply_line(&mut self, line: &str) -> anyhow::Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        let mut toks = tokenize(line, 1);
        if toks.len() < 2 {
            bail!("keyword '{}' takes a value", line);
        }
        let value = toks.pop().unwrap_or_default();
        let keyword = toks.pop().unwrap_or_default();

        match keyword.as_str() {
            "Port" => {
                self.port = value.parse().with_context(|| format!("bad port '{value}'"))?;
            }
            "L3Protocol" => {
                // the value is the first (and only) parameter
                self.af = match value.as_str() {
                    "ipv4" => AddressFamily::V4,
                    "ipv6" => AddressFamily::V6,
                    "any" => AddressFamily::Unspec,
                    other => bail!("unknown L3Protocol '{other}'"),
                };
            }
            "CipherList" => self.cipher_list = value,
            "CertFile" => self.cert_file = value,
            "KeyFile" => self.key_file = value,
            "ServerCAFile" | "ClientCAFile" => self.ca_file = Some(value),
            "ServerCAPath" | "ClientCAPath" => self.ca_path = Some(value),
            "ServerCRL" | "ClientCRL" => self.crl_file = Some(value),
            "ClientDomain" => self.client_domain = Some(value),
            "Chroot" => self.chroot = Some(value),
            "TcpMd5Secret" => self.tcp_md5 = Some(value),
            other => {
                warn!("ignoring unknown config keyword '{}'", other);
            }
        }
        Ok(())
    }

    /// Expand leading tildes in the identity paths. Done once, after all
    /// option layers have been applied.
    pub fn expand_paths(&mut self) -> anyhow::Result<()> {
        let home = env::var("HOME").context("no HOME in environment")?;
        self.cert_file = expand_tilde(&self.cert_file, &home);
        self.key_file = expand_tilde(&self.key_file, &home);
        if let Some(f) = &self.ca_file {
            self.ca_file = Some(expand_tilde(f, &home));
        }
        if let Some(f) = &self.crl_file {
            self.crl_file = Some(expand_tilde(f, &home));
        }
        Ok(())
    }
}

/// Replace a leading `~/` (or bare `~`) with the given home directory.
pub fn expand_tilde(path: &str, home: &str) -> String {
    if path == "~" {
        String::from(home)
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{home}/{rest}")
    } else {
        String::from(path)
    }
}

/// Resolve the certdb path against the home directory.
pub fn certdb_path() -> anyhow::Result<String> {
    let home = env::var("HOME").context("no HOME in environment")?;
    Ok(expand_tilde(consts::CERTDB_PATH, &home))
}

pub fn resolve_af(v4: bool, v6: bool) -> anyhow::Result<AddressFamily> {
    match (v4, v6) {
        (true, true) => Err(anyhow!("-4 and -6 are mutually exclusive")),
        (true, false) => Ok(AddressFamily::V4),
        (false, true) => Ok(AddressFamily::V6),
        (false, false) => Ok(AddressFamily::Unspec),
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn parse(text: &str) -> Config {
        let mut config = Config::server_default();
        for line in text.lines() {
            config.apply_line(line).expect("applying line");
        }
        config
    }

    #[test]
    fn parses_basic_keywords() {
        let config = parse(
            r#"
            # a comment
            Port 443
            ClientDomain corp
            CipherList TLS13_AES_256_GCM_SHA384
            Chroot "/var/empty"
            "#,
        );
        assert_eq!(config.port, 443);
        assert_eq!(config.client_domain.as_deref(), Some("corp"));
        assert_eq!(config.cipher_list, "TLS13_AES_256_GCM_SHA384");
        assert_eq!(config.chroot.as_deref(), Some("/var/empty"));
    }

    #[test]
    fn l3protocol_reads_its_first_value() {
        assert_eq!(parse("L3Protocol ipv4").af, AddressFamily::V4);
        assert_eq!(parse("L3Protocol ipv6").af, AddressFamily::V6);
        assert_eq!(parse("L3Protocol any").af, AddressFamily::Unspec);
        let mut config = Config::default();
        assert!(config.apply_line("L3Protocol ethernet").is_err());
    }

    #[test]
    fn keyword_without_value_is_an_error() {
        let mut config = Config::default();
        assert!(config.apply_line("Port").is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let mut config = Config::default();
        assert!(config.load_file("/nonexistent/tlssh.conf", true).is_err());
        assert!(config.load_file("/nonexistent/tlssh.conf", false).is_ok());
    }

    #[test]
    fn load_file_layers_over_defaults() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "Port 2222")?;
        writeln!(file, "TcpMd5Secret hunter2")?;
        let mut config = Config::client_default();
        config.load_file(file.path().to_str().unwrap(), true)?;
        assert_eq!(config.port, 2222);
        assert_eq!(config.tcp_md5.as_deref(), Some("hunter2"));
        // untouched defaults survive
        assert_eq!(config.ca_file.as_deref(), Some(consts::DEFAULT_SERVER_CAFILE));
        Ok(())
    }

    #[test]
    fn tilde_expansion() {
        assert_eq!(expand_tilde("~/.tlssh/certdb", "/home/ed"), "/home/ed/.tlssh/certdb");
        assert_eq!(expand_tilde("~", "/home/ed"), "/home/ed");
        assert_eq!(expand_tilde("/etc/tlssh/x", "/home/ed"), "/etc/tlssh/x");
    }
}
