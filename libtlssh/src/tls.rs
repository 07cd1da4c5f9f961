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

//! The TLS session object: a connected TCP stream wrapped in a rustls
//! connection, with the small surface the rest of the crate needs —
//! handshake, peer-certificate inspection, a "decrypted bytes buffered?"
//! probe for the pump, and partial-write semantics.

use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    net::{Shutdown, TcpStream},
    os::fd::{AsFd, BorrowedFd},
    path::Path,
    sync::Arc,
};

use rustls::{
    crypto::CryptoProvider,
    pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName},
    server::WebPkiClientVerifier,
    client::WebPkiServerVerifier,
    ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection,
};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{config::Config, consts};

/// Errors surfaced by the session object. The pump's control flow keys off
/// these kinds, so they are typed rather than stringly anyhow chains.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Normal termination: the peer closed the connection. Not an error
    /// worth logging.
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("operation would block")]
    WouldBlock,
    #[error("TLS protocol violation: {0}")]
    Protocol(String),
    #[error("peer certificate is revoked")]
    CrlRevoked,
    #[error("peer certificate does not match the host name")]
    HostnameMismatch,
    #[error("TLS configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("TLS: {0}")]
    Other(String),
}

fn map_tls_err(err: rustls::Error) -> TlsError {
    use rustls::{CertificateError, Error};
    match err {
        Error::InvalidCertificate(CertificateError::Revoked) => TlsError::CrlRevoked,
        Error::InvalidCertificate(CertificateError::NotValidForName) => TlsError::HostnameMismatch,
        Error::InvalidCertificate(CertificateError::NotValidForNameContext { .. }) => {
            TlsError::HostnameMismatch
        }
        Error::AlertReceived(alert) => TlsError::Protocol(format!("peer sent alert: {alert:?}")),
        other => TlsError::Other(other.to_string()),
    }
}

fn map_io_err(err: io::Error) -> TlsError {
    match err.kind() {
        io::ErrorKind::WouldBlock => TlsError::WouldBlock,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => TlsError::PeerClosed,
        _ => TlsError::Io(err),
    }
}

/// An owned peer certificate with the accessors the session subsystem
/// needs. Returned by value; nothing shares ownership of it.
#[derive(Debug, Clone)]
pub struct Identity {
    der: Vec<u8>,
}

impl Identity {
    pub fn from_der(der: &[u8]) -> Self {
        Identity { der: der.to_vec() }
    }

    pub fn subject(&self) -> Result<String, TlsError> {
        let cert = self.parse()?;
        Ok(cert.subject().to_string())
    }

    /// The leftmost subject CN. Client identities encode
    /// `<user>.<domain>` here.
    pub fn common_name(&self) -> Result<String, TlsError> {
        let cert = self.parse()?;
        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(String::from)
            .ok_or_else(|| TlsError::Protocol(String::from("peer certificate has no CN")))
    }

    pub fn issuer_common_name(&self) -> Result<String, TlsError> {
        let cert = self.parse()?;
        cert.issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(String::from)
            .ok_or_else(|| TlsError::Protocol(String::from("issuer has no CN")))
    }

    /// SHA-256 over the DER encoding, rendered as colon-separated upper
    /// hex. Deterministic, so it can serve as the pin in the certdb.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.der);
        let mut out = String::with_capacity(digest.len() * 3);
        for (i, byte) in digest.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }

    fn parse(&self) -> Result<X509Certificate<'_>, TlsError> {
        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| TlsError::Protocol(format!("unparseable peer certificate: {e}")))?;
        Ok(cert)
    }
}

pub struct TlsSession {
    sock: TcpStream,
    conn: Connection,
}

impl TlsSession {
    /// Client-side construction: wrap `sock` and run the handshake,
    /// asserting `servername` against the peer certificate per rustls
    /// policy. Trust roots, CRLs, identity, and cipher list come from the
    /// config.
    pub fn connect(config: &Config, sock: TcpStream, servername: &str) -> Result<Self, TlsError> {
        let provider = Arc::new(provider_for(&config.cipher_list)?);
        let roots = Arc::new(root_store(config)?);
        let certs = load_certs(&config.cert_file)?;
        let key = load_private_key(&config.key_file)?;

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?;
        let client_config = match &config.crl_file {
            Some(crl_file) => {
                let verifier = WebPkiServerVerifier::builder_with_provider(roots, provider)
                    .with_crls(load_crls(crl_file)?)
                    .build()
                    .map_err(|e| TlsError::Config(e.to_string()))?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(verifier)
                    .with_client_auth_cert(certs, key)
            }
            None => builder.with_root_certificates(roots).with_client_auth_cert(certs, key),
        }
        .map_err(|e| TlsError::Config(e.to_string()))?;

        let name = ServerName::try_from(String::from(servername))
            .map_err(|_| TlsError::Config(format!("invalid server name '{servername}'")))?;
        let conn = ClientConnection::new(Arc::new(client_config), name)
            .map_err(map_tls_err)?;

        let mut sess = TlsSession { sock, conn: Connection::Client(conn) };
        sess.handshake()?;
        debug!("client handshake complete");
        Ok(sess)
    }

    /// Server-side construction: wrap an accepted socket and run the
    /// handshake. A client certificate chaining to the configured client
    /// CA is required; the handshake fails without one.
    pub fn accept(config: &Config, sock: TcpStream) -> Result<Self, TlsError> {
        let provider = Arc::new(provider_for(&config.cipher_list)?);
        let roots = Arc::new(root_store(config)?);
        let certs = load_certs(&config.cert_file)?;
        let key = load_private_key(&config.key_file)?;

        let mut verifier_builder =
            WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&provider));
        if let Some(crl_file) = &config.crl_file {
            verifier_builder = verifier_builder.with_crls(load_crls(crl_file)?);
        }
        let verifier =
            verifier_builder.build().map_err(|e| TlsError::Config(e.to_string()))?;

        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let conn = ServerConnection::new(Arc::new(server_config)).map_err(map_tls_err)?;

        let mut sess = TlsSession { sock, conn: Connection::Server(conn) };
        sess.handshake()?;
        debug!("server handshake complete");
        Ok(sess)
    }

    fn handshake(&mut self) -> Result<(), TlsError> {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                self.conn.write_tls(&mut self.sock).map_err(map_io_err)?;
                continue;
            }
            let n = self.conn.read_tls(&mut self.sock).map_err(map_io_err)?;
            if n == 0 {
                return Err(TlsError::PeerClosed);
            }
            if let Err(err) = self.conn.process_new_packets() {
                // flush the alert describing why we are hanging up
                let _ = self.flush_tls();
                return Err(map_tls_err(err));
            }
        }
        self.flush_tls()?;
        Ok(())
    }

    fn flush_tls(&mut self) -> Result<(), TlsError> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.sock).map_err(map_io_err)?;
        }
        Ok(())
    }

    /// True iff decrypted bytes are already buffered inside the TLS
    /// library, i.e. a further [`TlsSession::read`] will yield data with
    /// no socket read. The pump drains while this holds, otherwise poll
    /// would park on the socket with plaintext still queued.
    pub fn pending(&mut self) -> bool {
        self.conn
            .process_new_packets()
            .map(|state| state.plaintext_bytes_to_read() > 0)
            .unwrap_or(false)
    }

    /// Read up to `max` (default a buffer's worth) decrypted bytes. An
    /// empty result means a TLS record arrived that decoded to no
    /// plaintext yet; [`TlsError::PeerClosed`] is the normal end of the
    /// stream.
    pub fn read(&mut self, max: Option<usize>) -> Result<Vec<u8>, TlsError> {
        if !self.pending() {
            let n = self.conn.read_tls(&mut self.sock).map_err(map_io_err)?;
            if n == 0 {
                return Err(TlsError::PeerClosed);
            }
            let state = match self.conn.process_new_packets() {
                Ok(state) => state,
                Err(err) => {
                    let _ = self.flush_tls();
                    return Err(map_tls_err(err));
                }
            };
            if state.peer_has_closed() && state.plaintext_bytes_to_read() == 0 {
                return Err(TlsError::PeerClosed);
            }
        }

        let want = max.unwrap_or(consts::BUF_SIZE).clamp(1, consts::BUF_SIZE);
        let mut buf = vec![0u8; want];
        match self.conn.reader().read(&mut buf) {
            Ok(0) => Err(TlsError::PeerClosed),
            Ok(n) => {
                trace!("read {} plaintext bytes", n);
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(map_io_err(e)),
        }
    }

    /// Write as much of `buf` as one pass accepts and report how much was
    /// taken. Callers keep the unwritten suffix queued.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        let chunk = &buf[..buf.len().min(consts::BUF_SIZE)];
        let n = self.conn.writer().write(chunk).map_err(map_io_err)?;
        self.flush_tls()?;
        Ok(n)
    }

    /// Loop until all of `buf` is written. Used for short control
    /// messages where partial progress is not interesting.
    pub fn full_write(&mut self, buf: &[u8]) -> Result<(), TlsError> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = self.write(rest)?;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// The peer's end-entity certificate, if it presented one.
    pub fn peer_cert(&self) -> Option<Identity> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|der| Identity::from_der(der.as_ref()))
    }

    /// Orderly TLS shutdown, then socket close.
    pub fn close(mut self) {
        self.conn.send_close_notify();
        let _ = self.flush_tls();
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

impl AsFd for TlsSession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

/// Blocking byte-stream view of the session, used for the preamble
/// exchange. EOF stands in for a peer close.
impl Read for TlsSession {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            match TlsSession::read(self, Some(out.len())) {
                Ok(buf) if buf.is_empty() => continue,
                Ok(buf) => {
                    out[..buf.len()].copy_from_slice(&buf);
                    return Ok(buf.len());
                }
                Err(TlsError::PeerClosed) => return Ok(0),
                Err(TlsError::Io(e)) => return Err(e),
                Err(e) => return Err(io::Error::other(e.to_string())),
            }
        }
    }
}

impl Write for TlsSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match TlsSession::write(self, buf) {
            Ok(n) => Ok(n),
            Err(TlsError::Io(e)) => Err(e),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Build a crypto provider restricted to the configured cipher list.
/// Empty (or the historical `HIGH` default) keeps the provider default.
fn provider_for(cipher_list: &str) -> Result<CryptoProvider, TlsError> {
    let mut provider = rustls::crypto::ring::default_provider();
    if cipher_list.is_empty() || cipher_list == "HIGH" {
        return Ok(provider);
    }

    let wanted: Vec<&str> = cipher_list.split(':').filter(|s| !s.is_empty()).collect();
    for name in &wanted {
        if !provider.cipher_suites.iter().any(|s| format!("{:?}", s.suite()) == *name) {
            return Err(TlsError::Config(format!("unknown cipher suite '{name}'")));
        }
    }
    provider.cipher_suites.retain(|s| wanted.contains(&format!("{:?}", s.suite()).as_str()));
    Ok(provider)
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Config(format!("{path}: {e}")))?;
    if certs.is_empty() {
        return Err(TlsError::Config(format!("{path}: no certificates found")));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Config(format!("{path}: {e}")))?
        .ok_or_else(|| TlsError::Config(format!("{path}: no private key found")))
}

fn load_crls(path: &str) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::crls(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Config(format!("{path}: {e}")))
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    Ok(BufReader::new(
        File::open(path).map_err(|e| TlsError::Config(format!("{path}: {e}")))?,
    ))
}

/// Assemble the trust roots from the configured CA file and/or CA
/// directory.
fn root_store(config: &Config) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    let mut loaded = 0usize;

    if let Some(ca_file) = &config.ca_file {
        for cert in load_certs(ca_file)? {
            roots.add(cert).map_err(|e| TlsError::Config(format!("{ca_file}: {e}")))?;
            loaded += 1;
        }
    }
    if let Some(ca_path) = &config.ca_path {
        let entries = std::fs::read_dir(Path::new(ca_path))
            .map_err(|e| TlsError::Config(format!("{ca_path}: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| TlsError::Config(format!("{ca_path}: {e}")))?;
            if !entry.path().is_file() {
                continue;
            }
            let path = entry.path();
            let path = path.to_string_lossy();
            for cert in load_certs(&path)? {
                roots.add(cert).map_err(|e| TlsError::Config(format!("{path}: {e}")))?;
                loaded += 1;
            }
        }
    }

    if loaded == 0 {
        return Err(TlsError::Config(String::from("no trust roots configured")));
    }
    Ok(roots)
}

#[cfg(test)]
mod test {
    use std::{net::TcpListener, thread};

    use super::*;
    use crate::testutil;

    #[test]
    #[ntest::timeout(30000)]
    fn mutual_tls_loopback() -> anyhow::Result<()> {
        let fixture = testutil::TlsFixture::new("alice.corp")?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;

        let server_config = fixture.server_config.clone();
        let server = thread::spawn(move || -> anyhow::Result<(String, Vec<u8>)> {
            let (sock, _) = listener.accept()?;
            let mut sess = TlsSession::accept(&server_config, sock)?;

            let client_cn = sess
                .peer_cert()
                .ok_or_else(|| anyhow::anyhow!("no client cert"))?
                .common_name()?;

            let mut got = Vec::new();
            while got.len() < 4 {
                got.extend(sess.read(None)?);
            }
            sess.full_write(b"pong")?;
            sess.close();
            Ok((client_cn, got))
        });

        let sock = TcpStream::connect(addr)?;
        let mut sess = TlsSession::connect(&fixture.client_config, sock, "localhost")?;

        let server_cert = sess.peer_cert().expect("server cert");
        assert_eq!(server_cert.fingerprint(), fixture.server_fingerprint());
        assert_eq!(server_cert.issuer_common_name()?, testutil::TEST_CA_CN);

        sess.full_write(b"ping")?;
        let mut got = Vec::new();
        loop {
            match sess.read(None) {
                Ok(buf) => got.extend(buf),
                Err(TlsError::PeerClosed) => break,
                Err(e) => return Err(e.into()),
            }
        }
        assert_eq!(got, b"pong");

        let (client_cn, server_got) = server.join().expect("server thread")?;
        assert_eq!(client_cn, "alice.corp");
        assert_eq!(server_got, b"ping");
        Ok(())
    }

    #[test]
    #[ntest::timeout(30000)]
    fn servername_mismatch_is_hostname_error() -> anyhow::Result<()> {
        let fixture = testutil::TlsFixture::new("alice.corp")?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let server_config = fixture.server_config.clone();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().expect("accept");
            // expected to fail; we only need to drive the handshake
            let _ = TlsSession::accept(&server_config, sock);
        });

        let sock = TcpStream::connect(addr)?;
        match TlsSession::connect(&fixture.client_config, sock, "wrong.example") {
            Err(TlsError::HostnameMismatch) => {}
            Err(other) => panic!("expected HostnameMismatch, got {other}"),
            Ok(_) => panic!("handshake unexpectedly succeeded"),
        }
        server.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn fingerprint_is_stable_colon_hex() {
        let identity = Identity::from_der(b"not really der");
        let fp = identity.fingerprint();
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() || c == ':'));
        assert_eq!(fp, Identity::from_der(b"not really der").fingerprint());
        assert_ne!(fp, Identity::from_der(b"something else").fingerprint());
    }

    #[test]
    fn unknown_cipher_suite_is_a_config_error() {
        match provider_for("TLS13_NO_SUCH_SUITE") {
            Err(TlsError::Config(msg)) => assert!(msg.contains("TLS13_NO_SUCH_SUITE")),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn cipher_list_filters_the_provider() -> anyhow::Result<()> {
        let provider = provider_for("TLS13_AES_256_GCM_SHA384")
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(provider.cipher_suites.len(), 1);
        assert_eq!(
            format!("{:?}", provider.cipher_suites[0].suite()),
            "TLS13_AES_256_GCM_SHA384"
        );
        Ok(())
    }
}
