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

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use anyhow::{anyhow, Context};
use nix::sys::socket::{setsockopt, sockopt};
use tracing::debug;

use crate::config::{AddressFamily, Config};

/// Resolve `host` and connect in the configured address family, trying
/// each candidate address in resolver order.
pub fn connect(host: &str, port: u16, af: AddressFamily) -> anyhow::Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}:{port}"))?;

    let mut last_err = None;
    for addr in addrs {
        let wanted = match af {
            AddressFamily::Unspec => true,
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        };
        if !wanted {
            continue;
        }
        debug!("connecting to {}", addr);
        match TcpStream::connect(addr) {
            Ok(sock) => return Ok(sock),
            Err(err) => last_err = Some(err),
        }
    }

    match last_err {
        Some(err) => Err(err).with_context(|| format!("connecting to {host}:{port}")),
        None => Err(anyhow!("{host} has no address in the requested family")),
    }
}

/// Socket options shared by both ends: no Nagle delay for interactive
/// traffic, keepalives to notice dead peers, and optionally TCP-MD5
/// signatures.
pub fn apply_socket_options(sock: &TcpStream, config: &Config) -> anyhow::Result<()> {
    sock.set_nodelay(true).context("setting TCP_NODELAY")?;
    setsockopt(sock, sockopt::KeepAlive, &true).context("setting SO_KEEPALIVE")?;
    if let Some(secret) = &config.tcp_md5 {
        set_tcp_md5(sock, secret).context("setting TCP_MD5SIG")?;
    }
    Ok(())
}

// Not exposed by the `libc` crate; mirrors the kernel's uapi/linux/tcp.h.
#[cfg(target_os = "linux")]
#[repr(C)]
struct TcpMd5Sig {
    tcpm_addr: libc::sockaddr_storage,
    tcpm_flags: u8,
    tcpm_prefixlen: u8,
    tcpm_keylen: u16,
    __tcpm_pad: libc::c_int,
    tcpm_key: [u8; 80],
}

#[cfg(target_os = "linux")]
fn set_tcp_md5(sock: &TcpStream, secret: &str) -> anyhow::Result<()> {
    use std::os::fd::AsRawFd;

    const TCP_MD5SIG_MAXKEYLEN: usize = 80;

    if secret.len() > TCP_MD5SIG_MAXKEYLEN {
        return Err(anyhow!("TCP-MD5 secret longer than {} bytes", TCP_MD5SIG_MAXKEYLEN));
    }

    let peer = sock.peer_addr().context("getting peer address")?;

    // Safety: TcpMd5Sig is plain-old-data; all-zeroes is a valid value.
    let mut md5: TcpMd5Sig = unsafe { std::mem::zeroed() };
    write_sockaddr(&peer, &mut md5.tcpm_addr);
    md5.tcpm_keylen = secret.len() as u16;
    md5.tcpm_key[..secret.len()].copy_from_slice(secret.as_bytes());

    // Safety: md5 is live and correctly sized for the whole call.
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_MD5SIG,
            &md5 as *const TcpMd5Sig as *const libc::c_void,
            std::mem::size_of::<TcpMd5Sig>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("setsockopt(TCP_MD5SIG)");
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_md5(_sock: &TcpStream, _secret: &str) -> anyhow::Result<()> {
    Err(anyhow!("TCP-MD5 signatures are not supported on this platform"))
}

#[cfg(target_os = "linux")]
fn write_sockaddr(addr: &SocketAddr, storage: &mut libc::sockaddr_storage) {
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: a.ip().octets() },
                sin6_scope_id: a.scope_id(),
            };
            // Safety: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn connect_honors_the_address_family() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();

        let sock = connect("127.0.0.1", port, AddressFamily::V4)?;
        assert!(sock.peer_addr()?.is_ipv4());

        // a v4 literal has no v6 address to offer
        assert!(connect("127.0.0.1", port, AddressFamily::V6).is_err());
        Ok(())
    }
}
