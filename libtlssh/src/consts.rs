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

use std::time;

/// The protocol version line the client announces in its preamble.
pub const PROTO_VERSION: &str = "tlssh.1";

pub const BUF_SIZE: usize = 1024 * 16;

/// Hard cap on the preamble; anything longer is a protocol violation.
pub const PREAMBLE_MAX: usize = 4096;

/// How long the server side of the pump parks in poll before re-checking
/// its termination conditions. The client blocks indefinitely instead.
pub const SERVER_POLL_TIMEOUT: time::Duration = time::Duration::from_secs(1);

pub const DEFAULT_PORT: u16 = 12345;

pub const DEFAULT_CLIENT_CONFIG: &str = "/etc/tlssh/tlssh.conf";
pub const DEFAULT_SERVER_CONFIG: &str = "/etc/tlssh/tlsshd.conf";

pub const DEFAULT_CERTFILE: &str = "~/.tlssh/keys/default.crt";
pub const DEFAULT_KEYFILE: &str = "~/.tlssh/keys/default.key";
pub const DEFAULT_SERVER_CAFILE: &str = "/etc/tlssh/ServerCA.crt";

pub const DEFAULT_SERVERD_CERTFILE: &str = "/etc/tlssh/tlsshd.crt";
pub const DEFAULT_SERVERD_KEYFILE: &str = "/etc/tlssh/tlsshd.key";
pub const DEFAULT_CLIENT_CAFILE: &str = "/etc/tlssh/ClientCA.crt";

/// Certificate pin database, relative to the user's home directory.
pub const CERTDB_PATH: &str = "~/.tlssh/certdb";

pub const WTMP_FILE: &str = "/var/log/wtmp";

pub const STDIN_FD: i32 = 0;
pub const STDERR_FD: i32 = 2;
