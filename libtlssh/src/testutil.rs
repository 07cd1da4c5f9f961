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

//! Test fixtures: a throwaway CA with one server and one client identity,
//! written out as PEM files so the real config/loading paths get
//! exercised.

use std::fs;

use anyhow::Context;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

use crate::{config::Config, tls::Identity};

pub const TEST_CA_CN: &str = "tlssh test CA";

pub struct TlsFixture {
    // deleted with the fixture
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    pub client_config: Config,
    pub server_config: Config,
    server_der: Vec<u8>,
}

impl TlsFixture {
    /// Mint a CA, a server cert for `localhost`, and a client cert whose
    /// CN is `client_cn`, and build matching session configs.
    pub fn new(client_cn: &str) -> anyhow::Result<TlsFixture> {
        let dir = tempfile::tempdir().context("creating fixture dir")?;

        let ca_key = KeyPair::generate().context("generating CA key")?;
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).context("CA params")?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, TEST_CA_CN);
        let ca_cert = ca_params.self_signed(&ca_key).context("self-signing CA")?;

        let server_key = KeyPair::generate().context("generating server key")?;
        let mut server_params = CertificateParams::new(vec![String::from("localhost")])
            .context("server params")?;
        server_params.distinguished_name.push(DnType::CommonName, "tlsshd test server");
        let server_cert =
            server_params.signed_by(&server_key, &ca_cert, &ca_key).context("signing server")?;

        let client_key = KeyPair::generate().context("generating client key")?;
        let mut client_params =
            CertificateParams::new(Vec::<String>::new()).context("client params")?;
        client_params.distinguished_name.push(DnType::CommonName, client_cn);
        let client_cert =
            client_params.signed_by(&client_key, &ca_cert, &ca_key).context("signing client")?;

        let path = |name: &str| dir.path().join(name).to_string_lossy().into_owned();
        fs::write(path("ca.crt"), ca_cert.pem())?;
        fs::write(path("server.crt"), server_cert.pem())?;
        fs::write(path("server.key"), server_key.serialize_pem())?;
        fs::write(path("client.crt"), client_cert.pem())?;
        fs::write(path("client.key"), client_key.serialize_pem())?;

        let client_config = Config {
            ca_file: Some(path("ca.crt")),
            cert_file: path("client.crt"),
            key_file: path("client.key"),
            ..Config::default()
        };
        let server_config = Config {
            ca_file: Some(path("ca.crt")),
            cert_file: path("server.crt"),
            key_file: path("server.key"),
            client_domain: Some(String::from("corp")),
            ..Config::default()
        };

        let server_der = server_cert.der().as_ref().to_vec();
        Ok(TlsFixture { dir, client_config, server_config, server_der })
    }

    pub fn server_fingerprint(&self) -> String {
        Identity::from_der(&self.server_der).fingerprint()
    }
}
