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

//! Trust-on-first-use certificate pinning.
//!
//! `~/.tlssh/certdb` maps hosts to certificate fingerprints, one record
//! per line: `<host> <fingerprint> [ca-chain…]`. A server the user has
//! never seen is accepted only after an interactive yes, and the pin is
//! appended so later connections match silently.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::tokenize::tokenize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// The host is pinned to this fingerprint.
    Match,
    /// No line pins this (host, fingerprint) pair.
    NoMatch,
}

/// The user declined to pin an unknown server certificate.
#[derive(Debug, thiserror::Error)]
#[error("Unacceptable server certificate")]
pub struct TrustRejected;

pub struct CertDb {
    path: PathBuf,
}

impl CertDb {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        CertDb { path: path.as_ref().to_path_buf() }
    }

    /// Scan the pin database for `(host, fingerprint)`. The first line
    /// matching both wins. A line matching the host with a different
    /// fingerprint does not stop the scan, so a re-pinned host keeps
    /// working off its newer line; the flip side is that a stale pin is
    /// never reported as a conflict.
    pub fn check(&self, host: &str, fingerprint: &str) -> anyhow::Result<Check> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no certdb at {:?}", self.path);
                return Ok(Check::NoMatch);
            }
            Err(e) => return Err(e).with_context(|| format!("opening {:?}", self.path)),
        };

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading {:?}", self.path))?;
            let tokens = tokenize(&line, 0);
            if tokens.is_empty() {
                continue;
            }
            if tokens.len() < 2 {
                warn!("{:?}:{}: short certdb line, skipping", self.path, lineno + 1);
                continue;
            }

            if tokens[0] != host {
                continue;
            }
            if tokens[1] == fingerprint {
                return Ok(Check::Match);
            }
            debug!("certdb line {} pins {} to a different fingerprint", lineno + 1, host);
        }

        Ok(Check::NoMatch)
    }

    /// Ask the user whether to trust an unseen server certificate and, on
    /// a yes, append the pin. Anything other than yes is a fatal
    /// [`TrustRejected`].
    pub fn prompt_and_insert(
        &self,
        host: &str,
        fingerprint: &str,
        issuer_cn: &str,
    ) -> anyhow::Result<()> {
        let stdin = io::stdin();
        self.prompt_and_insert_io(host, fingerprint, issuer_cn, stdin.lock(), io::stderr())
    }

    fn prompt_and_insert_io<R, W>(
        &self,
        host: &str,
        fingerprint: &str,
        issuer_cn: &str,
        mut input: R,
        mut output: W,
    ) -> anyhow::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        writeln!(output, "Server certificate for {host} is not in the certdb.")?;
        writeln!(output, "  fingerprint: {fingerprint}")?;
        writeln!(output, "  issuer:      {issuer_cn}")?;
        write!(output, "Accept and remember this certificate? (yes/no) ")?;
        output.flush()?;

        let mut answer = String::new();
        input.read_line(&mut answer).context("reading answer")?;
        match answer.trim() {
            "yes" | "y" => {}
            _ => return Err(TrustRejected.into()),
        }

        self.insert(host, fingerprint)?;
        info!("pinned {} -> {}", host, fingerprint);
        Ok(())
    }

    fn insert(&self, host: &str, fingerprint: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {parent:?}"))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {:?} for append", self.path))?;
        writeln!(file, "{host} {fingerprint}").context("appending pin")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    const FP: &str = "AB:CD:EF";

    fn db_with(content: &str) -> (tempfile::TempDir, CertDb) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("certdb");
        std::fs::write(&path, content).expect("writing fixture");
        let db = CertDb::new(&path);
        (dir, db)
    }

    #[test]
    fn missing_db_is_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let db = CertDb::new(dir.path().join("certdb"));
        assert_eq!(db.check("host", FP).unwrap(), Check::NoMatch);
    }

    #[test]
    fn first_matching_line_wins() {
        let (_dir, db) = db_with("example.com AB:CD:EF old-chain\nexample.com 11:22:33\n");
        assert_eq!(db.check("example.com", FP).unwrap(), Check::Match);
        assert_eq!(db.check("example.com", "11:22:33").unwrap(), Check::Match);
        assert_eq!(db.check("other.com", FP).unwrap(), Check::NoMatch);
    }

    #[test]
    fn short_lines_are_skipped() {
        let (_dir, db) = db_with("garbage\n\nexample.com AB:CD:EF\n");
        assert_eq!(db.check("example.com", FP).unwrap(), Check::Match);
    }

    #[test]
    fn mismatched_pin_does_not_stop_the_scan() {
        // a later line can still match after a same-host mismatch
        let (_dir, db) = db_with("example.com 11:22:33\nexample.com AB:CD:EF\n");
        assert_eq!(db.check("example.com", FP).unwrap(), Check::Match);
    }

    #[test]
    fn yes_appends_a_pin() {
        let dir = tempfile::tempdir().unwrap();
        let db = CertDb::new(dir.path().join("certdb"));

        let mut prompt = Vec::new();
        db.prompt_and_insert_io("example.com", FP, "Test CA", Cursor::new("yes\n"), &mut prompt)
            .expect("accept");

        assert_eq!(db.check("example.com", FP).unwrap(), Check::Match);
        let prompt = String::from_utf8(prompt).unwrap();
        assert!(prompt.contains("example.com"));
        assert!(prompt.contains(FP));
        assert!(prompt.contains("Test CA"));
    }

    #[test]
    fn anything_but_yes_rejects_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certdb");
        let db = CertDb::new(&path);

        let err = db
            .prompt_and_insert_io("example.com", FP, "Test CA", Cursor::new("no\n"), Vec::new())
            .expect_err("must reject");
        err.downcast::<TrustRejected>().expect("typed rejection");

        assert!(!path.exists());
        assert_eq!(db.check("example.com", FP).unwrap(), Check::NoMatch);
    }
}
