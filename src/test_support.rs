//-
// Copyright (c) 2024, the Tidemail developers
//
// This file is part of Tidemail.
//
// Tidemail is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tidemail is distributed  in the hope that it  will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tidemail. If not, see <http://www.gnu.org/licenses/>.

//! Shared fixtures for the protocol integration tests.

use std::net::SocketAddr;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::ssl::{SslAcceptor, SslMethod};
use openssl::x509::{X509NameBuilder, X509};

use crate::context::{test_context, test_context_tls, Context};
use crate::support::system_config::SystemConfig;

pub struct TestEnv {
    /// Held so the storage directory outlives the test.
    pub _root: TempDir,
    pub ctx: Context,
}

/// A context with domain `example.com` and user `bob@example.com`
/// (password `p`) provisioned, rooted in a throwaway directory.
pub fn test_env(config: SystemConfig) -> TestEnv {
    let root = TempDir::new().unwrap();
    let ctx = test_context(root.path(), config);

    ctx.credentials.create_domain("example.com").unwrap();
    ctx.credentials
        .create_user("bob@example.com", "p", 1024 * 1024)
        .unwrap();
    ctx.maildir("example.com", "bob").initialize().unwrap();

    TestEnv { _root: root, ctx }
}

/// Like [`test_env`], but with a freshly generated self-signed certificate
/// so STARTTLS paths can be exercised.
pub fn test_env_tls(config: SystemConfig) -> TestEnv {
    let root = TempDir::new().unwrap();
    let ctx =
        test_context_tls(root.path(), config, Some(self_signed_acceptor()));

    ctx.credentials.create_domain("example.com").unwrap();
    ctx.credentials
        .create_user("bob@example.com", "p", 1024 * 1024)
        .unwrap();
    ctx.maildir("example.com", "bob").initialize().unwrap();

    TestEnv { _root: root, ctx }
}

fn self_signed_acceptor() -> SslAcceptor {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "mx.test.example")
        .unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let certificate = builder.build();

    let mut acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .unwrap();
    acceptor.set_private_key(&key).unwrap();
    acceptor.set_certificate(&certificate).unwrap();
    acceptor.build()
}

/// A scripted line-oriented protocol client.
pub struct LineClient {
    io: BufStream<TcpStream>,
}

impl LineClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        LineClient {
            io: BufStream::new(TcpStream::connect(addr).await.unwrap()),
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.io.write_all(line.as_bytes()).await.unwrap();
        self.io.write_all(b"\r\n").await.unwrap();
        self.io.flush().await.unwrap();
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.io.write_all(data).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Reads one line, without its terminator.
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let read = self.io.read_line(&mut line).await.unwrap();
        assert!(read > 0, "EOF from server");
        line.trim_end_matches(['\r', '\n']).to_owned()
    }

    /// Reads SMTP response lines through the final (`NNN `) one, returning
    /// all of them.
    pub async fn read_smtp_response(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let last = line.len() < 4 || &line[3..4] == " ";
            lines.push(line);
            if last {
                return lines;
            }
        }
    }

    /// Sends an SMTP command and returns the final response line.
    pub async fn smtp_cmd(&mut self, command: &str) -> String {
        self.send_line(command).await;
        self.read_smtp_response().await.pop().unwrap()
    }

    /// Reads a POP3 multi-line payload (after the `+OK` line) through the
    /// terminating `.`, undoing byte-stuffing.
    pub async fn read_pop3_payload(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            if line == "." {
                return lines;
            }
            lines.push(
                line.strip_prefix('.').map(str::to_owned).unwrap_or(line),
            );
        }
    }

    /// Reads IMAP responses until the tagged completion for `tag`,
    /// returning every line including the tagged one.
    pub async fn read_imap_response(&mut self, tag: &str) -> Vec<String> {
        let prefix = format!("{} ", tag);
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.starts_with(&prefix);
            lines.push(line);
            if done {
                return lines;
            }
        }
    }
}
