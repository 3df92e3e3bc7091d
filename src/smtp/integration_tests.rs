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

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use super::server::serve_smtp;
use crate::context::Context;
use crate::store::INBOX;
use crate::support::{async_io::ServerIo, log_prefix::LogPrefix};
use crate::test_support::{test_env, LineClient};

async fn start_server(ctx: Context, submission: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((sock, peer)) = listener.accept().await else { break };
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                serve_smtp(
                    ServerIo::new(sock),
                    ctx,
                    LogPrefix::new("smtp", peer.to_string()),
                    peer.ip().to_string(),
                    submission,
                )
                .await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> LineClient {
    let mut client = LineClient::connect(addr).await;
    let greeting = client.read_line().await;
    assert!(greeting.starts_with("220 "), "greeting: {}", greeting);
    client
}

fn auth_plain_blob(user: &str, password: &str) -> String {
    base64::encode(format!("\0{}\0{}", user, password))
}

#[tokio::test]
async fn ehlo_advertises_capabilities() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    client.send_line("EHLO client.example").await;
    let response = client.read_smtp_response().await;

    assert!(response[0].starts_with("250-mx.test.example Hello"));
    let caps: Vec<&str> =
        response.iter().map(|line| &line[4..]).collect();
    assert!(caps.iter().any(|c| c.starts_with("SIZE ")));
    assert!(caps.contains(&"8BITMIME"));
    assert!(caps.contains(&"PIPELINING"));
    // No certificates in the test context, so STARTTLS is off and AUTH is
    // usable in cleartext.
    assert!(!caps.contains(&"STARTTLS"));
    assert!(caps.contains(&"AUTH PLAIN LOGIN"));

    assert!(client.smtp_cmd("QUIT").await.starts_with("221 "));
}

#[tokio::test]
async fn local_delivery_with_dot_stuffing() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    assert!(client
        .smtp_cmd("EHLO client.example")
        .await
        .starts_with("250"));
    assert!(client
        .smtp_cmd("MAIL FROM:<alice@example.com>")
        .await
        .starts_with("250 "));
    assert!(client
        .smtp_cmd("RCPT TO:<bob@example.com>")
        .await
        .starts_with("250 "));
    assert!(client.smtp_cmd("DATA").await.starts_with("354 "));

    client
        .send_raw(b"Subject: Hi\r\n\r\nHello\r\n..hello\r\n.\r\n")
        .await;
    assert!(client
        .read_smtp_response()
        .await
        .pop()
        .unwrap()
        .starts_with("250 "));

    let maildir = env.ctx.maildir("example.com", "bob");
    let messages = maildir.list_messages(INBOX).unwrap();
    assert_eq!(1, messages.len());

    let content = maildir
        .message_content(&messages[0].unique_id, INBOX)
        .unwrap();
    let content = String::from_utf8(content).unwrap();
    assert!(content.starts_with("Received: from client.example"));
    assert!(content.contains("with ESMTP;"));
    assert!(content.contains("Subject: Hi"));
    // The stuffed dot came back off.
    assert!(content.contains("\r\n.hello\r\n"));
    assert!(!content.contains("..hello"));
}

#[tokio::test]
async fn unknown_local_recipient_rejected() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    client.smtp_cmd("EHLO c").await;
    client.smtp_cmd("MAIL FROM:<a@example.com>").await;
    let response = client.smtp_cmd("RCPT TO:<nobody@example.com>").await;
    assert!(response.starts_with("550 "), "got: {}", response);
}

#[tokio::test]
async fn relay_denied_until_authenticated_then_queued() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    client.smtp_cmd("EHLO c").await;
    client.smtp_cmd("MAIL FROM:<bob@example.com>").await;

    let denied = client.smtp_cmd("RCPT TO:<x@other.example>").await;
    assert!(denied.starts_with("530 "), "got: {}", denied);

    let authed = client
        .smtp_cmd(&format!(
            "AUTH PLAIN {}",
            auth_plain_blob("bob@example.com", "p")
        ))
        .await;
    assert!(authed.starts_with("235 "), "got: {}", authed);

    // The transaction state survived; retry the recipient.
    let allowed = client.smtp_cmd("RCPT TO:<x@other.example>").await;
    assert!(allowed.starts_with("250 "), "got: {}", allowed);

    assert!(client.smtp_cmd("DATA").await.starts_with("354 "));
    client.send_raw(b"Subject: Out\r\n\r\nbye\r\n.\r\n").await;
    let accepted = client.read_smtp_response().await.pop().unwrap();
    // No resolver in the test context: the immediate attempt fails
    // transiently and the message is taken into the retry queue.
    assert!(accepted.starts_with("250 "), "got: {}", accepted);
    assert_eq!(1, env.ctx.relay_queue.len());
}

#[tokio::test]
async fn auth_login_dialogue() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    client.smtp_cmd("EHLO c").await;

    client.send_line("AUTH LOGIN").await;
    assert_eq!(
        format!("334 {}", base64::encode("Username:")),
        client.read_line().await
    );
    client.send_line(&base64::encode("bob@example.com")).await;
    assert_eq!(
        format!("334 {}", base64::encode("Password:")),
        client.read_line().await
    );
    client.send_line(&base64::encode("p")).await;
    assert!(client.read_line().await.starts_with("235 "));
}

#[tokio::test]
async fn auth_with_bad_password_rejected() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    client.smtp_cmd("EHLO c").await;
    let response = client
        .smtp_cmd(&format!(
            "AUTH PLAIN {}",
            auth_plain_blob("bob@example.com", "wrong")
        ))
        .await;
    assert!(response.starts_with("535 "), "got: {}", response);
}

#[tokio::test]
async fn require_auth_blocks_mail_from() {
    let mut config = crate::support::system_config::SystemConfig::default();
    config.smtp.require_auth = true;
    let env = test_env(config);
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    client.smtp_cmd("EHLO c").await;
    let denied = client.smtp_cmd("MAIL FROM:<bob@example.com>").await;
    assert!(denied.starts_with("530 "), "got: {}", denied);

    client
        .smtp_cmd(&format!(
            "AUTH PLAIN {}",
            auth_plain_blob("bob@example.com", "p")
        ))
        .await;
    let allowed = client.smtp_cmd("MAIL FROM:<bob@example.com>").await;
    assert!(allowed.starts_with("250 "), "got: {}", allowed);
}

#[tokio::test]
async fn submission_service_forces_auth() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), true).await;
    let mut client = connect(addr).await;

    client.smtp_cmd("EHLO c").await;
    let denied = client.smtp_cmd("MAIL FROM:<bob@example.com>").await;
    assert!(denied.starts_with("530 "), "got: {}", denied);
}

#[tokio::test]
async fn oversized_message_rejected_in_sync() {
    let mut config = crate::support::system_config::SystemConfig::default();
    config.smtp.max_message_size = 32;
    let env = test_env(config);
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    client.smtp_cmd("EHLO c").await;

    // A SIZE declaration over the limit fails immediately.
    let declared = client
        .smtp_cmd("MAIL FROM:<a@example.com> SIZE=4096")
        .await;
    assert!(declared.starts_with("552 "), "got: {}", declared);

    // An undeclared oversize body fails after the terminator, and the
    // session remains usable.
    client.smtp_cmd("MAIL FROM:<a@example.com>").await;
    client.smtp_cmd("RCPT TO:<bob@example.com>").await;
    client.smtp_cmd("DATA").await;
    client
        .send_raw(b"0123456789abcdef0123456789abcdef0123456789\r\n.\r\n")
        .await;
    let rejected = client.read_smtp_response().await.pop().unwrap();
    assert!(rejected.starts_with("552 "), "got: {}", rejected);

    assert!(client.smtp_cmd("NOOP").await.starts_with("250 "));
    assert!(env
        .ctx
        .maildir("example.com", "bob")
        .list_messages(INBOX)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn vrfy_reports_known_users() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    client.smtp_cmd("EHLO c").await;
    assert_eq!(
        "250 bob@example.com",
        client.smtp_cmd("VRFY <bob@example.com>").await
    );
    assert!(client
        .smtp_cmd("VRFY <nobody@example.com>")
        .await
        .starts_with("252 "));
}

#[tokio::test]
async fn rset_clears_the_envelope() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    client.smtp_cmd("EHLO c").await;
    client.smtp_cmd("MAIL FROM:<a@example.com>").await;
    client.smtp_cmd("RCPT TO:<bob@example.com>").await;
    assert!(client.smtp_cmd("RSET").await.starts_with("250 "));

    // DATA now lacks a transaction.
    assert!(client.smtp_cmd("DATA").await.starts_with("503 "));
}

#[tokio::test]
async fn starttls_upgrade_rearms_the_session() {
    use std::pin::Pin;

    use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
    use tokio::net::TcpStream;

    use crate::test_support::test_env_tls;

    let env = test_env_tls(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut io = BufStream::new(tcp);

    let mut line = String::new();
    io.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("220 "), "greeting: {}", line);

    io.write_all(b"EHLO c\r\n").await.unwrap();
    io.flush().await.unwrap();
    let mut caps = Vec::new();
    loop {
        let mut line = String::new();
        io.read_line(&mut line).await.unwrap();
        let line = line.trim_end().to_owned();
        let done = line.len() < 4 || &line[3..4] == " ";
        caps.push(line);
        if done {
            break;
        }
    }
    // With a certificate configured, STARTTLS is on offer and AUTH is
    // held back until the channel is encrypted.
    assert!(caps.iter().any(|c| c.ends_with("STARTTLS")));
    assert!(!caps.iter().any(|c| c.contains("AUTH")));

    io.write_all(b"STARTTLS\r\n").await.unwrap();
    io.flush().await.unwrap();
    let mut line = String::new();
    io.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("220 "), "starttls: {}", line);

    // Client-side handshake over the same socket.
    let mut connector =
        SslConnector::builder(SslMethod::tls_client()).unwrap();
    connector.set_verify(SslVerifyMode::NONE);
    let ssl = connector
        .build()
        .configure()
        .unwrap()
        .into_ssl("mx.test.example")
        .unwrap();
    let tcp = io.into_inner();
    let mut tls =
        tokio_openssl::SslStream::new(ssl, tcp).unwrap();
    Pin::new(&mut tls).connect().await.unwrap();
    let mut io = BufStream::new(tls);

    // The session restarted: EHLO again, and the capability set flipped.
    io.write_all(b"EHLO c\r\n").await.unwrap();
    io.flush().await.unwrap();
    let mut caps = Vec::new();
    loop {
        let mut line = String::new();
        io.read_line(&mut line).await.unwrap();
        let line = line.trim_end().to_owned();
        let done = line.len() < 4 || &line[3..4] == " ";
        caps.push(line);
        if done {
            break;
        }
    }
    assert!(!caps.iter().any(|c| c.ends_with("STARTTLS")));
    assert!(caps.iter().any(|c| c.ends_with("AUTH PLAIN LOGIN")));

    // And AUTH now works, over the encrypted channel.
    io.write_all(
        format!(
            "AUTH PLAIN {}\r\n",
            auth_plain_blob("bob@example.com", "p")
        )
        .as_bytes(),
    )
    .await
    .unwrap();
    io.flush().await.unwrap();
    let mut line = String::new();
    io.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("235 "), "auth: {}", line);
}

#[tokio::test]
async fn unknown_commands_get_500() {
    let env = test_env(Default::default());
    let addr = start_server(Arc::clone(&env.ctx), false).await;
    let mut client = connect(addr).await;

    assert!(client.smtp_cmd("XYZZY").await.starts_with("500 "));
    assert!(client.smtp_cmd("MAIL FROM").await.starts_with("501 "));
}
