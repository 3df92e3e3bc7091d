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

//! The POP3 session.
//!
//! RFC 1939's three states map onto the session as follows: AUTHORIZATION
//! until USER/PASS succeed, TRANSACTION over a snapshot of the INBOX taken
//! at login, and UPDATE during QUIT, when the locally-marked deletions are
//! applied to the store. Deliveries racing a session are invisible to it;
//! the snapshot numbering is stable for the session's lifetime.

use std::collections::HashSet;
use std::io;
use std::str;
use std::time::Instant;

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::mpsc;

use super::syntax::Command;
use crate::context::Context;
use crate::store::{maildir::split_headers, Maildir, INBOX};
use crate::smtp::syntax::dot_stuff;
use crate::support::{
    async_io::{idle_timer, ServerIo, DEFAULT_IDLE_TIMEOUT},
    error::Error,
    log_prefix::LogPrefix,
};

const MAX_LINE: usize = 1024;

pub async fn serve_pop3(io: ServerIo, ctx: Context, log_prefix: LogPrefix) {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);

    let mut server = Server {
        io: BufStream::new(io),
        ctx,
        log_prefix: log_prefix.clone(),
        deadline_tx,
        quit: false,
        pending_user: None,
        mailbox: None,
    };

    let result = tokio::select! {
        r = server.run() => r,
        _ = idle_timer(deadline_rx) => {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Connection idle timer expired",
            )))
        },
    };

    match result {
        Ok(()) => info!("{} Normal client disconnect", log_prefix),
        Err(e) => warn!("{} Abnormal client disconnect: {}", log_prefix, e),
    }
}

/// One entry in the login-time snapshot. Its 1-based position in the
/// snapshot vector is the message number for the whole session.
struct SnapshotEntry {
    unique_id: String,
    size: u64,
}

/// Present once the session has reached TRANSACTION.
struct OpenMailbox {
    user: String,
    maildir: Maildir,
    snapshot: Vec<SnapshotEntry>,
    deleted: HashSet<usize>,
}

struct Server {
    io: BufStream<ServerIo>,
    ctx: Context,
    log_prefix: LogPrefix,
    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,

    pending_user: Option<String>,
    mailbox: Option<OpenMailbox>,
}

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_ok(&format!(
            "{} POP3 server ready",
            self.ctx.host_name
        ))
        .await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + DEFAULT_IDLE_TIMEOUT)
            .await;

        buffer.clear();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.send_err("Command line too long").await?;
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }
                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let command_line =
            match str::from_utf8(&buffer[..buffer.len() - line_ending_len]) {
                Ok(s) => s,
                Err(_) => return self.send_err("Malformed command").await,
            };

        let command = match command_line.parse::<Command>() {
            Ok(command) => command,
            Err(()) => return self.send_err("Unknown command").await,
        };

        match command {
            Command::User(name) => self.cmd_user(name).await,
            Command::Pass(password) => self.cmd_pass(password).await,
            Command::Stat => self.cmd_stat().await,
            Command::List(number) => self.cmd_list(number).await,
            Command::Retr(number) => self.cmd_retr(number).await,
            Command::Dele(number) => self.cmd_dele(number).await,
            Command::Noop => self.cmd_noop().await,
            Command::Rset => self.cmd_rset().await,
            Command::Quit => self.cmd_quit().await,
            Command::Top(number, lines) => self.cmd_top(number, lines).await,
            Command::Uidl(number) => self.cmd_uidl(number).await,
            Command::Capa => self.cmd_capa().await,
            Command::Stls => self.cmd_stls().await,
            Command::Auth(mechanism) => self.cmd_auth(mechanism).await,
        }
    }

    fn in_transaction(&self) -> bool {
        self.mailbox.is_some()
    }

    async fn cmd_user(&mut self, name: String) -> Result<(), Error> {
        if self.in_transaction() {
            return self.send_err("Already authenticated").await;
        }

        self.pending_user = Some(name);
        self.send_ok("User accepted").await
    }

    async fn cmd_pass(&mut self, password: String) -> Result<(), Error> {
        if self.in_transaction() {
            return self.send_err("Already authenticated").await;
        }

        let Some(user) = self.pending_user.take() else {
            return self.send_err("USER command required first").await;
        };

        if !self.ctx.credentials.authenticate(&user, &password) {
            warn!("{} Authentication failed for {:?}", self.log_prefix, user);
            return self.send_err("Authentication failed").await;
        }

        let Some(maildir) = self.ctx.maildir_for(&user) else {
            return self.send_err("Unable to open mailbox").await;
        };

        if !maildir.exists() {
            if let Err(e) = maildir.initialize() {
                warn!(
                    "{} Failed to initialise maildir for {}: {}",
                    self.log_prefix, user, e
                );
                return self.send_err("Unable to open mailbox").await;
            }
        }

        let snapshot = match maildir.list_messages(INBOX) {
            Ok(messages) => messages
                .into_iter()
                .map(|m| SnapshotEntry {
                    unique_id: m.unique_id,
                    size: m.size,
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(
                    "{} Failed to list INBOX for {}: {}",
                    self.log_prefix, user, e
                );
                return self.send_err("Unable to open mailbox").await;
            },
        };

        info!(
            "{} Authenticated as {}; {} message(s)",
            self.log_prefix,
            user,
            snapshot.len()
        );
        self.log_prefix.set_user(user.clone());

        let count = snapshot.len();
        self.mailbox = Some(OpenMailbox {
            user,
            maildir,
            snapshot,
            deleted: HashSet::new(),
        });

        self.send_ok(&format!(
            "Authentication successful, {} messages",
            count
        ))
        .await
    }

    /// Looks a 1-based message number up in the snapshot, skipping
    /// locally-deleted entries.
    fn lookup(&self, number: usize) -> Option<&SnapshotEntry> {
        let mailbox = self.mailbox.as_ref()?;
        if number == 0
            || number > mailbox.snapshot.len()
            || mailbox.deleted.contains(&number)
        {
            return None;
        }
        Some(&mailbox.snapshot[number - 1])
    }

    fn remaining(&self) -> (usize, u64) {
        let Some(ref mailbox) = self.mailbox else { return (0, 0) };
        mailbox
            .snapshot
            .iter()
            .enumerate()
            .filter(|(ix, _)| !mailbox.deleted.contains(&(ix + 1)))
            .fold((0, 0), |(count, size), (_, entry)| {
                (count + 1, size + entry.size)
            })
    }

    async fn cmd_stat(&mut self) -> Result<(), Error> {
        if !self.in_transaction() {
            return self.send_err("Not authenticated").await;
        }

        let (count, size) = self.remaining();
        self.send_ok(&format!("{} {}", count, size)).await
    }

    async fn cmd_list(&mut self, number: Option<usize>) -> Result<(), Error> {
        if !self.in_transaction() {
            return self.send_err("Not authenticated").await;
        }

        if let Some(number) = number {
            return match self.lookup(number) {
                Some(entry) => {
                    let size = entry.size;
                    self.send_ok(&format!("{} {}", number, size)).await
                },
                None => self.send_err("No such message").await,
            };
        }

        let (count, size) = self.remaining();
        let mailbox = self.mailbox.as_ref().unwrap();
        let mut lines = Vec::new();
        for (ix, entry) in mailbox.snapshot.iter().enumerate() {
            if !mailbox.deleted.contains(&(ix + 1)) {
                lines.push(format!("{} {}", ix + 1, entry.size));
            }
        }

        self.send_multiline(
            &format!("{} messages ({} octets)", count, size),
            lines.iter().map(|s| s.as_bytes()),
        )
        .await
    }

    async fn cmd_retr(&mut self, number: usize) -> Result<(), Error> {
        let Some(entry) = self.lookup(number) else {
            return self.send_err("No such message").await;
        };
        let unique_id = entry.unique_id.clone();

        let mailbox = self.mailbox.as_ref().unwrap();
        let content = match mailbox.maildir.message_content(&unique_id, INBOX)
        {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "{} Failed to read message {}: {}",
                    self.log_prefix, unique_id, e
                );
                return self.send_err("Unable to retrieve message").await;
            },
        };

        let size = content.len();
        self.send_payload(&format!("{} octets", size), &content).await
    }

    async fn cmd_dele(&mut self, number: usize) -> Result<(), Error> {
        if !self.in_transaction() {
            return self.send_err("Not authenticated").await;
        }

        let mailbox = self.mailbox.as_mut().unwrap();
        if number == 0 || number > mailbox.snapshot.len() {
            return self.send_err("No such message").await;
        }

        if !mailbox.deleted.insert(number) {
            return self.send_err("Message already deleted").await;
        }

        self.send_ok(&format!("Message {} deleted", number)).await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        if !self.in_transaction() {
            return self.send_err("Not authenticated").await;
        }
        self.send_ok("").await
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        if !self.in_transaction() {
            return self.send_err("Not authenticated").await;
        }

        let mailbox = self.mailbox.as_mut().unwrap();
        mailbox.deleted.clear();
        let restored = mailbox.snapshot.len();
        self.send_ok(&format!("{} messages restored", restored)).await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;

        // Entering UPDATE: apply the deferred deletions.
        let Some(mailbox) = self.mailbox.take() else {
            return self.send_ok("Goodbye").await;
        };

        let mut removed = 0usize;
        for &number in &mailbox.deleted {
            let entry = &mailbox.snapshot[number - 1];
            match mailbox.maildir.delete_message(&entry.unique_id, INBOX) {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    "{} Failed to expunge message {}: {}",
                    self.log_prefix, entry.unique_id, e
                ),
            }
        }

        info!(
            "{} Session for {} closed; {} message(s) deleted",
            self.log_prefix, mailbox.user, removed
        );
        self.send_ok(&format!("Goodbye, {} messages deleted", removed))
            .await
    }

    async fn cmd_top(
        &mut self,
        number: usize,
        lines: usize,
    ) -> Result<(), Error> {
        let Some(entry) = self.lookup(number) else {
            return self.send_err("No such message").await;
        };
        let unique_id = entry.unique_id.clone();

        let mailbox = self.mailbox.as_ref().unwrap();
        let content = match mailbox.maildir.message_content(&unique_id, INBOX)
        {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "{} Failed to read message {}: {}",
                    self.log_prefix, unique_id, e
                );
                return self.send_err("Unable to retrieve message").await;
            },
        };

        let (headers, body) = split_headers(&content);
        let mut top = headers.to_vec();
        top.extend_from_slice(b"\r\n\r\n");
        for line in body.split(|&b| b == b'\n').take(lines) {
            let line = match line.last() {
                Some(&b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            top.extend_from_slice(line);
            top.extend_from_slice(b"\r\n");
        }

        self.send_payload("", &top).await
    }

    async fn cmd_uidl(&mut self, number: Option<usize>) -> Result<(), Error> {
        if !self.in_transaction() {
            return self.send_err("Not authenticated").await;
        }

        if let Some(number) = number {
            return match self.lookup(number) {
                Some(entry) => {
                    let unique_id = entry.unique_id.clone();
                    self.send_ok(&format!("{} {}", number, unique_id)).await
                },
                None => self.send_err("No such message").await,
            };
        }

        let mailbox = self.mailbox.as_ref().unwrap();
        let mut lines = Vec::new();
        for (ix, entry) in mailbox.snapshot.iter().enumerate() {
            if !mailbox.deleted.contains(&(ix + 1)) {
                lines.push(format!("{} {}", ix + 1, entry.unique_id));
            }
        }

        self.send_multiline("", lines.iter().map(|s| s.as_bytes()))
            .await
    }

    async fn cmd_capa(&mut self) -> Result<(), Error> {
        let mut capabilities = vec![
            "USER".to_owned(),
            "TOP".to_owned(),
            "UIDL".to_owned(),
            "RESP-CODES".to_owned(),
            "AUTH-RESP-CODE".to_owned(),
            "PIPELINING".to_owned(),
        ];

        if self.stls_available() {
            capabilities.push("STLS".to_owned());
        }
        if self.in_transaction() {
            capabilities.push("EXPIRE NEVER".to_owned());
        }
        capabilities
            .push(format!("IMPLEMENTATION {}", env!("CARGO_PKG_NAME")));

        self.send_multiline(
            "Capability list follows",
            capabilities.iter().map(|s| s.as_bytes()),
        )
        .await
    }

    fn stls_available(&self) -> bool {
        !self.io.get_ref().is_ssl()
            && self
                .ctx
                .starttls_available(self.ctx.config.pop3.enable_starttls)
    }

    async fn cmd_stls(&mut self) -> Result<(), Error> {
        if self.io.get_ref().is_ssl() {
            return self.send_err("Already using TLS").await;
        }

        if self.in_transaction() {
            return self
                .send_err("STLS only allowed before authentication")
                .await;
        }

        if !self.stls_available() {
            return self.send_err("STLS not available").await;
        }

        self.send_ok("Begin TLS negotiation").await?;

        info!("{} Start TLS handshake", self.log_prefix);
        let acceptor = self
            .ctx
            .ssl_acceptor
            .as_ref()
            .expect("stls_available() implies an acceptor");
        self.io.get_mut().ssl_accept(acceptor).await?;
        info!("{} TLS handshake completed", self.log_prefix);

        self.pending_user = None;
        Ok(())
    }

    async fn cmd_auth(
        &mut self,
        mechanism: Option<String>,
    ) -> Result<(), Error> {
        if self.in_transaction() {
            return self.send_err("Already authenticated").await;
        }

        match mechanism.as_deref() {
            None => {
                self.send_multiline(
                    "",
                    [&b"PLAIN"[..], &b"LOGIN"[..]].into_iter(),
                )
                .await
            },
            // Advertised for compatibility, but the SASL dialogue is not
            // wired up; USER/PASS is the supported path.
            Some("PLAIN") | Some("LOGIN") => {
                self.send_err("Use USER/PASS for authentication").await
            },
            Some(_) => {
                self.send_err("Unknown authentication mechanism").await
            },
        }
    }

    async fn send_ok(&mut self, text: &str) -> Result<(), Error> {
        let line = if text.is_empty() {
            "+OK\r\n".to_owned()
        } else {
            format!("+OK {}\r\n", text)
        };
        self.io.write_all(line.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn send_err(&mut self, text: &str) -> Result<(), Error> {
        self.io
            .write_all(format!("-ERR {}\r\n", text).as_bytes())
            .await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Sends `+OK <status>` followed by raw single-line entries and the
    /// terminating dot. The entries must not need byte-stuffing.
    async fn send_multiline(
        &mut self,
        status: &str,
        lines: impl Iterator<Item = &[u8]>,
    ) -> Result<(), Error> {
        let mut out = Vec::new();
        if status.is_empty() {
            out.extend_from_slice(b"+OK\r\n");
        } else {
            out.extend_from_slice(format!("+OK {}\r\n", status).as_bytes());
        }
        for line in lines {
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");

        self.io.write_all(&out).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Sends `+OK <status>` followed by byte-stuffed message content and
    /// the terminating dot.
    async fn send_payload(
        &mut self,
        status: &str,
        content: &[u8],
    ) -> Result<(), Error> {
        let mut out = Vec::with_capacity(content.len() + 64);
        if status.is_empty() {
            out.extend_from_slice(b"+OK\r\n");
        } else {
            out.extend_from_slice(format!("+OK {}\r\n", status).as_bytes());
        }
        out.extend_from_slice(&dot_stuff(content));
        out.extend_from_slice(b".\r\n");

        self.io.write_all(&out).await?;
        self.io.flush().await?;
        Ok(())
    }
}
