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

//! The inbound SMTP session.

use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::str;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::mpsc;

use super::codes::*;
use super::outbound;
use super::syntax::*;
use crate::auth::{decode_base64_utf8, decode_plain_sasl};
use crate::context::Context;
use crate::store::INBOX;
use crate::support::{
    async_io::{idle_timer, ServerIo, DEFAULT_IDLE_TIMEOUT},
    error::Error,
    log_prefix::LogPrefix,
};

const MAX_LINE: usize = 1024;
const DATA_TIMEOUT: Duration = Duration::from_secs(1800);

/// Runs one SMTP session to completion.
///
/// `submission` marks the message-submission service (port 587), which
/// forces authentication before any mail transaction.
pub async fn serve_smtp(
    io: ServerIo,
    ctx: Context,
    log_prefix: LogPrefix,
    peer_addr: String,
    submission: bool,
) {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);

    let require_auth = submission || ctx.config.smtp.require_auth;
    let mut server = Server {
        io: BufStream::new(io),
        ctx,
        log_prefix: log_prefix.clone(),
        peer_addr,
        require_auth,
        deadline_tx,
        quit: false,
        helo: None,
        authenticated: None,
        mail_from: None,
        recipients: Vec::new(),
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses; forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, last: bool) -> Self {
        if last {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

macro_rules! require {
    ($this:expr, $($fns:ident = $arg:expr),*) => {
        $(if let Some(r) = $this.$fns($arg).await { return r; })*
    };
}

struct Server {
    io: BufStream<ServerIo>,
    ctx: Context,
    log_prefix: LogPrefix,
    peer_addr: String,
    require_auth: bool,

    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,
    /// The client's self-reported name from HELO/EHLO.
    helo: Option<String>,
    /// The authenticated full address, if any.
    authenticated: Option<String>,
    /// The accepted reverse-path; empty string is the null sender.
    mail_from: Option<String>,
    recipients: Vec<EmailAddress>,
}

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_greeting().await?;

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
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Cow::Borrowed("Command line too long"),
                )
                .await?;

                // Skip the rest of the line
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
        let command_line = &buffer[..buffer.len() - line_ending_len];
        if command_line.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix
            );
            self.quit = true;
            return Ok(());
        }

        let command_line = match str::from_utf8(command_line) {
            Ok(s) => s,
            Err(_) => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                return self
                    .send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Cow::Borrowed("Malformed UTF-8"),
                    )
                    .await;
            },
        };

        let command = match command_line.parse::<Command>() {
            Ok(c) => c,
            Err(()) => {
                warn!(
                    "{} Received bad command {:?}",
                    self.log_prefix,
                    truncated(command_line)
                );

                return if looks_like_known_command(command_line) {
                    self.send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Cow::Borrowed("Unknown command syntax"),
                    )
                    .await
                } else {
                    self.send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Cow::Borrowed("Unrecognised command"),
                    )
                    .await
                };
            },
        };

        match command {
            Command::Helo(command, origin) => {
                self.cmd_helo(command, origin).await
            },
            Command::Auth(mechanism, data) => {
                self.cmd_auth(mechanism, data).await
            },
            Command::MailFrom(path, size, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_mail_from(path, size).await
            },
            Command::Recipient(path, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_recipient(path).await
            },
            Command::Data => self.cmd_data().await,
            Command::Reset => self.cmd_reset().await,
            Command::Verify(address) => self.cmd_verify(address).await,
            Command::Help => self.cmd_help().await,
            Command::Noop => self.cmd_noop().await,
            Command::Quit => self.cmd_quit().await,
            Command::StartTls => self.cmd_start_tls().await,
        }
    }

    fn starttls_available(&self) -> bool {
        !self.io.get_ref().is_ssl()
            && self
                .ctx
                .starttls_available(self.ctx.config.smtp.enable_starttls)
    }

    /// AUTH is held back while STARTTLS is on offer but unused, so
    /// credentials stay off the cleartext wire whenever encryption is
    /// possible at all.
    fn auth_available(&self) -> bool {
        self.authenticated.is_none() && !self.starttls_available()
    }

    async fn cmd_helo(
        &mut self,
        command: String,
        origin: String,
    ) -> Result<(), Error> {
        let extended = "EHLO" == command;
        info!("{} SMTP {} from {}", self.log_prefix, command, origin);

        self.reset_envelope();
        self.helo = Some(origin.clone());

        self.send_response(
            Delayable.or_final(!extended),
            pc::Ok,
            Cow::Owned(format!(
                "{} Hello {}",
                self.ctx.host_name, origin
            )),
        )
        .await?;

        if extended {
            let mut extensions = vec![
                format!("SIZE {}", self.ctx.config.smtp.max_message_size),
                "8BITMIME".to_owned(),
                "PIPELINING".to_owned(),
            ];
            if self.starttls_available() {
                extensions.push("STARTTLS".to_owned());
            }
            if self.auth_available() {
                extensions.push("AUTH PLAIN LOGIN".to_owned());
            }

            let count = extensions.len();
            for (ix, extension) in extensions.into_iter().enumerate() {
                self.send_response(
                    Delayable.or_final(ix + 1 == count),
                    pc::Ok,
                    Cow::Owned(extension),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        initial: Option<String>,
    ) -> Result<(), Error> {
        require!(self, need_helo = true);

        if self.starttls_available() {
            warn!(
                "{} Rejected attempt to AUTH before STARTTLS",
                self.log_prefix
            );
            return self
                .send_response(
                    Final,
                    pc::AuthenticationRequired,
                    Cow::Borrowed("Must issue STARTTLS first"),
                )
                .await;
        }

        if self.authenticated.is_some() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Cow::Borrowed("Already authenticated"),
                )
                .await;
        }

        let credentials = match &*mechanism {
            "PLAIN" => {
                let blob = match initial {
                    Some(blob) => blob,
                    None => {
                        match self.auth_challenge("").await? {
                            Some(blob) => blob,
                            None => return self.auth_aborted().await,
                        }
                    },
                };

                decode_plain_sasl(&blob)
            },

            "LOGIN" => {
                let username = match initial {
                    Some(blob) => decode_base64_utf8(&blob),
                    None => {
                        match self
                            .auth_challenge(&base64::encode("Username:"))
                            .await?
                        {
                            Some(blob) => decode_base64_utf8(&blob),
                            None => return self.auth_aborted().await,
                        }
                    },
                };

                let password = match self
                    .auth_challenge(&base64::encode("Password:"))
                    .await?
                {
                    Some(blob) => decode_base64_utf8(&blob),
                    None => return self.auth_aborted().await,
                };

                username.zip(password)
            },

            _ => {
                return self
                    .send_response(
                        Final,
                        pc::CommandParameterNotImplemented,
                        Cow::Borrowed("Unknown authentication mechanism"),
                    )
                    .await;
            },
        };

        let Some((username, password)) = credentials else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Cow::Borrowed("Invalid credentials format"),
                )
                .await;
        };

        if self.ctx.credentials.authenticate(&username, &password) {
            info!("{} Authenticated as {}", self.log_prefix, username);
            self.log_prefix.set_user(username.clone());
            self.authenticated = Some(username);
            self.send_response(
                Final,
                pc::AuthenticationSucceeded,
                Cow::Borrowed("Authentication successful"),
            )
            .await
        } else {
            warn!(
                "{} Authentication failed for {:?}",
                self.log_prefix, username
            );
            self.send_response(
                Final,
                pc::AuthenticationCredentialsInvalid,
                Cow::Borrowed("Authentication failed"),
            )
            .await
        }
    }

    /// Sends a 334 challenge and reads the client's base64 response line.
    /// `None` means the client aborted the exchange with `*`.
    async fn auth_challenge(
        &mut self,
        challenge: &str,
    ) -> Result<Option<String>, Error> {
        self.send_response(
            Final,
            pc::ServerChallenge,
            Cow::Borrowed(challenge),
        )
        .await?;

        let mut buffer = Vec::new();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut buffer)
            .await?;
        if !buffer.ends_with(b"\n") {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF or overlong line in AUTH exchange",
            )));
        }

        while buffer.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            buffer.pop();
        }

        let line = String::from_utf8_lossy(&buffer).into_owned();
        if line == "*" {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }

    async fn auth_aborted(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::ParameterSyntaxError,
            Cow::Borrowed("Authentication aborted"),
        )
        .await
    }

    async fn cmd_mail_from(
        &mut self,
        path: String,
        approx_size: Option<u64>,
    ) -> Result<(), Error> {
        require!(self, need_helo = true);

        if self.require_auth && self.authenticated.is_none() {
            return self
                .send_response(
                    Final,
                    pc::AuthenticationRequired,
                    Cow::Borrowed("Authentication required"),
                )
                .await;
        }

        if approx_size.unwrap_or(0) > self.ctx.config.smtp.max_message_size {
            return self
                .send_response(
                    Final,
                    pc::ExceededStorageAllocation,
                    Cow::Owned(format!(
                        "Maximum message size is {} bytes",
                        self.ctx.config.smtp.max_message_size
                    )),
                )
                .await;
        }

        let Ok(sender) = parse_address(&path) else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Cow::Borrowed("Invalid sender address"),
                )
                .await;
        };

        info!("{} Start mail transaction", self.log_prefix);
        self.reset_envelope();
        self.mail_from =
            Some(sender.map(|a| a.address()).unwrap_or_default());
        self.send_response(Final, pc::Ok, Cow::Borrowed("OK")).await
    }

    async fn cmd_recipient(&mut self, path: String) -> Result<(), Error> {
        require!(self, need_helo = true, need_mail_from = true);

        if self.recipients.len() >= self.ctx.config.smtp.max_recipients {
            return self
                .send_response(
                    Final,
                    pc::ExceededStorageAllocation,
                    Cow::Borrowed("Too many recipients"),
                )
                .await;
        }

        let Ok(Some(recipient)) = parse_address(&path) else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Cow::Borrowed("Invalid recipient address"),
                )
                .await;
        };

        if self.ctx.is_local_domain(&recipient.domain) {
            if self.ctx.credentials.get_user(&recipient.address()).is_none()
            {
                return self
                    .send_response(
                        Final,
                        pc::ActionNotTakenPermanent,
                        // The "no such user - " prefix has significance
                        // with some agents according to RFC 5321.
                        Cow::Owned(format!("no such user - {}", recipient)),
                    )
                    .await;
            }
        } else if self.authenticated.is_none()
            && !self.ctx.config.smtp.allow_relay
        {
            warn!("{} Relay denied for {}", self.log_prefix, recipient);
            return self
                .send_response(
                    Final,
                    pc::AuthenticationRequired,
                    Cow::Borrowed("Relay access denied"),
                )
                .await;
        }

        self.recipients.push(recipient);
        self.send_response(Final, pc::Ok, Cow::Borrowed("OK")).await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        require!(
            self,
            need_helo = true,
            need_mail_from = true,
            need_recipients = true
        );

        self.send_response(
            Final,
            pc::StartMailInput,
            Cow::Borrowed("End data with <CR><LF>.<CR><LF>"),
        )
        .await?;

        let _ = self
            .deadline_tx
            .send(Instant::now() + DATA_TIMEOUT)
            .await;

        let body = read_data_body(
            Pin::new(&mut self.io),
            self.ctx.config.smtp.max_message_size,
        )
        .await?;

        let Some(body) = body else {
            self.reset_envelope();
            return self
                .send_response(
                    Final,
                    pc::ExceededStorageAllocation,
                    Cow::Borrowed("Message too large"),
                )
                .await;
        };

        let all_delivered = self.deliver_message(&body).await;
        self.reset_envelope();

        if all_delivered {
            self.send_response(
                Final,
                pc::Ok,
                Cow::Borrowed("Message accepted for delivery"),
            )
            .await
        } else {
            self.send_response(
                Final,
                pc::ActionAborted,
                Cow::Borrowed("Delivery failed"),
            )
            .await
        }
    }

    /// Routes the message to every accepted recipient. Returns whether all
    /// of them were delivered (or durably taken responsibility for).
    async fn deliver_message(&mut self, body: &[u8]) -> bool {
        let sender = self.mail_from.clone().unwrap_or_default();
        let recipients = std::mem::take(&mut self.recipients);

        let received = format!(
            "Received: from {} ({})\r\n\tby {} with {};\r\n\t{}\r\n",
            self.helo.as_deref().unwrap_or("unknown"),
            self.peer_addr,
            self.ctx.host_name,
            if self.io.get_ref().is_ssl() {
                "ESMTPS"
            } else {
                "ESMTP"
            },
            Utc::now().to_rfc2822(),
        );

        let mut full_message =
            Vec::with_capacity(received.len() + body.len());
        full_message.extend_from_slice(received.as_bytes());
        full_message.extend_from_slice(body);

        let mut all_delivered = true;
        for recipient in &recipients {
            let delivered = if self.ctx.is_local_domain(&recipient.domain) {
                self.deliver_local(recipient, &full_message)
            } else {
                self.deliver_remote(&sender, recipient, &full_message).await
            };

            all_delivered &= delivered;
        }

        all_delivered
    }

    fn deliver_local(
        &self,
        recipient: &EmailAddress,
        content: &[u8],
    ) -> bool {
        let maildir =
            self.ctx.maildir(&recipient.domain, &recipient.local);

        if !maildir.exists() {
            if !self.ctx.config.storage.create_directories {
                error!(
                    "{} No maildir for {} and directory creation is off",
                    self.log_prefix, recipient
                );
                return false;
            }

            if let Err(e) = maildir.initialize() {
                error!(
                    "{} Failed to initialise maildir for {}: {}",
                    self.log_prefix, recipient, e
                );
                return false;
            }
        }

        match maildir.deliver(content, INBOX) {
            Ok(unique_id) => {
                info!(
                    "{} Delivered message {} to {}",
                    self.log_prefix, unique_id, recipient
                );
                true
            },
            Err(e) => {
                error!(
                    "{} Local delivery to {} failed: {}",
                    self.log_prefix, recipient, e
                );
                false
            },
        }
    }

    async fn deliver_remote(
        &self,
        sender: &str,
        recipient: &EmailAddress,
        content: &[u8],
    ) -> bool {
        let address = recipient.address();
        match outbound::deliver_remote(&self.ctx, sender, &address, content)
            .await
        {
            Ok(()) => true,
            Err(failure) if failure.transient => {
                // We take responsibility for the message; the queue will
                // keep trying.
                warn!(
                    "{} Immediate relay to {} failed ({}); queued for retry",
                    self.log_prefix, address, failure.message
                );
                self.ctx.relay_queue.enqueue(
                    sender.to_owned(),
                    vec![address],
                    content.to_vec(),
                );
                true
            },
            Err(failure) => {
                error!(
                    "{} Relay to {} failed permanently: {}",
                    self.log_prefix, address, failure.message
                );
                false
            },
        }
    }

    async fn cmd_reset(&mut self) -> Result<(), Error> {
        self.reset_envelope();
        self.send_response(Final, pc::Ok, Cow::Borrowed("OK")).await
    }

    async fn cmd_verify(&mut self, argument: String) -> Result<(), Error> {
        require!(self, need_helo = true);

        let Ok(Some(address)) = parse_address(&argument) else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Cow::Borrowed("Invalid address"),
                )
                .await;
        };

        if self.ctx.is_local_domain(&address.domain)
            && self.ctx.credentials.get_user(&address.address()).is_some()
        {
            return self
                .send_response(
                    Final,
                    pc::Ok,
                    Cow::Owned(address.address()),
                )
                .await;
        }

        self.send_response(
            Final,
            pc::CannotVerify,
            Cow::Borrowed("Cannot verify user"),
        )
        .await
    }

    async fn cmd_help(&mut self) -> Result<(), Error> {
        self.send_response(
            Delayable,
            pc::HelpMessage,
            Cow::Owned(format!("{} supports:", self.ctx.host_name)),
        )
        .await?;
        self.send_response(
            Final,
            pc::HelpMessage,
            Cow::Borrowed(
                "HELO EHLO MAIL RCPT DATA RSET NOOP QUIT VRFY AUTH \
                 STARTTLS HELP",
            ),
        )
        .await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        self.send_response(Final, pc::Ok, Cow::Borrowed("OK")).await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        self.send_response(
            Final,
            pc::ServiceClosing,
            Cow::Owned(format!(
                "{} closing connection",
                self.ctx.host_name
            )),
        )
        .await
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        require!(self, need_helo = true);

        if self.io.get_ref().is_ssl() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Cow::Borrowed("Already using TLS"),
                )
                .await;
        }

        if !self.starttls_available() {
            return self
                .send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Cow::Borrowed("STARTTLS not available"),
                )
                .await;
        }

        self.send_response(
            Final,
            pc::ServiceReady,
            Cow::Borrowed("Ready to start TLS"),
        )
        .await?;

        info!("{} Start TLS handshake", self.log_prefix);
        let acceptor = self
            .ctx
            .ssl_acceptor
            .as_ref()
            .expect("starttls_available() implies an acceptor");
        self.io.get_mut().ssl_accept(acceptor).await?;
        info!("{} TLS handshake completed", self.log_prefix);

        // The session restarts from scratch over the encrypted channel.
        self.helo = None;
        self.authenticated = None;
        self.reset_envelope();
        Ok(())
    }

    async fn need_helo(&mut self, present: bool) -> Option<Result<(), Error>> {
        self.check_need(
            self.helo.is_some(),
            present,
            "Already got HELO",
            "Send HELO/EHLO first",
        )
        .await
    }

    async fn need_mail_from(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.mail_from.is_some(),
            present,
            "Already got MAIL FROM",
            "Send MAIL FROM first",
        )
        .await
    }

    async fn need_recipients(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            !self.recipients.is_empty(),
            present,
            "Already have recipients",
            "Send RCPT TO first",
        )
        .await
    }

    async fn check_need(
        &mut self,
        current_status: bool,
        desired_status: bool,
        message_if_already_present: &str,
        message_if_missing: &str,
    ) -> Option<Result<(), Error>> {
        if current_status != desired_status {
            Some(
                self.send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Cow::Borrowed(if current_status {
                        message_if_already_present
                    } else {
                        message_if_missing
                    }),
                )
                .await,
            )
        } else {
            None
        }
    }

    fn reset_envelope(&mut self) {
        self.mail_from = None;
        self.recipients.clear();
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::ServiceReady,
            Cow::Owned(format!(
                "{} {} {} {} ready",
                self.ctx.host_name,
                if self.io.get_ref().is_ssl() {
                    "ESMTPS"
                } else {
                    "ESMTP"
                },
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            )),
        )
        .await
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        code: PrimaryCode,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        let s = format!("{}{}{}\r\n", code as u16, kind.indicator(), quip);
        self.io.write_all(s.as_bytes()).await?;
        match kind {
            Final => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }
}

fn truncated(line: &str) -> &str {
    match line.char_indices().nth(64) {
        Some((ix, _)) => &line[..ix],
        None => line,
    }
}

/// Reads a DATA payload up to the lone `.` terminator, reversing
/// dot-stuffing and normalising line endings to CRLF.
///
/// Returns `None` if the accumulated message exceeded `max_size`; the
/// input is still consumed through the terminator so the session stays in
/// sync.
async fn read_data_body(
    mut src: Pin<&mut impl AsyncBufReadExt>,
    max_size: u64,
) -> Result<Option<Vec<u8>>, Error> {
    let mut body = Vec::<u8>::new();
    let mut overflow = false;
    let mut consumed = 0u64;
    // Consuming much more than twice the limit without finding the
    // terminator means the client is not going to behave.
    let consumption_limit =
        max_size.saturating_mul(2).saturating_add(64 * 1024);

    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        src.read_until(b'\n', &mut buffer).await?;

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            )));
        }

        consumed += buffer.len() as u64;
        if consumed > consumption_limit {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "DATA payload vastly exceeds the size limit",
            )));
        }

        if b".\r\n" == &buffer[..] || b".\n" == &buffer[..] {
            break;
        }

        if !buffer.ends_with(b"\n") {
            // EOF in the middle of a line.
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            )));
        }

        if overflow {
            continue;
        }

        let mut line: &[u8] = &buffer;
        // Reverse dot-stuffing.
        if line.first() == Some(&b'.') {
            line = &line[1..];
        }
        // Normalise the line ending.
        while line.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            line = &line[..line.len() - 1];
        }

        if body.len() as u64 + line.len() as u64 + 2 > max_size {
            overflow = true;
            body.clear();
            continue;
        }

        body.extend_from_slice(line);
        body.extend_from_slice(b"\r\n");
    }

    Ok(if overflow { None } else { Some(body) })
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::smtp::syntax::dot_stuff;

    fn read_body_sync(input: &[u8], max_size: u64) -> Option<Vec<u8>> {
        let mut reader = tokio::io::BufReader::new(input);
        futures::executor::block_on(read_data_body(
            Pin::new(&mut reader),
            max_size,
        ))
        .unwrap()
    }

    #[test]
    fn data_terminator_and_stuffing() {
        assert_eq!(
            Some(b"hello\r\n".to_vec()),
            read_body_sync(b"hello\r\n.\r\n", 1024)
        );
        assert_eq!(
            Some(b".hello\r\n".to_vec()),
            read_body_sync(b"..hello\r\n.\r\n", 1024)
        );
        // UNIX newlines are tolerated and normalised.
        assert_eq!(
            Some(b"a\r\nb\r\n".to_vec()),
            read_body_sync(b"a\nb\n.\n", 1024)
        );
        // An empty message.
        assert_eq!(Some(b"".to_vec()), read_body_sync(b".\r\n", 1024));
    }

    #[test]
    fn data_oversize_consumes_to_terminator() {
        assert_eq!(None, read_body_sync(b"0123456789abcdef\r\n.\r\n", 8));
    }

    #[test]
    fn plain_decoding() {
        assert_eq!(
            Some(("bob".to_owned(), "hunter2".to_owned())),
            decode_plain_sasl(&base64::encode("\0bob\0hunter2"))
        );
        assert_eq!(
            Some(("bob".to_owned(), "hunter2".to_owned())),
            decode_plain_sasl(&base64::encode("bob\0bob\0hunter2"))
        );
        assert_eq!(
            None,
            decode_plain_sasl(&base64::encode("eve\0bob\0hunter2"))
        );
        assert_eq!(None, decode_plain_sasl(&base64::encode("no-nulls")));
        assert_eq!(None, decode_plain_sasl("not base64!"));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 1024,
            ..ProptestConfig::default()
        })]

        /// Dot-stuffing followed by un-stuffing is the identity on
        /// CRLF-terminated content, including lines of leading dots.
        #[test]
        fn dot_stuffing_round_trip(
            lines in proptest::collection::vec("[x.]{0,10}", 0..10),
        ) {
            let mut content = String::new();
            for line in &lines {
                content.push_str(line);
                content.push_str("\r\n");
            }

            let mut stuffed = dot_stuff(content.as_bytes());
            stuffed.extend_from_slice(b".\r\n");

            let decoded = read_body_sync(&stuffed, 1_000_000).unwrap();
            prop_assert_eq!(content.as_bytes(), &*decoded);
        }
    }
}
