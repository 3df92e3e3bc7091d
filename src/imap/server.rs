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

//! The IMAP4rev1 session: tagged command loop, state gating, and the
//! response stream.

use std::io;
use std::time::Instant;

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::mpsc;

use super::session::{parse_headers, SelectedMailbox};
use super::syntax::{self, FetchItem, Section, StoreMode, Tokenizer};
use crate::auth::{decode_base64_utf8, decode_plain_sasl};
use crate::context::Context;
use crate::store::{maildir::split_headers, Flag, Maildir};
use crate::support::{
    async_io::{idle_timer, ServerIo, DEFAULT_IDLE_TIMEOUT},
    error::Error,
    log_prefix::LogPrefix,
};

const MAX_LINE: usize = 8192;

pub async fn serve_imap(io: ServerIo, ctx: Context, log_prefix: LogPrefix) {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);

    let mut server = Server {
        io: BufStream::new(io),
        ctx,
        log_prefix: log_prefix.clone(),
        deadline_tx,
        quit: false,
        authenticated: None,
        maildir: None,
        selected: None,
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

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        }
    }
}

struct Server {
    io: BufStream<ServerIo>,
    ctx: Context,
    log_prefix: LogPrefix,
    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,

    /// The authenticated full address; `Some` in AUTHENTICATED and
    /// SELECTED states.
    authenticated: Option<String>,
    maildir: Option<Maildir>,
    selected: Option<SelectedMailbox>,
}

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_untagged(&format!(
            "OK {} IMAP4rev1 Service Ready",
            self.ctx.host_name
        ))
        .await?;
        self.io.flush().await?;

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
                self.send_untagged("BAD Command line too long").await?;
                self.io.flush().await?;
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
        let line = String::from_utf8_lossy(&buffer[..buffer.len() - line_ending_len])
            .into_owned();

        let Some(cmdline) = syntax::parse_command_line(&line) else {
            let tag = line
                .split(' ')
                .next()
                .filter(|t| !t.is_empty())
                .unwrap_or("*")
                .to_owned();
            return self
                .send_tagged(&tag, Status::Bad, "Invalid command line")
                .await;
        };

        self.dispatch(cmdline).await
    }

    async fn dispatch(
        &mut self,
        cmdline: syntax::CommandLine,
    ) -> Result<(), Error> {
        let tag = cmdline.tag;
        let args = cmdline.arguments;

        let authenticated = self.authenticated.is_some();
        let selected = self.selected.is_some();

        match cmdline.name.as_str() {
            "CAPABILITY" => self.cmd_capability(&tag).await,
            "NOOP" => {
                self.send_tagged(&tag, Status::Ok, "NOOP completed").await
            },
            "LOGOUT" => self.cmd_logout(&tag).await,

            "STARTTLS" if !authenticated => self.cmd_starttls(&tag).await,
            "LOGIN" if !authenticated => self.cmd_login(&tag, &args).await,
            "AUTHENTICATE" if !authenticated => {
                self.cmd_authenticate(&tag, &args).await
            },
            "STARTTLS" | "LOGIN" | "AUTHENTICATE" => {
                self.send_tagged(&tag, Status::Bad, "Already authenticated")
                    .await
            },

            "SELECT" if authenticated => {
                self.cmd_select(&tag, &args, false).await
            },
            "EXAMINE" if authenticated => {
                self.cmd_select(&tag, &args, true).await
            },
            "CREATE" if authenticated => {
                self.cmd_create(&tag, &args).await
            },
            "DELETE" if authenticated => {
                self.cmd_delete(&tag, &args).await
            },
            "RENAME" if authenticated => {
                self.cmd_rename(&tag, &args).await
            },
            "LIST" if authenticated => {
                self.cmd_list(&tag, &args, "LIST").await
            },
            "LSUB" if authenticated => {
                self.cmd_list(&tag, &args, "LSUB").await
            },
            "STATUS" if authenticated => {
                self.cmd_status(&tag, &args).await
            },
            "APPEND" if authenticated => {
                self.send_tagged(&tag, Status::No, "APPEND not supported")
                    .await
            },

            "CHECK" if selected => {
                self.send_tagged(&tag, Status::Ok, "CHECK completed").await
            },
            "CLOSE" if selected => self.cmd_close(&tag).await,
            "EXPUNGE" if selected => self.cmd_expunge(&tag).await,
            "SEARCH" if selected => {
                self.cmd_search(&tag, &args, false).await
            },
            "FETCH" if selected => {
                self.cmd_fetch(&tag, &args, false).await
            },
            "STORE" if selected => {
                self.cmd_store(&tag, &args, false).await
            },
            "COPY" if selected => self.cmd_copy(&tag, &args, false).await,
            "UID" if selected => self.cmd_uid(&tag, &args).await,

            "SELECT" | "EXAMINE" | "CREATE" | "DELETE" | "RENAME"
            | "LIST" | "LSUB" | "STATUS" | "APPEND" | "CHECK" | "CLOSE"
            | "EXPUNGE" | "SEARCH" | "FETCH" | "STORE" | "COPY" | "UID" => {
                self.send_tagged(
                    &tag,
                    Status::Bad,
                    if authenticated {
                        "No mailbox selected"
                    } else {
                        "Not authenticated"
                    },
                )
                .await
            },

            _ => {
                self.send_tagged(&tag, Status::Bad, "Unknown command").await
            },
        }
    }

    async fn cmd_capability(&mut self, tag: &str) -> Result<(), Error> {
        let mut capabilities =
            "CAPABILITY IMAP4rev1 AUTH=PLAIN AUTH=LOGIN".to_owned();
        if self.starttls_available() {
            capabilities.push_str(" STARTTLS");
        }

        self.send_untagged(&capabilities).await?;
        self.send_tagged(tag, Status::Ok, "CAPABILITY completed").await
    }

    async fn cmd_logout(&mut self, tag: &str) -> Result<(), Error> {
        self.quit = true;
        self.send_untagged("BYE Logging out").await?;
        self.send_tagged(tag, Status::Ok, "LOGOUT completed").await
    }

    fn starttls_available(&self) -> bool {
        !self.io.get_ref().is_ssl()
            && self
                .ctx
                .starttls_available(self.ctx.config.imap.enable_starttls)
    }

    async fn cmd_starttls(&mut self, tag: &str) -> Result<(), Error> {
        if self.io.get_ref().is_ssl() {
            return self
                .send_tagged(tag, Status::Bad, "Already using TLS")
                .await;
        }

        if !self.starttls_available() {
            return self
                .send_tagged(tag, Status::No, "TLS not configured")
                .await;
        }

        self.send_tagged(tag, Status::Ok, "Begin TLS negotiation").await?;

        info!("{} Start TLS handshake", self.log_prefix);
        let acceptor = self
            .ctx
            .ssl_acceptor
            .as_ref()
            .expect("starttls_available() implies an acceptor");
        self.io.get_mut().ssl_accept(acceptor).await?;
        info!("{} TLS handshake completed", self.log_prefix);
        Ok(())
    }

    async fn cmd_login(
        &mut self,
        tag: &str,
        args: &str,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let (Some(username), Some(password)) =
            (tokens.string(), tokens.string())
        else {
            return self
                .send_tagged(
                    tag,
                    Status::Bad,
                    "Missing username or password",
                )
                .await;
        };

        self.finish_login(tag, username, password, "LOGIN").await
    }

    async fn cmd_authenticate(
        &mut self,
        tag: &str,
        args: &str,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let Some(mechanism) = tokens.atom().map(|m| m.to_uppercase()) else {
            return self
                .send_tagged(tag, Status::Bad, "Missing mechanism")
                .await;
        };

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let Some(blob) = self.sasl_challenge("").await? else {
                    return self
                        .send_tagged(
                            tag,
                            Status::Bad,
                            "Authentication aborted",
                        )
                        .await;
                };
                decode_plain_sasl(&blob)
            },

            "LOGIN" => {
                let Some(user_blob) = self
                    .sasl_challenge(&base64::encode("Username:"))
                    .await?
                else {
                    return self
                        .send_tagged(
                            tag,
                            Status::Bad,
                            "Authentication aborted",
                        )
                        .await;
                };
                let Some(pass_blob) = self
                    .sasl_challenge(&base64::encode("Password:"))
                    .await?
                else {
                    return self
                        .send_tagged(
                            tag,
                            Status::Bad,
                            "Authentication aborted",
                        )
                        .await;
                };

                decode_base64_utf8(&user_blob)
                    .zip(decode_base64_utf8(&pass_blob))
            },

            _ => {
                return self
                    .send_tagged(
                        tag,
                        Status::No,
                        "Unsupported authentication mechanism",
                    )
                    .await;
            },
        };

        let Some((username, password)) = credentials else {
            return self
                .send_tagged(tag, Status::Bad, "Invalid credentials format")
                .await;
        };

        self.finish_login(tag, username, password, "AUTHENTICATE").await
    }

    /// Sends a `+` continuation and reads the client's base64 response.
    /// `None` means the client aborted with `*`.
    async fn sasl_challenge(
        &mut self,
        challenge: &str,
    ) -> Result<Option<String>, Error> {
        if challenge.is_empty() {
            self.io.write_all(b"+ \r\n").await?;
        } else {
            self.io
                .write_all(format!("+ {}\r\n", challenge).as_bytes())
                .await?;
        }
        self.io.flush().await?;

        let mut buffer = Vec::new();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut buffer)
            .await?;
        if !buffer.ends_with(b"\n") {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF or overlong line in AUTHENTICATE exchange",
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

    async fn finish_login(
        &mut self,
        tag: &str,
        username: String,
        password: String,
        command: &str,
    ) -> Result<(), Error> {
        if !self.ctx.credentials.authenticate(&username, &password) {
            warn!(
                "{} Authentication failed for {:?}",
                self.log_prefix, username
            );
            return self
                .send_tagged(
                    tag,
                    Status::No,
                    "[AUTHENTICATIONFAILED] Authentication failed",
                )
                .await;
        }

        let Some(maildir) = self.ctx.maildir_for(&username) else {
            return self
                .send_tagged(tag, Status::No, "Unable to open mailbox")
                .await;
        };

        if !maildir.exists() {
            if let Err(e) = maildir.initialize() {
                warn!(
                    "{} Failed to initialise maildir for {}: {}",
                    self.log_prefix, username, e
                );
                return self
                    .send_tagged(tag, Status::No, "Unable to open mailbox")
                    .await;
            }
        }

        info!("{} Authenticated as {}", self.log_prefix, username);
        self.log_prefix.set_user(username.clone());
        self.authenticated = Some(username);
        self.maildir = Some(maildir);

        self.send_tagged(
            tag,
            Status::Ok,
            &format!("{} completed", command),
        )
        .await
    }

    fn maildir(&self) -> &Maildir {
        self.maildir.as_ref().expect("maildir accessed before login")
    }

    async fn cmd_select(
        &mut self,
        tag: &str,
        args: &str,
        read_only: bool,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let Some(name) = tokens.string().filter(|n| !n.is_empty()) else {
            return self
                .send_tagged(tag, Status::Bad, "Mailbox name required")
                .await;
        };

        // A failed SELECT leaves no mailbox selected.
        self.selected = None;

        let mailbox =
            match SelectedMailbox::open(self.maildir(), &name, read_only) {
                Ok(mailbox) => mailbox,
                Err(Error::NxMailbox) => {
                    return self
                        .send_tagged(
                            tag,
                            Status::No,
                            "Mailbox does not exist",
                        )
                        .await;
                },
                Err(e) => {
                    warn!(
                        "{} Failed to open mailbox {:?}: {}",
                        self.log_prefix, name, e
                    );
                    return self
                        .send_tagged(
                            tag,
                            Status::No,
                            "Failed to open mailbox",
                        )
                        .await;
                },
            };

        self.send_untagged(&format!("{} EXISTS", mailbox.exists()))
            .await?;
        self.send_untagged(&format!("{} RECENT", mailbox.recent_count()))
            .await?;
        if let Some(first_unseen) = mailbox.first_unseen() {
            self.send_untagged(&format!(
                "OK [UNSEEN {}] First unseen message",
                first_unseen
            ))
            .await?;
        }
        self.send_untagged(&format!(
            "OK [UIDVALIDITY {}] UIDs valid",
            mailbox.uid_validity
        ))
        .await?;
        self.send_untagged(&format!(
            "OK [UIDNEXT {}] Predicted next UID",
            mailbox.uid_next
        ))
        .await?;
        self.send_untagged(
            "FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)",
        )
        .await?;
        self.send_untagged(
            "OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \\Seen \
             \\Draft \\*)] Flags permitted",
        )
        .await?;

        self.selected = Some(mailbox);
        let (command, mode) = if read_only {
            ("EXAMINE", "[READ-ONLY]")
        } else {
            ("SELECT", "[READ-WRITE]")
        };
        self.send_tagged(
            tag,
            Status::Ok,
            &format!("{} {} completed", mode, command),
        )
        .await
    }

    async fn cmd_create(
        &mut self,
        tag: &str,
        args: &str,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let Some(name) = tokens.string().filter(|n| !n.is_empty()) else {
            return self
                .send_tagged(tag, Status::Bad, "Mailbox name required")
                .await;
        };

        match self.maildir().create_mailbox(&name) {
            Ok(()) => {
                self.send_tagged(tag, Status::Ok, "CREATE completed").await
            },
            Err(e) => {
                self.send_tagged(tag, Status::No, &e.to_string()).await
            },
        }
    }

    async fn cmd_delete(
        &mut self,
        tag: &str,
        args: &str,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let Some(name) = tokens.string().filter(|n| !n.is_empty()) else {
            return self
                .send_tagged(tag, Status::Bad, "Mailbox name required")
                .await;
        };

        match self.maildir().delete_mailbox(&name) {
            Ok(()) => {
                // Deleting the selected mailbox implicitly deselects.
                if self
                    .selected
                    .as_ref()
                    .is_some_and(|s| s.name.eq_ignore_ascii_case(&name))
                {
                    self.selected = None;
                }
                self.send_tagged(tag, Status::Ok, "DELETE completed").await
            },
            Err(e) => {
                self.send_tagged(tag, Status::No, &e.to_string()).await
            },
        }
    }

    async fn cmd_rename(
        &mut self,
        tag: &str,
        args: &str,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let (Some(old), Some(new)) = (tokens.string(), tokens.string())
        else {
            return self
                .send_tagged(
                    tag,
                    Status::Bad,
                    "Usage: RENAME old-name new-name",
                )
                .await;
        };

        match self.maildir().rename_mailbox(&old, &new) {
            Ok(()) => {
                self.send_tagged(tag, Status::Ok, "RENAME completed").await
            },
            Err(e) => {
                self.send_tagged(tag, Status::No, &e.to_string()).await
            },
        }
    }

    async fn cmd_list(
        &mut self,
        tag: &str,
        args: &str,
        command: &str,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let _reference = tokens.string().unwrap_or_default();
        let pattern = tokens.string().unwrap_or_else(|| "*".to_owned());

        // An empty pattern asks for the hierarchy delimiter only.
        if pattern.is_empty() {
            self.send_untagged(&format!(
                "{} (\\Noselect) \"/\" \"\"",
                command
            ))
            .await?;
            return self
                .send_tagged(
                    tag,
                    Status::Ok,
                    &format!("{} completed", command),
                )
                .await;
        }

        let all = self.maildir().list_mailboxes("*");
        let matching = self.maildir().list_mailboxes(&pattern);

        for name in &matching {
            let prefix = format!("{}/", name);
            let has_children =
                all.iter().any(|other| other.starts_with(&prefix));
            let attribute = if has_children {
                "\\HasChildren"
            } else {
                "\\HasNoChildren"
            };

            self.send_untagged(&format!(
                "{} ({}) \"/\" {}",
                command,
                attribute,
                syntax::quote_string(name)
            ))
            .await?;
        }

        self.send_tagged(
            tag,
            Status::Ok,
            &format!("{} completed", command),
        )
        .await
    }

    async fn cmd_status(
        &mut self,
        tag: &str,
        args: &str,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let Some(name) = tokens.string().filter(|n| !n.is_empty()) else {
            return self
                .send_tagged(tag, Status::Bad, "Mailbox name required")
                .await;
        };

        let info = match self.maildir().mailbox_info(&name) {
            Ok(info) => info,
            Err(Error::NxMailbox) => {
                return self
                    .send_tagged(tag, Status::No, "Mailbox does not exist")
                    .await;
            },
            Err(e) => {
                warn!(
                    "{} STATUS of {:?} failed: {}",
                    self.log_prefix, name, e
                );
                return self
                    .send_tagged(tag, Status::No, "STATUS failed")
                    .await;
            },
        };

        self.send_untagged(&format!(
            "STATUS {} (MESSAGES {} RECENT {} UNSEEN {} UIDVALIDITY {} \
             UIDNEXT {})",
            syntax::quote_string(&info.name),
            info.exists,
            info.recent,
            info.unseen,
            info.uid_validity,
            info.uid_next,
        ))
        .await?;
        self.send_tagged(tag, Status::Ok, "STATUS completed").await
    }

    async fn cmd_close(&mut self, tag: &str) -> Result<(), Error> {
        let mailbox = self.selected.take().expect("CLOSE without selection");
        if !mailbox.read_only {
            // CLOSE expunges without reporting the removals.
            for seq in mailbox.deleted_seqs_descending() {
                let unique_id =
                    &mailbox.messages[seq as usize - 1].unique_id;
                if let Err(e) = self
                    .maildir()
                    .delete_message(unique_id, &mailbox.name)
                {
                    warn!(
                        "{} Failed to expunge {} during CLOSE: {}",
                        self.log_prefix, unique_id, e
                    );
                }
            }
        }

        self.send_tagged(tag, Status::Ok, "CLOSE completed").await
    }

    async fn cmd_expunge(&mut self, tag: &str) -> Result<(), Error> {
        if self.selected.as_ref().is_some_and(|s| s.read_only) {
            return self
                .send_tagged(tag, Status::No, "Mailbox is read-only")
                .await;
        }

        let mailbox = self.selected.take().expect("EXPUNGE without selection");
        for seq in mailbox.deleted_seqs_descending() {
            let unique_id = &mailbox.messages[seq as usize - 1].unique_id;
            match self.maildir().delete_message(unique_id, &mailbox.name) {
                Ok(()) => {
                    self.send_untagged(&format!("{} EXPUNGE", seq)).await?;
                },
                Err(e) => warn!(
                    "{} Failed to expunge {}: {}",
                    self.log_prefix, unique_id, e
                ),
            }
        }

        // Rebuild the cached view; sequence numbers have shifted.
        match SelectedMailbox::open(self.maildir(), &mailbox.name, false) {
            Ok(reopened) => self.selected = Some(reopened),
            Err(e) => {
                warn!(
                    "{} Failed to reload {} after EXPUNGE: {}",
                    self.log_prefix, mailbox.name, e
                );
                return self
                    .send_tagged(tag, Status::No, "EXPUNGE failed")
                    .await;
            },
        }

        self.send_tagged(tag, Status::Ok, "EXPUNGE completed").await
    }

    async fn cmd_search(
        &mut self,
        tag: &str,
        args: &str,
        uid_mode: bool,
    ) -> Result<(), Error> {
        let Some(keys) = syntax::parse_search_keys(args) else {
            return self
                .send_tagged(tag, Status::Bad, "Invalid search criteria")
                .await;
        };

        let mailbox = self.selected.as_ref().expect("SEARCH without selection");
        let mut results: Vec<u32> = mailbox
            .search(self.maildir.as_ref().unwrap(), &keys)
            .iter()
            .map(|m| if uid_mode { m.uid } else { m.seq })
            .collect();

        results.truncate(self.ctx.config.imap.max_search_results);

        let mut line = "SEARCH".to_owned();
        for result in &results {
            line.push(' ');
            line.push_str(&result.to_string());
        }
        self.send_untagged(&line).await?;

        self.send_tagged(
            tag,
            Status::Ok,
            if uid_mode {
                "UID SEARCH completed"
            } else {
                "SEARCH completed"
            },
        )
        .await
    }

    async fn cmd_fetch(
        &mut self,
        tag: &str,
        args: &str,
        uid_mode: bool,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let Some(set) =
            tokens.atom().and_then(|s| syntax::SequenceSet::parse(&s))
        else {
            return self
                .send_tagged(tag, Status::Bad, "Invalid sequence set")
                .await;
        };

        let Some(mut items) = syntax::parse_fetch_items(tokens.remainder())
        else {
            return self
                .send_tagged(tag, Status::Bad, "Invalid fetch items")
                .await;
        };

        // UID FETCH implicitly includes the UID item.
        if uid_mode && !items.contains(&FetchItem::Uid) {
            items.insert(0, FetchItem::Uid);
        }

        let seqs = self
            .selected
            .as_ref()
            .expect("FETCH without selection")
            .resolve(&set, uid_mode);

        for seq in seqs {
            let response = self.fetch_one(seq, &items)?;
            self.io.write_all(&response).await?;
        }

        self.send_tagged(
            tag,
            Status::Ok,
            if uid_mode {
                "UID FETCH completed"
            } else {
                "FETCH completed"
            },
        )
        .await
    }

    /// Builds the `* <seq> FETCH (...)` response for one message.
    fn fetch_one(
        &mut self,
        seq: u32,
        items: &[FetchItem],
    ) -> Result<Vec<u8>, Error> {
        let needs_content = items.iter().any(|item| {
            matches!(
                item,
                FetchItem::Envelope
                    | FetchItem::Rfc822Header
                    | FetchItem::Rfc822
                    | FetchItem::Rfc822Text
                    | FetchItem::Body { .. }
            )
        });

        let sets_seen = items.iter().any(|item| {
            matches!(
                item,
                FetchItem::Rfc822
                    | FetchItem::Rfc822Text
                    | FetchItem::Body { peek: false, .. }
            )
        });

        // A non-peek body fetch sets \Seen before the item data is
        // rendered, so a FLAGS item in the same command observes it.
        let read_only =
            self.selected.as_ref().is_some_and(|s| s.read_only);
        if sets_seen && !read_only {
            let maildir = self.maildir.as_ref().unwrap();
            let already_seen = self
                .selected
                .as_ref()
                .unwrap()
                .by_seq(seq)
                .is_some_and(|m| m.flags.contains(&Flag::Seen));
            if !already_seen {
                if let Err(e) = self
                    .selected
                    .as_mut()
                    .unwrap()
                    .store_flags(maildir, seq, |old| {
                        let mut new = old.clone();
                        new.insert(Flag::Seen);
                        new
                    })
                {
                    warn!(
                        "{} Failed to set \\Seen on {}: {}",
                        self.log_prefix, seq, e
                    );
                }
            }
        }

        let mailbox = self.selected.as_ref().unwrap();
        let Some(message) = mailbox.by_seq(seq) else {
            return Ok(Vec::new());
        };

        let content = if needs_content {
            match self
                .maildir
                .as_ref()
                .unwrap()
                .message_content(&message.unique_id, &mailbox.name)
            {
                Ok(content) => Some(content),
                Err(e) => {
                    warn!(
                        "{} Failed to read {} for FETCH: {}",
                        self.log_prefix, message.unique_id, e
                    );
                    None
                },
            }
        } else {
            None
        };

        let mut parts: Vec<Vec<u8>> = Vec::new();
        for item in items {
            match item {
                FetchItem::Flags => parts.push(
                    format!(
                        "FLAGS {}",
                        syntax::format_flags(&message.flags, message.recent)
                    )
                    .into_bytes(),
                ),
                FetchItem::Uid => {
                    parts.push(format!("UID {}", message.uid).into_bytes())
                },
                FetchItem::Rfc822Size => parts.push(
                    format!("RFC822.SIZE {}", message.size).into_bytes(),
                ),
                FetchItem::InternalDate => parts.push(
                    format!(
                        "INTERNALDATE {}",
                        syntax::format_internal_date(&message.internal_date)
                    )
                    .into_bytes(),
                ),
                FetchItem::Envelope => {
                    if let Some(ref content) = content {
                        parts.push(
                            format!(
                                "ENVELOPE {}",
                                syntax::format_envelope(&parse_headers(
                                    content
                                ))
                            )
                            .into_bytes(),
                        );
                    }
                },
                // Full MIME structure reporting is not offered; the item
                // parses but produces no data.
                FetchItem::BodyStructure => {},
                FetchItem::Rfc822Header => {
                    if let Some(ref content) = content {
                        parts.push(literal_part(
                            "RFC822.HEADER",
                            &header_block(content),
                        ));
                    }
                },
                FetchItem::Rfc822 => {
                    if let Some(ref content) = content {
                        parts.push(literal_part("RFC822", content));
                    }
                },
                FetchItem::Rfc822Text => {
                    if let Some(ref content) = content {
                        parts.push(literal_part(
                            "RFC822.TEXT",
                            split_headers(content).1,
                        ));
                    }
                },
                FetchItem::Body {
                    section, partial, ..
                } => {
                    if let Some(ref content) = content {
                        let data = section_bytes(content, section);
                        let (label_suffix, data) = match *partial {
                            Some((start, count)) => {
                                let start = start as usize;
                                let end = start
                                    .saturating_add(count as usize)
                                    .min(data.len());
                                let slice = if start >= data.len() {
                                    &[][..]
                                } else {
                                    &data[start..end]
                                };
                                (format!("<{}>", start), slice.to_vec())
                            },
                            None => (String::new(), data),
                        };

                        parts.push(literal_part(
                            &format!(
                                "{}{}",
                                section_label(section),
                                label_suffix
                            ),
                            &data,
                        ));
                    }
                },
            }
        }

        let mut response = format!("* {} FETCH (", seq).into_bytes();
        for (ix, part) in parts.iter().enumerate() {
            if ix > 0 {
                response.push(b' ');
            }
            response.extend_from_slice(part);
        }
        response.extend_from_slice(b")\r\n");
        Ok(response)
    }

    async fn cmd_store(
        &mut self,
        tag: &str,
        args: &str,
        uid_mode: bool,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let Some(set) =
            tokens.atom().and_then(|s| syntax::SequenceSet::parse(&s))
        else {
            return self
                .send_tagged(tag, Status::Bad, "Invalid sequence set")
                .await;
        };

        let Some(action) = syntax::parse_store_action(tokens.remainder())
        else {
            return self
                .send_tagged(tag, Status::Bad, "Invalid STORE action")
                .await;
        };

        if self.selected.as_ref().is_some_and(|s| s.read_only) {
            return self
                .send_tagged(tag, Status::No, "Mailbox is read-only")
                .await;
        }

        let seqs = self
            .selected
            .as_ref()
            .expect("STORE without selection")
            .resolve(&set, uid_mode);

        for seq in seqs {
            let maildir = self.maildir.as_ref().unwrap();
            let result = self
                .selected
                .as_mut()
                .unwrap()
                .store_flags(maildir, seq, |old| match action.mode {
                    StoreMode::Replace => action.flags.clone(),
                    StoreMode::Add => {
                        let mut new = old.clone();
                        new.extend(action.flags.iter().copied());
                        new
                    },
                    StoreMode::Remove => {
                        let mut new = old.clone();
                        for flag in &action.flags {
                            new.remove(flag);
                        }
                        new
                    },
                });

            match result {
                Ok(flags) => {
                    if !action.silent {
                        let feedback = {
                            let mailbox = self.selected.as_ref().unwrap();
                            let message = mailbox.by_seq(seq).unwrap();
                            let uid_item = if uid_mode {
                                format!("UID {} ", message.uid)
                            } else {
                                String::new()
                            };
                            format!(
                                "{} FETCH ({}FLAGS {})",
                                seq,
                                uid_item,
                                syntax::format_flags(
                                    &flags,
                                    message.recent
                                ),
                            )
                        };
                        self.send_untagged(&feedback).await?;
                    }
                },
                Err(e) => warn!(
                    "{} STORE on message {} failed: {}",
                    self.log_prefix, seq, e
                ),
            }
        }

        self.send_tagged(
            tag,
            Status::Ok,
            if uid_mode {
                "UID STORE completed"
            } else {
                "STORE completed"
            },
        )
        .await
    }

    async fn cmd_copy(
        &mut self,
        tag: &str,
        args: &str,
        uid_mode: bool,
    ) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let Some(set) =
            tokens.atom().and_then(|s| syntax::SequenceSet::parse(&s))
        else {
            return self
                .send_tagged(tag, Status::Bad, "Invalid sequence set")
                .await;
        };
        let Some(destination) = tokens.string().filter(|n| !n.is_empty())
        else {
            return self
                .send_tagged(tag, Status::Bad, "Destination required")
                .await;
        };

        let (source, unique_ids) = {
            let mailbox =
                self.selected.as_ref().expect("COPY without selection");
            let unique_ids: Vec<String> = mailbox
                .resolve(&set, uid_mode)
                .into_iter()
                .map(|seq| {
                    mailbox.messages[seq as usize - 1].unique_id.clone()
                })
                .collect();
            (mailbox.name.clone(), unique_ids)
        };

        for unique_id in &unique_ids {
            match self.maildir().copy_message(
                unique_id,
                &source,
                &destination,
            ) {
                Ok(_) => {},
                Err(Error::NxMailbox) => {
                    return self
                        .send_tagged(
                            tag,
                            Status::No,
                            "[TRYCREATE] Mailbox does not exist",
                        )
                        .await;
                },
                Err(e) => {
                    warn!(
                        "{} COPY of {} failed: {}",
                        self.log_prefix, unique_id, e
                    );
                    return self
                        .send_tagged(tag, Status::No, "COPY failed")
                        .await;
                },
            }
        }

        self.send_tagged(
            tag,
            Status::Ok,
            if uid_mode {
                "UID COPY completed"
            } else {
                "COPY completed"
            },
        )
        .await
    }

    async fn cmd_uid(&mut self, tag: &str, args: &str) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(args);
        let Some(command) = tokens.atom().map(|c| c.to_uppercase()) else {
            return self
                .send_tagged(tag, Status::Bad, "Missing UID command")
                .await;
        };

        let rest = tokens.remainder().to_owned();
        match command.as_str() {
            "FETCH" => self.cmd_fetch(tag, &rest, true).await,
            "STORE" => self.cmd_store(tag, &rest, true).await,
            "COPY" => self.cmd_copy(tag, &rest, true).await,
            "SEARCH" => self.cmd_search(tag, &rest, true).await,
            _ => {
                self.send_tagged(tag, Status::Bad, "Unknown UID command")
                    .await
            },
        }
    }

    async fn send_untagged(&mut self, text: &str) -> Result<(), Error> {
        self.io
            .write_all(format!("* {}\r\n", text).as_bytes())
            .await?;
        Ok(())
    }

    async fn send_tagged(
        &mut self,
        tag: &str,
        status: Status,
        text: &str,
    ) -> Result<(), Error> {
        self.io
            .write_all(
                format!("{} {} {}\r\n", tag, status.as_str(), text)
                    .as_bytes(),
            )
            .await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// The header block including its terminating blank line.
fn header_block(content: &[u8]) -> Vec<u8> {
    let (headers, _) = split_headers(content);
    let mut block = headers.to_vec();
    block.extend_from_slice(b"\r\n\r\n");
    block
}

fn section_bytes(content: &[u8], section: &Section) -> Vec<u8> {
    match section {
        Section::Header => header_block(content),
        Section::Text => split_headers(content).1.to_vec(),
        // Unknown specifiers fall back to the whole text.
        Section::Full | Section::Other(_) => content.to_vec(),
    }
}

fn section_label(section: &Section) -> String {
    match section {
        Section::Full => "BODY[]".to_owned(),
        Section::Header => "BODY[HEADER]".to_owned(),
        Section::Text => "BODY[TEXT]".to_owned(),
        Section::Other(other) => format!("BODY[{}]", other),
    }
}

fn literal_part(label: &str, data: &[u8]) -> Vec<u8> {
    let mut part = format!("{} {{{}}}\r\n", label, data.len()).into_bytes();
    part.extend_from_slice(data);
    part
}
