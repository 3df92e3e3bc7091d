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

//! One outbound SMTP transaction against an established connection.

use std::time::{Duration, Instant};

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufStream,
};

use crate::smtp::syntax::dot_stuff;

/// How an attempt against a single server ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The transaction failed on this connection, but another server (or a
    /// later retry) may fare better.
    TryNextServer(String),
    /// The mail itself was rejected; trying elsewhere is futile.
    TotalFailure(String),
}

impl Error {
    pub fn message(&self) -> &str {
        match self {
            Error::TryNextServer(m) | Error::TotalFailure(m) => m,
        }
    }
}

const MAX_LINE: usize = 1024;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivers `content` from `sender` to `recipient` over `cxn`, which must be
/// a fresh connection whose greeting has not yet been read.
///
/// The exchange is EHLO (falling back to HELO) → MAIL FROM → RCPT TO →
/// DATA → dot-stuffed content → `.` → QUIT. Success means the server
/// answered 250 at end-of-data.
pub async fn execute(
    cxn: impl AsyncRead + AsyncWrite + Unpin,
    local_host_name: &str,
    sender: &str,
    recipient: &str,
    content: &[u8],
) -> Result<(), Error> {
    let mut tx = Transaction {
        io: BufStream::new(cxn),
        command_deadline: Instant::now() + COMMAND_TIMEOUT,
    };

    // Greeting
    let status = tx.read_status().await?;
    expect_server_ok(status)?;

    // EHLO, falling back to HELO for ancient peers
    tx.send_command(&format!("EHLO {}", local_host_name)).await?;
    match tx.read_status().await? {
        200..=299 => {},
        500..=504 | 550 => {
            tx.send_command(&format!("HELO {}", local_host_name)).await?;
            let status = tx.read_status().await?;
            expect_server_ok(status)?;
        },
        status => expect_server_ok(status)?,
    }

    tx.send_command(&format!("MAIL FROM:<{}>", sender)).await?;
    let status = tx.read_status().await?;
    expect_mail_ok(status)?;

    tx.send_command(&format!("RCPT TO:<{}>", recipient)).await?;
    match tx.read_status().await? {
        250 | 251 => {},
        status => expect_mail_ok(status)?,
    }

    tx.send_command("DATA").await?;
    match tx.read_status().await? {
        354 => {},
        status => {
            expect_mail_ok(status)?;
            return Err(Error::TryNextServer(format!(
                "Unexpected response {} to DATA",
                status
            )));
        },
    }

    tx.extend_deadline_for_transfer(content.len() as u64);
    let body = dot_stuff(content);
    tx.write_raw(&body).await?;
    tx.write_raw(b".\r\n").await?;

    let status = tx.read_status().await?;
    expect_mail_ok(status)?;

    // The QUIT outcome is of no consequence.
    if tx.send_command("QUIT").await.is_ok() {
        let _ = tx.read_status().await;
    }

    Ok(())
}

struct Transaction<C> {
    io: BufStream<C>,
    command_deadline: Instant,
}

impl<C: AsyncRead + AsyncWrite + Unpin> Transaction<C> {
    /// Sends `command` (without line ending), resetting the command
    /// deadline.
    async fn send_command(&mut self, command: &str) -> Result<(), Error> {
        self.command_deadline = Instant::now() + COMMAND_TIMEOUT;

        let io = async {
            self.io.write_all(command.as_bytes()).await?;
            self.io.write_all(b"\r\n").await?;
            self.io.flush().await
        };

        match tokio::time::timeout_at(self.command_deadline.into(), io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::TryNextServer(format!(
                "I/O error sending command: {}",
                e
            ))),
            Err(_) => Err(Error::TryNextServer(
                "Timeout sending command".to_owned(),
            )),
        }
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        let io = async {
            self.io.write_all(data).await?;
            self.io.flush().await
        };

        match tokio::time::timeout_at(self.command_deadline.into(), io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::TryNextServer(format!(
                "I/O error sending data: {}",
                e
            ))),
            Err(_) => {
                Err(Error::TryNextServer("Timeout sending data".to_owned()))
            },
        }
    }

    /// Reads response lines up to and including the final one, returning
    /// the final status code.
    async fn read_status(&mut self) -> Result<u32, Error> {
        for _ in 0..1000 {
            let mut line = Vec::new();
            let read = async {
                (&mut self.io)
                    .take(MAX_LINE as u64)
                    .read_until(b'\n', &mut line)
                    .await
            };

            match tokio::time::timeout_at(self.command_deadline.into(), read)
                .await
            {
                Ok(Ok(0)) => {
                    return Err(Error::TryNextServer(
                        "EOF reading server response".to_owned(),
                    ));
                },
                Ok(Ok(_)) => {},
                Ok(Err(e)) => {
                    return Err(Error::TryNextServer(format!(
                        "I/O error reading server response: {}",
                        e
                    )));
                },
                Err(_) => {
                    return Err(Error::TryNextServer(
                        "Timeout reading server response".to_owned(),
                    ));
                },
            }

            if !line.ends_with(b"\n") {
                return Err(Error::TryNextServer(
                    "Server response line too long".to_owned(),
                ));
            }

            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            let Some((status, last)) = parse_response_line(line) else {
                return Err(Error::TryNextServer(format!(
                    "Bad SMTP response: {:?}",
                    line
                )));
            };

            if last {
                return Ok(status);
            }
        }

        Err(Error::TryNextServer("Too many response lines".to_owned()))
    }

    fn extend_deadline_for_transfer(&mut self, size: u64) {
        // Allow for a 32kbps transfer rate.
        self.command_deadline += Duration::from_millis(size / 4);
    }
}

/// Interprets a status as pertaining to the server itself.
fn expect_server_ok(status: u32) -> Result<(), Error> {
    match status {
        200..=299 => Ok(()),
        _ => Err(Error::TryNextServer(format!(
            "Server unavailable (status {})",
            status
        ))),
    }
}

/// Interprets a status as pertaining to the mail being sent: a 5xx
/// rejection is final, anything else non-2xx is worth another server.
fn expect_mail_ok(status: u32) -> Result<(), Error> {
    match status {
        200..=299 => Ok(()),
        500..=599 => Err(Error::TotalFailure(format!(
            "Mail rejected (status {})",
            status
        ))),
        _ => Err(Error::TryNextServer(format!(
            "Mail failed temporarily (status {})",
            status
        ))),
    }
}

fn parse_response_line(line: &str) -> Option<(u32, bool)> {
    let status = line.get(0..3)?.parse::<u32>().ok()?;
    let last = match line.get(3..4) {
        Some(" ") => true,
        Some("-") => false,
        None => true, // Bare "250" is a valid final response.
        _ => return None,
    };
    Some((status, last))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_line_parsing() {
        assert_eq!(Some((250, true)), parse_response_line("250 OK"));
        assert_eq!(Some((250, false)), parse_response_line("250-SIZE"));
        assert_eq!(Some((220, true)), parse_response_line("220"));
        assert_eq!(None, parse_response_line("2x0 nope"));
        assert_eq!(None, parse_response_line("250?argh"));
        assert_eq!(None, parse_response_line(""));
    }

    async fn read_trimmed(
        io: &mut BufStream<tokio::io::DuplexStream>,
    ) -> String {
        let mut line = String::new();
        io.read_line(&mut line).await.unwrap();
        line.trim_end().to_owned()
    }

    async fn reply(
        io: &mut BufStream<tokio::io::DuplexStream>,
        text: &str,
    ) {
        io.write_all(text.as_bytes()).await.unwrap();
        io.flush().await.unwrap();
    }

    #[tokio::test]
    async fn transaction_against_scripted_server() {
        let (client, server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut io = BufStream::new(server);

            reply(&mut io, "220 peer.example ESMTP\r\n").await;

            assert_eq!("EHLO mx.test.example", read_trimmed(&mut io).await);
            reply(&mut io, "250-peer.example\r\n250 SIZE 1000000\r\n").await;

            assert_eq!(
                "MAIL FROM:<a@example.com>",
                read_trimmed(&mut io).await
            );
            reply(&mut io, "250 OK\r\n").await;

            assert_eq!(
                "RCPT TO:<b@other.example>",
                read_trimmed(&mut io).await
            );
            reply(&mut io, "250 OK\r\n").await;

            assert_eq!("DATA", read_trimmed(&mut io).await);
            reply(&mut io, "354 Go ahead\r\n").await;

            assert_eq!("Subject: Hi", read_trimmed(&mut io).await);
            assert_eq!("", read_trimmed(&mut io).await);
            assert_eq!("..stuffed", read_trimmed(&mut io).await);
            assert_eq!(".", read_trimmed(&mut io).await);
            reply(&mut io, "250 Accepted\r\n").await;

            assert_eq!("QUIT", read_trimmed(&mut io).await);
            reply(&mut io, "221 Bye\r\n").await;
        });

        let result = execute(
            client,
            "mx.test.example",
            "a@example.com",
            "b@other.example",
            b"Subject: Hi\r\n\r\n.stuffed\r\n",
        )
        .await;

        assert_eq!(Ok(()), result);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn permanent_rejection_is_total_failure() {
        let (client, server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut io = BufStream::new(server);
            io.write_all(b"220 peer ESMTP\r\n").await.unwrap();
            io.flush().await.unwrap();

            let mut line = String::new();
            io.read_line(&mut line).await.unwrap(); // EHLO
            io.write_all(b"250 peer\r\n").await.unwrap();
            io.flush().await.unwrap();

            line.clear();
            io.read_line(&mut line).await.unwrap(); // MAIL FROM
            io.write_all(b"550 Nope\r\n").await.unwrap();
            io.flush().await.unwrap();
        });

        let result = execute(
            client,
            "mx.test.example",
            "a@example.com",
            "b@other.example",
            b"x",
        )
        .await;

        assert!(matches!(result, Err(Error::TotalFailure(_))));
    }
}
