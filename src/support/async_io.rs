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

use std::io;
use std::mem;
use std::pin::Pin;
use std::task;
use std::time::{Duration, Instant};

use openssl::ssl::{Ssl, SslAcceptor};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_openssl::SslStream;

use crate::support::error::Error;

/// The byte channel for one server connection.
///
/// A `ServerIo` starts out as a cleartext TCP stream and can be switched to
/// TLS in place by `ssl_accept()`, after which all reads and writes go
/// through the encrypted channel over the same socket. Sessions observe the
/// switch through `is_ssl()`.
pub struct ServerIo(Io);

enum Io {
    Plain(TcpStream),
    Ssl(Box<SslStream<TcpStream>>),
    /// Transitional state during the handshake. A session that fails the
    /// handshake is torn down, so I/O in this state only reports an error.
    Handshaking,
}

impl ServerIo {
    pub fn new(stream: TcpStream) -> Self {
        ServerIo(Io::Plain(stream))
    }

    pub fn is_ssl(&self) -> bool {
        matches!(self.0, Io::Ssl(_))
    }

    /// Describes the negotiated TLS session, or `None` in cleartext mode.
    pub fn ssl_string(&self) -> Option<String> {
        match self.0 {
            Io::Plain(_) | Io::Handshaking => None,
            Io::Ssl(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{}:{}:{}",
                    ssl.version_str(),
                    cipher.map_or("NONE", |c| c.name()),
                    cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Performs the server-side TLS handshake with the given acceptor.
    ///
    /// The caller must have flushed its ready reply before calling this; the
    /// next bytes on the wire belong to the handshake. On failure the
    /// channel is unusable and the session must close.
    pub async fn ssl_accept(
        &mut self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        let Io::Plain(stream) = mem::replace(&mut self.0, Io::Handshaking)
        else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS handshake requested on a non-cleartext channel",
            )));
        };

        let ssl = Ssl::new(acceptor.context())?;
        let mut stream = Box::new(SslStream::new(ssl, stream)?);
        Pin::new(&mut *stream)
            .accept()
            .await
            .map_err(ssl_to_error)?;

        self.0 = Io::Ssl(stream);
        Ok(())
    }
}

fn ssl_to_error(e: openssl::ssl::Error) -> Error {
    match e.into_io_error() {
        Ok(io) => Error::Io(io),
        Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
    }
}

fn not_connected() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "I/O attempted during TLS handshake",
    )
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        match self.get_mut().0 {
            Io::Plain(ref mut s) => Pin::new(s).poll_read(ctx, buf),
            Io::Ssl(ref mut s) => Pin::new(&mut **s).poll_read(ctx, buf),
            Io::Handshaking => task::Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        match self.get_mut().0 {
            Io::Plain(ref mut s) => Pin::new(s).poll_write(ctx, buf),
            Io::Ssl(ref mut s) => Pin::new(&mut **s).poll_write(ctx, buf),
            Io::Handshaking => task::Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        match self.get_mut().0 {
            Io::Plain(ref mut s) => Pin::new(s).poll_flush(ctx),
            Io::Ssl(ref mut s) => Pin::new(&mut **s).poll_flush(ctx),
            Io::Handshaking => task::Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        match self.get_mut().0 {
            Io::Plain(ref mut s) => Pin::new(s).poll_shutdown(ctx),
            Io::Ssl(ref mut s) => Pin::new(&mut **s).poll_shutdown(ctx),
            Io::Handshaking => task::Poll::Ready(Err(not_connected())),
        }
    }
}

/// The default idle deadline for a freshly accepted connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs until either the deadline channel is closed or the current deadline
/// has expired. Sessions push a new deadline before every read and after
/// every flushed write; racing this against the session future force-closes
/// idle connections.
pub async fn idle_timer(mut deadline_rx: mpsc::Receiver<Instant>) {
    let mut deadline = Instant::now() + DEFAULT_IDLE_TIMEOUT;

    loop {
        match tokio::time::timeout_at(deadline.into(), deadline_rx.recv()).await
        {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}
