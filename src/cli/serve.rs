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

//! Server startup: logging, TLS, listeners, and shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::{
    SslAcceptor, SslFiletype, SslMethod, SslVerifyMode,
};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::auth::CredentialDb;
use crate::context::{Context, ServerContext};
use crate::smtp::outbound::queue::RelayQueue;
use crate::support::{
    async_io::ServerIo,
    dns,
    error::Error,
    log_prefix::LogPrefix,
    system_config::{LogConfig, SystemConfig, TlsConfig},
};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// Log via error! and exit with the startup-failure code.
macro_rules! fatal {
    ($($stuff:tt)*) => {{
        error!($($stuff)*);
        std::process::exit(1)
    }}
}

/// Entry point for `tidemail serve`. Exits 0 on signal-initiated shutdown,
/// 1 on startup failure.
pub fn serve(config: SystemConfig) -> ! {
    init_logging(&config.log);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.smtp.thread_pool_size.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => fatal!("Failed to start async runtime: {}", e),
    };

    runtime.block_on(run(config));
}

fn init_logging(config: &LogConfig) {
    let level = match config.level.to_ascii_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warning" | "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "fatal" => log::LevelFilter::Error,
        other => {
            eprintln!(
                "warning: unknown log level {:?}, using info",
                other
            );
            log::LevelFilter::Info
        },
    };

    let encoder = || {
        Box::new(log4rs::encode::pattern::PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        ))
    };

    let mut builder = log4rs::config::Config::builder();
    let mut root = log4rs::config::Root::builder();

    if config.console {
        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(encoder())
            .build();
        builder = builder.appender(
            log4rs::config::Appender::builder()
                .build("stderr", Box::new(stderr)),
        );
        root = root.appender("stderr");
    }

    if let Some(ref path) = config.file {
        match log4rs::append::file::FileAppender::builder()
            .encoder(encoder())
            .build(path)
        {
            Ok(file) => {
                builder = builder.appender(
                    log4rs::config::Appender::builder()
                        .build("file", Box::new(file)),
                );
                root = root.appender("file");
            },
            Err(e) => eprintln!(
                "warning: cannot open log file {}: {}",
                path.display(),
                e
            ),
        }
    }

    let log_config = builder
        .build(root.build(level))
        .expect("log configuration is internally consistent");
    if let Err(e) = log4rs::init_config(log_config) {
        eprintln!("warning: logging unavailable: {}", e);
    }
}

async fn run(config: SystemConfig) -> ! {
    let host_name = if config.smtp.hostname.is_empty() {
        match nix::unistd::gethostname() {
            Ok(name) => match name.into_string() {
                Ok(name) => name,
                Err(_) => fatal!("System host name is not UTF-8"),
            },
            Err(e) => fatal!(
                "Failed to determine host name; you may need to \
                 configure it explicitly: {}",
                e
            ),
        }
    } else {
        config.smtp.hostname.clone()
    };

    let credentials = match CredentialDb::open(&config.database.path) {
        Ok(credentials) => credentials,
        Err(e) => fatal!(
            "Failed to open credential database {}: {}",
            config.database.path.display(),
            e
        ),
    };

    let ssl_acceptor = match config.tls {
        Some(ref tls) => match create_ssl_acceptor(tls) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => fatal!("Failed to set up TLS: {}", e),
        },
        None => {
            info!("No [tls] section; STARTTLS and implicit-TLS ports off");
            None
        },
    };

    let resolver = match dns::system_resolver() {
        Ok(resolver) => Some(resolver),
        Err(e) => {
            warn!("No DNS resolver available, relaying disabled: {}", e);
            None
        },
    };

    let ctx: Context = Arc::new(ServerContext {
        relay_queue: RelayQueue::new(&config.smtp),
        credentials,
        ssl_acceptor,
        resolver,
        host_name,
        config,
    });

    tokio::spawn(RelayQueue::run(Arc::clone(&ctx)));

    let registry = Arc::new(SessionRegistry::default());
    let have_tls = ctx.ssl_acceptor.is_some();

    let mut listeners: Vec<(Protocol, String, u16, bool)> = vec![
        (
            Protocol::SmtpMta,
            ctx.config.smtp.bind_address.clone(),
            ctx.config.smtp.port,
            false,
        ),
        (
            Protocol::SmtpSubmission,
            ctx.config.smtp.bind_address.clone(),
            ctx.config.smtp.submission_port,
            false,
        ),
        (
            Protocol::Pop3,
            ctx.config.pop3.bind_address.clone(),
            ctx.config.pop3.port,
            false,
        ),
        (
            Protocol::Imap,
            ctx.config.imap.bind_address.clone(),
            ctx.config.imap.port,
            false,
        ),
    ];
    if have_tls {
        listeners.extend([
            (
                Protocol::SmtpMta,
                ctx.config.smtp.bind_address.clone(),
                ctx.config.smtp.tls_port,
                true,
            ),
            (
                Protocol::Pop3,
                ctx.config.pop3.bind_address.clone(),
                ctx.config.pop3.tls_port,
                true,
            ),
            (
                Protocol::Imap,
                ctx.config.imap.bind_address.clone(),
                ctx.config.imap.tls_port,
                true,
            ),
        ]);
    }

    for (protocol, bind_address, port, implicit_tls) in listeners {
        if port == 0 {
            continue;
        }

        let listener =
            match TcpListener::bind((bind_address.as_str(), port)).await {
                Ok(listener) => listener,
                Err(e) => fatal!(
                    "Failed to bind {} listener on {}:{}: {}",
                    protocol.name(),
                    bind_address,
                    port,
                    e
                ),
            };

        info!(
            "Listening for {}{} on {}:{}",
            protocol.name(),
            if implicit_tls { "+tls" } else { "" },
            bind_address,
            port
        );

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&ctx),
            Arc::clone(&registry),
            protocol,
            implicit_tls,
        ));
    }

    wait_for_shutdown_signal().await;

    let live = registry.live_sessions();
    info!(
        "Shutting down with {} live session(s){}",
        live.len(),
        if live.is_empty() {
            String::new()
        } else {
            format!(": {}", live.join(", "))
        }
    );
    std::process::exit(0);
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => fatal!("Failed to install signal handler: {}", e),
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Protocol {
    SmtpMta,
    SmtpSubmission,
    Pop3,
    Imap,
}

impl Protocol {
    fn name(self) -> &'static str {
        match self {
            Protocol::SmtpMta => "smtp",
            Protocol::SmtpSubmission => "submission",
            Protocol::Pop3 => "pop3",
            Protocol::Imap => "imap",
        }
    }

    fn max_connections(self, ctx: &ServerContext) -> usize {
        match self {
            Protocol::SmtpMta | Protocol::SmtpSubmission => {
                ctx.config.smtp.max_connections
            },
            Protocol::Pop3 => ctx.config.pop3.max_connections,
            Protocol::Imap => ctx.config.imap.max_connections,
        }
    }
}

/// The process-wide set of live sessions, consulted at shutdown.
#[derive(Default)]
struct SessionRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, String>>,
}

impl SessionRegistry {
    fn register(&self, description: String) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().unwrap().insert(id, description);
        id
    }

    fn unregister(&self, id: u64) {
        self.live.lock().unwrap().remove(&id);
    }

    fn live_sessions(&self) -> Vec<String> {
        self.live.lock().unwrap().values().cloned().collect()
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Context,
    registry: Arc<SessionRegistry>,
    protocol: Protocol,
    implicit_tls: bool,
) {
    let limiter =
        Arc::new(Semaphore::new(protocol.max_connections(&ctx).max(1)));

    loop {
        let (sock, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("{} accept failed: {}", protocol.name(), e);
                continue;
            },
        };

        // Past the connection limit, the socket is closed immediately.
        let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
            warn!(
                "{} connection limit reached, dropping {}",
                protocol.name(),
                peer
            );
            continue;
        };

        let ctx = Arc::clone(&ctx);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let _permit = permit;
            let _ = sock.set_nodelay(true);

            let log_prefix =
                LogPrefix::new(protocol.name(), peer.to_string());
            info!("{} Connection established", log_prefix);

            let session_id = registry
                .register(format!("{}:{}", protocol.name(), peer));

            let mut io = ServerIo::new(sock);
            if implicit_tls {
                let acceptor = ctx
                    .ssl_acceptor
                    .as_ref()
                    .expect("implicit-TLS listener without an acceptor");
                match tokio::time::timeout(
                    TLS_HANDSHAKE_TIMEOUT,
                    io.ssl_accept(acceptor),
                )
                .await
                {
                    Ok(Ok(())) => {
                        info!("{} TLS handshake succeeded", log_prefix)
                    },
                    Ok(Err(e)) => {
                        warn!("{} TLS handshake failed: {}", log_prefix, e);
                        registry.unregister(session_id);
                        return;
                    },
                    Err(_) => {
                        warn!("{} TLS handshake timed out", log_prefix);
                        registry.unregister(session_id);
                        return;
                    },
                }
            }

            match protocol {
                Protocol::SmtpMta => {
                    crate::smtp::server::serve_smtp(
                        io,
                        ctx,
                        log_prefix,
                        peer.ip().to_string(),
                        false,
                    )
                    .await
                },
                Protocol::SmtpSubmission => {
                    crate::smtp::server::serve_smtp(
                        io,
                        ctx,
                        log_prefix,
                        peer.ip().to_string(),
                        true,
                    )
                    .await
                },
                Protocol::Pop3 => {
                    crate::pop3::server::serve_pop3(io, ctx, log_prefix)
                        .await
                },
                Protocol::Imap => {
                    crate::imap::server::serve_imap(io, ctx, log_prefix)
                        .await
                },
            }

            registry.unregister(session_id);
        });
    }
}

fn create_ssl_acceptor(tls: &TlsConfig) -> Result<SslAcceptor, Error> {
    let mut acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    acceptor.set_private_key_file(&tls.private_key, SslFiletype::PEM)?;
    acceptor.set_certificate_chain_file(&tls.certificate)?;
    acceptor.check_private_key()?;

    if let Some(ref ca_file) = tls.ca_file {
        acceptor.set_ca_file(ca_file)?;
    }

    if let Some(ref ciphers) = tls.ciphers {
        acceptor.set_cipher_list(ciphers)?;
    }

    if tls.verify_client {
        acceptor.set_verify(
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        );
    }

    Ok(acceptor.build())
}
