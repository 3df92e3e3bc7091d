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

//! The relay agent: outbound delivery to foreign domains.

pub mod queue;
pub mod transact;

use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpStream;

use crate::context::ServerContext;
use crate::support::dns;

const SMTP_PORT: u16 = 25;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a remote delivery did not happen.
#[derive(Clone, Debug)]
pub struct RelayFailure {
    /// Whether a later retry could plausibly succeed.
    pub transient: bool,
    pub message: String,
}

impl RelayFailure {
    fn transient(message: String) -> Self {
        RelayFailure {
            transient: true,
            message,
        }
    }

    fn permanent(message: String) -> Self {
        RelayFailure {
            transient: false,
            message,
        }
    }
}

/// Delivers `content` to a single foreign `recipient`.
///
/// The recipient's domain is resolved to its MX set (most preferred first,
/// falling back to the domain itself when there are no MX records); each
/// exchanger's addresses are tried in turn until one accepts the message at
/// end-of-data. A permanent rejection from any server ends the attempt; a
/// transient failure moves on to the next candidate.
pub async fn deliver_remote(
    ctx: &ServerContext,
    sender: &str,
    recipient: &str,
    content: &[u8],
) -> Result<(), RelayFailure> {
    let Some(domain) = recipient.rsplit_once('@').map(|(_, d)| d) else {
        return Err(RelayFailure::permanent(format!(
            "Invalid recipient address <{}>",
            recipient
        )));
    };

    let Some(ref resolver) = ctx.resolver else {
        return Err(RelayFailure::transient(
            "No DNS resolver available".to_owned(),
        ));
    };

    let domain = dns::Name::from_str_relaxed(domain).map_err(|e| {
        RelayFailure::permanent(format!(
            "Unresolvable recipient domain {:?}: {}",
            domain, e
        ))
    })?;

    let exchangers =
        dns::mx_hosts(resolver, &domain).await.map_err(|e| {
            RelayFailure::transient(format!(
                "MX lookup for {} failed: {}",
                domain, e
            ))
        })?;

    let mut last_error = format!("No mail exchanger found for {}", domain);

    for exchanger in &exchangers {
        let addresses = match dns::host_addresses(resolver, exchanger).await {
            Ok(addresses) => addresses,
            Err(e) => {
                last_error =
                    format!("Address lookup for {} failed: {}", exchanger, e);
                warn!("{}", last_error);
                continue;
            },
        };

        for address in addresses {
            let connect = tokio::time::timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((address, SMTP_PORT)),
            )
            .await;

            let stream = match connect {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    last_error =
                        format!("Connecting to {} failed: {}", address, e);
                    warn!("{}", last_error);
                    continue;
                },
                Err(_) => {
                    last_error =
                        format!("Connecting to {} timed out", address);
                    warn!("{}", last_error);
                    continue;
                },
            };

            match transact::execute(
                stream,
                &ctx.host_name,
                sender,
                recipient,
                content,
            )
            .await
            {
                Ok(()) => {
                    info!(
                        "Relayed mail from <{}> to <{}> via {} [{}]",
                        sender, recipient, exchanger, address
                    );
                    return Ok(());
                },
                Err(transact::Error::TotalFailure(message)) => {
                    return Err(RelayFailure::permanent(message));
                },
                Err(transact::Error::TryNextServer(message)) => {
                    warn!(
                        "Relay to <{}> via {} [{}] failed: {}",
                        recipient, exchanger, address, message
                    );
                    last_error = message;
                },
            }
        }
    }

    Err(RelayFailure::transient(last_error))
}
