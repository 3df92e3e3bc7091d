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

use std::sync::Arc;

use openssl::ssl::SslAcceptor;

use crate::auth::CredentialDb;
use crate::smtp::outbound::queue::RelayQueue;
use crate::store::Maildir;
use crate::support::{dns, system_config::SystemConfig};

/// Everything a session needs, constructed once at startup and injected
/// into every connection. There is no process-global state.
pub struct ServerContext {
    pub config: SystemConfig,
    pub credentials: CredentialDb,
    pub ssl_acceptor: Option<SslAcceptor>,
    pub resolver: Option<dns::Resolver>,
    pub relay_queue: RelayQueue,
    /// The name used in greetings and Received headers.
    pub host_name: String,
}

impl ServerContext {
    /// Whether mail for `domain` is accepted locally, either via the static
    /// configuration or the credential database.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.config
            .smtp
            .local_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
            || self.credentials.is_local_domain(domain)
    }

    /// A Maildir handle for the given account.
    pub fn maildir(&self, domain: &str, local_part: &str) -> Maildir {
        Maildir::new(
            &self.config.storage.maildir_root,
            domain,
            local_part,
            &self.host_name,
        )
    }

    /// A Maildir handle for an authenticated full address, if well-formed.
    pub fn maildir_for(&self, address: &str) -> Option<Maildir> {
        let (local, domain) = crate::auth::parse_address(address)?;
        Some(self.maildir(&domain, &local))
    }

    pub fn starttls_available(&self, enabled: bool) -> bool {
        enabled && self.ssl_acceptor.is_some()
    }
}

pub type Context = Arc<ServerContext>;

/// Builds a context suitable for tests: throwaway storage and credential
/// database, no TLS, no resolver.
#[cfg(test)]
pub fn test_context(
    root: &std::path::Path,
    config: SystemConfig,
) -> Context {
    test_context_tls(root, config, None)
}

#[cfg(test)]
pub fn test_context_tls(
    root: &std::path::Path,
    config: SystemConfig,
    ssl_acceptor: Option<SslAcceptor>,
) -> Context {
    let mut config = config;
    config.storage.maildir_root = root.join("mail");
    std::fs::create_dir_all(&config.storage.maildir_root).unwrap();

    let credentials = CredentialDb::open(&root.join("users.db")).unwrap();

    Arc::new(ServerContext {
        relay_queue: RelayQueue::new(&config.smtp),
        config,
        credentials,
        ssl_acceptor,
        resolver: None,
        host_name: "mx.test.example".to_owned(),
    })
}
