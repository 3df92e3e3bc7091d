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

use std::net::IpAddr;

use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use rand::seq::SliceRandom;

pub use hickory_resolver::Name;

pub type Resolver = hickory_resolver::TokioAsyncResolver;

/// Creates a resolver from the system configuration
/// (`/etc/resolv.conf` or platform equivalent).
pub fn system_resolver() -> Result<Resolver, ResolveError> {
    Resolver::tokio_from_system_conf()
}

/// Returns the mail exchangers for `domain`, most preferred first.
///
/// A domain with no MX records at all falls back to the domain itself, as a
/// single implicit record at preference 0. Equal-preference records are
/// tried in a random order.
pub async fn mx_hosts(
    resolver: &Resolver,
    domain: &Name,
) -> Result<Vec<Name>, ResolveError> {
    let mut records = match resolver.mx_lookup(domain.clone()).await {
        Ok(lookup) => lookup
            .iter()
            .map(|mx| (mx.preference(), mx.exchange().clone()))
            .collect::<Vec<_>>(),
        Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
            Vec::new()
        },
        Err(e) => return Err(e),
    };

    if records.is_empty() {
        return Ok(vec![domain.clone()]);
    }

    // The shuffle spreads load across equal-preference exchangers; the
    // stable sort preserves it within each preference level.
    records.shuffle(&mut rand::thread_rng());
    records.sort_by_key(|&(preference, _)| preference);
    Ok(records.into_iter().map(|(_, name)| name).collect())
}

/// Resolves `host` to the addresses an outbound connection should try.
pub async fn host_addresses(
    resolver: &Resolver,
    host: &Name,
) -> Result<Vec<IpAddr>, ResolveError> {
    let lookup = resolver.lookup_ip(host.clone()).await?;
    Ok(lookup.iter().collect())
}
