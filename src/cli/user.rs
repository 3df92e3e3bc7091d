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

//! User and domain administration against the credential database.

use std::io::{self, BufRead, Write};

use super::main::{DomainAddOptions, UserAddOptions, UserListOptions};
use crate::auth::CredentialDb;
use crate::support::{error::Error, system_config::SystemConfig};

pub(super) fn user_add(
    config: &SystemConfig,
    options: UserAddOptions,
) -> Result<(), Error> {
    let db = CredentialDb::open(&config.database.path)?;

    eprint!("Password for {}: ", options.address);
    io::stderr().flush()?;
    let mut password = String::new();
    io::stdin().lock().read_line(&mut password)?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        eprintln!("error: empty password");
        std::process::exit(1);
    }

    let quota = options
        .quota
        .unwrap_or(config.storage.default_quota);
    db.create_user(&options.address, password, quota as i64)?;
    println!("Created {}", options.address);
    Ok(())
}

pub(super) fn user_list(
    config: &SystemConfig,
    options: UserListOptions,
) -> Result<(), Error> {
    let db = CredentialDb::open(&config.database.path)?;
    for user in db.list_users(options.domain.as_deref())? {
        println!(
            "{}\tquota={}\tused={}\t{}",
            user.address(),
            user.quota_bytes,
            user.used_bytes,
            if user.active { "active" } else { "disabled" },
        );
    }
    Ok(())
}

pub(super) fn domain_add(
    config: &SystemConfig,
    options: DomainAddOptions,
) -> Result<(), Error> {
    let db = CredentialDb::open(&config.database.path)?;
    db.create_domain(&options.domain)?;
    println!("Created {}", options.domain.to_ascii_lowercase());
    Ok(())
}

pub(super) fn domain_list(config: &SystemConfig) -> Result<(), Error> {
    let db = CredentialDb::open(&config.database.path)?;
    for domain in db.list_domains()? {
        println!("{}", domain);
    }
    Ok(())
}
