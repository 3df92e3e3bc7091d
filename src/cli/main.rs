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

use std::fs;
use std::path::PathBuf;

use structopt::StructOpt;

use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(name = "tidemail", max_term_width = 80)]
enum Command {
    /// Run the SMTP, POP3 and IMAP services.
    Serve(CommonOptions),
    /// Manage user accounts.
    User(UserSubcommand),
    /// Manage mail domains.
    Domain(DomainSubcommand),
}

#[derive(StructOpt)]
pub(super) struct CommonOptions {
    /// The configuration file
    #[structopt(
        short,
        long,
        parse(from_os_str),
        default_value = "/etc/tidemail/tidemail.toml"
    )]
    config: PathBuf,
}

#[derive(StructOpt)]
enum UserSubcommand {
    /// Create a new user account. The password is read from standard
    /// input.
    Add(UserAddOptions),
    /// List user accounts.
    List(UserListOptions),
}

#[derive(StructOpt)]
pub(super) struct UserAddOptions {
    #[structopt(flatten)]
    common: CommonOptions,

    /// The full address of the new user, e.g. bob@example.com. Its domain
    /// must already exist.
    pub(super) address: String,

    /// Quota in bytes; defaults to the configured default_quota.
    #[structopt(long)]
    pub(super) quota: Option<u64>,
}

#[derive(StructOpt)]
pub(super) struct UserListOptions {
    #[structopt(flatten)]
    common: CommonOptions,

    /// Restrict the listing to one domain.
    #[structopt(long)]
    pub(super) domain: Option<String>,
}

#[derive(StructOpt)]
enum DomainSubcommand {
    /// Register a domain as local.
    Add(DomainAddOptions),
    /// List registered domains.
    List(CommonOptions),
}

#[derive(StructOpt)]
pub(super) struct DomainAddOptions {
    #[structopt(flatten)]
    common: CommonOptions,

    pub(super) domain: String,
}

pub fn main() {
    match Command::from_args() {
        Command::Serve(options) => {
            let config = load_config(&options.config);
            super::serve::serve(config);
        },
        Command::User(UserSubcommand::Add(options)) => {
            let config = load_config(&options.common.config);
            run_admin(super::user::user_add(&config, options));
        },
        Command::User(UserSubcommand::List(options)) => {
            let config = load_config(&options.common.config);
            run_admin(super::user::user_list(&config, options));
        },
        Command::Domain(DomainSubcommand::Add(options)) => {
            let config = load_config(&options.common.config);
            run_admin(super::user::domain_add(&config, options));
        },
        Command::Domain(DomainSubcommand::List(options)) => {
            let config = load_config(&options.config);
            run_admin(super::user::domain_list(&config));
        },
    }
}

fn run_admin(result: Result<(), crate::support::error::Error>) {
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// Loads the configuration, falling back to the defaults when the file is
/// absent. A present-but-invalid file is a hard error.
fn load_config(path: &PathBuf) -> SystemConfig {
    match fs::read_to_string(path) {
        Ok(text) => match toml::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: invalid {}: {}", path.display(), e);
                std::process::exit(1);
            },
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!(
                "warning: {} not found, using defaults",
                path.display()
            );
            SystemConfig::default()
        },
        Err(e) => {
            eprintln!("error: cannot read {}: {}", path.display(), e);
            std::process::exit(1);
        },
    }
}
