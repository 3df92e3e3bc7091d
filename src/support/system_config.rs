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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Tidemail.
///
/// This is stored in a TOML file, typically
/// `/etc/tidemail/tidemail.toml`, with one table per section.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub pop3: Pop3Config,
    #[serde(default)]
    pub imap: ImapConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    /// The path to the X.509 certificate chain, in PEM format.
    pub certificate: PathBuf,
    /// The path to the TLS private key, in PEM format.
    pub private_key: PathBuf,
    /// Optional CA bundle used to verify client certificates.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// OpenSSL cipher list override.
    #[serde(default)]
    pub ciphers: Option<String>,
    /// Whether to request and verify client certificates.
    #[serde(default)]
    pub verify_client: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StorageConfig {
    /// The directory under which per-domain, per-user Maildirs live.
    #[serde(default = "defaults::maildir_root")]
    pub maildir_root: PathBuf,
    /// Default quota assigned to newly created users, in bytes.
    #[serde(default = "defaults::default_quota")]
    pub default_quota: u64,
    /// Whether missing account directories are created on first delivery.
    #[serde(default = "defaults::yes")]
    pub create_directories: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty StorageConfig failed to parse")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// The path to the SQLite credential database.
    #[serde(default = "defaults::database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty DatabaseConfig failed to parse")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SmtpConfig {
    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,
    #[serde(default = "defaults::smtp_port")]
    pub port: u16,
    /// Message-submission port (authentication always required);
    /// 0 disables the listener.
    #[serde(default = "defaults::submission_port")]
    pub submission_port: u16,
    /// Implicit-TLS port; 0 disables the listener.
    #[serde(default = "defaults::smtps_port")]
    pub tls_port: u16,
    /// The name used in the greeting and in Received headers.
    /// Empty means "use the system host name".
    #[serde(default)]
    pub hostname: String,
    /// Domains considered local in addition to those in the credential
    /// database.
    #[serde(default)]
    pub local_domains: Vec<String>,
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: u64,
    #[serde(default = "defaults::max_recipients")]
    pub max_recipients: usize,
    /// Refuse MAIL FROM until the session has authenticated.
    #[serde(default)]
    pub require_auth: bool,
    /// Accept mail for non-local recipients from unauthenticated sessions.
    #[serde(default)]
    pub allow_relay: bool,
    #[serde(default = "defaults::yes")]
    pub enable_starttls: bool,
    /// Seconds between drains of the outbound retry queue.
    #[serde(default = "defaults::retry_interval")]
    pub retry_interval: u64,
    /// Attempts before a queued message is dropped.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::thread_pool_size")]
    pub thread_pool_size: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty SmtpConfig failed to parse")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Pop3Config {
    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,
    #[serde(default = "defaults::pop3_port")]
    pub port: u16,
    #[serde(default = "defaults::pop3s_port")]
    pub tls_port: u16,
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    #[serde(default = "defaults::yes")]
    pub enable_starttls: bool,
}

impl Default for Pop3Config {
    fn default() -> Self {
        toml::from_str("").expect("empty Pop3Config failed to parse")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ImapConfig {
    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,
    #[serde(default = "defaults::imap_port")]
    pub port: u16,
    #[serde(default = "defaults::imaps_port")]
    pub tls_port: u16,
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    #[serde(default = "defaults::max_search_results")]
    pub max_search_results: usize,
    #[serde(default = "defaults::yes")]
    pub enable_starttls: bool,
    /// Accepted for compatibility; IDLE itself is not implemented.
    #[serde(default)]
    pub enable_idle: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty ImapConfig failed to parse")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "defaults::yes")]
    pub console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty LogConfig failed to parse")
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn yes() -> bool {
        true
    }

    pub fn maildir_root() -> PathBuf {
        PathBuf::from("/var/mail")
    }

    pub fn default_quota() -> u64 {
        100 * 1024 * 1024
    }

    pub fn database_path() -> PathBuf {
        PathBuf::from("/var/lib/tidemail/users.db")
    }

    pub fn bind_address() -> String {
        "0.0.0.0".to_owned()
    }

    pub fn smtp_port() -> u16 {
        25
    }

    pub fn submission_port() -> u16 {
        587
    }

    pub fn smtps_port() -> u16 {
        465
    }

    pub fn pop3_port() -> u16 {
        110
    }

    pub fn pop3s_port() -> u16 {
        995
    }

    pub fn imap_port() -> u16 {
        143
    }

    pub fn imaps_port() -> u16 {
        993
    }

    pub fn max_connections() -> usize {
        1000
    }

    pub fn max_message_size() -> u64 {
        25 * 1024 * 1024
    }

    pub fn max_recipients() -> usize {
        100
    }

    pub fn max_search_results() -> usize {
        1000
    }

    pub fn retry_interval() -> u64 {
        300
    }

    pub fn max_retries() -> u32 {
        5
    }

    pub fn thread_pool_size() -> usize {
        4
    }

    pub fn log_level() -> String {
        "info".to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let config: SystemConfig = toml::from_str("").unwrap();
        assert!(config.tls.is_none());
        assert_eq!(25, config.smtp.port);
        assert_eq!(465, config.smtp.tls_port);
        assert_eq!(110, config.pop3.port);
        assert_eq!(143, config.imap.port);
        assert_eq!(PathBuf::from("/var/mail"), config.storage.maildir_root);
        assert!(!config.smtp.require_auth);
        assert!(!config.smtp.allow_relay);
        assert_eq!("info", config.log.level);
    }

    #[test]
    fn partial_sections_fill_in() {
        let config: SystemConfig = toml::from_str(
            r#"
[smtp]
hostname = "mx.example.com"
local_domains = ["example.com"]
require_auth = true

[storage]
maildir_root = "/srv/mail"
"#,
        )
        .unwrap();

        assert_eq!("mx.example.com", config.smtp.hostname);
        assert_eq!(vec!["example.com".to_owned()], config.smtp.local_domains);
        assert!(config.smtp.require_auth);
        assert_eq!(25, config.smtp.port);
        assert_eq!(PathBuf::from("/srv/mail"), config.storage.maildir_root);
        assert_eq!(1000, config.imap.max_search_results);
    }

    #[test]
    fn tls_section_parses() {
        let config: SystemConfig = toml::from_str(
            r#"
[tls]
certificate = "/etc/tidemail/fullchain.pem"
private_key = "/etc/tidemail/key.pem"
verify_client = false
"#,
        )
        .unwrap();

        let tls = config.tls.unwrap();
        assert_eq!(
            PathBuf::from("/etc/tidemail/fullchain.pem"),
            tls.certificate
        );
        assert!(tls.ca_file.is_none());
        assert!(!tls.verify_client);
    }
}
