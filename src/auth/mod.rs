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

//! The credential service: users and domains in a local SQLite database.
//!
//! Every protocol front-end consults this service for authentication and
//! recipient acceptance. The database itself is small and contended only by
//! short queries, so all access is serialised through one mutex; the WAL
//! journal keeps readers from blocking the occasional writer in other
//! processes (the admin CLI).

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use log::warn;
use openssl::hash::MessageDigest;
use rusqlite::{params, Connection, OptionalExtension};

use crate::support::error::Error;

const PBKDF2_ITERATIONS: usize = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub domain: String,
    pub active: bool,
    pub quota_bytes: i64,
    pub used_bytes: i64,
}

impl User {
    pub fn address(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }
}

/// Splits `local@domain`, requiring both parts to be non-empty. The domain
/// is matched case-insensitively throughout, so it is lowercased here.
pub fn parse_address(address: &str) -> Option<(String, String)> {
    let (local, domain) = address.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some((local.to_owned(), domain.to_ascii_lowercase()))
}

/// Decodes a base64 blob into UTF-8 text.
pub fn decode_base64_utf8(blob: &str) -> Option<String> {
    base64::decode(blob)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Decodes an RFC 4616 PLAIN response: `authzid NUL authcid NUL password`.
/// The authorisation identity must be absent or equal to the
/// authentication identity.
pub fn decode_plain_sasl(blob: &str) -> Option<(String, String)> {
    let decoded = decode_base64_utf8(blob)?;
    let mut parts = decoded.split('\0');
    let (Some(authorise), Some(authenticate), Some(password), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };

    if !authorise.is_empty() && authorise != authenticate {
        return None;
    }

    Some((authenticate.to_owned(), password.to_owned()))
}

pub struct CredentialDb {
    conn: Mutex<Connection>,
}

impl CredentialDb {
    /// Opens (creating if necessary) the credential database at `path`.
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS domains (\
                 id INTEGER PRIMARY KEY,\
                 domain TEXT NOT NULL UNIQUE,\
                 active INTEGER NOT NULL DEFAULT 1\
             );\
             CREATE TABLE IF NOT EXISTS users (\
                 id INTEGER PRIMARY KEY,\
                 username TEXT NOT NULL,\
                 domain TEXT NOT NULL,\
                 password_hash TEXT NOT NULL,\
                 quota_bytes INTEGER NOT NULL,\
                 used_bytes INTEGER NOT NULL DEFAULT 0,\
                 active INTEGER NOT NULL DEFAULT 1,\
                 created_at TEXT NOT NULL,\
                 UNIQUE (username, domain)\
             );",
        )?;

        Ok(CredentialDb {
            conn: Mutex::new(conn),
        })
    }

    /// Verifies `password` for the full address. Unknown users, inactive
    /// users, and malformed addresses all fail the same way.
    pub fn authenticate(&self, address: &str, password: &str) -> bool {
        let Some((local, domain)) = parse_address(address) else {
            return false;
        };

        let conn = self.conn.lock().unwrap();
        let stored: Option<String> = conn
            .query_row(
                "SELECT password_hash FROM users \
                 WHERE username = ?1 AND domain = ?2 AND active = 1",
                params![local, domain],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or_else(|e| {
                warn!("Credential lookup for {} failed: {}", address, e);
                None
            });

        stored.is_some_and(|stored| verify_password(password, &stored))
    }

    pub fn get_user(&self, address: &str) -> Option<User> {
        let (local, domain) = parse_address(address)?;

        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT username, domain, active, quota_bytes, used_bytes \
             FROM users WHERE username = ?1 AND domain = ?2",
            params![local, domain],
            |row| {
                Ok(User {
                    username: row.get(0)?,
                    domain: row.get(1)?,
                    active: row.get(2)?,
                    quota_bytes: row.get(3)?,
                    used_bytes: row.get(4)?,
                })
            },
        )
        .optional()
        .unwrap_or_else(|e| {
            warn!("User lookup for {} failed: {}", address, e);
            None
        })
    }

    /// Creates a user under an existing domain.
    pub fn create_user(
        &self,
        address: &str,
        password: &str,
        quota_bytes: i64,
    ) -> Result<(), Error> {
        let (local, domain) =
            parse_address(address).ok_or(Error::NxUser)?;
        if !self.is_local_domain(&domain) {
            return Err(Error::NxDomain);
        }
        if self.get_user(address).is_some() {
            return Err(Error::UserExists);
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users \
             (username, domain, password_hash, quota_bytes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                local,
                domain,
                hash_password(password)?,
                quota_bytes,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn change_password(
        &self,
        address: &str,
        password: &str,
    ) -> Result<(), Error> {
        let (local, domain) =
            parse_address(address).ok_or(Error::NxUser)?;

        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE users SET password_hash = ?3 \
             WHERE username = ?1 AND domain = ?2",
            params![local, domain, hash_password(password)?],
        )?;

        if changed == 0 {
            Err(Error::NxUser)
        } else {
            Ok(())
        }
    }

    pub fn set_user_active(
        &self,
        address: &str,
        active: bool,
    ) -> Result<(), Error> {
        let (local, domain) =
            parse_address(address).ok_or(Error::NxUser)?;

        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE users SET active = ?3 \
             WHERE username = ?1 AND domain = ?2",
            params![local, domain, active],
        )?;

        if changed == 0 {
            Err(Error::NxUser)
        } else {
            Ok(())
        }
    }

    pub fn list_users(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<User>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT username, domain, active, quota_bytes, used_bytes \
             FROM users WHERE ?1 IS NULL OR domain = ?1 \
             ORDER BY domain, username",
        )?;

        let users = statement
            .query_map(
                params![domain.map(str::to_ascii_lowercase)],
                |row| {
                    Ok(User {
                        username: row.get(0)?,
                        domain: row.get(1)?,
                        active: row.get(2)?,
                        quota_bytes: row.get(3)?,
                        used_bytes: row.get(4)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn create_domain(&self, domain: &str) -> Result<(), Error> {
        let domain = domain.to_ascii_lowercase();
        if self.is_local_domain(&domain) {
            return Err(Error::DomainExists);
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO domains (domain) VALUES (?1)",
            params![domain],
        )?;
        Ok(())
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT 1 FROM domains \
             WHERE domain = ?1 AND active = 1",
            params![domain.to_ascii_lowercase()],
            |_| Ok(()),
        )
        .optional()
        .unwrap_or_else(|e| {
            warn!("Domain lookup for {} failed: {}", domain, e);
            None
        })
        .is_some()
    }

    pub fn list_domains(&self) -> Result<Vec<String>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn
            .prepare("SELECT domain FROM domains ORDER BY domain")?;
        let domains = statement
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(domains)
    }
}

/// Derives `pbkdf2$<iterations>$<salt>$<hash>` from the password with
/// PBKDF2-HMAC-SHA256 and a random salt.
fn hash_password(password: &str) -> Result<String, Error> {
    let mut salt = [0u8; SALT_LEN];
    openssl::rand::rand_bytes(&mut salt)?;

    let mut derived = [0u8; HASH_LEN];
    openssl::pkcs5::pbkdf2_hmac(
        password.as_bytes(),
        &salt,
        PBKDF2_ITERATIONS,
        MessageDigest::sha256(),
        &mut derived,
    )?;

    Ok(format!(
        "pbkdf2${}${}${}",
        PBKDF2_ITERATIONS,
        hex(&salt),
        hex(&derived),
    ))
}

fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some("pbkdf2"), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    let Ok(iterations) = iterations.parse::<usize>() else {
        return false;
    };
    let (Some(salt), Some(expected)) = (unhex(salt), unhex(expected)) else {
        return false;
    };
    if expected.len() != HASH_LEN {
        return false;
    }

    let mut derived = [0u8; HASH_LEN];
    if openssl::pkcs5::pbkdf2_hmac(
        password.as_bytes(),
        &salt,
        iterations,
        MessageDigest::sha256(),
        &mut derived,
    )
    .is_err()
    {
        return false;
    }

    openssl::memcmp::eq(&derived, &expected)
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }

    (0..s.len())
        .step_by(2)
        .map(|ix| u8::from_str_radix(&s[ix..ix + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    struct Setup {
        _root: TempDir,
        db: CredentialDb,
    }

    fn set_up() -> Setup {
        let root = TempDir::new().unwrap();
        let db = CredentialDb::open(&root.path().join("users.db")).unwrap();
        db.create_domain("example.com").unwrap();
        db.create_user("bob@example.com", "hunter2", 1024).unwrap();
        Setup { _root: root, db }
    }

    #[test]
    fn parse_address_cases() {
        assert_eq!(
            Some(("bob".to_owned(), "example.com".to_owned())),
            parse_address("bob@Example.COM")
        );
        assert_eq!(None, parse_address("bob"));
        assert_eq!(None, parse_address("@example.com"));
        assert_eq!(None, parse_address("bob@"));
        assert_eq!(None, parse_address("a@b@c"));
    }

    #[test]
    fn authenticate_good_and_bad() {
        let setup = set_up();
        assert!(setup.db.authenticate("bob@example.com", "hunter2"));
        assert!(!setup.db.authenticate("bob@example.com", "hunter3"));
        assert!(!setup.db.authenticate("eve@example.com", "hunter2"));
        assert!(!setup.db.authenticate("bob", "hunter2"));
    }

    #[test]
    fn inactive_users_cannot_authenticate() {
        let setup = set_up();
        setup.db.set_user_active("bob@example.com", false).unwrap();
        assert!(!setup.db.authenticate("bob@example.com", "hunter2"));
        assert!(!setup.db.get_user("bob@example.com").unwrap().active);
    }

    #[test]
    fn change_password_takes_effect() {
        let setup = set_up();
        setup
            .db
            .change_password("bob@example.com", "correct horse")
            .unwrap();
        assert!(!setup.db.authenticate("bob@example.com", "hunter2"));
        assert!(setup.db.authenticate("bob@example.com", "correct horse"));
    }

    #[test]
    fn duplicate_user_and_missing_domain() {
        let setup = set_up();
        assert!(matches!(
            setup.db.create_user("bob@example.com", "x", 0),
            Err(Error::UserExists)
        ));
        assert!(matches!(
            setup.db.create_user("alice@nowhere.example", "x", 0),
            Err(Error::NxDomain)
        ));
    }

    #[test]
    fn domains_are_case_insensitive() {
        let setup = set_up();
        assert!(setup.db.is_local_domain("EXAMPLE.com"));
        assert!(!setup.db.is_local_domain("other.example"));
        assert!(matches!(
            setup.db.create_domain("Example.Com"),
            Err(Error::DomainExists)
        ));
    }

    #[test]
    fn listings() {
        let setup = set_up();
        setup.db.create_domain("other.example").unwrap();
        setup
            .db
            .create_user("alice@other.example", "x", 2048)
            .unwrap();

        assert_eq!(
            vec!["example.com".to_owned(), "other.example".to_owned()],
            setup.db.list_domains().unwrap()
        );

        let all = setup.db.list_users(None).unwrap();
        assert_eq!(2, all.len());
        assert_eq!("bob@example.com", all[0].address());

        let filtered = setup.db.list_users(Some("other.example")).unwrap();
        assert_eq!(1, filtered.len());
        assert_eq!("alice@other.example", filtered[0].address());
    }

    #[test]
    fn password_hash_format() {
        let hash = hash_password("secret").unwrap();
        assert!(hash.starts_with("pbkdf2$100000$"));
        assert!(verify_password("secret", &hash));
        assert!(!verify_password("not secret", &hash));
        assert!(!verify_password("secret", "garbage"));

        // Two hashes of the same password differ (random salt).
        assert_ne!(hash, hash_password("secret").unwrap());
    }
}
