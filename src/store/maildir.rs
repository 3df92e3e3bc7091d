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

//! The Maildir message store.
//!
//! One account occupies `<root>/<domain>/<local_part>/`. The account root is
//! itself the INBOX (a `tmp/new/cur` triple); every other folder is a
//! sibling directory named `.` plus the folder name with the `/` hierarchy
//! separator mapped to `.`, carrying its own triple.
//!
//! Delivery is atomic: content is written to `tmp/`, flushed, and renamed
//! into `new/`, so no reader ever observes a partial message. Flags live in
//! the file name suffix (see [`super::filename`]); flag changes are renames,
//! moving the file from `new/` to `cur/` on first touch. Per-folder UID
//! state lives in a `.uidvalidity` file holding two decimal lines,
//! UIDVALIDITY and UIDNEXT.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;

use super::filename::{self, Flag, FlagSet};
use crate::support::error::Error;

pub const INBOX: &str = "INBOX";

/// Folders provisioned alongside the INBOX for a fresh account.
const DEFAULT_FOLDERS: &[&str] = &["Sent", "Drafts", "Trash", "Junk"];

/// A message as seen in a folder listing.
#[derive(Clone, Debug)]
pub struct Message {
    pub unique_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub internal_date: DateTime<Utc>,
    pub flags: FlagSet,
    /// True while the file sits in `new/`; maps to `\Recent`.
    pub recent: bool,
}

#[derive(Clone, Debug)]
pub struct MailboxInfo {
    pub name: String,
    pub exists: usize,
    pub recent: usize,
    pub unseen: usize,
    pub uid_validity: u32,
    pub uid_next: u32,
}

/// Handle on one account's Maildir tree.
///
/// Handles are cheap to construct and hold no open resources; sessions
/// create them per operation or per login as convenient. Concurrent
/// deliveries are safe by construction (unique names plus rename); racing
/// flag renames resolve to whichever rename lands last.
pub struct Maildir {
    account_dir: PathBuf,
    hostname: String,
}

impl Maildir {
    pub fn new(
        root: &Path,
        domain: &str,
        local_part: &str,
        hostname: &str,
    ) -> Self {
        Maildir {
            account_dir: root.join(domain).join(local_part),
            hostname: hostname.to_owned(),
        }
    }

    pub fn account_dir(&self) -> &Path {
        &self.account_dir
    }

    /// Whether the account has been provisioned (INBOX triple present).
    pub fn exists(&self) -> bool {
        self.mailbox_exists(INBOX)
    }

    /// Creates the INBOX and the standard folder set.
    pub fn initialize(&self) -> Result<(), Error> {
        ensure_mailbox_dirs(&self.account_dir)?;
        for folder in DEFAULT_FOLDERS {
            ensure_mailbox_dirs(&self.mailbox_path(folder)?)?;
        }
        Ok(())
    }

    fn mailbox_exists(&self, mailbox: &str) -> bool {
        self.mailbox_path(mailbox).is_ok_and(|path| {
            path.join("cur").is_dir()
                && path.join("new").is_dir()
                && path.join("tmp").is_dir()
        })
    }

    /// Maps a mailbox name to its directory.
    ///
    /// `INBOX` (case-insensitive) and the empty name map to the account
    /// root; anything else maps to `.Name` with `/` replaced by `.`.
    fn mailbox_path(&self, mailbox: &str) -> Result<PathBuf, Error> {
        if is_inbox(mailbox) {
            return Ok(self.account_dir.clone());
        }

        if !is_safe_mailbox_name(mailbox) {
            return Err(Error::UnsafeName);
        }

        let mut dir_name = String::with_capacity(mailbox.len() + 1);
        dir_name.push('.');
        dir_name.extend(
            mailbox.chars().map(|c| if c == '/' { '.' } else { c }),
        );
        Ok(self.account_dir.join(dir_name))
    }

    pub fn create_mailbox(&self, mailbox: &str) -> Result<(), Error> {
        if is_inbox(mailbox) {
            return Ok(());
        }

        if self.mailbox_exists(mailbox) {
            return Err(Error::MailboxExists);
        }

        ensure_mailbox_dirs(&self.mailbox_path(mailbox)?)?;
        Ok(())
    }

    pub fn delete_mailbox(&self, mailbox: &str) -> Result<(), Error> {
        if is_inbox(mailbox) {
            return Err(Error::BadOperationOnInbox);
        }

        if !self.mailbox_exists(mailbox) {
            return Err(Error::NxMailbox);
        }

        fs::remove_dir_all(self.mailbox_path(mailbox)?)?;
        Ok(())
    }

    pub fn rename_mailbox(&self, old: &str, new: &str) -> Result<(), Error> {
        if is_inbox(old) || is_inbox(new) {
            return Err(Error::BadOperationOnInbox);
        }

        if !self.mailbox_exists(old) {
            return Err(Error::NxMailbox);
        }

        if self.mailbox_exists(new) {
            return Err(Error::MailboxExists);
        }

        fs::rename(self.mailbox_path(old)?, self.mailbox_path(new)?)?;
        Ok(())
    }

    /// Lists mailbox names matching `pattern`.
    ///
    /// INBOX is always present and listed first. `*` and `%` match every
    /// folder; any other pattern is a prefix match on the part before its
    /// first `*`.
    pub fn list_mailboxes(&self, pattern: &str) -> Vec<String> {
        let mut folders = Vec::new();

        let entries = match fs::read_dir(&self.account_dir) {
            Ok(entries) => entries,
            Err(_) => return vec![INBOX.to_owned()],
        };

        for entry in entries.flatten() {
            let leaf = entry.file_name();
            let Some(leaf) = leaf.to_str() else { continue };
            let Some(stripped) = leaf.strip_prefix('.') else { continue };
            if stripped.is_empty() || stripped == "." {
                continue;
            }

            let path = entry.path();
            if !path.join("cur").is_dir()
                || !path.join("new").is_dir()
                || !path.join("tmp").is_dir()
            {
                continue;
            }

            let name = stripped.replace('.', "/");
            if pattern_matches(pattern, &name) {
                folders.push(name);
            }
        }

        folders.sort();
        folders.insert(0, INBOX.to_owned());
        folders
    }

    pub fn mailbox_info(&self, mailbox: &str) -> Result<MailboxInfo, Error> {
        let messages = self.list_messages(mailbox)?;
        let (uid_validity, uid_next) = self.uid_state(mailbox)?;

        Ok(MailboxInfo {
            name: if mailbox.is_empty() {
                INBOX.to_owned()
            } else {
                mailbox.to_owned()
            },
            exists: messages.len(),
            recent: messages.iter().filter(|m| m.recent).count(),
            unseen: messages
                .iter()
                .filter(|m| !m.flags.contains(&Flag::Seen))
                .count(),
            uid_validity,
            uid_next,
        })
    }

    /// Delivers `content` into the folder, returning the new `unique_id`.
    ///
    /// The folder must already exist; account provisioning is the caller's
    /// decision (`initialize()`).
    pub fn deliver(
        &self,
        content: &[u8],
        mailbox: &str,
    ) -> Result<String, Error> {
        if !self.mailbox_exists(mailbox) {
            return Err(Error::NxMailbox);
        }

        let path = self.mailbox_path(mailbox)?;
        let unique_id = filename::generate_unique(&self.hostname);
        let tmp_path = path.join("tmp").join(&unique_id);
        let new_path = path.join("new").join(&unique_id);

        let result = (|| {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp_path, &new_path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        Ok(unique_id)
    }

    /// Lists the folder's messages, sorted ascending by modification time.
    ///
    /// Files that cannot be parsed or stat'ed are skipped; they never abort
    /// the listing.
    pub fn list_messages(&self, mailbox: &str) -> Result<Vec<Message>, Error> {
        if !self.mailbox_exists(mailbox) {
            return Err(Error::NxMailbox);
        }

        let path = self.mailbox_path(mailbox)?;
        let mut messages = Vec::new();
        for (dir, recent) in [("cur", false), ("new", true)] {
            let entries = match fs::read_dir(path.join(dir)) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "Skipping unreadable {} of {}: {}",
                        dir,
                        path.display(),
                        e
                    );
                    continue;
                },
            };

            for entry in entries.flatten() {
                if let Some(message) = read_entry(&entry, recent) {
                    messages.push(message);
                }
            }
        }

        messages.sort_by(|a, b| {
            a.internal_date
                .cmp(&b.internal_date)
                .then_with(|| a.unique_id.cmp(&b.unique_id))
        });
        Ok(messages)
    }

    /// Locates a message by unique id, searching `cur/` then `new/`.
    pub fn get_message(
        &self,
        unique_id: &str,
        mailbox: &str,
    ) -> Result<Message, Error> {
        if !self.mailbox_exists(mailbox) {
            return Err(Error::NxMailbox);
        }

        let path = self.mailbox_path(mailbox)?;
        for (dir, recent) in [("cur", false), ("new", true)] {
            let entries = match fs::read_dir(path.join(dir)) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            for entry in entries.flatten() {
                let leaf = entry.file_name();
                let Some(leaf) = leaf.to_str() else { continue };
                if leaf != unique_id
                    && !(leaf.starts_with(unique_id)
                        && leaf[unique_id.len()..].starts_with(':'))
                {
                    continue;
                }

                if let Some(message) = read_entry(&entry, recent) {
                    return Ok(message);
                }
            }
        }

        Err(Error::NxMessage)
    }

    pub fn message_content(
        &self,
        unique_id: &str,
        mailbox: &str,
    ) -> Result<Vec<u8>, Error> {
        let message = self.get_message(unique_id, mailbox)?;
        Ok(fs::read(message.path)?)
    }

    /// Returns the RFC 2822 header block, without the terminating blank
    /// line. A message with no body separator is all headers.
    pub fn message_headers(
        &self,
        unique_id: &str,
        mailbox: &str,
    ) -> Result<Vec<u8>, Error> {
        let content = self.message_content(unique_id, mailbox)?;
        Ok(split_headers(&content).0.to_vec())
    }

    /// Replaces the message's flag set.
    ///
    /// A message still in `new/` is moved to `cur/` as part of the rename.
    /// Renaming a file to its current name is avoided, so the call is
    /// idempotent.
    pub fn set_flags(
        &self,
        unique_id: &str,
        flags: &FlagSet,
        mailbox: &str,
    ) -> Result<(), Error> {
        let message = self.get_message(unique_id, mailbox)?;
        let new_leaf = filename::encode(unique_id, flags);
        let new_path =
            self.mailbox_path(mailbox)?.join("cur").join(&new_leaf);

        if !message.recent && message.path == new_path {
            return Ok(());
        }

        fs::rename(&message.path, &new_path)?;
        Ok(())
    }

    pub fn add_flags(
        &self,
        unique_id: &str,
        flags: &FlagSet,
        mailbox: &str,
    ) -> Result<(), Error> {
        let mut merged = self.get_message(unique_id, mailbox)?.flags;
        merged.extend(flags.iter().copied());
        self.set_flags(unique_id, &merged, mailbox)
    }

    pub fn remove_flags(
        &self,
        unique_id: &str,
        flags: &FlagSet,
        mailbox: &str,
    ) -> Result<(), Error> {
        let mut remaining = self.get_message(unique_id, mailbox)?.flags;
        for flag in flags {
            remaining.remove(flag);
        }
        self.set_flags(unique_id, &remaining, mailbox)
    }

    pub fn delete_message(
        &self,
        unique_id: &str,
        mailbox: &str,
    ) -> Result<(), Error> {
        let message = self.get_message(unique_id, mailbox)?;
        fs::remove_file(message.path)?;
        Ok(())
    }

    /// Copies a message into another folder under a fresh unique id.
    pub fn copy_message(
        &self,
        unique_id: &str,
        from: &str,
        to: &str,
    ) -> Result<String, Error> {
        let content = self.message_content(unique_id, from)?;
        self.deliver(&content, to)
    }

    /// Removes every message whose flags include `\Deleted`, returning the
    /// number removed.
    pub fn expunge(&self, mailbox: &str) -> Result<usize, Error> {
        let mut count = 0;
        for message in self.list_messages(mailbox)? {
            if !message.flags.contains(&Flag::Deleted) {
                continue;
            }

            match fs::remove_file(&message.path) {
                Ok(()) => count += 1,
                // Lost a race with another session; the outcome stands.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(count)
    }

    /// Reads (initialising if needed) the folder's `(UIDVALIDITY, UIDNEXT)`.
    pub fn uid_state(&self, mailbox: &str) -> Result<(u32, u32), Error> {
        if !self.mailbox_exists(mailbox) {
            return Err(Error::NxMailbox);
        }

        let path = self.uid_file_path(mailbox)?;
        if let Some(state) = read_uid_file(&path)? {
            return Ok(state);
        }

        let state = (Utc::now().timestamp() as u32, 1);
        write_uid_file(&path, state)?;
        Ok(state)
    }

    pub fn uid_validity(&self, mailbox: &str) -> Result<u32, Error> {
        Ok(self.uid_state(mailbox)?.0)
    }

    /// Allocates the next UID: returns the current UIDNEXT and persists the
    /// incremented value. UIDs are never reused within a UIDVALIDITY
    /// generation.
    pub fn allocate_uid(&self, mailbox: &str) -> Result<u32, Error> {
        self.allocate_uids(mailbox, 1)
    }

    /// Allocates a contiguous block of `count` UIDs, returning the first.
    pub fn allocate_uids(
        &self,
        mailbox: &str,
        count: u32,
    ) -> Result<u32, Error> {
        let (validity, next) = self.uid_state(mailbox)?;
        write_uid_file(
            &self.uid_file_path(mailbox)?,
            (validity, next.saturating_add(count)),
        )?;
        Ok(next)
    }

    fn uid_file_path(&self, mailbox: &str) -> Result<PathBuf, Error> {
        Ok(self.mailbox_path(mailbox)?.join(".uidvalidity"))
    }
}

fn is_inbox(mailbox: &str) -> bool {
    mailbox.is_empty() || mailbox.eq_ignore_ascii_case(INBOX)
}

fn is_safe_mailbox_name(mailbox: &str) -> bool {
    !mailbox.is_empty()
        && mailbox.len() <= 255
        && mailbox != "."
        && mailbox != ".."
        && !mailbox.contains('\0')
}

fn ensure_mailbox_dirs(path: &Path) -> io::Result<()> {
    for dir in ["cur", "new", "tmp"] {
        fs::create_dir_all(path.join(dir))?;
    }
    Ok(())
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" || pattern == "%" || pattern.is_empty() {
        return true;
    }

    let prefix = pattern.split('*').next().unwrap_or(pattern);
    name.starts_with(prefix)
}

fn read_entry(entry: &fs::DirEntry, recent: bool) -> Option<Message> {
    let leaf = entry.file_name();
    let leaf = leaf.to_str()?;
    // Folder metadata such as .uidvalidity is not a message.
    if leaf.starts_with('.') {
        return None;
    }

    let metadata = entry.metadata().ok()?;
    if !metadata.is_file() {
        return None;
    }

    let parsed = filename::parse(leaf);
    Some(Message {
        unique_id: parsed.unique_id,
        path: entry.path(),
        size: metadata.len(),
        internal_date: metadata.modified().ok()?.into(),
        flags: parsed.flags,
        recent,
    })
}

/// Splits a message into its header block and body, excluding the blank
/// separator line from both.
pub fn split_headers(content: &[u8]) -> (&[u8], &[u8]) {
    if let Some(ix) = find_subslice(content, b"\r\n\r\n") {
        (&content[..ix], &content[ix + 4..])
    } else if let Some(ix) = find_subslice(content, b"\n\n") {
        (&content[..ix], &content[ix + 2..])
    } else {
        (content, &[])
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(haystack, needle)
}

fn read_uid_file(path: &Path) -> Result<Option<(u32, u32)>, Error> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut lines = text.lines();
    let parsed = match (lines.next(), lines.next()) {
        (Some(validity), Some(next)) => validity
            .trim()
            .parse::<u32>()
            .ok()
            .zip(next.trim().parse::<u32>().ok()),
        _ => None,
    };

    if parsed.is_none() {
        // A corrupt file is treated like a missing one; the fresh
        // UIDVALIDITY tells clients to discard their caches.
        warn!("Corrupt {}; resetting UIDVALIDITY", path.display());
    }

    Ok(parsed)
}

fn write_uid_file(path: &Path, (validity, next): (u32, u32)) -> io::Result<()> {
    fs::write(path, format!("{}\n{}\n", validity, next))
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    struct Setup {
        _root: TempDir,
        maildir: Maildir,
    }

    fn set_up() -> Setup {
        let root = TempDir::new().unwrap();
        let maildir = Maildir::new(
            root.path(),
            "example.com",
            "bob",
            "mx.example.com",
        );
        maildir.initialize().unwrap();
        Setup {
            _root: root,
            maildir,
        }
    }

    fn flag_set(flags: &[Flag]) -> FlagSet {
        flags.iter().copied().collect()
    }

    #[test]
    fn initialize_creates_standard_folders() {
        let setup = set_up();
        assert!(setup.maildir.exists());

        let mailboxes = setup.maildir.list_mailboxes("*");
        assert_eq!(
            vec!["INBOX", "Drafts", "Junk", "Sent", "Trash"],
            mailboxes
        );
    }

    #[test]
    fn deliver_lands_in_new() {
        let setup = set_up();
        let uid = setup
            .maildir
            .deliver(b"Subject: Hi\r\n\r\nHello\r\n", INBOX)
            .unwrap();

        let messages = setup.maildir.list_messages(INBOX).unwrap();
        assert_eq!(1, messages.len());
        assert_eq!(uid, messages[0].unique_id);
        assert!(messages[0].recent);
        assert!(messages[0].flags.is_empty());
        assert_eq!(22, messages[0].size);

        assert_eq!(
            b"Subject: Hi\r\n\r\nHello\r\n".to_vec(),
            setup.maildir.message_content(&uid, INBOX).unwrap()
        );
        assert_eq!(
            b"Subject: Hi".to_vec(),
            setup.maildir.message_headers(&uid, INBOX).unwrap()
        );
    }

    #[test]
    fn deliver_to_missing_folder_fails() {
        let setup = set_up();
        assert!(matches!(
            setup.maildir.deliver(b"x", "NoSuchFolder"),
            Err(Error::NxMailbox)
        ));
        // And nothing was left behind anywhere.
        assert!(setup.maildir.list_messages(INBOX).unwrap().is_empty());
    }

    #[test]
    fn set_flags_moves_to_cur_and_round_trips() {
        let setup = set_up();
        let uid = setup.maildir.deliver(b"x", INBOX).unwrap();

        let flags = flag_set(&[Flag::Seen, Flag::Flagged]);
        setup.maildir.set_flags(&uid, &flags, INBOX).unwrap();

        let message = setup.maildir.get_message(&uid, INBOX).unwrap();
        assert!(!message.recent);
        assert_eq!(flags, message.flags);
        assert!(message
            .path
            .to_str()
            .unwrap()
            .ends_with(&format!("cur/{}:2,FS", uid)));

        // Idempotent: setting the same set again is a no-op.
        setup.maildir.set_flags(&uid, &flags, INBOX).unwrap();
        assert_eq!(
            flags,
            setup.maildir.get_message(&uid, INBOX).unwrap().flags
        );
    }

    #[test]
    fn add_and_remove_flags() {
        let setup = set_up();
        let uid = setup.maildir.deliver(b"x", INBOX).unwrap();

        setup
            .maildir
            .add_flags(&uid, &flag_set(&[Flag::Seen]), INBOX)
            .unwrap();
        setup
            .maildir
            .add_flags(&uid, &flag_set(&[Flag::Deleted]), INBOX)
            .unwrap();
        assert_eq!(
            flag_set(&[Flag::Seen, Flag::Deleted]),
            setup.maildir.get_message(&uid, INBOX).unwrap().flags
        );

        setup
            .maildir
            .remove_flags(&uid, &flag_set(&[Flag::Seen]), INBOX)
            .unwrap();
        assert_eq!(
            flag_set(&[Flag::Deleted]),
            setup.maildir.get_message(&uid, INBOX).unwrap().flags
        );
    }

    #[test]
    fn expunge_removes_only_deleted() {
        let setup = set_up();
        let keep = setup.maildir.deliver(b"keep", INBOX).unwrap();
        let kill = setup.maildir.deliver(b"kill", INBOX).unwrap();
        setup
            .maildir
            .add_flags(&kill, &flag_set(&[Flag::Deleted]), INBOX)
            .unwrap();

        assert_eq!(1, setup.maildir.expunge(INBOX).unwrap());

        let messages = setup.maildir.list_messages(INBOX).unwrap();
        assert_eq!(1, messages.len());
        assert_eq!(keep, messages[0].unique_id);

        assert!(matches!(
            setup.maildir.get_message(&kill, INBOX),
            Err(Error::NxMessage)
        ));
    }

    #[test]
    fn uid_allocation_is_monotonic() {
        let setup = set_up();
        let (validity, next) = setup.maildir.uid_state(INBOX).unwrap();
        assert_eq!(1, next);

        assert_eq!(1, setup.maildir.allocate_uid(INBOX).unwrap());
        assert_eq!(2, setup.maildir.allocate_uid(INBOX).unwrap());
        assert_eq!(3, setup.maildir.allocate_uids(INBOX, 4).unwrap());
        assert_eq!((validity, 7), setup.maildir.uid_state(INBOX).unwrap());

        // Validity is fixed at folder creation.
        assert_eq!(validity, setup.maildir.uid_validity(INBOX).unwrap());
    }

    #[test]
    fn uid_state_is_per_folder() {
        let setup = set_up();
        setup.maildir.allocate_uid(INBOX).unwrap();
        assert_eq!(1, setup.maildir.uid_state("Sent").unwrap().1);
        assert_eq!(2, setup.maildir.uid_state(INBOX).unwrap().1);
    }

    #[test]
    fn mailbox_crud() {
        let setup = set_up();

        setup.maildir.create_mailbox("Archive/2024").unwrap();
        assert!(setup
            .maildir
            .account_dir()
            .join(".Archive.2024")
            .join("cur")
            .is_dir());
        assert!(setup
            .maildir
            .list_mailboxes("*")
            .contains(&"Archive/2024".to_owned()));

        assert!(matches!(
            setup.maildir.create_mailbox("Archive/2024"),
            Err(Error::MailboxExists)
        ));

        setup
            .maildir
            .rename_mailbox("Archive/2024", "Archive/2025")
            .unwrap();
        assert!(!setup
            .maildir
            .list_mailboxes("*")
            .contains(&"Archive/2024".to_owned()));

        setup.maildir.delete_mailbox("Archive/2025").unwrap();
        assert!(matches!(
            setup.maildir.delete_mailbox("Archive/2025"),
            Err(Error::NxMailbox)
        ));
    }

    #[test]
    fn inbox_is_protected() {
        let setup = set_up();
        assert!(setup.maildir.create_mailbox("INBOX").is_ok());
        assert!(matches!(
            setup.maildir.delete_mailbox("INBOX"),
            Err(Error::BadOperationOnInbox)
        ));
        assert!(matches!(
            setup.maildir.rename_mailbox("INBOX", "Other"),
            Err(Error::BadOperationOnInbox)
        ));
        assert!(matches!(
            setup.maildir.rename_mailbox("Sent", "inbox"),
            Err(Error::BadOperationOnInbox)
        ));
    }

    #[test]
    fn list_mailboxes_pattern_is_prefix_match() {
        let setup = set_up();
        setup.maildir.create_mailbox("Archive").unwrap();

        assert_eq!(
            vec!["INBOX", "Archive", "Drafts", "Junk", "Sent", "Trash"],
            setup.maildir.list_mailboxes("*")
        );
        assert_eq!(
            vec!["INBOX", "Sent"],
            setup.maildir.list_mailboxes("Se*")
        );
        assert_eq!(vec!["INBOX"], setup.maildir.list_mailboxes("Zzz*"));
    }

    #[test]
    fn copy_message_gets_fresh_id() {
        let setup = set_up();
        let uid = setup.maildir.deliver(b"hello", INBOX).unwrap();
        let copy = setup.maildir.copy_message(&uid, INBOX, "Sent").unwrap();

        assert_ne!(uid, copy);
        assert_eq!(
            b"hello".to_vec(),
            setup.maildir.message_content(&copy, "Sent").unwrap()
        );
        // The original is untouched.
        assert!(setup.maildir.get_message(&uid, INBOX).is_ok());
    }

    #[test]
    fn listing_skips_uidvalidity_file() {
        let setup = set_up();
        setup.maildir.uid_state(INBOX).unwrap();
        setup.maildir.deliver(b"x", INBOX).unwrap();
        assert_eq!(1, setup.maildir.list_messages(INBOX).unwrap().len());
    }

    #[test]
    fn mailbox_info_counts() {
        let setup = set_up();
        let a = setup.maildir.deliver(b"a", INBOX).unwrap();
        setup.maildir.deliver(b"b", INBOX).unwrap();
        setup
            .maildir
            .add_flags(&a, &flag_set(&[Flag::Seen]), INBOX)
            .unwrap();

        let info = setup.maildir.mailbox_info(INBOX).unwrap();
        assert_eq!(2, info.exists);
        assert_eq!(1, info.recent);
        assert_eq!(1, info.unseen);
        assert_eq!(1, info.uid_next);
    }

    #[test]
    fn unsafe_mailbox_names_are_rejected() {
        let setup = set_up();
        assert!(matches!(
            setup.maildir.create_mailbox(".."),
            Err(Error::UnsafeName)
        ));
        assert!(matches!(
            setup.maildir.create_mailbox("bad\0name"),
            Err(Error::UnsafeName)
        ));
    }

    #[test]
    fn split_headers_variants() {
        assert_eq!(
            (&b"A: 1"[..], &b"body"[..]),
            split_headers(b"A: 1\r\n\r\nbody")
        );
        assert_eq!(
            (&b"A: 1"[..], &b"body"[..]),
            split_headers(b"A: 1\n\nbody")
        );
        assert_eq!((&b"A: 1\r\n"[..], &b""[..]), split_headers(b"A: 1\r\n"));
    }
}
