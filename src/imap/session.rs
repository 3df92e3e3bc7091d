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

//! The per-SELECT cached mailbox view.
//!
//! On SELECT the session loads every message in mtime order, assigns 1-based
//! sequence numbers, and consumes one UID per message from the folder's
//! persistent UIDNEXT. Within the session's lifetime the seq↔UID maps are a
//! bijection; sequence numbers shift on EXPUNGE (which therefore reports in
//! descending order), UIDs never do.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;

use super::syntax::{SearchKey, SequenceSet};
use crate::store::{Flag, FlagSet, Maildir};
use crate::support::error::Error;

#[derive(Clone, Debug)]
pub struct CachedMessage {
    pub seq: u32,
    pub uid: u32,
    pub unique_id: String,
    pub size: u64,
    pub flags: FlagSet,
    pub recent: bool,
    pub internal_date: DateTime<Utc>,
}

pub struct SelectedMailbox {
    pub name: String,
    pub read_only: bool,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub messages: Vec<CachedMessage>,
    uid_to_seq: HashMap<u32, u32>,
}

impl SelectedMailbox {
    /// Opens `name`, loading the message list and allocating UIDs for it.
    pub fn open(
        maildir: &Maildir,
        name: &str,
        read_only: bool,
    ) -> Result<Self, Error> {
        let listed = maildir.list_messages(name)?;

        let first_uid = if listed.is_empty() {
            0
        } else {
            maildir.allocate_uids(name, listed.len() as u32)?
        };
        let (uid_validity, uid_next) = maildir.uid_state(name)?;

        let mut messages = Vec::with_capacity(listed.len());
        let mut uid_to_seq = HashMap::with_capacity(listed.len());
        for (ix, message) in listed.into_iter().enumerate() {
            let seq = ix as u32 + 1;
            let uid = first_uid + ix as u32;
            uid_to_seq.insert(uid, seq);
            messages.push(CachedMessage {
                seq,
                uid,
                unique_id: message.unique_id,
                size: message.size,
                flags: message.flags,
                recent: message.recent,
                internal_date: message.internal_date,
            });
        }

        Ok(SelectedMailbox {
            name: name.to_owned(),
            read_only,
            uid_validity,
            uid_next,
            messages,
            uid_to_seq,
        })
    }

    pub fn exists(&self) -> usize {
        self.messages.len()
    }

    pub fn recent_count(&self) -> usize {
        self.messages.iter().filter(|m| m.recent).count()
    }

    pub fn unseen_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.flags.contains(&Flag::Seen))
            .count()
    }

    /// Sequence number of the first unseen message, if any.
    pub fn first_unseen(&self) -> Option<u32> {
        self.messages
            .iter()
            .find(|m| !m.flags.contains(&Flag::Seen))
            .map(|m| m.seq)
    }

    pub fn max_seq(&self) -> u32 {
        self.messages.len() as u32
    }

    pub fn max_uid(&self) -> u32 {
        self.messages.last().map(|m| m.uid).unwrap_or(0)
    }

    pub fn by_seq(&self, seq: u32) -> Option<&CachedMessage> {
        if seq == 0 {
            return None;
        }
        self.messages.get(seq as usize - 1)
    }

    pub fn uid_of(&self, seq: u32) -> Option<u32> {
        self.by_seq(seq).map(|m| m.uid)
    }

    pub fn seq_of(&self, uid: u32) -> Option<u32> {
        self.uid_to_seq.get(&uid).copied()
    }

    /// Resolves a sequence set into ascending sequence numbers, matching
    /// against UIDs instead when `uid_mode` is set.
    pub fn resolve(
        &self,
        set: &SequenceSet,
        uid_mode: bool,
    ) -> Vec<u32> {
        self.messages
            .iter()
            .filter(|m| {
                if uid_mode {
                    set.contains(m.uid, self.max_uid())
                } else {
                    set.contains(m.seq, self.max_seq())
                }
            })
            .map(|m| m.seq)
            .collect()
    }

    /// Records the outcome of a flag mutation in the cache.
    pub fn update_flags(&mut self, seq: u32, flags: FlagSet) {
        if let Some(message) = self.messages.get_mut(seq as usize - 1) {
            message.flags = flags;
        }
    }

    /// Applies a STORE outcome to the store and the cache, returning the
    /// new flag set.
    pub fn store_flags(
        &mut self,
        maildir: &Maildir,
        seq: u32,
        compute: impl FnOnce(&FlagSet) -> FlagSet,
    ) -> Result<FlagSet, Error> {
        let message = self.by_seq(seq).ok_or(Error::NxMessage)?;
        let new_flags = compute(&message.flags);
        maildir.set_flags(&message.unique_id, &new_flags, &self.name)?;
        self.update_flags(seq, new_flags.clone());
        Ok(new_flags)
    }

    /// The sequence numbers of `\Deleted` messages, in descending order:
    /// the order EXPUNGE must report them so that each number is valid at
    /// the moment of its emission.
    pub fn deleted_seqs_descending(&self) -> Vec<u32> {
        let mut seqs: Vec<u32> = self
            .messages
            .iter()
            .filter(|m| m.flags.contains(&Flag::Deleted))
            .map(|m| m.seq)
            .collect();
        seqs.sort_unstable_by(|a, b| b.cmp(a));
        seqs
    }

    /// Evaluates a search program over the cached view. Content-dependent
    /// keys read the message lazily, at most once per message.
    pub fn search(
        &self,
        maildir: &Maildir,
        keys: &[SearchKey],
    ) -> Vec<&CachedMessage> {
        self.messages
            .iter()
            .filter(|message| {
                let mut content = LazyContent::new(
                    maildir,
                    &self.name,
                    &message.unique_id,
                );
                keys.iter().all(|key| {
                    self.matches(message, key, &mut content)
                })
            })
            .collect()
    }

    fn matches(
        &self,
        message: &CachedMessage,
        key: &SearchKey,
        content: &mut LazyContent<'_>,
    ) -> bool {
        let has = |flag: Flag| message.flags.contains(&flag);

        match key {
            SearchKey::All => true,
            SearchKey::Answered => has(Flag::Answered),
            SearchKey::Deleted => has(Flag::Deleted),
            SearchKey::Draft => has(Flag::Draft),
            SearchKey::Flagged => has(Flag::Flagged),
            SearchKey::Seen => has(Flag::Seen),
            SearchKey::Unanswered => !has(Flag::Answered),
            SearchKey::Undeleted => !has(Flag::Deleted),
            SearchKey::Undraft => !has(Flag::Draft),
            SearchKey::Unflagged => !has(Flag::Flagged),
            SearchKey::Unseen => !has(Flag::Seen),
            SearchKey::Recent => message.recent,
            SearchKey::Old => !message.recent,
            SearchKey::New => message.recent && !has(Flag::Seen),
            SearchKey::From(needle) => {
                content.header_contains("From", needle)
            },
            SearchKey::To(needle) => content.header_contains("To", needle),
            SearchKey::Cc(needle) => content.header_contains("Cc", needle),
            SearchKey::Bcc(needle) => {
                content.header_contains("Bcc", needle)
            },
            SearchKey::Subject(needle) => {
                content.header_contains("Subject", needle)
            },
            SearchKey::Header(name, needle) => {
                content.header_contains(name, needle)
            },
            SearchKey::Body(needle) => content.body_contains(needle),
            SearchKey::Text(needle) => content.text_contains(needle),
            // Only the system flags exist; no keyword ever matches.
            SearchKey::Keyword(_) => false,
            SearchKey::Unkeyword(_) => true,
            SearchKey::Larger(n) => message.size > *n,
            SearchKey::Smaller(n) => message.size < *n,
            SearchKey::Before(date) => {
                message.internal_date.date_naive() < *date
            },
            SearchKey::On(date) => {
                message.internal_date.date_naive() == *date
            },
            SearchKey::Since(date) => {
                message.internal_date.date_naive() >= *date
            },
            SearchKey::Uid(set) => {
                set.contains(message.uid, self.max_uid())
            },
            SearchKey::SeqSet(set) => {
                set.contains(message.seq, self.max_seq())
            },
            SearchKey::Not(inner) => {
                !self.matches(message, inner, content)
            },
            SearchKey::Or(a, b) => {
                self.matches(message, a, content)
                    || self.matches(message, b, content)
            },
            SearchKey::And(keys) => keys
                .iter()
                .all(|key| self.matches(message, key, content)),
        }
    }
}

/// Parses an RFC 2822 header block into `(name, value)` pairs, joining
/// folded continuation lines.
pub fn parse_headers(content: &[u8]) -> Vec<(String, String)> {
    let (header_block, _) = crate::store::maildir::split_headers(content);
    let text = String::from_utf8_lossy(header_block);

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim_start());
            }
            continue;
        }

        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }

    headers
}

/// Message content read on demand during a search, shared across the keys
/// evaluated for one message.
struct LazyContent<'a> {
    maildir: &'a Maildir,
    mailbox: &'a str,
    unique_id: &'a str,
    content: Option<Option<Vec<u8>>>,
}

impl<'a> LazyContent<'a> {
    fn new(maildir: &'a Maildir, mailbox: &'a str, unique_id: &'a str) -> Self {
        LazyContent {
            maildir,
            mailbox,
            unique_id,
            content: None,
        }
    }

    fn content(&mut self) -> Option<&[u8]> {
        if self.content.is_none() {
            let read = match self
                .maildir
                .message_content(self.unique_id, self.mailbox)
            {
                Ok(content) => Some(content),
                Err(e) => {
                    warn!(
                        "Failed to read {} during search: {}",
                        self.unique_id, e
                    );
                    None
                },
            };
            self.content = Some(read);
        }

        self.content.as_ref().unwrap().as_deref()
    }

    fn header_contains(&mut self, name: &str, needle: &str) -> bool {
        let Some(content) = self.content() else { return false };
        let needle = needle.to_lowercase();
        parse_headers(content)
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .any(|(_, value)| value.to_lowercase().contains(&needle))
    }

    fn body_contains(&mut self, needle: &str) -> bool {
        let Some(content) = self.content() else { return false };
        let (_, body) = crate::store::maildir::split_headers(content);
        String::from_utf8_lossy(body)
            .to_lowercase()
            .contains(&needle.to_lowercase())
    }

    fn text_contains(&mut self, needle: &str) -> bool {
        let Some(content) = self.content() else { return false };
        String::from_utf8_lossy(content)
            .to_lowercase()
            .contains(&needle.to_lowercase())
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::store::INBOX;

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

    fn deliver_n(maildir: &Maildir, n: usize) -> Vec<String> {
        (0..n)
            .map(|ix| {
                maildir
                    .deliver(
                        format!(
                            "Subject: m{}\r\nFrom: sender{}@example.com\
                             \r\n\r\nbody {}\r\n",
                            ix, ix, ix
                        )
                        .as_bytes(),
                        INBOX,
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn open_assigns_sequential_uids() {
        let setup = set_up();
        deliver_n(&setup.maildir, 3);

        let mailbox =
            SelectedMailbox::open(&setup.maildir, INBOX, false).unwrap();
        assert_eq!(3, mailbox.exists());
        assert_eq!(3, mailbox.recent_count());
        assert_eq!(3, mailbox.unseen_count());
        assert_eq!(4, mailbox.uid_next);

        for (ix, message) in mailbox.messages.iter().enumerate() {
            assert_eq!(ix as u32 + 1, message.seq);
            assert_eq!(ix as u32 + 1, message.uid);
        }
    }

    #[test]
    fn seq_uid_bijection() {
        let setup = set_up();
        deliver_n(&setup.maildir, 4);

        let mailbox =
            SelectedMailbox::open(&setup.maildir, INBOX, false).unwrap();
        for message in &mailbox.messages {
            assert_eq!(
                Some(message.uid),
                mailbox.uid_of(mailbox.seq_of(message.uid).unwrap())
            );
            assert_eq!(
                Some(message.seq),
                mailbox.seq_of(mailbox.uid_of(message.seq).unwrap())
            );
        }
    }

    #[test]
    fn reselect_consumes_fresh_uids() {
        let setup = set_up();
        deliver_n(&setup.maildir, 2);

        let first =
            SelectedMailbox::open(&setup.maildir, INBOX, false).unwrap();
        assert_eq!(vec![1, 2], first
            .messages
            .iter()
            .map(|m| m.uid)
            .collect::<Vec<_>>());

        let second =
            SelectedMailbox::open(&setup.maildir, INBOX, false).unwrap();
        // Strictly increasing, never reused.
        assert_eq!(vec![3, 4], second
            .messages
            .iter()
            .map(|m| m.uid)
            .collect::<Vec<_>>());
        assert_eq!(5, second.uid_next);
        assert_eq!(first.uid_validity, second.uid_validity);
    }

    #[test]
    fn resolve_by_seq_and_uid() {
        let setup = set_up();
        deliver_n(&setup.maildir, 5);

        let mailbox =
            SelectedMailbox::open(&setup.maildir, INBOX, false).unwrap();

        let set = SequenceSet::parse("2:3,5").unwrap();
        assert_eq!(vec![2, 3, 5], mailbox.resolve(&set, false));
        assert_eq!(vec![2, 3, 5], mailbox.resolve(&set, true));

        let star = SequenceSet::parse("4:*").unwrap();
        assert_eq!(vec![4, 5], mailbox.resolve(&star, false));
    }

    #[test]
    fn store_flags_round_trip() {
        let setup = set_up();
        deliver_n(&setup.maildir, 1);

        let mut mailbox =
            SelectedMailbox::open(&setup.maildir, INBOX, false).unwrap();
        let flags = mailbox
            .store_flags(&setup.maildir, 1, |old| {
                let mut new = old.clone();
                new.insert(Flag::Seen);
                new
            })
            .unwrap();

        assert!(flags.contains(&Flag::Seen));
        assert!(mailbox.by_seq(1).unwrap().flags.contains(&Flag::Seen));
        assert!(setup
            .maildir
            .get_message(&mailbox.by_seq(1).unwrap().unique_id, INBOX)
            .unwrap()
            .flags
            .contains(&Flag::Seen));
    }

    #[test]
    fn deleted_seqs_come_out_descending() {
        let setup = set_up();
        deliver_n(&setup.maildir, 5);

        let mut mailbox =
            SelectedMailbox::open(&setup.maildir, INBOX, false).unwrap();
        for seq in [2u32, 4] {
            mailbox
                .store_flags(&setup.maildir, seq, |old| {
                    let mut new = old.clone();
                    new.insert(Flag::Deleted);
                    new
                })
                .unwrap();
        }

        assert_eq!(vec![4, 2], mailbox.deleted_seqs_descending());
    }

    #[test]
    fn search_on_flags_and_content() {
        let setup = set_up();
        deliver_n(&setup.maildir, 3);

        let mut mailbox =
            SelectedMailbox::open(&setup.maildir, INBOX, false).unwrap();
        mailbox
            .store_flags(&setup.maildir, 2, |old| {
                let mut new = old.clone();
                new.insert(Flag::Seen);
                new
            })
            .unwrap();

        let seqs = |keys: &str| -> Vec<u32> {
            mailbox
                .search(
                    &setup.maildir,
                    &super::super::syntax::parse_search_keys(keys).unwrap(),
                )
                .iter()
                .map(|m| m.seq)
                .collect()
        };

        assert_eq!(vec![1, 2, 3], seqs("ALL"));
        assert_eq!(vec![2], seqs("SEEN"));
        assert_eq!(vec![1, 3], seqs("UNSEEN"));
        assert_eq!(vec![1], seqs("SUBJECT m0"));
        assert_eq!(vec![2], seqs("FROM sender1"));
        assert_eq!(vec![2], seqs("BODY \"body 1\""));
        assert_eq!(vec![1, 3], seqs("NOT SEEN"));
        assert_eq!(vec![1, 2], seqs("OR SEEN SUBJECT m0"));
        assert_eq!(vec![1, 2, 3], seqs("TEXT example.com"));
        assert_eq!(vec![2, 3], seqs("UID 2:3"));
        assert!(seqs("KEYWORD custom").is_empty());
    }

    #[test]
    fn header_parsing_with_folding() {
        let headers = parse_headers(
            b"Subject: a long\r\n subject line\r\nFrom: x@y\r\n\r\nbody",
        );
        assert_eq!(
            vec![
                (
                    "Subject".to_owned(),
                    "a long subject line".to_owned()
                ),
                ("From".to_owned(), "x@y".to_owned()),
            ],
            headers
        );
    }
}
