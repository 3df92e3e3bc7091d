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

//! Parsers for IMAP command arguments, and the encoders for the response
//! side. The grammar here is the pragmatic dialect the session speaks:
//! atoms, quoted strings, parenthesized lists, sequence sets, fetch items,
//! search keys and store actions. Literals (`{n}`) are not accepted on the
//! command line; the only command that needs them is APPEND, which is not
//! supported.

use chrono::{DateTime, NaiveDate, Utc};

use crate::store::{Flag, FlagSet};

/// A parsed command line: tag, uppercased command name, raw arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub tag: String,
    pub name: String,
    pub arguments: String,
}

pub fn parse_command_line(line: &str) -> Option<CommandLine> {
    let line = line.trim_start_matches(' ');
    let (tag, rest) = line.split_once(' ')?;
    if tag.is_empty() || tag.contains(['*', '%', '"', '\\']) {
        return None;
    }

    let rest = rest.trim_start_matches(' ');
    let (name, arguments) = match rest.split_once(' ') {
        Some((name, arguments)) => (name, arguments),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }

    Some(CommandLine {
        tag: tag.to_owned(),
        name: name.to_uppercase(),
        arguments: arguments.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Sequence sets

/// A comma-separated set of `a`, `a:b` ranges. `*` is the highest sequence
/// number (or UID) present, resolved at evaluation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceSet {
    /// `u32::MAX` encodes `*`.
    ranges: Vec<(u32, u32)>,
}

impl SequenceSet {
    pub fn parse(s: &str) -> Option<Self> {
        let mut ranges = Vec::new();
        for token in s.split(',') {
            let (start, end) = match token.split_once(':') {
                Some((start, end)) => {
                    (parse_seq_number(start)?, parse_seq_number(end)?)
                },
                None => {
                    let n = parse_seq_number(token)?;
                    (n, n)
                },
            };
            ranges.push((start, end));
        }

        if ranges.is_empty() {
            return None;
        }
        Some(SequenceSet { ranges })
    }

    /// Whether `value` falls in the set, with `*` taken as `highest`.
    /// Reversed bounds are tolerated.
    pub fn contains(&self, value: u32, highest: u32) -> bool {
        let resolve =
            |n: u32| if n == u32::MAX { highest } else { n };

        self.ranges.iter().any(|&(start, end)| {
            let (start, end) = (resolve(start), resolve(end));
            let (lo, hi) = if start <= end {
                (start, end)
            } else {
                (end, start)
            };
            value >= lo && value <= hi
        })
    }
}

fn parse_seq_number(token: &str) -> Option<u32> {
    if token == "*" {
        return Some(u32::MAX);
    }
    token.parse::<u32>().ok().filter(|&n| n > 0)
}

// ---------------------------------------------------------------------------
// Fetch items

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Section {
    /// `BODY[]`, the entire message.
    Full,
    /// `BODY[HEADER]`
    Header,
    /// `BODY[TEXT]`
    Text,
    /// An unrecognised section specifier, served as the full text.
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchItem {
    Flags,
    Uid,
    Rfc822Size,
    InternalDate,
    Envelope,
    BodyStructure,
    Rfc822Header,
    Rfc822,
    Rfc822Text,
    Body {
        section: Section,
        peek: bool,
        partial: Option<(u32, u32)>,
    },
}

/// Parses a fetch item list: a single atom or a parenthesized list, with
/// the `ALL`/`FAST`/`FULL` macros expanded.
pub fn parse_fetch_items(s: &str) -> Option<Vec<FetchItem>> {
    let s = s.trim();
    let inner = match s.strip_prefix('(') {
        Some(rest) => rest.strip_suffix(')')?,
        None => s,
    };

    let mut items = Vec::new();
    for token in split_outside_brackets(inner) {
        match token.to_uppercase().as_str() {
            "ALL" => items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
            ]),
            "FAST" => items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
            ]),
            "FULL" => items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
                FetchItem::Body {
                    section: Section::Full,
                    peek: true,
                    partial: None,
                },
            ]),
            "FLAGS" => items.push(FetchItem::Flags),
            "UID" => items.push(FetchItem::Uid),
            "RFC822.SIZE" => items.push(FetchItem::Rfc822Size),
            "INTERNALDATE" => items.push(FetchItem::InternalDate),
            "ENVELOPE" => items.push(FetchItem::Envelope),
            "BODYSTRUCTURE" => items.push(FetchItem::BodyStructure),
            "RFC822.HEADER" => items.push(FetchItem::Rfc822Header),
            "RFC822" => items.push(FetchItem::Rfc822),
            "RFC822.TEXT" => items.push(FetchItem::Rfc822Text),
            "BODY" => items.push(FetchItem::Body {
                section: Section::Full,
                peek: false,
                partial: None,
            }),
            _ => items.push(parse_body_item(&token)?),
        }
    }

    if items.is_empty() {
        return None;
    }
    Some(items)
}

/// Splits on spaces that are not inside `[...]`, so section specifiers like
/// `BODY[HEADER.FIELDS (FROM TO)]` stay in one token.
fn split_outside_brackets(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in s.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            },
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            },
            ' ' if depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            },
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parses `BODY[section]<start.count>` and the `.PEEK` variant.
fn parse_body_item(token: &str) -> Option<FetchItem> {
    let upper = token.to_uppercase();
    let (peek, rest) = if let Some(rest) = upper.strip_prefix("BODY.PEEK[") {
        (true, rest)
    } else if let Some(rest) = upper.strip_prefix("BODY[") {
        (false, rest)
    } else {
        return None;
    };

    let close = rest.find(']')?;
    let section = match &rest[..close] {
        "" => Section::Full,
        "HEADER" => Section::Header,
        "TEXT" => Section::Text,
        other => Section::Other(other.to_owned()),
    };

    let tail = &rest[close + 1..];
    let partial = if tail.is_empty() {
        None
    } else {
        let inner = tail.strip_prefix('<')?.strip_suffix('>')?;
        let (start, count) = inner.split_once('.')?;
        Some((start.parse().ok()?, count.parse().ok()?))
    };

    Some(FetchItem::Body {
        section,
        peek,
        partial,
    })
}

// ---------------------------------------------------------------------------
// Search keys

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchKey {
    All,
    Answered,
    Deleted,
    Draft,
    Flagged,
    New,
    Old,
    Recent,
    Seen,
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unseen,
    From(String),
    To(String),
    Cc(String),
    Bcc(String),
    Subject(String),
    Body(String),
    Text(String),
    Header(String, String),
    Keyword(String),
    Unkeyword(String),
    Larger(u64),
    Smaller(u64),
    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    Uid(SequenceSet),
    SeqSet(SequenceSet),
    Not(Box<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    And(Vec<SearchKey>),
}

/// Parses a full search program: a sequence of keys, implicitly ANDed.
pub fn parse_search_keys(s: &str) -> Option<Vec<SearchKey>> {
    let mut tokens = Tokenizer::new(s);
    let mut keys = Vec::new();
    while !tokens.at_end() {
        keys.push(parse_search_key(&mut tokens)?);
    }

    if keys.is_empty() {
        return None;
    }
    Some(keys)
}

fn parse_search_key(tokens: &mut Tokenizer) -> Option<SearchKey> {
    if tokens.peek_char() == Some('(') {
        tokens.expect_char('(')?;
        let mut group = Vec::new();
        while tokens.peek_char() != Some(')') {
            group.push(parse_search_key(tokens)?);
        }
        tokens.expect_char(')')?;
        return Some(SearchKey::And(group));
    }

    let word = tokens.atom()?;
    let key = match word.to_uppercase().as_str() {
        "ALL" => SearchKey::All,
        "ANSWERED" => SearchKey::Answered,
        "DELETED" => SearchKey::Deleted,
        "DRAFT" => SearchKey::Draft,
        "FLAGGED" => SearchKey::Flagged,
        "NEW" => SearchKey::New,
        "OLD" => SearchKey::Old,
        "RECENT" => SearchKey::Recent,
        "SEEN" => SearchKey::Seen,
        "UNANSWERED" => SearchKey::Unanswered,
        "UNDELETED" => SearchKey::Undeleted,
        "UNDRAFT" => SearchKey::Undraft,
        "UNFLAGGED" => SearchKey::Unflagged,
        "UNSEEN" => SearchKey::Unseen,
        "FROM" => SearchKey::From(tokens.string()?),
        "TO" => SearchKey::To(tokens.string()?),
        "CC" => SearchKey::Cc(tokens.string()?),
        "BCC" => SearchKey::Bcc(tokens.string()?),
        "SUBJECT" => SearchKey::Subject(tokens.string()?),
        "BODY" => SearchKey::Body(tokens.string()?),
        "TEXT" => SearchKey::Text(tokens.string()?),
        "HEADER" => {
            let name = tokens.string()?;
            let value = tokens.string()?;
            SearchKey::Header(name, value)
        },
        "KEYWORD" => SearchKey::Keyword(tokens.string()?),
        "UNKEYWORD" => SearchKey::Unkeyword(tokens.string()?),
        "LARGER" => SearchKey::Larger(tokens.atom()?.parse().ok()?),
        "SMALLER" => SearchKey::Smaller(tokens.atom()?.parse().ok()?),
        "BEFORE" => SearchKey::Before(parse_date(&tokens.string()?)?),
        "ON" => SearchKey::On(parse_date(&tokens.string()?)?),
        "SINCE" => SearchKey::Since(parse_date(&tokens.string()?)?),
        "UID" => SearchKey::Uid(SequenceSet::parse(&tokens.atom()?)?),
        "NOT" => SearchKey::Not(Box::new(parse_search_key(tokens)?)),
        "OR" => {
            let a = parse_search_key(tokens)?;
            let b = parse_search_key(tokens)?;
            SearchKey::Or(Box::new(a), Box::new(b))
        },
        _ => SearchKey::SeqSet(SequenceSet::parse(&word)?),
    };

    Some(key)
}

// ---------------------------------------------------------------------------
// Store actions

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    Replace,
    Add,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreAction {
    pub mode: StoreMode,
    /// `.SILENT` suppresses the untagged FLAGS feedback.
    pub silent: bool,
    pub flags: FlagSet,
}

/// Parses `FLAGS|+FLAGS|-FLAGS[.SILENT] (flag ...)`.
pub fn parse_store_action(s: &str) -> Option<StoreAction> {
    let s = s.trim();
    let (word, rest) = match s.split_once(' ') {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    };

    let word = word.to_uppercase();
    let (word, silent) = match word.strip_suffix(".SILENT") {
        Some(word) => (word, true),
        None => (word.as_str(), false),
    };

    let mode = match word {
        "FLAGS" => StoreMode::Replace,
        "+FLAGS" => StoreMode::Add,
        "-FLAGS" => StoreMode::Remove,
        _ => return None,
    };

    let inner = match rest.strip_prefix('(') {
        Some(inner) => inner.strip_suffix(')')?,
        None => rest,
    };

    let mut flags = FlagSet::new();
    for word in inner.split(' ').filter(|w| !w.is_empty()) {
        flags.insert(word.parse::<Flag>().ok()?);
    }

    Some(StoreAction {
        mode,
        silent,
        flags,
    })
}

// ---------------------------------------------------------------------------
// Atoms, strings, quoting

/// A cursor over an argument string, handing out atoms, quoted strings and
/// single characters.
pub struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Tokenizer { input, pos: 0 }
    }

    fn skip_spaces(&mut self) {
        while self.input[self.pos..].starts_with(' ') {
            self.pos += 1;
        }
    }

    pub fn at_end(&mut self) -> bool {
        self.skip_spaces();
        self.pos >= self.input.len()
    }

    pub fn peek_char(&mut self) -> Option<char> {
        self.skip_spaces();
        self.input[self.pos..].chars().next()
    }

    pub fn expect_char(&mut self, expected: char) -> Option<()> {
        if self.peek_char() == Some(expected) {
            self.pos += expected.len_utf8();
            Some(())
        } else {
            None
        }
    }

    /// The next space/paren-delimited word.
    pub fn atom(&mut self) -> Option<String> {
        self.skip_spaces();
        let rest = &self.input[self.pos..];
        let end = rest
            .find([' ', '(', ')'])
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }

        self.pos += end;
        Some(rest[..end].to_owned())
    }

    /// The next quoted string or atom.
    pub fn string(&mut self) -> Option<String> {
        self.skip_spaces();
        if !self.input[self.pos..].starts_with('"') {
            return self.atom();
        }

        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((ix, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += ix + 1;
                    return Some(out);
                },
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => return None,
                },
                _ => out.push(c),
            }
        }

        None // Unterminated quote
    }

    /// Everything that remains, trimmed.
    pub fn remainder(&mut self) -> &'a str {
        self.skip_spaces();
        &self.input[self.pos..]
    }
}

/// Quotes a string for output if it is not a plain atom.
pub fn quote_string(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars().all(|c| {
            !c.is_whitespace()
                && !c.is_control()
                && !matches!(
                    c,
                    '(' | ')' | '{' | '"' | '\\' | '%' | '*' | '[' | ']'
                )
        });
    if plain {
        return s.to_owned();
    }

    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Formats a flag set for the wire, `\Recent` first when present.
pub fn format_flags(flags: &FlagSet, recent: bool) -> String {
    let mut parts = Vec::new();
    if recent {
        parts.push("\\Recent".to_owned());
    }
    parts.extend(flags.iter().map(|f| f.system_name().to_owned()));
    format!("({})", parts.join(" "))
}

// ---------------------------------------------------------------------------
// Dates

/// Parses an IMAP date: `dd-Mon-yyyy`.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%d-%b-%Y").ok()
}

/// Formats an INTERNALDATE value, quoted, in UTC.
pub fn format_internal_date(date: &DateTime<Utc>) -> String {
    format!("\"{}\"", date.format("%d-%b-%Y %H:%M:%S +0000"))
}

// ---------------------------------------------------------------------------
// ENVELOPE

/// Builds the ENVELOPE fetch value from a message's parsed header list.
///
/// The envelope is `(date subject from sender reply-to to cc bcc
/// in-reply-to message-id)`; absent members are NIL, and sender/reply-to
/// default to the From addresses per RFC 3501.
pub fn format_envelope(headers: &[(String, String)]) -> String {
    let get = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let nstring = |value: Option<&str>| match value {
        Some(v) => quote_string(v),
        None => "NIL".to_owned(),
    };

    let address_list = |value: Option<&str>| match value {
        Some(v) => format_address_list(v),
        None => "NIL".to_owned(),
    };

    let from = get("From");
    format!(
        "({} {} {} {} {} {} {} {} {} {})",
        nstring(get("Date")),
        nstring(get("Subject")),
        address_list(from),
        address_list(get("Sender").or(from)),
        address_list(get("Reply-To").or(from)),
        address_list(get("To")),
        address_list(get("Cc")),
        address_list(get("Bcc")),
        nstring(get("In-Reply-To")),
        nstring(get("Message-ID")),
    )
}

/// Renders `Name <a@b>, c@d` as an IMAP address list:
/// `((name NIL mailbox host) ...)`.
fn format_address_list(value: &str) -> String {
    let mut rendered = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (name, address) = match (part.find('<'), part.rfind('>')) {
            (Some(open), Some(close)) if close > open => {
                let name = part[..open].trim().trim_matches('"');
                (
                    if name.is_empty() { None } else { Some(name) },
                    &part[open + 1..close],
                )
            },
            _ => (None, part),
        };

        let (mailbox, host) = match address.rsplit_once('@') {
            Some((mailbox, host)) => (mailbox, Some(host)),
            None => (address, None),
        };

        rendered.push(format!(
            "({} NIL {} {})",
            match name {
                Some(name) => quote_string(name),
                None => "NIL".to_owned(),
            },
            quote_string(mailbox),
            match host {
                Some(host) => quote_string(host),
                None => "NIL".to_owned(),
            },
        ));
    }

    if rendered.is_empty() {
        "NIL".to_owned()
    } else {
        format!("({})", rendered.concat())
    }
}
